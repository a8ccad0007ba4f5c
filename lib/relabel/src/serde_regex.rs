use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

/// Patterns are anchored at both ends, matching the usual scrape-config
/// relabel semantics where `regex: foo` means the whole value is `foo`.
pub fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern = String::deserialize(deserializer)?;
    anchored(&pattern).map_err(Error::custom)
}

pub fn serialize<S>(regex: &Regex, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(regex.as_str())
}
