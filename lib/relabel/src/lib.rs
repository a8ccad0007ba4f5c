//! Rule-driven label rewriting for discovered scrape targets.
//!
//! A rule chain is applied to a target's label set before the target is
//! accepted; `process` returning `None` means the target was intentionally
//! dropped by a `keep`/`drop` rule.

mod serde_regex;

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use serde_regex::anchored;

pub type Labels = BTreeMap<String, String>;

const fn default_separator() -> char {
    ';'
}

fn default_regex() -> Regex {
    // the pattern is a literal, it always compiles
    anchored("(.*)").expect("valid default pattern")
}

fn default_replacement() -> String {
    "$1".to_owned()
}

fn is_default_separator(c: &char) -> bool {
    *c == default_separator()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Config {
    /// Matches the concatenated source labels against `regex` and writes the
    /// expanded replacement into `target_label`. No match leaves the label
    /// set untouched; an empty expansion removes the target label.
    Replace {
        #[serde(default)]
        source_labels: Vec<String>,
        #[serde(default = "default_separator", skip_serializing_if = "is_default_separator")]
        separator: char,
        #[serde(with = "serde_regex", default = "default_regex")]
        regex: Regex,
        target_label: String,
        #[serde(default = "default_replacement")]
        replacement: String,
    },
    /// Drops the target unless the concatenated source labels match.
    Keep {
        #[serde(default)]
        source_labels: Vec<String>,
        #[serde(default = "default_separator", skip_serializing_if = "is_default_separator")]
        separator: char,
        #[serde(with = "serde_regex")]
        regex: Regex,
    },
    /// Drops the target when the concatenated source labels match.
    Drop {
        #[serde(default)]
        source_labels: Vec<String>,
        #[serde(default = "default_separator", skip_serializing_if = "is_default_separator")]
        separator: char,
        #[serde(with = "serde_regex")]
        regex: Regex,
    },
    /// Hashes the concatenated source labels modulo `modulus` into
    /// `target_label`.
    HashMod {
        #[serde(default)]
        source_labels: Vec<String>,
        #[serde(default = "default_separator", skip_serializing_if = "is_default_separator")]
        separator: char,
        target_label: String,
        modulus: u64,
    },
    /// Copies every label whose name matches `regex` to a new name built
    /// from the replacement expansion.
    LabelMap {
        #[serde(with = "serde_regex")]
        regex: Regex,
        #[serde(default = "default_replacement")]
        replacement: String,
    },
    /// Removes labels whose names match.
    LabelDrop {
        #[serde(with = "serde_regex")]
        regex: Regex,
    },
    /// Removes labels whose names do not match.
    LabelKeep {
        #[serde(with = "serde_regex")]
        regex: Regex,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("hashmod rule requires a non-zero modulus")]
    ZeroModulus,
    #[error("{0} rule requires a non-empty target_label")]
    EmptyTargetLabel(&'static str),
}

/// Checks structural constraints the serde layer cannot express.
pub fn validate(configs: &[Config]) -> Result<(), Error> {
    for config in configs {
        match config {
            Config::Replace { target_label, .. } if target_label.is_empty() => {
                return Err(Error::EmptyTargetLabel("replace"));
            }
            Config::HashMod {
                target_label,
                modulus,
                ..
            } => {
                if target_label.is_empty() {
                    return Err(Error::EmptyTargetLabel("hashmod"));
                }
                if *modulus == 0 {
                    return Err(Error::ZeroModulus);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn concat(labels: &Labels, source_labels: &[String], separator: char) -> String {
    let mut buf = String::new();
    for (index, name) in source_labels.iter().enumerate() {
        if index > 0 {
            buf.push(separator);
        }
        if let Some(value) = labels.get(name) {
            buf.push_str(value);
        }
    }
    buf
}

fn hashmod(value: &str, modulus: u64) -> u64 {
    let digest = Md5::digest(value.as_bytes());
    // lower 8 bytes, big endian
    let mut lower = [0u8; 8];
    lower.copy_from_slice(&digest[8..]);
    u64::from_be_bytes(lower) % modulus
}

impl Config {
    /// Applies one rule. `None` means the target is dropped.
    fn apply(&self, mut labels: Labels) -> Option<Labels> {
        match self {
            Config::Replace {
                source_labels,
                separator,
                regex,
                target_label,
                replacement,
            } => {
                let value = concat(&labels, source_labels, *separator);
                if let Some(captures) = regex.captures(&value) {
                    let mut expanded = String::new();
                    captures.expand(replacement, &mut expanded);
                    if expanded.is_empty() {
                        labels.remove(target_label);
                    } else {
                        labels.insert(target_label.clone(), expanded);
                    }
                }
                Some(labels)
            }
            Config::Keep {
                source_labels,
                separator,
                regex,
            } => {
                let value = concat(&labels, source_labels, *separator);
                regex.is_match(&value).then_some(labels)
            }
            Config::Drop {
                source_labels,
                separator,
                regex,
            } => {
                let value = concat(&labels, source_labels, *separator);
                (!regex.is_match(&value)).then_some(labels)
            }
            Config::HashMod {
                source_labels,
                separator,
                target_label,
                modulus,
            } => {
                let value = concat(&labels, source_labels, *separator);
                labels.insert(target_label.clone(), hashmod(&value, *modulus).to_string());
                Some(labels)
            }
            Config::LabelMap { regex, replacement } => {
                let mapped = labels
                    .iter()
                    .filter_map(|(name, value)| {
                        regex.captures(name).map(|captures| {
                            let mut expanded = String::new();
                            captures.expand(replacement, &mut expanded);
                            (expanded, value.clone())
                        })
                    })
                    .collect::<Vec<_>>();
                for (name, value) in mapped {
                    if !name.is_empty() {
                        labels.insert(name, value);
                    }
                }
                Some(labels)
            }
            Config::LabelDrop { regex } => {
                labels.retain(|name, _value| !regex.is_match(name));
                Some(labels)
            }
            Config::LabelKeep { regex } => {
                labels.retain(|name, _value| regex.is_match(name));
                Some(labels)
            }
        }
    }
}

/// Runs the whole rule chain over a label set.
pub fn process(labels: Labels, configs: &[Config]) -> Option<Labels> {
    let mut labels = labels;
    for config in configs {
        labels = config.apply(labels)?;
    }
    Some(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn assert_process(input: Labels, config: Config, want: Option<Labels>) {
        assert_eq!(process(input, &[config]), want);
    }

    #[test]
    fn replace() {
        let config = Config::Replace {
            source_labels: vec!["__address__".into()],
            separator: ';',
            regex: anchored("(.+):\\d+").unwrap(),
            target_label: "host".into(),
            replacement: "$1".into(),
        };

        assert_process(
            labels(&[("__address__", "10.0.0.1:9100")]),
            config,
            Some(labels(&[("__address__", "10.0.0.1:9100"), ("host", "10.0.0.1")])),
        );
    }

    #[test]
    fn replace_no_match_keeps_labels() {
        let config = Config::Replace {
            source_labels: vec!["job".into()],
            separator: ';',
            regex: anchored("nope").unwrap(),
            target_label: "job".into(),
            replacement: "other".into(),
        };

        assert_process(
            labels(&[("job", "node")]),
            config,
            Some(labels(&[("job", "node")])),
        );
    }

    #[test]
    fn replace_empty_expansion_removes_target() {
        let config = Config::Replace {
            source_labels: vec!["drop_me".into()],
            separator: ';',
            regex: default_regex(),
            target_label: "drop_me".into(),
            replacement: "".into(),
        };

        assert_process(labels(&[("drop_me", "x")]), config, Some(labels(&[])));
    }

    #[test]
    fn keep() {
        let config = Config::Keep {
            source_labels: vec!["job".into(), "env".into()],
            separator: ';',
            regex: anchored("api;prod").unwrap(),
        };

        assert_process(
            labels(&[("job", "api"), ("env", "prod")]),
            config.clone(),
            Some(labels(&[("job", "api"), ("env", "prod")])),
        );
        assert_process(labels(&[("job", "api"), ("env", "dev")]), config, None);
    }

    #[test]
    fn drop() {
        let config = Config::Drop {
            source_labels: vec!["__meta_phase".into()],
            separator: ';',
            regex: anchored("Succeeded|Failed").unwrap(),
        };

        assert_process(labels(&[("__meta_phase", "Failed")]), config.clone(), None);
        assert_process(
            labels(&[("__meta_phase", "Running")]),
            config,
            Some(labels(&[("__meta_phase", "Running")])),
        );
    }

    #[test]
    fn anchoring_is_full_match() {
        let config = Config::Keep {
            source_labels: vec!["job".into()],
            separator: ';',
            regex: anchored("api").unwrap(),
        };

        // a substring match must not keep the target
        assert_process(labels(&[("job", "api-gateway")]), config, None);
    }

    #[test]
    fn hashmod() {
        let config = Config::HashMod {
            source_labels: vec!["c".into()],
            separator: ';',
            target_label: "c".into(),
            modulus: 1000,
        };

        assert_process(
            labels(&[("c", "baz")]),
            config,
            Some(labels(&[("c", "976")])),
        );
    }

    #[test]
    fn labelmap() {
        let config = Config::LabelMap {
            regex: anchored("__meta_(.+)").unwrap(),
            replacement: "$1".into(),
        };

        assert_process(
            labels(&[("__meta_zone", "a"), ("job", "api")]),
            config,
            Some(labels(&[("__meta_zone", "a"), ("zone", "a"), ("job", "api")])),
        );
    }

    #[test]
    fn labeldrop_and_labelkeep() {
        assert_process(
            labels(&[("a", "1"), ("b1", "2"), ("b2", "3")]),
            Config::LabelDrop {
                regex: anchored("b.*").unwrap(),
            },
            Some(labels(&[("a", "1")])),
        );

        assert_process(
            labels(&[("a", "1"), ("b1", "2")]),
            Config::LabelKeep {
                regex: anchored("a").unwrap(),
            },
            Some(labels(&[("a", "1")])),
        );
    }

    #[test]
    fn missing_source_labels_concat_empty() {
        let config = Config::Keep {
            source_labels: vec!["absent".into(), "also_absent".into()],
            separator: ';',
            regex: anchored(";").unwrap(),
        };

        assert_process(labels(&[]), config, Some(labels(&[])));
    }

    #[test]
    fn validate_rejects_bad_rules() {
        assert_eq!(
            validate(&[Config::HashMod {
                source_labels: vec![],
                separator: ';',
                target_label: "t".into(),
                modulus: 0,
            }]),
            Err(Error::ZeroModulus)
        );

        assert_eq!(
            validate(&[Config::Replace {
                source_labels: vec![],
                separator: ';',
                regex: default_regex(),
                target_label: "".into(),
                replacement: "$1".into(),
            }]),
            Err(Error::EmptyTargetLabel("replace"))
        );
    }

    #[test]
    fn deserialize_chain() {
        let chain: Vec<Config> = serde_yaml::from_str(
            r#"
- action: keep
  source_labels: [__meta_scrape]
  regex: "true"
- action: replace
  source_labels: [__meta_port]
  regex: "(\\d+)"
  target_label: port
"#,
        )
        .unwrap();

        assert_eq!(chain.len(), 2);
        let out = process(
            labels(&[("__meta_scrape", "true"), ("__meta_port", "9100")]),
            &chain,
        )
        .unwrap();
        assert_eq!(out.get("port").map(String::as_str), Some("9100"));
    }
}
