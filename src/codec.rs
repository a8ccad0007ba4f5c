use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Gzip-compresses a bundle payload before it reaches the sink.
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let payload = b"type: scrape\nname: 10.0.0.1:9100/metrics\n".repeat(64);
        let packed = compress(&payload).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn garbage_fails() {
        assert!(decompress(b"not gzip").is_err());
    }
}
