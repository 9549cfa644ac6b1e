//! Minimal hex encoding for seeds, hashes and token signatures.

use std::fmt::Write;

pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(text.len() / 2);
    let bytes = text.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = [0x00, 0x7f, 0xff, 0x0a];
        let text = encode(&data);
        assert_eq!(text, "007fff0a");
        assert_eq!(decode(&text).unwrap(), data);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("abc").is_none());
        assert!(decode("zz").is_none());
    }
}
