//! Memory quantity parsing (`512Mi`, `2G`, `1073741824`).

use crate::error::{Error, Result};

const SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Parse a memory quantity into bytes. Fractions and exponents are rejected.
pub fn parse_bytes(raw: &str) -> Result<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::validation("empty memory quantity"));
    }
    let (digits, mult) = SUFFIXES
        .iter()
        .find_map(|(suf, m)| s.strip_suffix(suf).map(|d| (d, *m)))
        .unwrap_or((s, 1));
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::validation(format!("malformed memory quantity {:?}", raw)));
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::validation(format!("malformed memory quantity {:?}", raw)))?;
    n.checked_mul(mult)
        .ok_or_else(|| Error::validation(format!("memory quantity {:?} overflows", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimal_and_binary() {
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_bytes("3G").unwrap(), 3_000_000_000);
        assert_eq!(parse_bytes(" 5k ").unwrap(), 5_000);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "Gi", "1.5Gi", "12XB", "-3Mi", "1e9"] {
            let e = parse_bytes(bad).unwrap_err();
            assert!(matches!(e, Error::Validation(_)), "{bad}: {e}");
        }
        assert!(parse_bytes("99999999999999999Ti").is_err());
    }
}
