//! Length-prefixed UTF-16 names and their ordering.

use pfx_types::{read_be_u16, ParseError};
use std::cmp::Ordering;

/// Maximum name length in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 255;

/// A catalog or attribute name: up to 255 big-endian UTF-16 code units,
/// length-prefixed on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CatName {
    units: Vec<u16>,
}

impl CatName {
    /// The empty name, used by thread-record keys.
    #[must_use]
    pub fn empty() -> Self {
        Self { units: Vec::new() }
    }

    /// Encode a Rust string. Fails if it exceeds 255 UTF-16 units.
    pub fn from_str(s: &str) -> Result<Self, ParseError> {
        let units: Vec<u16> = s.encode_utf16().collect();
        if units.len() > MAX_NAME_UNITS {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "longer than 255 UTF-16 units",
            });
        }
        Ok(Self { units })
    }

    /// Parse a name at `offset`; returns the name and the bytes consumed.
    pub fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let len = usize::from(read_be_u16(buf, offset)?);
        if len > MAX_NAME_UNITS {
            return Err(ParseError::InvalidField {
                field: "name_length",
                reason: "longer than 255 UTF-16 units",
            });
        }
        let mut units = Vec::with_capacity(len);
        for i in 0..len {
            units.push(read_be_u16(buf, offset + 2 + 2 * i)?);
        }
        Ok((Self { units }, 2 + 2 * len))
    }

    /// Append the encoded form (u16 length + units) to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.units.len() as u16).to_be_bytes());
        for unit in &self.units {
            out.extend_from_slice(&unit.to_be_bytes());
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + 2 * self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn len_units(&self) -> usize {
        self.units.len()
    }

    /// Lossy conversion for display and reporting.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.units)
    }

    /// Whether the name contains a character the catalog forbids
    /// (NUL or the path separator `:`).
    #[must_use]
    pub fn has_illegal_chars(&self) -> bool {
        self.units.iter().any(|&u| u == 0 || u == u16::from(b':'))
    }

    /// Ordering used by catalog keys. Case-insensitive volumes fold ASCII
    /// letters before comparing; above ASCII the comparison is by code unit,
    /// which keeps the order total and consistent.
    #[must_use]
    pub fn fold_cmp(&self, other: &Self, case_sensitive: bool) -> Ordering {
        let fold = |u: u16| -> u16 {
            if !case_sensitive && (0x41..=0x5A).contains(&u) {
                u + 0x20
            } else {
                u
            }
        };
        for (a, b) in self.units.iter().zip(other.units.iter()) {
            match fold(*a).cmp(&fold(*b)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.units.len().cmp(&other.units.len())
    }

    /// Name equality under the volume's fold rules.
    #[must_use]
    pub fn eq_fold(&self, other: &Self, case_sensitive: bool) -> bool {
        self.fold_cmp(other, case_sensitive) == Ordering::Equal
    }
}

impl std::fmt::Display for CatName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let name = CatName::from_str("Projects").unwrap();
        let mut buf = Vec::new();
        name.write_to(&mut buf);
        assert_eq!(buf.len(), name.encoded_len());

        let (parsed, consumed) = CatName::parse(&buf, 0).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, name);
        assert_eq!(parsed.to_string_lossy(), "Projects");
    }

    #[test]
    fn too_long_rejected() {
        let long: String = "x".repeat(256);
        assert!(CatName::from_str(&long).is_err());
        assert!(CatName::from_str(&"y".repeat(255)).is_ok());
    }

    #[test]
    fn folded_ordering_ignores_ascii_case() {
        let a = CatName::from_str("Makefile").unwrap();
        let b = CatName::from_str("makefile").unwrap();
        assert_eq!(a.fold_cmp(&b, false), Ordering::Equal);
        assert_eq!(a.fold_cmp(&b, true), Ordering::Less);
    }

    #[test]
    fn prefix_sorts_before_longer_name() {
        let a = CatName::from_str("abc").unwrap();
        let b = CatName::from_str("abcd").unwrap();
        assert_eq!(a.fold_cmp(&b, false), Ordering::Less);
        assert_eq!(b.fold_cmp(&a, false), Ordering::Greater);
    }

    #[test]
    fn illegal_chars_detected() {
        assert!(CatName::from_str("a:b").unwrap().has_illegal_chars());
        assert!(!CatName::from_str("plain").unwrap().has_illegal_chars());
    }

    #[test]
    fn truncated_name_is_insufficient_data() {
        let mut buf = Vec::new();
        CatName::from_str("abcdef").unwrap().write_to(&mut buf);
        buf.truncate(6);
        assert!(matches!(
            CatName::parse(&buf, 0),
            Err(ParseError::InsufficientData { .. })
        ));
    }
}
