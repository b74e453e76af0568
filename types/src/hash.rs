//! Block hash type that work is computed against.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// A 32-byte block hash, hex-encoded on the wire as 64 characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkHash([u8; 32]);

impl Default for WorkHash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl WorkHash {
    pub const ZERO: Self = Self([0u8; 32]);

    /// Length of the hex representation.
    pub const HEX_LEN: usize = 64;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a hash from exactly 64 hex characters (either case).
    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        if s.len() != Self::HEX_LEN {
            return Err(TypesError::InvalidHash(format!(
                "expected {} hex chars, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| TypesError::InvalidHash(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Upper-case hex, the form used for cache keys and wire messages.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl FromStr for WorkHash {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for WorkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkHash({}\u{2026})", hex::encode_upper(&self.0[..4]))
    }
}

impl fmt::Display for WorkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for WorkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for WorkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "3F93C5CD2E314FA16702189041E68E68C07B27961BF37F0B7705145BEFBA3AA3";

    #[test]
    fn parses_upper_and_lower_case() {
        let upper = WorkHash::from_hex(HASH).unwrap();
        let lower = WorkHash::from_hex(&HASH.to_lowercase()).unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_hex(), HASH);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            WorkHash::from_hex("abcd"),
            Err(TypesError::InvalidHash(_))
        ));
        assert!(WorkHash::from_hex(&format!("{HASH}00")).is_err());
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "Z".repeat(64);
        assert!(matches!(
            WorkHash::from_hex(&bad),
            Err(TypesError::InvalidHash(_))
        ));
    }

    #[test]
    fn serde_uses_hex_string() {
        let hash = WorkHash::from_hex(HASH).unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{HASH}\""));
        let back: WorkHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn zero_hash() {
        assert!(WorkHash::ZERO.is_zero());
        assert_eq!(WorkHash::default(), WorkHash::ZERO);
        assert_eq!(WorkHash::from_hex(&"0".repeat(64)).unwrap(), WorkHash::ZERO);
    }
}
