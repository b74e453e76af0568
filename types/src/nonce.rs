//! Work nonce (the "result" a worker returns).

use std::fmt;

use crate::TypesError;

/// A 64-bit work value.
///
/// On the wire the value is 16 hex characters, most significant byte first.
/// The hashing input uses the little-endian byte order, so the hex string is
/// the byte-reversed form of what gets hashed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WorkNonce(pub u64);

impl WorkNonce {
    /// Length of the hex representation.
    pub const HEX_LEN: usize = 16;

    /// Parse a work value from exactly 16 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        if s.len() != Self::HEX_LEN {
            return Err(TypesError::InvalidNonce(format!(
                "expected {} hex chars, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| TypesError::InvalidNonce(e.to_string()))?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Bytes in the order they are fed to the hash function.
    pub fn hash_input_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for WorkNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
