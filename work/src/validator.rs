//! PoW validation.

use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};

use bpow_types::{WorkHash, WorkNonce};

use crate::{WorkError, WorkThresholds};

type Blake2b64 = Blake2b<U8>;

/// Work value of `nonce` against `hash`: BLAKE2b-64 over
/// `nonce (little-endian) || hash`, read back as a little-endian u64.
pub fn work_value(hash: &WorkHash, nonce: WorkNonce) -> u64 {
    let mut hasher = Blake2b64::new();
    hasher.update(nonce.hash_input_bytes());
    hasher.update(hash.as_bytes());
    let mut digest = [0u8; 8];
    digest.copy_from_slice(&hasher.finalize());
    u64::from_le_bytes(digest)
}

/// Check `nonce` against an explicit threshold.
pub fn validate_work(hash: &WorkHash, nonce: WorkNonce, threshold: u64) -> Result<(), WorkError> {
    let actual = work_value(hash, nonce);
    if actual >= threshold {
        Ok(())
    } else {
        Err(WorkError::InsufficientDifficulty { actual, threshold })
    }
}

/// Validate untrusted hex input at `multiplier` over the base difficulty.
///
/// Malformed input (wrong length, non-hex) is simply invalid.
pub fn is_work_valid(hash_hex: &str, multiplier: u32, work_hex: &str) -> bool {
    let Ok(hash) = WorkHash::from_hex(hash_hex) else {
        return false;
    };
    let Ok(nonce) = WorkNonce::from_hex(work_hex) else {
        return false;
    };
    let threshold = WorkThresholds::new().threshold_for(multiplier);
    validate_work(&hash, nonce, threshold).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "3F93C5CD2E314FA16702189041E68E68C07B27961BF37F0B7705145BEFBA3AA3";
    const WORK: &str = "205452237a9b01f4";

    #[test]
    fn known_vector_value() {
        let hash = WorkHash::from_hex(HASH).unwrap();
        let nonce = WorkNonce::from_hex(WORK).unwrap();
        assert_eq!(work_value(&hash, nonce), 0xffffffff287741bf);
    }

    #[test]
    fn known_vector_valid_up_to_max_multiplier() {
        assert!(is_work_valid(HASH, 1, WORK));
        assert!(is_work_valid(HASH, 64, WORK));
        assert!(is_work_valid(HASH, 128, WORK));
    }

    #[test]
    fn known_vector_invalid_at_high_multiplier() {
        assert!(!is_work_valid(HASH, 800, WORK));
    }

    #[test]
    fn lowercase_hash_accepted() {
        assert!(is_work_valid(&HASH.to_lowercase(), 1, WORK));
    }

    #[test]
    fn wrong_hash_is_invalid() {
        let other = "F1C59E6C738BB82221E082910740BADC58301F8F32291E07CCC4CDBEEAD44348";
        assert!(!is_work_valid(other, 1, WORK));
    }

    #[test]
    fn zero_hash_vector() {
        let zero = "0".repeat(64);
        let hash = WorkHash::ZERO;
        let nonce = WorkNonce::from_hex("000000000048f5b9").unwrap();
        assert_eq!(work_value(&hash, nonce), 0xffffffbc8f64e3ef);
        assert!(is_work_valid(&zero, 1, "000000000048f5b9"));
        assert!(!is_work_valid(&zero, 8, "000000000048f5b9"));
        assert!(!is_work_valid(&zero, 1, "0000000000000000"));
        assert!(!is_work_valid(&zero, 1, "deadbeefdeadbeef"));
    }

    #[test]
    fn malformed_input_is_invalid() {
        assert!(!is_work_valid(HASH, 1, "205452237a9b01f"));
        assert!(!is_work_valid(HASH, 1, "205452237a9b01f4ff"));
        assert!(!is_work_valid(HASH, 1, "zz5452237a9b01f4"));
        assert!(!is_work_valid("abc", 1, WORK));
        assert!(!is_work_valid(HASH, 1, ""));
    }

    #[test]
    fn validate_reports_values() {
        let hash = WorkHash::from_hex(HASH).unwrap();
        let nonce = WorkNonce::from_hex(WORK).unwrap();
        assert_eq!(
            validate_work(&hash, nonce, u64::MAX),
            Err(WorkError::InsufficientDifficulty {
                actual: 0xffffffff287741bf,
                threshold: u64::MAX,
            })
        );
        assert!(validate_work(&hash, nonce, 0).is_ok());
    }
}
