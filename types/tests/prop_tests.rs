use proptest::prelude::*;

use bpow_types::{WorkHash, WorkNonce};

proptest! {
    /// WorkHash hex roundtrip: bytes -> hex -> bytes is identity.
    #[test]
    fn work_hash_hex_roundtrip(bytes in prop::array::uniform32(0u8..)) {
        let hash = WorkHash::new(bytes);
        let parsed = WorkHash::from_hex(&hash.to_hex()).unwrap();
        prop_assert_eq!(parsed.as_bytes(), &bytes);
    }

    /// WorkHash::is_zero is true only for all-zero bytes.
    #[test]
    fn work_hash_is_zero_correct(bytes in prop::array::uniform32(0u8..)) {
        let hash = WorkHash::new(bytes);
        prop_assert_eq!(hash.is_zero(), bytes == [0u8; 32]);
    }

    /// Any string that is not exactly 64 chars is rejected without panicking.
    #[test]
    fn work_hash_rejects_wrong_lengths(s in "[0-9a-fA-F]{0,63}") {
        prop_assert!(WorkHash::from_hex(&s).is_err());
    }

    /// Nonce hex is always 16 chars and parses back to the same value.
    #[test]
    fn nonce_hex_roundtrip(value in any::<u64>()) {
        let nonce = WorkNonce(value);
        let hex = nonce.to_hex();
        prop_assert_eq!(hex.len(), 16);
        prop_assert_eq!(WorkNonce::from_hex(&hex).unwrap(), nonce);
    }

    /// Arbitrary input never panics the nonce parser.
    #[test]
    fn nonce_parse_never_panics(s in ".{0,32}") {
        let _ = WorkNonce::from_hex(&s);
    }
}
