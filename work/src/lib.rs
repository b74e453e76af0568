//! Proof-of-work for BoomPoW.
//!
//! A work value is a 64-bit nonce that, hashed together with a block hash,
//! yields a BLAKE2b-64 digest at or above a difficulty threshold. The
//! threshold is derived from an integer multiplier over the base difficulty.
//!
//! [`is_work_valid`] is the only gate between untrusted worker output and a
//! result being cached, credited or returned to a requester.

pub mod error;
pub mod generator;
pub mod thresholds;
pub mod validator;

pub use error::WorkError;
pub use generator::WorkGenerator;
pub use thresholds::{clamp_multiplier, WorkThresholds, BASE_THRESHOLD, MAX_MULTIPLIER};
pub use validator::{is_work_valid, validate_work, work_value};
