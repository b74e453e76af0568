//! Fundamental types for BoomPoW.
//!
//! This crate defines the types shared by the broker and the worker client:
//! block hashes, work nonces, authenticated identities, and the JSON messages
//! exchanged over a worker connection.

pub mod error;
pub mod hash;
pub mod identity;
pub mod message;
pub mod nonce;

pub use error::TypesError;
pub use hash::WorkHash;
pub use identity::{Principal, PrincipalKind};
pub use message::{AwardNotice, ServerMessage, WorkItem, WorkResponse};
pub use nonce::WorkNonce;
