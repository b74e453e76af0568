//! Who is on the other end of a request or connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a credential grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    /// Contributes work over a worker connection.
    Provider,
    /// Account that may request work through the public API.
    Requester,
    /// Trusted service calling the broker directly.
    Service,
}

/// An authenticated identity, keyed by a stable string (usually an email).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub identity: String,
    pub kind: PrincipalKind,
}

impl Principal {
    pub fn new(identity: impl Into<String>, kind: PrincipalKind) -> Self {
        Self {
            identity: identity.into(),
            kind,
        }
    }

    pub fn is(&self, kind: PrincipalKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.identity, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_lowercase() {
        let p = Principal::new("worker@example.com", PrincipalKind::Provider);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"identity":"worker@example.com","kind":"provider"}"#);
        assert!(p.is(PrincipalKind::Provider));
        assert!(!p.is(PrincipalKind::Service));
    }
}
