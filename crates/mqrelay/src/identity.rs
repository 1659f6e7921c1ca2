//! Per-session identity tokens.
//!
//! An identity scopes a client's private topics. It is never used for
//! authentication: anyone who knows the token can publish on its topics.

use std::fmt;
use std::sync::Arc;

/// Opaque token unique to one client session.
///
/// Allocated identities are UUID v4 rendered as 32 lowercase hex chars.
/// Caller-supplied identities are accepted as long as they form a single
/// topic level (see [`Identity::parse`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity must not be empty")]
    Empty,
    #[error("identity '{0}' contains a topic separator or wildcard")]
    InvalidChar(String),
}

impl Identity {
    /// Allocate a fresh identity. Never fails.
    pub fn allocate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string().into())
    }

    /// Accept a caller-supplied identity.
    ///
    /// Uniqueness among active sessions is the caller's responsibility.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.contains(['/', '+', '#']) {
            return Err(IdentityError::InvalidChar(s.to_string()));
        }
        Ok(Self(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_identities_are_hex_and_distinct() {
        let a = Identity::allocate();
        let b = Identity::allocate();

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(Identity::parse(a.as_str()).is_ok());
    }

    #[test]
    fn parse_accepts_plain_names() {
        let id = Identity::parse("alice").unwrap();
        assert_eq!(id.to_string(), "alice");
    }

    #[test]
    fn parse_rejects_empty_and_topic_syntax() {
        assert_eq!(Identity::parse(""), Err(IdentityError::Empty));
        assert!(matches!(
            Identity::parse("a/b"),
            Err(IdentityError::InvalidChar(_))
        ));
        assert!(Identity::parse("+").is_err());
        assert!(Identity::parse("#").is_err());
    }
}
