//! Participant identity abstraction
//!
//! The engine does not own user accounts; the host application does. This
//! module defines the trait the host plugs its participant-id scheme into,
//! plus a plain string implementation for tests and simple integrations.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Trait for participant identity in the calling engine
///
/// Every signaling payload carries the target participant's identity, so the
/// type must be serializable, comparable, and displayable.
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to a string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Stable key for equality checks across payloads
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }
}

/// Simple string-based participant identity
///
/// Suitable for tests or hosts whose user ids are already opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}
