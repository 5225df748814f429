//! Identity newtypes shared across the platform.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a network participant, unique within the membership network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyName(pub String);

impl PartyName {
    /// Creates a party name from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        PartyName(name.into())
    }

    /// Borrows the underlying name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartyName {
    fn from(name: &str) -> Self {
        PartyName(name.to_string())
    }
}

/// Opaque handle naming a signing key held by a signing backend.
///
/// Key identifiers are resolved by the configured backend; the platform
/// never sees private key material for hardware or remote backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    /// Creates a key identifier.
    pub fn new(id: impl Into<String>) -> Self {
        KeyId(id.into())
    }

    /// Borrows the underlying identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        KeyId(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_name_round_trips_through_json() {
        let party = PartyName::new("O=Alice Corp, L=London, C=GB");
        let json = serde_json::to_string(&party).unwrap();
        let back: PartyName = serde_json::from_str(&json).unwrap();
        assert_eq!(party, back);
    }

    #[test]
    fn key_id_displays_raw_value() {
        assert_eq!(KeyId::new("notary-key-1").to_string(), "notary-key-1");
    }
}
