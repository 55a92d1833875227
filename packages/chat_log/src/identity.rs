//! Participant identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::LogError;

/// Longest identity accepted.
pub const MAX_IDENTITY_LEN: usize = 32;

/// A stable participant name such as `chat01`.
///
/// Only `[A-Za-z0-9._-]` is allowed, so an identity can never contain the
/// `]` or whitespace that delimit it inside a stored record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn parse(s: &str) -> Result<Self, LogError> {
        let valid = !s.is_empty()
            && s.len() <= MAX_IDENTITY_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(LogError::InvalidIdentity(s.to_string()))
        }
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

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identity {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Identity::parse(&raw).map_err(serde::de::Error::custom)
    }
}
