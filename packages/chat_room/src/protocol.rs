//! Wire format between the entry point and the broker.
//!
//! The client opens with one JSON [`ClientHello`] line and the broker
//! answers with one JSON [`ServerHello`] line. After an acceptance both
//! directions carry plain text lines: the client sends what the participant
//! typed and the broker sends rendered chat lines. Broker notices are
//! prefixed with [`DIAGNOSTIC_PREFIX`].

use std::fmt;

use chat_gate::{ChannelRequest, Credentials, ErrorResponse, GateError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const DIAGNOSTIC_PREFIX: &str = "*** ";

#[derive(Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub identity: String,
    pub secret: String,
    /// Terminal type of the participant, for the server log.
    #[serde(default)]
    pub term: Option<String>,
    /// What the connection asks for. Empty means the chat entry point.
    #[serde(default)]
    pub requests: Vec<ChannelRequest>,
}

impl ClientHello {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            identity: self.identity.clone(),
            secret: self.secret.clone(),
        }
    }
}

impl fmt::Debug for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHello")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .field("term", &self.term)
            .field("requests", &self.requests)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerHello {
    Accepted {
        identity: String,
        session_started_at: DateTime<Local>,
    },
    Rejected {
        error: String,
        message: String,
    },
}

impl ServerHello {
    pub fn rejected(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            error: error.into(),
            message: message.into(),
        }
    }
}

impl From<&GateError> for ServerHello {
    fn from(err: &GateError) -> Self {
        let ErrorResponse { error, message } = ErrorResponse::from(err);
        Self::Rejected { error, message }
    }
}

/// A broker notice, as sent on the wire.
pub fn diagnostic(text: &str) -> String {
    format!("{DIAGNOSTIC_PREFIX}{text}")
}
