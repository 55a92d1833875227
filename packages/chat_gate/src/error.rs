//! Gate errors and their stable codes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Unknown identity, wrong secret or malformed credentials. The reason
    /// is for the server log only and never reaches the client.
    #[error("unauthorized")]
    Unauthorized { reason: String },

    /// Authenticated, but asked for something other than the chat entry point.
    #[error("capability denied: {request}")]
    CapabilityDenied { request: String },

    /// The credential file could not be loaded.
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),
}

impl GateError {
    pub(crate) fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::CapabilityDenied { .. } => "capability_denied",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// What a rejected client is told.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<&GateError> for ErrorResponse {
    fn from(err: &GateError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
