use std::path::PathBuf;

/// Errors that can occur while reading from or appending to the log
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The identity string is not a valid chat identity
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    /// An input line could not be turned into a message
    #[error("malformed input: {0}")]
    MalformedInput(&'static str),

    /// A stored record does not follow the record format
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The storage medium rejected the write; nothing was appended
    #[error("log unwritable: {source}")]
    LogUnwritable {
        #[source]
        source: std::io::Error,
    },

    /// The backing file could not be opened or replayed
    #[error("failed to open log at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LogError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::MalformedInput(_) => "malformed_input",
            Self::MalformedRecord(_) => "malformed_record",
            Self::LogUnwritable { .. } => "log_unwritable",
            Self::Open { .. } => "log_open_failed",
        }
    }
}
