//! The participant-readable error file next to the chat log.

use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Appends one timestamped line per failure that a participant ran into.
pub struct DiagnosticLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DiagnosticLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best effort: a failure here is only traced, never surfaced.
    pub async fn record(&self, code: &str, detail: &str) {
        let line = format!(
            "{} {}: {}\n",
            Local::now().format(chat_log::TIMESTAMP_FORMAT),
            code,
            detail.replace('\n', " ")
        );

        let _guard = self.lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(
                "Failed to write diagnostic to {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
