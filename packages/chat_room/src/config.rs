use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [chat]
//                    backfill_lines = 50
//
//   env var:         CHATROOM_CHAT__BACKFILL_LINES=50   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub chat: ChatFileConfig,
}

/// Broker listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 = pick a free port and publish it in the state dir
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// How long a leaving connection may take to flush queued lines
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Chat behaviour (lives under `[chat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default = "default_backfill_lines")]
    pub backfill_lines: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ChatFileConfig {
    fn default() -> Self {
        Self {
            backfill_lines: default_backfill_lines(),
            max_line_bytes: default_max_line_bytes(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_drain_timeout_secs() -> u64 {
    5
}
fn default_backfill_lines() -> usize {
    20
}
fn default_max_line_bytes() -> usize {
    1024
}
fn default_send_channel_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → config.toml → CHATROOM_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CHATROOM_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

/// Per-connection behaviour.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Messages replayed to a new joiner
    pub backfill_lines: usize,
    /// Longest accepted input line; longer lines are dropped
    pub max_line_bytes: usize,
    /// Rendered lines buffered per connection before the renderer waits
    pub send_channel_capacity: usize,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl ChatConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            backfill_lines: fc.chat.backfill_lines,
            max_line_bytes: fc.chat.max_line_bytes.max(1),
            send_channel_capacity: fc.chat.send_channel_capacity.max(1),
            handshake_timeout: Duration::from_secs(fc.server.handshake_timeout_secs.max(1)),
            drain_timeout: Duration::from_secs(fc.server.drain_timeout_secs),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

// =============================================================================
// Directory layout (derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChatRoomConfig {
    pub data_dir: PathBuf,
    /// Shared by participants: chat.log + errors.log
    pub chat_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ChatRoomConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let chat_dir = data_dir.join("chat");
        std::fs::create_dir_all(&chat_dir)
            .with_context(|| format!("Failed to create chat directory: {:?}", chat_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        let config = Self {
            data_dir,
            chat_dir,
            logs_dir,
        };
        config.restrict_chat_dir();

        info!("Data directory: {}", config.data_dir.display());
        Ok(config)
    }

    /// Group members may read but not delete each other's files: the
    /// directory is sticky (1770) and its files are 0640. Best effort, since
    /// only the owner of the directory can change it.
    #[cfg(unix)]
    fn restrict_chat_dir(&self) {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        for path in [self.chat_log_path(), self.error_log_path()] {
            if path.exists() {
                continue;
            }
            if let Err(e) = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o640)
                .open(&path)
            {
                warn!("Failed to create {}: {}", path.display(), e);
            }
        }

        if let Err(e) =
            std::fs::set_permissions(&self.chat_dir, std::fs::Permissions::from_mode(0o1770))
        {
            debug!(
                "Leaving permissions of {} unchanged: {}",
                self.chat_dir.display(),
                e
            );
        }
    }

    #[cfg(not(unix))]
    fn restrict_chat_dir(&self) {}

    pub fn chat_log_path(&self) -> PathBuf {
        self.chat_dir.join("chat.log")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.chat_dir.join("errors.log")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn broker_pid_path(&self) -> PathBuf {
        self.state_dir().join("broker.pid")
    }

    pub fn broker_port_path(&self) -> PathBuf {
        self.state_dir().join("broker.port")
    }

    pub fn broker_lock_path(&self) -> PathBuf {
        self.state_dir().join("broker.lock")
    }

    pub fn broker_log_path(&self) -> PathBuf {
        self.logs_dir.join("broker.log")
    }

    pub fn broker_err_path(&self) -> PathBuf {
        self.logs_dir.join("broker.err")
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Could not find home directory")?
        .join(".chatroom"))
}
