//! The one shared chat session and the views connections attach to it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chat_gate::{ChannelRequest, GateError, RestrictedCapabilities};
use chat_log::{BroadcastLog, Identity, LogError, Position, Tail, sanitize_line};
use chrono::{DateTime, Local};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session could not be created; a later attempt may succeed.
    #[error("chat session unavailable: {0}")]
    Unavailable(String),

    /// The session has been shut down and accepts no new connections.
    #[error("chat session closed")]
    Closed,

    /// The connection's capability token does not cover the chat.
    #[error(transparent)]
    Denied(#[from] GateError),
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) | Self::Closed => "session_unavailable",
            Self::Denied(_) => "capability_denied",
        }
    }
}

/// What a session needs to come up.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub log_path: PathBuf,
    pub backfill_lines: usize,
    pub max_line_bytes: usize,
}

/// Creates the chat session on first demand and hands the same one to every
/// later caller.
pub struct SessionBroker {
    settings: SessionSettings,
    session: OnceCell<Arc<Session>>,
    creation_attempts: AtomicUsize,
}

impl SessionBroker {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            session: OnceCell::new(),
            creation_attempts: AtomicUsize::new(0),
        }
    }

    /// Return the live session, creating it if none exists yet.
    ///
    /// Concurrent callers wait on a single creation. If creation fails every
    /// waiter sees the failure and the next call tries again.
    pub async fn ensure_session(&self) -> Result<Arc<Session>, SessionError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                let attempt = self.creation_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Creating chat session (attempt {})", attempt);

                let log = BroadcastLog::open(&self.settings.log_path)
                    .await
                    .map_err(|e| {
                        error!("Failed to create chat session: {}", e);
                        SessionError::Unavailable(e.to_string())
                    })?;

                let session = Session::new(log, &self.settings);
                info!(
                    "Chat session started with {} messages in {}",
                    session.log.len(),
                    self.settings.log_path.display()
                );
                Ok::<_, SessionError>(Arc::new(session))
            })
            .await?;

        if session.is_live() {
            Ok(Arc::clone(session))
        } else {
            Err(SessionError::Closed)
        }
    }

    /// The session, if one has been created.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.session.get().cloned()
    }

    /// Use `log` for the session instead of opening one.
    #[cfg(test)]
    pub fn install_log(&self, log: BroadcastLog) -> Arc<Session> {
        let session = Arc::new(Session::new(log, &self.settings));
        match self.session.set(Arc::clone(&session)) {
            Ok(()) => session,
            Err(_) => panic!("chat session already exists"),
        }
    }

    /// How many times session creation has run, successful or not.
    pub fn creation_attempts(&self) -> usize {
        self.creation_attempts.load(Ordering::SeqCst)
    }
}

/// Renders the shared log for one connection.
#[derive(Debug, Clone, Copy)]
pub struct DisplayView {
    backfill_lines: usize,
}

impl DisplayView {
    /// A tail that starts with the most recent backfill.
    pub fn open(&self, log: &BroadcastLog) -> Tail {
        log.tail_recent(self.backfill_lines)
    }
}

/// Turns one connection's raw input into appends.
#[derive(Debug, Clone, Copy)]
pub struct InputView {
    max_line_bytes: usize,
}

impl InputView {
    pub async fn submit(
        &self,
        log: &BroadcastLog,
        identity: &Identity,
        raw: &str,
    ) -> Result<Position, LogError> {
        let text = sanitize_line(raw, self.max_line_bytes)?;
        log.append(identity, &text).await
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub identity: Identity,
    pub attached_at: DateTime<Local>,
}

/// The chat room: one log, two views, any number of connections.
///
/// A session outlives its connections. Nothing here ends it when the last
/// participant leaves.
pub struct Session {
    created_at: DateTime<Local>,
    log: BroadcastLog,
    display: DisplayView,
    input: InputView,
    connections: Mutex<HashMap<Uuid, ConnectionInfo>>,
    live: AtomicBool,
}

impl Session {
    fn new(log: BroadcastLog, settings: &SessionSettings) -> Self {
        Self {
            created_at: Local::now(),
            log,
            display: DisplayView {
                backfill_lines: settings.backfill_lines,
            },
            input: InputView {
                max_line_bytes: settings.max_line_bytes,
            },
            connections: Mutex::new(HashMap::new()),
            live: AtomicBool::new(true),
        }
    }

    /// Register a connection and open its display. The token must still
    /// permit the entry point.
    pub fn attach(
        self: &Arc<Self>,
        identity: Identity,
        capabilities: RestrictedCapabilities,
    ) -> Result<AttachedView, SessionError> {
        if !self.is_live() {
            return Err(SessionError::Closed);
        }
        capabilities.require(&ChannelRequest::EntryPoint)?;

        let id = Uuid::new_v4();
        let tail = self.display.open(&self.log);
        let count = {
            let mut connections = self.lock_connections();
            connections.insert(
                id,
                ConnectionInfo {
                    id,
                    identity: identity.clone(),
                    attached_at: Local::now(),
                },
            );
            connections.len()
        };
        info!("{} attached ({} connected)", identity, count);

        Ok(AttachedView {
            id,
            identity,
            capabilities,
            session: Arc::clone(self),
            tail: Some(tail),
        })
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn detach(&self, id: Uuid) -> bool {
        let (removed, count) = {
            let mut connections = self.lock_connections();
            let removed = connections.remove(&id);
            (removed, connections.len())
        };
        match removed {
            Some(info) => {
                info!("{} detached ({} connected)", info.identity, count);
                true
            }
            None => false,
        }
    }

    /// Sanitize one raw input line and append it under `identity`.
    pub async fn post(&self, identity: &Identity, raw: &str) -> Result<Position, LogError> {
        self.input.submit(&self.log, identity, raw).await
    }

    /// Identities currently attached, one entry per connection.
    pub fn attached(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.lock_connections().values().cloned().collect();
        infos.sort_by_key(|info| (info.attached_at, info.id));
        infos
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop accepting attachments. Existing views keep working until dropped.
    pub fn close(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            info!("Chat session closed");
        }
    }

    pub fn log(&self) -> &BroadcastLog {
        &self.log
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ConnectionInfo>> {
        // A panic while holding this lock leaves the map itself consistent.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One connection's hold on the session. Dropping it detaches.
pub struct AttachedView {
    id: Uuid,
    identity: Identity,
    capabilities: RestrictedCapabilities,
    session: Arc<Session>,
    tail: Option<Tail>,
}

impl AttachedView {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capabilities(&self) -> RestrictedCapabilities {
        self.capabilities
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The display tail. Yields `None` after the first call.
    pub fn take_tail(&mut self) -> Option<Tail> {
        self.tail.take()
    }

    pub async fn post(&self, raw: &str) -> Result<Position, LogError> {
        self.session.post(&self.identity, raw).await
    }
}

impl Drop for AttachedView {
    fn drop(&mut self) {
        self.session.detach(self.id);
    }
}
