use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::Stream;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::error::LogError;
use crate::identity::Identity;
use crate::message::Message;

/// Index of a message in append order, starting at 0
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Position(pub u64);

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Entries = Arc<RwLock<Vec<Arc<Message>>>>;

/// Owns the append handle; only reachable through the writer mutex
struct LogWriter {
    file: File,
    /// Byte length of the file after the last committed record
    len: u64,
}

impl LogWriter {
    async fn write_record(&mut self, record: &[u8]) -> Result<(), LogError> {
        let result = async {
            self.file.write_all(record).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;

        match result {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(source) => {
                // Never leave half a record behind
                if let Err(e) = self.file.set_len(self.len).await {
                    warn!("Failed to roll back partial record: {}", e);
                }
                Err(LogError::LogUnwritable { source })
            }
        }
    }
}

/// Append-only, file-backed message log shared by every connection.
///
/// Appends are serialized through a single writer lock, so the order in
/// which records reach the file is the order every [`Tail`] observes.
pub struct BroadcastLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    entries: Entries,
    committed: watch::Sender<u64>,
}

impl BroadcastLog {
    /// Open (or create) the log at `path`, replaying existing records.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| LogError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
        }

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(open_err(e)),
        };
        let (entries, valid_len) = replay(&path, &contents);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_err)?;

        if valid_len < contents.len() as u64 {
            warn!(
                "Dropping torn record at end of {} ({} bytes)",
                path.display(),
                contents.len() as u64 - valid_len
            );
            file.set_len(valid_len).await.map_err(open_err)?;
        }

        info!(
            "Opened chat log {} with {} messages",
            path.display(),
            entries.len()
        );

        Ok(Self::from_file(path, file, valid_len, entries))
    }

    /// An empty log on `/dev/full`: every append fails with `LogUnwritable`.
    #[cfg(all(target_os = "linux", any(test, feature = "test-util")))]
    pub async fn unwritable() -> Result<Self, LogError> {
        let path = PathBuf::from("/dev/full");
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self::from_file(path, file, 0, Vec::new()))
    }

    fn from_file(path: PathBuf, file: File, len: u64, entries: Vec<Arc<Message>>) -> Self {
        let (committed, _) = watch::channel(entries.len() as u64);
        Self {
            path,
            writer: Mutex::new(LogWriter { file, len }),
            entries: Arc::new(RwLock::new(entries)),
            committed,
        }
    }

    /// Stamp and append one line of text.
    pub async fn append(&self, identity: &Identity, text: &str) -> Result<Position, LogError> {
        self.append_message(Message::new(identity.clone(), text)?)
            .await
    }

    /// Append a prepared message. Returns once the record is on disk.
    pub async fn append_message(&self, message: Message) -> Result<Position, LogError> {
        let record = message.to_record();

        let mut writer = self.writer.lock().await;
        writer.write_record(record.as_bytes()).await?;

        let position = {
            let mut entries = self.entries.write().await;
            entries.push(Arc::new(message));
            entries.len() as u64 - 1
        };
        self.committed.send_replace(position + 1);
        drop(writer);

        debug!("Appended message {}", Position(position));
        Ok(Position(position))
    }

    /// Follow the log starting at `position`.
    pub fn tail_from(&self, position: Position) -> Tail {
        Tail {
            next: position.0,
            entries: self.entries.clone(),
            committed: self.committed.subscribe(),
        }
    }

    /// Follow the log starting with the last `backfill` messages.
    pub fn tail_recent(&self, backfill: usize) -> Tail {
        let start = (self.len() as u64).saturating_sub(backfill as u64);
        self.tail_from(Position(start))
    }

    /// Position the next append will receive.
    pub fn head(&self) -> Position {
        Position(*self.committed.borrow())
    }

    pub fn len(&self) -> usize {
        *self.committed.borrow() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last `n` messages, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<Arc<Message>> {
        let entries = self.entries.read().await;
        let start = entries.len().saturating_sub(n);
        entries[start..].to_vec()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse stored records, skipping unreadable lines. Also returns the byte
/// length up to the last complete (newline-terminated) record.
fn replay(path: &Path, contents: &[u8]) -> (Vec<Arc<Message>>, u64) {
    let valid_len = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i as u64 + 1)
        .unwrap_or(0);

    let text = String::from_utf8_lossy(&contents[..valid_len as usize]);
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        match Message::parse_record(line) {
            Ok(message) => entries.push(Arc::new(message)),
            Err(e) => warn!("{}:{}: skipping record: {}", path.display(), lineno + 1, e),
        }
    }
    (entries, valid_len)
}

/// A cursor over the log that waits for new messages instead of ending.
pub struct Tail {
    next: u64,
    entries: Entries,
    committed: watch::Receiver<u64>,
}

impl Tail {
    /// Next message in append order. Suspends while caught up; returns
    /// `None` only after the log itself is gone and fully drained.
    pub async fn next(&mut self) -> Option<Arc<Message>> {
        loop {
            if self.next < *self.committed.borrow_and_update() {
                let message = self.entries.read().await.get(self.next as usize).cloned();
                if let Some(message) = message {
                    self.next += 1;
                    return Some(message);
                }
            }

            if self.committed.changed().await.is_err() {
                let message = self.entries.read().await.get(self.next as usize).cloned();
                if message.is_some() {
                    self.next += 1;
                }
                return message;
            }
        }
    }

    /// Position of the next message this tail will yield.
    pub fn position(&self) -> Position {
        Position(self.next)
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Message>> {
        futures::stream::unfold(self, |mut tail| async move {
            tail.next().await.map(|message| (message, tail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    async fn open_temp() -> (BroadcastLog, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let log = BroadcastLog::open(tmp.path().join("chat").join("chat.log"))
            .await
            .unwrap();
        (log, tmp)
    }

    #[tokio::test]
    async fn append_assigns_dense_positions() {
        let (log, _tmp) = open_temp().await;
        assert!(log.is_empty());
        assert_eq!(log.append(&id("chat01"), "one").await.unwrap(), Position(0));
        assert_eq!(log.append(&id("chat02"), "two").await.unwrap(), Position(1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.head(), Position(2));
    }

    #[tokio::test]
    async fn records_are_on_disk_when_append_returns() {
        let (log, _tmp) = open_temp().await;
        log.append(&id("chat01"), "hello").await.unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.ends_with("[chat01] hello\n"));
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn reopen_replays_history() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chat.log");
        {
            let log = BroadcastLog::open(&path).await.unwrap();
            log.append(&id("chat01"), "hello").await.unwrap();
            log.append(&id("chat02"), "hi").await.unwrap();
        }

        let log = BroadcastLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 2);
        let recent = log.recent(10).await;
        assert_eq!(recent[0].text, "hello");
        assert_eq!(recent[1].identity, id("chat02"));
        assert_eq!(log.append(&id("chat01"), "again").await.unwrap(), Position(2));
    }

    #[tokio::test]
    async fn reopen_skips_garbage_and_torn_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chat.log");
        std::fs::write(
            &path,
            "2024-03-09 14:05:07 [chat01] hello\nnot a record\n2024-03-09 14:05:09 [chat02] torn",
        )
        .unwrap();

        let log = BroadcastLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 1);

        log.append(&id("chat02"), "whole").await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("torn"));
        assert!(contents.ends_with("[chat02] whole\n"));
    }

    #[tokio::test]
    async fn rejects_multiline_text() {
        let (log, _tmp) = open_temp().await;
        let err = log.append(&id("chat01"), "a\nb").await.unwrap_err();
        assert!(matches!(err, LogError::MalformedInput(_)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn tail_waits_for_new_messages() {
        let (log, _tmp) = open_temp().await;
        let mut tail = log.tail_from(log.head());

        let pending = tokio::time::timeout(Duration::from_millis(50), tail.next()).await;
        assert!(pending.is_err(), "tail must suspend while caught up");

        log.append(&id("chat01"), "wake up").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), tail.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.text, "wake up");
        assert_eq!(tail.position(), Position(1));
    }

    #[tokio::test]
    async fn tail_recent_backfills_bounded_window() {
        let (log, _tmp) = open_temp().await;
        for i in 0..5 {
            log.append(&id("chat01"), &format!("m{i}")).await.unwrap();
        }

        let mut tail = log.tail_recent(2);
        assert_eq!(tail.next().await.unwrap().text, "m3");
        assert_eq!(tail.next().await.unwrap().text, "m4");

        let mut everything = log.tail_recent(100);
        assert_eq!(everything.position(), Position(0));
        assert_eq!(everything.next().await.unwrap().text, "m0");
    }

    #[tokio::test]
    async fn tail_is_restartable_from_earlier_position() {
        let (log, _tmp) = open_temp().await;
        for i in 0..3 {
            log.append(&id("chat01"), &format!("m{i}")).await.unwrap();
        }
        let mut tail = log.tail_from(Position(1));
        assert_eq!(tail.next().await.unwrap().text, "m1");
        assert_eq!(tail.next().await.unwrap().text, "m2");
    }

    #[tokio::test]
    async fn tail_drains_then_ends_when_log_dropped() {
        let (log, _tmp) = open_temp().await;
        log.append(&id("chat01"), "last words").await.unwrap();
        let mut tail = log.tail_from(Position(0));
        drop(log);

        assert_eq!(tail.next().await.unwrap().text, "last words");
        assert!(tail.next().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let (log, _tmp) = open_temp().await;
        let log = Arc::new(log);

        let mut handles = Vec::new();
        for i in 0..50 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let who = id(&format!("chat{:02}", i % 5));
                log.append(&who, &format!("message number {i} {}", "x".repeat(200)))
                    .await
                    .unwrap()
            }));
        }
        let mut positions = Vec::new();
        for handle in handles {
            positions.push(handle.await.unwrap().0);
        }
        positions.sort();
        assert_eq!(positions, (0..50).collect::<Vec<_>>());

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let in_memory = log.recent(50).await;
        for (line, msg) in contents.lines().zip(in_memory.iter()) {
            assert_eq!(Message::parse_record(line).unwrap(), **msg);
        }
    }

    #[tokio::test]
    async fn tail_as_stream_follows_then_ends_after_drop() {
        use futures::StreamExt;

        let (log, _tmp) = open_temp().await;
        log.append(&id("chat01"), "one").await.unwrap();
        let mut stream = Box::pin(log.tail_from(Position(0)).into_stream());
        assert_eq!(stream.next().await.unwrap().text, "one");

        log.append(&id("chat02"), "two").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.identity.as_str(), "chat02");
        assert_eq!(msg.text, "two");

        log.append(&id("chat01"), "three").await.unwrap();
        drop(log);
        let rest: Vec<_> = stream.map(|m| m.text.clone()).collect().await;
        assert_eq!(rest, vec!["three".to_string()]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn full_device_is_unwritable() {
        let log = BroadcastLog::unwritable().await.unwrap();

        let err = log.append(&id("chat01"), "lost").await.unwrap_err();
        assert!(matches!(err, LogError::LogUnwritable { .. }));
        assert!(log.is_empty());
        assert!(log.recent(1).await.is_empty());
    }
}
