//! Pushes the shared log to one connection's writer.

use chat_log::Tail;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a fan-out task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutEnd {
    /// The connection is going away.
    Cancelled,
    /// The writer half dropped its receiver.
    WriterGone,
    /// The log was dropped and every message has been delivered.
    LogClosed,
}

/// Render every message the tail yields, in order, into `out`.
///
/// A slow connection only ever fills its own channel; the tail waits for it
/// and nothing else does. Waiting on either the tail or the channel is
/// abandoned as soon as `cancel` fires.
pub async fn run_fanout(
    mut tail: Tail,
    out: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> FanoutEnd {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return FanoutEnd::Cancelled,
            message = tail.next() => message,
        };

        let Some(message) = message else {
            debug!("Log closed at {}", tail.position());
            return FanoutEnd::LogClosed;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return FanoutEnd::Cancelled,
            sent = out.send(message.render()) => {
                if sent.is_err() {
                    return FanoutEnd::WriterGone;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_log::{BroadcastLog, Identity};
    use std::time::Duration;

    async fn open_log() -> (tempfile::TempDir, BroadcastLog) {
        let tmp = tempfile::tempdir().unwrap();
        let log = BroadcastLog::open(tmp.path().join("chat.log")).await.unwrap();
        (tmp, log)
    }

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[tokio::test]
    async fn delivers_backfill_then_live_messages() {
        let (_tmp, log) = open_log().await;
        log.append(&id("chat01"), "one").await.unwrap();
        log.append(&id("chat01"), "two").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_fanout(log.tail_recent(1), tx, cancel.clone()));

        assert!(rx.recv().await.unwrap().ends_with("[chat01] two"));

        log.append(&id("chat02"), "three").await.unwrap();
        assert!(rx.recv().await.unwrap().ends_with("[chat02] three"));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), FanoutEnd::Cancelled);
    }

    #[tokio::test]
    async fn stalled_connection_does_not_block_others() {
        let (_tmp, log) = open_log().await;
        let cancel = CancellationToken::new();

        // Never drained.
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let slow = tokio::spawn(run_fanout(log.tail_from(log.head()), slow_tx, cancel.clone()));

        let (fast_tx, mut fast_rx) = mpsc::channel(64);
        let fast = tokio::spawn(run_fanout(log.tail_from(log.head()), fast_tx, cancel.clone()));

        for i in 0..10 {
            log.append(&id("chat01"), &format!("m{i}")).await.unwrap();
        }
        for i in 0..10 {
            let line = tokio::time::timeout(Duration::from_secs(5), fast_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(line.ends_with(&format!("m{i}")));
        }

        cancel.cancel();
        assert_eq!(slow.await.unwrap(), FanoutEnd::Cancelled);
        assert_eq!(fast.await.unwrap(), FanoutEnd::Cancelled);
    }

    #[tokio::test]
    async fn stops_when_writer_goes_away() {
        let (_tmp, log) = open_log().await;
        log.append(&id("chat01"), "hello").await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let end = run_fanout(log.tail_recent(1), tx, CancellationToken::new()).await;
        assert_eq!(end, FanoutEnd::WriterGone);
    }

    #[tokio::test]
    async fn drains_then_ends_when_log_dropped() {
        let (_tmp, log) = open_log().await;
        log.append(&id("chat01"), "last words").await.unwrap();
        let tail = log.tail_recent(1);
        drop(log);

        let (tx, mut rx) = mpsc::channel(4);
        let end = run_fanout(tail, tx, CancellationToken::new()).await;
        assert_eq!(end, FanoutEnd::LogClosed);
        assert!(rx.recv().await.unwrap().ends_with("last words"));
    }
}
