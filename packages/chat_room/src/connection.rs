//! One participant's connection: handshake, admission, then the two pumps
//! between the socket and the shared session.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chat_gate::AccessGate;
use chat_log::LogError;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::diagnostics::DiagnosticLog;
use crate::fanout::run_fanout;
use crate::metrics::ServerMetrics;
use crate::protocol::{ClientHello, ServerHello, diagnostic};
use crate::session::{SessionBroker, SessionError};

/// Hard cap on any single frame, hello included. Past this the connection
/// is closed rather than skipped.
const MAX_FRAME_BYTES: usize = 64 * 1024;

pub const UNAVAILABLE_MESSAGE: &str = "chat unavailable, try again later";

/// Everything a connection handler shares with the rest of the broker.
#[derive(Clone)]
pub struct ConnectionContext {
    pub gate: Arc<AccessGate>,
    pub broker: Arc<SessionBroker>,
    pub diagnostics: Arc<DiagnosticLog>,
    pub metrics: Arc<ServerMetrics>,
    pub chat: ChatConfig,
}

/// Drive one connection to completion.
///
/// Whatever happens here stays here: errors end this connection and never
/// touch the session or other participants.
pub async fn serve_connection<S>(stream: S, ctx: ConnectionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    // Raw frames: bytes that are not UTF-8 must not end the connection.
    let mut frames = FramedRead::new(
        reader,
        AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            MAX_FRAME_BYTES.max(ctx.chat.max_line_bytes),
        ),
    );
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    // Handshake
    let first = tokio::time::timeout(ctx.chat.handshake_timeout, frames.next()).await;
    if matches!(first, Ok(None)) {
        // Health checks connect and hang up; they are not participants.
        debug!("Connection closed before hello");
        return Ok(());
    }
    ctx.metrics.connection_accepted();

    let hello = match first {
        Ok(Some(Ok(frame))) => match serde_json::from_slice::<ClientHello>(&frame) {
            Ok(hello) => hello,
            Err(e) => {
                debug!("Malformed hello: {}", e);
                ctx.metrics.admission_rejected();
                let reply = ServerHello::rejected("unauthorized", "unauthorized");
                return send_hello(&mut sink, &reply).await;
            }
        },
        Ok(Some(Err(e))) => {
            debug!("Failed to read hello: {}", e);
            ctx.metrics.admission_rejected();
            let reply = ServerHello::rejected("unauthorized", "unauthorized");
            return send_hello(&mut sink, &reply).await;
        }
        Ok(None) => return Ok(()),
        Err(_) => {
            debug!("Handshake timed out");
            ctx.metrics.admission_rejected();
            let reply = ServerHello::rejected("handshake_timeout", "handshake timed out");
            return send_hello(&mut sink, &reply).await;
        }
    };

    // Admission. Secret verification is deliberately slow.
    let gate = Arc::clone(&ctx.gate);
    let credentials = hello.credentials();
    let requests = hello.requests.clone();
    let admission = tokio::task::spawn_blocking(move || gate.admit(&credentials, &requests))
        .await
        .context("Admission task failed")?;
    let admission = match admission {
        Ok(admission) => admission,
        Err(e) => {
            ctx.metrics.admission_rejected();
            return send_hello(&mut sink, &ServerHello::from(&e)).await;
        }
    };
    let identity = admission.identity;

    // Session
    let attached = match ctx.broker.ensure_session().await {
        Ok(session) => session.attach(identity.clone(), admission.capabilities),
        Err(e) => Err(e),
    };
    let mut view = match attached {
        Ok(view) => view,
        Err(SessionError::Denied(e)) => {
            ctx.metrics.admission_rejected();
            return send_hello(&mut sink, &ServerHello::from(&e)).await;
        }
        Err(e) => {
            ctx.metrics.session_failed();
            ctx.diagnostics
                .record(e.error_code(), &format!("{identity}: {e}"))
                .await;
            let reply = ServerHello::rejected(e.error_code(), UNAVAILABLE_MESSAGE);
            return send_hello(&mut sink, &reply).await;
        }
    };

    let accepted = ServerHello::Accepted {
        identity: identity.to_string(),
        session_started_at: view.session().created_at(),
    };
    send_hello(&mut sink, &accepted).await?;
    ctx.metrics.connection_attached();
    debug!(
        "{} attached as {} with {:?}",
        identity,
        view.id(),
        view.capabilities()
    );
    let present: Vec<String> = view
        .session()
        .attached()
        .iter()
        .map(|info| info.identity.to_string())
        .collect();
    info!(
        "{} joined (term: {}, present: {})",
        identity,
        hello.term.as_deref().unwrap_or("unknown"),
        present.join(", ")
    );

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<String>(ctx.chat.send_channel_capacity);

    // Single writer: everything bound for the socket goes through `rx`.
    let writer_cancel = cancel.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = sink.send(line).await {
                debug!("Write failed: {}", e);
                writer_cancel.cancel();
                break;
            }
        }
    });

    let fanout = view
        .take_tail()
        .map(|tail| tokio::spawn(run_fanout(tail, tx.clone(), cancel.clone())));

    let notice_wait = ctx.chat.drain_timeout;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                ctx.metrics.input_dropped();
                notify(&tx, "line too long, disconnecting", notice_wait).await;
                break;
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => {
                debug!("Read failed: {}", e);
                break;
            }
            None => break,
        };

        if frame.len() > ctx.chat.max_line_bytes {
            ctx.metrics.input_dropped();
            notify(&tx, "line too long, dropped", notice_wait).await;
            continue;
        }

        let raw = decode_frame(&frame);
        if let Cow::Owned(_) = raw {
            debug!("Replaced invalid UTF-8 in input from {}", identity);
        }

        match view.post(&raw).await {
            Ok(position) => {
                ctx.metrics.message_appended();
                debug!("{} appended {}", identity, position);
            }
            Err(LogError::MalformedInput(reason)) => {
                ctx.metrics.input_dropped();
                debug!("Dropped input from {}: {}", identity, reason);
            }
            Err(e @ LogError::LogUnwritable { .. }) => {
                ctx.metrics.append_failed();
                warn!("Append from {} failed: {}", identity, e);
                ctx.diagnostics
                    .record(e.error_code(), &format!("{identity}: {e}"))
                    .await;
                notify(&tx, "chat log unwritable, message not delivered", notice_wait).await;
                break;
            }
            Err(e) => {
                ctx.metrics.input_dropped();
                warn!("Dropped input from {}: {}", identity, e);
            }
        }
    }

    // Teardown: stop the renderer, let the writer drain what was queued.
    cancel.cancel();
    if let Some(fanout) = fanout {
        if let Ok(end) = fanout.await {
            debug!("Fan-out for {} ended: {:?}", identity, end);
        }
    }
    drop(view);
    drop(tx);
    if tokio::time::timeout(ctx.chat.drain_timeout, &mut writer)
        .await
        .is_err()
    {
        // The peer stopped reading; whatever is still queued is lost.
        debug!("Writer for {} did not drain in time", identity);
        writer.abort();
    }

    ctx.metrics.connection_detached();
    info!("{} left", identity);
    Ok(())
}

/// One input frame as text. Bytes that are not UTF-8 become U+FFFD.
fn decode_frame(frame: &[u8]) -> Cow<'_, str> {
    let frame = frame.strip_suffix(b"\r").unwrap_or(frame);
    String::from_utf8_lossy(frame)
}

/// Queue a `*** ` line for this connection. Gives up if the peer has
/// stopped reading.
async fn notify(tx: &mpsc::Sender<String>, text: &str, wait: Duration) {
    if tokio::time::timeout(wait, tx.send(diagnostic(text)))
        .await
        .is_err()
    {
        debug!("Dropped notice for a stalled connection: {}", text);
    }
}

async fn send_hello<W>(sink: &mut FramedWrite<W, LinesCodec>, hello: &ServerHello) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(hello)?;
    sink.send(line).await.context("Failed to send hello")?;
    Ok(())
}
