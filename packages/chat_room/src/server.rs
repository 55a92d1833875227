//! Broker accept loop.

use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::connection::{ConnectionContext, serve_connection};

/// Accept connections until `shutdown` fires, then drop every connection.
///
/// The chat session is not created here; the first admitted connection
/// brings it up.
pub async fn serve(
    listener: TcpListener,
    ctx: ConnectionContext,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!("Chat broker listening on {}", local_addr);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let ctx = ctx.clone();
                    let span = info_span!(
                        "connection",
                        peer = %peer,
                        conn_id = %Uuid::new_v4(),
                    );
                    connections.spawn(
                        async move {
                            if let Err(e) = serve_connection(stream, ctx).await {
                                warn!("Connection ended with error: {:#}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    info!("Shutting down, dropping {} connections", connections.len());
    if let Some(session) = ctx.broker.current() {
        session.close();
        info!(
            "Chat session up since {} with {} messages, {} attached",
            session.created_at().format("%Y-%m-%d %H:%M:%S"),
            session.log().len(),
            session.connection_count()
        );
    }
    connections.shutdown().await;

    let snapshot = ctx.metrics.snapshot();
    info!(
        "Served {} connections in {}s ({} still attached, {} rejected, {} session failures)",
        snapshot.total_connections,
        snapshot.uptime_secs,
        snapshot.active_connections,
        snapshot.rejected_admissions,
        snapshot.session_failures
    );
    info!(
        "{} messages appended, {} input lines dropped, {} append failures",
        snapshot.messages_appended, snapshot.input_dropped, snapshot.append_failures
    );
    Ok(())
}
