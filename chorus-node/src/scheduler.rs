//! Cycle scheduler: on every tick, dispatch the inbound queue, advance the transfer, start
//! any file work off the lock, then drain the outbound queue one message at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::node::Inner;
use crate::transport::{self, wait_shutdown};

/// Tick every `interval` until shutdown.
pub(crate) async fn run(inner: Arc<Inner>, interval: Duration) {
    let mut shutdown = inner.shutdown_signal();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }
        tick(&inner).await;
    }
    tracing::debug!("cycle scheduler stopped");
}

pub(crate) async fn tick(inner: &Arc<Inner>) {
    let now = Instant::now();
    let jobs = {
        let mut state = inner.state.lock().await;
        let inbound = std::mem::take(&mut state.inbound);
        for q in inbound {
            inner.dispatch(&mut state, q, now);
        }
        let actions = state.sharing.on_tick(now);
        inner.apply(&mut state, actions);
        std::mem::take(&mut state.source_jobs)
    };
    inner.spawn_source_jobs(jobs);
    drain_outbound(inner).await;
}

/// Write queued messages in order, each fully before the next. Targets are checked here:
/// unknown peers lose the message, peers still connecting keep theirs for the next tick,
/// and a peer whose socket is dead is removed.
async fn drain_outbound(inner: &Inner) {
    let mut deferred = Vec::new();
    loop {
        let (peer_id, writer, message) = {
            let mut state = inner.state.lock().await;
            let Some(q) = state.outbound.pop_front() else {
                break;
            };
            let link = match state.registry.get(q.peer_id) {
                None => {
                    tracing::debug!(peer_id = q.peer_id, kind = q.message.name(), "discarding message for unknown peer");
                    continue;
                }
                Some(peer) => peer.link.as_ref().map(|l| l.writer()),
            };
            match link {
                Some(writer) => (q.peer_id, writer, q.message),
                None => {
                    deferred.push(q);
                    continue;
                }
            }
        };

        let mut w = writer.lock().await;
        let result = match w.peer_addr() {
            Ok(_) => transport::write_message(&mut *w, &message).await,
            Err(e) => Err(e),
        };
        drop(w);
        match result {
            Ok(()) => {
                tracing::trace!(peer_id, kind = message.name(), size = message.body_size(), "message sent");
            }
            Err(e) => {
                tracing::warn!(peer_id, kind = message.name(), error = %e, "write failed, removing peer");
                inner.remove_peer(peer_id).await;
            }
        }
    }
    if !deferred.is_empty() {
        let mut state = inner.state.lock().await;
        for q in deferred.into_iter().rev() {
            state.outbound.push_front(q);
        }
    }
}
