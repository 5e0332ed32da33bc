//! TCP transport: listen, accept loop, outbound connect, per-socket read pipeline.
//!
//! A frame is read as two exact reads (header, then body if `body_size > 0`) and written
//! the same way, so partial reads and writes are absorbed by `read_exact`/`write_all`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chorus_core::wire::{MessageHeader, HEADER_SIZE};
use chorus_core::{Message, PeerId, QueuedMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;

use crate::events::NodeEvent;
use crate::node::Inner;
use crate::registry::SocketId;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Read one complete message. Oversize or malformed headers are `InvalidData`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Message> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let header = MessageHeader::decode(&raw);
    header
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut body = vec![0u8; header.body_size as usize];
    if header.body_size > 0 {
        reader.read_exact(&mut body).await?;
    }
    Message::from_parts(header, body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one complete message: header, then body if non-empty.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    writer.write_all(&msg.header().encode()).await?;
    if !msg.body().is_empty() {
        writer.write_all(msg.body()).await?;
    }
    writer.flush().await
}

/// Owning handle on a registered socket: the write half and the read task.
#[derive(Debug)]
pub(crate) struct Link {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: AbortHandle,
}

impl Link {
    pub(crate) fn writer(&self) -> Arc<Mutex<OwnedWriteHalf>> {
        self.writer.clone()
    }

    /// Half-close (best effort), then stop the read task. Dropping the halves closes the socket.
    pub(crate) async fn close(self, peer_id: PeerId) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!(peer_id, error = %e, "socket shutdown failed");
        }
        self.reader.abort();
    }

    fn abort(self) {
        self.reader.abort();
    }

    /// Stop the read task but keep the socket registered.
    #[cfg(test)]
    pub(crate) fn stop_reading(&self) {
        self.reader.abort();
    }
}

/// Resolves once shutdown has been signalled (or the signal sender is gone).
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Bind and listen on all interfaces. A bind failure is an error; a listen failure is
/// logged and yields `None` (outbound-only node).
pub(crate) fn listen(port: u16) -> io::Result<Option<TcpListener>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    match socket.listen(LISTEN_BACKLOG) {
        Ok(listener) => Ok(Some(listener)),
        Err(e) => {
            tracing::warn!(port, error = %e, "listen failed, continuing outbound-only");
            Ok(None)
        }
    }
}

/// Accept until shutdown. One failed accept never stops the loop.
pub(crate) async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_signal();
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = wait_shutdown(&mut shutdown) => break,
        };
        match accepted {
            Ok((stream, _)) => {
                let addr = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping accepted socket without remote endpoint");
                        continue;
                    }
                };
                adopt(&inner, stream, addr, None).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Register a connected stream and start its read pipeline. With `reserved`, completes the
/// tentative entry of an outbound connect; returns `None` if that entry is gone.
async fn adopt(
    inner: &Arc<Inner>,
    stream: TcpStream,
    addr: SocketAddr,
    reserved: Option<PeerId>,
) -> Option<PeerId> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr = %addr, error = %e, "set_nodelay failed");
    }
    let mut state = inner.state.lock().await;
    let socket = state.registry.allocate_socket();
    let (reader, writer) = stream.into_split();
    // Spawned under the lock: the pipeline cannot look up its socket before it is registered.
    let task = tokio::spawn(read_pipeline(inner.clone(), socket, reader));
    let link = Link {
        writer: Arc::new(Mutex::new(writer)),
        reader: task.abort_handle(),
    };
    let peer_id = match reserved {
        None => state.registry.register(socket, addr, link),
        Some(id) => match state.registry.attach(id, socket, addr, link) {
            Ok(()) => id,
            Err(link) => {
                drop(state);
                link.abort();
                tracing::debug!(peer_id = id, addr = %addr, "connect completed for removed peer");
                return None;
            }
        },
    };
    drop(state);
    tracing::info!(peer_id, addr = %addr, "peer connected");
    inner.emit(NodeEvent::Connected { peer_id, addr });
    Some(peer_id)
}

/// Resolve `host:service`. The service must be a port number.
pub(crate) async fn resolve(host: &str, service: &str) -> io::Result<Vec<SocketAddr>> {
    let port: u16 = service.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("service {service:?} is not a port number"),
        )
    })?;
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host} resolved to no addresses"),
        ));
    }
    Ok(addrs)
}

/// Outbound connect. The peer id is allocated before resolution; if resolution fails the
/// tentative entry is removed and the error returned. The TCP connect itself runs in the
/// background: on failure the entry is removed without notification.
pub(crate) async fn connect(inner: &Arc<Inner>, host: &str, service: &str) -> io::Result<PeerId> {
    let id = inner.state.lock().await.registry.reserve();
    let addrs = match resolve(host, service).await {
        Ok(addrs) => addrs,
        Err(e) => {
            inner.state.lock().await.registry.remove(id);
            tracing::warn!(host, service, error = %e, "cannot resolve peer");
            return Err(e);
        }
    };
    let inner = inner.clone();
    tokio::spawn(async move {
        match connect_any(&addrs).await {
            Ok((stream, addr)) => {
                adopt(&inner, stream, addr, Some(id)).await;
            }
            Err(e) => {
                inner.state.lock().await.registry.remove(id);
                tracing::warn!(peer_id = id, error = %e, "connect failed");
            }
        }
    });
    Ok(id)
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<(TcpStream, SocketAddr)> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses");
    for &addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Read messages into the inbound queue until the socket fails or is unregistered.
async fn read_pipeline(inner: Arc<Inner>, socket: SocketId, mut reader: OwnedReadHalf) {
    loop {
        let result = read_message(&mut reader).await;
        let mut state = inner.state.lock().await;
        let Some(peer_id) = state.registry.peer_for_socket(socket) else {
            return;
        };
        match result {
            Ok(msg) => {
                tracing::trace!(peer_id, kind = msg.name(), size = msg.body_size(), "message received");
                state.inbound.push_back(QueuedMessage::new(peer_id, msg));
            }
            Err(e) => {
                drop(state);
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    tracing::debug!(peer_id, "peer closed connection");
                } else {
                    tracing::warn!(peer_id, error = %e, "read failed");
                }
                inner.remove_peer(peer_id).await;
                return;
            }
        }
    }
}
