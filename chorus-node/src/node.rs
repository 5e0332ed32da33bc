//! The running node: shared state behind one lock, and the public handle.
//!
//! Registry, both message queues and the file-sharing coordinator live in a single
//! [`NodeState`] guarded by one `tokio::sync::Mutex`, so calls from outside the runtime
//! (a CLI loop) and the I/O tasks are serialized. Disk work never runs under that lock.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chorus_core::{
    FileSharing, Message, MessageType, OpenRequest, PeerId, QueuedMessage, ReadRequest,
    SharingAction, SharingError,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{self, Config};
use crate::events::NodeEvent;
use crate::files::{self, DiskSource, FileSink};
use crate::handler::{self, AppHandler, LoggingHandler, Route};
use crate::registry::Registry;
use crate::scheduler;
use crate::transport::{self, Link};

pub(crate) struct NodeState {
    pub(crate) registry: Registry<Link>,
    pub(crate) inbound: VecDeque<QueuedMessage>,
    pub(crate) outbound: VecDeque<QueuedMessage>,
    pub(crate) sharing: FileSharing,
    /// File lookups and reads waiting to be started outside the lock.
    pub(crate) source_jobs: Vec<SourceJob>,
    app: Box<dyn AppHandler>,
}

pub(crate) enum SourceJob {
    Open(OpenRequest),
    Read(ReadRequest),
}

enum SourceDone {
    Opened(OpenRequest, Option<u64>),
    Read(ReadRequest, std::io::Result<Vec<u8>>),
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<NodeState>,
    events: mpsc::UnboundedSender<NodeEvent>,
    shutdown: watch::Sender<bool>,
    source: DiskSource,
    local_addr: Option<SocketAddr>,
    download_dir: PathBuf,
    default_segment_count: Option<u32>,
}

impl Inner {
    pub(crate) fn emit(&self, event: NodeEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Queue sends and file work, and surface everything else as events.
    pub(crate) fn apply(&self, state: &mut NodeState, actions: Vec<SharingAction>) {
        for action in actions {
            match action {
                SharingAction::Send(q) => state.outbound.push_back(q),
                SharingAction::Open(req) => state.source_jobs.push(SourceJob::Open(req)),
                SharingAction::Read(req) => state.source_jobs.push(SourceJob::Read(req)),
                other => {
                    if let Some(event) = NodeEvent::from_action(other) {
                        self.emit(event);
                    }
                }
            }
        }
    }

    /// Hand one inbound message to whatever handles its type.
    pub(crate) fn dispatch(&self, state: &mut NodeState, q: QueuedMessage, now: Instant) {
        let peer_id = q.peer_id;
        match handler::route(&q.message) {
            Route::Ping => state
                .outbound
                .push_back(QueuedMessage::new(peer_id, Message::new(MessageType::Pong))),
            Route::Pong => tracing::info!(peer_id, "pong"),
            Route::FileSharing => {
                let actions = state.sharing.on_message(peer_id, &q.message, now);
                self.apply(state, actions);
            }
            Route::App => {
                let replies = state.app.on_message(peer_id, &q.message);
                state.outbound.extend(replies);
            }
            Route::Ignore => tracing::debug!(peer_id, tag = q.message.tag(), "ignoring message"),
        }
    }

    /// Run each job on the blocking pool, then feed its result back to the coordinator.
    /// Replies go out with the next tick.
    pub(crate) fn spawn_source_jobs(self: &Arc<Self>, jobs: Vec<SourceJob>) {
        for job in jobs {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_source_job(job).await });
        }
    }

    async fn run_source_job(&self, job: SourceJob) {
        let source = self.source.clone();
        let done = tokio::task::spawn_blocking(move || match job {
            SourceJob::Open(req) => {
                let size = source.open(&req.name);
                SourceDone::Opened(req, size)
            }
            SourceJob::Read(req) => {
                let result = source.read(&req.name, req.range.clone());
                SourceDone::Read(req, result)
            }
        })
        .await;
        let done = match done {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "file task failed");
                return;
            }
        };
        let mut state = self.state.lock().await;
        let actions = match done {
            SourceDone::Opened(req, size) => {
                if !state.registry.contains(req.peer_id) {
                    return;
                }
                state.sharing.on_opened(req, size)
            }
            SourceDone::Read(req, result) => {
                if !state.registry.contains(req.peer_id) {
                    return;
                }
                state.sharing.on_read(req, result)
            }
        };
        self.apply(&mut state, actions);
    }

    /// Remove a peer: both registry entries first, then its transfer assignments, then
    /// half-close, then the disconnect event. Returns false if it was already gone.
    pub(crate) async fn remove_peer(&self, peer_id: PeerId) -> bool {
        let peer = {
            let mut state = self.state.lock().await;
            let Some(peer) = state.registry.remove(peer_id) else {
                return false;
            };
            let actions = state.sharing.on_peer_disconnected(peer_id, Instant::now());
            self.apply(&mut state, actions);
            peer
        };
        if let Some(link) = peer.link {
            link.close(peer_id).await;
        }
        tracing::info!(peer_id, "peer removed");
        self.emit(NodeEvent::Disconnected { peer_id });
        true
    }
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: Option<SocketAddr>,
    /// False while an outbound connect is in progress.
    pub connected: bool,
}

/// Cheap, cloneable handle for driving a running node.
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) inner: Arc<Inner>,
}

impl NodeHandle {
    /// Address the node accepts on, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Queue a message. The peer is validated when the queue is drained, not here.
    pub async fn push_outbound(&self, peer_id: PeerId, message: Message) {
        self.inner
            .state
            .lock()
            .await
            .outbound
            .push_back(QueuedMessage::new(peer_id, message));
    }

    /// Queue `message` once for every currently connected peer. Returns how many were queued.
    pub async fn broadcast(&self, message: Message) -> usize {
        let mut state = self.inner.state.lock().await;
        let peers = state.registry.connected();
        for &peer_id in &peers {
            state
                .outbound
                .push_back(QueuedMessage::new(peer_id, message.clone()));
        }
        peers.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        let state = self.inner.state.lock().await;
        state
            .registry
            .iter()
            .map(|p| PeerInfo {
                id: p.id,
                addr: p.addr,
                connected: p.is_connected(),
            })
            .collect()
    }

    /// Dial `host:service`. Returns the (tentative) peer id once the name resolves.
    pub async fn connect(&self, host: &str, service: &str) -> std::io::Result<PeerId> {
        transport::connect(&self.inner, host, service).await
    }

    /// Dial a `host:service` string.
    pub async fn connect_to(&self, target: &str) -> anyhow::Result<PeerId> {
        let (host, service) = config::split_host_service(target)
            .with_context(|| format!("{target:?} is not host:service"))?;
        self.connect(host, service)
            .await
            .with_context(|| format!("connecting to {target}"))
    }

    /// Idempotent.
    pub async fn remove_peer(&self, peer_id: PeerId) -> bool {
        self.inner.remove_peer(peer_id).await
    }

    pub async fn remove_peer_by_addr(&self, addr: SocketAddr) -> bool {
        let found = self.inner.state.lock().await.registry.find_by_addr(addr);
        match found {
            Some(peer_id) => self.inner.remove_peer(peer_id).await,
            None => false,
        }
    }

    /// Fetch `name` from every connected peer with the configured segment count.
    pub async fn start_fetch(&self, name: &str) -> anyhow::Result<()> {
        self.start_fetch_with(name, self.inner.default_segment_count)
            .await
    }

    /// Fetch `name` into the download directory, asking peers for `segments` segments.
    pub async fn start_fetch_with(&self, name: &str, segments: Option<u32>) -> anyhow::Result<()> {
        let file_name = files::download_name(name)
            .with_context(|| format!("{name:?} has no file name"))?;
        let path = self.inner.download_dir.join(file_name);
        if self.inner.state.lock().await.registry.connected().is_empty() {
            return Err(SharingError::NoPeers).with_context(|| format!("starting fetch of {name}"));
        }
        let target = path.clone();
        let file = tokio::task::spawn_blocking(move || FileSink::create_file(&target))
            .await
            .context("download file task failed")?
            .with_context(|| format!("creating {}", path.display()))?;
        let sink = FileSink::spawn(file, path.clone());

        let mut state = self.inner.state.lock().await;
        let peers = state.registry.connected();
        let actions = state
            .sharing
            .start_fetch(name, &peers, segments, Box::new(sink))
            .with_context(|| format!("starting fetch of {name}"))?;
        self.inner.apply(&mut state, actions);
        tracing::info!(name, path = %path.display(), peers = peers.len(), "fetch requested");
        Ok(())
    }

    pub async fn pause_transfer(&self) -> Result<(), SharingError> {
        self.inner.state.lock().await.sharing.pause()
    }

    pub async fn resume_transfer(&self) -> Result<(), SharingError> {
        self.inner.state.lock().await.sharing.resume()
    }
}

/// A started node: background tasks plus the receiving end of its events.
pub struct Node {
    handle: NodeHandle,
    events: Option<mpsc::UnboundedReceiver<NodeEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start with the logging application handler.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        Self::start_with_handler(config, Box::new(LoggingHandler)).await
    }

    /// Bind, start the accept loop and the cycle scheduler. Must run inside a tokio runtime.
    pub async fn start_with_handler(config: &Config, app: Box<dyn AppHandler>) -> anyhow::Result<Self> {
        let listener = transport::listen(config.listen_port)
            .with_context(|| format!("binding port {}", config.listen_port))?;
        Self::launch(config, app, listener)
    }

    /// Start around an already-bound listener. Without one the node only dials out.
    fn launch(
        config: &Config,
        app: Box<dyn AppHandler>,
        listener: Option<TcpListener>,
    ) -> anyhow::Result<Self> {
        let local_addr = match &listener {
            Some(l) => Some(l.local_addr().context("reading listen address")?),
            None => None,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(NodeState {
                registry: Registry::new(),
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                sharing: FileSharing::new(config.segment_timeout()),
                source_jobs: Vec::new(),
                app,
            }),
            events: events_tx,
            shutdown: shutdown_tx,
            source: DiskSource::new(config.share_dir.clone()),
            local_addr,
            download_dir: config.download_dir.clone(),
            default_segment_count: config.default_segment_count,
        });

        let mut tasks = Vec::new();
        if let Some(listener) = listener {
            tasks.push(tokio::spawn(transport::accept_loop(inner.clone(), listener)));
        }
        tasks.push(tokio::spawn(scheduler::run(
            inner.clone(),
            config.cycle_interval(),
        )));
        tracing::info!(addr = ?local_addr, cycle_ms = config.cycle_interval_ms, "node started");
        Ok(Self {
            handle: NodeHandle { inner },
            events: Some(events_rx),
            tasks,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.events.take()
    }

    /// Stop accepting and ticking, half-close every socket, and give tasks `grace` to finish.
    pub async fn shutdown(self, grace: Duration) {
        let Node { handle, tasks, .. } = self;
        let inner = &handle.inner;
        inner.shutdown.send_replace(true);
        let peers = inner.state.lock().await.registry.drain();
        for peer in peers {
            if let Some(link) = peer.link {
                link.close(peer.id).await;
                inner.emit(NodeEvent::Disconnected { peer_id: peer.id });
            }
        }
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, async move {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("tasks still running after grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("node stopped");
    }
}
