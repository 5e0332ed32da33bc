//! Message dispatch by type.

use chorus_core::{Message, MessageType, PeerId, QueuedMessage};

/// Handles the application messages (database, track info, lyrics) the node itself does not.
pub trait AppHandler: Send {
    /// Returns replies to queue.
    fn on_message(&mut self, from: PeerId, msg: &Message) -> Vec<QueuedMessage> {
        tracing::debug!(peer_id = from, kind = msg.name(), size = msg.body_size(), "unhandled application message");
        Vec::new()
    }
}

/// Logs and drops application messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl AppHandler for LoggingHandler {}

/// What a message should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answer with PONG.
    Ping,
    Pong,
    FileSharing,
    App,
    /// NOTHING or an unknown tag.
    Ignore,
}

pub fn route(msg: &Message) -> Route {
    match msg.kind() {
        None | Some(MessageType::Nothing) => Route::Ignore,
        Some(MessageType::Ping) => Route::Ping,
        Some(MessageType::Pong) => Route::Pong,
        Some(kind) if kind.is_file_sharing() => Route::FileSharing,
        Some(_) => Route::App,
    }
}
