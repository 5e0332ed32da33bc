//! Chorus peer node: TCP transport, peer registry, cycle scheduler and file sharing over tokio.

pub mod config;
pub mod events;
pub mod files;
pub mod handler;
pub mod node;
pub mod registry;
mod scheduler;
pub mod transport;

pub use config::Config;
pub use events::NodeEvent;
pub use handler::{AppHandler, LoggingHandler};
pub use node::{Node, NodeHandle, PeerInfo};
