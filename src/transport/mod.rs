//! STOMP-over-WebSocket messaging link.
//!
//! Layered bottom-up: `frame` is the wire codec, `socket` opens the
//! WebSocket and moves text messages, `conn` is one established STOMP
//! session (handshake done, read loop and heartbeat running), and `link`
//! owns lifecycle: connect/disconnect, the subscription registry, and the
//! reconnect supervisor.

pub mod frame;
pub mod link;

pub(crate) mod conn;
pub(crate) mod socket;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::ChatMessage;

pub use link::{spawn_supervisor, MessagingLink, SubscriptionHandle};

/// Connection lifecycle as observed by embedders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events broadcast by the link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Disconnected { reason: String },
    /// The broker sent an ERROR frame. Surfaced as-is; deciding whether it
    /// ends the session is the embedder's call.
    BrokerError { message: String },
}

/// What a subscription handler receives
#[derive(Debug, Clone)]
pub enum LivePayload {
    /// Body parsed as a chat message
    Message(ChatMessage),
    /// Body that did not parse as one, delivered verbatim
    Raw(String),
}

/// Handler invoked on the read-loop task. Keep it quick and non-blocking;
/// slow work belongs on a channel.
pub type MessageHandler = Arc<dyn Fn(LivePayload) + Send + Sync>;

pub(crate) struct SubscriptionEntry {
    pub destination: String,
    pub handler: MessageHandler,
}

/// Subscription id to handler map, shared between the link and the
/// read loop of whichever connection is current.
pub(crate) type Registry = Arc<RwLock<HashMap<String, SubscriptionEntry>>>;
