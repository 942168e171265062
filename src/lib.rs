//! Rust client for the ChatVerse messaging API
//!
//! Owns everything between an embedding UI and the wire: durable
//! credential storage, an authenticated REST client with transparent
//! single-flight token refresh, session resolution, a persistent
//! STOMP-over-WebSocket messaging link with fixed-delay reconnect, and
//! per-conversation feeds that merge fetched history with live messages
//! under one total order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatverse_client::{ChatClient, ClientConfig, FileTokenStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileTokenStore::new("/tmp/chatverse-tokens.json"));
//! let client = ChatClient::new(
//!     ClientConfig {
//!         base_url: "http://chatverse.local:8888".into(),
//!         ..Default::default()
//!     },
//!     store,
//! )?;
//!
//! // Resolve the stored session; once authenticated, the supervisor
//! // brings the messaging link up on its own.
//! let state = client.restore().await;
//! if !state.is_authenticated() {
//!     client.request_code("+15550001").await?;
//!     client.login("+15550001", "1234").await?;
//! }
//!
//! let feed = client.select_conversation(9).await?;
//! feed.send("hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod session;
pub mod token;
pub mod transport;
pub mod types;

// Re-export main types
pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use feed::{conversation_key, ConversationFeed, Timeline};
pub use session::{AuthPhase, AuthState, SessionManager};
pub use token::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use transport::{
    LinkEvent, LinkState, LivePayload, MessageHandler, MessagingLink, SubscriptionHandle,
};
pub use types::*;
