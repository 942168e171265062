//! Conversation feed: fetched history and live messages merged under one
//! total order.
//!
//! The timeline orders by `(timestamp, id)` and drops duplicate ids, so a
//! message that arrives both in the history fetch and over the link lands
//! exactly once. Outbound sends are not inserted locally; a sent message
//! appears when the server echoes it back on the inbox queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::error::{ClientError, Result};
use crate::transport::{LivePayload, MessageHandler, MessagingLink, SubscriptionHandle};
use crate::types::{ChatMessage, Identity, OutboundMessage};

/// Room id for a pair of users: ids ascending, joined with `_`.
/// Symmetric by construction.
pub fn conversation_key(a: i64, b: i64) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}_{}", low, high)
}

/// Ordered, deduplicated message sequence
#[derive(Default)]
pub struct Timeline {
    messages: Vec<ChatMessage>,
    seen: HashSet<i64>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered insert. Returns `false` without touching anything when the
    /// id is already present, whatever the other fields say.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        let position = self
            .messages
            .partition_point(|m| (m.timestamp, m.id) <= (message.timestamp, message.id));
        self.messages.insert(position, message);
        true
    }

    /// Insert a batch (history load); returns how many actually landed
    pub fn merge(&mut self, batch: Vec<ChatMessage>) -> usize {
        let mut added = 0;
        for message in batch {
            if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// One open two-party conversation: its timeline and its inbox
/// subscription.
///
/// Dropping the feed releases the subscription; [`close`](Self::close)
/// does it eagerly.
pub struct ConversationFeed {
    peer_id: i64,
    room_id: String,
    link: Arc<MessagingLink>,
    timeline: Arc<Mutex<Timeline>>,
    revision: Arc<watch::Sender<u64>>,
    subscription: SubscriptionHandle,
}

impl ConversationFeed {
    /// Load history for the conversation with `peer_id` and hook the
    /// per-user inbox for live delivery.
    ///
    /// The inbox carries every conversation of `me`; the handler keeps
    /// only messages between `me` and this peer. When the link is down the
    /// feed still opens with history, but live delivery will not occur.
    pub async fn open(
        api: &ChatApi,
        link: Arc<MessagingLink>,
        me: Identity,
        peer_id: i64,
    ) -> Result<Self> {
        let room_id = conversation_key(me.id, peer_id);
        let history = api.chat_history(&room_id).await?;

        let timeline = Arc::new(Mutex::new(Timeline::new()));
        let revision = Arc::new(watch::channel(0u64).0);
        {
            let mut guard = lock_timeline(&timeline);
            let added = guard.merge(history);
            info!(room = %room_id, messages = added, "conversation history loaded");
        }
        revision.send_modify(|r| *r += 1);

        let my_id = me.id;
        let handler_timeline = Arc::clone(&timeline);
        let handler_revision = Arc::clone(&revision);
        let handler: MessageHandler = Arc::new(move |payload| match payload {
            LivePayload::Message(message) => {
                let ours = (message.sender_id == my_id && message.recipient_id == peer_id)
                    || (message.sender_id == peer_id && message.recipient_id == my_id);
                if !ours {
                    debug!(
                        sender = message.sender_id,
                        recipient = message.recipient_id,
                        "message belongs to another conversation"
                    );
                    return;
                }
                let inserted = lock_timeline(&handler_timeline).insert(message);
                if inserted {
                    handler_revision.send_modify(|r| *r += 1);
                }
            }
            LivePayload::Raw(text) => {
                warn!(bytes = text.len(), "undecodable live payload, dropped");
            }
        });

        let destination = format!("/user/{}/queue/messages", my_id);
        let subscription = link.subscribe(&destination, handler).await;
        if !subscription.is_live() {
            warn!(room = %room_id, "conversation opened without live delivery");
        }

        Ok(Self {
            peer_id,
            room_id,
            link,
            timeline,
            revision,
            subscription,
        })
    }

    /// Publish a message to the peer over the link.
    ///
    /// Trimmed-empty content is invalid; a downed link fails with
    /// `NotConnected` and nothing is queued. No local insert happens
    /// here.
    pub async fn send(&self, text: &str) -> Result<()> {
        let content = text.trim();
        if content.is_empty() {
            return Err(ClientError::Validation(
                "message content is empty".to_string(),
            ));
        }
        let payload = serde_json::to_value(OutboundMessage {
            recipient_id: self.peer_id,
            content: content.to_string(),
        })?;
        self.link.publish("/app/chat.sendMessage", &payload).await
    }

    pub fn timeline_snapshot(&self) -> Vec<ChatMessage> {
        lock_timeline(&self.timeline).snapshot()
    }

    pub fn message_count(&self) -> usize {
        lock_timeline(&self.timeline).len()
    }

    /// Revision counter bumped on every timeline change
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer_id(&self) -> i64 {
        self.peer_id
    }

    /// Release the inbox subscription. Idempotent.
    pub async fn close(&self) {
        self.subscription.release().await;
    }
}

fn lock_timeline(timeline: &Arc<Mutex<Timeline>>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
