//! Messaging link lifecycle.
//!
//! One `MessagingLink` outlives any number of underlying connections. It
//! owns the subscription registry, publishes a [`LinkState`] watch channel
//! and a [`LinkEvent`] broadcast, and tears connections down or brings
//! them up on demand. The link itself never decides *when* to be
//! connected; [`spawn_supervisor`] drives it from the observed auth state,
//! reconnecting with a fixed delay while the session stays authenticated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::session::AuthState;
use crate::token::TokenStore;

use super::conn::{Conn, ConnDown, ConnParams};
use super::frame::{Command, Frame};
use super::{LinkEvent, LinkState, MessageHandler, Registry, SubscriptionEntry};

struct LinkShared {
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    registry: Registry,
    active: Mutex<Option<Conn>>,
    seq: AtomicU64,
    down_tx: mpsc::UnboundedSender<ConnDown>,
}

/// Persistent pub/sub connection to the message broker.
///
/// Construct inside a Tokio runtime; the link runs a monitor task that
/// reacts to connection death notices.
pub struct MessagingLink {
    shared: Arc<LinkShared>,
    url: String,
    host: String,
    heartbeat_ms: (u64, u64),
    connect_timeout: Duration,
    monitor_task: JoinHandle<()>,
}

impl MessagingLink {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let url = config.ws_endpoint()?;
        let host = config.ws_host()?;
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(32);
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LinkShared {
            state,
            events,
            registry: Arc::new(RwLock::new(std::collections::HashMap::new())),
            active: Mutex::new(None),
            seq: AtomicU64::new(0),
            down_tx,
        });
        let monitor_task = tokio::spawn(monitor_loop(Arc::clone(&shared), down_rx));
        Ok(Self {
            shared,
            url,
            host,
            heartbeat_ms: (
                config.heartbeat_outgoing.as_millis() as u64,
                config.heartbeat_incoming.as_millis() as u64,
            ),
            connect_timeout: config.connect_timeout,
            monitor_task,
        })
    }

    // ==================== Lifecycle ====================

    /// Bring the link up with the given bearer token.
    ///
    /// A no-op when a connect is already in flight or a live connection
    /// holds the same token. A stale or token-mismatched connection is
    /// torn down first. Refuses an empty token.
    pub async fn connect(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(ClientError::CredentialMissing);
        }
        if *self.shared.state.borrow() == LinkState::Connecting {
            debug!("connect already in progress");
            return Ok(());
        }

        let mut active = self.shared.active.lock().await;
        // Re-check under the lock; another caller may have finished
        // connecting while we waited.
        if let Some(conn) = active.as_ref() {
            if conn.is_alive() && conn.bearer() == token {
                debug!("connect requested while already connected");
                return Ok(());
            }
        }
        if let Some(stale) = active.take() {
            info!(seq = stale.seq(), "replacing stale connection");
            let _ = stale.send_frame(&Frame::new(Command::Disconnect)).await;
        }

        self.shared.state.send_replace(LinkState::Connecting);
        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let params = ConnParams {
            url: self.url.clone(),
            host: self.host.clone(),
            bearer: token.to_string(),
            heartbeat_ms: self.heartbeat_ms,
            connect_timeout: self.connect_timeout,
            seq,
            registry: Arc::clone(&self.shared.registry),
            events: self.shared.events.clone(),
            down: self.shared.down_tx.clone(),
        };
        match Conn::establish(params).await {
            Ok(conn) => {
                revive_subscriptions(&conn, &self.shared.registry).await;
                *active = Some(conn);
                self.shared.state.send_replace(LinkState::Connected);
                let _ = self.shared.events.send(LinkEvent::Connected);
                info!(url = %self.url, seq = seq, "messaging link connected");
                Ok(())
            }
            Err(e) => {
                self.shared.state.send_replace(LinkState::Disconnected);
                error!(error = %e, "messaging link connect failed");
                Err(e)
            }
        }
    }

    /// Tear the link down. Idempotent; safe when never connected.
    pub async fn disconnect(&self) {
        let mut active = self.shared.active.lock().await;
        if let Some(conn) = active.take() {
            // Best-effort graceful goodbye before the tasks are aborted.
            let _ = conn.send_frame(&Frame::new(Command::Disconnect)).await;
            info!(seq = conn.seq(), "messaging link disconnected");
        }
        drop(active);
        // An already-down link must stay silent: no watch version bump, no
        // event. The supervisor parks on this watch between transitions.
        let went_down = self.shared.state.send_if_modified(|state| {
            if *state == LinkState::Disconnected {
                return false;
            }
            *state = LinkState::Disconnected;
            true
        });
        if went_down {
            let _ = self.shared.events.send(LinkEvent::Disconnected {
                reason: "disconnect requested".to_string(),
            });
        }
    }

    // ==================== Traffic ====================

    /// SEND a JSON payload to a destination. Fails when the link is down;
    /// nothing is queued.
    pub async fn publish(&self, destination: &str, payload: &serde_json::Value) -> Result<()> {
        let active = self.shared.active.lock().await;
        let conn = active.as_ref().filter(|c| c.is_alive()).ok_or_else(|| {
            ClientError::NotConnected(format!(
                "cannot publish to {} while disconnected",
                destination
            ))
        })?;
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(payload.to_string());
        conn.send_frame(&frame).await
    }

    /// Register a handler for a destination.
    ///
    /// On a live link this sends SUBSCRIBE and returns a live handle whose
    /// subscription survives reconnects until released. On a downed link it
    /// returns an inert handle: nothing is registered or queued, delivery
    /// will not occur, and releasing it is a no-op.
    pub async fn subscribe(&self, destination: &str, handler: MessageHandler) -> SubscriptionHandle {
        let active = self.shared.active.lock().await;
        let conn = match active.as_ref().filter(|c| c.is_alive()) {
            Some(conn) => conn,
            None => {
                warn!(
                    destination = %destination,
                    "subscribe while disconnected, returning inert handle"
                );
                return SubscriptionHandle::inert(destination);
            }
        };

        let sub_id = format!("sub-{}", Uuid::new_v4());
        {
            let mut registry = self.shared.registry.write().await;
            registry.insert(
                sub_id.clone(),
                SubscriptionEntry {
                    destination: destination.to_string(),
                    handler,
                },
            );
        }
        if let Err(e) = conn.send_frame(&subscribe_frame(&sub_id, destination)).await {
            // Entry stays registered; the next connection re-issues it.
            warn!(error = %e, destination = %destination, "SUBSCRIBE send failed");
        }
        debug!(subscription = %sub_id, destination = %destination, "subscribed");
        SubscriptionHandle::live(sub_id, destination, Arc::downgrade(&self.shared))
    }

    // ==================== Observation ====================

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Token the live connection authenticated with, if any
    pub(crate) async fn connected_bearer(&self) -> Option<String> {
        let active = self.shared.active.lock().await;
        active
            .as_ref()
            .filter(|c| c.is_alive())
            .map(|c| c.bearer().to_string())
    }
}

impl Drop for MessagingLink {
    fn drop(&mut self) {
        self.monitor_task.abort();
    }
}

/// Consumes death notices from read loops. Only the notice matching the
/// current connection counts; replaced connections are ignored.
async fn monitor_loop(shared: Arc<LinkShared>, mut down_rx: mpsc::UnboundedReceiver<ConnDown>) {
    while let Some(downed) = down_rx.recv().await {
        let mut active = shared.active.lock().await;
        let is_current = active.as_ref().map_or(false, |c| c.seq() == downed.seq);
        if !is_current {
            debug!(seq = downed.seq, "death notice from a replaced connection");
            continue;
        }
        *active = None;
        drop(active);
        warn!(seq = downed.seq, reason = %downed.reason, "messaging link lost");
        shared.state.send_replace(LinkState::Disconnected);
        let _ = shared.events.send(LinkEvent::Disconnected {
            reason: downed.reason,
        });
    }
}

async fn revive_subscriptions(conn: &Conn, registry: &Registry) {
    let entries: Vec<(String, String)> = {
        let registry = registry.read().await;
        registry
            .iter()
            .map(|(id, entry)| (id.clone(), entry.destination.clone()))
            .collect()
    };
    for (sub_id, destination) in entries {
        info!(subscription = %sub_id, destination = %destination, "re-subscribing after reconnect");
        if let Err(e) = conn.send_frame(&subscribe_frame(&sub_id, &destination)).await {
            warn!(error = %e, subscription = %sub_id, "re-subscribe failed");
        }
    }
}

fn subscribe_frame(sub_id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", sub_id)
        .header("destination", destination)
}

/// Handle to one registered subscription.
///
/// A live handle deregisters (and best-effort UNSUBSCRIBEs) on
/// [`release`](Self::release) or on drop. An inert handle, returned when
/// subscribing on a downed link, never delivers and releasing it does
/// nothing.
pub struct SubscriptionHandle {
    sub_id: Option<String>,
    destination: String,
    shared: Weak<LinkShared>,
    released: AtomicBool,
}

impl SubscriptionHandle {
    fn live(sub_id: String, destination: &str, shared: Weak<LinkShared>) -> Self {
        Self {
            sub_id: Some(sub_id),
            destination: destination.to_string(),
            shared,
            released: AtomicBool::new(false),
        }
    }

    fn inert(destination: &str) -> Self {
        Self {
            sub_id: None,
            destination: destination.to_string(),
            shared: Weak::new(),
            released: AtomicBool::new(true),
        }
    }

    /// Delivery can occur on this handle
    pub fn is_live(&self) -> bool {
        self.sub_id.is_some()
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Deregister and send UNSUBSCRIBE if the link is up. Idempotent; a
    /// pure no-op on an inert handle.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(sub_id) = self.sub_id.as_ref() else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.registry.write().await.remove(sub_id);
        let active = shared.active.lock().await;
        if let Some(conn) = active.as_ref().filter(|c| c.is_alive()) {
            let frame = Frame::new(Command::Unsubscribe).header("id", sub_id);
            if let Err(e) = conn.send_frame(&frame).await {
                debug!(error = %e, "UNSUBSCRIBE send failed");
            }
        }
        debug!(subscription = %sub_id, destination = %self.destination, "subscription released");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let Some(sub_id) = self.sub_id.take() else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Finish the release off-handle; outside a runtime there is no
        // connection to clean up anyway.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                shared.registry.write().await.remove(&sub_id);
                let active = shared.active.lock().await;
                if let Some(conn) = active.as_ref().filter(|c| c.is_alive()) {
                    let frame = Frame::new(Command::Unsubscribe).header("id", &sub_id);
                    let _ = conn.send_frame(&frame).await;
                }
            });
        }
    }
}

/// Drive the link from the observed auth state.
///
/// Authenticated means connected: the supervisor connects with the stored
/// token, replaces a connection whose token went stale, and after an
/// involuntary drop retries on a fixed delay, re-reading the current token
/// each cycle. Anything other than authenticated means disconnected.
pub fn spawn_supervisor(
    link: Arc<MessagingLink>,
    mut auth: watch::Receiver<AuthState>,
    store: Arc<dyn TokenStore>,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    let mut link_state = link.watch_state();
    tokio::spawn(async move {
        debug!("link supervisor started");
        loop {
            if auth.borrow().is_authenticated() {
                match store.access_token() {
                    Some(token) if !token.is_empty() => {
                        let stale = link
                            .connected_bearer()
                            .await
                            .map_or(false, |bearer| bearer != token);
                        if stale {
                            info!("connection token went stale, reconnecting");
                            link.disconnect().await;
                        }
                        if link.state() != LinkState::Connected {
                            if let Err(e) = link.connect(&token).await {
                                warn!(
                                    error = %e,
                                    delay = ?reconnect_delay,
                                    "connect failed, retrying after delay"
                                );
                                tokio::time::sleep(reconnect_delay).await;
                                continue;
                            }
                        }
                    }
                    _ => {
                        // Authenticated without a stored token reads as
                        // signed out from here.
                        link.disconnect().await;
                    }
                }
            } else {
                link.disconnect().await;
            }

            // Wake on an auth transition or on the link changing state.
            tokio::select! {
                changed = auth.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = link_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let dropped = *link_state.borrow() == LinkState::Disconnected;
                    if dropped && auth.borrow().is_authenticated() {
                        info!(delay = ?reconnect_delay, "link down, reconnecting after delay");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
        debug!("link supervisor ended");
    })
}
