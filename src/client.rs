//! UI-facing client facade.
//!
//! `ChatClient` wires the API executor, session manager, messaging link,
//! and link supervisor together and exposes the operations an embedding
//! UI needs: login flow, contact management, conversation selection, and
//! sending. State flows outward through watch channels; the embedder
//! renders what it observes.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::ChatApi;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::feed::ConversationFeed;
use crate::session::{AuthState, SessionManager};
use crate::token::TokenStore;
use crate::transport::{spawn_supervisor, LinkEvent, LinkState, MessagingLink};
use crate::types::{Contact, ContactRequest, Identity, RequestDirection, RequestStatus};

pub struct ChatClient {
    api: Arc<ChatApi>,
    session: Arc<SessionManager>,
    link: Arc<MessagingLink>,
    active_feed: Mutex<Option<Arc<ConversationFeed>>>,
    supervisor: JoinHandle<()>,
}

impl ChatClient {
    /// Wire the full stack and start the link supervisor.
    ///
    /// Call inside a Tokio runtime. Nothing touches the network until
    /// [`restore`](Self::restore) or [`login`](Self::login) resolves a
    /// session; the supervisor connects the link only once the session is
    /// authenticated.
    pub fn new(config: ClientConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        let api = Arc::new(ChatApi::new(&config, Arc::clone(&store))?);
        let session = Arc::new(SessionManager::new(Arc::clone(&api), Arc::clone(&store)));
        let link = Arc::new(MessagingLink::new(&config)?);
        let supervisor = spawn_supervisor(
            Arc::clone(&link),
            session.watch(),
            Arc::clone(&store),
            config.reconnect_delay,
        );
        Ok(Self {
            api,
            session,
            link,
            active_feed: Mutex::new(None),
            supervisor,
        })
    }

    // ==================== Session ====================

    /// Resolve the session from stored credentials; see
    /// [`SessionManager::restore`]
    pub async fn restore(&self) -> AuthState {
        self.session.restore().await
    }

    /// Ask the server to text an auth code
    pub async fn request_code(&self, phone: &str) -> Result<()> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(ClientError::Validation(
                "phone number is required".to_string(),
            ));
        }
        self.api.send_auth_code(phone).await
    }

    /// Exchange the texted code for a session
    pub async fn login(&self, phone: &str, code: &str) -> Result<Identity> {
        let phone = phone.trim();
        let code = code.trim();
        if phone.is_empty() || code.is_empty() {
            return Err(ClientError::Validation(
                "phone number and code are required".to_string(),
            ));
        }
        let outcome = self.api.verify_auth_code(phone, code).await?;
        if !outcome.user_exists {
            return Err(ClientError::Validation(
                "no account for this phone number".to_string(),
            ));
        }
        self.session.login(outcome).await
    }

    /// Sign out: close the open conversation, drop credentials. The
    /// supervisor observes the transition and tears the link down.
    pub async fn logout(&self) {
        self.close_active_feed().await;
        self.session.logout().await;
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn auth_state(&self) -> AuthState {
        self.session.current()
    }

    pub fn auth_watch(&self) -> watch::Receiver<AuthState> {
        self.session.watch()
    }

    // ==================== Messaging link ====================

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.link.watch_state()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.events()
    }

    // ==================== Contacts ====================

    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        self.api.contacts().await
    }

    pub async fn pending_requests(
        &self,
        direction: RequestDirection,
    ) -> Result<Vec<ContactRequest>> {
        self.api.pending_requests(direction).await
    }

    pub async fn send_contact_request(&self, target_user_id: i64) -> Result<()> {
        self.api.send_contact_request(target_user_id).await
    }

    pub async fn respond_contact_request(
        &self,
        requester_id: i64,
        status: RequestStatus,
    ) -> Result<()> {
        self.api.respond_contact_request(requester_id, status).await
    }

    pub async fn remove_contact(&self, contact_user_id: i64) -> Result<()> {
        self.api.remove_contact(contact_user_id).await
    }

    // ==================== Conversations ====================

    /// Open the conversation with `peer_id`, closing any previous one
    /// first. Requires a signed-in session.
    pub async fn select_conversation(&self, peer_id: i64) -> Result<Arc<ConversationFeed>> {
        let me = self
            .session
            .current()
            .identity
            .ok_or_else(|| ClientError::Validation("not signed in".to_string()))?;

        let mut active = self.active_feed.lock().await;
        if let Some(previous) = active.take() {
            previous.close().await;
        }
        let feed = Arc::new(
            ConversationFeed::open(&self.api, Arc::clone(&self.link), me, peer_id).await?,
        );
        *active = Some(Arc::clone(&feed));
        Ok(feed)
    }

    pub async fn active_conversation(&self) -> Option<Arc<ConversationFeed>> {
        self.active_feed.lock().await.clone()
    }

    /// Send into the currently selected conversation
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let feed = self.active_feed.lock().await.clone();
        match feed {
            Some(feed) => feed.send(text).await,
            None => Err(ClientError::Validation(
                "no conversation selected".to_string(),
            )),
        }
    }

    pub async fn close_conversation(&self) {
        self.close_active_feed().await;
    }

    /// Stop the supervisor and drop the link
    pub async fn shutdown(&self) {
        self.close_active_feed().await;
        self.supervisor.abort();
        self.link.disconnect().await;
        info!("chat client shut down");
    }

    /// Direct access to the REST client for operations outside the facade
    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    async fn close_active_feed(&self) {
        let mut active = self.active_feed.lock().await;
        if let Some(feed) = active.take() {
            feed.close().await;
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}
