//! Session lifecycle: startup restore, login, logout.
//!
//! The manager is the single writer of an observable [`AuthState`]. The
//! transport supervisor and embedders react to state transitions instead of
//! being called directly; logging out tears the connection down because the
//! state changed, not because anyone told the link about it.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::api::ChatApi;
use crate::error::Result;
use crate::token::TokenStore;
use crate::types::{AuthOutcome, Identity};

/// Where the session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Nothing has been resolved yet
    Uninitialized,
    /// A stored token is being validated against the server
    Restoring,
    /// A validated identity is live
    Authenticated,
    /// No credentials, or the stored ones were rejected
    Anonymous,
}

/// Snapshot published to watchers on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub phase: AuthPhase,
    pub identity: Option<Identity>,
    pub access_token: Option<String>,
}

impl AuthState {
    fn uninitialized() -> Self {
        Self {
            phase: AuthPhase::Uninitialized,
            identity: None,
            access_token: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }
}

/// Resolves and owns the authenticated identity
pub struct SessionManager {
    api: Arc<ChatApi>,
    store: Arc<dyn TokenStore>,
    state: watch::Sender<AuthState>,
    // Serializes restore/login/logout so watchers never see interleaved
    // transitions from concurrent callers.
    transition: Mutex<()>,
}

impl SessionManager {
    pub fn new(api: Arc<ChatApi>, store: Arc<dyn TokenStore>) -> Self {
        let (state, _) = watch::channel(AuthState::uninitialized());
        Self {
            api,
            store,
            state,
            transition: Mutex::new(()),
        }
    }

    /// Resolve the session from stored credentials.
    ///
    /// With no stored access token this lands `Anonymous` without touching
    /// the network. With one, the profile endpoint decides: a profile means
    /// `Authenticated`; rejection or any failure clears the credentials and
    /// lands `Anonymous`. Never fails, and is safe to call again later.
    pub async fn restore(&self) -> AuthState {
        let _guard = self.transition.lock().await;

        if !self.store.has_access_token() {
            info!("no stored credentials, starting anonymous");
            return self.publish_anonymous();
        }

        self.publish(AuthState {
            phase: AuthPhase::Restoring,
            identity: None,
            access_token: self.store.access_token(),
        });

        match self.api.current_user().await {
            Ok(Some(profile)) => {
                info!(user_id = profile.id, username = %profile.username, "session restored");
                self.publish_authenticated(profile.into())
            }
            Ok(None) => {
                info!("stored credentials rejected, clearing");
                self.discard_credentials();
                self.publish_anonymous()
            }
            Err(e) => {
                warn!(error = %e, "session restore failed, starting anonymous");
                self.discard_credentials();
                self.publish_anonymous()
            }
        }
    }

    /// Persist a fresh auth outcome and publish the authenticated identity
    pub async fn login(&self, outcome: AuthOutcome) -> Result<Identity> {
        let _guard = self.transition.lock().await;

        self.store
            .save(Some(&outcome.access_token), outcome.refresh_token.as_deref())?;
        let identity = Identity {
            id: outcome.user_id,
            username: outcome.username.unwrap_or_default(),
        };
        info!(user_id = identity.id, "logged in");
        self.publish_authenticated(identity.clone());
        Ok(identity)
    }

    /// Drop credentials and identity; watchers observe `Anonymous`
    pub async fn logout(&self) {
        let _guard = self.transition.lock().await;
        info!("logging out");
        self.discard_credentials();
        self.publish_anonymous();
    }

    /// Identity resolved and an access token still stored
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().identity.is_some() && self.store.has_access_token()
    }

    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    // ==================== Transitions ====================

    fn publish(&self, next: AuthState) -> AuthState {
        self.state.send_replace(next.clone());
        next
    }

    fn publish_authenticated(&self, identity: Identity) -> AuthState {
        self.publish(AuthState {
            phase: AuthPhase::Authenticated,
            access_token: self.store.access_token(),
            identity: Some(identity),
        })
    }

    fn publish_anonymous(&self) -> AuthState {
        self.publish(AuthState {
            phase: AuthPhase::Anonymous,
            identity: None,
            access_token: None,
        })
    }

    fn discard_credentials(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear stored credentials");
        }
    }
}
