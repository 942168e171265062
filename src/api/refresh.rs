//! Single-flight token refresh
//!
//! Any number of requests can hit a 401 at the same moment; only one of
//! them may talk to the refresh endpoint. The gate serializes callers, and
//! the stale-token recheck after acquiring it lets late arrivals adopt the
//! outcome of the refresh that already ran instead of issuing their own.

use std::sync::Arc;

use reqwest::Method;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::http::{ApiRequest, HttpExec};
use crate::error::{ClientError, Result};
use crate::token::TokenStore;
use crate::types::TokenPair;

pub struct RefreshGate {
    store: Arc<dyn TokenStore>,
    http: Arc<dyn HttpExec>,
    refresh_url: String,
    gate: Mutex<()>,
}

impl RefreshGate {
    pub fn new(store: Arc<dyn TokenStore>, http: Arc<dyn HttpExec>, refresh_url: String) -> Self {
        Self {
            store,
            http,
            refresh_url,
            gate: Mutex::new(()),
        }
    }

    /// Produce an access token to retry with after `stale_access` was
    /// rejected. Exactly one caller performs the network refresh; everyone
    /// else observes its outcome. On failure the stored credentials are
    /// cleared before the error is returned.
    pub async fn refreshed_token(&self, stale_access: &str) -> Result<String> {
        let _held = self.gate.lock().await;

        // A caller that was queued behind a completed refresh adopts the
        // rotated token instead of refreshing again.
        if let Some(current) = self.store.access_token() {
            if current != stale_access {
                debug!("adopting token rotated by a concurrent refresh");
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.store.refresh_token() else {
            self.clear_credentials();
            return Err(ClientError::AuthExpired("no refresh token stored".into()));
        };

        info!("refreshing access token");
        let request = ApiRequest {
            method: Method::POST,
            url: self.refresh_url.clone(),
            bearer: None,
            body: Some(serde_json::json!({ "refreshToken": refresh_token })),
        };

        let response = match self.http.run(request).await {
            Ok(response) => response,
            Err(e) => {
                self.clear_credentials();
                return Err(ClientError::AuthExpired(format!(
                    "refresh request failed: {}",
                    e
                )));
            }
        };

        if !response.is_success() {
            self.clear_credentials();
            let message = super::extract_error_message(&response.body, response.status);
            return Err(ClientError::AuthExpired(format!(
                "refresh rejected ({}): {}",
                response.status, message
            )));
        }

        let pair: TokenPair = match serde_json::from_str(&response.body) {
            Ok(pair) => pair,
            Err(e) => {
                self.clear_credentials();
                return Err(ClientError::AuthExpired(format!(
                    "refresh response unreadable: {}",
                    e
                )));
            }
        };

        self.store
            .save(Some(&pair.access_token), Some(&pair.refresh_token))?;
        info!("access token refreshed");
        Ok(pair.access_token)
    }

    fn clear_credentials(&self) {
        if let Err(e) = self.store.clear() {
            warn!("failed to clear credentials after refresh failure: {}", e);
        }
    }
}
