//! ChatVerse REST API client
//!
//! Every authorized call goes through one path: attach the stored bearer
//! token, and on a 401 run a single-flight refresh then retry the request
//! exactly once. Callers never see the refresh; they see the final outcome.
//!
//! Server error bodies carry their message as `{"error": {"message": ...}}`
//! or `{"message": ...}`; that text is surfaced verbatim.

pub mod http;
pub mod refresh;

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::token::TokenStore;
use crate::types::{
    AuthOutcome, ChatMessage, Contact, ContactRequest, OutboundMessage, RequestDirection,
    RequestStatus, UserProfile,
};

use http::{ApiRequest, ApiResponse, HttpExec, ReqwestExec};
use refresh::RefreshGate;

/// REST client for the ChatVerse API
pub struct ChatApi {
    api_base: String,
    store: Arc<dyn TokenStore>,
    http: Arc<dyn HttpExec>,
    refresh: RefreshGate,
}

impl ChatApi {
    /// Create a client backed by a shared reqwest executor
    pub fn new(config: &ClientConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        let http: Arc<dyn HttpExec> = Arc::new(ReqwestExec::new(config.request_timeout)?);
        Ok(Self::with_exec(config, store, http))
    }

    /// Create a client over a custom executor (tests, instrumentation)
    pub fn with_exec(
        config: &ClientConfig,
        store: Arc<dyn TokenStore>,
        http: Arc<dyn HttpExec>,
    ) -> Self {
        let api_base = config.api_base();
        let refresh = RefreshGate::new(
            Arc::clone(&store),
            Arc::clone(&http),
            format!("{}/users/refresh-token", api_base),
        );
        Self {
            api_base,
            store,
            http,
            refresh,
        }
    }

    // ==================== Request plumbing ====================

    /// Request without credentials (login and refresh endpoints)
    async fn anonymous(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        let request = ApiRequest {
            method,
            url: format!("{}{}", self.api_base, path),
            bearer: None,
            body,
        };
        self.http.run(request).await
    }

    /// Request with the stored bearer token and transparent refresh-retry.
    ///
    /// The retry happens at most once; a 401 on the retried request means
    /// the session is over.
    async fn authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", self.api_base, path);
        let bearer = self.store.access_token();
        let first = ApiRequest {
            method: method.clone(),
            url: url.clone(),
            bearer: bearer.clone(),
            body: body.clone(),
        };

        let response = self.http.run(first).await?;
        if response.status != 401 {
            return Ok(response);
        }

        let stale = bearer.unwrap_or_default();
        let fresh = self.refresh.refreshed_token(&stale).await?;

        debug!(path = %path, "retrying request with refreshed token");
        let retry = ApiRequest {
            method,
            url,
            bearer: Some(fresh),
            body,
        };
        let response = self.http.run(retry).await?;
        if response.status == 401 {
            return Err(ClientError::AuthExpired(
                "request still unauthorized after token refresh".into(),
            ));
        }
        Ok(response)
    }

    // ==================== Auth API ====================

    /// Ask the server to text an auth code to `phone`
    pub async fn send_auth_code(&self, phone: &str) -> Result<()> {
        let body = serde_json::json!({ "phone": phone });
        let response = self
            .anonymous(Method::POST, "/users/send-auth-code", Some(body))
            .await?;
        accept(response)
    }

    /// Exchange a phone/code pair for tokens and a user id.
    ///
    /// Nothing is persisted here; the session layer owns that policy.
    pub async fn verify_auth_code(&self, phone: &str, code: &str) -> Result<AuthOutcome> {
        let body = serde_json::json!({ "phone": phone, "code": code });
        let response = self
            .anonymous(Method::POST, "/users/check-auth-code", Some(body))
            .await?;
        parse(response)
    }

    /// Resolve the profile behind the stored token.
    ///
    /// An authentication failure that survives the refresh path means
    /// "no user", not an error; every other failure propagates.
    pub async fn current_user(&self) -> Result<Option<UserProfile>> {
        let response = match self.authorized(Method::GET, "/users/me", None).await {
            Ok(response) => response,
            Err(ClientError::AuthExpired(reason)) => {
                debug!(reason = %reason, "profile fetch found no live session");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if response.status == 401 || response.status == 403 {
            return Ok(None);
        }
        Ok(Some(parse(response)?))
    }

    // ==================== Contacts API ====================

    /// Fetch the contact list
    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        let response = self.authorized(Method::GET, "/contacts", None).await?;
        parse(response)
    }

    /// Fetch pending contact requests for one direction
    pub async fn pending_requests(
        &self,
        direction: RequestDirection,
    ) -> Result<Vec<ContactRequest>> {
        let path = format!("/contacts/requests/pending?direction={}", direction.as_str());
        let response = self.authorized(Method::GET, &path, None).await?;
        parse(response)
    }

    /// Ask another user to become a contact
    pub async fn send_contact_request(&self, target_user_id: i64) -> Result<()> {
        let body = serde_json::json!({ "targetUserId": target_user_id });
        let response = self
            .authorized(Method::POST, "/contacts/requests", Some(body))
            .await?;
        accept(response)
    }

    /// Accept or decline a request from `requester_id`
    pub async fn respond_contact_request(
        &self,
        requester_id: i64,
        status: RequestStatus,
    ) -> Result<()> {
        let body = serde_json::json!({ "newStatus": status });
        let path = format!("/contacts/requests/{}", requester_id);
        let response = self.authorized(Method::PUT, &path, Some(body)).await?;
        accept(response)
    }

    /// Drop a contact
    pub async fn remove_contact(&self, contact_user_id: i64) -> Result<()> {
        let path = format!("/contacts/{}", contact_user_id);
        let response = self.authorized(Method::DELETE, &path, None).await?;
        accept(response)
    }

    // ==================== Messages API ====================

    /// Fetch the message history for a conversation room.
    ///
    /// Accepts both server shapes: a bare array, or a page object with a
    /// `content` array.
    pub async fn chat_history(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        if room_id.is_empty() {
            return Err(ClientError::Validation("room id is required".into()));
        }
        let path = format!("/chat/messages/{}", room_id);
        let response = self.authorized(Method::GET, &path, None).await?;
        if !response.is_success() {
            return Err(api_error(response));
        }
        let payload: HistoryPayload = serde_json::from_str(&response.body)?;
        Ok(payload.into_messages())
    }

    /// Send a message over REST instead of the messaging link
    pub async fn send_message(&self, recipient_id: i64, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(ClientError::Validation("message content is empty".into()));
        }
        let body = serde_json::to_value(OutboundMessage {
            recipient_id,
            content: content.to_string(),
        })?;
        let response = self
            .authorized(Method::POST, "/chat/messages", Some(body))
            .await?;
        accept(response)
    }
}

// ==================== Response handling ====================

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    Items(Vec<ChatMessage>),
    Page { content: Vec<ChatMessage> },
}

impl HistoryPayload {
    fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            HistoryPayload::Items(items) => items,
            HistoryPayload::Page { content } => content,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Server error message, verbatim: nested `error.message` first, then
/// top-level `message`, then the raw body.
pub(crate) fn extract_error_message(body: &str, status: u16) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.and_then(|e| e.message) {
            return message;
        }
        if let Some(message) = parsed.message {
            return message;
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        body.to_string()
    }
}

fn api_error(response: ApiResponse) -> ClientError {
    ClientError::Api {
        status: response.status,
        message: extract_error_message(&response.body, response.status),
    }
}

fn parse<T: DeserializeOwned>(response: ApiResponse) -> Result<T> {
    if !response.is_success() {
        return Err(api_error(response));
    }
    Ok(serde_json::from_str(&response.body)?)
}

fn accept(response: ApiResponse) -> Result<()> {
    if !response.is_success() {
        return Err(api_error(response));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryTokenStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_config() -> ClientConfig {
        ClientConfig {
            base_url: "http://test.local".to_string(),
            ..Default::default()
        }
    }

    fn ok_json(value: serde_json::Value) -> ApiResponse {
        ApiResponse {
            status: 200,
            body: value.to_string(),
        }
    }

    /// Executor that rejects every bearer except one, and rotates tokens
    /// through the refresh endpoint.
    struct ScriptedExec {
        accept_bearer: &'static str,
        refresh_ok: bool,
        refresh_calls: AtomicUsize,
        data_calls: AtomicUsize,
    }

    impl ScriptedExec {
        fn new(accept_bearer: &'static str, refresh_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                accept_bearer,
                refresh_ok,
                refresh_calls: AtomicUsize::new(0),
                data_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HttpExec for ScriptedExec {
        async fn run(&self, request: ApiRequest) -> crate::error::Result<ApiResponse> {
            if request.url.ends_with("/users/refresh-token") {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                return if self.refresh_ok {
                    Ok(ok_json(
                        serde_json::json!({ "accessToken": "a2", "refreshToken": "r2" }),
                    ))
                } else {
                    Ok(ApiResponse {
                        status: 403,
                        body: serde_json::json!({ "message": "refresh token revoked" })
                            .to_string(),
                    })
                };
            }

            self.data_calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent callers all issue their first attempt
            // before any of them observes the 401.
            tokio::time::sleep(Duration::from_millis(5)).await;
            match request.bearer.as_deref() {
                Some(bearer) if bearer == self.accept_bearer => {
                    Ok(ok_json(serde_json::json!([])))
                }
                _ => Ok(ApiResponse {
                    status: 401,
                    body: String::new(),
                }),
            }
        }
    }

    /// Executor that answers every request the same way, recording them
    struct FixedExec {
        status: u16,
        body: String,
        log: Mutex<Vec<ApiRequest>>,
    }

    impl FixedExec {
        fn new(status: u16, body: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_string(),
                log: Mutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> ApiRequest {
            self.log.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpExec for FixedExec {
        async fn run(&self, request: ApiRequest) -> crate::error::Result<ApiResponse> {
            self.log.lock().unwrap().push(request);
            Ok(ApiResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    // ==================== Authorized execution ====================

    #[tokio::test]
    async fn test_bearer_attached_when_token_stored() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(200, serde_json::json!([]));
        let api = ChatApi::with_exec(&test_config(), store, exec.clone());

        api.contacts().await.unwrap();
        let request = exec.last_request();
        assert_eq!(request.bearer.as_deref(), Some("a1"));
        assert_eq!(request.url, "http://test.local/api/v1/contacts");
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_requests_share_one_refresh() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = ScriptedExec::new("a2", true);
        let api = ChatApi::with_exec(&test_config(), store.clone(), exec.clone());

        let (r1, r2, r3) = tokio::join!(api.contacts(), api.contacts(), api.contacts());
        assert!(r1.is_ok() && r2.is_ok() && r3.is_ok(), "all callers succeed");

        assert_eq!(
            exec.refresh_calls.load(Ordering::SeqCst),
            1,
            "exactly one refresh call for three concurrent 401s"
        );
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r2"));
        // Three first attempts plus three retries
        assert_eq!(exec.data_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_credentials() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = ScriptedExec::new("a2", false);
        let api = ChatApi::with_exec(&test_config(), store.clone(), exec.clone());

        let err = api.contacts().await.unwrap_err();
        assert!(
            matches!(err, ClientError::AuthExpired(_)),
            "got {:?}",
            err
        );
        assert!(store.access_token().is_none(), "credentials cleared");
        assert!(store.refresh_token().is_none());
        assert_eq!(exec.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_second_refresh_when_retry_still_unauthorized() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        // Server never accepts any bearer: the retry 401s too.
        let exec = ScriptedExec::new("nobody", true);
        let api = ChatApi::with_exec(&test_config(), store.clone(), exec.clone());

        let err = api.contacts().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthExpired(_)));
        assert_eq!(
            exec.refresh_calls.load(Ordering::SeqCst),
            1,
            "the retry's 401 must not trigger another refresh"
        );
        assert_eq!(exec.data_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network_refresh() {
        let store = Arc::new(MemoryTokenStore::new());
        store.save(Some("a1"), None).unwrap();
        let exec = ScriptedExec::new("a2", true);
        let api = ChatApi::with_exec(&test_config(), store.clone(), exec.clone());

        let err = api.contacts().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthExpired(_)));
        assert_eq!(exec.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(store.access_token().is_none(), "credentials cleared");
    }

    // ==================== Profile resolution ====================

    #[tokio::test]
    async fn test_current_user_parses_profile() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(200, serde_json::json!({ "id": 7, "username": "ann" }));
        let api = ChatApi::with_exec(&test_config(), store, exec);

        let profile = api.current_user().await.unwrap().unwrap();
        assert_eq!(profile.id, 7);
        assert_eq!(profile.username, "ann");
    }

    #[tokio::test]
    async fn test_current_user_resolves_forbidden_to_none() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(403, serde_json::json!({ "message": "forbidden" }));
        let api = ChatApi::with_exec(&test_config(), store, exec);

        assert!(api.current_user().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_current_user_resolves_dead_session_to_none() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = ScriptedExec::new("a2", false);
        let api = ChatApi::with_exec(&test_config(), store.clone(), exec);

        // 401, refresh rejected: no user, credentials gone, no error.
        assert!(api.current_user().await.unwrap().is_none());
        assert!(store.access_token().is_none());
    }

    // ==================== Endpoint shapes ====================

    #[tokio::test]
    async fn test_send_auth_code_is_anonymous() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(201, serde_json::json!({ "success": true }));
        let api = ChatApi::with_exec(&test_config(), store, exec.clone());

        api.send_auth_code("+15550001").await.unwrap();
        let request = exec.last_request();
        assert!(request.bearer.is_none(), "login endpoints carry no bearer");
        assert_eq!(request.body.unwrap()["phone"], "+15550001");
    }

    #[tokio::test]
    async fn test_verify_auth_code_returns_outcome() {
        let store = Arc::new(MemoryTokenStore::new());
        let exec = FixedExec::new(
            200,
            serde_json::json!({
                "accessToken": "a1",
                "refreshToken": "r1",
                "userId": 7,
                "username": "ann",
                "userExists": true
            }),
        );
        let api = ChatApi::with_exec(&test_config(), store.clone(), exec);

        let outcome = api.verify_auth_code("+15550001", "1234").await.unwrap();
        assert_eq!(outcome.user_id, 7);
        assert_eq!(outcome.access_token, "a1");
        // Persisting the pair is the session layer's job, not this one's.
        assert!(store.access_token().is_none());
    }

    #[tokio::test]
    async fn test_respond_contact_request_sends_status() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(200, serde_json::json!({}));
        let api = ChatApi::with_exec(&test_config(), store, exec.clone());

        api.respond_contact_request(12, RequestStatus::Accepted)
            .await
            .unwrap();
        let request = exec.last_request();
        assert_eq!(
            request.url,
            "http://test.local/api/v1/contacts/requests/12"
        );
        assert_eq!(request.body.unwrap()["newStatus"], "ACCEPTED");
    }

    #[tokio::test]
    async fn test_chat_history_accepts_bare_array() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(
            200,
            serde_json::json!([{
                "messageId": 1,
                "senderId": 7,
                "recipientId": 9,
                "content": "hi",
                "timestamp": "2025-04-01T12:00:00Z"
            }]),
        );
        let api = ChatApi::with_exec(&test_config(), store, exec);

        let history = api.chat_history("7_9").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 1);
    }

    #[tokio::test]
    async fn test_chat_history_accepts_page_object() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(
            200,
            serde_json::json!({ "content": [{
                "messageId": 2,
                "senderId": 9,
                "recipientId": 7,
                "content": "yo",
                "timestamp": "2025-04-01T12:01:00Z"
            }]}),
        );
        let api = ChatApi::with_exec(&test_config(), store, exec);

        let history = api.chat_history("7_9").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 2);
    }

    #[tokio::test]
    async fn test_api_error_surfaces_server_message() {
        let store = Arc::new(MemoryTokenStore::with_tokens("a1", "r1"));
        let exec = FixedExec::new(
            409,
            serde_json::json!({ "error": { "message": "already contacts" } }),
        );
        let api = ChatApi::with_exec(&test_config(), store, exec);

        let err = api.send_contact_request(9).await.unwrap_err();
        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "already contacts");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    // ==================== Error message extraction ====================

    #[test]
    fn test_error_message_prefers_nested_error() {
        let body = r#"{"error": {"message": "inner"}, "message": "outer"}"#;
        assert_eq!(extract_error_message(body, 400), "inner");
    }

    #[test]
    fn test_error_message_falls_back_to_top_level() {
        let body = r#"{"message": "outer"}"#;
        assert_eq!(extract_error_message(body, 400), "outer");
    }

    #[test]
    fn test_error_message_falls_back_to_raw_body() {
        assert_eq!(extract_error_message("gateway exploded", 502), "gateway exploded");
        assert_eq!(extract_error_message("", 502), "HTTP 502");
    }
}
