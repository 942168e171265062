//! Client configuration

use std::time::Duration;

use url::Url;

use crate::error::{ClientError, Result};

/// Client configuration
///
/// The messaging endpoint is derived from `base_url` (`http` becomes `ws`,
/// `https` becomes `wss`, path `/ws`) unless `ws_url` overrides it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the ChatVerse server (no trailing path)
    pub base_url: String,
    /// Explicit WebSocket endpoint; overrides derivation from `base_url`
    pub ws_url: Option<String>,
    /// Delay between reconnect attempts while authenticated (default: 5s)
    pub reconnect_delay: Duration,
    /// Outgoing heartbeat interval offered at the handshake (default: 20s)
    pub heartbeat_outgoing: Duration,
    /// Expected incoming heartbeat interval (default: 30s)
    pub heartbeat_incoming: Duration,
    /// HTTP request timeout (default: 30s)
    pub request_timeout: Duration,
    /// Bound on the WebSocket connect + handshake (default: 10s)
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://chatverse.local:8888".to_string(),
            ws_url: None,
            reconnect_delay: Duration::from_secs(5),
            heartbeat_outgoing: Duration::from_secs(20),
            heartbeat_incoming: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// REST API root, versioned
    pub fn api_base(&self) -> String {
        format!("{}/api/v1", self.base_url.trim_end_matches('/'))
    }

    /// WebSocket endpoint for the messaging link
    pub fn ws_endpoint(&self) -> Result<String> {
        if let Some(ref ws) = self.ws_url {
            return Ok(ws.clone());
        }
        let base = Url::parse(&self.base_url).map_err(|e| {
            ClientError::Validation(format!("invalid base url {}: {}", self.base_url, e))
        })?;
        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        let host = base.host_str().ok_or_else(|| {
            ClientError::Validation(format!("base url {} has no host", self.base_url))
        })?;
        Ok(match base.port() {
            Some(port) => format!("{}://{}:{}/ws", scheme, host, port),
            None => format!("{}://{}/ws", scheme, host),
        })
    }

    /// Host header value for the WebSocket upgrade request
    pub fn ws_host(&self) -> Result<String> {
        let endpoint = self.ws_endpoint()?;
        let url = Url::parse(&endpoint).map_err(|e| {
            ClientError::Validation(format!("invalid ws url {}: {}", endpoint, e))
        })?;
        let host = url.host_str().ok_or_else(|| {
            ClientError::Validation(format!("ws url {} has no host", endpoint))
        })?;
        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }
}
