//! HTTP execution seam
//!
//! The authorized executor in `api` is written against this trait so its
//! retry and refresh behavior can be driven in tests without sockets.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;

/// One HTTP request, fully described before execution
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    /// Access token for the `Authorization: Bearer` header, when present
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

/// Raw outcome of a request; interpretation happens above the seam
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes one HTTP request
#[async_trait]
pub trait HttpExec: Send + Sync {
    async fn run(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// Production executor over a shared reqwest client
pub struct ReqwestExec {
    client: reqwest::Client,
}

impl ReqwestExec {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExec for ReqwestExec {
    async fn run(&self, request: ApiRequest) -> Result<ApiResponse> {
        let mut builder = self.client.request(request.method, &request.url);
        if let Some(ref bearer) = request.bearer {
            builder = builder.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", bearer),
            );
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(ApiResponse { status, body })
    }
}
