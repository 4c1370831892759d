//! Sync server transport
//!
//! [`SyncTransport`] is the seam the orchestrator talks through.
//! [`HttpTransport`] implements it over the REST endpoints with a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::message::{BatchResponse, DeltaRequest, DeltaResponse};
use crate::error::{SyncError, SyncResult};

const BATCH_PATH: &str = "/api/sync/batch";
const DELTA_PATH: &str = "/api/sync/delta";

/// Serialized batch body, compressed or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Json(Vec<u8>),
    /// Gzip of the JSON body, sent with `Content-Encoding: gzip`
    Gzip(Vec<u8>),
}

impl RequestBody {
    pub fn len(&self) -> usize {
        match self {
            RequestBody::Json(bytes) | RequestBody::Gzip(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, RequestBody::Gzip(_))
    }
}

/// Client side of the sync endpoints
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// `POST /api/sync/batch`
    async fn upload_batch(&self, body: &RequestBody) -> SyncResult<BatchResponse>;

    /// `GET /api/sync/delta`
    async fn fetch_delta(&self, request: &DeltaRequest) -> SyncResult<DeltaResponse>;
}

/// REST transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(server_url: &str, auth_token: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("shopsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
            auth_token,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send_error(&self, error: reqwest::Error) -> SyncError {
        if error.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Network(error.to_string())
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let response = check_status(response).await?;
        let text = response
            .text()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read response: {}", e)))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// `Retry-After` in seconds; HTTP dates are not honored
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let hint = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    debug!("Sync server returned {}: {}", status, body);
    Err(SyncError::from_status(status.as_u16(), body, hint))
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn upload_batch(&self, body: &RequestBody) -> SyncResult<BatchResponse> {
        let request = self
            .client
            .post(self.url(BATCH_PATH))
            .header(CONTENT_TYPE, "application/json");
        let request = match body {
            RequestBody::Json(bytes) => request.body(bytes.clone()),
            RequestBody::Gzip(bytes) => request.header(CONTENT_ENCODING, "gzip").body(bytes.clone()),
        };
        self.send(request).await
    }

    async fn fetch_delta(&self, request: &DeltaRequest) -> SyncResult<DeltaResponse> {
        let request = self
            .client
            .get(self.url(DELTA_PATH))
            .query(&request.query_pairs());
        self.send(request).await
    }
}
