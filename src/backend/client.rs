use crate::backend::sse::{SseDecoder, SseMessage};
use crate::backend::types::RebalanceResponse;
use crate::core::AppError;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

pub type ProgressStream = BoxStream<'static, Result<SseMessage, AppError>>;

/// The two backend capabilities a rebalance session needs.
///
/// Implemented over HTTP by [`BackendClient`]; tests plug in scripted fakes.
#[async_trait]
pub trait RebalanceBackend: Send + Sync + 'static {
    /// Ask the backend to run this month's rebalance. Resolves when the
    /// backend has finished (or refused) the whole operation.
    async fn trigger_rebalance(&self) -> Result<RebalanceResponse, AppError>;

    /// Subscribe to the backend's rebalance progress stream.
    async fn open_progress(&self) -> Result<ProgressStream, AppError>;
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl RebalanceBackend for BackendClient {
    async fn trigger_rebalance(&self) -> Result<RebalanceResponse, AppError> {
        let resp = self.http.post(self.url("/trading/rebalance")).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(AppError::Backend(format!("HTTP {status}: {text}")));
        }
        if text.trim().is_empty() {
            // 2xx with no body: nothing to map, every field takes its default.
            return Ok(RebalanceResponse::default());
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn open_progress(&self) -> Result<ProgressStream, AppError> {
        let resp = self
            .http
            .get(self.url("/trading/rebalance/progress"))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!("HTTP {status}: {text}")));
        }
        debug!(status = %status, "progress stream connected");

        let mut decoder = SseDecoder::new();
        let events = resp.bytes_stream().flat_map(move |chunk| {
            let items: Vec<Result<SseMessage, AppError>> = match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(AppError::Http(e))],
            };
            stream::iter(items)
        });
        Ok(events.boxed())
    }
}
