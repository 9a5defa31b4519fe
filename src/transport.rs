//! HTTP transport for the monitoring API

use crate::errors::{DashboardError, Result};
use crate::models::{AddSiteRequest, AddedSite, MetricPoint, Period, SiteRecord};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a site lookup. A 404 is a legitimate answer, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Found(SiteRecord),
    NotFound,
}

/// Undecoded response, for callers that interpret bodies themselves
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
    }
}

/// The backend surface consumed by the dashboard
#[async_trait]
pub trait SiteApi: Send + Sync {
    /// `GET /api/sites/monitored`
    async fn fetch_roster(&self) -> Result<Vec<SiteRecord>>;

    /// `GET /api/sites/{id}/metrics?period=`
    async fn fetch_metrics(&self, site_id: i64, period: Period) -> Result<Vec<MetricPoint>>;

    /// `GET /api/sites/search?url=` with an already normalized URL
    async fn search(&self, normalized_url: &str) -> Result<SearchOutcome>;

    /// `POST /api/sites/add`
    async fn add_site(&self, request: &AddSiteRequest) -> Result<AddedSite>;

    /// `POST /api/sites/analyze-logs/{id}`
    async fn analyze(&self, site_id: i64) -> Result<RawResponse>;
}

/// reqwest-backed implementation of [`SiteApi`]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("sitewatch/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(DashboardError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: http_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/sites{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| DashboardError::Transport("Request timeout".to_string()))?
            .map_err(DashboardError::Http)
    }

    /// Decode a 2xx JSON body or turn the response into a `Status` error
    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await.map_err(DashboardError::Http)?;
            return Ok(serde_json::from_str(&body)?);
        }

        Err(status_error(response).await)
    }
}

#[async_trait]
impl SiteApi for HttpTransport {
    async fn fetch_roster(&self) -> Result<Vec<SiteRecord>> {
        let url = self.endpoint("/monitored");
        debug!("Fetching site roster from {}", url);

        let response = self.send(self.client.get(&url)).await?;
        let sites: Vec<SiteRecord> = self.decode(response).await?;

        debug!("Received {} sites", sites.len());
        Ok(sites)
    }

    async fn fetch_metrics(&self, site_id: i64, period: Period) -> Result<Vec<MetricPoint>> {
        let url = self.endpoint(&format!("/{}/metrics", site_id));
        debug!("Fetching metrics for site {} ({})", site_id, period);

        let response = self
            .send(self.client.get(&url).query(&[("period", period.as_str())]))
            .await?;

        self.decode(response).await
    }

    async fn search(&self, normalized_url: &str) -> Result<SearchOutcome> {
        let url = self.endpoint("/search");
        debug!("Looking up {}", normalized_url);

        let response = self
            .send(self.client.get(&url).query(&[("url", normalized_url)]))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SearchOutcome::NotFound);
        }

        self.decode(response).await.map(SearchOutcome::Found)
    }

    async fn add_site(&self, request: &AddSiteRequest) -> Result<AddedSite> {
        let url = self.endpoint("/add");
        debug!("Registering {} as '{}'", request.url, request.name);

        let response = self.send(self.client.post(&url).json(request)).await?;
        self.decode(response).await
    }

    async fn analyze(&self, site_id: i64) -> Result<RawResponse> {
        let url = self.endpoint(&format!("/analyze-logs/{}", site_id));
        debug!("Requesting log analysis for site {}", site_id);

        let response = self.send(self.client.post(&url)).await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(DashboardError::Http)?;

        if !status.is_success() {
            warn!("Analysis for site {} returned {}", site_id, status);
        }

        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status_text(status),
            content_type,
            body,
        })
    }
}

/// Canonical reason phrase, or the bare code when there is none
pub fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string())
}

/// Human-readable detail for a failed call: the JSON `detail` field when
/// present, else the status text.
pub fn error_detail(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| match &json["detail"] {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .unwrap_or_else(|| status_text(status))
}

async fn status_error(response: Response) -> DashboardError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    DashboardError::Status {
        status: status.as_u16(),
        message: error_detail(status, &body),
    }
}
