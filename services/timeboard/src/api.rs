//! Backend time endpoints: payload type and the query function that fetches it

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::io::HttpClient;
use crate::query::{QueryFn, QueryKey};

/// Body returned by every time endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePayload {
    /// Which backend answered
    pub api: String,
    pub current_time: String,
    /// Incremented by the backend on every request; never touched here
    pub request_count: u64,
}

/// Fetches a [`TimePayload`] for a key by GETting `<base_url><key>`
pub struct TimeQueryFn {
    base_url: reqwest::Url,
    http: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for TimeQueryFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeQueryFn")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl TimeQueryFn {
    pub fn new(base_url: &str, http: Arc<dyn HttpClient>) -> crate::Result<Self> {
        let base_url = reqwest::Url::parse(base_url).map_err(|e| {
            crate::TimeboardError::Config(format!("Invalid base_url {:?}: {}", base_url, e))
        })?;
        tracing::debug!("Created TimeQueryFn for {}", base_url);
        Ok(Self { base_url, http })
    }

    /// Resolve an endpoint path against the base URL
    pub fn url_for(&self, key: &QueryKey) -> crate::Result<String> {
        self.base_url
            .join(key.as_str())
            .map(|url| url.to_string())
            .map_err(|e| {
                crate::TimeboardError::Config(format!(
                    "Cannot resolve path {:?}: {}",
                    key.as_str(),
                    e
                ))
            })
    }
}

#[async_trait]
impl QueryFn<TimePayload> for TimeQueryFn {
    async fn fetch(&self, key: &QueryKey) -> crate::Result<TimePayload> {
        let url = self.url_for(key)?;
        let response = self.http.get(&url).await?;

        if !response.is_success() {
            tracing::debug!("Non-2xx response from {}: status={}", url, response.status);
            return Err(crate::TimeboardError::HttpStatus {
                url,
                status: response.status,
            });
        }

        let payload: TimePayload = serde_json::from_str(&response.body)
            .map_err(|e| crate::TimeboardError::Parse(e.to_string()))?;
        tracing::debug!(
            "{} answered for {}: requestCount={}",
            payload.api,
            key,
            payload.request_count
        );
        Ok(payload)
    }
}
