//! Secondary id resolution through a paid maps-search API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::QuotaError;
use crate::config::QuotaConfig;
use crate::models::ResolveRequest;

/// Zoom level used for the search viewport
const SEARCH_ZOOM: &str = "15z";

#[async_trait]
pub trait SecondaryIdResolver: Send + Sync {
    /// Look up the secondary id of a place
    async fn resolve(&self, request: &ResolveRequest) -> Result<String, QuotaError>;
}

/// [`SecondaryIdResolver`] over a SerpApi-compatible endpoint
pub struct SerpApiResolver {
    client: Client,
    api_url: String,
    api_key: String,
    google_domain: String,
}

impl SerpApiResolver {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        google_domain: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, QuotaError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            google_domain: google_domain.into(),
        })
    }

    pub fn from_config(config: &QuotaConfig) -> Result<Self, QuotaError> {
        let api_key = config.api_key.clone().ok_or(QuotaError::MissingApiKey)?;
        Self::new(
            config.api_url.clone(),
            api_key,
            config.google_domain.clone(),
            config.request_timeout(),
        )
    }

    fn query(&self, request: &ResolveRequest) -> Vec<(&'static str, String)> {
        vec![
            ("api_key", self.api_key.clone()),
            ("device", "desktop".to_string()),
            ("type", "search".to_string()),
            ("engine", "google_maps".to_string()),
            ("google_domain", self.google_domain.clone()),
            ("hl", request.locale.clone()),
            (
                "ll",
                format!("@{},{},{SEARCH_ZOOM}", request.latitude, request.longitude),
            ),
            ("q", request.name.clone()),
        ]
    }
}

#[async_trait]
impl SecondaryIdResolver for SerpApiResolver {
    async fn resolve(&self, request: &ResolveRequest) -> Result<String, QuotaError> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&self.query(request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        classify_response(status, &body, &request.target_id)
    }
}

/// Turn an API response into a secondary id or a classified error
pub fn classify_response(
    status: StatusCode,
    body: &str,
    target_id: &str,
) -> Result<String, QuotaError> {
    let json: Option<Value> = serde_json::from_str(body).ok();
    let api_error = json
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(QuotaError::Exhausted(
            api_error.unwrap_or_else(|| "HTTP 429".to_string()),
        ));
    }
    if let Some(message) = api_error {
        if is_exhaustion_message(&message) {
            return Err(QuotaError::Exhausted(message));
        }
        return Err(QuotaError::Api {
            status: status.as_u16(),
            message,
        });
    }
    if !status.is_success() {
        return Err(QuotaError::Api {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }

    let json = json.ok_or_else(|| QuotaError::Api {
        status: status.as_u16(),
        message: "response is not JSON".to_string(),
    })?;

    let place = json
        .pointer("/place_results/data_id")
        .and_then(Value::as_str);
    let first_local = json
        .get("local_results")
        .and_then(Value::as_array)
        .and_then(|results| results.iter().find_map(|r| r.get("data_id")?.as_str()));

    place
        .or(first_local)
        .map(str::to_string)
        .ok_or_else(|| QuotaError::NotFound {
            target_id: target_id.to_string(),
        })
}

fn is_exhaustion_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("run out of searches") || lower.contains("ran out of searches")
}
