//! HTTP fetcher for review pages
//!
//! - User-Agent rotation
//! - Request cap per worker with governor
//! - Charset detection from the Content-Type header via encoding_rs
//!
//! Failed fetches are not retried here. The crawl for the target aborts and
//! the job is redelivered, resuming from the last checkpoint.

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use rand::seq::SliceRandom;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT},
    Client, Response,
};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::PaginationConfig;

/// Pool of realistic User-Agent strings for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

/// Errors that can occur while fetching a page
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status code
    #[error("Unexpected status: {0}")]
    Status(u16),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Content decoding error
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether redelivering the job later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout | Self::Decode(_) => true,
            Self::Status(code) => matches!(code, 403 | 408 | 429 | 500..=599),
            Self::InvalidUrl(_) => false,
        }
    }
}

/// Source of raw review pages
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch one page, returning its decoded body
    async fn fetch(&self, url: &Url, locale: &str) -> Result<String, FetchError>;
}

/// [`PageFetcher`] over reqwest
pub struct ReviewFetcher {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ReviewFetcher {
    /// Create a fetcher allowing `requests_per_minute` requests
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new(requests_per_minute: u32, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .cookie_store(true)
            .build()?;

        let rate = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_minute(rate));

        Ok(Self {
            client,
            rate_limiter,
        })
    }

    pub fn from_config(config: &PaginationConfig) -> Result<Self, FetchError> {
        Self::new(config.requests_per_minute, config.request_timeout())
    }

    async fn decode_response(response: Response) -> Result<String, FetchError> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();

        let bytes = response.bytes().await?;
        decode_bytes(&bytes, &content_type)
    }

    fn build_headers(locale: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
        );
        if let Ok(language) = HeaderValue::from_str(&format!("{locale},en;q=0.7")) {
            headers.insert(ACCEPT_LANGUAGE, language);
        }
        headers
    }
}

#[async_trait]
impl PageFetcher for ReviewFetcher {
    async fn fetch(&self, url: &Url, locale: &str) -> Result<String, FetchError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(url.clone())
            .headers(Self::build_headers(locale))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        Self::decode_response(response).await
    }
}

/// Decode a body using the charset named in `content_type`, UTF-8 otherwise
pub fn decode_bytes(bytes: &[u8], content_type: &str) -> Result<String, FetchError> {
    let encoding = content_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("charset="))
        .find_map(|label| Encoding::for_label(label.trim_matches('"').as_bytes()))
        .unwrap_or(UTF_8);

    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(FetchError::Decode(format!(
            "invalid {} content",
            encoding.name()
        )));
    }
    Ok(text.into_owned())
}

fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_user_agent_rotation() {
        let mut agents = HashSet::new();
        for _ in 0..100 {
            let agent = random_user_agent();
            assert!(USER_AGENTS.contains(&agent));
            agents.insert(agent);
        }
        assert!(agents.len() > 1, "User agents should rotate");
    }

    #[test]
    fn test_decode_utf8_default() {
        let text = "Muy buena atención, volveré";
        assert_eq!(decode_bytes(text.as_bytes(), "text/html").unwrap(), text);
    }

    #[test]
    fn test_decode_declared_charset() {
        // "atención" in ISO-8859-1
        let latin1: &[u8] = &[0x61, 0x74, 0x65, 0x6e, 0x63, 0x69, 0xf3, 0x6e];
        let decoded = decode_bytes(latin1, "text/html; charset=ISO-8859-1").unwrap();
        assert_eq!(decoded, "atención");
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let err = decode_bytes(&[0xff, 0xfe, 0xfd], "text/html; charset=utf-8").unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn test_headers_carry_locale() {
        let headers = ReviewFetcher::build_headers("es");
        assert!(headers.contains_key(USER_AGENT));
        assert_eq!(
            headers.get(ACCEPT_LANGUAGE).unwrap().to_str().unwrap(),
            "es,en;q=0.7"
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(FetchError::Timeout.is_recoverable());
        assert!(FetchError::Status(429).is_recoverable());
        assert!(FetchError::Status(503).is_recoverable());
        assert!(!FetchError::Status(404).is_recoverable());
        assert!(!FetchError::InvalidUrl("x".into()).is_recoverable());
    }

    #[test]
    fn test_fetcher_creation() {
        assert!(ReviewFetcher::new(30, Duration::from_secs(10)).is_ok());
        assert!(ReviewFetcher::new(0, Duration::from_secs(10)).is_ok());
        assert!(ReviewFetcher::from_config(&PaginationConfig::default()).is_ok());
    }
}
