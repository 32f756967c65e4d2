//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use resenha::crawler::{
    parse_review_json, FetchError, FixedDelay, PageFetcher, PaginationEngine, PaginationSettings,
    ParseError, ReviewParser,
};
use resenha::identity::{
    EgressHandle, EgressLauncher, IdentityError, IdentityResult, LivenessProbe,
};
use resenha::models::{CrawlRequest, Identity, ReviewBatch};
use resenha::storage::{CheckpointStore, KvPageArchive, MemoryDocumentStore, MemoryKv};

pub const REVIEW_HOST: &str = "https://www.google.{domain}";

/// Crawl job with a resolved secondary id
pub fn crawl_request(target_id: &str) -> CrawlRequest {
    CrawlRequest::new(target_id, "0x1:0x2", "Bar Pepe", "es", "es").with_priority(5)
}

/// A review page as the fake parser understands it
///
/// The token, when present, is embedded the way the live listing embeds it.
pub fn review_page(token: Option<&str>, dates: &[DateTime<Utc>]) -> String {
    let reviews: Vec<_> = dates
        .iter()
        .enumerate()
        .map(|(i, at)| json!({"reviewed_at": at.to_rfc3339(), "review": format!("review {i}")}))
        .collect();
    let token_attr = token
        .map(|t| format!(r#"<div data-next-page-token="{t}"></div>"#))
        .unwrap_or_default();
    format!(
        "<div class=\"reviews\">{token_attr}<script type=\"application/json\">{}</script></div>",
        serde_json::Value::Array(reviews)
    )
}

/// Token carried by a review listing URL
pub fn token_of(url: &Url) -> String {
    url.query_pairs()
        .find(|(k, _)| k == "async")
        .and_then(|(_, v)| {
            v.split(',')
                .find_map(|part| part.strip_prefix("next_page_token:").map(str::to_string))
        })
        .unwrap_or_default()
}

// ============================================================================
// Fetcher / Parser
// ============================================================================

/// Serves scripted responses in order and records every requested URL
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<String, FetchError>>>,
    requested: Mutex<Vec<Url>>,
}

impl ScriptedFetcher {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(pages.into_iter().map(Ok).collect()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn push_error(&self, error: FetchError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requested(&self) -> Vec<Url> {
        self.requested.lock().unwrap().clone()
    }

    pub fn requested_tokens(&self) -> Vec<String> {
        self.requested().iter().map(token_of).collect()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &Url, _locale: &str) -> Result<String, FetchError> {
        self.requested.lock().unwrap().push(url.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(FetchError::Status(404)))
    }
}

/// Reads the embedded JSON block produced by [`review_page`]
pub struct EmbeddedJsonParser;

#[async_trait]
impl ReviewParser for EmbeddedJsonParser {
    async fn parse(&self, content: &str) -> Result<ReviewBatch, ParseError> {
        let start = content
            .find("<script type=\"application/json\">")
            .ok_or_else(|| ParseError::Invalid("no review block".to_string()))?;
        let rest = &content[start + "<script type=\"application/json\">".len()..];
        let end = rest
            .find("</script>")
            .ok_or_else(|| ParseError::Invalid("unterminated review block".to_string()))?;
        parse_review_json(&rest[..end])
    }
}

// ============================================================================
// Pagination fixture
// ============================================================================

pub struct PaginationFixture {
    pub kv: Arc<MemoryKv>,
    pub archive: Arc<KvPageArchive>,
    pub documents: Arc<MemoryDocumentStore>,
    pub checkpoints: CheckpointStore,
    pub fetcher: Arc<ScriptedFetcher>,
    pub engine: PaginationEngine,
}

pub fn pagination_fixture(pages: Vec<String>) -> PaginationFixture {
    pagination_fixture_on(Arc::new(MemoryKv::new()), pages)
}

/// Engine over an existing key-value store, for resume scenarios
pub fn pagination_fixture_on(kv: Arc<MemoryKv>, pages: Vec<String>) -> PaginationFixture {
    let archive = Arc::new(KvPageArchive::new(kv.clone(), Duration::from_secs(3600)));
    let documents = Arc::new(MemoryDocumentStore::new());
    let checkpoints = CheckpointStore::new(kv.clone(), Duration::from_secs(3600));
    let fetcher = Arc::new(ScriptedFetcher::new(pages));

    let engine = PaginationEngine::new(
        fetcher.clone(),
        Arc::new(EmbeddedJsonParser),
        archive.clone(),
        documents.clone(),
        checkpoints.clone(),
        Arc::new(FixedDelay(Duration::ZERO)),
        PaginationSettings {
            review_host: REVIEW_HOST.to_string(),
            page_ceiling_min: 70,
            page_ceiling_max: 100,
            max_age: chrono::Duration::days(365),
        },
    );

    PaginationFixture {
        kv,
        archive,
        documents,
        checkpoints,
        fetcher,
        engine,
    }
}

// ============================================================================
// Identity fakes
// ============================================================================

/// Launcher that always starts, counting calls
#[derive(Default)]
pub struct FakeLauncher {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

#[async_trait]
impl EgressLauncher for FakeLauncher {
    async fn start(&self, identity: &Identity) -> IdentityResult<EgressHandle> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(EgressHandle {
            identity_name: identity.name.clone(),
            pid: Some(4000 + n as u32),
        })
    }

    async fn stop(&self, _handle: &EgressHandle) -> IdentityResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self, _handle: &EgressHandle) -> bool {
        true
    }
}

/// Probe whose health can be switched
pub struct FakeProbe {
    pub healthy: AtomicBool,
}

impl FakeProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }
}

#[async_trait]
impl LivenessProbe for FakeProbe {
    async fn check(&self) -> IdentityResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IdentityError::probe("unreachable"))
        }
    }
}
