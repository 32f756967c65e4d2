//! Core data structures shared by the queue, the identity scheduler and the
//! pagination engine
//!
//! Queue messages are flat JSON documents. Each message type declares its
//! exact field set through [`WireMessage::FIELDS`]; documents carrying any
//! other shape are rejected at the queue boundary instead of being guessed at
//! further down.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Highest priority accepted by the queues
pub const MAX_PRIORITY: u8 = 10;

// ============================================================================
// Job contract
// ============================================================================

/// Errors raised when a queued document does not honor its contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Field set differs from the schema, or a field has the wrong type
    #[error("Malformed job document: {reason}")]
    Malformed { reason: String },

    /// Crawl job arrived without the externally resolved secondary id
    #[error("Target {target_id} has no secondary id; resolve it before crawling")]
    MissingSecondaryId { target_id: String },
}

impl JobError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// A message type that travels through a queue as a flat key-value document
pub trait WireMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Exact set of top-level keys the document must carry
    const FIELDS: &'static [&'static str];

    /// Delivery priority, `0..=MAX_PRIORITY`, higher is more urgent
    fn priority(&self) -> u8;

    /// Routing key used when publishing through an exchange
    fn routing_key(&self) -> String;

    /// Serialize to the wire document
    fn to_document(&self) -> Result<String, JobError> {
        serde_json::to_string(self).map_err(|e| JobError::malformed(e.to_string()))
    }

    /// Parse a wire document, rejecting any field-set mismatch
    fn from_document(body: &str) -> Result<Self, JobError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| JobError::malformed(format!("not a JSON document: {e}")))?;

        let object = value
            .as_object()
            .ok_or_else(|| JobError::malformed("document is not a flat object"))?;

        check_field_set(object, Self::FIELDS)?;

        if let Some((key, _)) = object
            .iter()
            .find(|(_, v)| v.is_object() || v.is_array())
        {
            return Err(JobError::malformed(format!("field '{key}' is not flat")));
        }

        serde_json::from_value(value).map_err(|e| JobError::malformed(e.to_string()))
    }
}

fn check_field_set(object: &Map<String, Value>, fields: &[&str]) -> Result<(), JobError> {
    let expected: BTreeSet<&str> = fields.iter().copied().collect();
    let actual: BTreeSet<&str> = object.keys().map(String::as_str).collect();

    if expected == actual {
        return Ok(());
    }

    let missing: Vec<_> = expected.difference(&actual).copied().collect();
    let unexpected: Vec<_> = actual.difference(&expected).copied().collect();
    Err(JobError::malformed(format!(
        "field set mismatch (missing: [{}], unexpected: [{}])",
        missing.join(", "),
        unexpected.join(", ")
    )))
}

// ============================================================================
// Crawl Request
// ============================================================================

/// One queued unit of crawl work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// Stable primary id of the place
    pub target_id: String,

    /// Secondary id required by the review listing endpoint
    pub secondary_id: Option<String>,

    /// Display name
    pub name: String,

    /// Language code used for the review listing (e.g. "es", "en")
    pub locale: String,

    /// Egress domain hint (e.g. "es" for google.es)
    pub domain: String,

    /// Priority, higher is more urgent
    pub priority: u8,

    /// When this target was last crawled successfully
    pub last_crawled_at: Option<DateTime<Utc>>,
}

impl CrawlRequest {
    /// Create a new crawl request with default priority and no crawl history
    pub fn new(
        target_id: impl Into<String>,
        secondary_id: impl Into<String>,
        name: impl Into<String>,
        locale: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            secondary_id: Some(secondary_id.into()),
            name: name.into(),
            locale: locale.into(),
            domain: domain.into(),
            priority: 0,
            last_crawled_at: None,
        }
    }

    /// Set the priority, clamped to the queue maximum
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Set the last successful crawl timestamp
    #[must_use]
    pub fn with_last_crawled_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_crawled_at = Some(at);
        self
    }

    /// The secondary id, failing fast when it was never resolved
    pub fn require_secondary_id(&self) -> Result<&str, JobError> {
        match self.secondary_id.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(JobError::MissingSecondaryId {
                target_id: self.target_id.clone(),
            }),
        }
    }
}

impl WireMessage for CrawlRequest {
    const FIELDS: &'static [&'static str] = &[
        "target_id",
        "secondary_id",
        "name",
        "locale",
        "domain",
        "priority",
        "last_crawled_at",
    ];

    fn priority(&self) -> u8 {
        self.priority
    }

    fn routing_key(&self) -> String {
        format!("gmaps_scrape.{}.{}", self.domain, self.locale)
    }
}

// ============================================================================
// Resolve Request
// ============================================================================

/// Job asking for the secondary id of a place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Stable primary id of the place
    pub target_id: String,

    /// Display name, used as the search query
    pub name: String,

    /// Latitude of the place
    pub latitude: f64,

    /// Longitude of the place
    pub longitude: f64,

    /// Search interface language
    pub locale: String,

    /// Search domain hint
    pub domain: String,

    /// Priority, higher is more urgent
    pub priority: u8,
}

impl WireMessage for ResolveRequest {
    const FIELDS: &'static [&'static str] = &[
        "target_id",
        "name",
        "latitude",
        "longitude",
        "locale",
        "domain",
        "priority",
    ];

    fn priority(&self) -> u8 {
        self.priority
    }

    fn routing_key(&self) -> String {
        "serp_queue".to_string()
    }
}

// ============================================================================
// Page Record
// ============================================================================

/// One fetched review page, archived with a bounded lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub target_id: String,
    pub secondary_id: String,
    pub name: String,
    pub locale: String,
    pub fetch_date: NaiveDate,
    pub page_number: u32,
    /// Token for the next page; `None` means this was the last page
    pub continuation_token: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Review Batch
// ============================================================================

/// A single parsed review, opaque apart from its date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Best estimate of when the review was written
    pub reviewed_at: DateTime<Utc>,

    /// Parser-defined payload
    pub body: Value,
}

/// Structured output of parsing one page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewBatch {
    pub reviews: Vec<Review>,
}

impl ReviewBatch {
    pub fn new(reviews: Vec<Review>) -> Self {
        Self { reviews }
    }

    pub fn is_empty(&self) -> bool {
        self.reviews.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reviews.len()
    }

    /// Most recent review date in the batch
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.reviews.iter().map(|r| r.reviewed_at).max()
    }

    /// Oldest review date in the batch
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.reviews.iter().map(|r| r.reviewed_at).min()
    }
}

// ============================================================================
// Identity
// ============================================================================

/// A provisioned egress identity with its daily time-slot preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Egress configuration reference (config file name)
    pub name: String,

    /// Preferred hour of day, `0.0..24.0`
    pub preferred_slot: f64,

    /// Seconds since the Unix epoch
    pub last_used: f64,
}

impl Identity {
    pub fn new(name: impl Into<String>, preferred_slot: f64, last_used: f64) -> Self {
        Self {
            name: name.into(),
            preferred_slot,
            last_used,
        }
    }

    /// Registry field name, `{name}_{slot}` with one decimal
    pub fn key(&self) -> String {
        format!("{}_{:.1}", self.name, self.preferred_slot)
    }

    /// Rebuild an identity from its registry field and stored timestamp
    pub fn from_registry_entry(key: &str, last_used: &str) -> Option<Self> {
        let (name, slot) = key.rsplit_once('_')?;
        let preferred_slot: f64 = slot.parse().ok()?;
        let last_used: f64 = last_used.trim().parse().ok()?;
        if name.is_empty() || !(0.0..=24.0).contains(&preferred_slot) {
            return None;
        }
        Some(Self::new(name, preferred_slot, last_used))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// The identity currently assigned to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityBinding {
    /// Worker the binding belongs to
    pub worker: String,

    /// Registry key of the bound identity
    pub identity_key: String,

    /// Egress config reference
    pub identity_name: String,

    /// When the identity passed its health check and was bound
    pub bound_at: DateTime<Utc>,

    /// Process id of the egress process, if known
    pub pid: Option<u32>,
}
