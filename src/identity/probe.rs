//! Reachability checks through the active egress
//!
//! An identity is only useful if traffic flows through it to the open internet
//! and to the stores the crawl writes to. Any failed check fails the probe.

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::{IdentityError, IdentityResult};
use crate::storage::{DocumentStore, KvStore, PageArchive};

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Succeeds only if every reachability check passes
    async fn check(&self) -> IdentityResult<()>;
}

/// [`LivenessProbe`] over HTTP probe URLs and store pings
pub struct NetworkProbe {
    client: Client,
    urls: Vec<String>,
    kv: Arc<dyn KvStore>,
    archive: Arc<dyn PageArchive>,
    documents: Arc<dyn DocumentStore>,
}

impl NetworkProbe {
    pub fn new(
        urls: Vec<String>,
        timeout: Duration,
        kv: Arc<dyn KvStore>,
        archive: Arc<dyn PageArchive>,
        documents: Arc<dyn DocumentStore>,
    ) -> IdentityResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::probe(format!("failed to build probe client: {e}")))?;

        Ok(Self {
            client,
            urls,
            kv,
            archive,
            documents,
        })
    }

    async fn check_url(&self, url: &str) -> IdentityResult<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IdentityError::probe(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(IdentityError::probe(format!("{url}: HTTP {status}")))
        }
    }
}

#[async_trait]
impl LivenessProbe for NetworkProbe {
    async fn check(&self) -> IdentityResult<()> {
        try_join_all(self.urls.iter().map(|url| self.check_url(url))).await?;

        self.kv
            .ping()
            .await
            .map_err(|e| IdentityError::probe(format!("key-value store: {e}")))?;
        self.archive
            .ping()
            .await
            .map_err(|e| IdentityError::probe(format!("page archive: {e}")))?;
        self.documents
            .ping()
            .await
            .map_err(|e| IdentityError::probe(format!("document store: {e}")))?;

        Ok(())
    }
}
