//! Routing from publishers to queues
//!
//! A direct exchange delivers to queues bound with exactly the routing key. A
//! topic exchange matches dot-separated keys against binding patterns where
//! `*` stands for one word and `#` for zero or more words, so a new consumer
//! class can subscribe to an existing stream by binding its own queue.

use std::sync::Arc;

use super::{JobQueue, PublishOutcome, QueueError, QueueResult};

/// Exchange routing semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
}

struct Binding {
    pattern: String,
    queue: Arc<dyn JobQueue>,
}

/// Named router in front of one or more queues
pub struct Exchange {
    name: String,
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            bindings: Vec::new(),
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Direct)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Bind a queue under a routing key (direct) or pattern (topic)
    pub fn bind(&mut self, pattern: impl Into<String>, queue: Arc<dyn JobQueue>) -> &mut Self {
        self.bindings.push(Binding {
            pattern: pattern.into(),
            queue,
        });
        self
    }

    /// Queues a routing key would be delivered to
    pub fn route(&self, routing_key: &str) -> Vec<Arc<dyn JobQueue>> {
        self.bindings
            .iter()
            .filter(|b| match self.kind {
                ExchangeKind::Direct => b.pattern == routing_key,
                ExchangeKind::Topic => topic_matches(&b.pattern, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect()
    }

    /// Publish to every matching queue
    ///
    /// Returns one outcome per queue reached; a key with no matching binding
    /// is an error rather than a silent drop.
    pub async fn publish(
        &self,
        routing_key: &str,
        body: &str,
        priority: u8,
    ) -> QueueResult<Vec<(String, PublishOutcome)>> {
        let queues = self.route(routing_key);
        if queues.is_empty() {
            return Err(QueueError::Unroutable {
                exchange: self.name.clone(),
                routing_key: routing_key.to_string(),
            });
        }

        let mut outcomes = Vec::with_capacity(queues.len());
        for queue in queues {
            let outcome = queue.publish(body.to_string(), priority).await?;
            outcomes.push((queue.name().to_string(), outcome));
        }
        Ok(outcomes)
    }
}

/// Match a dot-separated routing key against a topic pattern
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => {
                (word == "*" || word == first) && match_words(rest, key_rest)
            }
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("gmaps_scrape.#", "gmaps_scrape.es.es"));
        assert!(topic_matches("gmaps_scrape.#", "gmaps_scrape"));
        assert!(topic_matches("gmaps_scrape.*.es", "gmaps_scrape.com.es"));
        assert!(!topic_matches("gmaps_scrape.*.es", "gmaps_scrape.com.en"));
        assert!(!topic_matches("gmaps_scrape.*", "gmaps_scrape.es.es"));
        assert!(topic_matches("#.es", "gmaps_scrape.com.es"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("serp_queue", "gmaps_scrape.es.es"));
    }

    #[tokio::test]
    async fn test_direct_exchange_routes_exact_key() {
        let queue = Arc::new(MemoryQueue::new("serp_queue", 20));
        let mut exchange = Exchange::direct("serp");
        exchange.bind("serp_queue", queue.clone());

        let outcomes = exchange.publish("serp_queue", "{}", 10).await.unwrap();
        assert_eq!(outcomes, vec![("serp_queue".to_string(), PublishOutcome::Accepted)]);
        assert!(matches!(
            exchange.publish("serp", "{}", 10).await,
            Err(QueueError::Unroutable { .. })
        ));
    }

    #[tokio::test]
    async fn test_topic_exchange_fans_out() {
        let crawl = Arc::new(MemoryQueue::new("crawl", 10));
        let audit = Arc::new(MemoryQueue::new("audit", 10));
        let mut exchange = Exchange::topic("gmaps");
        exchange
            .bind("gmaps_scrape.#", crawl.clone())
            .bind("gmaps_scrape.*.en", audit.clone());

        exchange
            .publish("gmaps_scrape.es.es", "a", 1)
            .await
            .unwrap();
        exchange
            .publish("gmaps_scrape.com.en", "b", 1)
            .await
            .unwrap();

        assert_eq!(crawl.len().await.unwrap(), 2);
        assert_eq!(audit.len().await.unwrap(), 1);
    }
}
