//! Schema-checked view over a queue
//!
//! Producers publish typed messages through an exchange; consumers receive
//! them decoded. A document that does not match the schema still comes back
//! as a delivery (carrying the decode error) so the consumer can settle it.

use std::marker::PhantomData;
use std::sync::Arc;

use super::{Delivery, Exchange, JobQueue, PublishOutcome, QueueResult};
use crate::metrics;
use crate::models::{JobError, WireMessage};

/// A delivery together with its decoded message
#[derive(Debug)]
pub struct TypedDelivery<T> {
    pub delivery: Delivery,
    pub message: Result<T, JobError>,
}

/// Typed producer/consumer pair for one message type
pub struct TypedQueue<T> {
    exchange: Arc<Exchange>,
    queue: Arc<dyn JobQueue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: WireMessage> TypedQueue<T> {
    /// `queue` is the one this side consumes from; publishes go through
    /// `exchange` and may reach other bound queues as well
    pub fn new(exchange: Arc<Exchange>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            exchange,
            queue,
            _marker: PhantomData,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Publish a message under its own routing key and priority
    ///
    /// Rejected if any queue it routes to is at capacity.
    pub async fn publish(&self, message: &T) -> QueueResult<PublishOutcome> {
        let body = message.to_document()?;
        let outcomes = self
            .exchange
            .publish(&message.routing_key(), &body, message.priority())
            .await?;

        let mut overall = PublishOutcome::Accepted;
        for (queue, outcome) in &outcomes {
            metrics::record_publish(queue, outcome.label());
            if !outcome.is_accepted() {
                overall = PublishOutcome::Rejected;
            }
        }
        Ok(overall)
    }

    /// Wait for the next message
    pub async fn consume(&self) -> QueueResult<TypedDelivery<T>> {
        let delivery = self.queue.consume().await?;
        Ok(Self::decode(delivery))
    }

    /// Next message, if one is ready
    pub async fn try_consume(&self) -> QueueResult<Option<TypedDelivery<T>>> {
        Ok(self.queue.try_consume().await?.map(Self::decode))
    }

    pub async fn ack(&self, delivery: &TypedDelivery<T>) -> QueueResult<()> {
        self.queue.ack(&delivery.delivery).await
    }

    pub async fn requeue(&self, delivery: &TypedDelivery<T>) -> QueueResult<()> {
        self.queue.requeue(&delivery.delivery).await
    }

    pub async fn purge(&self) -> QueueResult<usize> {
        self.queue.purge().await
    }

    pub async fn len(&self) -> QueueResult<usize> {
        let len = self.queue.len().await?;
        metrics::set_queue_depth(self.queue.name(), len);
        Ok(len)
    }

    fn decode(delivery: Delivery) -> TypedDelivery<T> {
        let message = T::from_document(&delivery.body);
        TypedDelivery { delivery, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CrawlRequest;
    use crate::queue::MemoryQueue;

    fn crawl_queue(capacity: usize) -> TypedQueue<CrawlRequest> {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new("crawl", capacity));
        let mut exchange = Exchange::topic("gmaps");
        exchange.bind("gmaps_scrape.#", queue.clone());
        TypedQueue::new(Arc::new(exchange), queue)
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let queue = crawl_queue(10);
        let request = CrawlRequest::new("p1", "0x1:0x2", "Bar", "es", "es").with_priority(3);
        assert!(queue.publish(&request).await.unwrap().is_accepted());

        let delivery = queue.consume().await.unwrap();
        assert_eq!(delivery.message.as_ref().unwrap(), &request);
        assert_eq!(delivery.delivery.priority, 3);
        queue.ack(&delivery).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_document_is_delivered_as_error() {
        let queue = crawl_queue(10);
        queue
            .queue()
            .publish(r#"{"target_id":"p1"}"#.to_string(), 1)
            .await
            .unwrap();

        let delivery = queue.consume().await.unwrap();
        assert!(matches!(delivery.message, Err(JobError::Malformed { .. })));
        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_over_capacity_is_rejected() {
        let queue = crawl_queue(1);
        let request = CrawlRequest::new("p1", "0x1:0x2", "Bar", "es", "es");
        assert_eq!(queue.publish(&request).await.unwrap(), PublishOutcome::Accepted);
        assert_eq!(queue.publish(&request).await.unwrap(), PublishOutcome::Rejected);
    }
}
