//! In-process queue
//!
//! A `BinaryHeap` of ready messages plus an in-flight table. Both count
//! against capacity, so requeue and recovery never overfill the queue.
//! Consumers park on a `Notify` until something is published or requeued.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::{Delivery, JobQueue, PublishOutcome, QueueError, QueueResult};
use crate::models::MAX_PRIORITY;

#[derive(Debug, Clone)]
struct Ready {
    seq: u64,
    id: String,
    body: String,
    priority: u8,
    redelivered: bool,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    // Max-heap: higher priority first, then lower sequence (earlier arrival).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct InFlight {
    message: Ready,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: BinaryHeap<Ready>,
    in_flight: HashMap<String, InFlight>,
    next_seq: u64,
}

/// Bounded in-memory [`JobQueue`]
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    capacity: usize,
    state: Mutex<State>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(State::default()),
            available: Notify::new(),
        }
    }

    /// Number of unacked deliveries
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    fn pop(&self, state: &mut State) -> Option<Delivery> {
        let message = state.ready.pop()?;
        let delivery = Delivery {
            id: message.id.clone(),
            body: message.body.clone(),
            priority: message.priority,
            redelivered: message.redelivered,
        };
        state.in_flight.insert(
            message.id.clone(),
            InFlight {
                message,
                delivered_at: Instant::now(),
            },
        );
        Some(delivery)
    }

    fn unknown(&self, delivery: &Delivery) -> QueueError {
        QueueError::UnknownDelivery {
            queue: self.name.clone(),
            id: delivery.id.clone(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn publish(&self, body: String, priority: u8) -> QueueResult<PublishOutcome> {
        let mut state = self.state.lock().await;
        if state.ready.len() + state.in_flight.len() >= self.capacity {
            return Ok(PublishOutcome::Rejected);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push(Ready {
            seq,
            id: Uuid::new_v4().to_string(),
            body,
            priority: priority.min(MAX_PRIORITY),
            redelivered: false,
        });
        drop(state);

        self.available.notify_one();
        Ok(PublishOutcome::Accepted)
    }

    async fn consume(&self) -> QueueResult<Delivery> {
        loop {
            let notified = self.available.notified();
            if let Some(delivery) = self.try_consume().await? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn try_consume(&self) -> QueueResult<Option<Delivery>> {
        let mut state = self.state.lock().await;
        Ok(self.pop(&mut state))
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&delivery.id)
            .map(|_| ())
            .ok_or_else(|| self.unknown(delivery))
    }

    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let mut entry = state
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| self.unknown(delivery))?;
        entry.message.redelivered = true;
        state.ready.push(entry.message);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    async fn purge(&self) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let dropped = state.ready.len();
        state.ready.clear();
        Ok(dropped)
    }

    async fn len(&self) -> QueueResult<usize> {
        Ok(self.state.lock().await.ready.len())
    }

    async fn recover(&self, stale_after: Duration) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.delivered_at) >= stale_after)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(mut entry) = state.in_flight.remove(id) {
                entry.message.redelivered = true;
                state.ready.push(entry.message);
            }
        }
        drop(state);

        for _ in 0..stale.len() {
            self.available.notify_one();
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn drain(queue: &MemoryQueue) -> Vec<String> {
        let mut bodies = Vec::new();
        while let Some(d) = queue.try_consume().await.unwrap() {
            queue.ack(&d).await.unwrap();
            bodies.push(d.body);
        }
        bodies
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryQueue::new("crawl", 10);
        queue.publish("low-1".into(), 1).await.unwrap();
        queue.publish("high-1".into(), 9).await.unwrap();
        queue.publish("low-2".into(), 1).await.unwrap();
        queue.publish("high-2".into(), 9).await.unwrap();
        queue.publish("mid".into(), 5).await.unwrap();

        assert_eq!(
            drain(&queue).await,
            vec!["high-1", "high-2", "mid", "low-1", "low-2"]
        );
    }

    #[tokio::test]
    async fn test_rejects_over_capacity() {
        let queue = MemoryQueue::new("crawl", 1);
        assert_eq!(
            queue.publish("a".into(), 1).await.unwrap(),
            PublishOutcome::Accepted
        );
        assert_eq!(
            queue.publish("a".into(), 1).await.unwrap(),
            PublishOutcome::Rejected
        );
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_counts_against_capacity() {
        let queue = MemoryQueue::new("crawl", 1);
        queue.publish("a".into(), 1).await.unwrap();
        let a = queue.try_consume().await.unwrap().unwrap();

        assert_eq!(
            queue.publish("b".into(), 1).await.unwrap(),
            PublishOutcome::Rejected
        );
        queue.requeue(&a).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        let a = queue.try_consume().await.unwrap().unwrap();
        queue.ack(&a).await.unwrap();
        assert!(queue.publish("b".into(), 1).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_recovery_stays_within_capacity() {
        let queue = MemoryQueue::new("crawl", 2);
        queue.publish("a".into(), 1).await.unwrap();
        queue.publish("b".into(), 1).await.unwrap();
        let _lost = queue.try_consume().await.unwrap().unwrap();

        assert!(!queue.publish("c".into(), 1).await.unwrap().is_accepted());
        assert_eq!(queue.recover(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_requeue_keeps_position() {
        let queue = MemoryQueue::new("crawl", 10);
        queue.publish("first".into(), 3).await.unwrap();
        queue.publish("second".into(), 3).await.unwrap();

        let first = queue.try_consume().await.unwrap().unwrap();
        assert!(!first.redelivered);
        queue.requeue(&first).await.unwrap();

        let again = queue.try_consume().await.unwrap().unwrap();
        assert_eq!(again.body, "first");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_ack_unknown_delivery() {
        let queue = MemoryQueue::new("crawl", 10);
        queue.publish("a".into(), 1).await.unwrap();
        let d = queue.try_consume().await.unwrap().unwrap();
        queue.ack(&d).await.unwrap();
        assert!(matches!(
            queue.ack(&d).await,
            Err(QueueError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_stale_deliveries() {
        let queue = MemoryQueue::new("crawl", 10);
        queue.publish("a".into(), 1).await.unwrap();
        let _lost = queue.try_consume().await.unwrap().unwrap();
        assert_eq!(queue.in_flight().await, 1);

        assert_eq!(queue.recover(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.recover(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.in_flight().await, 0);

        let redelivered = queue.try_consume().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = MemoryQueue::new("resolve", 10);
        for i in 0..4 {
            queue.publish(format!("m{i}"), 1).await.unwrap();
        }
        assert_eq!(queue.purge().await.unwrap(), 4);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let queue = Arc::new(MemoryQueue::new("crawl", 10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish("late".into(), 1).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, "late");
    }
}
