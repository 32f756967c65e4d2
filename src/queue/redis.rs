//! Durable Redis queue
//!
//! Layout under `{prefix}:queue:{name}`:
//!
//! - `:ready` sorted set of message ids, score encodes (priority, arrival)
//! - `:bodies` hash id -> body
//! - `:meta` hash id -> "{priority}|{score}"
//! - `:inflight` sorted set of message ids scored by delivery time (ms)
//! - `:deliveries` hash id -> delivery count
//! - `:seq` arrival counter
//!
//! Every state transition is a single Lua script, so a message is always in
//! exactly one of the ready and in-flight sets. Capacity bounds both sets
//! together.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Delivery, JobQueue, PublishOutcome, QueueError, QueueResult};
use crate::models::MAX_PRIORITY;
use crate::storage::RedisConfig;

/// Priority band width in the ready score; arrivals within a band stay FIFO
const PRIORITY_BAND: u64 = 1 << 40;

const PUBLISH_SCRIPT: &str = r#"
local held = redis.call('ZCARD', KEYS[1]) + redis.call('ZCARD', KEYS[5])
if held >= tonumber(ARGV[1]) then return 0 end
local seq = redis.call('INCR', KEYS[4])
local score = tonumber(ARGV[3]) + seq
redis.call('HSET', KEYS[2], ARGV[4], ARGV[5])
redis.call('HSET', KEYS[3], ARGV[4], ARGV[2] .. '|' .. score)
redis.call('ZADD', KEYS[1], score, ARGV[4])
return 1
"#;

const POP_SCRIPT: &str = r#"
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then return false end
local id = head[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[1], id)
local count = redis.call('HINCRBY', KEYS[5], id, 1)
return {id, redis.call('HGET', KEYS[3], id), redis.call('HGET', KEYS[4], id), count}
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

const REQUEUE_SCRIPT: &str = r#"
local moved = 0
for i = 1, #ARGV do
  if redis.call('ZREM', KEYS[1], ARGV[i]) == 1 then
    local meta = redis.call('HGET', KEYS[3], ARGV[i])
    local score = string.match(meta, '|(.+)$')
    redis.call('ZADD', KEYS[2], score, ARGV[i])
    moved = moved + 1
  end
end
return moved
"#;

const PURGE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  redis.call('HDEL', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  redis.call('HDEL', KEYS[4], id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

struct Keys {
    ready: String,
    bodies: String,
    meta: String,
    inflight: String,
    deliveries: String,
    seq: String,
}

impl Keys {
    fn new(config: &RedisConfig, name: &str) -> Self {
        let base = config.namespaced(&format!("queue:{name}"));
        Self {
            ready: format!("{base}:ready"),
            bodies: format!("{base}:bodies"),
            meta: format!("{base}:meta"),
            inflight: format!("{base}:inflight"),
            deliveries: format!("{base}:deliveries"),
            seq: format!("{base}:seq"),
        }
    }
}

struct Scripts {
    publish: Script,
    pop: Script,
    ack: Script,
    requeue: Script,
    purge: Script,
}

/// Bounded, durable [`JobQueue`] on Redis
#[derive(Clone)]
pub struct RedisQueue {
    name: String,
    capacity: usize,
    poll_interval: Duration,
    pool: Pool,
    keys: Arc<Keys>,
    scripts: Arc<Scripts>,
}

impl RedisQueue {
    pub fn new(
        pool: Pool,
        config: &RedisConfig,
        name: impl Into<String>,
        capacity: usize,
        poll_interval: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            keys: Arc::new(Keys::new(config, &name)),
            name,
            capacity,
            poll_interval,
            pool,
            scripts: Arc::new(Scripts {
                publish: Script::new(PUBLISH_SCRIPT),
                pop: Script::new(POP_SCRIPT),
                ack: Script::new(ACK_SCRIPT),
                requeue: Script::new(REQUEUE_SCRIPT),
                purge: Script::new(PURGE_SCRIPT),
            }),
        }
    }

    async fn conn(&self) -> QueueResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::backend(format!("failed to get Redis connection: {e}")))
    }

    fn unknown(&self, delivery: &Delivery) -> QueueError {
        QueueError::UnknownDelivery {
            queue: self.name.clone(),
            id: delivery.id.clone(),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::backend(err)
    }
}

/// Ready-set score: lower pops first
fn base_score(priority: u8) -> u64 {
    u64::from(MAX_PRIORITY - priority.min(MAX_PRIORITY)) * PRIORITY_BAND
}

fn parse_priority(meta: &str) -> u8 {
    meta.split('|')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn publish(&self, body: String, priority: u8) -> QueueResult<PublishOutcome> {
        let mut conn = self.conn().await?;
        let priority = priority.min(MAX_PRIORITY);
        let accepted: i64 = self
            .scripts
            .publish
            .key(&self.keys.ready)
            .key(&self.keys.bodies)
            .key(&self.keys.meta)
            .key(&self.keys.seq)
            .key(&self.keys.inflight)
            .arg(self.capacity)
            .arg(u32::from(priority))
            .arg(base_score(priority))
            .arg(Uuid::new_v4().to_string())
            .arg(body)
            .invoke_async(&mut *conn)
            .await?;

        Ok(if accepted == 1 {
            PublishOutcome::Accepted
        } else {
            PublishOutcome::Rejected
        })
    }

    async fn consume(&self) -> QueueResult<Delivery> {
        loop {
            if let Some(delivery) = self.try_consume().await? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn try_consume(&self) -> QueueResult<Option<Delivery>> {
        let mut conn = self.conn().await?;
        let popped: Option<(String, String, String, i64)> = self
            .scripts
            .pop
            .key(&self.keys.ready)
            .key(&self.keys.inflight)
            .key(&self.keys.bodies)
            .key(&self.keys.meta)
            .key(&self.keys.deliveries)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;

        Ok(popped.map(|(id, body, meta, count)| Delivery {
            id,
            body,
            priority: parse_priority(&meta),
            redelivered: count > 1,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .scripts
            .ack
            .key(&self.keys.inflight)
            .key(&self.keys.bodies)
            .key(&self.keys.meta)
            .key(&self.keys.deliveries)
            .arg(&delivery.id)
            .invoke_async(&mut *conn)
            .await?;

        if removed == 1 {
            Ok(())
        } else {
            Err(self.unknown(delivery))
        }
    }

    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let moved: i64 = self
            .scripts
            .requeue
            .key(&self.keys.inflight)
            .key(&self.keys.ready)
            .key(&self.keys.meta)
            .arg(&delivery.id)
            .invoke_async(&mut *conn)
            .await?;

        if moved == 1 {
            Ok(())
        } else {
            Err(self.unknown(delivery))
        }
    }

    async fn purge(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let dropped: i64 = self
            .scripts
            .purge
            .key(&self.keys.ready)
            .key(&self.keys.bodies)
            .key(&self.keys.meta)
            .key(&self.keys.deliveries)
            .invoke_async(&mut *conn)
            .await?;
        Ok(dropped.max(0) as usize)
    }

    async fn len(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let len: usize = conn.zcard(&self.keys.ready).await?;
        Ok(len)
    }

    async fn recover(&self, stale_after: Duration) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let cutoff = Utc::now().timestamp_millis() - stale_after.as_millis() as i64;
        let stale: Vec<String> = conn
            .zrangebyscore(&self.keys.inflight, "-inf", cutoff)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut invocation = self.scripts.requeue.prepare_invoke();
        invocation
            .key(&self.keys.inflight)
            .key(&self.keys.ready)
            .key(&self.keys.meta);
        for id in &stale {
            invocation.arg(id);
        }
        let moved: i64 = invocation.invoke_async(&mut *conn).await?;

        if moved > 0 {
            tracing::warn!(queue = %self.name, recovered = moved, "Recovered stale deliveries");
        }
        Ok(moved.max(0) as usize)
    }
}
