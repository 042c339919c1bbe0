//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `{prefix}:{queue}`, one stream per named queue
//! - **Consumer group**: shared by every dispatcher process, so each job is
//!   delivered to one consumer
//! - **Reclaim**: entries left unacknowledged by a dead consumer for longer
//!   than `claim_idle` are taken over with `XAUTOCLAIM`
//! - **Dead-letter stream**: `{prefix}:{queue}:dlq`

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::queue::{Delivery, JobQueue, JobSource, QueueError};
use super::types::QueueJob;

const DEFAULT_KEY_PREFIX: &str = "pressroom:jobs";
const DEFAULT_GROUP: &str = "pressroom-workers";
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub key_prefix: String,
    pub group: String,
    /// Unique per process.
    pub consumer: String,
    /// Idle time after which another consumer's unacknowledged entry is reclaimed.
    pub claim_idle: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7().simple()),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }
}

impl RedisQueueConfig {
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }
}

pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    config: RedisQueueConfig,
    groups: Mutex<HashSet<String>>,
}

impl RedisJobQueue {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `config` - stream naming and consumer identity
    pub async fn connect(
        redis_url: impl AsRef<str>,
        config: RedisQueueConfig,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            config,
            groups: Mutex::new(HashSet::new()),
        })
    }

    pub fn stream_key(&self, queue: &str) -> String {
        format!("{}:{}", self.config.key_prefix, queue)
    }

    pub fn dlq_key(&self, queue: &str) -> String {
        format!("{}:{}:dlq", self.config.key_prefix, queue)
    }

    /// Create the consumer group (and stream) once per process. Idempotent.
    async fn ensure_group(&self, stream_key: &str) -> Result<(), QueueError> {
        let mut groups = self.groups.lock().await;
        if groups.contains(stream_key) {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => debug!(stream_key, group = %self.config.group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }

        groups.insert(stream_key.to_string());
        Ok(())
    }

    async fn reclaim(
        &self,
        conn: &mut MultiplexedConnection,
        stream_key: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply: [next_cursor, [entries...], ...]
        match reply {
            redis::Value::Bulk(mut parts) if parts.len() >= 2 => parse_entries(parts.swap_remove(1)),
            _ => Ok(Vec::new()),
        }
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        stream_key: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(wait.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        // Reply: nil on timeout, otherwise [[stream_key, [entries...]]]
        let redis::Value::Bulk(streams) = reply else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for stream in streams {
            if let redis::Value::Bulk(mut pair) = stream {
                if pair.len() == 2 {
                    entries.extend(parse_entries(pair.swap_remove(1))?);
                }
            }
        }
        Ok(entries)
    }

    /// Turn raw entries into deliveries; entries that cannot be decoded are
    /// moved to the dead-letter stream.
    async fn into_deliveries(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        entries: Vec<StreamEntry>,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = entry.fields.get("payload").cloned().unwrap_or_default();
            match QueueJob::from_payload(&payload) {
                Ok(job) => deliveries.push(Delivery {
                    receipt: entry.id,
                    job,
                }),
                Err(e) => {
                    warn!(message_id = %entry.id, error = %e, "undecodable queue entry");
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("XADD")
                        .arg(self.dlq_key(queue))
                        .arg("*")
                        .arg("original_message_id")
                        .arg(&entry.id)
                        .arg("reason")
                        .arg(e.to_string())
                        .arg("failed_at")
                        .arg(chrono::Utc::now().to_rfc3339())
                        .arg("payload")
                        .arg(&payload)
                        .ignore()
                        .cmd("XACK")
                        .arg(self.stream_key(queue))
                        .arg(&self.config.group)
                        .arg(&entry.id)
                        .ignore();
                    pipe.query_async::<_, ()>(conn)
                        .await
                        .map_err(|e| QueueError::Command(format!("DLQ XADD failed: {e}")))?;
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(jid = %job.jid, job_type = %job.job_type, queue = %job.queue), err)]
    async fn push(&self, job: &QueueJob) -> Result<(), QueueError> {
        let payload = job
            .to_payload()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(&job.queue))
            .arg("*")
            .arg("jid")
            .arg(job.jid.as_str())
            .arg("job_type")
            .arg(&job.job_type)
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl JobSource for RedisJobQueue {
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let stream_key = self.stream_key(queue);
        self.ensure_group(&stream_key).await?;
        let mut conn = self.conn.clone();

        let mut entries = self.reclaim(&mut conn, &stream_key, max).await?;
        if entries.is_empty() {
            entries = self.read_new(&mut conn, &stream_key, max, wait).await?;
        }
        self.into_deliveries(&mut conn, queue, entries).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(self.stream_key(&delivery.job.queue))
            .arg(&self.config.group)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let job = &delivery.job;
        let payload = job
            .to_payload()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(self.dlq_key(&job.queue))
            .arg("*")
            .arg("original_message_id")
            .arg(&delivery.receipt)
            .arg("retry_count")
            .arg(job.retry)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .ignore()
            .cmd("XACK")
            .arg(self.stream_key(&job.queue))
            .arg(&self.config.group)
            .arg(&delivery.receipt)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(
            message_id = %delivery.receipt,
            jid = %job.jid,
            retry_count = job.retry,
            "job sent to dead-letter stream"
        );
        Ok(())
    }
}

/// Raw stream entry: id plus field map.
#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

/// Parse `[[id, [k1, v1, k2, v2, ...]], ...]`. Entries deleted from the
/// stream come back with a nil field list and are dropped.
fn parse_entries(value: redis::Value) -> Result<Vec<StreamEntry>, QueueError> {
    let redis::Value::Bulk(raw) = value else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(raw.len());
    for entry in raw {
        let redis::Value::Bulk(parts) = entry else {
            return Err(QueueError::Deserialization("invalid entry format".to_string()));
        };
        let [id, fields] = <[redis::Value; 2]>::try_from(parts)
            .map_err(|_| QueueError::Deserialization("entry too short".to_string()))?;

        let redis::Value::Data(id) = id else {
            return Err(QueueError::Deserialization("invalid message id format".to_string()));
        };
        let redis::Value::Bulk(fields) = fields else {
            continue;
        };

        let fields = fields
            .chunks(2)
            .filter_map(|pair| match pair {
                [redis::Value::Data(k), redis::Value::Data(v)] => Some((
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                )),
                _ => None,
            })
            .collect();

        entries.push(StreamEntry {
            id: String::from_utf8_lossy(&id).into_owned(),
            fields,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_stream_entries() {
        let value = Value::Bulk(vec![
            Value::Bulk(vec![
                data("1700000000000-0"),
                Value::Bulk(vec![data("jid"), data("abc"), data("payload"), data("{}")]),
            ]),
            Value::Bulk(vec![data("1700000000000-1"), Value::Nil]),
        ]);

        let entries = parse_entries(value).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1700000000000-0");
        assert_eq!(entries[0].fields.get("jid").map(String::as_str), Some("abc"));
        assert_eq!(entries[0].fields.get("payload").map(String::as_str), Some("{}"));
    }

    #[test]
    fn nil_reply_is_empty() {
        assert!(parse_entries(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn malformed_entry_is_an_error() {
        let value = Value::Bulk(vec![Value::Bulk(vec![data("1-0")])]);
        assert!(matches!(
            parse_entries(value),
            Err(QueueError::Deserialization(_))
        ));
    }

    #[test]
    fn config_defaults_give_unique_consumers() {
        let a = RedisQueueConfig::default();
        let b = RedisQueueConfig::default();
        assert_eq!(a.group, DEFAULT_GROUP);
        assert_ne!(a.consumer, b.consumer);
    }
}
