//! Process settings read from the environment.

use std::time::Duration;

use pressroom_infra::ann::{AnnIndexConfig, MAX_SEARCH_DAYS, SpaceType};
use pressroom_infra::config::{ConfigError, Env};
use pressroom_infra::jobs::{DEFAULT_QUEUE, DispatcherConfig, RecovererConfig, RedisQueueConfig, RetryPolicy};
use pressroom_infra::workers::{DuplicateDetectionConfig, IndexRetentionConfig};
use pressroom_observability::LogFormat;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: String,
    pub ann_url: String,
    pub ann_timeout: Duration,
    pub log_format: LogFormat,

    pub ann: AnnIndexConfig,
    pub detection: DuplicateDetectionConfig,
    pub recoverer: RecovererConfig,
    pub dispatcher: DispatcherConfig,
    pub queue: RedisQueueConfig,
    /// `None` disables shard retention.
    pub retention: Option<IndexRetentionConfig>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&Env::from_process())
    }

    pub fn load(env: &Env) -> Result<Self, ConfigError> {
        let defaults = AnnIndexConfig::default();
        let ann = AnnIndexConfig {
            prefix: env.string_or("PRESSROOM_ANN_PREFIX", &defaults.prefix),
            dimension: env.parse_or("PRESSROOM_ANN_DIMENSION", defaults.dimension)?,
            ef_construction: env.parse_or("PRESSROOM_ANN_EF_CONSTRUCTION", defaults.ef_construction)?,
            m: env.parse_or("PRESSROOM_ANN_M", defaults.m)?,
            max_elements: env.parse_or("PRESSROOM_ANN_MAX_ELEMENTS", defaults.max_elements)?,
            seed: env.parse_or("PRESSROOM_ANN_SEED", defaults.seed)?,
            space: env.parse_or::<SpaceType>("PRESSROOM_ANN_SPACE", defaults.space)?,
        };

        let detection_defaults = DuplicateDetectionConfig::default();
        let timeframe_days: u32 =
            env.parse_or("PRESSROOM_DUPLICATE_TIMEFRAME_DAYS", detection_defaults.timeframe_days)?;
        // The search covers the timeframe plus the publish day itself.
        if i64::from(timeframe_days) >= MAX_SEARCH_DAYS {
            return Err(ConfigError::Invalid {
                key: "PRESSROOM_DUPLICATE_TIMEFRAME_DAYS".into(),
                value: timeframe_days.to_string(),
                message: format!("must be below {MAX_SEARCH_DAYS}"),
            });
        }
        let detection = DuplicateDetectionConfig::default()
            .with_timeframe_days(timeframe_days)
            .with_distance_threshold(env.parse_or(
                "PRESSROOM_DUPLICATE_DISTANCE_THRESHOLD",
                detection_defaults.distance_threshold,
            )?)
            .with_duplicate_jobs(env.list_or("PRESSROOM_DUPLICATE_JOBS", &[]))
            .with_non_duplicate_jobs(env.list_or("PRESSROOM_NON_DUPLICATE_JOBS", &[]));

        let recoverer_defaults = RecovererConfig::default();
        let recoverer = RecovererConfig::default()
            .with_leeway(env.duration_or("PRESSROOM_RECOVERY_LEEWAY", recoverer_defaults.leeway)?)
            .with_interval(env.duration_or("PRESSROOM_RECOVERY_INTERVAL", recoverer_defaults.interval)?)
            .with_batch_size(env.parse_or("PRESSROOM_RECOVERY_BATCH_SIZE", recoverer_defaults.batch_size)?);

        let dispatcher_defaults = DispatcherConfig::default();
        let retry_defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_retries: env.parse_or("PRESSROOM_MAX_RETRIES", retry_defaults.max_retries)?,
            base_delay: env.duration_or("PRESSROOM_RETRY_BASE_DELAY", retry_defaults.base_delay)?,
            max_delay: env.duration_or("PRESSROOM_RETRY_MAX_DELAY", retry_defaults.max_delay)?,
            strategy: retry_defaults.strategy,
        };
        // `with_concurrency` clamps to 1, so zero is rejected on the raw value.
        let concurrency: usize =
            env.parse_or("PRESSROOM_CONCURRENCY", dispatcher_defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "PRESSROOM_CONCURRENCY".into(),
                value: "0".into(),
                message: "must be positive".into(),
            });
        }
        let dispatcher = DispatcherConfig::default()
            .with_queue(env.string_or("PRESSROOM_QUEUE", DEFAULT_QUEUE))
            .with_concurrency(concurrency)
            .with_poll_interval(env.duration_or("PRESSROOM_POLL_INTERVAL", dispatcher_defaults.poll_interval)?)
            .with_retry_policy(retry_policy);

        let mut queue = RedisQueueConfig::default();
        if let Some(prefix) = env.get("PRESSROOM_QUEUE_PREFIX") {
            queue = queue.with_key_prefix(prefix);
        }
        if let Some(group) = env.get("PRESSROOM_QUEUE_GROUP") {
            queue = queue.with_group(group);
        }
        if let Some(consumer) = env.get("PRESSROOM_QUEUE_CONSUMER") {
            queue = queue.with_consumer(consumer);
        }
        queue.claim_idle = env.duration_or("PRESSROOM_QUEUE_CLAIM_IDLE", queue.claim_idle)?;

        let retention_defaults = IndexRetentionConfig::default();
        let retention_days =
            env.parse_or("PRESSROOM_RETENTION_DAYS", retention_defaults.retention_days)?;
        let retention = (retention_days > 0).then_some(IndexRetentionConfig {
            retention_days,
            interval: env.duration_or("PRESSROOM_RETENTION_INTERVAL", retention_defaults.interval)?,
        });

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            db_max_connections: env.parse_or("PRESSROOM_DB_MAX_CONNECTIONS", 10)?,
            redis_url: env.string_or("REDIS_URL", "redis://localhost:6379"),
            ann_url: env.required("PRESSROOM_ANN_URL")?,
            ann_timeout: env.duration_or("PRESSROOM_ANN_TIMEOUT", Duration::from_secs(5))?,
            log_format: match env.get("PRESSROOM_LOG_FORMAT") {
                Some(raw) => raw.parse().map_err(|message| ConfigError::Invalid {
                    key: "PRESSROOM_LOG_FORMAT".into(),
                    value: raw.clone(),
                    message,
                })?,
                None => LogFormat::Json,
            },
            ann,
            detection,
            recoverer,
            dispatcher,
            queue,
            retention,
        })
    }
}
