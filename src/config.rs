use crate::error::AppError;
use crate::models::EndWhileRinging;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Token bucket settings for one rate-limit dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRule {
    /// Burst size; also the number of tokens a fresh bucket starts with.
    pub capacity: u32,
    /// Tokens regenerated per second. `<= 0` means the bucket never refills.
    pub refill_per_second: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub ip: RateRule,
    pub account: RateRule,
    pub connection: RateRule,
    pub room: RateRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip: RateRule {
                capacity: 10,
                refill_per_second: 0.2,
            },
            account: RateRule {
                capacity: 5,
                refill_per_second: 0.1,
            },
            connection: RateRule {
                capacity: 20,
                refill_per_second: 10.0,
            },
            room: RateRule {
                capacity: 30,
                refill_per_second: 1.0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub enabled: bool,
    pub ntfy_url: Option<String>,
    pub topic_prefix: String,
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub instance_id: String,
    /// `None` selects the in-process message store.
    pub database_url: Option<String>,
    /// `None` selects in-process presence, offline queue, calls and broadcaster.
    pub redis_url: Option<String>,
    pub token_secret: String,
    pub social_graph_url: Option<String>,
    pub recall_window_secs: i64,
    pub end_while_ringing: EndWhileRinging,
    pub presence_ttl_secs: u64,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub dispatch_queue_capacity: usize,
    pub dispatch_workers: usize,
    pub offline_message_ttl_secs: u64,
    /// Messages older than this many days are purged; `0` keeps them forever.
    pub message_retention_days: u32,
    pub retention_sweep_interval: Duration,
    pub push: PushConfig,
    pub rate_limits: RateLimitConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let token_secret = non_empty("TOKEN_SECRET")
            .ok_or_else(|| AppError::Config("TOKEN_SECRET missing".into()))?;

        let end_while_ringing = match non_empty("CALL_END_WHILE_RINGING") {
            Some(raw) => raw.parse::<EndWhileRinging>().map_err(AppError::Config)?,
            None => EndWhileRinging::default(),
        };

        let heartbeat_interval_secs: u64 = parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 5)?;
        let heartbeat_timeout_secs: u64 = parse_or(&lookup, "HEARTBEAT_TIMEOUT_SECS", 30)?;
        if heartbeat_timeout_secs <= heartbeat_interval_secs {
            return Err(AppError::Config(
                "HEARTBEAT_TIMEOUT_SECS must exceed HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }

        let defaults = RateLimitConfig::default();
        let rate_limits = RateLimitConfig {
            ip: rate_rule(&lookup, "IP", defaults.ip)?,
            account: rate_rule(&lookup, "ACCOUNT", defaults.account)?,
            connection: rate_rule(&lookup, "CONNECTION", defaults.connection)?,
            room: rate_rule(&lookup, "ROOM", defaults.room)?,
        };

        let ntfy_url = non_empty("NTFY_URL");
        let push = PushConfig {
            enabled: parse_or(&lookup, "PUSH_ENABLED", ntfy_url.is_some())?,
            topic_prefix: non_empty("NTFY_TOPIC").unwrap_or_else(|| "topic".to_string()),
            ntfy_url,
            queue_capacity: parse_or(&lookup, "PUSH_QUEUE_CAPACITY", 512)?,
            concurrency: parse_or(&lookup, "PUSH_CONCURRENCY", 8)?,
            timeout: Duration::from_secs(parse_or(&lookup, "PUSH_TIMEOUT_SECS", 10)?),
        };

        Ok(Self {
            port: parse_or(&lookup, "PORT", 8080)?,
            instance_id: non_empty("INSTANCE_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            token_secret,
            social_graph_url: non_empty("SOCIAL_GRAPH_URL"),
            recall_window_secs: parse_or(&lookup, "RECALL_WINDOW_SECS", 120)?,
            end_while_ringing,
            presence_ttl_secs: parse_or(&lookup, "PRESENCE_TTL_SECS", 90)?,
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout_secs),
            outbound_queue_capacity: parse_or::<usize, _>(&lookup, "OUTBOUND_QUEUE_CAPACITY", 256)?
                .max(1),
            dispatch_queue_capacity: parse_or::<usize, _>(&lookup, "DISPATCH_QUEUE_CAPACITY", 1024)?
                .max(1),
            dispatch_workers: parse_or::<usize, _>(&lookup, "DISPATCH_WORKERS", 4)?
                .max(1),
            offline_message_ttl_secs: parse_or(&lookup, "OFFLINE_MESSAGE_TTL_SECS", 604_800)?,
            message_retention_days: parse_or(&lookup, "MESSAGE_RETENTION_DAYS", 0)?,
            retention_sweep_interval: Duration::from_secs(
                parse_or::<u64, _>(&lookup, "RETENTION_SWEEP_INTERVAL_SECS", 86_400)?.max(1),
            ),
            push,
            rate_limits,
        })
    }

    pub fn recall_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recall_window_secs)
    }

    pub fn message_retention(&self) -> Option<chrono::Duration> {
        (self.message_retention_days > 0)
            .then(|| chrono::Duration::days(i64::from(self.message_retention_days)))
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}: {e}"))),
        _ => Ok(default),
    }
}

fn rate_rule<F>(lookup: &F, dimension: &str, default: RateRule) -> Result<RateRule, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let capacity: u32 = parse_or(
        lookup,
        &format!("RATE_LIMIT_{dimension}_CAPACITY"),
        default.capacity,
    )?;
    if capacity == 0 {
        return Err(AppError::Config(format!(
            "RATE_LIMIT_{dimension}_CAPACITY must be > 0"
        )));
    }
    Ok(RateRule {
        capacity,
        refill_per_second: parse_or(
            lookup,
            &format!("RATE_LIMIT_{dimension}_REFILL_PER_SEC"),
            default.refill_per_second,
        )?,
    })
}
