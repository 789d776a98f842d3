//! Redis-backed result cache with per-class TTLs.
//!
//! Fingerprint-keyed memoization of simulation and optimization responses.
//! Every operation is best-effort: backend failures never fail the request.
//! On connect failure (at startup or after exhausting retries) the cache
//! disables itself; subsequent gets return misses and sets are no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "redis-cache")]
use redis::aio::ConnectionManager;

use crate::monitor::{CacheOp, ExecutionMonitor};

/// Key namespace for backtest results.
const CACHE_PREFIX: &str = "backtest:";

/// Per-operation timeout.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry attempts per operation.
const RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Result class, selecting the TTL a cached entry lives for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    /// Single simulation: 24 h
    Standard,
    /// Grid optimization: 48 h
    Optimization,
    /// Monte-Carlo resample: 12 h
    MonteCarlo,
    /// Quick scan: 6 h
    QuickScan,
}

impl ResultClass {
    /// TTL in seconds for this class.
    pub fn ttl_seconds(self) -> u64 {
        match self {
            Self::Standard => 24 * 3600,
            Self::Optimization => 48 * 3600,
            Self::MonteCarlo => 12 * 3600,
            Self::QuickScan => 6 * 3600,
        }
    }
}

/// Cache client wrapper.
#[derive(Clone)]
pub struct ResultCache {
    #[cfg(feature = "redis-cache")]
    conn: Option<ConnectionManager>,
    enabled: Arc<AtomicBool>,
    monitor: Arc<ExecutionMonitor>,
}

impl ResultCache {
    /// Connect to Redis, degrading to a disabled cache on any failure.
    #[cfg(feature = "redis-cache")]
    pub async fn new(redis_url: Option<&str>, monitor: Arc<ExecutionMonitor>) -> Self {
        let conn = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => {
                    match tokio::time::timeout(OP_TIMEOUT, ConnectionManager::new(client)).await {
                        Ok(Ok(manager)) => {
                            tracing::info!(url, "result cache connected");
                            Some(manager)
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Redis connection failed; caching disabled");
                            None
                        }
                        Err(_) => {
                            tracing::warn!("Redis connection timed out; caching disabled");
                            None
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invalid Redis URL; caching disabled");
                    None
                }
            },
            None => {
                tracing::info!("no REDIS_URL configured; caching disabled");
                None
            }
        };

        let enabled = Arc::new(AtomicBool::new(conn.is_some()));
        Self {
            conn,
            enabled,
            monitor,
        }
    }

    /// Build a disabled cache when the redis feature is off.
    #[cfg(not(feature = "redis-cache"))]
    pub async fn new(_redis_url: Option<&str>, monitor: Arc<ExecutionMonitor>) -> Self {
        tracing::info!("redis-cache feature not enabled; caching disabled");
        Self {
            enabled: Arc::new(AtomicBool::new(false)),
            monitor,
        }
    }

    /// Whether the backend is currently usable.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Namespaced storage key for a fingerprint.
    pub fn storage_key(fingerprint: &str) -> String {
        format!("{CACHE_PREFIX}{fingerprint}")
    }

    fn disable(&self) {
        if self.enabled.swap(false, Ordering::Relaxed) {
            tracing::warn!("cache backend unreachable; disabling result cache");
        }
    }

    /// Look up a cached result. Any backend or deserialization problem is a
    /// miss.
    #[cfg(feature = "redis-cache")]
    pub async fn get(&self, fingerprint: &str) -> Option<serde_json::Value> {
        if !self.is_enabled() {
            return None;
        }
        let conn = self.conn.as_ref()?;
        let key = Self::storage_key(fingerprint);

        let start = Instant::now();
        let outcome = self
            .with_retry(|| {
                let mut conn = conn.clone();
                let key = key.clone();
                async move {
                    redis::cmd("GET")
                        .arg(&key)
                        .query_async::<Option<String>>(&mut conn)
                        .await
                }
            })
            .await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let value = match outcome {
            Some(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    tracing::debug!(key = %key, "cache HIT");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "cache deserialize error; treating as miss");
                    None
                }
            },
            Some(None) => {
                tracing::debug!(key = %key, "cache MISS");
                None
            }
            None => None,
        };

        self.monitor
            .record_cache_op(CacheOp::Get, elapsed_ms, value.is_some());
        value
    }

    #[cfg(not(feature = "redis-cache"))]
    pub async fn get(&self, _fingerprint: &str) -> Option<serde_json::Value> {
        self.monitor.record_cache_op(CacheOp::Get, 0.0, false);
        None
    }

    /// Store a result under its fingerprint with the class TTL. Best-effort.
    #[cfg(feature = "redis-cache")]
    pub async fn set(&self, fingerprint: &str, value: &serde_json::Value, class: ResultClass) {
        if !self.is_enabled() {
            return;
        }
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        let key = Self::storage_key(fingerprint);
        let ttl = class.ttl_seconds();

        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache serialize error; skipping set");
                return;
            }
        };

        let start = Instant::now();
        let outcome = self
            .with_retry(|| {
                let mut conn = conn.clone();
                let key = key.clone();
                let payload = payload.clone();
                async move {
                    redis::cmd("SETEX")
                        .arg(&key)
                        .arg(ttl)
                        .arg(&payload)
                        .query_async::<()>(&mut conn)
                        .await
                }
            })
            .await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

        if outcome.is_some() {
            tracing::debug!(key = %key, ttl, "cache SET");
        }
        self.monitor.record_cache_op(CacheOp::Set, elapsed_ms, false);
    }

    #[cfg(not(feature = "redis-cache"))]
    pub async fn set(&self, _fingerprint: &str, _value: &serde_json::Value, _class: ResultClass) {}

    /// Delete entries matching `pattern` inside the namespace. Returns the
    /// number removed (0 when the cache is unavailable).
    #[cfg(feature = "redis-cache")]
    pub async fn clear(&self, pattern: &str) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let Some(conn) = self.conn.as_ref() else {
            return 0;
        };
        let scoped = format!("{CACHE_PREFIX}{pattern}");

        let keys: Vec<String> = match self
            .with_retry(|| {
                let mut conn = conn.clone();
                let scoped = scoped.clone();
                async move {
                    redis::cmd("KEYS")
                        .arg(&scoped)
                        .query_async::<Vec<String>>(&mut conn)
                        .await
                }
            })
            .await
        {
            Some(keys) => keys,
            None => return 0,
        };

        if keys.is_empty() {
            return 0;
        }

        let deleted = self
            .with_retry(|| {
                let mut conn = conn.clone();
                let keys = keys.clone();
                async move {
                    let mut cmd = redis::cmd("DEL");
                    for key in &keys {
                        cmd.arg(key);
                    }
                    cmd.query_async::<usize>(&mut conn).await
                }
            })
            .await
            .unwrap_or(0);

        tracing::info!(pattern = %scoped, deleted, "cache cleared");
        deleted
    }

    #[cfg(not(feature = "redis-cache"))]
    pub async fn clear(&self, _pattern: &str) -> usize {
        0
    }

    /// Backend statistics: availability and namespaced key count.
    #[cfg(feature = "redis-cache")]
    pub async fn stats(&self) -> serde_json::Value {
        if !self.is_enabled() {
            return serde_json::json!({ "enabled": false, "key_count": 0 });
        }
        let Some(conn) = self.conn.as_ref() else {
            return serde_json::json!({ "enabled": false, "key_count": 0 });
        };

        let key_count = self
            .with_retry(|| {
                let mut conn = conn.clone();
                async move {
                    redis::cmd("KEYS")
                        .arg(format!("{CACHE_PREFIX}*"))
                        .query_async::<Vec<String>>(&mut conn)
                        .await
                }
            })
            .await
            .map(|keys| keys.len())
            .unwrap_or(0);

        serde_json::json!({ "enabled": true, "key_count": key_count })
    }

    #[cfg(not(feature = "redis-cache"))]
    pub async fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "enabled": false, "key_count": 0 })
    }

    /// Run an operation with per-attempt timeout and exponential backoff.
    ///
    /// Exhausting all attempts disables the cache.
    #[cfg(feature = "redis-cache")]
    async fn with_retry<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        for attempt in 0..RETRY_ATTEMPTS {
            match tokio::time::timeout(OP_TIMEOUT, op()).await {
                Ok(Ok(value)) => return Some(value),
                Ok(Err(e)) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        attempts = RETRY_ATTEMPTS,
                        error = %e,
                        "cache operation failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        attempts = RETRY_ATTEMPTS,
                        "cache operation timed out"
                    );
                }
            }
            if attempt + 1 < RETRY_ATTEMPTS {
                tokio::time::sleep(RETRY_BASE_DELAY * 2_u32.pow(attempt)).await;
            }
        }
        self.disable();
        None
    }
}
