/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file cache/mod.rs
 * @brief Advisory cache layer: TTL entries, invalidation, pub/sub and rate limits
 */

pub mod memory;
pub mod redis;
pub mod resp;

pub use memory::MemoryBackend;
pub use redis::{RedisAddress, RedisBackend};

use crate::config::CacheConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use metrics::counter;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SESSION_TTL: u64 = 24 * 60 * 60;
pub const PROFILE_TTL: u64 = 30 * 60;
pub const PREFERENCES_TTL: u64 = 60 * 60;
pub const TRIP_TTL: u64 = 30 * 60;
pub const USER_TRIPS_TTL: u64 = 30 * 60;
pub const COLLABORATORS_TTL: u64 = 30 * 60;
pub const PRESENCE_TTL: u64 = 5 * 60;
pub const ACTIVITY_TTL: u64 = 24 * 60 * 60;
pub const ACTIVITY_LIMIT: usize = 100;

/// Raw key/value operations. Every error is a [`CacheUnavailable`](crate::error::DbKeeperError::CacheUnavailable)
/// or protocol error that [`CacheLayer`] absorbs.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;
    async fn del(&self, keys: &[String]) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool>;
    /// Seconds left, `-1` without expiry, `-2` when missing.
    async fn ttl(&self, key: &str) -> Result<i64>;
    async fn incr(&self, key: &str) -> Result<i64>;
    /// Prepend to a list, keep the newest `max_len` items and refresh the TTL.
    async fn push_capped(&self, key: &str, value: &str, max_len: usize, ttl_seconds: u64) -> Result<()>;
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
    async fn publish(&self, channel: &str, message: &str) -> Result<u64>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Messages published on one channel after subscribing. Missed messages are
/// not replayed.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(channel: &str, receiver: mpsc::Receiver<String>) -> Self {
        Self { channel: channel.to_string(), receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealth {
    pub available: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Best-effort cache in front of the primary store. No method returns an
/// error: reads miss and writes report `false` when the backend is down.
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    health_interval: Duration,
    healthy: AtomicBool,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            prefix: config.key_prefix.clone(),
            health_interval: Duration::from_millis(config.health_check_interval_ms.max(1)),
            healthy: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        })
    }

    /// Redis when enabled, otherwise a backend that always misses.
    pub fn from_config(config: &CacheConfig) -> Result<Arc<Self>> {
        let backend: Arc<dyn CacheBackend> = if config.enabled {
            Arc::new(RedisBackend::new(config)?)
        } else {
            info!("Cache disabled; all lookups will miss");
            Arc::new(MemoryBackend::unavailable())
        };
        Ok(Self::new(backend, config))
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn absorb<T>(&self, operation: &str, key: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                counter!("dbkeeper_cache_errors_total").increment(1);
                warn!("Cache {} failed for '{}': {}", operation, key, e);
                None
            }
        }
    }

    // Baseline operations

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: Option<u64>) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot serialize cache value for '{}': {}", key, e);
                return false;
            }
        };
        let key = self.key(key);
        let result = self.backend.set(&key, &payload, ttl_seconds).await;
        self.absorb("set", &key, result).is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = self.key(key);
        let result = self.backend.get(&key).await;
        let raw = match self.absorb("get", &key, result).flatten() {
            Some(raw) => raw,
            None => {
                counter!("dbkeeper_cache_misses_total").increment(1);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                counter!("dbkeeper_cache_hits_total").increment(1);
                Some(value)
            }
            Err(e) => {
                counter!("dbkeeper_cache_misses_total").increment(1);
                warn!("Discarding undecodable cache entry '{}': {}", key, e);
                None
            }
        }
    }

    /// `true` when at least one key was removed.
    pub async fn del(&self, key: &str) -> bool {
        self.del_many(&[self.key(key)]).await > 0
    }

    async fn del_many(&self, keys: &[String]) -> u64 {
        let result = self.backend.del(keys).await;
        self.absorb("del", &keys.join(","), result).unwrap_or(0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let key = self.key(key);
        let result = self.backend.exists(&key).await;
        self.absorb("exists", &key, result).unwrap_or(false)
    }

    pub async fn expire(&self, key: &str, ttl_seconds: u64) -> bool {
        let key = self.key(key);
        let result = self.backend.expire(&key, ttl_seconds).await;
        self.absorb("expire", &key, result).unwrap_or(false)
    }

    // Sessions

    /// Stores the session and a `user:<id>:session` pointer to it.
    pub async fn set_session<T: Serialize + ?Sized>(&self, session_id: &str, user_id: &str, data: &T) -> bool {
        let stored = self.set(&format!("session:{}", session_id), data, Some(SESSION_TTL)).await;
        stored && self.set(&format!("user:{}:session", user_id), session_id, Some(SESSION_TTL)).await
    }

    pub async fn get_session<T: DeserializeOwned>(&self, session_id: &str) -> Option<T> {
        self.get(&format!("session:{}", session_id)).await
    }

    pub async fn delete_session(&self, session_id: &str) -> bool {
        self.del(&format!("session:{}", session_id)).await
    }

    // Users

    pub async fn cache_user_profile<T: Serialize + ?Sized>(&self, user_id: &str, profile: &T) -> bool {
        self.set(&format!("user:{}:profile", user_id), profile, Some(PROFILE_TTL)).await
    }

    pub async fn get_cached_user_profile<T: DeserializeOwned>(&self, user_id: &str) -> Option<T> {
        self.get(&format!("user:{}:profile", user_id)).await
    }

    pub async fn cache_user_preferences<T: Serialize + ?Sized>(&self, user_id: &str, preferences: &T) -> bool {
        self.set(&format!("user:{}:preferences", user_id), preferences, Some(PREFERENCES_TTL)).await
    }

    pub async fn get_cached_user_preferences<T: DeserializeOwned>(&self, user_id: &str) -> Option<T> {
        self.get(&format!("user:{}:preferences", user_id)).await
    }

    pub async fn cache_user_trips<T: Serialize + ?Sized>(&self, user_id: &str, trips: &T) -> bool {
        self.set(&format!("user:{}:trips", user_id), trips, Some(USER_TRIPS_TTL)).await
    }

    pub async fn get_cached_user_trips<T: DeserializeOwned>(&self, user_id: &str) -> Option<T> {
        self.get(&format!("user:{}:trips", user_id)).await
    }

    // Trips

    pub async fn cache_trip<T: Serialize + ?Sized>(&self, trip_id: &str, trip: &T) -> bool {
        self.set(&format!("trip:{}", trip_id), trip, Some(TRIP_TTL)).await
    }

    pub async fn get_cached_trip<T: DeserializeOwned>(&self, trip_id: &str) -> Option<T> {
        self.get(&format!("trip:{}", trip_id)).await
    }

    pub async fn cache_trip_collaborators<T: Serialize + ?Sized>(&self, trip_id: &str, collaborators: &T) -> bool {
        self.set(&format!("trip:{}:collaborators", trip_id), collaborators, Some(COLLABORATORS_TTL)).await
    }

    pub async fn get_cached_trip_collaborators<T: DeserializeOwned>(&self, trip_id: &str) -> Option<T> {
        self.get(&format!("trip:{}:collaborators", trip_id)).await
    }

    pub async fn set_user_presence<T: Serialize + ?Sized>(&self, trip_id: &str, user_id: &str, presence: &T) -> bool {
        self.set(&format!("presence:{}:{}", trip_id, user_id), presence, Some(PRESENCE_TTL)).await
    }

    pub async fn get_user_presence<T: DeserializeOwned>(&self, trip_id: &str, user_id: &str) -> Option<T> {
        self.get(&format!("presence:{}:{}", trip_id, user_id)).await
    }

    /// Newest first, at most [`ACTIVITY_LIMIT`] entries kept.
    pub async fn log_trip_activity<T: Serialize + ?Sized>(&self, trip_id: &str, activity: &T) -> bool {
        let payload = match serde_json::to_string(activity) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot serialize activity for trip {}: {}", trip_id, e);
                return false;
            }
        };
        let key = self.key(&format!("trip:{}:activity", trip_id));
        let result = self.backend.push_capped(&key, &payload, ACTIVITY_LIMIT, ACTIVITY_TTL).await;
        self.absorb("log activity", &key, result).is_some()
    }

    pub async fn get_trip_activity<T: DeserializeOwned>(&self, trip_id: &str, limit: usize) -> Vec<T> {
        let key = self.key(&format!("trip:{}:activity", trip_id));
        let stop = limit.clamp(1, ACTIVITY_LIMIT) as i64 - 1;
        let result = self.backend.range(&key, 0, stop).await;
        self.absorb("read activity", &key, result)
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }

    // Invalidation

    /// Deletes the user's fixed key set, including the session the pointer names.
    pub async fn invalidate_user_cache(&self, user_id: &str) -> bool {
        let pointer = format!("user:{}:session", user_id);
        let mut keys = vec![
            self.key(&format!("user:{}:profile", user_id)),
            self.key(&format!("user:{}:preferences", user_id)),
            self.key(&format!("user:{}:trips", user_id)),
            self.key(&pointer),
        ];
        if let Some(session_id) = self.get::<String>(&pointer).await {
            keys.push(self.key(&format!("session:{}", session_id)));
        }

        let result = self.backend.del(&keys).await;
        let removed = self.absorb("invalidate user", user_id, result);
        debug!("Invalidated {:?} cache key(s) for user {}", removed, user_id);
        removed.is_some()
    }

    /// Trip keys, each collaborator's trip list and the trip's presence namespace.
    pub async fn invalidate_trip_cache(&self, trip_id: &str, collaborator_ids: &[String]) -> bool {
        let mut keys = vec![
            self.key(&format!("trip:{}", trip_id)),
            self.key(&format!("trip:{}:collaborators", trip_id)),
            self.key(&format!("trip:{}:activity", trip_id)),
        ];
        keys.extend(
            collaborator_ids
                .iter()
                .map(|user_id| self.key(&format!("user:{}:trips", user_id))),
        );

        let pattern = self.key(&format!("presence:{}:*", trip_id));
        let presence = self.backend.scan_keys(&pattern).await;
        let scanned = self.absorb("scan presence", &pattern, presence);
        let complete = scanned.is_some();
        keys.extend(scanned.unwrap_or_default());

        let result = self.backend.del(&keys).await;
        complete && self.absorb("invalidate trip", trip_id, result).is_some()
    }

    // Pub/sub

    /// Receivers reached, `0` when nobody listens or the cache is down.
    pub async fn publish_trip_update<T: Serialize + ?Sized>(&self, trip_id: &str, update: &T) -> u64 {
        let payload = match serde_json::to_string(update) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot serialize update for trip {}: {}", trip_id, e);
                return 0;
            }
        };
        let channel = self.key(&format!("trip:{}:updates", trip_id));
        let result = self.backend.publish(&channel, &payload).await;
        self.absorb("publish", &channel, result).unwrap_or(0)
    }

    pub async fn subscribe_trip_updates(&self, trip_id: &str) -> Option<Subscription> {
        let channel = self.key(&format!("trip:{}:updates", trip_id));
        let result = self.backend.subscribe(&channel).await;
        self.absorb("subscribe", &channel, result)
    }

    // Rate limiting

    /// Fixed window counter. Fails open when the cache is unavailable.
    pub async fn check_rate_limit(&self, identifier: &str, limit: u64, window_seconds: u64) -> RateLimitResult {
        let key = self.key(&format!("ratelimit:{}", identifier));
        let window = window_seconds.max(1);

        let counted = async {
            let count = self.backend.incr(&key).await?;
            let mut ttl = if count == 1 {
                self.backend.expire(&key, window).await?;
                window as i64
            } else {
                self.backend.ttl(&key).await?
            };
            if ttl < 0 {
                self.backend.expire(&key, window).await?;
                ttl = window as i64;
            }
            Ok::<_, crate::error::DbKeeperError>((count.max(0) as u64, ttl as u64))
        }
        .await;

        let (count, ttl) = match self.absorb("rate limit", &key, counted) {
            Some(counted) => counted,
            None => {
                return RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    reset_time: Utc::now() + chrono::Duration::seconds(window as i64),
                    count: 0,
                }
            }
        };

        let allowed = count <= limit;
        if !allowed {
            counter!("dbkeeper_rate_limit_rejections_total").increment(1);
        }
        RateLimitResult {
            allowed,
            remaining: limit.saturating_sub(count),
            reset_time: Utc::now() + chrono::Duration::seconds(ttl as i64),
            count,
        }
    }

    // Health

    pub async fn health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let result = self.backend.ping().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let available = result.is_ok();
        if self.healthy.swap(available, Ordering::SeqCst) != available {
            if available {
                info!("Cache is reachable again");
            } else {
                warn!("Cache became unreachable");
            }
        }

        CacheHealth {
            available,
            latency_ms,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Periodic health probe, re-armed only after the previous one finishes.
    pub fn start_health_checks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let interval = self.health_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                let Some(cache) = weak.upgrade() else { break };
                cache.health_check().await;
            }
        });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn layer() -> (Arc<MemoryBackend>, Arc<CacheLayer>) {
        let backend = Arc::new(MemoryBackend::new());
        let config = CacheConfig { key_prefix: "tp:".to_string(), ..Default::default() };
        (backend.clone(), CacheLayer::new(backend, &config))
    }

    #[tokio::test]
    async fn test_prefix_and_ttls() {
        let (backend, cache) = layer();
        assert!(cache.cache_trip("t1", &json!({ "name": "Porto" })).await);
        assert_eq!(backend.ttl("tp:trip:t1").await.unwrap(), TRIP_TTL as i64);

        let trip: serde_json::Value = cache.get_cached_trip("t1").await.unwrap();
        assert_eq!(trip["name"], "Porto");
    }

    #[tokio::test]
    async fn test_activity_log_is_bounded() {
        let (_backend, cache) = layer();
        for i in 0..(ACTIVITY_LIMIT + 20) {
            assert!(cache.log_trip_activity("t1", &json!({ "seq": i })).await);
        }
        let activity: Vec<serde_json::Value> = cache.get_trip_activity("t1", 1_000).await;
        assert_eq!(activity.len(), ACTIVITY_LIMIT);
        assert_eq!(activity[0]["seq"], ACTIVITY_LIMIT + 19);
    }

    #[tokio::test]
    async fn test_subscription_stream() {
        let (_backend, cache) = layer();
        let mut subscription = cache.subscribe_trip_updates("t1").await.unwrap();
        assert_eq!(subscription.channel(), "tp:trip:t1:updates");

        assert_eq!(cache.publish_trip_update("t1", &json!({ "op": "rename" })).await, 1);
        let message = subscription.next().await.unwrap();
        assert_eq!(message, r#"{"op":"rename"}"#);
    }
}
