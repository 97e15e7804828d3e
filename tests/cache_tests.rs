/*!
 * Cache layer tests for DbKeeper
 * Miss-safety, invalidation fan-out, rate limiting and pub/sub on the memory backend
 */

use anyhow::Result;
use dbkeeper::cache::{CacheBackend, CacheLayer, MemoryBackend};
use dbkeeper::config::CacheConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    email: String,
}

fn profile(name: &str) -> Profile {
    Profile {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
    }
}

fn cache_with(backend: Arc<MemoryBackend>) -> Arc<CacheLayer> {
    CacheLayer::new(backend, &CacheConfig::default())
}

#[tokio::test]
async fn test_unreachable_cache_misses_without_errors() -> Result<()> {
    let cache = cache_with(Arc::new(MemoryBackend::unavailable()));

    assert!(!cache.set("user:u1:profile", &profile("Ana"), Some(60)).await);
    assert_eq!(cache.get::<Profile>("user:u1:profile").await, None);
    assert!(!cache.del("user:u1:profile").await);
    assert!(!cache.exists("user:u1:profile").await);
    assert!(!cache.expire("user:u1:profile", 60).await);

    assert!(!cache.set_session("s1", "u1", &json!({ "userId": "u1" })).await);
    assert_eq!(cache.get_session::<Value>("s1").await, None);
    assert!(!cache.cache_trip("t1", &json!({ "name": "Oslo" })).await);
    assert!(!cache.log_trip_activity("t1", &json!({ "op": "edit" })).await);
    assert!(cache.get_trip_activity::<Value>("t1", 10).await.is_empty());

    assert!(!cache.invalidate_user_cache("u1").await);
    assert!(!cache.invalidate_trip_cache("t1", &["u1".to_string()]).await);
    assert_eq!(cache.publish_trip_update("t1", &json!({ "op": "edit" })).await, 0);
    assert!(cache.subscribe_trip_updates("t1").await.is_none());

    let limit = cache.check_rate_limit("api:u1", 3, 60).await;
    assert!(limit.allowed);
    assert_eq!(limit.remaining, 3);

    let health = cache.health_check().await;
    assert!(!health.available);
    assert!(!cache.is_healthy());

    Ok(())
}

#[tokio::test]
async fn test_cache_outage_mid_session() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let cache = cache_with(backend.clone());

    assert!(cache.cache_user_profile("u1", &profile("Ana")).await);
    assert_eq!(cache.get_cached_user_profile::<Profile>("u1").await, Some(profile("Ana")));

    backend.set_available(false);
    assert_eq!(cache.get_cached_user_profile::<Profile>("u1").await, None);
    assert!(!cache.cache_user_profile("u1", &profile("Bea")).await);

    backend.set_available(true);
    assert_eq!(cache.get_cached_user_profile::<Profile>("u1").await, Some(profile("Ana")));
    assert!(cache.health_check().await.available);

    Ok(())
}

#[tokio::test]
async fn test_user_invalidation_clears_every_user_key() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let cache = cache_with(backend.clone());

    assert!(cache.set_session("sess-1", "u1", &json!({ "userId": "u1" })).await);
    assert!(cache.cache_user_profile("u1", &profile("Ana")).await);
    assert!(cache.cache_user_preferences("u1", &json!({ "currency": "EUR" })).await);
    assert!(cache.cache_user_trips("u1", &json!(["t1", "t2"])).await);
    assert!(cache.cache_user_profile("u2", &profile("Bea")).await);

    assert!(cache.invalidate_user_cache("u1").await);

    assert_eq!(cache.get_cached_user_profile::<Profile>("u1").await, None);
    assert_eq!(cache.get_cached_user_preferences::<Value>("u1").await, None);
    assert_eq!(cache.get_cached_user_trips::<Value>("u1").await, None);
    assert_eq!(cache.get_session::<Value>("sess-1").await, None);
    assert!(!backend.exists("user:u1:session").await?);

    assert_eq!(cache.get_cached_user_profile::<Profile>("u2").await, Some(profile("Bea")));

    Ok(())
}

#[tokio::test]
async fn test_trip_invalidation_fans_out() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let cache = cache_with(backend.clone());

    assert!(cache.cache_trip("t1", &json!({ "name": "Lisbon" })).await);
    assert!(cache.cache_trip_collaborators("t1", &json!(["u1", "u2"])).await);
    assert!(cache.log_trip_activity("t1", &json!({ "op": "create" })).await);
    assert!(cache.set_user_presence("t1", "u1", &json!({ "status": "editing" })).await);
    assert!(cache.set_user_presence("t1", "u2", &json!({ "status": "viewing" })).await);
    assert!(cache.set_user_presence("t10", "u1", &json!({ "status": "viewing" })).await);
    for user in ["u1", "u2", "u3"] {
        assert!(cache.cache_user_trips(user, &json!(["t1"])).await);
    }

    assert!(cache.invalidate_trip_cache("t1", &["u1".to_string(), "u2".to_string()]).await);

    assert_eq!(cache.get_cached_trip::<Value>("t1").await, None);
    assert_eq!(cache.get_cached_trip_collaborators::<Value>("t1").await, None);
    assert!(cache.get_trip_activity::<Value>("t1", 10).await.is_empty());
    assert_eq!(cache.get_user_presence::<Value>("t1", "u1").await, None);
    assert_eq!(cache.get_user_presence::<Value>("t1", "u2").await, None);
    assert_eq!(cache.get_cached_user_trips::<Value>("u1").await, None);
    assert_eq!(cache.get_cached_user_trips::<Value>("u2").await, None);

    // Outside the trip's namespace and collaborator list.
    assert!(cache.get_user_presence::<Value>("t10", "u1").await.is_some());
    assert!(cache.get_cached_user_trips::<Value>("u3").await.is_some());

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_window_sequence() -> Result<()> {
    let cache = cache_with(Arc::new(MemoryBackend::new()));

    let remaining: Vec<(bool, u64)> = {
        let mut seen = Vec::new();
        for _ in 0..4 {
            let result = cache.check_rate_limit("login:u1", 3, 60).await;
            seen.push((result.allowed, result.remaining));
        }
        seen
    };
    assert_eq!(remaining, vec![(true, 2), (true, 1), (true, 0), (false, 0)]);

    let other = cache.check_rate_limit("login:u2", 3, 60).await;
    assert!(other.allowed);
    assert_eq!(other.count, 1);

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_resets_after_window() -> Result<()> {
    let cache = cache_with(Arc::new(MemoryBackend::new()));

    assert!(cache.check_rate_limit("export:u1", 1, 1).await.allowed);
    assert!(!cache.check_rate_limit("export:u1", 1, 1).await.allowed);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let fresh = cache.check_rate_limit("export:u1", 1, 1).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.count, 1);

    Ok(())
}

#[tokio::test]
async fn test_trip_updates_are_not_replayed() -> Result<()> {
    let cache = cache_with(Arc::new(MemoryBackend::new()));

    assert_eq!(cache.publish_trip_update("t1", &json!({ "seq": 1 })).await, 0);

    let mut subscription = cache.subscribe_trip_updates("t1").await.expect("subscription");
    assert_eq!(cache.publish_trip_update("t1", &json!({ "seq": 2 })).await, 1);

    let message = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await?
        .expect("message");
    let update: Value = serde_json::from_str(&message)?;
    assert_eq!(update["seq"], 2);

    let nothing_else = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
    assert!(nothing_else.is_err());

    Ok(())
}
