/*!
 * In-process cache backend
 * Same observable semantics as Redis for the commands the cache layer issues
 */

use super::{CacheBackend, Subscription};
use crate::error::{DbKeeperError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Glob (`*`, `?`) to an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expression = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression).map_err(|e| DbKeeperError::Validation(format!("bad key pattern '{}': {}", pattern, e)))
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that behaves like an unreachable server.
    pub fn unavailable() -> Self {
        let backend = Self::default();
        backend.set_available(false);
        backend
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DbKeeperError::CacheUnavailable("memory cache is offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Live entry for `key`, purging it first if it has expired.
    fn with_entry<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        if entries.get(key).map(|e| e.is_expired(Instant::now())).unwrap_or(false) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.with_entry(key, |entry| match entry.map(|e| &e.value) {
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::List(_)) => Err(DbKeeperError::Internal(
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
            )),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        self.check()?;
        let expires_at = ttl_seconds.map(|ttl| Instant::now() + Duration::from_secs(ttl.max(1)));
        self.entries.lock().insert(
            key.to_string(),
            Entry { value: Value::Text(value.to_string()), expires_at },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| !entry.is_expired(now))
            .count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.with_entry(key, |entry| entry.is_some()))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        self.check()?;
        Ok(self.with_entry(key, |entry| match entry {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
                true
            }
            None => false,
        }))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.check()?;
        Ok(self.with_entry(key, |entry| match entry {
            Some(Entry { expires_at: Some(at), .. }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                // Redis rounds to the nearest second.
                ((remaining.as_millis() + 500) / 1000) as i64
            }
            Some(_) => -1,
            None => -2,
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Text("0".to_string()),
            expires_at: None,
        });
        let current = match &entry.value {
            Value::Text(text) => text
                .parse::<i64>()
                .map_err(|_| DbKeeperError::Internal("ERR value is not an integer".to_string()))?,
            Value::List(_) => return Err(DbKeeperError::Internal("WRONGTYPE".to_string())),
        };
        let next = current + 1;
        entry.value = Value::Text(next.to_string());
        Ok(next)
    }

    async fn push_capped(&self, key: &str, value: &str, max_len: usize, ttl_seconds: u64) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(items) => {
                items.push_front(value.to_string());
                items.truncate(max_len.max(1));
            }
            Value::Text(_) => return Err(DbKeeperError::Internal("WRONGTYPE".to_string())),
        }
        entry.expires_at = Some(now + Duration::from_secs(ttl_seconds));
        Ok(())
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.check()?;
        self.with_entry(key, |entry| match entry.map(|e| &e.value) {
            Some(Value::List(items)) => {
                let len = items.len() as i64;
                let resolve = |i: i64| if i < 0 { (len + i).max(0) } else { i };
                let (start, stop) = (resolve(start), resolve(stop).min(len - 1));
                if len == 0 || start > stop {
                    return Ok(Vec::new());
                }
                Ok(items
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(Value::Text(_)) => Err(DbKeeperError::Internal("WRONGTYPE".to_string())),
            None => Ok(Vec::new()),
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        self.check()?;
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in senders.iter() {
            if tx.try_send(message.to_string()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.check()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.lock().entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(channel, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        let matcher = glob_to_regex("presence:trip.1:*").unwrap();
        assert!(matcher.is_match("presence:trip.1:user-9"));
        assert!(!matcher.is_match("presence:tripX1:user-9"));
        assert!(!matcher.is_match("presence:trip.10"));
    }

    #[tokio::test]
    async fn test_capped_list_keeps_newest() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend.push_capped("log", &i.to_string(), 3, 60).await.unwrap();
        }
        assert_eq!(backend.range("log", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(backend.range("log", 0, 0).await.unwrap(), vec!["4"]);
    }

    #[tokio::test]
    async fn test_ttl_and_incr() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.ttl("counter").await.unwrap(), -2);
        assert_eq!(backend.incr("counter").await.unwrap(), 1);
        assert_eq!(backend.ttl("counter").await.unwrap(), -1);
        assert!(backend.expire("counter", 60).await.unwrap());
        assert_eq!(backend.ttl("counter").await.unwrap(), 60);
        assert_eq!(backend.incr("counter").await.unwrap(), 2);
    }
}
