//! Key-value backends for the network tier.
//!
//! [`KvBackend`] is the small command surface the network tier needs from a
//! Redis-style server: strings with expiry, sets and capped lists.
//! [`MemoryKvBackend`] implements it in process, honouring expiries on the
//! tokio clock, and can be switched offline or slowed down to simulate an
//! unreachable or stalled server.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Result, StrataError};
use crate::types::Tier;

/// Commands the network tier issues against its server.
///
/// List indices follow Redis conventions: negative values count from the
/// end, `stop` is inclusive.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Check the server is reachable.
    async fn ping(&self) -> Result<()>;
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Write a string value with an expiry.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Remaining time to live; `None` if the key is missing or never expires.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>>;
    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;
    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    /// Set a key's expiry.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    /// Push onto the head of a list.
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Keep only the `start..=stop` range of a list.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;
    /// Read the `start..=stop` range of a list.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;
    /// Drop any open connection.
    async fn close(&self);
}

/// A shared backend, so a caller can keep a handle to it after handing it
/// to the network tier.
#[async_trait]
impl<B: KvBackend + ?Sized> KvBackend for Arc<B> {
    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        (**self).set_ex(key, value, ttl).await
    }
    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        (**self).pttl(key).await
    }
    async fn del(&self, key: &str) -> Result<bool> {
        (**self).del(key).await
    }
    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        (**self).sadd(key, member).await
    }
    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        (**self).srem(key, member).await
    }
    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        (**self).smembers(key).await
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        (**self).expire(key, ttl).await
    }
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).lpush(key, value).await
    }
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        (**self).ltrim(key, start, stop).await
    }
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        (**self).lrange(key, start, stop).await
    }
    async fn close(&self) {
        (**self).close().await;
    }
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| t > now)
    }
}

/// In-process [`KvBackend`] with real expiry semantics.
///
/// Expiry is measured on the tokio clock, so tests running with a paused
/// runtime can advance time deterministically.
#[derive(Debug)]
pub struct MemoryKvBackend {
    data: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    latency: Mutex<Duration>,
    commands: AtomicU64,
}

impl Default for MemoryKvBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvBackend {
    /// An empty, reachable backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            commands: AtomicU64::new(0),
        }
    }

    /// Simulate the server going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every following command by `latency` on the tokio clock.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of commands served (including failed ones).
    #[must_use]
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Number of live keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.data.lock().values().filter(|e| e.is_live(now)).count()
    }

    async fn check(&self, operation: &'static str) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StrataError::Transport {
                tier: Tier::Network,
                operation,
                reason: "connection refused".to_string(),
            })
        }
    }

    /// Run `f` on the live entry for `key`, purging it first if expired.
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }

    fn wrong_type(operation: &'static str) -> StrataError {
        StrataError::Transport {
            tier: Tier::Network,
            operation,
            reason: "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
        }
    }
}

/// Resolve Redis-style inclusive indices against a list of `len` items.
fn list_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn ping(&self) -> Result<()> {
        self.check("ping").await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check("get").await?;
        self.with_live(key, |e| match e {
            None => Ok(None),
            Some(Entry { value: Value::Bytes(b), .. }) => Ok(Some(b.clone())),
            Some(_) => Err(Self::wrong_type("get")),
        })
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check("set").await?;
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check("pttl").await?;
        let now = Instant::now();
        Ok(self.with_live(key, |e| {
            e.and_then(|e| e.expires_at).map(|t| t.saturating_duration_since(now))
        }))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check("del").await?;
        let now = Instant::now();
        Ok(self.data.lock().remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.check("sadd").await?;
        let inserted = self.with_live(key, |e| match e {
            Some(Entry { value: Value::Set(set), .. }) => {
                set.insert(member.to_string());
                Ok(true)
            }
            Some(_) => Err(Self::wrong_type("sadd")),
            None => Ok(false),
        })?;
        if !inserted {
            self.data.lock().insert(
                key.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::from([member.to_string()])),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.check("srem").await?;
        self.with_live(key, |e| match e {
            Some(Entry { value: Value::Set(set), .. }) => {
                set.remove(member);
                Ok(())
            }
            Some(_) => Err(Self::wrong_type("srem")),
            None => Ok(()),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check("smembers").await?;
        self.with_live(key, |e| match e {
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_type("smembers")),
            None => Ok(Vec::new()),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check("expire").await?;
        self.with_live(key, |e| {
            if let Some(e) = e {
                e.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check("lpush").await?;
        let pushed = self.with_live(key, |e| match e {
            Some(Entry { value: Value::List(list), .. }) => {
                list.push_front(value.to_vec());
                Ok(true)
            }
            Some(_) => Err(Self::wrong_type("lpush")),
            None => Ok(false),
        })?;
        if !pushed {
            self.data.lock().insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::from([value.to_vec()])),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.check("ltrim").await?;
        self.with_live(key, |e| match e {
            Some(Entry { value: Value::List(list), .. }) => {
                match list_range(list.len(), start, stop) {
                    Some((s, t)) => {
                        list.truncate(t + 1);
                        list.drain(..s);
                    }
                    None => list.clear(),
                }
                Ok(())
            }
            Some(_) => Err(Self::wrong_type("ltrim")),
            None => Ok(()),
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        self.check("lrange").await?;
        self.with_live(key, |e| match e {
            Some(Entry { value: Value::List(list), .. }) => Ok(list_range(list.len(), start, stop)
                .map(|(s, t)| list.range(s..=t).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(Self::wrong_type("lrange")),
            None => Ok(Vec::new()),
        })
    }

    async fn close(&self) {}
}
