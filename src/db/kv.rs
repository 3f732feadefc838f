// Typed key-value store abstraction
// Redis in production, an in-process store for tests and single-node setups

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::redis_pool::RedisPool;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("Wrong value type for key {0}")]
    WrongType(String),

    #[error("Operation timed out")]
    Timeout,
}

/// One operation inside a pipelined write
#[derive(Debug, Clone)]
pub enum KvOp {
    Set {
        key: String,
        value: String,
    },
    SetEx {
        key: String,
        ttl_secs: u64,
        value: String,
    },
    Del {
        keys: Vec<String>,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    Incr {
        key: String,
    },
}

/// Outcome of a pipelined write: per-op failures are surfaced by index.
#[derive(Debug, Default)]
pub struct KvPipelineResult {
    pub applied: usize,
    pub failures: Vec<(usize, String)>,
}

impl KvPipelineResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Typed operations over the remote KV.
///
/// Callers decide the failure posture: read paths treat errors as a miss
/// (fail-open), write paths propagate them (fail-closed).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<(), KvError>;
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;
    async fn incr(&self, key: &str) -> Result<i64, KvError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError>;
    /// Remaining TTL in seconds; `None` when the key is missing or has no TTL.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError>;
    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), KvError>;
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError>;
    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<KvPipelineResult, KvError>;
    async fn ping(&self) -> Result<(), KvError>;
}

/// Match a Redis-style glob pattern (only `*` is supported).
pub(crate) fn glob_match(pattern: &str, input: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == input;
    }

    let mut remaining = input;

    // First segment is anchored at the start
    if let Some(first) = segments.first() {
        if !remaining.starts_with(first) {
            return false;
        }
        remaining = &remaining[first.len()..];
    }

    // Last segment is anchored at the end
    let last = segments[segments.len() - 1];
    if !remaining.ends_with(last) {
        return false;
    }
    let end = remaining.len() - last.len();
    remaining = &remaining[..end];

    // Middle segments must appear in order
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match remaining.find(segment) {
            Some(pos) => remaining = &remaining[pos + segment.len()..],
            None => return false,
        }
    }

    true
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

#[derive(Debug, Clone)]
enum StoredValue {
    Str(String),
    Set(HashSet<String>),
    ZSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-process `KeyValueStore` with TTL semantics.
///
/// Expiry is evaluated lazily on access. Used by the test suite and by
/// single-node deployments that run without Redis.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return None;
            }
            return Some(entry.clone());
        }
        None
    }

    fn apply_op(&self, op: &KvOp) -> Result<(), KvError> {
        match op {
            KvOp::Set { key, value } => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: StoredValue::Str(value.clone()),
                        expires_at: None,
                    },
                );
                Ok(())
            },
            KvOp::SetEx {
                key,
                ttl_secs,
                value,
            } => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: StoredValue::Str(value.clone()),
                        expires_at: Some(Instant::now() + Duration::from_secs(*ttl_secs)),
                    },
                );
                Ok(())
            },
            KvOp::Del { keys } => {
                for key in keys {
                    self.entries.remove(key);
                }
                Ok(())
            },
            KvOp::SAdd { key, member } => {
                let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: StoredValue::Set(HashSet::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    StoredValue::Set(set) => {
                        set.insert(member.clone());
                        Ok(())
                    },
                    _ => Err(KvError::WrongType(key.clone())),
                }
            },
            KvOp::SRem { key, member } => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if let StoredValue::Set(set) = &mut entry.value {
                        set.remove(member);
                    }
                }
                Ok(())
            },
            KvOp::Expire { key, ttl_secs } => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(*ttl_secs));
                }
                Ok(())
            },
            KvOp::ZAdd { key, score, member } => {
                let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: StoredValue::ZSet(Vec::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    StoredValue::ZSet(zset) => {
                        zset.retain(|(_, m)| m != member);
                        zset.push((*score, member.clone()));
                        Ok(())
                    },
                    _ => Err(KvError::WrongType(key.clone())),
                }
            },
            KvOp::Incr { key } => {
                let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: StoredValue::Str("0".to_string()),
                    expires_at: None,
                });
                match &mut entry.value {
                    StoredValue::Str(s) => {
                        let n: i64 = s.parse().map_err(|_| KvError::WrongType(key.clone()))?;
                        *s = (n + 1).to_string();
                        Ok(())
                    },
                    _ => Err(KvError::WrongType(key.clone())),
                }
            },
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.live_entry(key) {
            Some(Entry {
                value: StoredValue::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.apply_op(&KvOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<(), KvError> {
        self.apply_op(&KvOp::SetEx {
            key: key.to_string(),
            ttl_secs,
            value: value.to_string(),
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut matched = Vec::new();
        let mut expired = Vec::new();
        for entry in self.entries.iter() {
            if entry.value().is_expired() {
                expired.push(entry.key().clone());
            } else if glob_match(pattern, entry.key()) {
                matched.push(entry.key().clone());
            }
        }
        for key in expired {
            self.entries.remove(&key);
        }
        Ok(matched)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        // Expired counters restart from zero
        if self
            .entries
            .get(key)
            .map(|e| e.is_expired())
            .unwrap_or(false)
        {
            self.entries.remove(key);
        }
        self.apply_op(&KvOp::Incr {
            key: key.to_string(),
        })?;
        match self.live_entry(key) {
            Some(Entry {
                value: StoredValue::Str(s),
                ..
            }) => s.parse().map_err(|_| KvError::WrongType(key.to_string())),
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        if self.live_entry(key).is_none() {
            return Ok(false);
        }
        self.apply_op(&KvOp::Expire {
            key: key.to_string(),
            ttl_secs,
        })?;
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError> {
        match self.live_entry(key) {
            Some(entry) => Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs())),
            None => Ok(None),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        if self
            .entries
            .get(key)
            .map(|e| e.is_expired())
            .unwrap_or(false)
        {
            self.entries.remove(key);
        }
        self.apply_op(&KvOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        self.apply_op(&KvOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        match self.live_entry(key) {
            Some(Entry {
                value: StoredValue::Set(set),
                ..
            }) => Ok(set.into_iter().collect()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), KvError> {
        self.apply_op(&KvOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        match self.live_entry(key) {
            Some(Entry {
                value: StoredValue::ZSet(zset),
                ..
            }) => {
                let mut in_range: Vec<(f64, String)> = zset
                    .into_iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .collect();
                in_range.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                Ok(in_range.into_iter().map(|(_, member)| member).collect())
            },
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<KvPipelineResult, KvError> {
        let mut result = KvPipelineResult::default();
        for (index, op) in ops.iter().enumerate() {
            match self.apply_op(op) {
                Ok(()) => result.applied += 1,
                Err(e) => result.failures.push((index, e.to_string())),
            }
        }
        Ok(result)
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

// =============================================================================
// REDIS IMPLEMENTATION
// =============================================================================

/// `KeyValueStore` backed by the pooled Redis client.
pub struct RedisKvStore {
    pool: RedisPool,
}

impl RedisKvStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let key = key.to_string();
        let value = self
            .pool
            .execute(|mut conn| async move {
                let value: Option<String> = redis::AsyncCommands::get(&mut conn, &key).await?;
                Ok((value, conn))
            })
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.pool
            .execute(|mut conn| async move {
                redis::AsyncCommands::set::<_, _, ()>(&mut conn, &key, &value).await?;
                Ok(((), conn))
            })
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<(), KvError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.pool
            .execute(|mut conn| async move {
                redis::AsyncCommands::set_ex::<_, _, ()>(&mut conn, &key, &value, ttl_secs)
                    .await?;
                Ok(((), conn))
            })
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        let removed = self
            .pool
            .execute(|mut conn| async move {
                let removed: u64 = redis::AsyncCommands::del(&mut conn, keys).await?;
                Ok((removed, conn))
            })
            .await?;
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let pattern = pattern.to_string();
        let keys = self
            .pool
            .execute(|mut conn| async move {
                let keys: Vec<String> = redis::AsyncCommands::keys(&mut conn, &pattern).await?;
                Ok((keys, conn))
            })
            .await?;
        Ok(keys)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let key = key.to_string();
        let value = self
            .pool
            .execute(|mut conn| async move {
                let value: i64 = redis::AsyncCommands::incr(&mut conn, &key, 1i64).await?;
                Ok((value, conn))
            })
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let key = key.to_string();
        let applied = self
            .pool
            .execute(|mut conn| async move {
                let applied: bool =
                    redis::AsyncCommands::expire(&mut conn, &key, ttl_secs as i64).await?;
                Ok((applied, conn))
            })
            .await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError> {
        let key = key.to_string();
        let ttl = self
            .pool
            .execute(|mut conn| async move {
                let ttl: i64 = redis::AsyncCommands::ttl(&mut conn, &key).await?;
                Ok((ttl, conn))
            })
            .await?;
        // -2 = missing key, -1 = no expiry
        Ok(if ttl >= 0 { Some(ttl as u64) } else { None })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.pool
            .execute(|mut conn| async move {
                redis::AsyncCommands::sadd::<_, _, ()>(&mut conn, &key, &member).await?;
                Ok(((), conn))
            })
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.pool
            .execute(|mut conn| async move {
                redis::AsyncCommands::srem::<_, _, ()>(&mut conn, &key, &member).await?;
                Ok(((), conn))
            })
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let key = key.to_string();
        let members = self
            .pool
            .execute(|mut conn| async move {
                let members: Vec<String> =
                    redis::AsyncCommands::smembers(&mut conn, &key).await?;
                Ok((members, conn))
            })
            .await?;
        Ok(members)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), KvError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.pool
            .execute(|mut conn| async move {
                redis::AsyncCommands::zadd::<_, _, _, ()>(&mut conn, &key, &member, score)
                    .await?;
                Ok(((), conn))
            })
            .await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        let key = key.to_string();
        let members = self
            .pool
            .execute(|mut conn| async move {
                let members: Vec<String> =
                    redis::AsyncCommands::zrangebyscore(&mut conn, &key, min, max).await?;
                Ok((members, conn))
            })
            .await?;
        Ok(members)
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<KvPipelineResult, KvError> {
        if ops.is_empty() {
            return Ok(KvPipelineResult::default());
        }

        let op_count = ops.len();
        let outcome = self
            .pool
            .execute(move |mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for op in &ops {
                    match op {
                        KvOp::Set { key, value } => {
                            pipe.set(key, value).ignore();
                        },
                        KvOp::SetEx {
                            key,
                            ttl_secs,
                            value,
                        } => {
                            pipe.set_ex(key, value, *ttl_secs).ignore();
                        },
                        KvOp::Del { keys } => {
                            pipe.del(keys.clone()).ignore();
                        },
                        KvOp::SAdd { key, member } => {
                            pipe.sadd(key, member).ignore();
                        },
                        KvOp::SRem { key, member } => {
                            pipe.srem(key, member).ignore();
                        },
                        KvOp::Expire { key, ttl_secs } => {
                            pipe.expire(key, *ttl_secs as i64).ignore();
                        },
                        KvOp::ZAdd { key, score, member } => {
                            pipe.zadd(key, member, *score).ignore();
                        },
                        KvOp::Incr { key } => {
                            pipe.incr(key, 1i64).ignore();
                        },
                    }
                }
                let outcome: Result<(), redis::RedisError> =
                    pipe.query_async(&mut conn).await;
                Ok((outcome, conn))
            })
            .await?;

        // The pipeline is atomic: it either applies as a whole or fails as a
        // whole, so a transport error marks every op as failed.
        match outcome {
            Ok(()) => Ok(KvPipelineResult {
                applied: op_count,
                failures: Vec::new(),
            }),
            Err(e) => Ok(KvPipelineResult {
                applied: 0,
                failures: (0..op_count).map(|i| (i, e.to_string())).collect(),
            }),
        }
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.pool
            .execute(|mut conn| async move {
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(((), conn))
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("token:u1:*", "token:u1:abc"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("session:*", "session:1234"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("token:u1:*", "token:u2:abc"));
        assert!(!glob_match("session:*", "sessio:1234"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_memory_get_set_del() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.get("k").await.unwrap(), None);

        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));

        let removed = kv.del(&["k".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let kv = MemoryKvStore::new();
        kv.set_ex("gone", 0, "x").await.unwrap();
        assert_eq!(kv.get("gone").await.unwrap(), None);

        kv.set_ex("stays", 60, "y").await.unwrap();
        assert_eq!(kv.get("stays").await.unwrap(), Some("y".to_string()));
        let ttl = kv.ttl("stays").await.unwrap();
        assert!(ttl.is_some_and(|t| t <= 60));
    }

    #[tokio::test]
    async fn test_memory_keys_pattern() {
        let kv = MemoryKvStore::new();
        kv.set("token:u1:a", "1").await.unwrap();
        kv.set("token:u1:b", "2").await.unwrap();
        kv.set("token:u2:c", "3").await.unwrap();

        let mut keys = kv.keys("token:u1:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["token:u1:a", "token:u1:b"]);
    }

    #[tokio::test]
    async fn test_memory_incr_and_expire() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);

        assert!(kv.expire("counter", 60).await.unwrap());
        assert!(!kv.expire("missing", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_sets() {
        let kv = MemoryKvStore::new();
        kv.sadd("s", "a").await.unwrap();
        kv.sadd("s", "b").await.unwrap();
        kv.sadd("s", "a").await.unwrap();

        let mut members = kv.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        kv.srem("s", "a").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_memory_zset_range() {
        let kv = MemoryKvStore::new();
        kv.zadd("z", 10.0, "ten").await.unwrap();
        kv.zadd("z", 20.0, "twenty").await.unwrap();
        kv.zadd("z", 30.0, "thirty").await.unwrap();

        let members = kv.zrange_by_score("z", 10.0, 20.0).await.unwrap();
        assert_eq!(members, vec!["ten", "twenty"]);
    }

    #[tokio::test]
    async fn test_memory_pipeline_partial_failure() {
        let kv = MemoryKvStore::new();
        kv.sadd("set-key", "member").await.unwrap();

        let result = kv
            .pipeline(vec![
                KvOp::Set {
                    key: "a".into(),
                    value: "1".into(),
                },
                // incr against a set is a type error and must fail alone
                KvOp::Incr {
                    key: "set-key".into(),
                },
                KvOp::Set {
                    key: "b".into(),
                    value: "2".into(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(result.applied, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, 1);
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(kv.get("b").await.unwrap(), Some("2".to_string()));
    }
}
