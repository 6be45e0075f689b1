use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connection(String),
    #[error("kv command error: {0}")]
    Command(String),
    #[error("kv deadline exceeded")]
    Timeout,
}

/// Typed facade over the backing key-value store. All shared gateway state
/// (identities, nonces, profiles, caches, counters, event lists) lives behind
/// this trait under disjoint key prefixes. Operations are non-blocking;
/// callers bound them with the per-request deadline.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
    /// Atomic set-if-absent with TTL. Returns false when the key already
    /// existed. This is the nonce replay guard.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    /// Atomic increment; the TTL is applied when the key is created.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;
    async fn decr(&self, key: &str) -> Result<i64, KvError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;
    /// Push to the head of a list, trim to `cap` entries, refresh TTL.
    async fn lpush_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, KvError>;
    /// Cursor-based key scan. Never issues a blocking full-keyspace listing.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
    /// Guarded write: succeeds only when the current value equals `expected`
    /// (`None` = key absent). Basis for the optimistic identity update.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;
    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

enum Entry {
    Value(String),
    List(Vec<String>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// Process-local store with the same semantics as `RedisKv`, used by tests
/// and redis-less deployments. No lock is ever held across an await.
pub struct InMemoryKv {
    slots: Mutex<HashMap<String, Slot>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.live() => match &slot.entry {
                Entry::Value(value) => Ok(Some(value.clone())),
                Entry::List(_) => Err(KvError::Command("wrong type".to_string())),
            },
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.slots.lock().insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut slots = self.slots.lock();
        if slots.get(key).map(Slot::live).unwrap_or(false) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.slots.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut slots = self.slots.lock();
        let fresh = !slots.get(key).map(Slot::live).unwrap_or(false);
        if fresh {
            slots.insert(
                key.to_string(),
                Slot {
                    entry: Entry::Value("1".to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            return Ok(1);
        }
        let slot = slots.get_mut(key).expect("slot exists");
        match &mut slot.entry {
            Entry::Value(value) => {
                let current: i64 = value
                    .parse()
                    .map_err(|_| KvError::Command("not an integer".to_string()))?;
                let next = current + 1;
                *value = next.to_string();
                Ok(next)
            }
            Entry::List(_) => Err(KvError::Command("wrong type".to_string())),
        }
    }

    async fn decr(&self, key: &str) -> Result<i64, KvError> {
        let mut slots = self.slots.lock();
        let live = slots.get(key).map(Slot::live).unwrap_or(false);
        if !live {
            slots.insert(
                key.to_string(),
                Slot {
                    entry: Entry::Value("-1".to_string()),
                    expires_at: None,
                },
            );
            return Ok(-1);
        }
        let slot = slots.get_mut(key).expect("slot exists");
        match &mut slot.entry {
            Entry::Value(value) => {
                let current: i64 = value
                    .parse()
                    .map_err(|_| KvError::Command("not an integer".to_string()))?;
                let next = current - 1;
                *value = next.to_string();
                Ok(next)
            }
            Entry::List(_) => Err(KvError::Command("wrong type".to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let slots = self.slots.lock();
        Ok(slots.get(key).filter(|slot| slot.live()).and_then(|slot| {
            slot.expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn lpush_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut slots = self.slots.lock();
        let live = slots.get(key).map(Slot::live).unwrap_or(false);
        if !live {
            slots.insert(
                key.to_string(),
                Slot {
                    entry: Entry::List(vec![value.to_string()]),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            return Ok(());
        }
        let slot = slots.get_mut(key).expect("slot exists");
        match &mut slot.entry {
            Entry::List(items) => {
                items.insert(0, value.to_string());
                items.truncate(cap.max(1));
            }
            Entry::Value(_) => return Err(KvError::Command("wrong type".to_string())),
        }
        if let Some(ttl) = ttl {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, KvError> {
        let slots = self.slots.lock();
        let Some(slot) = slots.get(key).filter(|slot| slot.live()) else {
            return Ok(Vec::new());
        };
        match &slot.entry {
            Entry::List(items) => {
                let len = items.len() as isize;
                if len == 0 {
                    return Ok(Vec::new());
                }
                let norm = |idx: isize| -> isize {
                    if idx < 0 {
                        (len + idx).max(0)
                    } else {
                        idx
                    }
                };
                let start = norm(start);
                let stop = norm(stop).min(len - 1);
                if start > stop {
                    return Ok(Vec::new());
                }
                Ok(items[start as usize..=stop as usize].to_vec())
            }
            Entry::Value(_) => Err(KvError::Command("wrong type".to_string())),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let slots = self.slots.lock();
        Ok(slots
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.live())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut slots = self.slots.lock();
        let current = match slots.get(key) {
            Some(slot) if slot.live() => match &slot.entry {
                Entry::Value(value) => Some(value.clone()),
                Entry::List(_) => return Err(KvError::Command("wrong type".to_string())),
            },
            _ => None,
        };
        if current.as_deref() != expected {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

/// Redis-backed store on a multiplexed non-blocking connection. Multi-step
/// updates run as server-side Lua scripts so concurrent gateways observe
/// them atomically.
pub struct RedisKv {
    client: redis::Client,
    manager: ConnectionManager,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client =
            redis::Client::open(url).map_err(|err| KvError::Connection(err.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|err| KvError::Connection(err.to_string()))?;
        Ok(Self {
            client,
            manager,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn command_err(err: redis::RedisError) -> KvError {
    KvError::Command(err.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn).await.map_err(command_err)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut conn = self.conn();
        let script = Script::new(
            r#"
            local value = redis.call("INCR", KEYS[1])
            if value == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return value
        "#,
        );
        script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn decr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn();
        redis::cmd("DECR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn();
        let secs: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        if secs < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(secs as u64)))
        }
    }

    async fn lpush_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_err)?;
        redis::cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap.max(1) as i64 - 1)
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_err)?;
        if let Some(ttl) = ttl {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .query_async::<i64>(&mut conn)
                .await
                .map_err(command_err)?;
        }
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start as i64)
            .arg(stop as i64)
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(command_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let script = Script::new(
            r#"
            local current = redis.call("GET", KEYS[1])
            local expected = ARGV[1]
            if expected == "" then
                if current then
                    return 0
                end
            elseif current ~= expected then
                return 0
            end
            redis.call("SET", KEYS[1], ARGV[2])
            local ttl = tonumber(ARGV[3])
            if ttl > 0 then
                redis.call("EXPIRE", KEYS[1], ttl)
            end
            return 1
        "#,
        );
        let swapped: i64 = script
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl.map(|ttl| ttl.as_secs().max(1)).unwrap_or(0) as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(swapped == 1)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    /// Must be called from within a Tokio runtime: the per-channel listener
    /// task is spawned on first subscription.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock();
        if let Some(sender) = channels.get(channel) {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(256);
        channels.insert(channel.to_string(), sender.clone());
        let client = self.client.clone();
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    tracing::warn!(channel = %name, error = %err, "pubsub connection failed");
                    return;
                }
            };
            if let Err(err) = pubsub.subscribe(&name).await {
                tracing::warn!(channel = %name, error = %err, "pubsub subscribe failed");
                return;
            }
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                if let Ok(payload) = message.get_payload::<String>() {
                    let _ = sender.send(payload);
                }
            }
        });
        receiver
    }
}

fn _assert_send_sync<T: Send + Sync>() {}

#[allow(dead_code)]
fn _assert_kv_types() {
    _assert_send_sync::<InMemoryKv>();
    _assert_send_sync::<RedisKv>();
}
