// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream store contract and implementations.
//!
//! The remote-execution protocol needs three things from a store:
//! ordered per-key append, range reads from a cursor (reporting when the
//! cursor has fallen behind the retained horizon), and expiring keys for
//! heartbeats. Anything providing those satisfies the contract; the
//! daemon ships a JetStream-backed implementation for the mesh and an
//! in-memory one for tests and single-node operation.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Fault;

/// One entry read back from a stream key.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Store-assigned, contiguous per key, starting at 1.
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Result of a range read.
#[derive(Debug, Clone, Default)]
pub struct StreamBatch {
    pub entries: Vec<StreamEntry>,
    /// Cursor to pass to the next read.
    pub cursor: u64,
    /// True when the requested cursor predates the retained horizon;
    /// `entries` then starts at the earliest retained entry.
    pub truncated: bool,
}

/// Ordered per-key append log with expiring side keys.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append a payload, returning its sequence.
    async fn append(&self, key: &str, payload: Vec<u8>) -> Result<u64, Fault>;

    /// Read up to `max` entries after `cursor`.
    async fn read_after(&self, key: &str, cursor: u64, max: usize) -> Result<StreamBatch, Fault>;

    /// Sequence of the newest entry ever appended to `key` (0 when the
    /// key has never been written).
    async fn latest_sequence(&self, key: &str) -> Result<u64, Fault>;

    /// Write an expiring key (heartbeats).
    async fn put_expiring(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), Fault>;

    /// Read one expiring key, `None` when missing or expired.
    async fn get_expiring(&self, key: &str) -> Result<Option<Vec<u8>>, Fault>;

    /// All unexpired keys under a prefix, with payloads.
    async fn list_expiring(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Fault>;
}

// -- in-memory ----------------------------------------------------------------

struct MemStream {
    next_seq: u64,
    entries: VecDeque<StreamEntry>,
}

struct MemInner {
    streams: HashMap<String, MemStream>,
    expiring: HashMap<String, (Vec<u8>, Instant)>,
}

/// In-memory store with a bounded per-key retention, mirroring the trim
/// behavior of a real store closely enough to exercise truncation paths.
pub struct MemoryStreamStore {
    inner: Mutex<MemInner>,
    retain: usize,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::with_retention(4096)
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            inner: Mutex::new(MemInner { streams: HashMap::new(), expiring: HashMap::new() }),
            retain: retain.max(1),
        }
    }
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, key: &str, payload: Vec<u8>) -> Result<u64, Fault> {
        let mut inner = self.inner.lock().await;
        let stream = inner
            .streams
            .entry(key.to_owned())
            .or_insert_with(|| MemStream { next_seq: 1, entries: VecDeque::new() });
        let sequence = stream.next_seq;
        stream.next_seq += 1;
        stream.entries.push_back(StreamEntry { sequence, payload });
        while stream.entries.len() > self.retain {
            stream.entries.pop_front();
        }
        Ok(sequence)
    }

    async fn read_after(&self, key: &str, cursor: u64, max: usize) -> Result<StreamBatch, Fault> {
        let inner = self.inner.lock().await;
        let Some(stream) = inner.streams.get(key) else {
            return Ok(StreamBatch { entries: Vec::new(), cursor, truncated: false });
        };

        let first_retained = stream.entries.front().map(|e| e.sequence);
        let latest = stream.next_seq - 1;
        let truncated = match first_retained {
            Some(first) => cursor + 1 < first,
            // Everything trimmed away: a cursor behind the latest
            // sequence has a gap it can never read.
            None => cursor < latest,
        };

        let entries: Vec<StreamEntry> = stream
            .entries
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(max)
            .cloned()
            .collect();
        let new_cursor = entries.last().map(|e| e.sequence).unwrap_or_else(|| {
            if truncated {
                latest
            } else {
                cursor
            }
        });
        Ok(StreamBatch { entries, cursor: new_cursor, truncated })
    }

    async fn latest_sequence(&self, key: &str) -> Result<u64, Fault> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(key).map(|s| s.next_seq - 1).unwrap_or(0))
    }

    async fn put_expiring(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), Fault> {
        let mut inner = self.inner.lock().await;
        inner.expiring.insert(key.to_owned(), (payload, Instant::now() + ttl));
        Ok(())
    }

    async fn get_expiring(&self, key: &str) -> Result<Option<Vec<u8>>, Fault> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.expiring.get(key) {
            Some((_, expires)) if *expires <= now => {
                inner.expiring.remove(key);
                Ok(None)
            }
            Some((payload, _)) => Ok(Some(payload.clone())),
            None => Ok(None),
        }
    }

    async fn list_expiring(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Fault> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.expiring.retain(|_, (_, expires)| *expires > now);
        Ok(inner
            .expiring
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (payload, _))| (k.clone(), payload.clone()))
            .collect())
    }
}

// -- JetStream ----------------------------------------------------------------

/// Map a stream key to a JetStream stream name (no `/` allowed).
fn stream_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 3);
    name.push_str("TC_");
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            name.push(ch);
        } else {
            name.push('_');
        }
    }
    name
}

/// Map a stream key to the subject its entries are published on.
fn subject_name(key: &str) -> String {
    let mut subject = String::with_capacity(key.len() + 3);
    subject.push_str("tc.");
    for ch in key.chars() {
        if ch == '/' {
            subject.push('.');
        } else {
            subject.push(ch);
        }
    }
    subject
}

/// Map an expiring key to a KV bucket key.
fn kv_key(key: &str) -> String {
    key.replace('/', ".")
}

const KV_BUCKET: &str = "tc-expiring";

/// JetStream-backed store: one stream per key (age-trimmed), one KV
/// bucket with `max_age` for the expiring keys.
pub struct JetStreamStore {
    context: async_nats::jetstream::Context,
    max_age: Duration,
    kv_ttl: Duration,
}

impl JetStreamStore {
    /// Connect to the NATS server backing the mesh.
    ///
    /// `max_age` is the per-key retention (the output-stream TTL);
    /// `kv_ttl` bounds expiring keys (the heartbeat TTL).
    pub async fn connect(url: &str, max_age: Duration, kv_ttl: Duration) -> Result<Self, Fault> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Fault::transient(format!("stream store connect: {e}")))?;
        Ok(Self { context: async_nats::jetstream::new(client), max_age, kv_ttl })
    }

    async fn stream_for(
        &self,
        key: &str,
    ) -> Result<async_nats::jetstream::stream::Stream, Fault> {
        let config = async_nats::jetstream::stream::Config {
            name: stream_name(key),
            subjects: vec![subject_name(key)],
            max_age: self.max_age,
            ..Default::default()
        };
        self.context
            .get_or_create_stream(config)
            .await
            .map_err(|e| Fault::transient(format!("stream '{key}': {e}")))
    }

    async fn bucket(&self) -> Result<async_nats::jetstream::kv::Store, Fault> {
        if let Ok(kv) = self.context.get_key_value(KV_BUCKET).await {
            return Ok(kv);
        }
        self.context
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: KV_BUCKET.to_owned(),
                max_age: self.kv_ttl,
                ..Default::default()
            })
            .await
            .map_err(|e| Fault::transient(format!("kv bucket: {e}")))
    }
}

#[async_trait]
impl StreamStore for JetStreamStore {
    async fn append(&self, key: &str, payload: Vec<u8>) -> Result<u64, Fault> {
        self.stream_for(key).await?;
        let ack = self
            .context
            .publish(subject_name(key), payload.into())
            .await
            .map_err(|e| Fault::transient(format!("append '{key}': {e}")))?
            .await
            .map_err(|e| Fault::transient(format!("append ack '{key}': {e}")))?;
        Ok(ack.sequence)
    }

    async fn read_after(&self, key: &str, cursor: u64, max: usize) -> Result<StreamBatch, Fault> {
        use async_nats::jetstream::consumer::pull::Config as PullConfig;
        use async_nats::jetstream::consumer::DeliverPolicy;
        use futures_util::StreamExt;

        let stream = self.stream_for(key).await?;
        let info = stream
            .cached_info()
            .clone();
        let first = info.state.first_sequence;
        let last = info.state.last_sequence;
        if last <= cursor {
            return Ok(StreamBatch { entries: Vec::new(), cursor, truncated: false });
        }
        let truncated = cursor + 1 < first;
        let start = (cursor + 1).max(first);

        let consumer = stream
            .create_consumer(PullConfig {
                deliver_policy: DeliverPolicy::ByStartSequence { start_sequence: start },
                ..Default::default()
            })
            .await
            .map_err(|e| Fault::transient(format!("consumer '{key}': {e}")))?;

        let mut entries = Vec::new();
        let mut messages = consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(|e| Fault::transient(format!("fetch '{key}': {e}")))?;
        while let Some(msg) = messages.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    debug!(key, err = %e, "stream message error");
                    break;
                }
            };
            let sequence = match msg.info() {
                Ok(info) => info.stream_sequence,
                Err(_) => continue,
            };
            entries.push(StreamEntry { sequence, payload: msg.payload.to_vec() });
        }

        let new_cursor = entries.last().map(|e| e.sequence).unwrap_or_else(|| {
            if truncated {
                last
            } else {
                cursor
            }
        });
        Ok(StreamBatch { entries, cursor: new_cursor, truncated })
    }

    async fn latest_sequence(&self, key: &str) -> Result<u64, Fault> {
        let stream = self.stream_for(key).await?;
        Ok(stream.cached_info().state.last_sequence)
    }

    async fn put_expiring(&self, key: &str, payload: Vec<u8>, _ttl: Duration) -> Result<(), Fault> {
        let kv = self.bucket().await?;
        kv.put(kv_key(key), payload.into())
            .await
            .map_err(|e| Fault::transient(format!("put '{key}': {e}")))?;
        Ok(())
    }

    async fn get_expiring(&self, key: &str) -> Result<Option<Vec<u8>>, Fault> {
        let kv = self.bucket().await?;
        let entry = kv
            .entry(kv_key(key))
            .await
            .map_err(|e| Fault::transient(format!("get '{key}': {e}")))?;
        Ok(entry.map(|e| e.value.to_vec()))
    }

    async fn list_expiring(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Fault> {
        use futures_util::StreamExt;

        let kv = self.bucket().await?;
        let wanted = kv_key(prefix);
        let mut keys = kv
            .keys()
            .await
            .map_err(|e| Fault::transient(format!("list '{prefix}': {e}")))?
            .boxed();
        let mut out = Vec::new();
        while let Some(key) = keys.next().await {
            let Ok(key) = key else { continue };
            if !key.starts_with(&wanted) {
                continue;
            }
            if let Some(entry) =
                kv.entry(&key).await.map_err(|e| Fault::transient(format!("entry: {e}")))?
            {
                // Report keys in the caller's `/` grammar.
                out.push((key.replace('.', "/"), entry.value.to_vec()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "streams_tests.rs"]
mod tests;
