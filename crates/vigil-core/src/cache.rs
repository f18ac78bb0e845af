// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dedup cache: atomic claim-if-absent with expiry.
//!
//! The cache is the only cross-instance shared mutable state outside the
//! primary store. Under concurrent claims for the same key exactly one
//! caller wins; losers treat the key as already processed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use crate::error::Result;

/// Atomic claim-if-absent with expiry.
#[async_trait]
pub trait DedupCache: Send + Sync {
    /// Claim `key` for `ttl`. Returns true when this caller won the key,
    /// false when it was already claimed and has not yet expired.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Redis-backed dedup cache.
///
/// `ConnectionManager` reconnects on its own, so a Redis blip surfaces as
/// a per-call error rather than a poisoned client.
#[derive(Clone)]
pub struct RedisDedupCache {
    manager: ConnectionManager,
}

impl RedisDedupCache {
    /// Connect to Redis and build the cache.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl DedupCache for RedisDedupCache {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        // SET NX EX: one round trip, atomic on the server
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

/// In-memory dedup cache for testing.
#[derive(Default)]
pub struct InMemoryDedupCache {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl InMemoryDedupCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupCache for InMemoryDedupCache {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, expires_at| *expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_wins_once() {
        let cache = InMemoryDedupCache::new();
        assert!(cache.claim("a", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.claim("a", Duration::from_secs(60)).await.unwrap());
        assert!(cache.claim("b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_expires() {
        let cache = InMemoryDedupCache::new();
        assert!(cache.claim("a", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.claim("a", Duration::from_secs(60)).await.unwrap());
    }
}
