// Outbound trunk registry, selection and rate limiting

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::codec::CodecKind;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct TrunkCredentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trunk {
    pub id: String,
    pub proxy_address: String,
    pub proxy_port: u16,
    pub transport: String,
    pub credentials: Option<TrunkCredentials>,
    pub supports_inbound: bool,
    pub supports_outbound: bool,
    pub max_concurrent_calls: u32,
    pub calls_per_second_limit: f64,
    /// Ordered codec preference for legs through this trunk.
    pub preferred_codecs: Vec<CodecKind>,
}

impl Trunk {
    pub fn proxy_target(&self) -> String {
        format!("{}:{}", self.proxy_address, self.proxy_port)
    }
}

// Classic token bucket; one per trunk, guarding call origination rate.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        let capacity = rate.max(1.0);
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec: rate,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct TrunkEntry {
    trunk: Arc<Trunk>,
    bucket: Mutex<TokenBucket>,
    active_calls: Mutex<u32>,
}

/// RAII lease on one trunk call slot; dropping it frees the slot.
pub struct TrunkLease {
    pub trunk: Arc<Trunk>,
    entry: Arc<TrunkEntry>,
}

impl Drop for TrunkLease {
    fn drop(&mut self) {
        let entry = self.entry.clone();
        tokio::spawn(async move {
            let mut active = entry.active_calls.lock().await;
            *active = active.saturating_sub(1);
        });
    }
}

#[derive(Default)]
pub struct TrunkStore {
    trunks: RwLock<Vec<Arc<TrunkEntry>>>,
}

impl TrunkStore {
    pub fn new() -> Self {
        TrunkStore::default()
    }

    pub async fn add(&self, trunk: Trunk) {
        let entry = Arc::new(TrunkEntry {
            bucket: Mutex::new(TokenBucket::new(trunk.calls_per_second_limit)),
            active_calls: Mutex::new(0),
            trunk: Arc::new(trunk),
        });
        let mut trunks = self.trunks.write().await;
        trunks.retain(|e| e.trunk.id != entry.trunk.id);
        trunks.push(entry);
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut trunks = self.trunks.write().await;
        let before = trunks.len();
        trunks.retain(|e| e.trunk.id != id);
        trunks.len() != before
    }

    pub async fn list(&self) -> Vec<Arc<Trunk>> {
        self.trunks.read().await.iter().map(|e| e.trunk.clone()).collect()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Trunk>> {
        self.trunks
            .read()
            .await
            .iter()
            .find(|e| e.trunk.id == id)
            .map(|e| e.trunk.clone())
    }

    pub async fn active_calls(&self) -> HashMap<String, u32> {
        let mut out = HashMap::new();
        for entry in self.trunks.read().await.iter() {
            out.insert(entry.trunk.id.clone(), *entry.active_calls.lock().await);
        }
        out
    }

    /// Pick the first outbound-capable trunk with headroom in both its
    /// concurrency cap and its rate budget. Configured order is the
    /// preference order.
    pub async fn select_outbound(&self) -> Result<TrunkLease> {
        let trunks = self.trunks.read().await;
        for entry in trunks.iter() {
            if !entry.trunk.supports_outbound {
                continue;
            }
            {
                let mut active = entry.active_calls.lock().await;
                if *active >= entry.trunk.max_concurrent_calls {
                    debug!(trunk = %entry.trunk.id, "trunk at concurrency cap");
                    continue;
                }
                if !entry.bucket.lock().await.try_take() {
                    debug!(trunk = %entry.trunk.id, "trunk rate-limited");
                    continue;
                }
                *active += 1;
            }
            return Ok(TrunkLease {
                trunk: entry.trunk.clone(),
                entry: entry.clone(),
            });
        }
        Err(Error::CapacityExceeded("no outbound trunk available".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_trunk(id: &str, cps: f64, max_calls: u32) -> Trunk {
        Trunk {
            id: id.to_string(),
            proxy_address: "sip.carrier.example".to_string(),
            proxy_port: 5060,
            transport: "udp".to_string(),
            credentials: None,
            supports_inbound: true,
            supports_outbound: true,
            max_concurrent_calls: max_calls,
            calls_per_second_limit: cps,
            preferred_codecs: vec![CodecKind::Pcmu, CodecKind::Pcma],
        }
    }

    #[tokio::test]
    async fn test_selection_prefers_configured_order() {
        let store = TrunkStore::new();
        store.add(test_trunk("primary", 100.0, 10)).await;
        store.add(test_trunk("backup", 100.0, 10)).await;

        let lease = store.select_outbound().await.unwrap();
        assert_eq!(lease.trunk.id, "primary");
    }

    #[tokio::test]
    async fn test_concurrency_cap_falls_through() {
        let store = TrunkStore::new();
        store.add(test_trunk("small", 100.0, 1)).await;
        store.add(test_trunk("big", 100.0, 10)).await;

        let first = store.select_outbound().await.unwrap();
        assert_eq!(first.trunk.id, "small");
        // "small" is full; next selection falls through to "big"
        let second = store.select_outbound().await.unwrap();
        assert_eq!(second.trunk.id, "big");
    }

    #[tokio::test]
    async fn test_lease_drop_frees_slot() {
        let store = TrunkStore::new();
        store.add(test_trunk("only", 100.0, 1)).await;

        let lease = store.select_outbound().await.unwrap();
        drop(lease);
        // Drop releases via a spawned task; give it a tick
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(store.select_outbound().await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_burst() {
        let store = TrunkStore::new();
        store.add(test_trunk("limited", 2.0, 100)).await;

        // Bucket starts with two tokens
        assert!(store.select_outbound().await.is_ok());
        assert!(store.select_outbound().await.is_ok());
        assert!(store.select_outbound().await.is_err());
    }

    #[tokio::test]
    async fn test_outbound_only_filter() {
        let store = TrunkStore::new();
        let mut inbound_only = test_trunk("in", 100.0, 10);
        inbound_only.supports_outbound = false;
        store.add(inbound_only).await;

        assert!(store.select_outbound().await.is_err());
    }
}
