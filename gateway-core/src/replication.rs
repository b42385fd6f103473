//! The replication/sharding coordinator (§4.6): hash-modulo placement
//! across EG peers, push-on-render, pull-on-miss.

use std::sync::Arc;

use reqwest::Client;

use crate::error::{Error, Result};
use crate::store::CoordinationStore;

/// One EG peer this node can push to / pull from.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub base_url: String,
}

/// Placement strategy: the only one in scope is `hash_modulo` over the
/// sorted peer-EG ID list (§4.6).
pub struct ReplicationCoordinator {
    store: Arc<dyn CoordinationStore>,
    http: Client,
    node_id: String,
    replication_factor: usize,
    peers: Vec<Peer>,
}

impl ReplicationCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        http: Client,
        node_id: String,
        replication_factor: usize,
        mut peers: Vec<Peer>,
    ) -> Self {
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Self { store, http, node_id, replication_factor, peers }
    }

    /// Choose up to `RF-1` peers to push the artifact to, by `hash(fp) mod
    /// N`-offsets over the sorted peer list (§4.6).
    pub fn push_targets(&self, fp: u64) -> Vec<&Peer> {
        if self.peers.is_empty() || self.replication_factor <= 1 {
            return Vec::new();
        }
        let n = self.peers.len();
        let base = (fp as usize) % n;
        let want = (self.replication_factor - 1).min(n);
        (0..want).map(|offset| &self.peers[(base + offset + 1) % n]).collect()
    }

    /// Push the just-rendered artifact to this node's replication targets.
    /// Failures are tolerated (§4.6, §7 PushFailure): the entry becomes
    /// under-replicated and `eg_ids` reflects actual holders rather than
    /// the configured `RF`.
    pub async fn push(&self, cache_key: &str, fp: u64, artifact: &[u8], content_type: &str) -> Result<()> {
        self.store.add_service_id(cache_key, &self.node_id).await?;

        for peer in self.push_targets(fp) {
            let url = format!("{}/internal/replicate/{cache_key}", peer.base_url);
            let result = self
                .http
                .post(&url)
                .header("content-type", content_type)
                .body(artifact.to_vec())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    if let Err(e) = self.store.add_service_id(cache_key, &peer.id).await {
                        tracing::warn!(peer = %peer.id, error = %e, "failed to record replication target");
                    }
                }
                Ok(resp) => {
                    tracing::warn!(peer = %peer.id, status = %resp.status(), "replication push rejected");
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.id, error = %e, "replication push failed");
                }
            }
        }

        Ok(())
    }

    /// On local miss, consult `eg_ids`: if non-empty, pull from any holder
    /// over internal HTTP; on success, add self to `eg_ids`
    /// (replicate-on-pull). An empty `eg_ids` (e.g. a redirect) means no
    /// pull is attempted (§4.6).
    pub async fn pull(&self, cache_key: &str) -> Result<Option<Vec<u8>>> {
        let holders = self.store.get_service_ids(cache_key).await?;
        let candidates: Vec<&str> = holders
            .iter()
            .map(String::as_str)
            .filter(|id| *id != self.node_id)
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }

        for holder_id in candidates {
            let Some(peer) = self.peers.iter().find(|p| p.id == holder_id) else {
                continue;
            };
            let url = format!("{}/internal/replicate/{cache_key}", peer.base_url);
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(Error::from)?;
                    self.store.add_service_id(cache_key, &self.node_id).await?;
                    return Ok(Some(bytes.to_vec()));
                }
                // Pulls of expired entries are refused by the holder; the
                // puller must re-render rather than retry (§4.6).
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => continue,
                Ok(_) | Err(_) => continue,
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct NullStore {
        eg_ids: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for NullStore {
        async fn register_service(&self, _: &crate::store::ServiceRecord, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&self, _: &str, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn deregister_service(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list_services(&self) -> Result<Vec<crate::store::ServiceRecord>> {
            Ok(Vec::new())
        }
        async fn init_tabs(&self, _: &str, _: usize) -> Result<()> {
            Ok(())
        }
        async fn reserve_tab(&self, _: &str, _: &str) -> Result<crate::store::TabReservation> {
            Ok(crate::store::TabReservation::Exhausted)
        }
        async fn release_tab(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn acquire_render_lock(&self, _: u64, _: &str, _: Duration) -> Result<crate::store::LockOutcome> {
            Ok(crate::store::LockOutcome::Acquired)
        }
        async fn release_render_lock(&self, _: u64, _: &str) -> Result<()> {
            Ok(())
        }
        async fn get_metadata(&self, _: &str) -> Result<Option<HashMap<String, String>>> {
            Ok(None)
        }
        async fn put_metadata(&self, _: &str, _: HashMap<String, String>, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn put_metadata_guarded(&self, _: &str, _: HashMap<String, String>, _: Duration, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn update_field(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn expire_metadata_at(&self, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
        async fn get_service_ids(&self, cache_key: &str) -> Result<Vec<String>> {
            Ok(self.eg_ids.lock().await.get(cache_key).cloned().unwrap_or_default())
        }
        async fn set_service_ids(&self, cache_key: &str, ids: &[String]) -> Result<()> {
            self.eg_ids.lock().await.insert(cache_key.to_string(), ids.to_vec());
            Ok(())
        }
        async fn add_service_id(&self, cache_key: &str, id: &str) -> Result<()> {
            self.eg_ids.lock().await.entry(cache_key.to_string()).or_default().push(id.to_string());
            Ok(())
        }
    }

    fn coordinator(peers: Vec<Peer>) -> ReplicationCoordinator {
        ReplicationCoordinator::new(
            Arc::new(NullStore::default()),
            Client::new(),
            "eg1".to_string(),
            2,
            peers,
        )
    }

    #[test]
    fn no_push_targets_with_zero_peers() {
        let rc = coordinator(Vec::new());
        assert!(rc.push_targets(42).is_empty());
    }

    #[test]
    fn push_targets_respects_replication_factor() {
        let peers = vec![
            Peer { id: "eg2".into(), base_url: "http://eg2".into() },
            Peer { id: "eg3".into(), base_url: "http://eg3".into() },
            Peer { id: "eg4".into(), base_url: "http://eg4".into() },
        ];
        let rc = coordinator(peers);
        // RF=2 means one push target besides self.
        assert_eq!(rc.push_targets(1).len(), 1);
    }

    #[tokio::test]
    async fn pull_with_empty_eg_ids_returns_none() {
        let rc = coordinator(Vec::new());
        let result = rc.pull("cache:1:1:deadbeef").await.unwrap();
        assert!(result.is_none());
    }
}
