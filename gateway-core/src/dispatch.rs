//! The renderer dispatcher (§4.7): atomic tab reservation over the
//! coordination store, the render RPC, and redirect capture.
//!
//! [`Renderer`] is the seam between the two processes this workspace
//! builds: `render-service` implements it directly against its own
//! browser-tab pool (the Chromium driver protocol itself stays the
//! out-of-scope collaborator per §1); `edge-gateway` implements it via
//! [`RendererDispatcher`], which selects a live RS, reserves one of its
//! tabs through the coordination store's atomic script, and relays the
//! job over HTTP. Both sides of the wire look identical to the request
//! pipeline, which only ever holds an `Arc<dyn Renderer>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, ServiceRecord, TabReservation};

/// One render job dispatched to an RS (§4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub target_url: String,
    pub width: u32,
    pub height: u32,
    pub render_ua: String,
    pub timeout_secs: u64,
    /// Whether the RS should also collect a HAR for the `/debug/har/render`
    /// surface (§6).
    pub har: bool,
    pub strip_scripts: bool,
}

/// A same-document 3xx observed on the main navigation (§4.7). AJAX
/// redirects on sub-resources must never produce one of these -- the RS
/// is responsible for telling those apart before it ever reaches here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectCapture {
    pub status: u16,
    pub location: String,
}

/// What the RS hands back to the dispatcher (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RenderResult {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub title: Option<String>,
    /// `1` indexable, `2` non-200, `3` blocked-by-meta, `4` non-canonical (§4.7).
    pub index_status: Option<u8>,
    pub console_errors: Vec<String>,
    pub final_url: String,
    pub redirect: Option<RedirectCapture>,
}

impl RenderResult {
    /// Title capped to 500 Unicode scalar values, preserving multi-byte
    /// sequences rather than truncating mid-codepoint (§4.7, §8).
    pub fn truncate_title(title: &str) -> String {
        title.chars().take(500).collect()
    }
}

/// The browser-pool seam (§4.7, §9). `render-service` implements this
/// against its own tab pool; `edge-gateway` implements it via
/// [`RendererDispatcher`] over HTTP. The pipeline depends only on this
/// trait, so tests exercise it against an in-memory fake (§13).
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job: RenderJob) -> Result<RenderResult>;
}

/// RS selection policy (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    Random,
    RoundRobin,
    LeastLoaded,
}

impl SelectPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "random" => SelectPolicy::Random,
            "round_robin" | "round-robin" => SelectPolicy::RoundRobin,
            _ => SelectPolicy::LeastLoaded,
        }
    }
}

/// The EG-side dispatcher: select a live RS, reserve a tab, POST the job,
/// and release the tab on every exit path (§4.7, §5) -- including when the
/// render itself fails or times out.
pub struct RendererDispatcher {
    store: Arc<dyn CoordinationStore>,
    http: Client,
    node_id: String,
    policy: SelectPolicy,
    rr_counter: AtomicUsize,
}

impl RendererDispatcher {
    pub fn new(store: Arc<dyn CoordinationStore>, http: Client, node_id: String, policy: SelectPolicy) -> Self {
        Self { store, http, node_id, policy, rr_counter: AtomicUsize::new(0) }
    }

    fn select(&self, candidates: &[ServiceRecord]) -> Option<ServiceRecord> {
        if candidates.is_empty() {
            return None;
        }
        let idx = match self.policy {
            SelectPolicy::Random => (nanos() as usize) % candidates.len(),
            SelectPolicy::RoundRobin => self.rr_counter.fetch_add(1, Ordering::Relaxed) % candidates.len(),
            SelectPolicy::LeastLoaded => {
                return candidates
                    .iter()
                    .min_by_key(|s| s.metadata.get("active_tabs").and_then(|v| v.as_u64()).unwrap_or(0))
                    .cloned();
            }
        };
        candidates.get(idx).cloned()
    }

    async fn render_on(&self, rs: &ServiceRecord, job: &RenderJob) -> Result<RenderResult> {
        let url = format!("http://{}:{}/render", rs.address, rs.port);
        let timeout = Duration::from_secs(job.timeout_secs.max(1));
        let resp = self.http.post(&url).timeout(timeout).json(job).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::RenderTimeout(timeout)
            } else {
                Error::RenderFailure(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            return Err(Error::RenderFailure(format!("RS {} returned {}", rs.id, resp.status())));
        }

        resp.json::<RenderResult>().await.map_err(|e| Error::RenderFailure(e.to_string()))
    }
}

#[async_trait]
impl Renderer for RendererDispatcher {
    /// Try each live RS (as chosen by the select policy) in turn until one
    /// accepts a tab reservation, relay the job, and release the tab
    /// regardless of the outcome (§4.7, §5).
    async fn render(&self, job: RenderJob) -> Result<RenderResult> {
        let mut services = self.store.list_services().await?;
        services.retain(|s| s.capacity > 0);
        if services.is_empty() {
            return Err(Error::CapacityExhausted);
        }

        let mut excluded: Vec<String> = Vec::new();
        loop {
            let candidates: Vec<ServiceRecord> =
                services.iter().filter(|s| !excluded.contains(&s.id)).cloned().collect();
            let Some(rs) = self.select(&candidates) else {
                return Err(Error::CapacityExhausted);
            };

            let token = format!("{}:{}", self.node_id, nanos());
            let reservation = self.store.reserve_tab(&rs.id, &token).await?;
            let tab_id = match reservation {
                TabReservation::Reserved(tab_id) => tab_id,
                TabReservation::Exhausted => {
                    excluded.push(rs.id.clone());
                    if excluded.len() >= services.len() {
                        return Err(Error::CapacityExhausted);
                    }
                    continue;
                }
            };

            let result = self.render_on(&rs, &job).await;

            // Finally-style guarantee: the tab is released on every exit
            // path, including the render failing or timing out (§4.7, §5).
            if let Err(e) = self.store.release_tab(&rs.id, &tab_id, &token).await {
                tracing::warn!(rs = %rs.id, error = %e, "failed to release tab reservation");
            }

            return result;
        }
    }
}

fn nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        services: Vec<ServiceRecord>,
        tabs: Mutex<StdHashMap<String, StdHashMap<String, String>>>,
    }

    #[async_trait]
    impl CoordinationStore for FakeStore {
        async fn register_service(&self, _: &ServiceRecord, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&self, _: &str, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn deregister_service(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
            Ok(self.services.clone())
        }
        async fn init_tabs(&self, rs_id: &str, capacity: usize) -> Result<()> {
            let fields = (0..capacity).map(|i| (format!("tab{i}"), String::new())).collect();
            self.tabs.lock().await.insert(rs_id.to_string(), fields);
            Ok(())
        }
        async fn reserve_tab(&self, rs_id: &str, token: &str) -> Result<TabReservation> {
            let mut tabs = self.tabs.lock().await;
            let entry = tabs.entry(rs_id.to_string()).or_default();
            let mut keys: Vec<String> = entry.keys().cloned().collect();
            keys.sort();
            for k in keys {
                if entry.get(&k).map(String::is_empty).unwrap_or(false) {
                    entry.insert(k.clone(), token.to_string());
                    return Ok(TabReservation::Reserved(k));
                }
            }
            Ok(TabReservation::Exhausted)
        }
        async fn release_tab(&self, rs_id: &str, tab_id: &str, token: &str) -> Result<()> {
            let mut tabs = self.tabs.lock().await;
            if let Some(entry) = tabs.get_mut(rs_id) {
                if entry.get(tab_id).map(String::as_str) == Some(token) {
                    entry.insert(tab_id.to_string(), String::new());
                }
            }
            Ok(())
        }
        async fn acquire_render_lock(&self, _: u64, _: &str, _: Duration) -> Result<crate::store::LockOutcome> {
            Ok(crate::store::LockOutcome::Acquired)
        }
        async fn release_render_lock(&self, _: u64, _: &str) -> Result<()> {
            Ok(())
        }
        async fn get_metadata(&self, _: &str) -> Result<Option<StdHashMap<String, String>>> {
            Ok(None)
        }
        async fn put_metadata(&self, _: &str, _: StdHashMap<String, String>, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn put_metadata_guarded(&self, _: &str, _: StdHashMap<String, String>, _: Duration, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn update_field(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn expire_metadata_at(&self, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
        async fn get_service_ids(&self, _: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn set_service_ids(&self, _: &str, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn add_service_id(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn job() -> RenderJob {
        RenderJob {
            target_url: "http://h/p".into(),
            width: 1920,
            height: 1080,
            render_ua: "EdgeCometBot".into(),
            timeout_secs: 5,
            har: false,
            strip_scripts: true,
        }
    }

    #[tokio::test]
    async fn no_live_services_is_capacity_exhausted() {
        let store = Arc::new(FakeStore::default());
        let dispatcher = RendererDispatcher::new(store, Client::new(), "eg1".into(), SelectPolicy::RoundRobin);
        let err = dispatcher.render(job()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted));
    }

    #[tokio::test]
    async fn exhausted_tabs_on_every_rs_surfaces_capacity_exhausted() {
        let mut store = FakeStore::default();
        store.services = vec![ServiceRecord {
            id: "rs1".into(),
            address: "127.0.0.1".into(),
            port: 65535,
            capacity: 1,
            status: "healthy".into(),
            metadata: serde_json::json!({}),
        }];
        store.init_tabs("rs1", 0).await.unwrap();
        let store = Arc::new(store);
        let dispatcher = RendererDispatcher::new(store, Client::new(), "eg1".into(), SelectPolicy::RoundRobin);
        let err = dispatcher.render(job()).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted));
    }

    #[tokio::test]
    async fn tab_is_released_after_render_failure() {
        let mut store = FakeStore::default();
        // No listener on this port: the POST will fail to connect, giving
        // us a deterministic RenderFailure without a live RS.
        store.services = vec![ServiceRecord {
            id: "rs1".into(),
            address: "127.0.0.1".into(),
            port: 1,
            capacity: 1,
            status: "healthy".into(),
            metadata: serde_json::json!({}),
        }];
        store.init_tabs("rs1", 1).await.unwrap();
        let store = Arc::new(store);
        let dispatcher = RendererDispatcher::new(store.clone(), Client::new(), "eg1".into(), SelectPolicy::RoundRobin);

        let err = dispatcher.render(job()).await.unwrap_err();
        assert!(matches!(err, Error::RenderFailure(_)));

        let tabs = store.tabs.lock().await;
        assert_eq!(tabs.get("rs1").unwrap().get("tab0").unwrap(), "");
    }

    #[test]
    fn title_truncation_preserves_multibyte_prefix() {
        let long_title: String = std::iter::repeat('界').take(600).collect();
        let truncated = RenderResult::truncate_title(&long_title);
        assert_eq!(truncated.chars().count(), 500);
        assert!(long_title.starts_with(&truncated));
    }
}
