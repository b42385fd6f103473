//! The request pipeline (§4.9): the top-level EG state machine composing
//! URL normalization, rule matching, dimension resolution, the cache
//! manager, the renderer dispatcher, and the bypass proxy into the states
//! `AUTH → RESOLVE_HOST → NORMALIZE → RULE_MATCH → DIMENSION → LOOKUP →
//! DISPATCH → EMIT`.
//!
//! The pipeline depends on the `Renderer` trait rather than a concrete
//! dispatcher, so its own tests run against an in-memory fake instead of a
//! real RS (§13); `edge-gateway`'s binary wires in the real
//! [`crate::dispatch::RendererDispatcher`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::bypass::BypassProxy;
use crate::cache_manager::{CacheManager, CacheOutcome, EntrySource, StoreExtras};
use crate::dimension::{resolve_dimension, Fallback, Resolution};
use crate::dispatch::{RenderJob, Renderer};
use crate::error::{Error, Result};
use crate::fingerprint::cache_key;
use crate::hosts::{Action, Host, HostTable};
use crate::normalize::normalize;
use crate::replication::ReplicationCoordinator;
use crate::rules::resolve_rule;
use crate::store::CoordinationStore;

/// What actually produced the response body, mirrored into
/// `X-Render-Source` (§4.9, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderAction {
    Rendered,
    Cache,
    Bypass,
    BypassCache,
}

impl RenderAction {
    fn as_str(self) -> &'static str {
        match self {
            RenderAction::Rendered => "rendered",
            RenderAction::Cache => "cache",
            RenderAction::Bypass => "bypass",
            RenderAction::BypassCache => "bypass_cache",
        }
    }
}

/// The diagnostic headers emitted on every response (§4.9, §6).
#[derive(Debug, Clone)]
pub struct EmitHeaders {
    pub render_source: Option<RenderAction>,
    pub render_cache: Option<bool>,
    pub matched_rule: String,
    pub processed_url: String,
    pub unmatched_dimension: bool,
    pub request_id: String,
    pub render_action: String,
}

impl EmitHeaders {
    pub fn into_header_map(self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), v);
            }
        };

        if let Some(source) = self.render_source {
            set(&mut headers, "x-render-source", source.as_str().to_string());
        }
        if let Some(hit) = self.render_cache {
            set(&mut headers, "x-render-cache", if hit { "hit".into() } else { "miss".into() });
        }
        set(&mut headers, "x-matched-rule", if self.matched_rule.is_empty() { "<default>".into() } else { self.matched_rule });
        set(&mut headers, "x-processed-url", self.processed_url);
        if self.unmatched_dimension {
            set(&mut headers, "x-unmatched-dimension", "true".into());
        }
        set(&mut headers, "x-request-id", self.request_id);
        set(&mut headers, "x-render-action", self.render_action);
        headers
    }
}

/// One inbound `/render` request (§6).
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub raw_url: String,
    pub user_agent: String,
    pub render_key: Option<String>,
    pub request_id: String,
    pub har: bool,
}

/// The pipeline's response: status, diagnostic headers, and body (§6).
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub status: u16,
    pub headers: EmitHeaders,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Tunables that belong to the pipeline orchestration itself rather than
/// any one component (§5, §9).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub node_id: String,
    pub lock_ttl: Duration,
    pub default_cache_ttl: Duration,
    pub render_timeout_secs: u64,
    pub strip_scripts: bool,
    pub bypass_on_failure: bool,
    /// Whether a cache HIT updates `last_access` in the coordination store
    /// (§3 Lock, §9 Open Questions -- made an explicit policy knob per the
    /// spec's own ambiguity note rather than guessed silently).
    pub touch_on_hit: bool,
    /// Bounded wait-then-poll budget for a lock waiter before it gives up
    /// and falls back to bypass (§5, §9).
    pub lock_wait_attempts: u32,
    pub lock_wait_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_id: "eg".to_string(),
            lock_ttl: Duration::from_secs(60),
            default_cache_ttl: Duration::from_secs(3600),
            render_timeout_secs: 20,
            strip_scripts: true,
            bypass_on_failure: true,
            touch_on_hit: true,
            lock_wait_attempts: 20,
            lock_wait_interval: Duration::from_millis(100),
        }
    }
}

pub struct RequestPipeline {
    hosts: Arc<HostTable>,
    cache: Arc<CacheManager>,
    renderer: Arc<dyn Renderer>,
    bypass: Arc<BypassProxy>,
    replication: Arc<ReplicationCoordinator>,
    store: Arc<dyn CoordinationStore>,
    config: PipelineConfig,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Arc<HostTable>,
        cache: Arc<CacheManager>,
        renderer: Arc<dyn Renderer>,
        bypass: Arc<BypassProxy>,
        replication: Arc<ReplicationCoordinator>,
        store: Arc<dyn CoordinationStore>,
        config: PipelineConfig,
    ) -> Self {
        Self { hosts, cache, renderer, bypass, replication, store, config }
    }

    /// Run the full state machine for one request. Never panics the caller:
    /// every error kind from §7 is folded into an HTTP response here.
    pub async fn handle(&self, req: PipelineRequest) -> PipelineResponse {
        match self.handle_inner(&req).await {
            Ok(resp) => resp,
            Err(e) => self.error_response(&req, e),
        }
    }

    fn error_response(&self, req: &PipelineRequest, err: Error) -> PipelineResponse {
        let status = err.status_code().as_u16();
        match status {
            500..=599 => tracing::error!(request_id = %req.request_id, error = %err, "pipeline error"),
            _ => tracing::debug!(request_id = %req.request_id, error = %err, "pipeline rejected request"),
        }
        PipelineResponse {
            status,
            headers: EmitHeaders {
                render_source: None,
                render_cache: None,
                matched_rule: String::new(),
                processed_url: req.raw_url.clone(),
                unmatched_dimension: false,
                request_id: req.request_id.clone(),
                render_action: "error".to_string(),
            },
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(&serde_json::json!({"error": err.to_string()})).unwrap_or_default(),
        }
    }

    async fn handle_inner(&self, req: &PipelineRequest) -> Result<PipelineResponse> {
        // AUTH (SSRF half) + RESOLVE_HOST: the SSRF guard runs before
        // authentication so a rejected target never confirms or denies a
        // render key (§4.9).
        let parsed = url::Url::parse(&req.raw_url).map_err(|e| Error::BadUrl(format!("{}: {e}", req.raw_url)))?;
        self.bypass.guard_target(&parsed).map_err(|_| {
            Error::BadTarget(format!("target host rejected: {}", parsed.host_str().unwrap_or_default()))
        })?;

        let domain = parsed.host_str().ok_or_else(|| Error::UnknownHost("no host in target URL".into()))?;
        let host = self.hosts.resolve_host(domain).ok_or_else(|| Error::UnknownHost(domain.to_string()))?;

        // AUTH (render-key half).
        let provided = req.render_key.as_deref().unwrap_or("");
        if provided.is_empty() || provided != host.render_key {
            return Err(Error::Auth(format!("render key mismatch for host {}", host.id)));
        }

        // RULE_MATCH: path/query matching does not depend on the strip
        // policy, so this runs before NORMALIZE produces the final
        // canonical string -- only the *pattern-level* strip override the
        // matched rule resolves feeds back into normalization (§4.1, §4.2).
        let path = parsed.path();
        let raw_query = multi_query(&parsed);
        let matched = resolve_rule(&self.hosts.global, host, path, &raw_query)?;

        match matched.action {
            Action::Block => {
                return Ok(self.status_response(req, 403, &matched.pattern, "block", false));
            }
            Action::Status(code) => {
                return Ok(self.status_response(req, code, &matched.pattern, &format!("status_{code}"), false));
            }
            Action::Render | Action::Bypass => {}
        }

        // NORMALIZE, now with the resolved effective strip policy.
        let normalized = normalize(&req.raw_url, &matched.strip_policy)?;

        // DIMENSION.
        let effective_host = restrict_dimensions(host, &matched.dimensions);
        let (dimension_id, render_ua, width, height, unmatched) =
            match resolve_dimension(&effective_host, &req.user_agent)? {
                Resolution::Fallback(Fallback::Block) => {
                    let mut resp = self.status_response(req, 403, &matched.pattern, "block", true);
                    resp.headers.unmatched_dimension = true;
                    return Ok(resp);
                }
                Resolution::Fallback(Fallback::Bypass) => {
                    return self.bypass_path(req, host, &matched, &normalized, 0, "", 0, 0, true, true).await;
                }
                Resolution::Matched(d) => {
                    (d.dimension.id, d.dimension.render_ua.clone(), d.dimension.width, d.dimension.height, d.unmatched)
                }
            };

        if matched.action == Action::Bypass {
            return self
                .bypass_path(req, host, &matched, &normalized, dimension_id, &render_ua, width, height, unmatched, true)
                .await;
        }

        // LOOKUP.
        match self.cache.lookup(host.id, dimension_id, normalized.fingerprint).await? {
            CacheOutcome::Hit(entry) => {
                if self.config.touch_on_hit {
                    let _ = self.cache.touch(host.id, dimension_id, normalized.fingerprint).await;
                }
                return self.serve_entry(req, &matched, &normalized, entry, true, unmatched).await;
            }
            CacheOutcome::Stale(entry) => {
                // Serve stale immediately, then kick off an async re-render
                // (§4.5, §4.9). The re-render shares this request's render
                // path but its outcome is never awaited here.
                let resp = self.serve_entry(req, &matched, &normalized, entry, true, unmatched).await?;
                self.spawn_stale_rerender(host, dimension_id, &render_ua, width, height, &normalized.canonical);
                return Ok(resp);
            }
            CacheOutcome::Miss => {
                if let Some(resp) = self.try_pull_on_miss(req, &matched, &normalized, host.id, dimension_id, unmatched).await? {
                    return Ok(resp);
                }
            }
            CacheOutcome::Expired => {}
        }

        // DISPATCH (render).
        self.render_path(req, host, &matched, &normalized, dimension_id, &render_ua, width, height, unmatched)
            .await
    }

    /// On a local cache miss, ask the replication coordinator whether a
    /// peer already holds the artifact before paying for a render (§4.6).
    /// The coordination store's metadata hash is cluster-wide; only the
    /// artifact bytes are local to whichever EG produced or already
    /// pulled them, so a `Miss` here can still resolve without a render.
    async fn try_pull_on_miss(
        &self,
        req: &PipelineRequest,
        matched: &crate::rules::MatchedRule,
        normalized: &crate::normalize::NormalizedUrl,
        host_id: u64,
        dimension_id: u64,
        unmatched: bool,
    ) -> Result<Option<PipelineResponse>> {
        let key = cache_key(host_id, dimension_id, normalized.fingerprint);
        let Some(entry) = self.cache.entry_metadata(host_id, dimension_id, normalized.fingerprint).await? else {
            return Ok(None);
        };
        let Some(bytes) = self.replication.pull(&key).await? else {
            return Ok(None);
        };
        self.cache.adopt_pulled_artifact(&entry, &bytes).await?;
        Ok(Some(self.serve_entry(req, matched, normalized, entry, true, unmatched).await?))
    }

    fn spawn_stale_rerender(&self, host: &Host, dimension_id: u64, render_ua: &str, width: u32, height: u32, target_url: &str) {
        let renderer = self.renderer.clone();
        let cache = self.cache.clone();
        let replication = self.replication.clone();
        let store = self.store.clone();
        let node_id = self.config.node_id.clone();
        let lock_ttl = self.config.lock_ttl;
        let ttl = self.config.default_cache_ttl;
        let timeout_secs = self.config.render_timeout_secs;
        let strip_scripts = self.config.strip_scripts;
        let host_id = host.id;
        let target_url = target_url.to_string();
        let render_ua = render_ua.to_string();

        tokio::spawn(async move {
            let fp = crate::fingerprint::fingerprint(&target_url);
            let key = cache_key(host_id, dimension_id, fp);
            let Ok(crate::store::LockOutcome::Acquired) =
                store.acquire_render_lock(fp, &node_id, lock_ttl).await
            else {
                return;
            };

            let job = RenderJob {
                target_url: target_url.clone(),
                width,
                height,
                render_ua,
                timeout_secs,
                har: false,
                strip_scripts,
            };

            if let Ok(result) = renderer.render(job).await {
                if result.redirect.is_none() {
                    if let Ok(Some(entry)) = cache
                        .store(
                            host_id,
                            dimension_id,
                            fp,
                            &target_url,
                            &result.body,
                            EntrySource::Render,
                            result.status,
                            result.headers.clone(),
                            StoreExtras {
                                title: result.title.clone(),
                                index_status: result.index_status,
                                console_errors: Some(result.console_errors.clone()),
                            },
                            ttl,
                            true,
                        )
                        .await
                    {
                        let _ = replication
                            .push(&key, fp, &result.body, entry.headers.get("content-type").and_then(|v| v.first()).map(String::as_str).unwrap_or("text/html"))
                            .await;
                    }
                }
            }

            let _ = store.release_render_lock(fp, &node_id).await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn render_path(
        &self,
        req: &PipelineRequest,
        host: &Host,
        matched: &crate::rules::MatchedRule,
        normalized: &crate::normalize::NormalizedUrl,
        dimension_id: u64,
        render_ua: &str,
        width: u32,
        height: u32,
        unmatched: bool,
    ) -> Result<PipelineResponse> {
        let fp = normalized.fingerprint;
        let lock = self.store.acquire_render_lock(fp, &self.config.node_id, self.config.lock_ttl).await?;

        match lock {
            crate::store::LockOutcome::Acquired => {
                let job = RenderJob {
                    target_url: normalized.canonical.clone(),
                    width,
                    height,
                    render_ua: render_ua.to_string(),
                    timeout_secs: self.config.render_timeout_secs,
                    har: req.har,
                    strip_scripts: self.config.strip_scripts,
                };

                let render_outcome = self.renderer.render(job).await;
                // Render-lock release is unconditional: every exit path
                // below releases it exactly once (§4.7, §5).
                let response = match render_outcome {
                    Ok(result) => self.finish_render(req, host, matched, normalized, dimension_id, result).await,
                    Err(Error::CapacityExhausted) | Err(Error::RenderTimeout(_)) | Err(Error::RenderFailure(_))
                        if self.config.bypass_on_failure =>
                    {
                        // No cache entry is created on capacity exhaustion
                        // or render failure; the slot is left for a future
                        // render (§3, §7). `allow_cache_write: false` is
                        // what actually enforces that -- the bypass body is
                        // still served live, just never persisted.
                        self.bypass_path(req, host, matched, normalized, dimension_id, render_ua, width, height, unmatched, false)
                            .await
                    }
                    Err(e) => Err(e),
                };

                let _ = self.store.release_render_lock(fp, &self.config.node_id).await;
                response
            }
            crate::store::LockOutcome::AlreadyHeld => {
                // Waiters block on the lock, not on the render itself: poll
                // the cache, which the holder populates before releasing
                // (§4.9, §5).
                for _ in 0..self.config.lock_wait_attempts {
                    tokio::time::sleep(self.config.lock_wait_interval).await;
                    if let CacheOutcome::Hit(entry) = self.cache.lookup(host.id, dimension_id, fp).await? {
                        return self.serve_entry(req, matched, normalized, entry, true, unmatched).await;
                    }
                }
                // The holder never wrote (it failed or timed out): fall
                // back to bypass rather than wait forever. Same failure
                // family as the direct render-failure branch above, so the
                // fingerprint's slot is left open rather than poisoned.
                self.bypass_path(req, host, matched, normalized, dimension_id, render_ua, width, height, unmatched, false)
                    .await
            }
        }
    }

    async fn finish_render(
        &self,
        req: &PipelineRequest,
        host: &Host,
        matched: &crate::rules::MatchedRule,
        normalized: &crate::normalize::NormalizedUrl,
        dimension_id: u64,
        result: crate::dispatch::RenderResult,
    ) -> Result<PipelineResponse> {
        let fp = normalized.fingerprint;
        let key = cache_key(host.id, dimension_id, fp);
        let ttl = Duration::from_secs(matched.cache_ttl_secs.unwrap_or(self.config.default_cache_ttl.as_secs()));

        if let Some(redirect) = &result.redirect {
            // Redirect short-circuit: no replication, empty artifact,
            // `size=0` (§3, §4.7, §8).
            let mut headers: HashMap<String, Vec<String>> = HashMap::new();
            headers.insert("location".to_string(), vec![redirect.location.clone()]);
            self.cache
                .store(
                    host.id,
                    dimension_id,
                    fp,
                    &normalized.canonical,
                    &[],
                    EntrySource::Render,
                    redirect.status,
                    headers.clone(),
                    StoreExtras::default(),
                    ttl,
                    false,
                )
                .await?;

            return Ok(PipelineResponse {
                status: redirect.status,
                headers: EmitHeaders {
                    render_source: Some(RenderAction::Rendered),
                    render_cache: Some(false),
                    matched_rule: matched.pattern.clone(),
                    processed_url: normalized.canonical.clone(),
                    unmatched_dimension: false,
                    request_id: req.request_id.clone(),
                    render_action: "render".to_string(),
                },
                content_type: None,
                body: Vec::new(),
            });
        }

        let title = result.title.as_deref().map(crate::dispatch::RenderResult::truncate_title);
        let entry = self
            .cache
            .store(
                host.id,
                dimension_id,
                fp,
                &normalized.canonical,
                &result.body,
                EntrySource::Render,
                result.status,
                result.headers.clone(),
                StoreExtras { title, index_status: result.index_status, console_errors: Some(result.console_errors.clone()) },
                ttl,
                true,
            )
            .await?;

        if let Some(entry) = entry {
            let content_type = entry.headers.get("content-type").and_then(|v| v.first()).cloned().unwrap_or_else(|| "text/html".to_string());
            let replication = self.replication.clone();
            let body = result.body.clone();
            let key_owned = key.clone();
            tokio::spawn(async move {
                let _ = replication.push(&key_owned, fp, &body, &content_type).await;
            });
        }

        Ok(PipelineResponse {
            status: result.status,
            headers: EmitHeaders {
                render_source: Some(RenderAction::Rendered),
                render_cache: Some(false),
                matched_rule: matched.pattern.clone(),
                processed_url: normalized.canonical.clone(),
                unmatched_dimension: false,
                request_id: req.request_id.clone(),
                render_action: "render".to_string(),
            },
            content_type: result.headers.get("content-type").and_then(|v| v.first()).cloned(),
            body: result.body,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn bypass_path(
        &self,
        req: &PipelineRequest,
        host: &Host,
        matched: &crate::rules::MatchedRule,
        normalized: &crate::normalize::NormalizedUrl,
        dimension_id: u64,
        _render_ua: &str,
        _width: u32,
        _height: u32,
        unmatched: bool,
        allow_cache_write: bool,
    ) -> Result<PipelineResponse> {
        // A bypass entry (or a render entry left over from a different
        // rule evaluation) may already be cached; a live fetch is the
        // fallback of last resort, not the default (§4.8).
        let fp = normalized.fingerprint;
        if dimension_id != 0 {
            if let CacheOutcome::Hit(entry) = self.cache.lookup(host.id, dimension_id, fp).await? {
                return self.serve_entry(req, matched, normalized, entry, true, unmatched).await;
            }
        }

        let result = self.bypass.fetch(&normalized.canonical, &[], &matched.safe_headers).await?;

        // `allow_cache_write` is false for capacity/timeout/failure-driven
        // fallback: that bypass response is served live but never written
        // to the cache, so the fingerprint's slot stays open for a real
        // render once RS capacity recovers, instead of being pinned to a
        // stale bypass snapshot for a full TTL (§3, §7).
        let mut stored = false;
        if allow_cache_write && dimension_id != 0 && result.status < 400 {
            let ttl = Duration::from_secs(matched.cache_ttl_secs.unwrap_or(self.config.default_cache_ttl.as_secs()));
            stored = self
                .cache
                .store(
                    host.id,
                    dimension_id,
                    fp,
                    &normalized.canonical,
                    &result.body,
                    EntrySource::Bypass,
                    result.status,
                    result.headers.clone(),
                    StoreExtras::default(),
                    ttl,
                    true,
                )
                .await?
                .is_some();
        }

        Ok(PipelineResponse {
            status: result.status,
            headers: EmitHeaders {
                render_source: Some(if stored { RenderAction::BypassCache } else { RenderAction::Bypass }),
                render_cache: Some(false),
                matched_rule: matched.pattern.clone(),
                processed_url: normalized.canonical.clone(),
                unmatched_dimension: unmatched,
                request_id: req.request_id.clone(),
                render_action: "bypass".to_string(),
            },
            content_type: result.headers.get("content-type").and_then(|v| v.first()).cloned(),
            body: result.body,
        })
    }

    async fn serve_entry(
        &self,
        req: &PipelineRequest,
        matched: &crate::rules::MatchedRule,
        normalized: &crate::normalize::NormalizedUrl,
        entry: crate::cache_manager::CacheEntry,
        hit: bool,
        unmatched: bool,
    ) -> Result<PipelineResponse> {
        let source = match entry.source {
            EntrySource::Render => RenderAction::Cache,
            EntrySource::Bypass => RenderAction::BypassCache,
        };
        let content_type = entry.headers.get("content-type").and_then(|v| v.first()).cloned();
        let status = entry.status_code;
        let body = self.cache.read_artifact(&entry).await?;
        Ok(PipelineResponse {
            status,
            headers: EmitHeaders {
                render_source: Some(source),
                render_cache: Some(hit),
                matched_rule: matched.pattern.clone(),
                processed_url: normalized.canonical.clone(),
                unmatched_dimension: unmatched,
                request_id: req.request_id.clone(),
                render_action: "render".to_string(),
            },
            content_type,
            body,
        })
    }

    fn status_response(&self, req: &PipelineRequest, status: u16, pattern: &str, action: &str, unmatched: bool) -> PipelineResponse {
        PipelineResponse {
            status,
            headers: EmitHeaders {
                render_source: None,
                render_cache: None,
                matched_rule: pattern.to_string(),
                processed_url: req.raw_url.clone(),
                unmatched_dimension: unmatched,
                request_id: req.request_id.clone(),
                render_action: action.to_string(),
            },
            content_type: None,
            body: Vec::new(),
        }
    }
}

/// Restrict a host's dimension candidates to a rule's `dimensions`
/// override, if present (§3 Rule, §4.2). Cheap clone: host tables are
/// small and this only happens once per request.
fn restrict_dimensions(host: &Host, names: &Option<Vec<String>>) -> Host {
    match names {
        Some(names) if !names.is_empty() => {
            let mut restricted = host.clone();
            restricted.dimensions.retain(|d| names.contains(&d.name));
            restricted
        }
        _ => host.clone(),
    }
}

fn multi_query(url: &url::Url) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in url.query_pairs() {
        map.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    map
}
