//! The actual headless-browser protocol is the stated out-of-scope
//! external collaborator (§1, §4.7); [`BrowserDriver`] is the seam a real
//! Chromium/CDP integration plugs into. [`HttpBrowserDriver`] is a minimal
//! reference implementation -- a single HTTP fetch with no JS execution --
//! that keeps the pool and RPC surface around it exercisable end to end.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::dispatch::{RedirectCapture, RenderJob};
use gateway_core::error::{Error, Result};
use reqwest::Client;

/// One page load's raw result, before script cleaning and indexation
/// classification are applied by the pool (§4.7).
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub html: String,
    pub final_url: String,
    pub redirect: Option<RedirectCapture>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, job: &RenderJob) -> Result<RawPage>;
}

/// Reference driver: fetches the target over plain HTTP with the job's
/// render UA, capturing a same-navigation redirect rather than following
/// it (§4.7). A production deployment swaps this for a real browser-tab
/// driver behind the same trait.
pub struct HttpBrowserDriver {
    http: Client,
}

impl HttpBrowserDriver {
    pub fn new() -> Self {
        Self { http: Client::builder().redirect(reqwest::redirect::Policy::none()).build().expect("client") }
    }
}

impl Default for HttpBrowserDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for HttpBrowserDriver {
    async fn navigate(&self, job: &RenderJob) -> Result<RawPage> {
        let timeout = Duration::from_secs(job.timeout_secs.max(1));
        let resp = self
            .http
            .get(&job.target_url)
            .header(reqwest::header::USER_AGENT, &job.render_ua)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RenderTimeout(timeout)
                } else {
                    Error::RenderFailure(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();

        if (300..400).contains(&status) {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Ok(RawPage {
                status,
                headers: collect_headers(resp.headers()),
                html: String::new(),
                final_url,
                redirect: Some(RedirectCapture { status, location }),
            });
        }

        let headers = collect_headers(resp.headers());
        let html = resp.text().await.map_err(|e| Error::RenderFailure(e.to_string()))?;

        Ok(RawPage { status, headers, html, final_url, redirect: None })
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            out.entry(name.as_str().to_string()).or_default().push(v.to_string());
        }
    }
    out
}
