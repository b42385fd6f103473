//! The RS-side tab pool (§4.7, §5, §9): bounds concurrent renders to this
//! node's configured capacity, recycles a tab's driver after a configured
//! number of renders, and turns a [`RenderJob`] into a [`RenderResult`] by
//! running it through script cleaning and indexation classification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::dispatch::{RenderJob, RenderResult, Renderer};
use gateway_core::error::Result;
use tokio::sync::{Mutex, Semaphore};

use crate::browser_driver::BrowserDriver;
use crate::{index_status, script_clean};

struct Tab {
    driver: Mutex<(Arc<dyn BrowserDriver>, u64)>,
}

/// A fixed-size pool of browser tabs. `capacity` bounds how many renders
/// run concurrently on this node; it is also the number this process
/// registers as its `ServiceRecord.capacity` and seeds into the
/// coordination store's tab-reservation hash (§3, §4.4).
pub struct BrowserPool {
    tabs: Vec<Tab>,
    semaphore: Arc<Semaphore>,
    next_tab: AtomicUsize,
    restart_after: u64,
    strip_scripts_default: bool,
    factory: Arc<dyn Fn() -> Arc<dyn BrowserDriver> + Send + Sync>,
}

impl BrowserPool {
    pub fn new(
        capacity: usize,
        restart_after: u64,
        strip_scripts_default: bool,
        factory: Arc<dyn Fn() -> Arc<dyn BrowserDriver> + Send + Sync>,
    ) -> Self {
        let tabs = (0..capacity.max(1)).map(|_| Tab { driver: Mutex::new((factory(), 0)) }).collect();
        Self {
            tabs,
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            next_tab: AtomicUsize::new(0),
            restart_after,
            strip_scripts_default,
            factory,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tabs.len()
    }

    /// Touch every tab's driver once at startup so the first real request
    /// doesn't pay a cold-start cost (§9).
    pub async fn warmup(&self, count: usize) {
        for tab in self.tabs.iter().take(count) {
            let guard = tab.driver.lock().await;
            let _ = &guard.0;
        }
    }

    async fn render_on_tab(&self, tab: &Tab, job: RenderJob) -> Result<RenderResult> {
        let mut slot = tab.driver.lock().await;
        let (driver, count) = &mut *slot;

        let raw = driver.navigate(&job).await?;

        *count += 1;
        if *count >= self.restart_after {
            *driver = (self.factory)();
            *count = 0;
        }

        if let Some(redirect) = raw.redirect {
            return Ok(RenderResult {
                status: raw.status,
                headers: raw.headers,
                body: Vec::new(),
                title: None,
                index_status: None,
                console_errors: Vec::new(),
                final_url: raw.final_url,
                redirect: Some(redirect),
            });
        }

        let strip_scripts = job.strip_scripts || self.strip_scripts_default;
        let html = if strip_scripts { script_clean::clean(&raw.html) } else { raw.html };
        let index_status = index_status::classify(raw.status, &html, &raw.headers, &raw.final_url);
        let title = extract_title(&html).map(|t| RenderResult::truncate_title(&t));

        Ok(RenderResult {
            status: raw.status,
            headers: raw.headers,
            body: html.into_bytes(),
            title,
            index_status: Some(index_status),
            console_errors: Vec::new(),
            final_url: raw.final_url,
            redirect: None,
        })
    }
}

#[async_trait]
impl Renderer for BrowserPool {
    async fn render(&self, job: RenderJob) -> Result<RenderResult> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let idx = self.next_tab.fetch_add(1, Ordering::Relaxed) % self.tabs.len();
        self.render_on_tab(&self.tabs[idx], job).await
    }
}

fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let after = &lower[start..];
    let tag_end = after.find('>')? + start;
    let close = lower[tag_end..].find("</title>")? + tag_end;
    let raw = &html[tag_end + 1..close];
    let title = raw.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::error::Error;
    use std::sync::atomic::AtomicU64;

    struct CountingDriver {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl BrowserDriver for CountingDriver {
        async fn navigate(&self, _job: &RenderJob) -> Result<crate::browser_driver::RawPage> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(crate::browser_driver::RawPage {
                status: 200,
                headers: Default::default(),
                html: "<html><head><title>Hi</title></head><body>ok</body></html>".to_string(),
                final_url: "https://example.com/".to_string(),
                redirect: None,
            })
        }
    }

    struct FailingDriver;

    #[async_trait]
    impl BrowserDriver for FailingDriver {
        async fn navigate(&self, _job: &RenderJob) -> Result<crate::browser_driver::RawPage> {
            Err(Error::RenderFailure("boom".to_string()))
        }
    }

    fn job() -> RenderJob {
        RenderJob {
            target_url: "https://example.com/".to_string(),
            width: 1280,
            height: 720,
            render_ua: "test-ua".to_string(),
            timeout_secs: 5,
            har: false,
            strip_scripts: true,
        }
    }

    #[tokio::test]
    async fn renders_and_extracts_title() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let pool = BrowserPool::new(
            1,
            1000,
            true,
            Arc::new(move || Arc::new(CountingDriver { calls: calls2.clone() }) as Arc<dyn BrowserDriver>),
        );
        let result = pool.render(job()).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.title.as_deref(), Some("Hi"));
        assert_eq!(result.index_status, Some(1));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn recycles_driver_after_restart_threshold() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let pool = BrowserPool::new(
            1,
            2,
            true,
            Arc::new(move || Arc::new(CountingDriver { calls: calls2.clone() }) as Arc<dyn BrowserDriver>),
        );
        for _ in 0..3 {
            pool.render(job()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn propagates_driver_failure() {
        let pool = BrowserPool::new(1, 1000, true, Arc::new(|| Arc::new(FailingDriver) as Arc<dyn BrowserDriver>));
        assert!(pool.render(job()).await.is_err());
    }
}
