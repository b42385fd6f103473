//! The content-addressed cache manager (§4.5): file layout on disk,
//! metadata CRUD against the coordination store, the Priority Rule, and
//! the stale/expired serving policy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::compression::{compress_if_above_threshold, Codec};
use crate::error::{Error, Result};
use crate::fingerprint::{cache_key, shard_prefixes};
use crate::store::CoordinationStore;

/// Which path wrote this entry. `source` is immutable after first write and
/// `render` entries can never be overwritten by a `bypass` write (the
/// Priority Rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Render,
    Bypass,
}

impl EntrySource {
    fn as_str(self) -> &'static str {
        match self {
            EntrySource::Render => "render",
            EntrySource::Bypass => "bypass",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "render" => Some(EntrySource::Render),
            "bypass" => Some(EntrySource::Bypass),
            _ => None,
        }
    }
}

/// Metadata record for one cache entry (§3).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub url: String,
    pub file_path: String,
    pub size: u64,
    pub disk_size: u64,
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub source: EntrySource,
    pub created_at: i64,
    pub last_access: i64,
    pub expires_at: i64,
    pub host_id: u64,
    pub dimension: u64,
    pub eg_ids: Vec<String>,
    pub title: Option<String>,
    pub index_status: Option<u8>,
    pub console_errors: Option<Vec<String>>,
}

impl CacheEntry {
    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("url".into(), self.url.clone());
        fields.insert("file_path".into(), self.file_path.clone());
        fields.insert("size".into(), self.size.to_string());
        fields.insert("disk_size".into(), self.disk_size.to_string());
        fields.insert("status_code".into(), self.status_code.to_string());
        fields.insert(
            "headers".into(),
            serde_json::to_string(&self.headers).unwrap_or_default(),
        );
        fields.insert("source".into(), self.source.as_str().to_string());
        fields.insert("created_at".into(), self.created_at.to_string());
        fields.insert("last_access".into(), self.last_access.to_string());
        fields.insert("expires_at".into(), self.expires_at.to_string());
        fields.insert("host_id".into(), self.host_id.to_string());
        fields.insert("dimension".into(), self.dimension.to_string());
        if let Some(title) = &self.title {
            fields.insert("title".into(), title.clone());
        }
        if let Some(status) = self.index_status {
            fields.insert("index_status".into(), status.to_string());
        }
        if let Some(errors) = &self.console_errors {
            fields.insert("console_errors".into(), serde_json::to_string(errors).unwrap_or_default());
        }
        fields
    }

    fn from_fields(fields: &HashMap<String, String>, eg_ids: Vec<String>) -> Result<Self> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let parse_u64 = |k: &str| get(k).parse::<u64>().unwrap_or(0);
        let parse_i64 = |k: &str| get(k).parse::<i64>().unwrap_or(0);

        Ok(CacheEntry {
            url: get("url"),
            file_path: get("file_path"),
            size: parse_u64("size"),
            disk_size: parse_u64("disk_size"),
            status_code: get("status_code").parse().unwrap_or(0),
            headers: fields
                .get("headers")
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default(),
            source: EntrySource::parse(&get("source"))
                .ok_or_else(|| Error::Internal("cache entry missing source".into()))?,
            created_at: parse_i64("created_at"),
            last_access: parse_i64("last_access"),
            expires_at: parse_i64("expires_at"),
            host_id: parse_u64("host_id"),
            dimension: parse_u64("dimension"),
            eg_ids,
            title: fields.get("title").cloned(),
            index_status: fields.get("index_status").and_then(|s| s.parse().ok()),
            console_errors: fields.get("console_errors").and_then(|s| serde_json::from_str(s).ok()),
        })
    }
}

/// Result of a cache lookup (§4.5).
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Hit(CacheEntry),
    Miss,
    Stale(CacheEntry),
    Expired,
}

/// Extra rendering-side fields recorded alongside a render-source write (§3).
#[derive(Debug, Clone, Default)]
pub struct StoreExtras {
    pub title: Option<String>,
    pub index_status: Option<u8>,
    pub console_errors: Option<Vec<String>>,
}

/// Default wall-clock source: seconds since epoch.
pub fn system_clock() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub struct CacheManager {
    store: Arc<dyn CoordinationStore>,
    base_dir: PathBuf,
    compression_threshold_bytes: usize,
    codec: Codec,
    stale_ttl: Duration,
    serve_stale: bool,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        base_dir: PathBuf,
        compression_threshold_bytes: usize,
        codec: Codec,
        stale_ttl: Duration,
        serve_stale: bool,
    ) -> Self {
        Self { store, base_dir, compression_threshold_bytes, codec, stale_ttl, serve_stale }
    }

    fn artifact_path(&self, host_id: u64, dimension: u64, fp: u64, ext: &str) -> PathBuf {
        let (h0, h1) = shard_prefixes(fp);
        self.base_dir
            .join(host_id.to_string())
            .join(dimension.to_string())
            .join(h0)
            .join(h1)
            .join(format!("{fp:016x}.{ext}"))
    }

    /// Lookup(fp, dimension) → HIT | MISS | STALE | EXPIRED (§4.5).
    pub async fn lookup(&self, host_id: u64, dimension: u64, fp: u64) -> Result<CacheOutcome> {
        let key = cache_key(host_id, dimension, fp);
        let fields = match self.store.get_metadata(&key).await? {
            Some(f) => f,
            None => return Ok(CacheOutcome::Miss),
        };
        let eg_ids = self.store.get_service_ids(&key).await?;
        let entry = CacheEntry::from_fields(&fields, eg_ids)?;

        let now = system_clock();
        if entry.expires_at > now {
            if self.artifact_readable(&entry).await? {
                return Ok(CacheOutcome::Hit(entry));
            }
            // Metadata present, artifact missing: treat as a miss (§4.5).
            return Ok(CacheOutcome::Miss);
        }

        let stale_cutoff = entry.expires_at + self.stale_ttl.as_secs() as i64;
        if now <= stale_cutoff && self.serve_stale && self.artifact_readable(&entry).await? {
            return Ok(CacheOutcome::Stale(entry));
        }

        Ok(CacheOutcome::Expired)
    }

    async fn artifact_readable(&self, entry: &CacheEntry) -> Result<bool> {
        if entry.file_path.is_empty() {
            // Redirect entries carry no artifact but are still a valid identity (§3).
            return Ok(entry.size == 0);
        }
        let path = self.base_dir.join(&entry.file_path);
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Store(fp, artifact, source, status, headers, extras) honoring the
    /// Priority Rule: `bypass`-source writes never overwrite a
    /// `render`-source entry (§4.5).
    #[allow(clippy::too_many_arguments)]
    pub async fn store(
        &self,
        host_id: u64,
        dimension: u64,
        fp: u64,
        url: &str,
        artifact: &[u8],
        source: EntrySource,
        status_code: u16,
        headers: HashMap<String, Vec<String>>,
        extras: StoreExtras,
        ttl: Duration,
        replicable: bool,
    ) -> Result<Option<CacheEntry>> {
        let key = cache_key(host_id, dimension, fp);
        let now = system_clock();

        let (file_path, size, disk_size) = if replicable && !artifact.is_empty() {
            let (codec, compressed) =
                compress_if_above_threshold(artifact, self.codec, self.compression_threshold_bytes)?;
            let path = self.artifact_path(host_id, dimension, fp, codec.extension());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &compressed).await?;
            let rel = path
                .strip_prefix(&self.base_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            (rel, artifact.len() as u64, compressed.len() as u64)
        } else {
            // Redirects and other non-replicable entries have no artifact
            // but still need an identity file_path (§3, §4.7).
            (format!("{host_id}/{dimension}/redirect-{fp:016x}"), 0, 0)
        };

        let entry = CacheEntry {
            url: url.to_string(),
            file_path,
            size,
            disk_size,
            status_code,
            headers,
            source,
            created_at: now,
            last_access: now,
            expires_at: now + ttl.as_secs() as i64,
            host_id,
            dimension,
            eg_ids: Vec::new(),
            title: extras.title,
            index_status: extras.index_status,
            console_errors: extras.console_errors,
        };

        let wrote = self
            .store
            .put_metadata_guarded(&key, entry.to_fields(), ttl, source.as_str())
            .await?;

        if !wrote {
            return Ok(None);
        }

        if replicable {
            self.store.add_service_id(&key, "self").await?;
        } else {
            self.store.set_service_ids(&key, &[]).await?;
        }

        Ok(Some(entry))
    }

    /// Touch(fp): update `last_access`.
    pub async fn touch(&self, host_id: u64, dimension: u64, fp: u64) -> Result<()> {
        let key = cache_key(host_id, dimension, fp);
        self.store.update_field(&key, "last_access", &system_clock().to_string()).await
    }

    /// Expire(fp): set `expires_at` in the past without deleting the
    /// artifact (the stale-serve window, §4.5).
    pub async fn expire(&self, host_id: u64, dimension: u64, fp: u64) -> Result<()> {
        let key = cache_key(host_id, dimension, fp);
        self.store.expire_metadata_at(&key, system_clock() - 1).await
    }

    /// Look up metadata for an entry the coordination store already knows
    /// about even when this node's local disk can't serve it yet (§4.6
    /// pull-on-miss): the metadata hash is shared over the coordination
    /// store, while the artifact file is local to whichever EG rendered or
    /// already pulled it.
    pub async fn entry_metadata(&self, host_id: u64, dimension: u64, fp: u64) -> Result<Option<CacheEntry>> {
        let key = cache_key(host_id, dimension, fp);
        let Some(fields) = self.store.get_metadata(&key).await? else {
            return Ok(None);
        };
        let eg_ids = self.store.get_service_ids(&key).await?;
        Ok(Some(CacheEntry::from_fields(&fields, eg_ids)?))
    }

    /// Persist artifact bytes pulled from a replication peer under an
    /// existing entry's path, without touching metadata or TTL a second
    /// time (§4.6 pull-on-miss).
    pub async fn adopt_pulled_artifact(&self, entry: &CacheEntry, artifact: &[u8]) -> Result<()> {
        if entry.file_path.is_empty() {
            return Ok(());
        }
        let path = self.base_dir.join(&entry.file_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("html");
        let compressed = Codec::from_extension(ext).compress(artifact)?;
        tokio::fs::write(&path, &compressed).await?;
        Ok(())
    }

    pub async fn read_artifact(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        if entry.file_path.is_empty() || entry.size == 0 && entry.disk_size == 0 {
            return Ok(Vec::new());
        }
        let path = self.base_dir.join(&entry.file_path);
        let raw = tokio::fs::read(&path).await?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("html");
        Codec::from_extension(ext).decompress(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        meta: Mutex<StdHashMap<String, (StdHashMap<String, String>, String)>>,
        eg_ids: Mutex<StdHashMap<String, Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for FakeStore {
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
        async fn get_metadata(&self, cache_key: &str) -> Result<Option<StdHashMap<String, String>>> {
            Ok(self.meta.lock().unwrap().get(cache_key).map(|(f, _)| f.clone()))
        }
        async fn put_metadata(&self, cache_key: &str, fields: StdHashMap<String, String>, _: Duration) -> Result<()> {
            let source = fields.get("source").cloned().unwrap_or_default();
            self.meta.lock().unwrap().insert(cache_key.to_string(), (fields, source));
            Ok(())
        }
        async fn put_metadata_guarded(
            &self,
            cache_key: &str,
            fields: StdHashMap<String, String>,
            _: Duration,
            incoming_source: &str,
        ) -> Result<bool> {
            let mut meta = self.meta.lock().unwrap();
            if let Some((_, existing_source)) = meta.get(cache_key) {
                if existing_source == "render" && incoming_source == "bypass" {
                    return Ok(false);
                }
            }
            meta.insert(cache_key.to_string(), (fields, incoming_source.to_string()));
            Ok(true)
        }
        async fn update_field(&self, cache_key: &str, field: &str, value: &str) -> Result<()> {
            if let Some((fields, _)) = self.meta.lock().unwrap().get_mut(cache_key) {
                fields.insert(field.to_string(), value.to_string());
            }
            Ok(())
        }
        async fn expire_metadata_at(&self, cache_key: &str, expires_at_unix: i64) -> Result<()> {
            self.update_field(cache_key, "expires_at", &expires_at_unix.to_string()).await
        }
        async fn get_service_ids(&self, cache_key: &str) -> Result<Vec<String>> {
            Ok(self.eg_ids.lock().unwrap().get(cache_key).cloned().unwrap_or_default())
        }
        async fn set_service_ids(&self, cache_key: &str, ids: &[String]) -> Result<()> {
            self.eg_ids.lock().unwrap().insert(cache_key.to_string(), ids.to_vec());
            Ok(())
        }
        async fn add_service_id(&self, cache_key: &str, id: &str) -> Result<()> {
            self.eg_ids.lock().unwrap().entry(cache_key.to_string()).or_default().push(id.to_string());
            Ok(())
        }
    }

    fn manager(dir: &std::path::Path) -> CacheManager {
        CacheManager::new(
            Arc::new(FakeStore::default()),
            dir.to_path_buf(),
            1024,
            Codec::Snappy,
            Duration::from_secs(300),
            true,
        )
    }

    #[tokio::test]
    async fn miss_when_no_metadata() {
        let dir = tempdir();
        let mgr = manager(dir.path());
        let outcome = mgr.lookup(1, 1, 42).await.unwrap();
        assert!(matches!(outcome, CacheOutcome::Miss));
    }

    #[tokio::test]
    async fn store_then_hit() {
        let dir = tempdir();
        let mgr = manager(dir.path());
        mgr.store(
            1,
            1,
            42,
            "http://h/p",
            b"hello world",
            EntrySource::Render,
            200,
            HashMap::new(),
            StoreExtras::default(),
            Duration::from_secs(300),
            true,
        )
        .await
        .unwrap();

        let outcome = mgr.lookup(1, 1, 42).await.unwrap();
        match outcome {
            CacheOutcome::Hit(entry) => {
                assert_eq!(entry.source, EntrySource::Render);
                assert_eq!(entry.status_code, 200);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bypass_never_overwrites_render_entry() {
        let dir = tempdir();
        let mgr = manager(dir.path());
        mgr.store(
            1,
            1,
            42,
            "http://h/p",
            b"rendered body",
            EntrySource::Render,
            200,
            HashMap::new(),
            StoreExtras::default(),
            Duration::from_secs(300),
            true,
        )
        .await
        .unwrap();

        let result = mgr
            .store(
                1,
                1,
                42,
                "http://h/p",
                b"bypass body",
                EntrySource::Bypass,
                200,
                HashMap::new(),
                StoreExtras::default(),
                Duration::from_secs(300),
                true,
            )
            .await
            .unwrap();
        assert!(result.is_none());

        let outcome = mgr.lookup(1, 1, 42).await.unwrap();
        match outcome {
            CacheOutcome::Hit(entry) => assert_eq!(entry.source, EntrySource::Render),
            other => panic!("expected render entry preserved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirect_entries_are_not_replicable() {
        let dir = tempdir();
        let mgr = manager(dir.path());
        let entry = mgr
            .store(
                1,
                1,
                43,
                "http://h/p",
                b"",
                EntrySource::Render,
                301,
                HashMap::new(),
                StoreExtras::default(),
                Duration::from_secs(300),
                false,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.size, 0);
        assert!(entry.eg_ids.is_empty());
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }
}
