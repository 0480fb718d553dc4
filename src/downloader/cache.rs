//! On-disk audio cache bounded by a byte quota.
//!
//! Layout under the cache directory:
//! - `audio/<key>.audio`: published payloads
//! - `tmp/<uuid>.part`: writes in flight, renamed into `audio/` on commit
//! - `cache_index.json`: key → file, size and last access
//!
//! The index (entry table, recency order, size accounting) sits behind one lock. Payload bytes are
//! written to the temp file without holding it; only the final rename and bookkeeping do.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use crate::errors::{AppError, Result};
use crate::utils::{ensure_dir_exists, generate_download_id, sanitize_filename};

const INDEX_FILE: &str = "cache_index.json";
const AUDIO_DIR: &str = "audio";
const TMP_DIR: &str = "tmp";

/// One published payload. Entries in the index are always complete; partial writes live only as
/// `.part` files until [`CacheWriter::commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub complete: bool,
}

/// Something the player can open for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Playable {
    pub key: String,
    pub path: PathBuf,
    /// False for a direct-stream fallback that lives outside the quota.
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub quota_bytes: u64,
    pub pinned: usize,
    pub direct: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed_entries: usize,
    pub removed_files: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    total_size: u64,
    /// Least recently used first.
    entries: Vec<CacheEntry>,
}

struct Index {
    entries: LruCache<String, CacheEntry>,
    total_size: u64,
    pinned: HashSet<String>,
    direct: HashMap<String, PathBuf>,
}

/// Temp files owned by live [`CacheWriter`]s. Shared with the writers so that each one can drop
/// its own path, whichever way it ends.
#[derive(Clone, Default)]
struct InFlight(Arc<StdMutex<HashSet<PathBuf>>>);

impl InFlight {
    fn paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        match self.0.lock() {
            Ok(paths) => paths,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(&self, path: PathBuf) {
        self.paths().insert(path);
    }

    fn release(&self, path: &Path) {
        self.paths().remove(path);
    }
}

pub struct ContentCache {
    cache_dir: PathBuf,
    audio_dir: PathBuf,
    tmp_dir: PathBuf,
    quota_bytes: u64,
    index: Mutex<Index>,
    writing: InFlight,
    published: broadcast::Sender<String>,
}

impl ContentCache {
    /// Opens (or creates) the cache, reloads the persisted index and reconciles it with the disk.
    pub async fn open(cache_dir: PathBuf, quota_bytes: u64) -> Result<Arc<Self>> {
        let audio_dir = cache_dir.join(AUDIO_DIR);
        let tmp_dir = cache_dir.join(TMP_DIR);
        ensure_dir_exists(&audio_dir).await?;
        ensure_dir_exists(&tmp_dir).await?;

        let mut entries = LruCache::unbounded();
        let mut total_size = 0;
        for entry in Self::load_index(&cache_dir.join(INDEX_FILE)).await {
            total_size += entry.size_bytes;
            entries.put(entry.key.clone(), entry);
        }

        let (published, _) = broadcast::channel(64);
        let cache = Arc::new(Self {
            cache_dir,
            audio_dir,
            tmp_dir,
            quota_bytes,
            index: Mutex::new(Index {
                entries,
                total_size,
                pinned: HashSet::new(),
                direct: HashMap::new(),
            }),
            writing: InFlight::default(),
            published,
        });

        let report = cache.sweep().await?;
        let stats = cache.stats().await;
        info!(
            "💾 [CACHE] Opened {:?}: {} entries, {} of {} bytes (sweep removed {} entries, {} files)",
            cache.cache_dir, stats.entries, stats.total_bytes, quota_bytes,
            report.removed_entries, report.removed_files
        );

        // Over quota after a config change: trim down before anything else is written.
        cache.enforce_quota().await;
        Ok(cache)
    }

    async fn load_index(path: &Path) -> Vec<CacheEntry> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<PersistedIndex>(&content) {
            Ok(mut persisted) => {
                persisted.entries.sort_by_key(|e| e.last_accessed_at);
                persisted.entries.retain(|e| e.complete);
                persisted.entries
            }
            Err(e) => {
                warn!("⚠️ [CACHE] Ignoring unreadable index {:?}: {}", path, e);
                Vec::new()
            }
        }
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.audio_dir.join(format!("{}.audio", sanitize_filename(key)))
    }

    /// Looks up a complete entry and marks it most recently used.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut index = self.index.lock().await;
        let entry = index.entries.get_mut(key)?;
        entry.last_accessed_at = entry.last_accessed_at.max(Utc::now());
        Some(entry.clone())
    }

    /// Updates recency without touching the payload. Returns whether the key was present.
    pub async fn touch(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.index.lock().await.entries.contains(key)
    }

    /// Writes a whole payload at once. A key that is already cached is left untouched and its
    /// existing entry returned.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<CacheEntry> {
        if let Some(existing) = self.get(key).await {
            return Ok(existing);
        }
        let mut writer = self.begin_write(key).await?;
        writer.write_chunk(data).await?;
        writer.commit(self).await
    }

    /// Starts a streaming write into a private temp file.
    pub async fn begin_write(&self, key: &str) -> Result<CacheWriter> {
        let tmp_path = self.tmp_dir.join(format!("{}.part", generate_download_id()));
        // Registered before the file exists so a concurrent sweep never takes it for a stray.
        self.writing.insert(tmp_path.clone());
        let file = match tokio::fs::File::create(&tmp_path).await {
            Ok(file) => file,
            Err(e) => {
                self.writing.release(&tmp_path);
                return Err(AppError::CacheWrite(format!("creating {:?}: {}", tmp_path, e)));
            }
        };

        Ok(CacheWriter {
            key: key.to_string(),
            tmp_path,
            file: Some(file),
            written: 0,
            finished: false,
            writing: self.writing.clone(),
        })
    }

    async fn publish(&self, key: &str, tmp_path: &Path, size: u64) -> Result<CacheEntry> {
        let mut index = self.index.lock().await;

        if let Some(existing) = index.entries.get(key) {
            let existing = existing.clone();
            drop(index);
            let _ = tokio::fs::remove_file(tmp_path).await;
            self.writing.release(tmp_path);
            debug!("💾 [CACHE] Duplicate publish for {}, keeping existing entry", key);
            return Ok(existing);
        }

        let victims = match self.plan_eviction(&index, size) {
            Some(victims) => victims,
            None => {
                return Err(AppError::CacheWrite(format!(
                    "{} bytes for {} do not fit in quota {} (used {}, pinned entries cannot be evicted)",
                    size, key, self.quota_bytes, index.total_size
                )));
            }
        };

        let final_path = self.entry_path(key);
        if let Err(e) = tokio::fs::rename(tmp_path, &final_path).await {
            return Err(AppError::CacheWrite(format!("publishing {}: {}", key, e)));
        }
        self.writing.release(tmp_path);

        let mut evicted_paths = Vec::with_capacity(victims.len());
        for victim in &victims {
            if let Some(old) = index.entries.pop(victim) {
                index.total_size = index.total_size.saturating_sub(old.size_bytes);
                evicted_paths.push(old.path);
            }
        }

        let entry = CacheEntry {
            key: key.to_string(),
            path: final_path,
            size_bytes: size,
            last_accessed_at: Utc::now(),
            complete: true,
        };
        index.entries.put(key.to_string(), entry.clone());
        index.total_size += size;
        index.direct.remove(key);
        self.persist_locked(&index).await;
        let total = index.total_size;
        drop(index);

        for path in evicted_paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("⚠️ [CACHE] Failed to delete evicted file {:?}: {}", path, e);
            }
        }
        if !victims.is_empty() {
            info!("🧹 [CACHE] Evicted {} entries to fit {}: {:?}", victims.len(), key, victims);
        }
        info!("✅ [CACHE] Published {} ({} bytes, {} / {} used)", key, size, total, self.quota_bytes);

        let _ = self.published.send(key.to_string());
        Ok(entry)
    }

    /// Least recently used unpinned keys whose removal makes room for `incoming` bytes, or `None`
    /// when even evicting every unpinned entry is not enough.
    fn plan_eviction(&self, index: &Index, incoming: u64) -> Option<Vec<String>> {
        if incoming > self.quota_bytes {
            return None;
        }
        let mut projected = index.total_size + incoming;
        let mut victims = Vec::new();
        for (key, entry) in index.entries.iter().rev() {
            if projected <= self.quota_bytes {
                break;
            }
            if index.pinned.contains(key) {
                continue;
            }
            projected -= entry.size_bytes;
            victims.push(key.clone());
        }
        if projected <= self.quota_bytes {
            Some(victims)
        } else {
            None
        }
    }

    async fn enforce_quota(&self) {
        let mut index = self.index.lock().await;
        if index.total_size <= self.quota_bytes {
            return;
        }
        let victims = self.plan_eviction(&index, 0).unwrap_or_default();
        let mut paths = Vec::new();
        for victim in &victims {
            if let Some(old) = index.entries.pop(victim) {
                index.total_size = index.total_size.saturating_sub(old.size_bytes);
                paths.push(old.path);
            }
        }
        self.persist_locked(&index).await;
        drop(index);
        for path in paths {
            let _ = tokio::fs::remove_file(path).await;
        }
        if !victims.is_empty() {
            info!("🧹 [CACHE] Trimmed {} entries to respect quota", victims.len());
        }
    }

    /// Removes one entry. Refuses while the key is pinned by playback.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        if index.pinned.contains(key) {
            return Err(AppError::InvalidInput(format!("{} is in use by playback", key)));
        }
        let removed = index.entries.pop(key);
        let direct = index.direct.remove(key);
        if let Some(entry) = &removed {
            index.total_size = index.total_size.saturating_sub(entry.size_bytes);
            self.persist_locked(&index).await;
        }
        drop(index);

        if let Some(entry) = &removed {
            remove_if_present(&entry.path).await?;
        }
        Ok(removed.is_some() || direct.is_some())
    }

    /// Drops every unpinned entry.
    pub async fn clear(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        let keys: Vec<String> = index
            .entries
            .iter()
            .filter(|(key, _)| !index.pinned.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        let mut paths = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(entry) = index.entries.pop(key) {
                index.total_size = index.total_size.saturating_sub(entry.size_bytes);
                paths.push(entry.path);
            }
        }
        self.persist_locked(&index).await;
        drop(index);

        let mut failed = 0;
        for path in paths {
            if let Err(e) = remove_if_present(&path).await {
                warn!("⚠️ [CACHE] Failed to delete {:?}: {}", path, e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(AppError::CacheWrite(format!("{} cached files could not be deleted", failed)));
        }
        info!("🧹 [CACHE] Cleared {} entries", keys.len());
        Ok(keys.len())
    }

    /// Protects a key from eviction while playback holds it open.
    pub async fn pin(&self, key: &str) {
        self.index.lock().await.pinned.insert(key.to_string());
    }

    pub async fn unpin(&self, key: &str) {
        self.index.lock().await.pinned.remove(key);
    }

    pub async fn is_pinned(&self, key: &str) -> bool {
        self.index.lock().await.pinned.contains(key)
    }

    /// Records a playable path outside the quota, used when caching failed but the audio exists.
    pub async fn register_direct(&self, key: &str, path: PathBuf) {
        info!("↪️ [CACHE] Direct-stream fallback for {}: {:?}", key, path);
        self.index.lock().await.direct.insert(key.to_string(), path);
        let _ = self.published.send(key.to_string());
    }

    /// Cached entry first, then a direct-stream fallback.
    pub async fn lookup_playable(&self, key: &str) -> Option<Playable> {
        if let Some(entry) = self.get(key).await {
            return Some(Playable {
                key: key.to_string(),
                path: entry.path,
                cached: true,
            });
        }
        let index = self.index.lock().await;
        index.direct.get(key).map(|path| Playable {
            key: key.to_string(),
            path: path.clone(),
            cached: false,
        })
    }

    /// Waits until `key` becomes playable, up to `timeout`.
    pub async fn wait_playable(&self, key: &str, timeout: Duration) -> Result<Playable> {
        let mut published = self.published.subscribe();
        if let Some(playable) = self.lookup_playable(key).await {
            return Ok(playable);
        }

        let wait = async {
            loop {
                match published.recv().await {
                    Ok(published_key) if published_key == key => {
                        if let Some(playable) = self.lookup_playable(key).await {
                            return Ok(playable);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(playable) = self.lookup_playable(key).await {
                            return Ok(playable);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AppError::NotReady(key.to_string()));
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(AppError::LoadTimeout(key.to_string())),
        }
    }

    /// Like [`ContentCache::wait_playable`] but only a complete cache entry counts.
    pub async fn wait_for(&self, key: &str, timeout: Duration) -> Result<CacheEntry> {
        let mut published = self.published.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.get(key).await {
                return Ok(entry);
            }
            match tokio::time::timeout_at(deadline, published.recv()).await {
                Err(_) => return Err(AppError::LoadTimeout(key.to_string())),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(AppError::NotReady(key.to_string()));
                }
                Ok(_) => {}
            }
        }
    }

    /// Removes entries whose files are missing or have the wrong size, plus stray files left by
    /// interrupted writes or crashes. Pinned entries are left alone.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut index = self.index.lock().await;

        let candidates: Vec<(String, PathBuf, u64)> = index
            .entries
            .iter()
            .filter(|(key, _)| !index.pinned.contains(*key))
            .map(|(key, e)| (key.clone(), e.path.clone(), e.size_bytes))
            .collect();

        let mut broken = Vec::new();
        for (key, path, size_bytes) in candidates {
            let healthy = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.is_file() && meta.len() == size_bytes,
                Err(_) => false,
            };
            if !healthy {
                broken.push(key);
            }
        }
        for key in &broken {
            if let Some(entry) = index.entries.pop(key) {
                warn!("⚠️ [CACHE] Dropping missing or corrupted entry {} ({:?})", key, entry.path);
                let _ = tokio::fs::remove_file(&entry.path).await;
                report.removed_entries += 1;
            }
        }

        let known: HashSet<PathBuf> = index.entries.iter().map(|(_, e)| e.path.clone()).collect();
        report.removed_files += Self::remove_unknown_files(&self.audio_dir, |p| known.contains(p)).await?;

        let keep: HashSet<PathBuf> = self
            .writing
            .paths()
            .iter()
            .cloned()
            .chain(index.direct.values().cloned())
            .collect();
        report.removed_files += Self::remove_unknown_files(&self.tmp_dir, |p| keep.contains(p)).await?;

        index.total_size = index.entries.iter().map(|(_, e)| e.size_bytes).sum();
        self.persist_locked(&index).await;

        if report.removed_entries > 0 || report.removed_files > 0 {
            info!(
                "🧹 [CACHE] Sweep removed {} entries and {} stray files",
                report.removed_entries, report.removed_files
            );
        }
        Ok(report)
    }

    async fn remove_unknown_files<F>(dir: &Path, keep: F) -> Result<usize>
    where
        F: Fn(&Path) -> bool,
    {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if keep(&path) {
                continue;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                debug!("🧹 [CACHE] Removed stray file {:?}", path);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Runs [`ContentCache::sweep`] every `interval` until `shutdown` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.sweep().await {
                            warn!("⚠️ [CACHE] Periodic sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    async fn persist_locked(&self, index: &Index) {
        let persisted = PersistedIndex {
            total_size: index.total_size,
            entries: index.entries.iter().rev().map(|(_, e)| e.clone()).collect(),
        };
        let path = self.cache_dir.join(INDEX_FILE);
        let tmp = self.cache_dir.join(format!("{}.tmp", INDEX_FILE));

        let result = async {
            let content = serde_json::to_vec_pretty(&persisted)?;
            tokio::fs::write(&tmp, content).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok::<(), AppError>(())
        }
        .await;

        if let Err(e) = result {
            warn!("⚠️ [CACHE] Failed to persist index: {}", e);
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_size,
            quota_bytes: self.quota_bytes,
            pinned: index.pinned.len(),
            direct: index.direct.len(),
        }
    }

    /// Snapshot of all entries, most recently used first.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let index = self.index.lock().await;
        index.entries.iter().map(|(_, e)| e.clone()).collect()
    }
}

/// Streaming write into the cache. Dropping it without [`CacheWriter::commit`] deletes the
/// partial file, so nothing half-written ever becomes visible.
pub struct CacheWriter {
    key: String,
    tmp_path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    finished: bool,
    writing: InFlight,
}

impl CacheWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::CacheWrite("writer already closed".to_string()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| AppError::CacheWrite(format!("writing {}: {}", self.key, e)))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn close_file(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| AppError::CacheWrite(format!("flushing {}: {}", self.key, e)))?;
            file.sync_all()
                .await
                .map_err(|e| AppError::CacheWrite(format!("syncing {}: {}", self.key, e)))?;
        }
        Ok(())
    }

    /// Atomically publishes the payload. On failure the temp file is kept so the caller can
    /// [`CacheWriter::spill_direct`] it.
    pub async fn commit(&mut self, cache: &ContentCache) -> Result<CacheEntry> {
        self.close_file().await?;
        let entry = cache.publish(&self.key, &self.tmp_path, self.written).await?;
        self.finished = true;
        Ok(entry)
    }

    /// Keeps the fully written temp file and registers it as the key's direct-stream path.
    pub async fn spill_direct(mut self, cache: &ContentCache) -> Result<PathBuf> {
        self.close_file().await?;
        cache.register_direct(&self.key, self.tmp_path.clone()).await;
        self.finished = true;
        self.writing.release(&self.tmp_path);
        Ok(self.tmp_path.clone())
    }

    /// Discards the partial payload.
    pub async fn abort(mut self) {
        self.file = None;
        self.finished = true;
        let _ = tokio::fs::remove_file(&self.tmp_path).await;
        self.writing.release(&self.tmp_path);
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file = None;
            let _ = std::fs::remove_file(&self.tmp_path);
            self.writing.release(&self.tmp_path);
        }
    }
}

/// Deletes a file, treating one that is already gone as deleted.
async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
