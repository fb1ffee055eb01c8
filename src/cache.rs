//! Derivative cache for resized images.
//!
//! Decoding, resampling and re-encoding is the expensive part of serving an
//! image. This module keeps every derivative produced for a request so the
//! next identical request is a single file read.
//!
//! # Design
//!
//! ## Cache keys
//!
//! A derivative is identified by [`derive_key`]: SHA-256 over the original's
//! public path, the requested width and height, and every field of
//! [`ResizeOptions`], truncated to [`KEY_LEN`] hex characters. The key is a
//! pure function of the request, so it is stable across restarts and two
//! requests that would produce the same bytes always share one file.
//!
//! Keys are path-based, not content-based: an original replaced in place under
//! the same filename keeps serving its old derivatives. Uploads always get a
//! fresh generated filename, so the service itself never does this.
//!
//! ## Storage
//!
//! Derivatives are stored flat as `<cache_dir>/{key}.{ext}`. Writes go through
//! [`write_atomic`] (temp file + rename), so concurrent misses for the same key
//! may both render and both write, and readers only ever see a complete file.
//! Both writers produce identical bytes, so the race is harmless.
//!
//! A lookup reads the file in one step rather than checking for it first, so
//! an entry evicted or invalidated between lookup and response is either
//! served whole or reported as a miss.
//!
//! ## Reverse index
//!
//! `<cache_dir>/.cache-index.json` maps each derivative file to the original it
//! was rendered from. Deleting an original removes exactly the files recorded
//! for it; nothing is matched by filename patterns. A missing, corrupt or
//! wrong-version index loads as empty, which only means older derivatives are
//! no longer invalidated automatically.
//!
//! ## Eviction
//!
//! By default the cache grows without bound and cleanup is left to the
//! operator. Setting `cache.max_bytes` enables least-recently-used eviction
//! over indexed derivatives after each write.

use crate::imaging::{OutputFormat, ResizeOptions};
use crate::store::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Name of the reverse index file within the cache directory.
const INDEX_FILENAME: &str = ".cache-index.json";

/// Bump to discard existing indexes when the format or key computation changes.
const INDEX_VERSION: u32 = 1;

/// Length of a derivative key in hex characters.
pub const KEY_LEN: usize = 32;

fn update_dimension(hasher: &mut Sha256, value: Option<u32>) {
    match value {
        Some(v) => {
            hasher.update(b"\x01");
            hasher.update(v.to_le_bytes());
        }
        None => hasher.update(b"\x00"),
    }
}

/// Derive the cache key for one (original, transform) combination.
///
/// Pure and deterministic; see the [module docs](self) for what goes in.
pub fn derive_key(
    original_path: &str,
    width: Option<u32>,
    height: Option<u32>,
    options: &ResizeOptions,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"derivative\0");
    hasher.update(original_path.as_bytes());
    hasher.update(b"\0");
    update_dimension(&mut hasher, width);
    update_dimension(&mut hasher, height);
    match options.format {
        Some(format) => {
            hasher.update(b"\x01");
            hasher.update(format.extension().as_bytes());
        }
        None => hasher.update(b"\x00"),
    }
    hasher.update(options.quality.value().to_le_bytes());
    hasher.update([
        options.fit as u8,
        options.position as u8,
        options.without_enlargement as u8,
    ]);
    hasher.update(options.background.rgba());

    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(KEY_LEN);
    hex
}

/// One derivative recorded in the reverse index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    /// Filename of the original this derivative was rendered from.
    pub original: String,
    pub size: u64,
    /// Logical clock value of the last write or hit.
    pub last_used: u64,
}

/// On-disk reverse index mapping derivative files to their originals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    /// Derivative file name (`{key}.{ext}`) → entry.
    pub entries: HashMap<String, IndexEntry>,
    #[serde(default)]
    clock: u64,
    /// Runtime reverse map: original → derivative file names.
    /// Built at load time, maintained on every mutation. Never serialized.
    #[serde(skip)]
    by_original: HashMap<String, BTreeSet<String>>,
}

impl CacheIndex {
    pub fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: HashMap::new(),
            clock: 0,
            by_original: HashMap::new(),
        }
    }

    /// Parse a serialized index. Corrupt or wrong-version input yields an
    /// empty index.
    pub fn from_json(content: &str) -> Self {
        let mut index: Self = match serde_json::from_str(content) {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "cache index unreadable, starting empty");
                return Self::empty();
            }
        };
        if index.version != INDEX_VERSION {
            warn!(
                found = index.version,
                expected = INDEX_VERSION,
                "cache index version mismatch, starting empty"
            );
            return Self::empty();
        }
        index.by_original = build_by_original(&index.entries);
        index.clock = index
            .entries
            .values()
            .map(|e| e.last_used)
            .max()
            .unwrap_or(0)
            .max(index.clock);
        index
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Record (or refresh) a derivative written for `original`.
    pub fn record(&mut self, file: String, original: String, size: u64) {
        let last_used = self.tick();
        if let Some(old) = self.entries.get(&file)
            && old.original != original
        {
            let old_original = old.original.clone();
            self.unlink_reverse(&old_original, &file);
        }
        self.by_original
            .entry(original.clone())
            .or_default()
            .insert(file.clone());
        self.entries.insert(
            file,
            IndexEntry {
                original,
                size,
                last_used,
            },
        );
    }

    /// Mark a derivative as just used. Returns false if it is not indexed.
    pub fn touch(&mut self, file: &str) -> bool {
        let now = self.tick();
        match self.entries.get_mut(file) {
            Some(entry) => {
                entry.last_used = now;
                true
            }
            None => false,
        }
    }

    pub fn derivatives_of(&self, original: &str) -> Vec<String> {
        self.by_original
            .get(original)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every derivative of `original` from the index and return them.
    pub fn remove_original(&mut self, original: &str) -> Vec<String> {
        let files = self.by_original.remove(original).unwrap_or_default();
        for file in &files {
            self.entries.remove(file);
        }
        files.into_iter().collect()
    }

    pub fn remove(&mut self, file: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(file)?;
        self.unlink_reverse(&entry.original, file);
        Some(entry)
    }

    fn unlink_reverse(&mut self, original: &str, file: &str) {
        if let Some(files) = self.by_original.get_mut(original) {
            files.remove(file);
            if files.is_empty() {
                self.by_original.remove(original);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Least-recently-used files to drop so the total fits in `budget`.
    /// `keep` is never selected.
    pub fn eviction_candidates(&self, budget: u64, keep: &str) -> Vec<String> {
        let mut total = self.total_bytes();
        if total <= budget {
            return Vec::new();
        }
        let mut by_age: Vec<(&String, &IndexEntry)> = self
            .entries
            .iter()
            .filter(|(file, _)| file.as_str() != keep)
            .collect();
        by_age.sort_by_key(|(file, entry)| (entry.last_used, file.as_str()));

        let mut victims = Vec::new();
        for (file, entry) in by_age {
            if total <= budget {
                break;
            }
            total = total.saturating_sub(entry.size);
            victims.push(file.clone());
        }
        victims
    }
}

fn build_by_original(entries: &HashMap<String, IndexEntry>) -> HashMap<String, BTreeSet<String>> {
    let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
    for (file, entry) in entries {
        map.entry(entry.original.clone())
            .or_default()
            .insert(file.clone());
    }
    map
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub path: PathBuf,
    /// File contents on a hit.
    pub bytes: Option<Vec<u8>>,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        self.bytes.is_some()
    }
}

/// Snapshot of cache activity since startup.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} rendered ({} total)",
                self.hits,
                self.misses,
                self.total()
            )?;
        } else {
            write!(f, "{} rendered", self.misses)?;
        }
        if self.evictions > 0 {
            write!(f, ", {} evicted", self.evictions)?;
        }
        Ok(())
    }
}

/// Filesystem-backed store of rendered derivatives.
pub struct DerivativeCache {
    dir: PathBuf,
    max_bytes: Option<u64>,
    index: Mutex<CacheIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DerivativeCache {
    /// Open (creating if needed) the cache directory and load its index.
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: Option<u64>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let index = match tokio::fs::read_to_string(dir.join(INDEX_FILENAME)).await {
            Ok(content) => CacheIndex::from_json(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => CacheIndex::empty(),
            Err(e) => {
                warn!(error = %e, "could not read cache index, starting empty");
                CacheIndex::empty()
            }
        };
        debug!(dir = %dir.display(), entries = index.len(), "derivative cache opened");

        Ok(Self {
            dir,
            max_bytes,
            index: Mutex::new(index),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn file_name(key: &str, format: OutputFormat) -> String {
        format!("{key}.{}", format.extension())
    }

    /// Read a derivative if it is on disk.
    pub async fn get(&self, key: &str, format: OutputFormat) -> io::Result<CacheLookup> {
        let name = Self::file_name(key, format);
        let path = self.dir.join(&name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        if bytes.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.index.lock().await.touch(&name);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(CacheLookup { path, bytes })
    }

    /// Store a rendered derivative for `original` and return its path.
    pub async fn put(
        &self,
        key: &str,
        format: OutputFormat,
        bytes: &[u8],
        original: &str,
    ) -> io::Result<PathBuf> {
        let name = Self::file_name(key, format);
        let path = self.dir.join(&name);
        write_atomic(&path, bytes).await?;

        let mut index = self.index.lock().await;
        index.record(name.clone(), original.to_string(), bytes.len() as u64);
        if let Some(budget) = self.max_bytes {
            self.evict_locked(&mut index, budget, &name).await;
        }
        if let Err(e) = self.save_locked(&index).await {
            warn!(error = %e, "failed to persist cache index");
        }
        Ok(path)
    }

    /// Remove every derivative recorded for `original`.
    ///
    /// Individual removal failures are logged and skipped. Returns the number
    /// of files actually removed.
    pub async fn invalidate(&self, original: &str) -> usize {
        let mut index = self.index.lock().await;
        let files = index.remove_original(original);
        let mut removed = 0;
        for file in &files {
            match tokio::fs::remove_file(self.dir.join(file)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %file, error = %e, "failed to remove cached derivative"),
            }
        }
        if !files.is_empty()
            && let Err(e) = self.save_locked(&index).await
        {
            warn!(error = %e, "failed to persist cache index");
        }
        debug!(original, removed, "derivatives invalidated");
        removed
    }

    async fn evict_locked(&self, index: &mut CacheIndex, budget: u64, keep: &str) {
        for file in index.eviction_candidates(budget, keep) {
            match tokio::fs::remove_file(self.dir.join(&file)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %file, error = %e, "failed to evict cached derivative");
                    continue;
                }
            }
            index.remove(&file);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(file = %file, "evicted derivative");
        }
    }

    async fn save_locked(&self, index: &CacheIndex) -> io::Result<()> {
        let json = index.to_json().map_err(io::Error::other)?;
        write_atomic(&self.dir.join(INDEX_FILENAME), json.as_bytes()).await
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: index.len(),
            bytes: index.total_bytes(),
        }
    }

    /// Index path, for tests and diagnostics.
    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::{Fit, Quality};
    use std::fs;
    use tempfile::TempDir;

    fn webp70() -> ResizeOptions {
        ResizeOptions {
            format: Some(OutputFormat::Webp),
            quality: Quality::new(70),
            ..ResizeOptions::default()
        }
    }

    // =========================================================================
    // derive_key
    // =========================================================================

    #[test]
    fn key_is_deterministic_and_fixed_length() {
        let a = derive_key("/public/images/shoes.jpg", Some(200), Some(200), &webp70());
        let b = derive_key("/public/images/shoes.jpg", Some(200), Some(200), &webp70());
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_varies_with_each_input() {
        let base = derive_key("/p/a.jpg", Some(200), Some(200), &webp70());
        assert_ne!(base, derive_key("/p/b.jpg", Some(200), Some(200), &webp70()));
        assert_ne!(base, derive_key("/p/a.jpg", Some(201), Some(200), &webp70()));
        assert_ne!(base, derive_key("/p/a.jpg", Some(200), None, &webp70()));

        let mut other = webp70();
        other.quality = Quality::new(71);
        assert_ne!(base, derive_key("/p/a.jpg", Some(200), Some(200), &other));

        let mut other = webp70();
        other.fit = Fit::Inside;
        assert_ne!(base, derive_key("/p/a.jpg", Some(200), Some(200), &other));

        let mut other = webp70();
        other.format = Some(OutputFormat::Jpeg);
        assert_ne!(base, derive_key("/p/a.jpg", Some(200), Some(200), &other));
    }

    #[test]
    fn key_distinguishes_width_from_height() {
        assert_ne!(
            derive_key("/p/a.jpg", Some(100), None, &ResizeOptions::default()),
            derive_key("/p/a.jpg", None, Some(100), &ResizeOptions::default())
        );
    }

    // =========================================================================
    // CacheIndex
    // =========================================================================

    #[test]
    fn index_tracks_derivatives_per_original() {
        let mut index = CacheIndex::empty();
        index.record("k1.jpg".into(), "foo.jpg".into(), 10);
        index.record("k2.webp".into(), "foo.jpg".into(), 20);
        index.record("k3.jpg".into(), "bar.jpg".into(), 5);

        assert_eq!(index.derivatives_of("foo.jpg"), vec!["k1.jpg", "k2.webp"]);
        assert_eq!(index.total_bytes(), 35);

        let removed = index.remove_original("foo.jpg");
        assert_eq!(removed, vec!["k1.jpg", "k2.webp"]);
        assert_eq!(index.len(), 1);
        assert!(index.derivatives_of("foo.jpg").is_empty());
    }

    #[test]
    fn index_roundtrip_rebuilds_reverse_map() {
        let mut index = CacheIndex::empty();
        index.record("k1.jpg".into(), "foo.jpg".into(), 10);
        index.record("k2.png".into(), "bar.png".into(), 10);

        let loaded = CacheIndex::from_json(&index.to_json().unwrap());
        assert_eq!(loaded.derivatives_of("foo.jpg"), vec!["k1.jpg"]);
        assert_eq!(loaded.derivatives_of("bar.png"), vec!["k2.png"]);
        assert_eq!(loaded.entries, index.entries);
    }

    #[test]
    fn index_corrupt_json_is_empty() {
        assert!(CacheIndex::from_json("not json").is_empty());
    }

    #[test]
    fn index_wrong_version_is_empty() {
        let json = format!(
            r#"{{"version": {}, "entries": {{"a.jpg": {{"original":"x.jpg","size":1,"last_used":1}}}}}}"#,
            INDEX_VERSION + 1
        );
        assert!(CacheIndex::from_json(&json).is_empty());
    }

    #[test]
    fn eviction_picks_least_recently_used() {
        let mut index = CacheIndex::empty();
        index.record("old.jpg".into(), "a.jpg".into(), 100);
        index.record("mid.jpg".into(), "a.jpg".into(), 100);
        index.record("new.jpg".into(), "a.jpg".into(), 100);
        index.touch("old.jpg");

        assert_eq!(index.eviction_candidates(200, "new.jpg"), vec!["mid.jpg"]);
        assert!(index.eviction_candidates(300, "new.jpg").is_empty());
    }

    #[test]
    fn eviction_never_selects_kept_file() {
        let mut index = CacheIndex::empty();
        index.record("big.jpg".into(), "a.jpg".into(), 1_000);
        assert!(index.eviction_candidates(10, "big.jpg").is_empty());
    }

    // =========================================================================
    // DerivativeCache
    // =========================================================================

    #[tokio::test]
    async fn miss_then_hit() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivativeCache::open(tmp.path(), None).await.unwrap();

        let lookup = cache.get("abc", OutputFormat::Webp).await.unwrap();
        assert!(!lookup.is_hit());
        assert_eq!(lookup.path, tmp.path().join("abc.webp"));

        let path = cache
            .put("abc", OutputFormat::Webp, b"pixels", "shoes.jpg")
            .await
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"pixels");

        let lookup = cache.get("abc", OutputFormat::Webp).await.unwrap();
        assert_eq!(lookup.bytes.as_deref(), Some(&b"pixels"[..]));

        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 6);
    }

    #[tokio::test]
    async fn put_persists_index() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = DerivativeCache::open(tmp.path(), None).await.unwrap();
            cache
                .put("k1", OutputFormat::Jpeg, b"a", "foo.jpg")
                .await
                .unwrap();
            assert!(cache.index_path().exists());
        }
        let reopened = DerivativeCache::open(tmp.path(), None).await.unwrap();
        assert_eq!(reopened.invalidate("foo.jpg").await, 1);
        assert!(!tmp.path().join("k1.jpg").exists());
    }

    #[tokio::test]
    async fn invalidate_removes_only_that_originals_files() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivativeCache::open(tmp.path(), None).await.unwrap();
        cache.put("k1", OutputFormat::Jpeg, b"1", "foo.jpg").await.unwrap();
        cache.put("k2", OutputFormat::Webp, b"2", "foo.jpg").await.unwrap();
        cache.put("k3", OutputFormat::Jpeg, b"3", "foobar.jpg").await.unwrap();

        assert_eq!(cache.invalidate("foo.jpg").await, 2);
        assert!(!tmp.path().join("k1.jpg").exists());
        assert!(!tmp.path().join("k2.webp").exists());
        // Substring of the name is not enough to be swept
        assert!(tmp.path().join("k3.jpg").exists());
    }

    #[tokio::test]
    async fn invalidate_tolerates_already_missing_files() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivativeCache::open(tmp.path(), None).await.unwrap();
        cache.put("k1", OutputFormat::Jpeg, b"1", "foo.jpg").await.unwrap();
        fs::remove_file(tmp.path().join("k1.jpg")).unwrap();

        assert_eq!(cache.invalidate("foo.jpg").await, 0);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn byte_budget_evicts_lru() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivativeCache::open(tmp.path(), Some(10)).await.unwrap();
        cache.put("a", OutputFormat::Png, &[0; 6], "x.png").await.unwrap();
        cache.put("b", OutputFormat::Png, &[0; 6], "x.png").await.unwrap();

        assert!(!tmp.path().join("a.png").exists());
        assert!(tmp.path().join("b.png").exists());
        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.bytes, 6);
    }

    #[tokio::test]
    async fn evicted_entry_reads_as_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivativeCache::open(tmp.path(), Some(10)).await.unwrap();
        cache.put("a", OutputFormat::Png, &[1; 6], "x.png").await.unwrap();
        assert!(cache.get("a", OutputFormat::Png).await.unwrap().is_hit());

        // Another request's write pushes "a" out of the budget.
        cache.put("b", OutputFormat::Png, &[2; 6], "y.png").await.unwrap();

        let lookup = cache.get("a", OutputFormat::Png).await.unwrap();
        assert_eq!(lookup.bytes, None);
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.evictions), (1, 1, 1));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let cache = DerivativeCache::open(tmp.path(), None).await.unwrap();
        cache.put("k", OutputFormat::Gif, b"gif", "a.gif").await.unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_with_hits() {
        let s = CacheStats {
            hits: 5,
            misses: 2,
            ..CacheStats::default()
        };
        assert_eq!(s.to_string(), "5 cached, 2 rendered (7 total)");
    }

    #[test]
    fn cache_stats_display_with_evictions() {
        let s = CacheStats {
            misses: 3,
            evictions: 1,
            ..CacheStats::default()
        };
        assert_eq!(s.to_string(), "3 rendered, 1 evicted");
    }
}
