//! Artifact store: the only channel between stages.
//!
//! ## Key scheme
//!
//! Every key is a pure function of (job, chapter, stage), so a re-run writes
//! exactly the keys the previous run wrote and nothing else:
//!
//! | Artifact | Key |
//! |----------|-----|
//! | page image | `jobs/<job>/pages/<chapter>/<page:05>.png` |
//! | chapter record | `jobs/<job>/chapters/<chapter>.json` |
//! | OCR result | `jobs/<job>/ocr/<chapter>.json` |
//! | Markdown fragment | `jobs/<job>/markdown/<chapter>.json` |
//! | final document | `jobs/<job>/final/document.md` |
//! | final manifest | `jobs/<job>/final/manifest.json` |
//! | run record | `jobs/<job>/runs/<run_id>.json` |
//!
//! Writes replace the whole object. [`FsStore`] writes to a temp file in the
//! target directory and renames it into place, so a reader sees either the
//! previous object or the new one, never a prefix of it.

use crate::model::{ChapterId, JobId, RunId, StageName};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors raised by an [`ArtifactStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact '{key}' not found")]
    NotFound { key: String },

    #[error("invalid artifact key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("artifact '{key}' could not be decoded: {detail}")]
    Corrupt { key: String, detail: String },

    #[error("I/O error on artifact '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A validated, `/`-separated artifact key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Validate an arbitrary key: non-empty segments, no `.`-prefixed
    /// segments (temp files and traversal), no backslashes.
    pub fn parse(key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: key.clone(),
            reason: reason.to_string(),
        };
        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.contains('\\') {
            return Err(invalid("backslashes are not allowed"));
        }
        for segment in key.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if segment.starts_with('.') {
                return Err(invalid("segments must not start with '.'"));
            }
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Identifiers are validated on construction and cannot contain '/' or a
    // leading '.', so the scheme below always yields valid keys.
    fn scheme(key: String) -> Self {
        Self(key)
    }

    pub fn chapters_prefix(job: &JobId) -> String {
        format!("jobs/{job}/chapters/")
    }

    pub fn runs_prefix(job: &JobId) -> String {
        format!("jobs/{job}/runs/")
    }

    pub fn page_image(job: &JobId, chapter: &ChapterId, page_index: usize) -> Self {
        Self::scheme(format!("jobs/{job}/pages/{chapter}/{page_index:05}.png"))
    }

    pub fn chapter_record(job: &JobId, chapter: &ChapterId) -> Self {
        Self::scheme(format!("jobs/{job}/chapters/{chapter}.json"))
    }

    /// Output key of a per-chapter stage.
    pub fn stage_output(job: &JobId, stage: StageName, chapter: &ChapterId) -> Self {
        match stage {
            StageName::Ocr | StageName::Markdown => {
                Self::scheme(format!("jobs/{job}/{stage}/{chapter}.json"))
            }
            StageName::Final => Self::final_document(job),
        }
    }

    pub fn ocr_result(job: &JobId, chapter: &ChapterId) -> Self {
        Self::stage_output(job, StageName::Ocr, chapter)
    }

    pub fn markdown_fragment(job: &JobId, chapter: &ChapterId) -> Self {
        Self::stage_output(job, StageName::Markdown, chapter)
    }

    pub fn final_document(job: &JobId) -> Self {
        Self::scheme(format!("jobs/{job}/final/document.md"))
    }

    pub fn final_manifest(job: &JobId) -> Self {
        Self::scheme(format!("jobs/{job}/final/manifest.json"))
    }

    pub fn run_record(job: &JobId, run: &RunId) -> Self {
        Self::scheme(format!("jobs/{job}/runs/{run}.json"))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

/// Durable key-addressed storage shared by all stages.
///
/// Implementations must be read-after-write consistent per key and must
/// replace objects atomically.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch the object under `key`; [`StoreError::NotFound`] if absent.
    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactKey>, StoreError>;

    async fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Serialise `value` as pretty JSON and store it.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: e.to_string(),
    })?;
    store.put(key, bytes).await
}

/// Fetch and deserialise a JSON artifact. Decoding failures surface as
/// [`StoreError::Corrupt`].
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
) -> Result<T, StoreError> {
    let bytes = store.get(key).await?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Process-local store, used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ArtifactKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every key currently stored.
    pub async fn keys(&self) -> Vec<ArtifactKey> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Remove an object. Only tests need this; stages never delete.
    pub async fn remove(&self, key: &ArtifactKey) -> Option<Vec<u8>> {
        self.objects.write().await.remove(key)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.objects.write().await.insert(key.clone(), bytes);
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactKey>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ── Filesystem store ─────────────────────────────────────────────────────

/// Store rooted at a local directory; one file per key.
///
/// Safe to share between processes: isolated stage workers open the same
/// root and see each other's writes once the rename has completed.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        key.as_str()
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("artifact path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, root, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let len = bytes.len();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("write task panicked: {e}")))?
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })?;
        debug!("stored {} ({} bytes)", key, len);
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactKey>, StoreError> {
        // Walk the deepest directory fully named by the prefix.
        let dir_part = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let start = dir_part
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment));
        let root = self.root.clone();
        let prefix_owned = prefix.to_string();

        let mut keys = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            collect_files(&start, &root, &mut found).map(|_| found)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("list task panicked: {e}")))?
        .map_err(|source| StoreError::Io {
            key: prefix_owned.clone(),
            source,
        })?
        .into_iter()
        .filter(|k| k.starts_with(&prefix_owned))
        .filter_map(|k| ArtifactKey::parse(k).ok())
        .collect::<Vec<_>>();

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobId {
        JobId::new("manual").unwrap()
    }

    fn ch(id: &str) -> ChapterId {
        ChapterId::new(id).unwrap()
    }

    #[test]
    fn key_scheme_is_deterministic() {
        let j = job();
        assert_eq!(
            ArtifactKey::page_image(&j, &ch("01"), 3).as_str(),
            "jobs/manual/pages/01/00003.png"
        );
        assert_eq!(
            ArtifactKey::ocr_result(&j, &ch("01")).as_str(),
            "jobs/manual/ocr/01.json"
        );
        assert_eq!(
            ArtifactKey::markdown_fragment(&j, &ch("02")).as_str(),
            "jobs/manual/markdown/02.json"
        );
        assert_eq!(
            ArtifactKey::stage_output(&j, StageName::Final, &ch("02")),
            ArtifactKey::final_document(&j)
        );
        assert_eq!(
            ArtifactKey::chapter_record(&j, &ch("02")).as_str(),
            "jobs/manual/chapters/02.json"
        );
    }

    #[test]
    fn key_validation() {
        assert!(ArtifactKey::parse("jobs/a/b.json").is_ok());
        assert!(ArtifactKey::parse("").is_err());
        assert!(ArtifactKey::parse("jobs//b").is_err());
        assert!(ArtifactKey::parse("jobs/../b").is_err());
        assert!(ArtifactKey::parse("jobs/.tmp-123").is_err());
        assert!(ArtifactKey::parse("jobs\\b").is_err());
        assert!(ArtifactKey::parse("/jobs/b").is_err());
    }

    #[test]
    fn page_keys_are_zero_padded() {
        let key = ArtifactKey::page_image(&job(), &ch("01"), 12);
        assert_eq!(key.as_str(), "jobs/manual/pages/01/00012.png");
    }

    #[tokio::test]
    async fn memory_store_put_get_list() {
        let store = MemoryStore::new();
        let a = ArtifactKey::parse("jobs/j/ocr/01.json").unwrap();
        let b = ArtifactKey::parse("jobs/j/ocr/02.json").unwrap();
        let c = ArtifactKey::parse("jobs/k/ocr/01.json").unwrap();
        store.put(&b, b"two".to_vec()).await.unwrap();
        store.put(&a, b"one".to_vec()).await.unwrap();
        store.put(&c, b"other".to_vec()).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), b"one");
        assert_eq!(store.list("jobs/j/").await.unwrap(), vec![a.clone(), b]);
        assert!(store.exists(&c).await.unwrap());

        store.put(&a, b"uno".to_vec()).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap(), b"uno");

        let missing = ArtifactKey::parse("jobs/j/ocr/03.json").unwrap();
        assert!(store.get(&missing).await.unwrap_err().is_not_found());
        assert!(!store.exists(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn fs_store_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let page = ArtifactKey::page_image(&job(), &ch("01"), 0);
        let ocr = ArtifactKey::ocr_result(&job(), &ch("01"));

        store.put(&page, vec![1, 2, 3]).await.unwrap();
        store.put(&ocr, b"{}".to_vec()).await.unwrap();
        store.put(&ocr, b"{\"v\":2}".to_vec()).await.unwrap();

        assert_eq!(store.get(&page).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.get(&ocr).await.unwrap(), b"{\"v\":2}");
        assert_eq!(
            store.list("jobs/manual/pages/01/").await.unwrap(),
            vec![page.clone()]
        );
        assert_eq!(store.list("jobs/manual/").await.unwrap(), vec![ocr, page]);
        assert!(store.list("jobs/none/").await.unwrap().is_empty());

        let missing = ArtifactKey::final_document(&job());
        assert!(store.get(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn json_helpers_report_corrupt_objects() {
        let store = MemoryStore::new();
        let key = ArtifactKey::parse("jobs/j/x.json").unwrap();
        put_json(&store, &key, &vec![1u32, 2, 3]).await.unwrap();
        let back: Vec<u32> = get_json(&store, &key).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        store.put(&key, b"not json".to_vec()).await.unwrap();
        let err = get_json::<Vec<u32>>(&store, &key).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "got: {err}");
    }
}
