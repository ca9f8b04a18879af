//! Content-addressed pre-dex cache
//!
//! Each library jar is dexed once per (jar content, build-tools revision).
//! Concurrent requests for the same jar share one `dx` run through
//! [`CreatingCache`]; finished entries are recorded in a JSON index so the
//! next build can reuse them without running `dx` again.

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use apkforge_exec::{
    CacheBusy, CacheStats, CancellationToken, CreatingCache, ProcessInfo, ProcessRunner,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BuildError, BuildResult};

const INDEX_FILE_NAME: &str = "index.json";
const INDEX_VERSION: u32 = 1;

/// Identity of one pre-dex result.
///
/// The jar path is carried for the factory but is not part of the identity:
/// the same jar copied into two projects is dexed once.
#[derive(Debug, Clone)]
pub struct PreDexKey {
    sha256: String,
    revision: String,
    jar: PathBuf,
}

/// Whether `revision` can be embedded in a pre-dex file name.
///
/// Only ASCII letters, digits, `.`, `_` and `-` are accepted, and the
/// revision must contain at least one letter or digit.
pub fn is_valid_revision(revision: &str) -> bool {
    revision.chars().any(|c| c.is_ascii_alphanumeric())
        && revision
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl PreDexKey {
    /// Hash `jar` and build its key.
    ///
    /// Fails with `InvalidInput` for a revision that is not a plain file-name
    /// component.
    pub fn for_jar(jar: &Path, revision: &str) -> io::Result<Self> {
        if !is_valid_revision(revision) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid build-tools revision '{}'", revision),
            ));
        }
        Ok(Self {
            sha256: sha256_file(jar)?,
            revision: revision.to_string(),
            jar: jar.to_path_buf(),
        })
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn jar(&self) -> &Path {
        &self.jar
    }

    fn id(&self) -> (String, String) {
        (self.sha256.clone(), self.revision.clone())
    }
}

impl PartialEq for PreDexKey {
    fn eq(&self, other: &Self) -> bool {
        self.sha256 == other.sha256 && self.revision == other.revision
    }
}

impl Eq for PreDexKey {}

impl Hash for PreDexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sha256.hash(state);
        self.revision.hash(state);
    }
}

/// A dexed library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreDexEntry {
    pub sha256: String,
    pub revision: String,
    /// Jar that first produced this entry
    pub jar: PathBuf,
    pub dex: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PreDexIndex {
    version: u32,
    entries: Vec<PreDexEntry>,
}

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreDexStats {
    /// Served from memory or a concurrent request
    pub hits: u64,
    /// Served from the on-disk index
    pub reused: u64,
    /// Required a `dx` run
    pub dexed: u64,
}

type StoredEntries = Arc<Mutex<HashMap<(String, String), PreDexEntry>>>;

/// Pre-dex cache bound to a store directory.
pub struct PreDexCache {
    cache: CreatingCache<PreDexKey, Arc<PreDexEntry>, BuildError>,
    store_dir: PathBuf,
    stored: StoredEntries,
    reused: Arc<AtomicU64>,
    dexed: Arc<AtomicU64>,
}

impl PreDexCache {
    /// Open the store at `store_dir`, loading its index if present.
    ///
    /// `dx` runs through `runner` and stops when `token` is cancelled.
    pub fn open(
        store_dir: impl Into<PathBuf>,
        dx: PathBuf,
        runner: ProcessRunner,
        token: CancellationToken,
    ) -> BuildResult<Self> {
        let store_dir = store_dir.into();
        fs::create_dir_all(&store_dir).map_err(|e| BuildError::io(&store_dir, e))?;

        let stored: StoredEntries = Arc::new(Mutex::new(load_index(&store_dir)));
        let reused = Arc::new(AtomicU64::new(0));
        let dexed = Arc::new(AtomicU64::new(0));

        let factory = {
            let store_dir = store_dir.clone();
            let stored = Arc::clone(&stored);
            let reused = Arc::clone(&reused);
            let dexed = Arc::clone(&dexed);
            move |key: &PreDexKey| -> BuildResult<Arc<PreDexEntry>> {
                let known = stored
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&key.id())
                    .cloned();
                if let Some(entry) = known.filter(|e| e.dex.is_file()) {
                    tracing::debug!(jar = %key.jar.display(), "pre-dex reused from index");
                    reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::new(entry));
                }

                let entry = run_dx(&dx, &runner, &token, &store_dir, key)?;
                dexed.fetch_add(1, Ordering::Relaxed);
                stored
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.id(), entry.clone());
                Ok(Arc::new(entry))
            }
        };

        Ok(Self {
            cache: CreatingCache::new(factory),
            store_dir,
            stored,
            reused,
            dexed,
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Dex `jar`, or return the existing result.
    ///
    /// Returns `Ok(None)` if `token` was cancelled while waiting for another
    /// thread that is dexing the same jar.
    pub fn get(
        &self,
        jar: &Path,
        revision: &str,
        token: &CancellationToken,
    ) -> BuildResult<Option<Arc<PreDexEntry>>> {
        let key = PreDexKey::for_jar(jar, revision).map_err(|e| BuildError::io(jar, e))?;
        self.cache.get_interruptible(&key, token)
    }

    pub fn stats(&self) -> PreDexStats {
        let CacheStats { hits, misses: _ } = self.cache.stats();
        PreDexStats {
            hits,
            reused: self.reused.load(Ordering::Relaxed),
            dexed: self.dexed.load(Ordering::Relaxed),
        }
    }

    /// Number of entries known to the index.
    pub fn indexed(&self) -> usize {
        self.stored.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forget every entry, in memory and in the index.
    pub fn clear(&self) -> Result<(), CacheBusy> {
        self.cache.clear()?;
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.reused.store(0, Ordering::Relaxed);
        self.dexed.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Write the index for the next build.
    pub fn save_index(&self) -> BuildResult<()> {
        let mut entries: Vec<PreDexEntry> = self
            .stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.dex.is_file())
            .cloned()
            .collect();
        entries.sort_by(|a, b| (&a.sha256, &a.revision).cmp(&(&b.sha256, &b.revision)));

        let index = PreDexIndex {
            version: INDEX_VERSION,
            entries,
        };
        let path = self.store_dir.join(INDEX_FILE_NAME);
        let json = serde_json::to_string_pretty(&index)
            .map_err(|e| BuildError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::create_dir_all(&self.store_dir).map_err(|e| BuildError::io(&self.store_dir, e))?;
        fs::write(&path, json).map_err(|e| BuildError::io(&path, e))
    }
}

impl std::fmt::Debug for PreDexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreDexCache")
            .field("store_dir", &self.store_dir)
            .field("stats", &self.stats())
            .finish()
    }
}

fn load_index(store_dir: &Path) -> HashMap<(String, String), PreDexEntry> {
    let path = store_dir.join(INDEX_FILE_NAME);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read pre-dex index");
            return HashMap::new();
        }
    };

    match serde_json::from_str::<PreDexIndex>(&content) {
        Ok(index) if index.version == INDEX_VERSION => index
            .entries
            .into_iter()
            .filter(|e| e.dex.is_file())
            .map(|e| ((e.sha256.clone(), e.revision.clone()), e))
            .collect(),
        Ok(index) => {
            tracing::warn!(version = index.version, "ignoring pre-dex index with unknown version");
            HashMap::new()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed pre-dex index");
            HashMap::new()
        }
    }
}

fn run_dx(
    dx: &Path,
    runner: &ProcessRunner,
    token: &CancellationToken,
    store_dir: &Path,
    key: &PreDexKey,
) -> BuildResult<PreDexEntry> {
    if token.is_cancelled() {
        return Err(BuildError::Cancelled);
    }
    fs::create_dir_all(store_dir).map_err(|e| BuildError::io(store_dir, e))?;
    let dex = store_dir.join(format!("{}-{}.dex", key.sha256, key.revision));
    tracing::info!(jar = %key.jar.display(), "pre-dexing library");

    let info = ProcessInfo::new(dx)
        .describe("dx")
        .arg("--dex")
        .arg(format!("--output={}", dex.display()))
        .arg_path(&key.jar);

    let outcome = runner
        .run(&info, token)
        .and_then(|result| result.assert_normal_exit());
    if let Err(e) = outcome {
        // dx may leave a partial file behind
        let _ = fs::remove_file(&dex);
        return Err(BuildError::from_process("Dexer", e));
    }
    if !dex.is_file() {
        return Err(BuildError::Tool {
            stage: "Dexer",
            tool: "dx".to_string(),
            detail: format!("no output written to {}", dex.display()),
        });
    }

    Ok(PreDexEntry {
        sha256: key.sha256.clone(),
        revision: key.revision.clone(),
        jar: key.jar.clone(),
        dex,
        created_at: Utc::now(),
    })
}

/// SHA-256 of a file's contents, hex encoded.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(key: &PreDexKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_key_ignores_jar_path() {
        let a = PreDexKey {
            sha256: "abc".into(),
            revision: "21.1.2".into(),
            jar: PathBuf::from("/one/lib.jar"),
        };
        let b = PreDexKey {
            jar: PathBuf::from("/two/copy.jar"),
            ..a.clone()
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = PreDexKey {
            revision: "23.0.1".into(),
            ..a.clone()
        };
        assert_ne!(a, c);
    }

    #[test]
    fn test_revision_must_be_a_file_name_component() {
        assert!(is_valid_revision("21.1.2"));
        assert!(is_valid_revision("23.0.0-rc1"));
        assert!(!is_valid_revision(""));
        assert!(!is_valid_revision(".."));
        assert!(!is_valid_revision("../../escape"));
        assert!(!is_valid_revision("21/1"));
        assert!(!is_valid_revision("21\\1"));

        let temp = tempfile::TempDir::new().unwrap();
        let jar = temp.path().join("lib.jar");
        fs::write(&jar, b"abc").unwrap();
        let err = PreDexKey::for_jar(&jar, "../x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(PreDexKey::for_jar(&jar, "21.1.2").unwrap().revision(), "21.1.2");
    }

    #[test]
    fn test_sha256_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("lib.jar");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_malformed_index_ignored() {
        let temp = tempfile::TempDir::new().unwrap();
        fs::write(temp.path().join(INDEX_FILE_NAME), "{not json").unwrap();
        assert!(load_index(temp.path()).is_empty());
    }

    #[test]
    fn test_index_drops_entries_without_output() {
        let temp = tempfile::TempDir::new().unwrap();
        let present = temp.path().join("a.dex");
        fs::write(&present, b"dex").unwrap();
        let index = PreDexIndex {
            version: INDEX_VERSION,
            entries: vec![
                PreDexEntry {
                    sha256: "a".into(),
                    revision: "r".into(),
                    jar: PathBuf::from("/a.jar"),
                    dex: present.clone(),
                    created_at: Utc::now(),
                },
                PreDexEntry {
                    sha256: "b".into(),
                    revision: "r".into(),
                    jar: PathBuf::from("/b.jar"),
                    dex: temp.path().join("gone.dex"),
                    created_at: Utc::now(),
                },
            ],
        };
        fs::write(
            temp.path().join(INDEX_FILE_NAME),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();

        let loaded = load_index(temp.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&("a".to_string(), "r".to_string())].dex, present);
    }

    #[cfg(unix)]
    mod with_fake_dx {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Barrier;
        use std::thread;
        use tempfile::TempDir;

        /// Copies the jar to `--output=` and counts invocations.
        fn fake_dx(dir: &Path) -> PathBuf {
            let path = dir.join("dx");
            let script = format!(
                r#"#!/bin/sh
echo run >> "{}/dx.calls"
out=""
for a in "$@"; do
  case "$a" in
    --output=*) out="${{a#--output=}}" ;;
    --dex) ;;
    *) src="$a" ;;
  esac
done
case "$src" in *broken*) echo "trouble processing $src" >&2; exit 2 ;; esac
sleep 0.1
cat "$src" > "$out"
"#,
                dir.display()
            );
            fs::write(&path, script).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn dx_calls(dir: &Path) -> usize {
            fs::read_to_string(dir.join("dx.calls"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn open(temp: &TempDir, dx: &Path) -> PreDexCache {
            PreDexCache::open(
                temp.path().join("store"),
                dx.to_path_buf(),
                ProcessRunner::default(),
                CancellationToken::new(),
            )
            .unwrap()
        }

        #[test]
        fn test_concurrent_requests_dex_once() {
            let temp = TempDir::new().unwrap();
            let dx = fake_dx(temp.path());
            let jar = temp.path().join("lib.jar");
            fs::write(&jar, b"library bytes").unwrap();
            let cache = Arc::new(open(&temp, &dx));

            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let barrier = Arc::clone(&barrier);
                    let jar = jar.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        cache
                            .get(&jar, "21.1.2", &CancellationToken::new())
                            .unwrap()
                            .unwrap()
                    })
                })
                .collect();
            let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(dx_calls(temp.path()), 1);
            for entry in &entries[1..] {
                assert!(Arc::ptr_eq(&entries[0], entry));
            }
            assert_eq!(fs::read(&entries[0].dex).unwrap(), b"library bytes");
            assert_eq!(cache.stats().dexed, 1);
        }

        #[test]
        fn test_same_content_different_path_shares_entry() {
            let temp = TempDir::new().unwrap();
            let dx = fake_dx(temp.path());
            let a = temp.path().join("a.jar");
            let b = temp.path().join("b.jar");
            fs::write(&a, b"same").unwrap();
            fs::write(&b, b"same").unwrap();
            let cache = open(&temp, &dx);
            let token = CancellationToken::new();

            let first = cache.get(&a, "r", &token).unwrap().unwrap();
            let second = cache.get(&b, "r", &token).unwrap().unwrap();

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(dx_calls(temp.path()), 1);
        }

        #[test]
        fn test_index_survives_reopen() {
            let temp = TempDir::new().unwrap();
            let dx = fake_dx(temp.path());
            let jar = temp.path().join("lib.jar");
            fs::write(&jar, b"lib").unwrap();
            let token = CancellationToken::new();

            let cache = open(&temp, &dx);
            let first = cache.get(&jar, "r", &token).unwrap().unwrap();
            cache.save_index().unwrap();
            drop(cache);

            let cache = open(&temp, &dx);
            assert_eq!(cache.indexed(), 1);
            let second = cache.get(&jar, "r", &token).unwrap().unwrap();

            assert_eq!(dx_calls(temp.path()), 1);
            assert_eq!(second.dex, first.dex);
            assert_eq!(cache.stats().reused, 1);
            assert_eq!(cache.stats().dexed, 0);
        }

        #[test]
        fn test_dx_failure_is_tool_error_and_retryable() {
            let temp = TempDir::new().unwrap();
            let dx = fake_dx(temp.path());
            let jar = temp.path().join("broken.jar");
            fs::write(&jar, b"bad").unwrap();
            let cache = open(&temp, &dx);
            let token = CancellationToken::new();

            let err = cache.get(&jar, "r", &token).unwrap_err();
            assert!(matches!(&err, BuildError::Tool { tool, detail, .. }
                if tool == "dx" && detail.contains("trouble processing")));

            let _ = cache.get(&jar, "r", &token).unwrap_err();
            assert_eq!(dx_calls(temp.path()), 2);
            assert_eq!(cache.indexed(), 0);
        }
    }
}
