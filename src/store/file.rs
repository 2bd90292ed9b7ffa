//! File-backed run store
//!
//! One pretty-printed JSON document per run at `{dir}/{id}.json`.
//! Writes go to a temporary file that is renamed over the record, so a
//! crash never leaves a half-written run behind.
//!
//! Read-modify-write sections are serialized in-process by a mutex and
//! across processes by an exclusive `{id}.lock` guard file.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{apply_append, apply_swap, check_id, Result, RunStore, StoreError};
use crate::workflow::model::{StepResult, WorkflowRun};

/// Attempts to take a guard file before giving up.
const GUARD_ATTEMPTS: u32 = 200;

/// Pause between guard attempts.
const GUARD_RETRY: Duration = Duration::from_millis(10);

/// Guard files older than this belong to a dead writer.
const GUARD_STALE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct FileRunStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRunStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::Backend(format!(
                "Failed to create store directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        info!("Using run store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn guard_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }

    async fn read_record(&self, id: &str) -> Result<WorkflowRun> {
        check_id(id)?;
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => {
                return Err(StoreError::Backend(format!(
                    "Failed to read '{}': {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&content).map_err(|e| {
            StoreError::Serialization(format!("Failed to parse '{}': {}", path.display(), e))
        })
    }

    async fn write_record(&self, run: &WorkflowRun) -> Result<()> {
        let path = self.record_path(&run.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", run.id));
        let json = serde_json::to_vec_pretty(run)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let backend = |e: std::io::Error| {
            StoreError::Backend(format!("Failed to write '{}': {}", path.display(), e))
        };
        let mut file = fs::File::create(&tmp).await.map_err(backend)?;
        file.write_all(&json).await.map_err(backend)?;
        file.sync_all().await.map_err(backend)?;
        drop(file);
        fs::rename(&tmp, &path).await.map_err(backend)?;

        debug!("Saved run {} (version {})", run.id, run.version);
        Ok(())
    }

    /// Takes the cross-process guard for `id`.
    async fn acquire_guard(&self, id: &str) -> Result<FileGuard> {
        let path = self.guard_path(id);
        for _ in 0..GUARD_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(FileGuard { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if guard_is_stale(&path).await {
                        warn!("Removing stale store guard {}", path.display());
                        if let Err(e) = fs::remove_file(&path).await {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                warn!("Failed to remove stale guard {}: {}", path.display(), e);
                            }
                        }
                        continue;
                    }
                    tokio::time::sleep(GUARD_RETRY).await;
                }
                Err(e) => {
                    return Err(StoreError::Lock(format!(
                        "Failed to create guard '{}': {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Err(StoreError::Lock(format!(
            "Timed out waiting for guard '{}'",
            path.display()
        )))
    }

    /// Runs a read-modify-write of one record under both guards.
    async fn update<F>(&self, id: &str, change: F) -> Result<WorkflowRun>
    where
        F: FnOnce(&WorkflowRun) -> Result<WorkflowRun> + Send,
    {
        check_id(id)?;
        let _local = self.write_lock.lock().await;
        let guard = self.acquire_guard(id).await?;

        let result = async {
            let stored = self.read_record(id).await?;
            let next = change(&stored)?;
            self.write_record(&next).await?;
            Ok::<_, StoreError>(next)
        }
        .await;

        guard.release().await;
        result
    }
}

async fn guard_is_stale(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > GUARD_STALE)
        .unwrap_or(false)
}

/// Exclusive guard file; removed on release.
struct FileGuard {
    path: PathBuf,
}

impl FileGuard {
    async fn release(self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            warn!("Failed to remove store guard {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, mut run: WorkflowRun) -> Result<WorkflowRun> {
        check_id(&run.id)?;
        let _local = self.write_lock.lock().await;
        let guard = self.acquire_guard(&run.id).await?;

        let result = async {
            if fs::try_exists(self.record_path(&run.id)).await.unwrap_or(false) {
                return Err(StoreError::AlreadyExists(run.id.clone()));
            }
            run.version = 0;
            self.write_record(&run).await?;
            Ok::<_, StoreError>(run)
        }
        .await;

        guard.release().await;
        result
    }

    async fn load(&self, id: &str) -> Result<WorkflowRun> {
        self.read_record(id).await
    }

    async fn compare_and_swap(
        &self,
        run: WorkflowRun,
        expected_version: u64,
    ) -> Result<WorkflowRun> {
        let id = run.id.clone();
        self.update(&id, move |stored| apply_swap(stored, run, expected_version))
            .await
    }

    async fn append_trace(
        &self,
        id: &str,
        lock_token: &str,
        entry: StepResult,
    ) -> Result<WorkflowRun> {
        let token = lock_token.to_string();
        self.update(id, move |stored| apply_append(stored, &token, entry))
            .await
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_store, sample_run};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileRunStore::open(dir.path()).await.unwrap();
            store.insert(sample_run("persisted")).await.unwrap();
        }
        let store = FileRunStore::open(dir.path()).await.unwrap();
        let run = store.load("persisted").await.unwrap();
        assert_eq!(run.id, "persisted");
        assert!(dir.path().join("persisted.json").exists());
        assert!(!dir.path().join("persisted.lock").exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_serialization_error() {
        let dir = tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(matches!(
            store.load("bad").await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let dir = tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load("../outside").await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_guard_is_removed() {
        let dir = tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        let run = store.insert(sample_run("guarded")).await.unwrap();

        let guard = dir.path().join("guarded.lock");
        let file = std::fs::File::create(&guard).unwrap();
        let old = SystemTime::now() - Duration::from_secs(120);
        file.set_modified(old).unwrap();
        drop(file);

        let mut next = run.clone();
        next.cancel_requested = true;
        let saved = store.compare_and_swap(next, run.version).await.unwrap();
        assert!(saved.cancel_requested);
        assert!(!guard.exists());
    }
}
