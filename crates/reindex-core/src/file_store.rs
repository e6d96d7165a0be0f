use crate::identity::OrchestrationId;
use crate::state::{unix_now_ms, OrchestrationState};
use crate::store::StateStore;
use crate::{ReindexError, Result};
use async_trait::async_trait;
use log::warn;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

const LOCK_STALE_AFTER_MS: u64 = 10_000;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_MAX_RETRIES: u32 = 500;

/// One JSON file per identity under `dir`.
///
/// Writes go through a temp file + rename. A compare-and-swap holds both an
/// in-process per-key mutex and an exclusive `.lock` file so coordinators in
/// different processes sharing the directory cannot lose each other's updates.
pub struct JsonFileStateStore {
    dir: PathBuf,
    key_locks: TokioMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl JsonFileStateStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            key_locks: TokioMutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn record_path(&self, id: &OrchestrationId) -> PathBuf {
        self.dir.join(format!("{}.json", record_file_stem(id)))
    }

    async fn key_lock(&self, id: &OrchestrationId) -> Arc<TokioMutex<()>> {
        let mut guard = self.key_locks.lock().await;
        guard
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    async fn read_record(path: &Path) -> Result<Option<OrchestrationState>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self, id: &OrchestrationId) -> Result<Option<OrchestrationState>> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn compare_and_swap(&self, record: &OrchestrationState) -> Result<u64> {
        let key_lock = self.key_lock(&record.id).await;
        let _in_process = key_lock.lock().await;

        let path = self.record_path(&record.id);
        let _file_lock = FileLock::acquire(path.with_extension("json.lock")).await?;

        let current = Self::read_record(&path).await?.map_or(0, |r| r.version);
        if current != record.version {
            return Err(ReindexError::VersionConflict {
                id: record.id.to_string(),
            });
        }

        let mut stored = record.clone();
        stored.version = current + 1;
        let bytes = serde_json::to_vec_pretty(&stored)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(stored.version)
    }

    async fn list(&self) -> Result<Vec<OrchestrationState>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(err) => warn!("Skipping unreadable state file {}: {err}", path.display()),
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

/// Readable prefix plus a hash of the full identity, so sanitising never
/// maps two identities onto one file.
fn record_file_stem(id: &OrchestrationId) -> String {
    let readable: String = id
        .as_str()
        .chars()
        .take(64)
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    let digest = Sha256::digest(id.as_str().as_bytes());
    let short: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{readable}-{short}")
}

struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let mut retries = 0;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_abandoned(&path).await && break_abandoned_lock(&path).await {
                        continue;
                    }
                }
                Err(err) => return Err(err.into()),
            }
            retries += 1;
            if retries >= LOCK_MAX_RETRIES {
                return Err(ReindexError::Other(format!(
                    "timed out waiting for state lock {}",
                    path.display()
                )));
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Move an abandoned lock aside under a unique name, then delete it only if
/// the moved file is still the abandoned one. Two processes breaking the same
/// lock can therefore never delete a lock that was taken in between.
async fn break_abandoned_lock(path: &Path) -> bool {
    let aside = path.with_extension(format!("lock.{}", Uuid::new_v4().simple()));
    if tokio::fs::rename(path, &aside).await.is_err() {
        return false;
    }
    if lock_is_abandoned(&aside).await {
        warn!("Removed abandoned state lock {}", path.display());
        let _ = tokio::fs::remove_file(&aside).await;
        return true;
    }
    // A live holder re-created the lock between the check and the rename.
    if let Err(err) = tokio::fs::hard_link(&aside, path).await {
        warn!("Could not restore state lock {}: {err}", path.display());
    }
    let _ = tokio::fs::remove_file(&aside).await;
    false
}

async fn lock_is_abandoned(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    let modified_ms = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    unix_now_ms().saturating_sub(modified_ms) > LOCK_STALE_AFTER_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TargetKind;
    use crate::state::OrchestrationStatus;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = OrchestrationId::resolve(TargetKind::DocumentLibrary, "contracts").unwrap();
        let mut rec = OrchestrationState::begin_run(&id, "nightly refresh", "owner-a", None, 100);
        rec.total_items = 42;

        {
            let store = JsonFileStateStore::open(dir.path()).await.unwrap();
            assert_eq!(store.compare_and_swap(&rec).await.unwrap(), 1);
        }

        let reopened = JsonFileStateStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrchestrationStatus::Running);
        assert_eq!(loaded.total_items, 42);
        assert_eq!(loaded.reason, "nightly refresh");
        assert_eq!(loaded.version, 1);
        assert!(!reopened.record_path(&id).with_extension("json.lock").exists());
    }

    #[tokio::test]
    async fn conflicting_writer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        let id = OrchestrationId::resolve(TargetKind::DocumentProcess, "grants").unwrap();
        let rec = OrchestrationState::begin_run(&id, "r", "owner-a", None, 1);

        store.compare_and_swap(&rec).await.unwrap();
        let err = store.compare_and_swap(&rec).await.unwrap_err();
        assert!(matches!(err, ReindexError::VersionConflict { .. }));
    }

    fn backdate(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() - age).unwrap();
    }

    fn lock_leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".lock"))
            .collect()
    }

    #[tokio::test]
    async fn abandoned_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        let id = OrchestrationId::resolve(TargetKind::DocumentLibrary, "contracts").unwrap();
        let lock = store.record_path(&id).with_extension("json.lock");
        std::fs::write(&lock, b"").unwrap();
        backdate(&lock, Duration::from_secs(60));

        let rec = OrchestrationState::begin_run(&id, "r", "owner-a", None, 1);
        assert_eq!(store.compare_and_swap(&rec).await.unwrap(), 1);
        assert!(lock_leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn lock_retaken_before_the_break_survives() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("library-x.json.lock");
        // Judged abandoned earlier, but a live holder has since re-created it.
        std::fs::write(&lock, b"").unwrap();

        assert!(!break_abandoned_lock(&lock).await);
        assert!(lock.exists());
        assert_eq!(lock_leftovers(dir.path()), vec!["library-x.json.lock".to_string()]);
    }

    #[tokio::test]
    async fn breaking_a_missing_lock_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("library-x.json.lock");
        assert!(!break_abandoned_lock(&lock).await);
        assert!(lock_leftovers(dir.path()).is_empty());
    }

    #[test]
    fn sanitised_names_stay_distinct() {
        let a = OrchestrationId::resolve(TargetKind::DocumentLibrary, "a/b").unwrap();
        let b = OrchestrationId::resolve(TargetKind::DocumentLibrary, "a:b").unwrap();
        assert_ne!(record_file_stem(&a), record_file_stem(&b));
        assert!(record_file_stem(&a).starts_with("library-a_b-"));
    }

    #[tokio::test]
    async fn list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hello")
            .await
            .unwrap();
        let id = OrchestrationId::resolve(TargetKind::ContentReferenceType, "ExternalFile").unwrap();
        store
            .compare_and_swap(&OrchestrationState::begin_run(&id, "r", "o", None, 1))
            .await
            .unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }
}
