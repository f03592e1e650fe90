//! Staging, archive and tender persistence + HTTP fetch utilities.

use std::fs::TryLockError;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use resao_core::{BatchStatus, RawCandidate, StagingBatch};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub mod fetch;
pub mod postgres;
pub mod repository;

pub use fetch::{FeedFetchConfig, FeedFetcher, FetchError, FetchedFeed, RetryPolicy};
pub use postgres::PgTenderRepository;
pub use repository::{
    JsonFileTenderRepository, MemoryTenderRepository, StoreError, TenderRepository, TenderSession,
    TenderTable, TenderWrite,
};

pub const CRATE_NAME: &str = "resao-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` through a temp file in the same directory and a rename.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Exclusive advisory lock on a file, held until dropped.
///
/// Every open of the lock file conflicts with every other, in this process or another.
#[derive(Debug)]
pub struct FileLock {
    _file: std::fs::File,
}

impl FileLock {
    /// Waits until the lock is free.
    pub async fn acquire(path: &Path) -> anyhow::Result<Self> {
        let file = open_lock_file(path).await?;
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || {
            file.lock()?;
            Ok::<_, std::io::Error>(Self { _file: file })
        })
        .await
        .context("lock task failed")?
        .with_context(|| format!("locking {display}"))
    }

    /// `None` while someone else holds the lock.
    pub async fn try_acquire(path: &Path) -> anyhow::Result<Option<Self>> {
        let file = open_lock_file(path).await?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(err)) => {
                Err(err).with_context(|| format!("locking {}", path.display()))
            }
        }
    }
}

async fn open_lock_file(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening lock file {}", path.display()))?;
    Ok(file.into_std().await)
}

/// Durable holding area for the output of the current scrape run.
///
/// At most one batch lives in `batch.json`; settled batches (imported or expired)
/// are moved to `archive/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join("batch.json")
    }

    fn archive_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join("archive").join(format!("{run_id}.json"))
    }

    /// Claims the staging directory for one gate. Scrapes, imports, and restart recovery
    /// run under the lease; `None` means another process holds it.
    pub async fn try_lease(&self) -> anyhow::Result<Option<FileLock>> {
        FileLock::try_acquire(&self.dir.join(".lease")).await
    }

    pub async fn current(&self) -> anyhow::Result<Option<StagingBatch>> {
        let path = self.current_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let batch = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(batch))
    }

    async fn write_current(&self, batch: &StagingBatch) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(batch).context("serializing staging batch")?;
        write_atomically(&self.current_path(), &bytes).await
    }

    /// Opens a `collecting` batch, expiring whatever unsettled batch was there.
    pub async fn begin(&self, run_id: Uuid) -> anyhow::Result<StagingBatch> {
        if let Some(previous) = self.current().await? {
            info!(previous_run = %previous.run_id, "expiring superseded staging batch");
            self.settle(previous, BatchStatus::Expired).await?;
        }
        let batch = StagingBatch::collecting(run_id, Utc::now());
        self.write_current(&batch).await?;
        Ok(batch)
    }

    /// Stores the scraped records and flips the batch to `ready`.
    pub async fn complete(
        &self,
        run_id: Uuid,
        records: Vec<RawCandidate>,
    ) -> anyhow::Result<StagingBatch> {
        let Some(mut batch) = self.current().await? else {
            bail!("no collecting batch for run {run_id}");
        };
        if batch.run_id != run_id || batch.status != BatchStatus::Collecting {
            bail!(
                "run {run_id} cannot complete staging batch {} in state {:?}",
                batch.run_id,
                batch.status
            );
        }
        batch.records = records;
        batch.status = BatchStatus::Ready;
        batch.finished_at = Some(Utc::now());
        self.write_current(&batch).await?;
        Ok(batch)
    }

    /// Drops the collecting batch of a failed or cancelled run without staging anything.
    pub async fn discard(&self, run_id: Uuid) -> anyhow::Result<()> {
        match self.current().await? {
            Some(batch) if batch.run_id == run_id => {
                let path = self.current_path();
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("removing {}", path.display()))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Marks the current batch `imported` and clears the staging slot.
    pub async fn mark_imported(&self, run_id: Uuid) -> anyhow::Result<()> {
        match self.current().await? {
            Some(batch) if batch.run_id == run_id => {
                self.settle(batch, BatchStatus::Imported).await
            }
            _ => bail!("run {run_id} is not the staged batch"),
        }
    }

    /// Expires a batch left behind in `collecting` by an interrupted process.
    pub async fn expire_interrupted(&self) -> anyhow::Result<Option<Uuid>> {
        match self.current().await? {
            Some(batch) if batch.status == BatchStatus::Collecting => {
                let run_id = batch.run_id;
                self.settle(batch, BatchStatus::Expired).await?;
                Ok(Some(run_id))
            }
            _ => Ok(None),
        }
    }

    pub async fn archived(&self, run_id: Uuid) -> anyhow::Result<Option<StagingBatch>> {
        let path = self.archive_path(run_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn settle(&self, mut batch: StagingBatch, status: BatchStatus) -> anyhow::Result<()> {
        batch.status = status;
        let bytes = serde_json::to_vec_pretty(&batch).context("serializing settled batch")?;
        write_atomically(&self.archive_path(batch.run_id), &bytes).await?;
        let current = self.current_path();
        fs::remove_file(&current)
            .await
            .with_context(|| format!("removing {}", current.display()))?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid archive path `{0}`")]
    InvalidPath(String),
    #[error("archive entry not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Opaque blob store holding extracted DAO/PV archives as directories.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a caller-supplied path (optionally web-style `/storage/...`) under the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ArchiveError> {
        let trimmed = path.trim();
        let relative = trimmed
            .strip_prefix("/storage/")
            .unwrap_or_else(|| trimmed.trim_start_matches('/'));
        if relative.is_empty() {
            return Err(ArchiveError::InvalidPath(path.to_string()));
        }
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(ArchiveError::InvalidPath(path.to_string())),
            }
        }
        Ok(resolved)
    }

    /// Member files of an archive, relative to it, sorted.
    pub async fn list(&self, archive: &str) -> Result<Vec<String>, ArchiveError> {
        let base = self.resolve(archive)?;
        if !fs::try_exists(&base).await? || !fs::metadata(&base).await?.is_dir() {
            return Err(ArchiveError::NotFound(archive.to_string()));
        }

        let mut members = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let name = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    members.push(name);
                }
            }
        }
        members.sort();
        Ok(members)
    }

    pub async fn read(&self, archive: &str, member: &str) -> Result<Vec<u8>, ArchiveError> {
        let base = self.resolve(archive)?;
        let mut path = base;
        for component in Path::new(member).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(ArchiveError::InvalidPath(member.to_string())),
            }
        }
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::NotFound(format!("{archive}/{member}")))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw(reference: &str) -> RawCandidate {
        RawCandidate {
            reference: Some(reference.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("table.json");
        write_atomically(&path, b"first").await.expect("first write");
        write_atomically(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn staging_lifecycle_collecting_ready_imported() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let batch = store.begin(run_id).await.expect("begin");
        assert_eq!(batch.status, BatchStatus::Collecting);

        let ready = store
            .complete(run_id, vec![raw("AO-1"), raw("AO-2")])
            .await
            .expect("complete");
        assert_eq!(ready.status, BatchStatus::Ready);
        assert!(ready.finished_at.is_some());
        assert_eq!(store.current().await.unwrap().unwrap().records.len(), 2);

        store.mark_imported(run_id).await.expect("imported");
        assert!(store.current().await.unwrap().is_none());
        let archived = store.archived(run_id).await.unwrap().expect("archived");
        assert_eq!(archived.status, BatchStatus::Imported);
    }

    #[tokio::test]
    async fn newer_run_expires_unimported_batch() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let first = Uuid::new_v4();
        store.begin(first).await.unwrap();
        store.complete(first, vec![raw("AO-1")]).await.unwrap();

        let second = Uuid::new_v4();
        store.begin(second).await.unwrap();

        let expired = store.archived(first).await.unwrap().expect("archived");
        assert_eq!(expired.status, BatchStatus::Expired);
        assert_eq!(store.current().await.unwrap().unwrap().run_id, second);
    }

    #[tokio::test]
    async fn discard_leaves_nothing_staged() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::new(dir.path());
        let run_id = Uuid::new_v4();
        store.begin(run_id).await.unwrap();
        store.discard(run_id).await.unwrap();
        assert!(store.current().await.unwrap().is_none());
        assert!(store.complete(run_id, vec![raw("AO-1")]).await.is_err());
    }

    #[tokio::test]
    async fn archive_lists_members_and_rejects_escapes() {
        let dir = tempdir().expect("tempdir");
        let archive_dir = dir.path().join("global-marches").join("resultat_offre_0");
        std::fs::create_dir_all(archive_dir.join("pieces")).unwrap();
        std::fs::write(archive_dir.join("cps.pdf"), b"cps").unwrap();
        std::fs::write(archive_dir.join("pieces").join("rc.pdf"), b"rc").unwrap();

        let store = ArchiveStore::new(dir.path());
        let members = store
            .list("/storage/global-marches/resultat_offre_0")
            .await
            .expect("list");
        assert_eq!(members, vec!["cps.pdf".to_string(), "pieces/rc.pdf".to_string()]);

        let bytes = store
            .read("global-marches/resultat_offre_0", "pieces/rc.pdf")
            .await
            .expect("read");
        assert_eq!(bytes, b"rc");

        assert!(matches!(
            store.list("../etc").await,
            Err(ArchiveError::InvalidPath(_))
        ));
        assert!(matches!(
            store.read("global-marches/resultat_offre_0", "../../secret").await,
            Err(ArchiveError::InvalidPath(_))
        ));
        assert!(matches!(
            store.list("global-marches/missing").await,
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn staging_lease_is_exclusive_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let server = StagingStore::new(dir.path());
        let cli = StagingStore::new(dir.path());

        let lease = server.try_lease().await.expect("lease").expect("free");
        assert!(cli.try_lease().await.expect("second try").is_none());
        drop(lease);
        assert!(cli.try_lease().await.expect("after drop").is_some());
    }

    #[tokio::test]
    async fn file_lock_waiter_proceeds_after_release() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("writer.lock");
        let held = FileLock::acquire(&path).await.expect("first");

        let waiter = tokio::spawn({
            let path = path.clone();
            async move { FileLock::acquire(&path).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.expect("join").expect("second");
    }
}
