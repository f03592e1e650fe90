//! System-of-record contract for stored tenders and its file/in-memory backends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use resao_core::StoredRecord;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::{write_atomically, FileLock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tender {0} not found")]
    NotFound(Uuid),
    #[error("tender {0} already exists")]
    Duplicate(Uuid),
    #[error("injected write failure at write #{0}")]
    Injected(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Other(String),
}

/// One write of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenderWrite {
    Insert(StoredRecord),
    /// Replaces the stored record with the same id.
    Update(StoredRecord),
}

impl TenderWrite {
    pub fn record(&self) -> &StoredRecord {
        match self {
            TenderWrite::Insert(r) | TenderWrite::Update(r) => r,
        }
    }
}

#[async_trait]
pub trait TenderRepository: Send + Sync {
    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError>;

    /// Opens an exclusive read-then-write session.
    ///
    /// Other sessions on the same store, from this process or another one, wait until
    /// it is committed or dropped. Dropping a session discards it.
    async fn begin<'a>(&'a self) -> Result<Box<dyn TenderSession + 'a>, StoreError>;

    /// Applies every write or none of them.
    async fn commit(&self, writes: Vec<TenderWrite>) -> Result<(), StoreError> {
        self.begin().await?.commit(writes).await
    }
}

/// Reads and writes made under a repository's writer lock.
#[async_trait]
pub trait TenderSession: Send {
    async fn load_all(&mut self) -> Result<Vec<StoredRecord>, StoreError>;

    async fn get(&mut self, id: Uuid) -> Result<Option<StoredRecord>, StoreError>;

    /// Applies every write or none of them, then releases the lock.
    async fn commit(self: Box<Self>, writes: Vec<TenderWrite>) -> Result<(), StoreError>;
}

/// In-process table keyed by tender id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenderTable {
    rows: BTreeMap<Uuid, StoredRecord>,
}

impl TenderTable {
    pub fn from_records(records: impl IntoIterator<Item = StoredRecord>) -> Self {
        Self {
            rows: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.rows.values().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&StoredRecord> {
        self.rows.get(&id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn apply(&mut self, write: TenderWrite) -> Result<(), StoreError> {
        match write {
            TenderWrite::Insert(record) => {
                if self.rows.contains_key(&record.id) {
                    return Err(StoreError::Duplicate(record.id));
                }
                self.rows.insert(record.id, record);
            }
            TenderWrite::Update(record) => match self.rows.get_mut(&record.id) {
                Some(slot) => *slot = record,
                None => return Err(StoreError::NotFound(record.id)),
            },
        }
        Ok(())
    }

    /// Applies all writes to a copy and returns it; `self` is untouched on error.
    fn applied(
        &self,
        writes: Vec<TenderWrite>,
        fail_at: Option<usize>,
    ) -> Result<Self, StoreError> {
        let mut next = self.clone();
        for (idx, write) in writes.into_iter().enumerate() {
            let write_no = idx + 1;
            if fail_at == Some(write_no) {
                return Err(StoreError::Injected(write_no));
            }
            next.apply(write)?;
        }
        Ok(next)
    }
}

/// Volatile repository with optional fault injection for tests.
#[derive(Debug, Default)]
pub struct MemoryTenderRepository {
    table: Mutex<TenderTable>,
    fail_on_write: AtomicUsize,
}

impl MemoryTenderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = StoredRecord>) -> Self {
        Self {
            table: Mutex::new(TenderTable::from_records(records)),
            fail_on_write: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequent commit fail on its `n`-th write (1-based); 0 disables.
    pub fn fail_on_write(&self, n: usize) {
        self.fail_on_write.store(n, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> TenderTable {
        self.table.lock().await.clone()
    }
}

#[async_trait]
impl TenderRepository for MemoryTenderRepository {
    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.table.lock().await.records())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.table.lock().await.get(id).cloned())
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn TenderSession + 'a>, StoreError> {
        let fail_at = match self.fail_on_write.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        };
        Ok(Box::new(MemorySession {
            table: self.table.lock().await,
            fail_at,
        }))
    }
}

struct MemorySession<'a> {
    table: MutexGuard<'a, TenderTable>,
    fail_at: Option<usize>,
}

#[async_trait]
impl<'a> TenderSession for MemorySession<'a> {
    async fn load_all(&mut self) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.table.records())
    }

    async fn get(&mut self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.table.get(id).cloned())
    }

    async fn commit(mut self: Box<Self>, writes: Vec<TenderWrite>) -> Result<(), StoreError> {
        let next = self.table.applied(writes, self.fail_at)?;
        *self.table = next;
        Ok(())
    }
}

/// Whole-table JSON snapshot replaced atomically on every commit.
///
/// Writers hold `<path>.lock` for the whole session, so several processes may share
/// one file. Readers never lock: they always see a complete snapshot.
#[derive(Debug)]
pub struct JsonFileTenderRepository {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonFileTenderRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn read_table(&self) -> Result<TenderTable, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(TenderTable::default());
        }
        let text = fs::read_to_string(&self.path).await?;
        let records: Vec<StoredRecord> = serde_json::from_str(&text)?;
        Ok(TenderTable::from_records(records))
    }
}

#[async_trait]
impl TenderRepository for JsonFileTenderRepository {
    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.read_table().await?.records())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.read_table().await?.get(id).cloned())
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn TenderSession + 'a>, StoreError> {
        let guard = self.writer.lock().await;
        let file_lock = FileLock::acquire(&self.lock_path())
            .await
            .map_err(|err| StoreError::Other(format!("{err:#}")))?;
        let table = self.read_table().await?;
        Ok(Box::new(JsonFileSession {
            path: &self.path,
            table,
            _file_lock: file_lock,
            _guard: guard,
        }))
    }
}

struct JsonFileSession<'a> {
    path: &'a Path,
    table: TenderTable,
    _file_lock: FileLock,
    _guard: MutexGuard<'a, ()>,
}

#[async_trait]
impl<'a> TenderSession for JsonFileSession<'a> {
    async fn load_all(&mut self) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.table.records())
    }

    async fn get(&mut self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.table.get(id).cloned())
    }

    async fn commit(self: Box<Self>, writes: Vec<TenderWrite>) -> Result<(), StoreError> {
        let next = self.table.applied(writes, None)?;
        let bytes = serde_json::to_vec_pretty(&next.records())?;
        write_atomically(self.path, &bytes)
            .await
            .map_err(|err| StoreError::Other(format!("{err:#}")))
    }
}
