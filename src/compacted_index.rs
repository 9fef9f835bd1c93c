//! Compacted index accumulator.
//!
//! A [`CompactedIndex`] owns one open output database. Batches of entries
//! are appended to it section by section; every write goes through a single
//! lock so concurrent ingestion workers never interleave transactions on the
//! same file.
//!
//! Output is written without fsync. The file is a working copy that the
//! owning index set uploads and deletes, so a crash simply means the next
//! compaction run redoes the work.

use crate::config::PeriodConfig;
use crate::error::{Error, Result};
use crate::reader::Entry;
use crate::RECREATED_SUFFIX;
use parking_lot::Mutex;
use redb::{Database, Durability, ReadableTable, TableDefinition, TableHandle};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Definition of one section: raw key bytes to raw value bytes.
pub(crate) type SectionDef<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

pub(crate) fn section(name: &str) -> SectionDef<'_> {
    TableDefinition::new(name)
}

/// Opens the database at `path` for writing, creating it if missing.
pub(crate) fn open_output_db(path: &Path) -> Result<Database> {
    Ok(Database::create(path)?)
}

/// Returns a fresh, timestamp-named output path inside `working_dir`.
pub(crate) fn fresh_output_path(working_dir: &Path) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    working_dir.join(nanos.to_string())
}

/// Upserts `entries` into `section_name` in one non-durable transaction.
pub(crate) fn write_entries(db: &Database, section_name: &str, entries: &[Entry]) -> Result<()> {
    let mut txn = db.begin_write()?;
    txn.set_durability(Durability::Eventual);
    {
        let mut table = txn.open_table(section(section_name))?;
        for entry in entries {
            table.insert(entry.key.as_slice(), entry.value.as_slice())?;
        }
    }
    txn.commit()?;
    Ok(())
}

struct Inner {
    db: Option<Database>,
    path: PathBuf,
    recreated: bool,
}

/// The output of one compaction run for one index set.
pub struct CompactedIndex {
    inner: Mutex<Inner>,
    table_name: String,
    working_dir: PathBuf,
    period_config: PeriodConfig,
}

impl std::fmt::Debug for CompactedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CompactedIndex")
            .field("table_name", &self.table_name)
            .field("path", &inner.path)
            .field("open", &inner.db.is_some())
            .field("recreated", &inner.recreated)
            .finish()
    }
}

impl CompactedIndex {
    /// Wraps an already open output database.
    pub fn new(
        db: Database,
        path: PathBuf,
        table_name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        period_config: PeriodConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner { db: Some(db), path, recreated: false }),
            table_name: table_name.into(),
            working_dir: working_dir.into(),
            period_config,
        }
    }

    /// Opens (or creates) the output database at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        table_name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        period_config: PeriodConfig,
    ) -> Result<Self> {
        let path = path.into();
        let db = open_output_db(&path)?;
        Ok(Self::new(db, path, table_name, working_dir, period_config))
    }

    /// Creates an empty output database in `working_dir`.
    pub fn create_in(
        working_dir: impl Into<PathBuf>,
        table_name: impl Into<String>,
        period_config: PeriodConfig,
    ) -> Result<Self> {
        let working_dir = working_dir.into();
        let path = fresh_output_path(&working_dir);
        Self::open(path, table_name, working_dir, period_config)
    }

    /// Name of the table this index belongs to.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Directory the output file lives in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Schema period of the table.
    pub fn period_config(&self) -> &PeriodConfig {
        &self.period_config
    }

    /// Current path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Returns true once the backing file has been recreated.
    pub fn is_recreated(&self) -> bool {
        self.inner.lock().recreated
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        match inner.db.as_ref() {
            Some(db) => f(db),
            None => Err(Error::invalid_state(format!(
                "compacted index {:?} of table {} is closed",
                inner.path, self.table_name
            ))),
        }
    }

    /// Appends a batch of entries to a section.
    pub fn write_batch(&self, section_name: &str, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_db(|db| write_entries(db, section_name, entries))
    }

    /// Returns true if no section of the output holds any entry.
    pub fn is_empty(&self) -> Result<bool> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            for handle in txn.list_tables()? {
                let table = txn.open_table(section(handle.name()))?;
                if table.iter()?.next().is_some() {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    /// Names of all sections in the output.
    pub fn sections(&self) -> Result<Vec<String>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let names: Vec<String> = txn.list_tables()?.map(|h| h.name().to_string()).collect();
            Ok(names)
        })
    }

    /// Visits every entry of every section, in section then key order.
    pub fn for_each_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8], &[u8]) -> Result<()>,
    {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            for handle in txn.list_tables()? {
                let name = handle.name().to_string();
                let table = txn.open_table(section(&name))?;
                for item in table.iter()? {
                    let (k, v) = item?;
                    f(&name, k.value(), v.value())?;
                }
            }
            Ok(())
        })
    }

    /// Rewrites the output into a fresh file to reclaim free pages.
    ///
    /// Entries are copied in transactions of at most `max_txn_bytes`. The
    /// new file name carries [`RECREATED_SUFFIX`] so it is never picked for
    /// recreation again.
    pub fn recreate_compacted_db(&self, max_txn_bytes: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let old_path = inner.path.clone();
        let Some(old_db) = inner.db.as_ref() else {
            return Err(Error::invalid_state(format!("cannot recreate closed index {:?}", old_path)));
        };

        let mut new_name = fresh_output_path(&self.working_dir).into_os_string();
        new_name.push(RECREATED_SUFFIX);
        let new_path = PathBuf::from(new_name);

        log::info!(
            "table {}: recreating compacted db {:?} into {:?}",
            self.table_name,
            old_path,
            new_path
        );

        let guard = RemoveOnDrop::new(new_path.clone());
        let new_db = open_output_db(&new_path)?;
        let copied = copy_entries(old_db, &new_db, max_txn_bytes.max(1))?;
        guard.disarm();

        // Swap in the new handle before dropping the old one.
        let old_db = inner.db.replace(new_db);
        drop(old_db);
        inner.path = new_path;
        inner.recreated = true;

        let old_size = std::fs::metadata(&old_path).map(|m| m.len()).unwrap_or(0);
        if let Err(e) = std::fs::remove_file(&old_path) {
            log::error!("failed to remove replaced compacted db {:?}: {}", old_path, e);
        }
        let new_size = std::fs::metadata(&inner.path).map(|m| m.len()).unwrap_or(0);
        log::info!(
            "table {}: recreated compacted db with {} entries, {} -> {} bytes",
            self.table_name,
            copied,
            old_size,
            new_size
        );
        Ok(())
    }

    /// Closes the handle and returns the backing file for upload.
    ///
    /// The index rejects further reads and writes afterwards.
    pub fn close_for_upload(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        match inner.db.take() {
            Some(db) => {
                drop(db);
                Ok(inner.path.clone())
            }
            None => Err(Error::invalid_state(format!("compacted index {:?} already closed", inner.path))),
        }
    }

    /// Closes the handle and removes the backing file.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        drop(inner.db.take());
        if let Err(e) = std::fs::remove_file(&inner.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::error!("failed to remove compacted db {:?}: {}", inner.path, e);
            }
        }
    }
}

/// Copies every section of `src` into `dst`, committing whenever the
/// pending chunk reaches `max_txn_bytes`. Returns the number of entries.
fn copy_entries(src: &Database, dst: &Database, max_txn_bytes: usize) -> Result<u64> {
    let txn = src.begin_read()?;
    let mut copied = 0u64;
    for handle in txn.list_tables()? {
        let name = handle.name().to_string();
        let table = txn.open_table(section(&name))?;

        let mut chunk = Vec::new();
        let mut chunk_bytes = 0usize;
        for item in table.iter()? {
            let (k, v) = item?;
            let entry = Entry::new(k.value(), v.value());
            chunk_bytes += entry.size();
            chunk.push(entry);
            copied += 1;

            if chunk_bytes >= max_txn_bytes {
                write_entries(dst, &name, &chunk)?;
                chunk.clear();
                chunk_bytes = 0;
            }
        }
        // Also creates sections that had no entries.
        write_entries(dst, &name, &chunk)?;
    }
    Ok(copied)
}

/// Removes a half-written file unless disarmed.
struct RemoveOnDrop {
    path: Option<PathBuf>,
}

impl RemoveOnDrop {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::error!("failed to remove {:?}: {}", path, e);
                }
            }
        }
    }
}
