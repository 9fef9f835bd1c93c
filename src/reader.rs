//! Batch file reader.
//!
//! Streams every section of a source index database in bounded batches so
//! a whole section is never held in memory at once.

use crate::compacted_index::section;
use crate::error::Result;
use redb::{Database, ReadableTable, TableHandle};
use std::path::Path;
use std::time::Instant;

/// One key/value pair copied out of a read transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Raw key bytes.
    pub key: Vec<u8>,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

impl Entry {
    /// Copies a key/value pair.
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self { key: key.to_vec(), value: value.to_vec() }
    }

    /// Approximate size in bytes.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Reads the index database at `path` and hands its entries to
/// `write_batch` in batches of at most `batch_size`, one section at a time.
///
/// `write_batch` is called for every full batch and once more for the
/// trailing remainder of each section, which may be empty.
///
/// The file is closed and removed once reading finishes, whatever the
/// outcome. Failures to remove it are logged, not returned.
pub fn read_file<F>(path: &Path, batch_size: usize, mut write_batch: F) -> Result<()>
where
    F: FnMut(&str, &[Entry]) -> Result<()>,
{
    let start = Instant::now();
    log::debug!("reading file for compaction: {:?}", path);

    // The handle is dropped at the end of the match, before removal.
    let result = match Database::open(path) {
        Ok(db) => stream_sections(&db, batch_size.max(1), &mut write_batch),
        Err(e) => Err(e.into()),
    };

    if let Err(e) = std::fs::remove_file(path) {
        log::error!("failed to remove file {:?}: {}", path, e);
    }

    log::debug!("finished reading {:?} in {}ms", path, start.elapsed().as_millis());
    result
}

fn stream_sections<F>(db: &Database, batch_size: usize, write_batch: &mut F) -> Result<()>
where
    F: FnMut(&str, &[Entry]) -> Result<()>,
{
    let txn = db.begin_read()?;
    let mut batch = Vec::with_capacity(batch_size);

    for handle in txn.list_tables()? {
        let name = handle.name().to_string();
        let table = txn.open_table(section(&name))?;
        batch.clear();

        for item in table.iter()? {
            let (k, v) = item?;
            // Guards only live as long as the transaction.
            batch.push(Entry::new(k.value(), v.value()));

            if batch.len() == batch_size {
                write_batch(&name, &batch)?;
                batch.clear();
            }
        }

        write_batch(&name, &batch)?;
    }

    Ok(())
}
