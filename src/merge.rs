//! Merge engine.
//!
//! Ingests every source file of an index set into one compacted output,
//! re-partitioning entries by section on the way: entries of the common
//! section stay in the shared output, entries of any other section belong
//! to the tenant named by the section and are routed to that tenant's own
//! compacted index.
//!
//! ## Process
//!
//! 1. If a previous compaction output is among the source files, open it as
//!    the output (the seed) so its entries are never rewritten.
//! 2. Read the remaining files concurrently, streaming each one in batches.
//! 3. Skip files not yet started once the deadline has passed; they are
//!    picked up by the next run.
//! 4. Keep whatever was consumed if at least one file made it in, unless
//!    a tenant section turned up where none is allowed.

use crate::compacted_index::{fresh_output_path, CompactedIndex};
use crate::config::{CompactorOptions, PeriodConfig};
use crate::error::{Error, Result};
use crate::index_set::{compacted_file_idx, IndexSet, SourceFile};
use crate::pool;
use crate::reader::read_file;
use crate::COMMON_SECTION;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Result of merging one index set.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The merged output.
    pub index: CompactedIndex,
    /// Source files whose entries are fully contained in the output (or in
    /// tenant outputs), sorted by name.
    pub consumed: Vec<SourceFile>,
    /// Error that interrupted the merge after some files were consumed.
    /// The merge was checkpointed; unconsumed files are retried next run.
    pub checkpoint_error: Option<Error>,
}

/// Merges all source files of `index_set`.
///
/// `get_or_create_tenant_index` resolves the output for a tenant section.
/// It is called from worker threads, possibly concurrently for the same
/// tenant, and must hand back the same index each time.
///
/// Fails if an error occurred and no file was consumed, or if a tenant
/// section could not be routed because of an invariant violation.
pub fn compact_indexes<F>(
    index_set: &dyn IndexSet,
    period_config: &PeriodConfig,
    options: &CompactorOptions,
    deadline: Option<Instant>,
    get_or_create_tenant_index: F,
) -> Result<MergeOutcome>
where
    F: Fn(&str) -> Result<Arc<CompactedIndex>> + Sync,
{
    let files = index_set.list_source_files();
    let seed_idx = compacted_file_idx(&files);
    let working_dir = index_set.working_dir();
    let table_name = index_set.table_name();
    let consumed = Mutex::new(Vec::with_capacity(files.len()));

    let output_path = match seed_idx {
        Some(idx) => {
            log::info!("table {}: using {} as seed file", table_name, files[idx].name);
            let path = index_set.get_source_file(&files[idx])?;
            consumed.lock().push(files[idx].clone());
            path
        }
        None => fresh_output_path(working_dir),
    };
    let compacted = match CompactedIndex::open(&output_path, table_name, working_dir, period_config.clone()) {
        Ok(compacted) => compacted,
        Err(e) => {
            let _ = std::fs::remove_file(&output_path);
            return Err(e);
        }
    };

    // Set by any job that hit an invariant violation, whichever error the
    // pool ends up reporting.
    let violation: Mutex<Option<Error>> = Mutex::new(None);

    let ingest = |idx: usize| -> Result<()> {
        // Files not ingested by the deadline stay in storage for the next run.
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(());
        }
        if Some(idx) == seed_idx {
            return Ok(());
        }

        let file = &files[idx];
        let local_path = index_set.get_source_file(file)?;
        let started = Instant::now();

        read_file(&local_path, options.batch_size, |section_name, batch| {
            if section_name == COMMON_SECTION {
                return compacted.write_batch(COMMON_SECTION, batch);
            }
            let tenant_index = get_or_create_tenant_index(section_name)?;
            tenant_index.write_batch(COMMON_SECTION, batch)
        })?;

        log::debug!(
            "table {}: ingested {} in {}ms",
            table_name,
            file.name,
            started.elapsed().as_millis()
        );
        consumed.lock().push(file.clone());
        Ok(())
    };

    let result = pool::for_each_job(files.len(), options.read_concurrency, |idx| match ingest(idx) {
        Err(Error::InvariantViolation(msg)) => {
            let mut slot = violation.lock();
            if slot.is_none() {
                *slot = Some(Error::InvariantViolation(msg.clone()));
            }
            Err(Error::InvariantViolation(msg))
        }
        other => other,
    });

    // Misrouted data is never checkpointed.
    if let Some(e) = violation.into_inner() {
        compacted.cleanup();
        return Err(e);
    }

    let mut consumed = consumed.into_inner();
    consumed.sort_by(|a, b| a.name.cmp(&b.name));

    let checkpoint_error = match result {
        Ok(()) => None,
        Err(e) if consumed.is_empty() => {
            compacted.cleanup();
            return Err(e);
        }
        Err(e) => {
            log::warn!(
                "table {}: unable to fully consume all index files, {} of {} consumed; checkpointing: {}",
                table_name,
                consumed.len(),
                files.len(),
                e
            );
            Some(e)
        }
    };

    log::info!("table {}: merged {} of {} index files", table_name, consumed.len(), files.len());
    Ok(MergeOutcome { index: compacted, consumed, checkpoint_error })
}
