//! Table compactor.
//!
//! Drives one compaction of one table: prefetches every tenant's existing
//! compacted index, merges the table-common index (routing tenant sections
//! into the tenant indexes), reclaims space in long-lived compacted files
//! and finally commits every result back to its index set.
//!
//! ## Index formats
//!
//! A table may hold index in three shapes:
//!
//! - common files with a single common section holding every tenant's index;
//! - common files with one section per tenant (written by ingesters that
//!   build per-tenant index);
//! - per-tenant index sets, each with files holding a single common section.
//!
//! Common files with only a common section compact into a common file.
//! Tenant sections found in common files are moved into per-tenant sets.

use crate::compacted_index::CompactedIndex;
use crate::config::{CompactorOptions, PeriodConfig};
use crate::error::{Error, Result};
use crate::index_set::{IndexSet, MakeEmptyUserIndexSet, SourceFile};
use crate::merge::{compact_indexes, MergeOutcome};
use crate::pool;
use crate::RECREATED_SUFFIX;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// An index set paired with its compacted index.
pub struct CompactedIndexSet {
    index_set: Arc<dyn IndexSet>,
    compacted_index: Arc<CompactedIndex>,
    needs_upload: bool,
}

impl CompactedIndexSet {
    /// Pairs an index set with its compacted index.
    pub fn new(index_set: Arc<dyn IndexSet>, compacted_index: Arc<CompactedIndex>, needs_upload: bool) -> Self {
        Self { index_set, compacted_index, needs_upload }
    }

    /// The index set the compacted index is committed to.
    pub fn index_set(&self) -> &Arc<dyn IndexSet> {
        &self.index_set
    }

    /// The compacted index.
    pub fn compacted_index(&self) -> &Arc<CompactedIndex> {
        &self.compacted_index
    }

    /// True if the compacted index differs from what is stored.
    pub fn needs_upload(&self) -> bool {
        self.needs_upload
    }
}

/// Returns true if a compacted file should be rewritten to reclaim space.
///
/// Only a lone compacted file at least `older_than` old, which has not been
/// recreated before, qualifies. Such a file is unlikely to change soon, and
/// recreating it at most once keeps the cost bounded.
pub fn must_recreate_compacted_db(source_files: &[SourceFile], older_than: Duration) -> bool {
    let [file] = source_files else {
        return false;
    };
    if !file.is_compacted() {
        return false;
    }
    let age = SystemTime::now().duration_since(file.modified_at).unwrap_or(Duration::ZERO);
    if age < older_than {
        return false;
    }
    !file.name.contains(RECREATED_SUFFIX)
}

fn common_index_needs_compaction(files: &[SourceFile], older_than: Duration) -> bool {
    files.len() > 1
        || (files.len() == 1 && !files[0].is_compacted())
        || must_recreate_compacted_db(files, older_than)
}

/// Compacts one table.
pub struct TableCompactor {
    common_index_set: Arc<dyn IndexSet>,
    existing_user_index_sets: HashMap<String, Arc<dyn IndexSet>>,
    make_empty_user_index_set: MakeEmptyUserIndexSet,
    period_config: PeriodConfig,
    options: CompactorOptions,

    /// Tenant id to compacted index set. Filled by prefetch workers and by
    /// merge workers routing tenant sections.
    user_compacted_index_sets: RwLock<HashMap<String, CompactedIndexSet>>,
}

impl TableCompactor {
    /// Creates a compactor for one table.
    ///
    /// Fails if the options or the period config are invalid, or if the
    /// table is not named after the period's index prefix.
    pub fn new(
        common_index_set: Arc<dyn IndexSet>,
        existing_user_index_sets: HashMap<String, Arc<dyn IndexSet>>,
        make_empty_user_index_set: MakeEmptyUserIndexSet,
        period_config: PeriodConfig,
        options: CompactorOptions,
    ) -> Result<Self> {
        options.validate()?;
        period_config.validate()?;
        let table_name = common_index_set.table_name();
        if period_config.table_number(table_name).is_none() {
            return Err(Error::invalid_argument(format!(
                "table {} does not belong to the period starting {} (prefix {:?})",
                table_name, period_config.from, period_config.index_prefix
            )));
        }

        Ok(Self {
            common_index_set,
            existing_user_index_sets,
            make_empty_user_index_set,
            period_config,
            options,
            user_compacted_index_sets: RwLock::new(HashMap::new()),
        })
    }

    /// Compacts the table and commits every result to its index set.
    ///
    /// `desired_duration` bounds the common merge: files not started by then
    /// are left for the next run. `None` or zero means no bound.
    ///
    /// On error nothing beyond a checkpointed merge is committed, and every
    /// tenant index built during the run is cleaned up.
    pub fn compact_table(&self, desired_duration: Option<Duration>) -> Result<()> {
        let result = self.run(desired_duration);
        if result.is_err() {
            self.discard_user_compacted_index_sets();
        }
        result
    }

    fn run(&self, desired_duration: Option<Duration>) -> Result<()> {
        let table_name = self.common_index_set.table_name();
        let common_files = self.common_index_set.list_source_files();

        // Prefetch tenant indexes so merge workers don't serialize on them.
        self.prefetch_user_index_files()?;

        if common_index_needs_compaction(&common_files, self.options.recreate_older_than) {
            let deadline = desired_duration.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
            self.compact_common_index(&common_files, deadline)?;
        } else {
            log::debug!("table {}: common index needs no compaction", table_name);
        }

        self.recreate_untouched_user_indexes()?;
        self.commit_user_compacted_index_sets()
    }

    fn compact_common_index(&self, common_files: &[SourceFile], deadline: Option<Instant>) -> Result<()> {
        let table_name = self.common_index_set.table_name();
        let MergeOutcome { index, consumed, .. } = compact_indexes(
            self.common_index_set.as_ref(),
            &self.period_config,
            &self.options,
            deadline,
            |user_id| self.get_or_create_user_compacted_index(user_id),
        )?;

        let common_index = match index.is_empty() {
            Err(e) => {
                index.cleanup();
                return Err(e);
            }
            Ok(true) => {
                // Everything moved to per-tenant indexes.
                log::info!("table {}: common index is empty after compaction, dropping it", table_name);
                index.cleanup();
                None
            }
            Ok(false) => {
                if must_recreate_compacted_db(common_files, self.options.recreate_older_than) {
                    if let Err(e) = index.recreate_compacted_db(self.options.max_recreate_txn_bytes) {
                        index.cleanup();
                        return Err(e);
                    }
                }
                Some(Arc::new(index))
            }
        };

        self.common_index_set.set_compacted_index(common_index, &consumed, true)
    }

    fn prefetch_user_index_files(&self) -> Result<()> {
        let users: Vec<&String> = self.existing_user_index_sets.keys().collect();

        pool::for_each_job(users.len(), self.options.read_concurrency, |idx| {
            let user_id = users[idx];
            let set = self.fetch_user_compacted_index_set(user_id)?;
            self.user_compacted_index_sets.write().insert(user_id.clone(), set);
            Ok(())
        })
    }

    fn fetch_user_compacted_index_set(&self, user_id: &str) -> Result<CompactedIndexSet> {
        let index_set = self
            .existing_user_index_sets
            .get(user_id)
            .ok_or_else(|| Error::not_found(format!("requested non-existing compacted tenant index {}", user_id)))?;

        let source_files = index_set.list_source_files();
        match source_files.len() {
            0 => Err(Error::invalid_state(format!("attempted to fetch empty index set of tenant {}", user_id))),
            1 => {
                let path = index_set.get_source_file(&source_files[0])?;
                let index = CompactedIndex::open(
                    path,
                    index_set.table_name(),
                    index_set.working_dir(),
                    self.period_config.clone(),
                )?;
                Ok(CompactedIndexSet::new(Arc::clone(index_set), Arc::new(index), false))
            }
            _ => {
                let outcome = compact_indexes(index_set.as_ref(), &self.period_config, &self.options, None, |other| {
                    Err(Error::invariant_violation(format!(
                        "index of tenant {} requested while compacting index of tenant {}",
                        other, user_id
                    )))
                })?;
                Ok(CompactedIndexSet::new(Arc::clone(index_set), Arc::new(outcome.index), true))
            }
        }
    }

    /// Resolves the compacted index a tenant section is routed to, creating
    /// it on first use. Any index handed out here will be uploaded.
    fn get_or_create_user_compacted_index(&self, user_id: &str) -> Result<Arc<CompactedIndex>> {
        {
            let sets = self.user_compacted_index_sets.read();
            if let Some(set) = sets.get(user_id) {
                if set.needs_upload {
                    return Ok(Arc::clone(&set.compacted_index));
                }
            }
        }

        let mut sets = self.user_compacted_index_sets.write();
        if let Some(set) = sets.get_mut(user_id) {
            set.needs_upload = true;
            return Ok(Arc::clone(&set.compacted_index));
        }

        let mut set = match self.existing_user_index_sets.get(user_id) {
            Some(_) => self.fetch_user_compacted_index_set(user_id)?,
            None => {
                let index_set = (self.make_empty_user_index_set)(user_id)?;
                let index = CompactedIndex::create_in(
                    index_set.working_dir(),
                    index_set.table_name(),
                    self.period_config.clone(),
                )?;
                log::debug!("table {}: created index for new tenant {}", index_set.table_name(), user_id);
                CompactedIndexSet::new(index_set, Arc::new(index), true)
            }
        };
        set.needs_upload = true;

        let index = Arc::clone(&set.compacted_index);
        sets.insert(user_id.to_string(), set);
        Ok(index)
    }

    /// Recreates tenant indexes the common merge did not write into.
    fn recreate_untouched_user_indexes(&self) -> Result<()> {
        let mut sets = self.user_compacted_index_sets.write();
        for (user_id, set) in sets.iter_mut() {
            if set.needs_upload {
                continue;
            }
            let source_files = set.index_set.list_source_files();
            if must_recreate_compacted_db(&source_files, self.options.recreate_older_than) {
                log::info!("table {}: recreating index of tenant {}", set.index_set.table_name(), user_id);
                set.compacted_index.recreate_compacted_db(self.options.max_recreate_txn_bytes)?;
                set.needs_upload = true;
            }
        }
        Ok(())
    }

    /// Hands every tenant index to its index set. Index sets clean up even
    /// the ones they don't upload, so every one is committed.
    fn commit_user_compacted_index_sets(&self) -> Result<()> {
        let sets = std::mem::take(&mut *self.user_compacted_index_sets.write());
        let mut sets: Vec<(String, CompactedIndexSet)> = sets.into_iter().collect();
        sets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut remaining = sets.into_iter();
        while let Some((user_id, set)) = remaining.next() {
            if let Err(e) = set.index_set.set_compacted_index(Some(set.compacted_index), &[], set.needs_upload) {
                log::error!("failed to commit index of tenant {}: {}", user_id, e);
                for (_, rest) in remaining {
                    rest.compacted_index.cleanup();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn discard_user_compacted_index_sets(&self) {
        let sets = std::mem::take(&mut *self.user_compacted_index_sets.write());
        for set in sets.into_values() {
            set.compacted_index.cleanup();
        }
    }
}
