//! The index-set contract.
//!
//! An index set is the collection of index files stored for one table, or
//! for one tenant within a table. Discovering, downloading and uploading
//! those files is the job of the implementor; the compactor only lists,
//! fetches and finally hands back a compacted result.

use crate::compacted_index::CompactedIndex;
use crate::error::Result;
use crate::UPLOADER_NAME;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// One index file known to an index set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFile {
    /// File name as stored by the index set.
    pub name: String,
    /// Last modification time of the stored file.
    pub modified_at: SystemTime,
}

impl SourceFile {
    /// Creates a new source file descriptor.
    pub fn new(name: impl Into<String>, modified_at: SystemTime) -> Self {
        Self { name: name.into(), modified_at }
    }

    /// Returns true if this file was produced by a previous compaction.
    pub fn is_compacted(&self) -> bool {
        self.name.starts_with(UPLOADER_NAME)
    }
}

/// A set of index files belonging to one table or one tenant of a table.
pub trait IndexSet: Send + Sync {
    /// Lists the index files currently stored for this set.
    fn list_source_files(&self) -> Vec<SourceFile>;

    /// Fetches a source file into the working directory and returns its
    /// local path. The caller owns the local copy.
    fn get_source_file(&self, file: &SourceFile) -> Result<PathBuf>;

    /// Directory where compaction output for this set is written.
    fn working_dir(&self) -> &Path;

    /// Name of the table this set belongs to.
    fn table_name(&self) -> &str;

    /// Commits the result of compaction.
    ///
    /// `compacted` is `None` when compaction left nothing for this set.
    /// `consumed` lists the source files whose content now lives in
    /// `compacted` and may be deleted. `is_final` is false when the
    /// compacted index is identical to what is already stored, in which
    /// case it need not be uploaded. The implementor always cleans up the
    /// compacted index after this call, whether it uploads it or not.
    fn set_compacted_index(
        &self,
        compacted: Option<Arc<CompactedIndex>>,
        consumed: &[SourceFile],
        is_final: bool,
    ) -> Result<()>;
}

/// Allocates a new, empty index set for a tenant that has no index yet.
pub type MakeEmptyUserIndexSet = Box<dyn Fn(&str) -> Result<Arc<dyn IndexSet>> + Send + Sync>;

/// Returns the position of the first previously compacted file, if any.
pub fn compacted_file_idx(files: &[SourceFile]) -> Option<usize> {
    files.iter().position(SourceFile::is_compacted)
}
