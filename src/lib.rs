//! # index-compactor - Table Compaction for Sharded Index Files
//!
//! Index entries of a log store accumulate as many small embedded key-value
//! database files, one per ingestion batch. This crate compacts the files of
//! one table into as few files as possible, splitting shared index into
//! per-tenant index on the way, and reports which inputs were consumed so
//! they can be deleted upstream.
//!
//! ## Architecture
//!
//! - **IndexSet**: the files stored for one table or one tenant of a table
//! - **Reader**: streams a source file in bounded batches, section by section
//! - **CompactedIndex**: the output database entries accumulate into
//! - **Merge**: concurrent ingestion of all source files into the outputs
//! - **TableCompactor**: decides what needs work and commits the results
//!
//! Files are [`redb`] databases. Each table inside a file is a *section*: the
//! [`COMMON_SECTION`] holds table-common entries, any other section is named
//! after the tenant whose entries it holds.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use index_compactor::{CompactorOptions, IndexSet, MakeEmptyUserIndexSet, PeriodConfig, TableCompactor};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn run(common: Arc<dyn IndexSet>, make_user_set: MakeEmptyUserIndexSet) -> index_compactor::Result<()> {
//! let compactor = TableCompactor::new(
//!     common,
//!     HashMap::new(),
//!     make_user_set,
//!     PeriodConfig::new("2024-01-01", "index_"),
//!     CompactorOptions::default(),
//! )?;
//! compactor.compact_table(Some(Duration::from_secs(600)))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod compacted_index;
pub mod config;
pub mod error;
pub mod index_set;
pub mod merge;
pub mod pool;
pub mod reader;
pub mod table_compactor;

// Re-exports
pub use compacted_index::CompactedIndex;
pub use config::{CompactorOptions, PeriodConfig};
pub use error::{Error, Result};
pub use index_set::{IndexSet, MakeEmptyUserIndexSet, SourceFile};
pub use merge::{compact_indexes, MergeOutcome};
pub use reader::{read_file, Entry};
pub use table_compactor::{must_recreate_compacted_db, CompactedIndexSet, TableCompactor};

/// Name prefix of files produced by compaction.
pub const UPLOADER_NAME: &str = "compactor";

/// Suffix marking a compacted file that has been recreated.
pub const RECREATED_SUFFIX: &str = ".r";

/// Section holding table-common entries. Every other section name is a
/// tenant id.
pub const COMMON_SECTION: &str = "__common__";
