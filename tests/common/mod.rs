// Shared test harness: a directory-backed index set that records commits.

#![allow(dead_code)]

use index_compactor::{
    CompactedIndex, CompactorOptions, Error, IndexSet, MakeEmptyUserIndexSet, PeriodConfig, Result, SourceFile,
    TableCompactor, RECREATED_SUFFIX, UPLOADER_NAME,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub const TABLE: &str = "index_19000";
pub const HOUR: Duration = Duration::from_secs(3600);

/// Builds an owned key/value list.
pub fn kv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// What an index set was handed on commit.
#[derive(Debug, Clone)]
pub struct Commit {
    pub uploaded: Option<String>,
    pub consumed: Vec<String>,
    pub is_final: bool,
}

/// Index set whose "object store" is a local directory.
pub struct LocalIndexSet {
    table_name: String,
    storage_dir: PathBuf,
    working_dir: PathBuf,
    files: Mutex<Vec<SourceFile>>,
    fetched: Mutex<Vec<String>>,
    broken: Mutex<HashSet<String>>,
    commits: Mutex<Vec<Commit>>,
    upload_seq: AtomicU64,
}

impl LocalIndexSet {
    pub fn new(root: &Path) -> Arc<Self> {
        let storage_dir = root.join("storage");
        let working_dir = root.join("work");
        fs::create_dir_all(&storage_dir).unwrap();
        fs::create_dir_all(&working_dir).unwrap();
        Arc::new(Self {
            table_name: TABLE.to_string(),
            storage_dir,
            working_dir,
            files: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
            broken: Mutex::new(HashSet::new()),
            commits: Mutex::new(Vec::new()),
            upload_seq: AtomicU64::new(1),
        })
    }

    /// Stores a source file with the given sections, `age` old.
    pub fn add_file(&self, name: &str, sections: &[(&str, Vec<(String, String)>)], age: Duration) {
        let path = self.storage_dir.join(name);
        let index = CompactedIndex::open(&path, TABLE, &self.storage_dir, PeriodConfig::default()).unwrap();
        for (section, pairs) in sections {
            let entries: Vec<index_compactor::Entry> = pairs
                .iter()
                .map(|(k, v)| index_compactor::Entry::new(k.as_bytes(), v.as_bytes()))
                .collect();
            index.write_batch(section, &entries).unwrap();
        }
        index.close_for_upload().unwrap();
        self.files.lock().push(SourceFile::new(name, SystemTime::now() - age));
    }

    /// Makes downloads of `name` fail.
    pub fn break_file(&self, name: &str) {
        self.broken.lock().insert(name.to_string());
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().iter().map(|f| f.name.clone()).collect();
        names.sort();
        names
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.commits.lock().clone()
    }

    pub fn working_dir_is_empty(&self) -> bool {
        fs::read_dir(&self.working_dir).unwrap().next().is_none()
    }

    /// Every stored entry as (section, key) -> value.
    pub fn entries(&self) -> BTreeMap<(String, String), String> {
        let mut out = BTreeMap::new();
        for name in self.file_names() {
            let index = CompactedIndex::open(
                self.storage_dir.join(&name),
                TABLE,
                &self.storage_dir,
                PeriodConfig::default(),
            )
            .unwrap();
            index
                .for_each_entry(|section, k, v| {
                    out.insert(
                        (section.to_string(), String::from_utf8(k.to_vec()).unwrap()),
                        String::from_utf8(v.to_vec()).unwrap(),
                    );
                    Ok(())
                })
                .unwrap();
        }
        out
    }

    fn remove_stored(&self, name: &str) {
        let _ = fs::remove_file(self.storage_dir.join(name));
        self.files.lock().retain(|f| f.name != name);
    }
}

impl IndexSet for LocalIndexSet {
    fn list_source_files(&self) -> Vec<SourceFile> {
        self.files.lock().clone()
    }

    fn get_source_file(&self, file: &SourceFile) -> Result<PathBuf> {
        if self.broken.lock().contains(&file.name) {
            return Err(Error::not_found(format!("download of {} failed", file.name)));
        }
        let dst = self.working_dir.join(&file.name);
        fs::copy(self.storage_dir.join(&file.name), &dst)?;
        self.fetched.lock().push(file.name.clone());
        Ok(dst)
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn set_compacted_index(
        &self,
        compacted: Option<Arc<CompactedIndex>>,
        consumed: &[SourceFile],
        is_final: bool,
    ) -> Result<()> {
        let uploaded = match compacted {
            Some(index) if is_final => {
                let local = index.close_for_upload()?;
                let suffix = if index.is_recreated() { RECREATED_SUFFIX } else { "" };
                let seq = self.upload_seq.fetch_add(1, Ordering::SeqCst);
                let name = format!("{}-{:06}{}", UPLOADER_NAME, seq, suffix);
                fs::copy(&local, self.storage_dir.join(&name))?;
                fs::remove_file(&local)?;
                Some(name)
            }
            Some(index) => {
                index.cleanup();
                None
            }
            None => None,
        };

        let fetched = std::mem::take(&mut *self.fetched.lock());
        let to_remove: Vec<String> = if !consumed.is_empty() {
            consumed.iter().map(|f| f.name.clone()).collect()
        } else if uploaded.is_some() {
            fetched
        } else {
            Vec::new()
        };
        for name in &to_remove {
            self.remove_stored(name);
        }

        if let Some(name) = &uploaded {
            self.files.lock().push(SourceFile::new(name.clone(), SystemTime::now()));
        }
        self.commits.lock().push(Commit { uploaded, consumed: to_remove, is_final });
        Ok(())
    }
}

/// A table with a common index set and any number of tenant index sets.
pub struct Table {
    pub root: TempDir,
    pub common: Arc<LocalIndexSet>,
    users: Arc<Mutex<HashMap<String, Arc<LocalIndexSet>>>>,
    unavailable_users: Arc<Mutex<HashSet<String>>>,
}

impl Table {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        let root = TempDir::new().unwrap();
        let common = LocalIndexSet::new(&root.path().join("common"));
        Self {
            root,
            common,
            users: Arc::new(Mutex::new(HashMap::new())),
            unavailable_users: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Makes creating a new index set for `user_id` fail.
    pub fn make_user_unavailable(&self, user_id: &str) {
        self.unavailable_users.lock().insert(user_id.to_string());
    }

    pub fn make_user_available(&self, user_id: &str) {
        self.unavailable_users.lock().remove(user_id);
    }

    /// Registers an existing tenant index set.
    pub fn add_user(&self, user_id: &str) -> Arc<LocalIndexSet> {
        let set = LocalIndexSet::new(&self.root.path().join("users").join(user_id));
        self.users.lock().insert(user_id.to_string(), Arc::clone(&set));
        set
    }

    pub fn user(&self, user_id: &str) -> Option<Arc<LocalIndexSet>> {
        self.users.lock().get(user_id).cloned()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.users.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Builds a compactor over the current state of the table. Tenant sets
    /// created during compaction are registered with the table.
    pub fn compactor(&self, options: CompactorOptions) -> TableCompactor {
        self.build_compactor(options, false)
    }

    /// Like [`Table::compactor`], but also passes tenant sets without files.
    pub fn compactor_with_empty_users(&self, options: CompactorOptions) -> TableCompactor {
        self.build_compactor(options, true)
    }

    fn build_compactor(&self, options: CompactorOptions, include_empty: bool) -> TableCompactor {
        let existing: HashMap<String, Arc<dyn IndexSet>> = self
            .users
            .lock()
            .iter()
            .filter(|(_, set)| include_empty || !set.list_source_files().is_empty())
            .map(|(id, set)| (id.clone(), Arc::clone(set) as Arc<dyn IndexSet>))
            .collect();

        let users = Arc::clone(&self.users);
        let users_root = self.root.path().join("users");
        let unavailable = Arc::clone(&self.unavailable_users);
        let make_user_set: MakeEmptyUserIndexSet = Box::new(move |user_id: &str| -> Result<Arc<dyn IndexSet>> {
            if unavailable.lock().contains(user_id) {
                return Err(Error::internal(format!("index set of tenant {} is unavailable", user_id)));
            }
            let set = LocalIndexSet::new(&users_root.join(user_id));
            users.lock().insert(user_id.to_string(), Arc::clone(&set));
            Ok(set as Arc<dyn IndexSet>)
        });

        TableCompactor::new(
            Arc::clone(&self.common) as Arc<dyn IndexSet>,
            existing,
            make_user_set,
            PeriodConfig::default(),
            options,
        )
        .unwrap()
    }

    pub fn compact(&self) -> Result<()> {
        self.compactor(CompactorOptions::default()).compact_table(None)
    }
}
