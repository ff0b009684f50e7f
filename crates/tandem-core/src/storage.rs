use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Mission,
    Routine,
    Lease,
    RoutineRun,
    RoutineHistory,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Mission,
        Namespace::Routine,
        Namespace::Lease,
        Namespace::RoutineRun,
        Namespace::RoutineHistory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Mission => "mission",
            Namespace::Routine => "routine",
            Namespace::Lease => "lease",
            Namespace::RoutineRun => "routine_run",
            Namespace::RoutineHistory => "routine_history",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Namespace::Mission => "missions.json",
            Namespace::Routine => "routines.json",
            Namespace::Lease => "leases.json",
            Namespace::RoutineRun => "routine_runs.json",
            Namespace::RoutineHistory => "routine_history.json",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write precondition for a conditional put or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Absent,
    Revision(u64),
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expect::Any => f.write_str("any"),
            Expect::Absent => f.write_str("absent"),
            Expect::Revision(rev) => write!(f, "rev {rev}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
    pub rev: u64,
    pub updated_at_ms: u64,
}

impl StoredRecord {
    pub fn decode<T: DeserializeOwned>(&self, namespace: Namespace) -> Result<T, StoreError> {
        serde_json::from_value(self.value.clone()).map_err(|err| StoreError::Decode {
            namespace,
            key: self.key.clone(),
            detail: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("revision conflict on {namespace}/{key}: expected {expected}, current {current:?}")]
    RevisionConflict {
        namespace: Namespace,
        key: String,
        expected: Expect,
        current: Option<u64>,
    },
    #[error("invalid key `{key}` in {namespace}")]
    InvalidKey { namespace: Namespace, key: String },
    #[error("failed to decode {namespace}/{key}: {detail}")]
    Decode {
        namespace: Namespace,
        key: String,
        detail: String,
    },
    #[error("failed to read {namespace}: {detail}")]
    ReadFailed { namespace: Namespace, detail: String },
    #[error("failed to persist {namespace}: {detail}")]
    PersistFailed { namespace: Namespace, detail: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::RevisionConflict { .. })
    }
}

/// Revisioned key/value namespaces shared by every worker. All writes are
/// conditional on `Expect`, which is what leases and mission CAS build on.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<StoredRecord>, StoreError>;

    async fn list(&self, namespace: Namespace) -> Result<Vec<StoredRecord>, StoreError>;

    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        value: Value,
        expect: Expect,
    ) -> Result<StoredRecord, StoreError>;

    async fn delete(
        &self,
        namespace: Namespace,
        key: &str,
        expect: Expect,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn list_prefix(
        &self,
        namespace: Namespace,
        prefix: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self
            .list(namespace)
            .await?
            .into_iter()
            .filter(|record| record.key.starts_with(prefix))
            .collect())
    }
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

type Table = BTreeMap<String, StoredRecord>;

/// Revisioned JSON tables, one file per namespace under `root`, or purely in
/// memory. File-backed calls re-read the namespace under an exclusive `flock`
/// for every write, so any number of processes can share one state dir.
pub struct JsonStateStore {
    backend: Backend,
}

enum Backend {
    Memory(RwLock<BTreeMap<Namespace, Table>>),
    Files { root: PathBuf },
}

impl JsonStateStore {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating state dir {}", root.display()))?;
        let check_root = root.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for namespace in Namespace::ALL {
                read_locked(&check_root, namespace)
                    .with_context(|| format!("loading {}", namespace.file_name()))?;
            }
            Ok(())
        })
        .await
        .context("state dir check panicked")??;
        Ok(Self {
            backend: Backend::Files { root },
        })
    }

    pub fn root(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Memory(_) => None,
            Backend::Files { root } => Some(root),
        }
    }
}

fn check_expect(
    namespace: Namespace,
    key: &str,
    expect: Expect,
    current: Option<&StoredRecord>,
) -> Result<(), StoreError> {
    let ok = match (expect, current) {
        (Expect::Any, _) => true,
        (Expect::Absent, current) => current.is_none(),
        (Expect::Revision(rev), Some(record)) => record.rev == rev,
        (Expect::Revision(_), None) => false,
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::RevisionConflict {
            namespace,
            key: key.to_string(),
            expected: expect,
            current: current.map(|record| record.rev),
        })
    }
}

fn apply_put(
    table: &mut Table,
    namespace: Namespace,
    key: &str,
    value: Value,
    expect: Expect,
) -> Result<StoredRecord, StoreError> {
    let previous = table.get(key);
    check_expect(namespace, key, expect, previous)?;
    let record = StoredRecord {
        key: key.to_string(),
        value,
        rev: previous.map(|record| record.rev + 1).unwrap_or(1),
        updated_at_ms: now_ms(),
    };
    table.insert(key.to_string(), record.clone());
    Ok(record)
}

fn apply_delete(
    table: &mut Table,
    namespace: Namespace,
    key: &str,
    expect: Expect,
) -> Result<Option<StoredRecord>, StoreError> {
    check_expect(namespace, key, expect, table.get(key))?;
    Ok(table.remove(key))
}

fn table_path(root: &Path, namespace: Namespace) -> PathBuf {
    root.join(namespace.file_name())
}

fn lock_table(root: &Path, namespace: Namespace, exclusive: bool) -> Result<File, StoreError> {
    let path = root.join(format!("{}.lock", namespace.file_name()));
    let failed = |err: std::io::Error| StoreError::PersistFailed {
        namespace,
        detail: format!("{}: {err}", path.display()),
    };
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(failed)?;
    if exclusive {
        FileExt::lock_exclusive(&lock_file).map_err(failed)?;
    } else {
        FileExt::lock_shared(&lock_file).map_err(failed)?;
    }
    Ok(lock_file)
}

fn load_table(root: &Path, namespace: Namespace) -> Result<Table, StoreError> {
    let path = table_path(root, namespace);
    let failed = |detail: String| StoreError::ReadFailed {
        namespace,
        detail: format!("{}: {detail}", path.display()),
    };
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Table::new()),
        Err(err) => return Err(failed(err.to_string())),
    };
    if raw.trim().is_empty() {
        return Ok(Table::new());
    }
    serde_json::from_str(&raw).map_err(|err| failed(err.to_string()))
}

fn save_table(root: &Path, namespace: Namespace, table: &Table) -> Result<(), StoreError> {
    let failed = |detail: String| StoreError::PersistFailed { namespace, detail };
    let payload = serde_json::to_string_pretty(table).map_err(|err| failed(err.to_string()))?;
    let path = table_path(root, namespace);
    let tmp = root.join(format!("{}.tmp", namespace.file_name()));
    std::fs::write(&tmp, payload).map_err(|err| failed(err.to_string()))?;
    std::fs::rename(&tmp, &path).map_err(|err| failed(err.to_string()))?;
    Ok(())
}

fn read_locked(root: &Path, namespace: Namespace) -> Result<Table, StoreError> {
    let lock_file = lock_table(root, namespace, false)?;
    let table = load_table(root, namespace);
    drop(lock_file);
    table
}

/// Read, modify and write one namespace while holding its exclusive lock.
/// `apply` reports whether it changed the table; unchanged tables are not
/// rewritten.
fn update_locked<T>(
    root: &Path,
    namespace: Namespace,
    apply: impl FnOnce(&mut Table) -> Result<(T, bool), StoreError>,
) -> Result<T, StoreError> {
    let lock_file = lock_table(root, namespace, true)?;
    let mut table = load_table(root, namespace)?;
    let (output, changed) = apply(&mut table)?;
    if changed {
        save_table(root, namespace, &table)?;
    }
    drop(lock_file);
    Ok(output)
}

async fn blocking<T, F>(namespace: Namespace, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StoreError::PersistFailed {
            namespace,
            detail: format!("store task failed: {err}"),
        })?
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(tables) => Ok(tables
                .read()
                .await
                .get(&namespace)
                .and_then(|table| table.get(key))
                .cloned()),
            Backend::Files { root } => {
                let root = root.clone();
                let key = key.to_string();
                blocking(namespace, move || {
                    Ok(read_locked(&root, namespace)?.remove(&key))
                })
                .await
            }
        }
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<StoredRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(tables) => Ok(tables
                .read()
                .await
                .get(&namespace)
                .map(|table| table.values().cloned().collect())
                .unwrap_or_default()),
            Backend::Files { root } => {
                let root = root.clone();
                blocking(namespace, move || {
                    Ok(read_locked(&root, namespace)?.into_values().collect())
                })
                .await
            }
        }
    }

    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        value: Value,
        expect: Expect,
    ) -> Result<StoredRecord, StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey {
                namespace,
                key: key.to_string(),
            });
        }
        match &self.backend {
            Backend::Memory(tables) => {
                let mut tables = tables.write().await;
                apply_put(tables.entry(namespace).or_default(), namespace, key, value, expect)
            }
            Backend::Files { root } => {
                let root = root.clone();
                let key = key.to_string();
                blocking(namespace, move || {
                    update_locked(&root, namespace, |table| {
                        let record = apply_put(table, namespace, &key, value, expect)?;
                        Ok((record, true))
                    })
                })
                .await
            }
        }
    }

    async fn delete(
        &self,
        namespace: Namespace,
        key: &str,
        expect: Expect,
    ) -> Result<Option<StoredRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(tables) => {
                let mut tables = tables.write().await;
                apply_delete(tables.entry(namespace).or_default(), namespace, key, expect)
            }
            Backend::Files { root } => {
                let root = root.clone();
                let key = key.to_string();
                blocking(namespace, move || {
                    update_locked(&root, namespace, |table| {
                        let removed = apply_delete(table, namespace, &key, expect)?;
                        let changed = removed.is_some();
                        Ok((removed, changed))
                    })
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_enforces_expectations() {
        let store = JsonStateStore::in_memory();
        let first = store
            .put(Namespace::Routine, "r-1", json!({"n": 1}), Expect::Absent)
            .await
            .expect("create");
        assert_eq!(first.rev, 1);

        let err = store
            .put(Namespace::Routine, "r-1", json!({"n": 2}), Expect::Absent)
            .await
            .expect_err("already present");
        assert!(err.is_conflict());

        let second = store
            .put(Namespace::Routine, "r-1", json!({"n": 2}), Expect::Revision(1))
            .await
            .expect("update");
        assert_eq!(second.rev, 2);

        let err = store
            .put(Namespace::Routine, "r-1", json!({"n": 3}), Expect::Revision(1))
            .await
            .expect_err("stale");
        assert_eq!(
            err,
            StoreError::RevisionConflict {
                namespace: Namespace::Routine,
                key: "r-1".to_string(),
                expected: Expect::Revision(1),
                current: Some(2),
            }
        );
        let current = store
            .get(Namespace::Routine, "r-1")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(current.value, json!({"n": 2}));
    }

    #[tokio::test]
    async fn namespaces_are_isolated_and_prefix_listing_works() {
        let store = JsonStateStore::in_memory();
        for key in ["rr-a-1", "rr-a-2", "rr-b-1"] {
            store
                .put(Namespace::RoutineRun, key, json!({}), Expect::Any)
                .await
                .expect("put");
        }
        assert!(store.list(Namespace::Routine).await.expect("list").is_empty());
        let keys: Vec<String> = store
            .list_prefix(Namespace::RoutineRun, "rr-a-")
            .await
            .expect("prefix")
            .into_iter()
            .map(|record| record.key)
            .collect();
        assert_eq!(keys, vec!["rr-a-1".to_string(), "rr-a-2".to_string()]);
    }

    #[tokio::test]
    async fn file_backed_store_reloads_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = JsonStateStore::open(dir.path()).await.expect("open");
            store
                .put(Namespace::Mission, "m-1", json!({"status": "draft"}), Expect::Absent)
                .await
                .expect("put");
        }
        assert!(dir.path().join("missions.json").exists());
        let reopened = JsonStateStore::open(dir.path()).await.expect("reopen");
        let record = reopened
            .get(Namespace::Mission, "m-1")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.rev, 1);
        assert_eq!(record.value["status"], "draft");
    }

    #[tokio::test]
    async fn failed_write_leaves_disk_state_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStateStore::open(dir.path()).await.expect("open");
        store
            .put(Namespace::Routine, "r-1", json!({"v": 1}), Expect::Absent)
            .await
            .expect("put");

        // A directory where the temp file goes makes the write step fail.
        std::fs::create_dir(dir.path().join("routines.json.tmp")).expect("block tmp");

        let err = store
            .put(Namespace::Routine, "r-1", json!({"v": 2}), Expect::Revision(1))
            .await
            .expect_err("persist should fail");
        assert!(matches!(err, StoreError::PersistFailed { .. }));
        let record = store
            .get(Namespace::Routine, "r-1")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.rev, 1);
        assert_eq!(record.value, json!({"v": 1}));

        let err = store
            .put(Namespace::Routine, "r-2", json!({}), Expect::Absent)
            .await
            .expect_err("persist should fail");
        assert!(matches!(err, StoreError::PersistFailed { .. }));
        assert!(store
            .get(Namespace::Routine, "r-2")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn handles_on_one_dir_share_revisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = JsonStateStore::open(dir.path()).await.expect("open a");
        let b = JsonStateStore::open(dir.path()).await.expect("open b");

        a.put(Namespace::Mission, "m-1", json!({"n": 1}), Expect::Absent)
            .await
            .expect("create via a");
        let err = b
            .put(Namespace::Mission, "m-1", json!({"n": 9}), Expect::Absent)
            .await
            .expect_err("b sees a's record");
        assert!(err.is_conflict());

        let updated = b
            .put(Namespace::Mission, "m-1", json!({"n": 2}), Expect::Revision(1))
            .await
            .expect("update via b");
        assert_eq!(updated.rev, 2);

        let err = a
            .put(Namespace::Mission, "m-1", json!({"n": 3}), Expect::Revision(1))
            .await
            .expect_err("a is stale");
        assert!(err.is_conflict());
        let current = a
            .get(Namespace::Mission, "m-1")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(current.value, json!({"n": 2}));
        assert_eq!(current.rev, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_handles_never_lose_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tasks = Vec::new();
        for idx in 0..8 {
            let store = JsonStateStore::open(dir.path()).await.expect("open");
            tasks.push(tokio::spawn(async move {
                store
                    .put(
                        Namespace::RoutineRun,
                        &format!("rr-{idx}"),
                        json!({"idx": idx}),
                        Expect::Absent,
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("put");
        }
        let reader = JsonStateStore::open(dir.path()).await.expect("open");
        assert_eq!(reader.list(Namespace::RoutineRun).await.expect("list").len(), 8);
    }

    #[tokio::test]
    async fn corrupt_table_fails_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("leases.json"), "{not json").expect("write");
        assert!(JsonStateStore::open(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn delete_respects_revision() {
        let store = JsonStateStore::in_memory();
        store
            .put(Namespace::Lease, "r-1", json!({}), Expect::Absent)
            .await
            .expect("put");
        assert!(store
            .delete(Namespace::Lease, "r-1", Expect::Revision(9))
            .await
            .is_err());
        let removed = store
            .delete(Namespace::Lease, "r-1", Expect::Any)
            .await
            .expect("delete");
        assert!(removed.is_some());
        assert!(store
            .delete(Namespace::Lease, "r-1", Expect::Any)
            .await
            .expect("delete missing")
            .is_none());
    }
}
