//! Durable, single-writer wrapper around a [`SerialIndex`]
//!
//! Writers run inside [`Ledger::transact`]: the closure edits a private draft of the
//! committed index, the draft is persisted, and only then does it replace the committed
//! value. Any error (from the closure or from the save) drops the draft, so a serial
//! allocated inside a failed transaction is never observed and never persisted.
//!
//! Several handles may share one persisted index (the CLI next to a running daemon). A
//! transaction holds the store's exclusive lock and starts from the persisted copy;
//! readers reload whenever the store reports a newer revision.
//!
//! Readers take [`Ledger::snapshot`], an `Arc` clone that never changes underneath them.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{CaError, Result};
use crate::policy::CaLevel;
use crate::serial_index::SerialIndex;

/// One persisted version of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    Generation(u64),
    File {
        inode: u64,
        len: u64,
        modified: Option<SystemTime>,
    },
}

/// Exclusive hold on a persisted index; released on drop
#[derive(Debug, Default)]
pub struct IndexLock {
    _file: Option<fs::File>,
}

/// Persistence backend for one index
pub trait IndexStore: Send + Sync {
    fn load(&self) -> Result<Option<SerialIndex>>;
    fn save(&self, index: &SerialIndex) -> Result<()>;

    /// Block until no other handle is writing this index
    fn lock(&self) -> Result<IndexLock> {
        Ok(IndexLock::default())
    }

    /// Current persisted revision, `None` when nothing is persisted or it cannot be told
    fn revision(&self) -> Result<Option<Revision>> {
        Ok(None)
    }
}

/// JSON file replaced atomically on every save, guarded by a sibling `.lock` file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

impl IndexStore for JsonFileStore {
    fn load(&self) -> Result<Option<SerialIndex>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .map_err(|e| CaError::storage(format!("read {}", self.path.display()), e))?;
        let index = serde_json::from_slice(&bytes)
            .map_err(|e| CaError::storage(format!("parse {}", self.path.display()), e))?;
        Ok(Some(index))
    }

    fn save(&self, index: &SerialIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)
            .map_err(|e| CaError::storage("serialize serial index", e))?;
        write_atomic(&self.path, &json, None)
    }

    fn lock(&self) -> Result<IndexLock> {
        use nix::errno::Errno;
        use nix::fcntl::{flock, FlockArg};
        use std::os::unix::io::AsRawFd;

        let path = self.lock_path();
        let context = || format!("lock {}", path.display());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| CaError::storage(context(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CaError::storage(context(), e))?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(CaError::storage(context(), e)),
            }
        }
        Ok(IndexLock { _file: Some(file) })
    }

    fn revision(&self) -> Result<Option<Revision>> {
        use std::os::unix::fs::MetadataExt;

        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CaError::storage(format!("stat {}", self.path.display()), e))
            }
        };
        Ok(Some(Revision::File {
            inode: metadata.ino(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }))
    }
}

/// Write `contents` to a sibling temp file, fsync, then rename over `path`
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let context = || format!("write {}", path.display());
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| CaError::storage(context(), e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CaError::storage(context(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(mode))
                .map_err(|e| CaError::storage(context(), e))?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    tmp.write_all(contents)
        .map_err(|e| CaError::storage(context(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CaError::storage(context(), e))?;
    tmp.persist(path)
        .map_err(|e| CaError::storage(context(), e.error))?;
    Ok(())
}

/// In-memory store; can be told to fail saves to exercise rollback
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    saved: Mutex<Option<SerialIndex>>,
    generation: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Option<SerialIndex> {
        self.saved.lock().clone()
    }
}

impl IndexStore for MemoryIndexStore {
    fn load(&self) -> Result<Option<SerialIndex>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, index: &SerialIndex) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CaError::storage(
                "save serial index",
                "memory store configured to fail",
            ));
        }
        let mut saved = self.saved.lock();
        *saved = Some(index.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn revision(&self) -> Result<Option<Revision>> {
        let _saved = self.saved.lock();
        Ok(Some(Revision::Generation(self.generation.load(Ordering::SeqCst))))
    }
}

struct Committed {
    index: Arc<SerialIndex>,
    revision: Option<Revision>,
}

pub struct Ledger {
    store: Arc<dyn IndexStore>,
    level: CaLevel,
    writer: Mutex<()>,
    committed: RwLock<Committed>,
}

impl Ledger {
    /// Load the index from `store`, or start a fresh one at `first_serial`
    pub fn open(store: Arc<dyn IndexStore>, level: CaLevel, first_serial: u64) -> Result<Self> {
        let revision = store.revision()?;
        let index = match store.load()? {
            Some(index) => index,
            None => SerialIndex::new(level, first_serial),
        };
        Ok(Self {
            store,
            level,
            writer: Mutex::new(()),
            committed: RwLock::new(Committed {
                index: Arc::new(index),
                revision,
            }),
        })
    }

    /// Run `f` against a draft of the index and commit it if both `f` and the save succeed
    ///
    /// The draft is read from the store under its lock, so handles sharing a store never
    /// hand out the same serial.
    pub fn transact<T>(&self, f: impl FnOnce(&mut SerialIndex) -> Result<T>) -> Result<T> {
        let _writer = self.writer.lock();
        let _lock = self.store.lock()?;
        let mut draft = match self.store.load()? {
            Some(persisted) => persisted,
            None => SerialIndex::clone(&self.committed.read().index),
        };
        let output = f(&mut draft)?;
        self.store.save(&draft)?;
        let revision = self.store.revision().ok().flatten();
        *self.committed.write() = Committed {
            index: Arc::new(draft),
            revision,
        };
        Ok(output)
    }

    /// Committed state as of now, including commits made through other handles
    pub fn snapshot(&self) -> Arc<SerialIndex> {
        match self.refresh() {
            Ok(index) => index,
            Err(e) => {
                warn!(level = %self.level, error = %e, "serial index reload failed, using cached copy");
                Arc::clone(&self.committed.read().index)
            }
        }
    }

    pub fn level(&self) -> CaLevel {
        self.level
    }

    /// Swap in the persisted index when its revision moved past the committed one
    fn refresh(&self) -> Result<Arc<SerialIndex>> {
        let current = self.store.revision()?;
        let seen = {
            let committed = self.committed.read();
            if current.is_none() || current == committed.revision {
                return Ok(Arc::clone(&committed.index));
            }
            committed.revision
        };
        let Some(index) = self.store.load()? else {
            return Ok(Arc::clone(&self.committed.read().index));
        };
        let mut committed = self.committed.write();
        if committed.revision == seen {
            debug!(level = %self.level, records = index.len(), "serial index reloaded");
            *committed = Committed {
                index: Arc::new(index),
                revision: current,
            };
        }
        Ok(Arc::clone(&committed.index))
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = Arc::clone(&self.committed.read().index);
        f.debug_struct("Ledger")
            .field("level", &self.level)
            .field("records", &index.len())
            .field("next_serial", &index.next_serial())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::serial_index::DEFAULT_FIRST_SERIAL;

    fn memory_ledger() -> (Arc<MemoryIndexStore>, Ledger) {
        let store = Arc::new(MemoryIndexStore::new());
        let ledger = Ledger::open(store.clone(), CaLevel::Intermediate, DEFAULT_FIRST_SERIAL).unwrap();
        (store, ledger)
    }

    #[test]
    fn failed_closure_rolls_back_allocation() {
        let (_, ledger) = memory_ledger();
        let result: Result<u64> = ledger.transact(|index| {
            index.allocate();
            Err(ValidationError::EmptyInput("subject").into())
        });
        assert!(result.is_err());
        let serial = ledger.transact(|index| Ok(index.allocate())).unwrap();
        assert_eq!(serial, DEFAULT_FIRST_SERIAL);
    }

    #[test]
    fn failed_save_leaves_committed_state_untouched() {
        let (store, ledger) = memory_ledger();
        store.set_fail_saves(true);
        assert!(ledger.transact(|index| Ok(index.allocate())).is_err());
        assert_eq!(ledger.snapshot().next_serial(), DEFAULT_FIRST_SERIAL);
        assert!(store.saved().is_none());

        store.set_fail_saves(false);
        ledger.transact(|index| Ok(index.allocate())).unwrap();
        assert_eq!(store.saved().unwrap().next_serial(), DEFAULT_FIRST_SERIAL + 1);
    }

    #[test]
    fn snapshot_is_stable_across_commits() {
        let (_, ledger) = memory_ledger();
        let before = ledger.snapshot();
        ledger.transact(|index| Ok(index.next_crl_number())).unwrap();
        assert_eq!(before.crl_number(), 0);
        assert_eq!(ledger.snapshot().crl_number(), 1);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let ledger = Ledger::open(
                Arc::new(JsonFileStore::new(&path)),
                CaLevel::Root,
                DEFAULT_FIRST_SERIAL,
            )
            .unwrap();
            ledger.transact(|index| Ok(index.allocate())).unwrap();
        }
        let reopened = Ledger::open(Arc::new(JsonFileStore::new(&path)), CaLevel::Root, 1).unwrap();
        assert_eq!(reopened.snapshot().next_serial(), DEFAULT_FIRST_SERIAL + 1);
        assert_eq!(reopened.level(), CaLevel::Root);
    }

    #[test]
    fn handles_on_one_file_continue_each_others_serials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let open = || {
            Ledger::open(Arc::new(JsonFileStore::new(&path)), CaLevel::Intermediate, DEFAULT_FIRST_SERIAL)
                .unwrap()
        };
        let cli = open();
        let daemon = open();

        assert_eq!(cli.transact(|index| Ok(index.allocate())).unwrap(), DEFAULT_FIRST_SERIAL);
        assert_eq!(daemon.transact(|index| Ok(index.allocate())).unwrap(), DEFAULT_FIRST_SERIAL + 1);
        assert_eq!(cli.snapshot().next_serial(), DEFAULT_FIRST_SERIAL + 2);

        daemon.transact(|index| Ok(index.next_crl_number())).unwrap();
        assert_eq!(cli.snapshot().crl_number(), 1);
    }

    #[test]
    fn transaction_waits_for_the_file_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let store = JsonFileStore::new(&path);
        let held = store.lock().unwrap();

        let ledger = Ledger::open(Arc::new(JsonFileStore::new(&path)), CaLevel::Root, DEFAULT_FIRST_SERIAL)
            .unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let writer = std::thread::spawn(move || {
            let serial = ledger.transact(|index| Ok(index.allocate())).unwrap();
            tx.send(serial).unwrap();
        });
        assert!(rx.recv_timeout(std::time::Duration::from_millis(200)).is_err());

        drop(held);
        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap(),
            DEFAULT_FIRST_SERIAL
        );
        writer.join().unwrap();
    }

    #[test]
    fn memory_handles_share_commits() {
        let store = Arc::new(MemoryIndexStore::new());
        let a = Ledger::open(store.clone(), CaLevel::Root, DEFAULT_FIRST_SERIAL).unwrap();
        let b = Ledger::open(store, CaLevel::Root, DEFAULT_FIRST_SERIAL).unwrap();
        a.transact(|index| Ok(index.allocate())).unwrap();
        assert_eq!(b.transact(|index| Ok(index.allocate())).unwrap(), DEFAULT_FIRST_SERIAL + 1);
        assert_eq!(a.snapshot().next_serial(), DEFAULT_FIRST_SERIAL + 2);
    }

    #[test]
    fn concurrent_writers_never_share_a_serial() {
        let (_, ledger) = memory_ledger();
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| ledger.transact(|index| Ok(index.allocate())).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
