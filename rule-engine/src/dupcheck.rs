use std::collections::HashSet;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::Context;
use dashmap::DashMap;
use siphasher::sip::SipHasher13;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::kv::{encode_u64, KvStore};
use crate::model::{FieldValue, RuleDefinition};

const FINGERPRINTS_CF: &str = "fingerprints";

pub const DEFAULT_MAX_PUTS_BEFORE_COMMIT: usize = 100;
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(10);

// Fixed keys so fingerprints stay stable across restarts.
const SIP_KEY_0: u64 = 0x736f6d6570736575;
const SIP_KEY_1: u64 = 0x646f72616e646f6d;

#[derive(Debug, Error)]
pub enum DuplicateCheckError {
    #[error("store owned by thread {owner:?} was accessed from thread {actual:?}")]
    ThreadConfinement { owner: ThreadId, actual: ThreadId },
    #[error("duplicate check writer thread is gone")]
    WriterGone,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Stable fingerprint of the duplicate-significant columns of a detection.
/// When `key_columns` is empty every value column participates.
pub fn fingerprint(values: &[FieldValue], key_columns: &[String]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(SIP_KEY_0, SIP_KEY_1);
    if key_columns.is_empty() {
        for value in values {
            hasher.write(value.name.as_bytes());
            hasher.write(&[0]);
            hasher.write(value.value.as_bytes());
            hasher.write(&[0]);
        }
    } else {
        for column in key_columns {
            hasher.write(column.as_bytes());
            hasher.write(&[0]);
            let found = values
                .iter()
                .find(|v| &v.name == column)
                .map(|v| v.value.as_str())
                .unwrap_or("");
            hasher.write(found.as_bytes());
            hasher.write(&[0]);
        }
    }
    hasher.finish()
}

/// Persistent set of detection fingerprints for one rule. All mutating calls
/// must come from the thread that constructed the store; calls from any other
/// thread fail without touching state. Writes are buffered and committed in
/// batches.
pub struct DuplicateCheckStore {
    kv: KvStore,
    owner: ThreadId,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
    pending_keys: HashSet<Vec<u8>>,
    puts_since_commit: usize,
    last_commit: Instant,
    max_puts_before_commit: usize,
    commit_interval: Duration,
}

impl DuplicateCheckStore {
    pub fn open(path: &Path) -> Result<Self, DuplicateCheckError> {
        Self::open_with(
            path,
            DEFAULT_MAX_PUTS_BEFORE_COMMIT,
            DEFAULT_COMMIT_INTERVAL,
        )
    }

    pub fn open_with(
        path: &Path,
        max_puts_before_commit: usize,
        commit_interval: Duration,
    ) -> Result<Self, DuplicateCheckError> {
        let kv = KvStore::open(path, &[FINGERPRINTS_CF])?;
        Ok(Self {
            kv,
            owner: thread::current().id(),
            pending: Vec::new(),
            pending_keys: HashSet::new(),
            puts_since_commit: 0,
            last_commit: Instant::now(),
            max_puts_before_commit,
            commit_interval,
        })
    }

    fn check_thread(&self) -> Result<(), DuplicateCheckError> {
        let actual = thread::current().id();
        if actual != self.owner {
            return Err(DuplicateCheckError::ThreadConfinement {
                owner: self.owner,
                actual,
            });
        }
        Ok(())
    }

    /// Insert the fingerprint if it has not been seen before. Returns true on
    /// first sight (detection should be delivered), false for a duplicate.
    pub fn try_insert(&mut self, fingerprint: u64) -> Result<bool, DuplicateCheckError> {
        self.check_thread()?;
        let key = encode_u64(fingerprint).to_vec();

        if self.pending_keys.contains(&key) {
            return Ok(false);
        }
        if self
            .kv
            .get(FINGERPRINTS_CF, &key)
            .context("Duplicate check read failed")?
            .is_some()
        {
            return Ok(false);
        }

        self.pending_keys.insert(key.clone());
        self.pending.push((key, Vec::new()));
        self.puts_since_commit += 1;
        if self.puts_since_commit >= self.max_puts_before_commit
            || self.last_commit.elapsed() >= self.commit_interval
        {
            self.commit()?;
        }
        Ok(true)
    }

    /// Commit any buffered inserts.
    pub fn flush(&mut self) -> Result<(), DuplicateCheckError> {
        self.check_thread()?;
        self.commit()
    }

    pub fn len(&self) -> Result<u64, DuplicateCheckError> {
        self.check_thread()?;
        let committed = self.kv.count(FINGERPRINTS_CF)?;
        Ok(committed + self.pending.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool, DuplicateCheckError> {
        Ok(self.len()? == 0)
    }

    fn commit(&mut self) -> Result<(), DuplicateCheckError> {
        if !self.pending.is_empty() {
            self.kv
                .write_batch(FINGERPRINTS_CF, &self.pending)
                .context("Duplicate check commit failed")?;
            self.pending.clear();
            self.pending_keys.clear();
        }
        self.puts_since_commit = 0;
        self.last_commit = Instant::now();
        Ok(())
    }
}

enum Request {
    TryInsert(u64, mpsc::Sender<Result<bool, DuplicateCheckError>>),
    Flush(mpsc::Sender<Result<(), DuplicateCheckError>>),
    Len(mpsc::Sender<Result<u64, DuplicateCheckError>>),
    Close,
}

/// Shareable handle to a duplicate-check store confined to its own writer
/// thread. The store is created on that thread and never leaves it, so the
/// confinement check can never trip through this handle.
pub struct DuplicateCheckHandle {
    rule_uuid: Uuid,
    sender: mpsc::Sender<Request>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DuplicateCheckHandle {
    pub fn open(
        path: PathBuf,
        rule_uuid: Uuid,
        max_puts_before_commit: usize,
        commit_interval: Duration,
    ) -> Result<Self, DuplicateCheckError> {
        let (sender, receiver) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DuplicateCheckError>>();

        let writer = thread::Builder::new()
            .name(format!("dup-check-{rule_uuid}"))
            .spawn(move || {
                let mut store =
                    match DuplicateCheckStore::open_with(&path, max_puts_before_commit, commit_interval)
                    {
                        Ok(store) => {
                            drop(ready_tx.send(Ok(())));
                            store
                        }
                        Err(e) => {
                            drop(ready_tx.send(Err(e)));
                            return;
                        }
                    };
                writer_loop(&mut store, &receiver, commit_interval);
                if let Err(e) = store.flush() {
                    error!(rule = %rule_uuid, error = ?e, "Final duplicate check commit failed");
                }
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn duplicate check writer: {e}"))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DuplicateCheckError::WriterGone),
        }

        Ok(Self {
            rule_uuid,
            sender,
            writer: std::sync::Mutex::new(Some(writer)),
        })
    }

    pub fn rule_uuid(&self) -> Uuid {
        self.rule_uuid
    }

    pub fn try_insert(&self, fingerprint: u64) -> Result<bool, DuplicateCheckError> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Request::TryInsert(fingerprint, tx))
            .map_err(|_| DuplicateCheckError::WriterGone)?;
        rx.recv().map_err(|_| DuplicateCheckError::WriterGone)?
    }

    pub fn flush(&self) -> Result<(), DuplicateCheckError> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Request::Flush(tx))
            .map_err(|_| DuplicateCheckError::WriterGone)?;
        rx.recv().map_err(|_| DuplicateCheckError::WriterGone)?
    }

    pub fn len(&self) -> Result<u64, DuplicateCheckError> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Request::Len(tx))
            .map_err(|_| DuplicateCheckError::WriterGone)?;
        rx.recv().map_err(|_| DuplicateCheckError::WriterGone)?
    }
}

impl Drop for DuplicateCheckHandle {
    fn drop(&mut self) {
        drop(self.sender.send(Request::Close));
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(handle) = guard.take() {
                drop(handle.join());
            }
        }
    }
}

fn writer_loop(
    store: &mut DuplicateCheckStore,
    receiver: &mpsc::Receiver<Request>,
    commit_interval: Duration,
) {
    loop {
        match receiver.recv_timeout(commit_interval) {
            Ok(Request::TryInsert(fingerprint, reply)) => {
                drop(reply.send(store.try_insert(fingerprint)));
            }
            Ok(Request::Flush(reply)) => {
                drop(reply.send(store.flush()));
            }
            Ok(Request::Len(reply)) => {
                drop(reply.send(store.len()));
            }
            Ok(Request::Close) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(e) = store.flush() {
                    warn!(error = ?e, "Idle duplicate check commit failed");
                }
            }
        }
    }
}

/// Owns the duplicate-check stores, one directory per rule with suppression
/// enabled. Directory lifecycle mirrors the aggregation store manager.
pub struct DuplicateCheckStores {
    base_dir: PathBuf,
    max_puts_before_commit: usize,
    commit_interval: Duration,
    handles: DashMap<Uuid, Arc<DuplicateCheckHandle>>,
}

impl DuplicateCheckStores {
    pub fn new(
        base_dir: PathBuf,
        max_puts_before_commit: usize,
        commit_interval: Duration,
    ) -> Self {
        Self {
            base_dir,
            max_puts_before_commit,
            commit_interval,
            handles: DashMap::new(),
        }
    }

    pub fn get_or_create(
        &self,
        rule: &RuleDefinition,
    ) -> Result<Arc<DuplicateCheckHandle>, DuplicateCheckError> {
        let entry = self.handles.entry(rule.uuid).or_try_insert_with(|| {
            let path = self.store_path(rule.uuid);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let handle = DuplicateCheckHandle::open(
                path,
                rule.uuid,
                self.max_puts_before_commit,
                self.commit_interval,
            )?;
            Ok::<_, DuplicateCheckError>(Arc::new(handle))
        })?;
        Ok(entry.value().clone())
    }

    pub fn store_path(&self, rule_uuid: Uuid) -> PathBuf {
        let name: String = rule_uuid
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.base_dir.join(name)
    }

    /// Drop handles and delete directories for rules that no longer exist or
    /// no longer suppress duplicates.
    pub fn delete_old_stores(&self, current_rules: &[RuleDefinition]) -> std::io::Result<()> {
        let expected: HashSet<PathBuf> = current_rules
            .iter()
            .filter(|rule| rule.suppression.enabled)
            .map(|rule| self.store_path(rule.uuid))
            .collect();

        self.handles
            .retain(|uuid, _| expected.contains(&self.store_path(*uuid)));

        if !self.base_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if expected.contains(&entry.path()) {
                continue;
            }
            info!(dir = %entry.path().display(), "Deleting unused duplicate check store");
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                warn!(dir = %entry.path().display(), error = ?e, "Failed to delete duplicate check store");
            }
        }
        Ok(())
    }
}
