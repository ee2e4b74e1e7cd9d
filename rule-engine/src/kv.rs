use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

type Db = DBWithThreadMode<MultiThreaded>;

/// Thin wrapper over an embedded RocksDB environment with named column
/// families. All engine stores (trackers, aggregation, duplicate-check) sit
/// on top of this.
pub struct KvStore {
    db: Db,
    path: PathBuf,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").field("path", &self.path).finish()
    }
}

impl KvStore {
    pub fn open(path: &Path, column_families: &[&str]) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = column_families
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, path, descriptors)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("Missing column family '{}' in {}", name, self.path.display()))
    }

    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .with_context(|| format!("Read failed in column family '{cf_name}'"))
    }

    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf(&cf, key, value)
            .with_context(|| format!("Write failed in column family '{cf_name}'"))
    }

    /// Commit a batch of writes atomically against a single column family.
    pub fn write_batch(&self, cf_name: &str, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put_cf(&cf, key, value);
        }
        self.db
            .write(batch)
            .with_context(|| format!("Batch write failed in column family '{cf_name}'"))
    }

    /// Delete all keys in `[from, to)`.
    pub fn delete_range(&self, cf_name: &str, from: &[u8], to: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .delete_range_cf(&cf, from, to)
            .with_context(|| format!("Range delete failed in column family '{cf_name}'"))
    }

    /// Collect all entries with keys in `[from, to)`, in key order.
    pub fn scan_range(&self, cf_name: &str, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(from, Direction::Forward));
        for item in iter {
            let (key, value) = item.context("Iterator failed")?;
            if key.as_ref() >= to {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    /// First key in the column family, if any.
    pub fn first_key(&self, cf_name: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        match iter.next() {
            Some(item) => {
                let (key, _) = item.context("Iterator failed")?;
                Ok(Some(key.to_vec()))
            }
            None => Ok(None),
        }
    }

    pub fn count(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf(cf_name)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.context("Iterator failed")?;
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&self, cf_name: &str) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .flush_cf(&cf)
            .with_context(|| format!("Flush failed for column family '{cf_name}'"))
    }
}

/// Big-endian u64, so lexicographic key order matches numeric order.
pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("Expected 8 byte key segment, got {}", bytes.len()))?;
    Ok(u64::from_be_bytes(array))
}
