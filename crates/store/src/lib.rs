//! On-disk client state: the last-valid-block trust anchor and the
//! client's long-lived identity key, kept in a small RocksDB database.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
    WriteBatch, WriteOptions,
};
use tracing::warn;

type Db = DBWithThreadMode<MultiThreaded>;

const CF_META: &str = "meta";

const KEY_LVBN: &[u8] = b"last_valid_block_number";
const KEY_LVBH: &[u8] = b"last_valid_block_hash";
const KEY_PRIVATE: &[u8] = b"private";

#[derive(Clone)]
pub struct ClientDb {
    db: Arc<Db>,
    sync_writes: bool,
}

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub create_if_missing: bool,
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_writes: true,
        }
    }
}

impl ClientDb {
    pub fn open(path: &Path, opts: StoreOptions) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(opts.create_if_missing);
        db_opts.create_missing_column_families(true);
        db_opts.set_paranoid_checks(true);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_META, Options::default())];
        let db = Db::open_cf_descriptors(&db_opts, path, cfs)
            .with_context(|| format!("open client db at {}", path.display()))?;
        let this = Self {
            db: Arc::new(db),
            sync_writes: opts.sync_writes,
        };
        // Schema guard
        const SCHEMA: &str = "diode:v1";
        match this.db.get_cf(&this.cf(), b"schema_version")? {
            Some(v) if v.as_slice() == SCHEMA.as_bytes() => {}
            None => this.put(b"schema_version", SCHEMA.as_bytes())?,
            Some(_) => anyhow::bail!("unknown schema_version; expected {}", SCHEMA),
        }
        Ok(this)
    }

    fn cf(&self) -> Arc<BoundColumnFamily<'_>> {
        self.db.cf_handle(CF_META).expect("missing column family")
    }

    fn write_opts(&self) -> WriteOptions {
        let mut w = WriteOptions::default();
        w.set_sync(self.sync_writes);
        w
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut b = WriteBatch::default();
        b.put_cf(&self.cf(), key, val);
        self.db.write_opt(b, &self.write_opts())?;
        Ok(())
    }

    /// The persisted anchor, or `None` when absent or corrupt. Corrupt
    /// records are treated as missing so the caller falls back to the
    /// built-in genesis anchor.
    pub fn last_valid(&self) -> Result<Option<(u64, [u8; 32])>> {
        let Some(raw_number) = self.db.get_cf(&self.cf(), KEY_LVBN)? else {
            return Ok(None);
        };
        let Some(raw_hash) = self.db.get_cf(&self.cf(), KEY_LVBH)? else {
            return Ok(None);
        };
        if raw_number.len() != 8 || raw_hash.len() != 32 {
            warn!(
                number_len = raw_number.len(),
                hash_len = raw_hash.len(),
                "corrupt last-valid anchor, resetting"
            );
            return Ok(None);
        }
        let mut number = [0u8; 8];
        number.copy_from_slice(&raw_number);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&raw_hash);
        Ok(Some((u64::from_be_bytes(number), hash)))
    }

    /// Persist the anchor; both keys are written in one batch.
    pub fn set_last_valid(&self, number: u64, hash: [u8; 32]) -> Result<()> {
        let mut b = WriteBatch::default();
        b.put_cf(&self.cf(), KEY_LVBN, number.to_be_bytes());
        b.put_cf(&self.cf(), KEY_LVBH, hash);
        self.db.write_opt(b, &self.write_opts())?;
        Ok(())
    }

    /// Drop the anchor (used when the reference block no longer matches).
    pub fn clear_last_valid(&self) -> Result<()> {
        let mut b = WriteBatch::default();
        b.delete_cf(&self.cf(), KEY_LVBN);
        b.delete_cf(&self.cf(), KEY_LVBH);
        self.db.write_opt(b, &self.write_opts())?;
        Ok(())
    }

    /// The stored 32-byte identity key scalar, if any.
    pub fn private_key(&self) -> Result<Option<[u8; 32]>> {
        match self.db.get_cf(&self.cf(), KEY_PRIVATE)? {
            Some(raw) if raw.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&raw);
                Ok(Some(out))
            }
            Some(raw) => Err(anyhow!("stored private key has length {}", raw.len())),
            None => Ok(None),
        }
    }

    pub fn set_private_key(&self, key: [u8; 32]) -> Result<()> {
        self.put(KEY_PRIVATE, &key)
    }
}
