use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use txsync_core::{
    ranges, Address, InternalTransaction, Receipt, ResourceKey, SortOrder, TimeRange, Timestamp,
    TokenTransfer, Transaction, TransactionFilter, TxHash,
};

use crate::api::{
    BatchWrite, DbState, RangeTracker, SyncStore, TransactionStore, CURRENT_SCHEMA,
    TXSYNC_REDB_FILENAME,
};
use crate::codec::{decode_ranges, decode_record, encode_ranges, encode_record};
use crate::keys::{
    hash_from_relevant_key, internal_bounds, internal_key, relevant_bounds, relevant_key,
    split_time_index_key, time_index_bounds, time_index_key,
};
use crate::maintenance::quarantine_corrupt_file;
use crate::StorageError;

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const RANGES: TableDefinition<&str, &[u8]> = TableDefinition::new("ranges");
const TRANSACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("transactions");
const TX_TIME_INDEX: TableDefinition<&[u8], ()> = TableDefinition::new("tx_time_index");
const RELEVANT_ADDRESSES: TableDefinition<&[u8], ()> = TableDefinition::new("relevant_addresses");
const INTERNAL_TXS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("internal_txs");
const TOKEN_TRANSFERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("token_transfers");
const RECEIPTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("receipts");

const META_FORMAT_KEY: &str = "format";
const META_FORMAT_VALUE: &str = "txsync-redb";
const META_SCHEMA_VERSION: &str = "schema_version";
const META_CREATED_AT: &str = "created_at";
const META_LAST_SYNC_AT: &str = "last_sync_at";

/// redb-backed coverage and record store rooted in a data directory.
#[derive(Clone)]
pub struct RedbSyncStore {
    path: Utf8PathBuf,
    db: Arc<Database>,
}

impl fmt::Debug for RedbSyncStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbSyncStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbSyncStore {
    fn is_corrupt_open_error(err: &redb::DatabaseError) -> bool {
        match err {
            redb::DatabaseError::Storage(storage) => match storage {
                redb::StorageError::Corrupted(_) => true,
                redb::StorageError::Io(ioe) => matches!(
                    ioe.kind(),
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
                ),
                _ => false,
            },
            _ => false,
        }
    }

    // redb refuses a second handle on the same file, so handles are shared per path.
    fn db_cache() -> &'static Mutex<HashMap<Utf8PathBuf, Arc<Database>>> {
        static CACHE: OnceLock<Mutex<HashMap<Utf8PathBuf, Arc<Database>>>> = OnceLock::new();
        CACHE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub fn path_for_root(root: &Utf8Path) -> Utf8PathBuf {
        root.join(TXSYNC_REDB_FILENAME)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Open the store under `root`, creating the directory and database on first use.
    pub fn open(root: &Utf8Path) -> Result<Self, StorageError> {
        let path = Self::path_for_root(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut cache = Self::db_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = cache.get(&path) {
            if path.exists() {
                return Ok(Self {
                    path,
                    db: existing.clone(),
                });
            }
            cache.remove(&path);
        }

        let db = if path.exists() {
            match Database::open(path.as_std_path()) {
                Ok(db) => db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(StorageError::DatabaseAlreadyOpen);
                }
                Err(e) if Self::is_corrupt_open_error(&e) => {
                    let _ = quarantine_corrupt_file(&path);
                    return Err(StorageError::Corrupt);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            Database::create(path.as_std_path())?
        };

        if let Err(e) = Self::ensure_schema(&db) {
            drop(db);
            if matches!(e, StorageError::Corrupt) {
                let _ = quarantine_corrupt_file(&path);
            }
            return Err(e);
        }
        let db = Arc::new(db);
        cache.insert(path.clone(), db.clone());
        Ok(Self { path, db })
    }

    /// RFC 3339 time of the last coverage update, if any.
    pub fn last_sync_at(&self) -> Result<Option<String>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let meta = read_tx.open_table(META)?;
        let value = meta.get(META_LAST_SYNC_AT)?.map(|g| g.value().to_string());
        Ok(value)
    }

    /// Inspect the database under `root` without creating it.
    pub fn validate(root: &Utf8Path) -> Result<DbState, StorageError> {
        let path = Self::path_for_root(root);
        if !path.exists() {
            return Ok(DbState::Missing);
        }
        {
            let cache = Self::db_cache()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if cache.contains_key(&path) {
                return Ok(DbState::Valid);
            }
        }

        match Database::open(path.as_std_path()) {
            Ok(db) => match Self::ensure_schema(&db) {
                Ok(()) => Ok(DbState::Valid),
                Err(StorageError::NewerSchema { found, supported }) => {
                    Ok(DbState::NewerSchema { found, supported })
                }
                Err(StorageError::DatabaseAlreadyOpen) => Ok(DbState::Busy),
                Err(StorageError::Corrupt) => {
                    drop(db);
                    let _ = quarantine_corrupt_file(&path);
                    Ok(DbState::Corrupt)
                }
                Err(e) => Err(e),
            },
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => Ok(DbState::Busy),
            Err(e) if Self::is_corrupt_open_error(&e) => {
                let _ = quarantine_corrupt_file(&path);
                Ok(DbState::Corrupt)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_schema(db: &Database) -> Result<(), StorageError> {
        let write_tx = db.begin_write()?;
        {
            let mut meta = write_tx.open_table(META)?;
            let format: Option<String> = meta.get(META_FORMAT_KEY)?.map(|g| g.value().to_string());
            if format.is_none() {
                let schema_version = CURRENT_SCHEMA.to_string();
                let created_at = Utc::now().to_rfc3339();
                meta.insert(META_FORMAT_KEY, META_FORMAT_VALUE)?;
                meta.insert(META_SCHEMA_VERSION, schema_version.as_str())?;
                meta.insert(META_CREATED_AT, created_at.as_str())?;
            } else if format.as_deref() != Some(META_FORMAT_VALUE) {
                return Err(StorageError::Corrupt);
            }
        }
        let _ = write_tx.open_table(RANGES)?;
        let _ = write_tx.open_table(TRANSACTIONS)?;
        let _ = write_tx.open_table(TX_TIME_INDEX)?;
        let _ = write_tx.open_table(RELEVANT_ADDRESSES)?;
        let _ = write_tx.open_table(INTERNAL_TXS)?;
        let _ = write_tx.open_table(TOKEN_TRANSFERS)?;
        let _ = write_tx.open_table(RECEIPTS)?;
        write_tx.commit()?;

        let read_tx = db.begin_read()?;
        let meta = read_tx.open_table(META)?;
        let schema_version = meta
            .get(META_SCHEMA_VERSION)?
            .and_then(|g| g.value().parse::<u32>().ok())
            .unwrap_or(0);
        if schema_version == 0 {
            return Err(StorageError::Corrupt);
        }
        if schema_version > CURRENT_SCHEMA {
            return Err(StorageError::NewerSchema {
                found: schema_version,
                supported: CURRENT_SCHEMA,
            });
        }
        if schema_version != CURRENT_SCHEMA {
            return Err(StorageError::Corrupt);
        }
        Ok(())
    }

    fn write_transactions(
        write_tx: &WriteTransaction,
        records: &[Transaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        let mut txs = write_tx.open_table(TRANSACTIONS)?;
        let mut index = write_tx.open_table(TX_TIME_INDEX)?;
        let mut links = write_tx.open_table(RELEVANT_ADDRESSES)?;
        let mut inserted = 0;
        for tx in records {
            let key = tx.hash.as_bytes();
            let exists = txs.get(key)?.is_some();
            if !exists {
                let value = encode_record(tx)?;
                txs.insert(key, value.as_slice())?;
                index.insert(time_index_key(tx.timestamp, &tx.hash).as_slice(), ())?;
                inserted += 1;
            }
            if let Some(address) = relevant_address {
                links.insert(relevant_key(address, &tx.hash).as_slice(), ())?;
            }
        }
        Ok(inserted)
    }

    fn write_internal_transactions(
        write_tx: &WriteTransaction,
        records: &[InternalTransaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        let txs = write_tx.open_table(TRANSACTIONS)?;
        let mut internals = write_tx.open_table(INTERNAL_TXS)?;
        let mut links = write_tx.open_table(RELEVANT_ADDRESSES)?;
        let mut inserted = 0;
        for record in records {
            let parent_known = txs.get(record.parent_hash.as_bytes())?.is_some();
            if !parent_known {
                return Err(StorageError::MissingParent(record.parent_hash));
            }
            let key = internal_key(&record.parent_hash, &record.trace_id);
            let exists = internals.get(key.as_slice())?.is_some();
            if !exists {
                let value = encode_record(record)?;
                internals.insert(key.as_slice(), value.as_slice())?;
                inserted += 1;
            }
            if let Some(address) = relevant_address {
                links.insert(relevant_key(address, &record.parent_hash).as_slice(), ())?;
            }
        }
        Ok(inserted)
    }

    fn write_token_transfers(
        write_tx: &WriteTransaction,
        records: &[TokenTransfer],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        let txs = write_tx.open_table(TRANSACTIONS)?;
        let mut transfers = write_tx.open_table(TOKEN_TRANSFERS)?;
        let mut links = write_tx.open_table(RELEVANT_ADDRESSES)?;
        let mut inserted = 0;
        for record in records {
            let key = record.tx_hash.as_bytes();
            let parent_known = txs.get(key)?.is_some();
            if !parent_known {
                return Err(StorageError::MissingParent(record.tx_hash));
            }
            let exists = transfers.get(key)?.is_some();
            if !exists {
                let value = encode_record(record)?;
                transfers.insert(key, value.as_slice())?;
                inserted += 1;
            }
            if let Some(address) = relevant_address {
                links.insert(relevant_key(address, &record.tx_hash).as_slice(), ())?;
            }
        }
        Ok(inserted)
    }

    fn write_coverage(
        write_tx: &WriteTransaction,
        key: &ResourceKey,
        range: TimeRange,
    ) -> Result<(), StorageError> {
        let storage_key = key.storage_key();
        let mut table = write_tx.open_table(RANGES)?;
        let current = match table.get(storage_key.as_str())? {
            Some(guard) => decode_ranges(guard.value())?,
            None => Vec::new(),
        };
        let merged = ranges::coalesce(&current, range);
        if merged != current {
            let value = encode_ranges(&merged)?;
            table.insert(storage_key.as_str(), value.as_slice())?;
        }
        let ts = Utc::now().to_rfc3339();
        let mut meta = write_tx.open_table(META)?;
        meta.insert(META_LAST_SYNC_AT, ts.as_str())?;
        Ok(())
    }

    fn write_batch(
        write_tx: &WriteTransaction,
        batch: &BatchWrite,
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        match batch {
            BatchWrite::Transactions(records) => {
                Self::write_transactions(write_tx, records, relevant_address)
            }
            BatchWrite::InternalTransactions(records) => {
                Self::write_internal_transactions(write_tx, records, relevant_address)
            }
            BatchWrite::TokenTransfers(records) => {
                Self::write_token_transfers(write_tx, records, relevant_address)
            }
        }
    }

    fn read_record<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static [u8], &'static [u8]>,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(table)?;
        let record = match table.get(key)? {
            Some(guard) => Some(decode_record(guard.value())?),
            None => None,
        };
        Ok(record)
    }

    fn linked_hashes(&self, addresses: &[Address]) -> Result<HashSet<TxHash>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let links = read_tx.open_table(RELEVANT_ADDRESSES)?;
        let mut out = HashSet::new();
        for address in addresses {
            let (start, end) = relevant_bounds(address);
            for row in links.range(start.as_slice()..=end.as_slice())? {
                let (k, _) = row?;
                let hash = hash_from_relevant_key(k.value()).ok_or(StorageError::MalformedKey {
                    table: "relevant_addresses",
                })?;
                out.insert(hash);
            }
        }
        Ok(out)
    }

    fn hashes_in_time_order(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<TxHash>, StorageError> {
        if from > to {
            return Ok(Vec::new());
        }
        let (start, end) = time_index_bounds(from, to);
        let read_tx = self.db.begin_read()?;
        let index = read_tx.open_table(TX_TIME_INDEX)?;
        let mut out = Vec::new();
        for row in index.range(start.as_slice()..=end.as_slice())? {
            let (k, _) = row?;
            let (_, hash) = split_time_index_key(k.value()).ok_or(StorageError::MalformedKey {
                table: "tx_time_index",
            })?;
            out.push(hash);
        }
        Ok(out)
    }

    fn page<T>(items: impl Iterator<Item = T>, filter: &TransactionFilter) -> Vec<T> {
        let items = items.skip(filter.offset);
        match filter.limit {
            Some(limit) => items.take(limit).collect(),
            None => items.collect(),
        }
    }
}

impl RangeTracker for RedbSyncStore {
    fn coverage(&self, key: &ResourceKey) -> Result<Vec<TimeRange>, StorageError> {
        let storage_key = key.storage_key();
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RANGES)?;
        let covered = match table.get(storage_key.as_str())? {
            Some(guard) => decode_ranges(guard.value())?,
            None => Vec::new(),
        };
        Ok(covered)
    }

    fn mark_covered(&self, key: &ResourceKey, range: TimeRange) -> Result<(), StorageError> {
        let write_tx = self.db.begin_write()?;
        Self::write_coverage(&write_tx, key, range)?;
        write_tx.commit()?;
        Ok(())
    }
}

impl TransactionStore for RedbSyncStore {
    fn has_transaction(&self, hash: &TxHash) -> Result<bool, StorageError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(TRANSACTIONS)?;
        let exists = table.get(hash.as_bytes())?.is_some();
        Ok(exists)
    }

    fn has_receipt(&self, hash: &TxHash) -> Result<bool, StorageError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RECEIPTS)?;
        let exists = table.get(hash.as_bytes())?.is_some();
        Ok(exists)
    }

    fn put_transactions(
        &self,
        records: &[Transaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        let write_tx = self.db.begin_write()?;
        let inserted = Self::write_transactions(&write_tx, records, relevant_address)?;
        write_tx.commit()?;
        Ok(inserted)
    }

    fn put_internal_transactions(
        &self,
        records: &[InternalTransaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        let write_tx = self.db.begin_write()?;
        let inserted = Self::write_internal_transactions(&write_tx, records, relevant_address)?;
        write_tx.commit()?;
        Ok(inserted)
    }

    fn put_token_transfers(
        &self,
        records: &[TokenTransfer],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        let write_tx = self.db.begin_write()?;
        let inserted = Self::write_token_transfers(&write_tx, records, relevant_address)?;
        write_tx.commit()?;
        Ok(inserted)
    }

    fn put_receipt(&self, receipt: &Receipt) -> Result<(), StorageError> {
        let write_tx = self.db.begin_write()?;
        {
            let txs = write_tx.open_table(TRANSACTIONS)?;
            let parent_known = txs.get(receipt.tx_hash.as_bytes())?.is_some();
            if !parent_known {
                return Err(StorageError::MissingParent(receipt.tx_hash));
            }
            let mut receipts = write_tx.open_table(RECEIPTS)?;
            let value = encode_record(receipt)?;
            receipts.insert(receipt.tx_hash.as_bytes(), value.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn transaction_timestamp(&self, hash: &TxHash) -> Result<Option<Timestamp>, StorageError> {
        Ok(self.get_transaction(hash)?.map(|tx| tx.timestamp))
    }

    fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>, StorageError> {
        self.read_record(TRANSACTIONS, hash.as_bytes())
    }

    fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, StorageError> {
        self.read_record(RECEIPTS, hash.as_bytes())
    }

    fn internal_transactions_of(
        &self,
        parent: &TxHash,
    ) -> Result<Vec<InternalTransaction>, StorageError> {
        let (start, end) = internal_bounds(parent);
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(INTERNAL_TXS)?;
        let mut out = Vec::new();
        for row in table.range(start.as_slice()..=end.as_slice())? {
            let (_, v) = row?;
            out.push(decode_record::<InternalTransaction>(v.value())?);
        }
        out.sort_by_cached_key(|record| trace_order(&record.trace_id));
        Ok(out)
    }

    fn token_transfer(&self, hash: &TxHash) -> Result<Option<TokenTransfer>, StorageError> {
        self.read_record(TOKEN_TRANSFERS, hash.as_bytes())
    }

    fn hashes_missing_receipt(&self, limit: usize) -> Result<Vec<TxHash>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let read_tx = self.db.begin_read()?;
        let index = read_tx.open_table(TX_TIME_INDEX)?;
        let receipts = read_tx.open_table(RECEIPTS)?;
        let mut out = Vec::new();
        for row in index.iter()? {
            let (k, _) = row?;
            let (_, hash) = split_time_index_key(k.value()).ok_or(StorageError::MalformedKey {
                table: "tx_time_index",
            })?;
            let has_receipt = receipts.get(hash.as_bytes())?.is_some();
            if !has_receipt {
                out.push(hash);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn query_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<Transaction>, usize), StorageError> {
        let mut hashes = match filter.tx_hash {
            Some(hash) => match self.transaction_timestamp(&hash)? {
                Some(ts) if filter.matches_time(ts) => vec![hash],
                _ => Vec::new(),
            },
            None => self.hashes_in_time_order(
                filter.from_ts.unwrap_or(0),
                filter.to_ts.unwrap_or(Timestamp::MAX),
            )?,
        };
        if filter.order == SortOrder::Descending {
            hashes.reverse();
        }

        let Some(addresses) = filter.addresses.as_deref() else {
            let total = hashes.len();
            let mut out = Vec::new();
            for hash in Self::page(hashes.into_iter(), filter) {
                if let Some(tx) = self.get_transaction(&hash)? {
                    out.push(tx);
                }
            }
            return Ok((out, total));
        };

        let linked = self.linked_hashes(addresses)?;
        let mut matching = Vec::new();
        for hash in hashes {
            let Some(tx) = self.get_transaction(&hash)? else {
                continue;
            };
            if linked.contains(&hash) || addresses.iter().any(|a| tx.involves(a)) {
                matching.push(tx);
            }
        }
        let total = matching.len();
        Ok((Self::page(matching.into_iter(), filter), total))
    }
}

/// `0_10` sorts after `0_9`; non-numeric segments sort last.
fn trace_order(trace_id: &str) -> Vec<u64> {
    trace_id
        .split('_')
        .map(|segment| segment.parse().unwrap_or(u64::MAX))
        .collect()
}

impl SyncStore for RedbSyncStore {
    fn commit_batch(
        &self,
        key: &ResourceKey,
        batch: &BatchWrite,
        covered: Option<TimeRange>,
    ) -> Result<usize, StorageError> {
        let write_tx = self.db.begin_write()?;
        let inserted = Self::write_batch(&write_tx, batch, Some(&key.address))?;
        if let Some(range) = covered {
            Self::write_coverage(&write_tx, key, range)?;
        }
        write_tx.commit()?;
        Ok(inserted)
    }
}
