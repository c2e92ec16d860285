use txsync_core::{
    ranges, Address, InternalTransaction, Receipt, ResourceKey, TimeRange, Timestamp,
    TokenTransfer, Transaction, TransactionFilter, TxHash,
};

use crate::StorageError;

pub const TXSYNC_REDB_FILENAME: &str = "txsync.redb";
pub const CURRENT_SCHEMA: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Missing,
    Valid,
    Busy,
    Corrupt,
    NewerSchema { found: u32, supported: u32 },
}

/// Records fetched for one category batch, written together with its watermark.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    Transactions(Vec<Transaction>),
    InternalTransactions(Vec<InternalTransaction>),
    TokenTransfers(Vec<TokenTransfer>),
}

impl BatchWrite {
    pub fn len(&self) -> usize {
        match self {
            BatchWrite::Transactions(v) => v.len(),
            BatchWrite::InternalTransactions(v) => v.len(),
            BatchWrite::TokenTransfers(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Persisted coverage per sync timeline.
pub trait RangeTracker: Send + Sync {
    fn coverage(&self, key: &ResourceKey) -> Result<Vec<TimeRange>, StorageError>;

    fn mark_covered(&self, key: &ResourceKey, range: TimeRange) -> Result<(), StorageError>;

    fn gaps(
        &self,
        key: &ResourceKey,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<TimeRange>, StorageError> {
        Ok(ranges::gaps(&self.coverage(key)?, start, end))
    }
}

/// Idempotent record storage. `put_*` calls return the number of newly inserted rows.
pub trait TransactionStore: Send + Sync {
    fn has_transaction(&self, hash: &TxHash) -> Result<bool, StorageError>;

    fn has_receipt(&self, hash: &TxHash) -> Result<bool, StorageError>;

    fn put_transactions(
        &self,
        records: &[Transaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError>;

    /// Fails with [`StorageError::MissingParent`] if any parent row is absent.
    fn put_internal_transactions(
        &self,
        records: &[InternalTransaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError>;

    /// Fails with [`StorageError::MissingParent`] if any parent row is absent.
    fn put_token_transfers(
        &self,
        records: &[TokenTransfer],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError>;

    fn put_receipt(&self, receipt: &Receipt) -> Result<(), StorageError>;

    fn transaction_timestamp(&self, hash: &TxHash) -> Result<Option<Timestamp>, StorageError>;

    fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>, StorageError>;

    fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, StorageError>;

    fn internal_transactions_of(
        &self,
        parent: &TxHash,
    ) -> Result<Vec<InternalTransaction>, StorageError>;

    fn token_transfer(&self, hash: &TxHash) -> Result<Option<TokenTransfer>, StorageError>;

    /// Oldest first.
    fn hashes_missing_receipt(&self, limit: usize) -> Result<Vec<TxHash>, StorageError>;

    /// Matching transactions plus the total match count ignoring limit and offset.
    fn query_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<Transaction>, usize), StorageError>;
}

pub trait SyncStore: RangeTracker + TransactionStore {
    /// Store a batch linked to `key.address` and extend coverage in one local transaction.
    fn commit_batch(
        &self,
        key: &ResourceKey,
        batch: &BatchWrite,
        covered: Option<TimeRange>,
    ) -> Result<usize, StorageError>;
}
