#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::stream::{self, BoxStream, StreamExt};
use txsync_core::{
    Address, Category, InternalTransaction, Receipt, ResourceKey, TimeRange, Timestamp,
    TokenTransfer, Transaction, TransactionFilter, TxHash,
};
use txsync_engine::{
    ChainExplorer, EngineOptions, MessageAggregator, RemoteBatch, RemoteError, SyncEngine,
};
use txsync_persistence::{
    BatchWrite, RangeTracker, RedbSyncStore, StorageError, SyncStore, TransactionStore,
};

pub const ACCOUNT: Address = Address([0xa1; 20]);

pub fn addr(b: u8) -> Address {
    Address([b; 20])
}

pub fn hash(b: u8) -> TxHash {
    TxHash([b; 32])
}

pub fn tx(b: u8, timestamp: Timestamp) -> Transaction {
    Transaction {
        hash: hash(b),
        chain_id: 1,
        timestamp,
        block_number: timestamp / 12,
        from_address: ACCOUNT,
        to_address: Some(addr(0xb0)),
        value: 1_000_000_000_000_000_000,
        gas: 21_000,
        gas_price: 30_000_000_000,
        gas_used: 21_000,
        input_data: vec![],
        nonce: b as u64,
    }
}

/// Transaction sent by someone else; only linked to [`ACCOUNT`] through dependents.
pub fn foreign_tx(b: u8, timestamp: Timestamp) -> Transaction {
    Transaction {
        from_address: addr(0xee),
        to_address: Some(addr(0x70)),
        ..tx(b, timestamp)
    }
}

pub fn internal(parent: u8, trace_id: u32, timestamp: Timestamp) -> InternalTransaction {
    InternalTransaction {
        parent_hash: hash(parent),
        trace_id: trace_id.to_string(),
        timestamp,
        block_number: timestamp / 12,
        from_address: addr(0x70),
        to_address: Some(ACCOUNT),
        value: 5,
        is_error: false,
    }
}

pub fn transfer(parent: u8, timestamp: Timestamp) -> TokenTransfer {
    TokenTransfer {
        tx_hash: hash(parent),
        token: addr(0x70),
        from_address: addr(0xb0),
        to_address: ACCOUNT,
        value: 42,
        timestamp,
        block_number: timestamp / 12,
    }
}

pub fn receipt(b: u8) -> Receipt {
    Receipt {
        tx_hash: hash(b),
        contract_address: None,
        status: true,
        tx_type: 2,
        cumulative_gas_used: 21_000,
        logs: vec![],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Range(Category, TimeRange),
    ByHash(TxHash),
    Receipt(TxHash),
}

#[derive(Default)]
struct Dataset {
    transactions: Vec<Transaction>,
    internal: Vec<InternalTransaction>,
    transfers: Vec<TokenTransfer>,
    by_hash: HashMap<TxHash, Transaction>,
    receipts: HashMap<TxHash, Receipt>,
    /// Serve this many pages of the category, then fail.
    fail_after_pages: HashMap<Category, usize>,
    failing_hashes: HashSet<TxHash>,
    failing_receipts: HashMap<TxHash, RemoteError>,
    calls: Vec<Call>,
}

/// In-memory index paging records by timestamp.
pub struct FakeExplorer {
    page_size: usize,
    delay: Option<Duration>,
    data: Mutex<Dataset>,
}

impl FakeExplorer {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            delay: None,
            data: Mutex::new(Dataset::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn add_transactions(&self, records: impl IntoIterator<Item = Transaction>) {
        self.data.lock().unwrap().transactions.extend(records);
    }

    pub fn add_internal(&self, records: impl IntoIterator<Item = InternalTransaction>) {
        self.data.lock().unwrap().internal.extend(records);
    }

    pub fn add_transfers(&self, records: impl IntoIterator<Item = TokenTransfer>) {
        self.data.lock().unwrap().transfers.extend(records);
    }

    /// Make `tx` available to by-hash lookups without listing it in any range.
    pub fn add_lookup(&self, tx: Transaction) {
        self.data.lock().unwrap().by_hash.insert(tx.hash, tx);
    }

    pub fn add_receipt(&self, receipt: Receipt) {
        self.data
            .lock()
            .unwrap()
            .receipts
            .insert(receipt.tx_hash, receipt);
    }

    pub fn fail_after_pages(&self, category: Category, pages: usize) {
        self.data
            .lock()
            .unwrap()
            .fail_after_pages
            .insert(category, pages);
    }

    pub fn heal(&self) {
        let mut data = self.data.lock().unwrap();
        data.fail_after_pages.clear();
        data.failing_hashes.clear();
        data.failing_receipts.clear();
    }

    pub fn fail_lookup(&self, hash: TxHash) {
        self.data.lock().unwrap().failing_hashes.insert(hash);
    }

    pub fn fail_receipt(&self, hash: TxHash, error: RemoteError) {
        self.data
            .lock()
            .unwrap()
            .failing_receipts
            .insert(hash, error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.data.lock().unwrap().calls.clone()
    }

    pub fn range_calls(&self) -> Vec<(Category, TimeRange)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Range(category, window) => Some((category, window)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.data.lock().unwrap().calls.clear();
    }

    fn pages<T: Clone>(
        &self,
        records: &[T],
        timestamp: impl Fn(&T) -> Timestamp,
        window: TimeRange,
        wrap: impl Fn(Vec<T>) -> RemoteBatch,
    ) -> Vec<RemoteBatch> {
        let mut matching: Vec<T> = records
            .iter()
            .filter(|r| window.contains(timestamp(r)))
            .cloned()
            .collect();
        matching.sort_by_key(|r| timestamp(r));
        matching
            .chunks(self.page_size)
            .map(|chunk| wrap(chunk.to_vec()))
            .collect()
    }
}

fn unavailable(what: &str) -> RemoteError {
    RemoteError::Unavailable(format!("{what}: connection reset"))
}

#[async_trait::async_trait]
impl ChainExplorer for FakeExplorer {
    fn fetch_by_range(
        &self,
        _address: Address,
        category: Category,
        window: TimeRange,
    ) -> BoxStream<'_, Result<RemoteBatch, RemoteError>> {
        let mut data = self.data.lock().unwrap();
        data.calls.push(Call::Range(category, window));

        let pages = match category {
            Category::BaseTx => self.pages(
                &data.transactions,
                |r| r.timestamp,
                window,
                RemoteBatch::Transactions,
            ),
            Category::InternalTx => self.pages(
                &data.internal,
                |r| r.timestamp,
                window,
                RemoteBatch::InternalTransactions,
            ),
            Category::TokenTx => self.pages(
                &data.transfers,
                |r| r.timestamp,
                window,
                RemoteBatch::TokenTransfers,
            ),
        };

        let mut items: Vec<Result<RemoteBatch, RemoteError>> = pages.into_iter().map(Ok).collect();
        if let Some(&served) = data.fail_after_pages.get(&category) {
            items.truncate(served);
            items.push(Err(unavailable("page")));
        }

        let delay = self.delay;
        stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }

    async fn fetch_by_hash(&self, hash: &TxHash) -> Result<Transaction, RemoteError> {
        let mut data = self.data.lock().unwrap();
        data.calls.push(Call::ByHash(*hash));
        if data.failing_hashes.contains(hash) {
            return Err(unavailable("lookup"));
        }
        data.by_hash
            .get(hash)
            .or_else(|| data.transactions.iter().find(|t| t.hash == *hash))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("transaction {hash}")))
    }

    async fn fetch_receipt(&self, hash: &TxHash) -> Result<Receipt, RemoteError> {
        let mut data = self.data.lock().unwrap();
        data.calls.push(Call::Receipt(*hash));
        if let Some(error) = data.failing_receipts.get(hash) {
            return Err(error.clone());
        }
        data.receipts
            .get(hash)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("receipt of {hash}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    PutTransactions(Vec<TxHash>, Option<Address>),
    /// Parent hashes (or own hashes for base transactions) of a committed batch.
    Commit(Category, Vec<TxHash>, Option<TimeRange>),
    MarkCovered(Category, TimeRange),
}

/// Store double logging write order in front of a real redb store.
pub struct RecordingStore {
    inner: RedbSyncStore,
    ops: Mutex<Vec<StoreOp>>,
}

impl RecordingStore {
    pub fn new(inner: RedbSyncStore) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().unwrap().push(op);
    }
}

impl RangeTracker for RecordingStore {
    fn coverage(&self, key: &ResourceKey) -> Result<Vec<TimeRange>, StorageError> {
        self.inner.coverage(key)
    }

    fn mark_covered(&self, key: &ResourceKey, range: TimeRange) -> Result<(), StorageError> {
        self.record(StoreOp::MarkCovered(key.category, range));
        self.inner.mark_covered(key, range)
    }
}

impl TransactionStore for RecordingStore {
    fn has_transaction(&self, hash: &TxHash) -> Result<bool, StorageError> {
        self.inner.has_transaction(hash)
    }

    fn has_receipt(&self, hash: &TxHash) -> Result<bool, StorageError> {
        self.inner.has_receipt(hash)
    }

    fn put_transactions(
        &self,
        records: &[Transaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        self.record(StoreOp::PutTransactions(
            records.iter().map(|r| r.hash).collect(),
            relevant_address.copied(),
        ));
        self.inner.put_transactions(records, relevant_address)
    }

    fn put_internal_transactions(
        &self,
        records: &[InternalTransaction],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        self.inner.put_internal_transactions(records, relevant_address)
    }

    fn put_token_transfers(
        &self,
        records: &[TokenTransfer],
        relevant_address: Option<&Address>,
    ) -> Result<usize, StorageError> {
        self.inner.put_token_transfers(records, relevant_address)
    }

    fn put_receipt(&self, receipt: &Receipt) -> Result<(), StorageError> {
        self.inner.put_receipt(receipt)
    }

    fn transaction_timestamp(&self, hash: &TxHash) -> Result<Option<Timestamp>, StorageError> {
        self.inner.transaction_timestamp(hash)
    }

    fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>, StorageError> {
        self.inner.get_transaction(hash)
    }

    fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, StorageError> {
        self.inner.get_receipt(hash)
    }

    fn internal_transactions_of(
        &self,
        parent: &TxHash,
    ) -> Result<Vec<InternalTransaction>, StorageError> {
        self.inner.internal_transactions_of(parent)
    }

    fn token_transfer(&self, hash: &TxHash) -> Result<Option<TokenTransfer>, StorageError> {
        self.inner.token_transfer(hash)
    }

    fn hashes_missing_receipt(&self, limit: usize) -> Result<Vec<TxHash>, StorageError> {
        self.inner.hashes_missing_receipt(limit)
    }

    fn query_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<Transaction>, usize), StorageError> {
        self.inner.query_transactions(filter)
    }
}

impl SyncStore for RecordingStore {
    fn commit_batch(
        &self,
        key: &ResourceKey,
        batch: &BatchWrite,
        covered: Option<TimeRange>,
    ) -> Result<usize, StorageError> {
        let hashes = match batch {
            BatchWrite::Transactions(v) => v.iter().map(|r| r.hash).collect(),
            BatchWrite::InternalTransactions(v) => v.iter().map(|r| r.parent_hash).collect(),
            BatchWrite::TokenTransfers(v) => v.iter().map(|r| r.tx_hash).collect(),
        };
        self.record(StoreOp::Commit(key.category, hashes, covered));
        self.inner.commit_batch(key, batch, covered)
    }
}

pub fn open_redb() -> (tempfile::TempDir, RedbSyncStore) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = RedbSyncStore::open(&root).unwrap();
    (dir, store)
}

/// Engine over a recording redb store and `explorer`.
pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub explorer: Arc<FakeExplorer>,
    pub store: Arc<RecordingStore>,
    pub sink: Arc<MessageAggregator>,
    pub engine: SyncEngine,
}

pub fn harness(explorer: FakeExplorer) -> Harness {
    harness_with(explorer, EngineOptions::default())
}

pub fn harness_with(explorer: FakeExplorer, options: EngineOptions) -> Harness {
    let (dir, redb) = open_redb();
    let explorer = Arc::new(explorer);
    let store = Arc::new(RecordingStore::new(redb));
    let sink = Arc::new(MessageAggregator::new());
    let engine = SyncEngine::with_components(
        explorer.clone(),
        store.clone(),
        sink.clone(),
        options,
    );
    Harness {
        _dir: dir,
        explorer,
        store,
        sink,
        engine,
    }
}

pub fn coverage(store: &dyn SyncStore, category: Category) -> Vec<TimeRange> {
    store
        .coverage(&ResourceKey::new(category, ACCOUNT))
        .unwrap()
}
