use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use txsync_core::{
    Address, Category, DependentRecord, ResourceKey, TimeRange, Timestamp, Transaction,
    TransactionFilter,
};
use txsync_infra::EtherscanApi;
use txsync_persistence::{BatchWrite, StorageError, SyncStore};

use crate::notify::MessageSink;
use crate::remote::{ChainExplorer, EtherscanExplorer, RemoteBatch, RemoteError};
use crate::report::{CategoryReport, SyncFailure, SyncReport};
use crate::EngineError;

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Accounts synced by [`SyncEngine::query`] when the filter names no address.
    pub tracked_accounts: Vec<Address>,
}

/// Keeps the local store consistent with a remote transaction index, one gap at a time.
pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    pub(crate) remote: Arc<dyn ChainExplorer>,
    pub(crate) sink: Arc<dyn MessageSink>,
    options: EngineOptions,
    sync_lock: Mutex<()>,
    pub(crate) receipt_lock: Mutex<()>,
}

/// Dependent records whose parents are stored, up to the first unresolvable one.
struct Resolved<R> {
    records: Vec<R>,
    last_ts: Option<Timestamp>,
    failure: Option<RemoteError>,
}

impl SyncEngine {
    pub fn new(api: EtherscanApi, store: Arc<dyn SyncStore>, sink: Arc<dyn MessageSink>) -> Self {
        Self::with_components(
            Arc::new(EtherscanExplorer::new(api)),
            store,
            sink,
            EngineOptions::default(),
        )
    }

    pub fn with_components(
        remote: Arc<dyn ChainExplorer>,
        store: Arc<dyn SyncStore>,
        sink: Arc<dyn MessageSink>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            remote,
            sink,
            options,
            sync_lock: Mutex::new(()),
            receipt_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Sync all categories of `address` over `[start, end]`.
    ///
    /// Remote failures stop the affected category, are reported to the message sink and
    /// recorded in the returned report. Only local store faults are returned as errors.
    pub async fn sync_address(
        &self,
        address: Address,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<SyncReport, EngineError> {
        let _guard = self.sync_lock.lock().await;
        self.sync_address_unlocked(address, start, end).await
    }

    async fn sync_address_unlocked(
        &self,
        address: Address,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport {
            address,
            start,
            end,
            categories: Vec::with_capacity(Category::ALL.len()),
        };
        if start > end {
            debug!(%address, start, end, "empty sync window");
            return Ok(report);
        }

        for category in Category::ALL {
            let key = ResourceKey::new(category, address);
            report
                .categories
                .push(self.sync_category(&key, start, end).await?);
        }
        Ok(report)
    }

    /// Fetch every gap of `key` within `[start, end]`, stopping at the first remote failure.
    pub(crate) async fn sync_category(
        &self,
        key: &ResourceKey,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<CategoryReport, StorageError> {
        let mut report = CategoryReport::new(key.category);
        let gaps = self.store.gaps(key, start, end)?;
        report.gaps_found = gaps.len();
        if gaps.is_empty() {
            debug!(%key, start, end, "window already covered");
            return Ok(report);
        }

        for gap in gaps {
            match self.sync_gap(key, gap, &mut report).await {
                Ok(()) => report.gaps_completed += 1,
                Err(EngineError::Remote(error)) => {
                    warn!(%key, %gap, %error, "sync stopped by remote failure");
                    self.sink.add_error(format!(
                        "Failed to sync {} of {} in {gap}: {error}",
                        key.category, key.address
                    ));
                    report.failure = Some(SyncFailure { window: gap, error });
                    return Ok(report);
                }
                Err(EngineError::Store(e)) => return Err(e),
            }
        }

        self.store.mark_covered(key, TimeRange::new(start, end))?;
        info!(
            %key,
            gaps = report.gaps_completed,
            records = report.records_stored,
            parents = report.parents_fetched,
            "category synced"
        );
        Ok(report)
    }

    async fn sync_gap(
        &self,
        key: &ResourceKey,
        gap: TimeRange,
        report: &mut CategoryReport,
    ) -> Result<(), EngineError> {
        let mut batches = self.remote.fetch_by_range(key.address, key.category, gap);
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            self.commit_remote_batch(key, gap, batch, report).await?;
        }
        Ok(())
    }

    /// Resolve parents, then store the batch and advance coverage up to the last stored record.
    async fn commit_remote_batch(
        &self,
        key: &ResourceKey,
        gap: TimeRange,
        batch: RemoteBatch,
        report: &mut CategoryReport,
    ) -> Result<(), EngineError> {
        let (write, last_ts, failure) = match batch {
            RemoteBatch::Transactions(records) => {
                let last_ts = records.iter().map(|tx| tx.timestamp).max();
                (BatchWrite::Transactions(records), last_ts, None)
            }
            RemoteBatch::InternalTransactions(records) => {
                let resolved = self.resolve_parents(key.address, records, report).await?;
                (
                    BatchWrite::InternalTransactions(resolved.records),
                    resolved.last_ts,
                    resolved.failure,
                )
            }
            RemoteBatch::TokenTransfers(records) => {
                let resolved = self.resolve_parents(key.address, records, report).await?;
                (
                    BatchWrite::TokenTransfers(resolved.records),
                    resolved.last_ts,
                    resolved.failure,
                )
            }
        };

        // Parent timestamps may precede the gap; those records never move coverage.
        let covered = last_ts
            .filter(|ts| *ts >= gap.start)
            .map(|ts| TimeRange::new(gap.start, gap.clamp(ts)));

        if !write.is_empty() {
            let stored = self.store.commit_batch(key, &write, covered)?;
            report.batches_committed += 1;
            report.records_stored += stored;
            debug!(
                %key,
                records = write.len(),
                stored,
                watermark = covered.map(|c| c.end),
                "batch committed"
            );
        }

        match failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Store missing parents of `records` in order, stopping at the first one the remote
    /// cannot deliver. Watermark timestamps come from the parents.
    async fn resolve_parents<R: DependentRecord + Send>(
        &self,
        address: Address,
        records: Vec<R>,
        report: &mut CategoryReport,
    ) -> Result<Resolved<R>, StorageError> {
        let mut resolved = Resolved {
            records: Vec::with_capacity(records.len()),
            last_ts: None,
            failure: None,
        };

        for record in records {
            let parent = record.parent_hash();
            let parent_ts = match self.store.transaction_timestamp(&parent)? {
                Some(ts) => ts,
                None => match self.remote.fetch_by_hash(&parent).await {
                    Ok(tx) => {
                        self.store
                            .put_transactions(std::slice::from_ref(&tx), Some(&address))?;
                        report.parents_fetched += 1;
                        debug!(%address, %parent, timestamp = tx.timestamp, "parent fetched");
                        tx.timestamp
                    }
                    Err(error) => {
                        warn!(%address, %parent, %error, "parent lookup failed");
                        resolved.failure = Some(error);
                        break;
                    }
                },
            };
            resolved.last_ts = resolved.last_ts.max(Some(parent_ts));
            resolved.records.push(record);
        }
        Ok(resolved)
    }

    /// Sync every address of `filter` (or every tracked account) and read the store.
    ///
    /// Returns the matching page plus the total number of matches ignoring limit and offset.
    pub async fn query(
        &self,
        filter: &TransactionFilter,
        only_cache: bool,
    ) -> Result<(Vec<Transaction>, usize), EngineError> {
        let _guard = self.sync_lock.lock().await;

        if !only_cache {
            let start = filter.from_ts.unwrap_or(0);
            let end = filter.to_ts.unwrap_or_else(now);
            let addresses = filter
                .addresses
                .as_deref()
                .unwrap_or(&self.options.tracked_accounts);
            for address in addresses {
                self.sync_address_unlocked(*address, start, end).await?;
            }
        }

        let mut filter = filter.clone();
        if filter.addresses.is_none() && !self.options.tracked_accounts.is_empty() {
            filter.addresses = Some(self.options.tracked_accounts.clone());
        }
        Ok(self.store.query_transactions(&filter)?)
    }

    /// Stored coverage of every category of `address`.
    pub fn coverage(
        &self,
        address: Address,
    ) -> Result<Vec<(Category, Vec<TimeRange>)>, EngineError> {
        Category::ALL
            .into_iter()
            .map(|category| {
                let ranges = self.store.coverage(&ResourceKey::new(category, address))?;
                Ok((category, ranges))
            })
            .collect()
    }
}

fn now() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}
