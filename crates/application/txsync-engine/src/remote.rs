use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::debug;
use txsync_core::{
    Address, Category, InternalTransaction, Receipt, TimeRange, TokenTransfer, Transaction,
    TxHash,
};
use txsync_infra::{EtherscanApi, EtherscanError};

/// Recoverable failure of the remote source. Never corrupts local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum RemoteError {
    #[error("remote source unavailable: {0}")]
    Unavailable(String),
    #[error("remote source rate limited: {0}")]
    RateLimited(String),
    #[error("malformed remote response: {0}")]
    Malformed(String),
    #[error("{0} not found on remote source")]
    NotFound(String),
}

impl From<EtherscanError> for RemoteError {
    fn from(value: EtherscanError) -> Self {
        match value {
            EtherscanError::RateLimited(m) => Self::RateLimited(m),
            EtherscanError::Transport(m) | EtherscanError::Rejected(m) => Self::Unavailable(m),
            EtherscanError::Malformed(m) => Self::Malformed(m),
        }
    }
}

/// One page of records for a single category.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteBatch {
    Transactions(Vec<Transaction>),
    InternalTransactions(Vec<InternalTransaction>),
    TokenTransfers(Vec<TokenTransfer>),
}

impl RemoteBatch {
    /// Highest block number in the batch.
    pub fn last_block(&self) -> Option<u64> {
        match self {
            RemoteBatch::Transactions(v) => v.iter().map(|r| r.block_number).max(),
            RemoteBatch::InternalTransactions(v) => v.iter().map(|r| r.block_number).max(),
            RemoteBatch::TokenTransfers(v) => v.iter().map(|r| r.block_number).max(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RemoteBatch::Transactions(v) => v.len(),
            RemoteBatch::InternalTransactions(v) => v.len(),
            RemoteBatch::TokenTransfers(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records outside `window`; block resolution only approximates time bounds.
    pub fn retain_within(&mut self, window: TimeRange) {
        match self {
            RemoteBatch::Transactions(v) => v.retain(|r| window.contains(r.timestamp)),
            RemoteBatch::InternalTransactions(v) => v.retain(|r| window.contains(r.timestamp)),
            RemoteBatch::TokenTransfers(v) => v.retain(|r| window.contains(r.timestamp)),
        }
    }
}

#[async_trait::async_trait]
pub trait ChainExplorer: Send + Sync {
    /// Lazily page through `category` records of `address` within `window`, oldest first.
    fn fetch_by_range(
        &self,
        address: Address,
        category: Category,
        window: TimeRange,
    ) -> BoxStream<'_, Result<RemoteBatch, RemoteError>>;

    async fn fetch_by_hash(&self, hash: &TxHash) -> Result<Transaction, RemoteError>;

    async fn fetch_receipt(&self, hash: &TxHash) -> Result<Receipt, RemoteError>;
}

enum PageCursor {
    Resolve,
    Page { blocks: (u64, u64), page: u32 },
    /// One block holds more rows than a block span can page through.
    Overfull { block: u64 },
    Done,
}

/// Explorer backed by an Etherscan-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct EtherscanExplorer {
    api: EtherscanApi,
}

impl EtherscanExplorer {
    pub fn new(api: EtherscanApi) -> Self {
        Self { api }
    }

    async fn fetch_page(
        &self,
        address: &Address,
        category: Category,
        blocks: (u64, u64),
        page: u32,
    ) -> Result<RemoteBatch, RemoteError> {
        Ok(match category {
            Category::BaseTx => {
                RemoteBatch::Transactions(self.api.transactions_page(address, blocks, page).await?)
            }
            Category::InternalTx => RemoteBatch::InternalTransactions(
                self.api
                    .internal_transactions_page(address, blocks, page)
                    .await?,
            ),
            Category::TokenTx => RemoteBatch::TokenTransfers(
                self.api.token_transfers_page(address, blocks, page).await?,
            ),
        })
    }

    async fn next_page(
        &self,
        address: Address,
        category: Category,
        window: TimeRange,
        cursor: PageCursor,
    ) -> Result<Option<(RemoteBatch, PageCursor)>, RemoteError> {
        let (blocks, page) = match cursor {
            PageCursor::Done => return Ok(None),
            PageCursor::Resolve => match self.api.block_span(window.start, window.end).await? {
                Some(blocks) => (blocks, 1),
                None => return Ok(None),
            },
            PageCursor::Page { blocks, page } => (blocks, page),
            PageCursor::Overfull { block } => {
                return Err(RemoteError::Unavailable(format!(
                    "more than {} {category} in block {block}",
                    self.api.result_window()
                )))
            }
        };

        let mut batch = self.fetch_page(&address, category, blocks, page).await?;
        let page_size = self.api.page_size();
        let next_page_end = u64::from(page + 1) * u64::from(page_size);
        // A short page is the last one.
        let next = if batch.len() < page_size as usize {
            PageCursor::Done
        } else if next_page_end > u64::from(self.api.result_window()) {
            // The next page lies past the result window: restart from the last block seen.
            // Rows of that block come again and are skipped by the store.
            match batch.last_block() {
                Some(last) if last > blocks.0 => {
                    debug!(
                        %address,
                        %category,
                        from_block = last,
                        "result window exhausted, restarting"
                    );
                    PageCursor::Page {
                        blocks: (last, blocks.1),
                        page: 1,
                    }
                }
                _ => PageCursor::Overfull { block: blocks.0 },
            }
        } else {
            PageCursor::Page {
                blocks,
                page: page + 1,
            }
        };
        batch.retain_within(window);
        Ok(Some((batch, next)))
    }
}

#[async_trait::async_trait]
impl ChainExplorer for EtherscanExplorer {
    fn fetch_by_range(
        &self,
        address: Address,
        category: Category,
        window: TimeRange,
    ) -> BoxStream<'_, Result<RemoteBatch, RemoteError>> {
        stream::try_unfold(PageCursor::Resolve, move |cursor| {
            self.next_page(address, category, window, cursor)
        })
        .boxed()
    }

    async fn fetch_by_hash(&self, hash: &TxHash) -> Result<Transaction, RemoteError> {
        self.api
            .transaction_by_hash(hash)
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("transaction {hash}")))
    }

    async fn fetch_receipt(&self, hash: &TxHash) -> Result<Receipt, RemoteError> {
        self.api
            .transaction_receipt(hash)
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("receipt of {hash}")))
    }
}
