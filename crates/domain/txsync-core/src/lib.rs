use std::fmt;

use serde::{Deserialize, Serialize};

pub mod primitives;
pub mod ranges;

pub use primitives::{decode_hex, parse_hex_quantity, Address, ParseError, Topic, TxHash};
pub use ranges::TimeRange;

/// UNIX timestamp in seconds.
pub type Timestamp = u64;

/// Independently paginated transaction category of the remote index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    BaseTx,
    InternalTx,
    TokenTx,
}

impl Category {
    /// Sync order: dependents come after the base timeline.
    pub const ALL: [Category; 3] = [Category::BaseTx, Category::InternalTx, Category::TokenTx];

    pub fn range_prefix(self) -> &'static str {
        match self {
            Category::BaseTx => "ethtxs",
            Category::InternalTx => "ethinternaltxs",
            Category::TokenTx => "ethtokentxs",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::BaseTx => "transactions",
            Category::InternalTx => "internal transactions",
            Category::TokenTx => "token transfers",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One independent synchronization timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub category: Category,
    pub address: Address,
}

impl ResourceKey {
    pub fn new(category: Category, address: Address) -> Self {
        Self { category, address }
    }

    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.category.range_prefix(), self.address)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    pub chain_id: u64,
    pub timestamp: Timestamp,
    pub block_number: u64,
    pub from_address: Address,
    /// `None` for contract creation.
    pub to_address: Option<Address>,
    #[serde(with = "primitives::dec_u128")]
    pub value: u128,
    pub gas: u64,
    #[serde(with = "primitives::dec_u128")]
    pub gas_price: u128,
    pub gas_used: u64,
    #[serde(with = "primitives::hex_bytes")]
    pub input_data: Vec<u8>,
    pub nonce: u64,
}

impl Transaction {
    pub fn involves(&self, address: &Address) -> bool {
        self.from_address == *address || self.to_address.as_ref() == Some(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTransaction {
    pub parent_hash: TxHash,
    /// Call path inside the parent trace, e.g. `0_1`. Unique per parent.
    pub trace_id: String,
    pub timestamp: Timestamp,
    pub block_number: u64,
    pub from_address: Address,
    pub to_address: Option<Address>,
    #[serde(with = "primitives::dec_u128")]
    pub value: u128,
    /// The call reverted; its value never moved.
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub tx_hash: TxHash,
    pub token: Address,
    pub from_address: Address,
    pub to_address: Address,
    #[serde(with = "primitives::dec_u128")]
    pub value: u128,
    /// As reported by the index; coverage follows the parent transaction instead.
    pub timestamp: Timestamp,
    pub block_number: u64,
}

/// A record that can only be stored once its parent transaction exists.
pub trait DependentRecord {
    fn parent_hash(&self) -> TxHash;
}

impl DependentRecord for InternalTransaction {
    fn parent_hash(&self) -> TxHash {
        self.parent_hash
    }
}

impl DependentRecord for TokenTransfer {
    fn parent_hash(&self) -> TxHash {
        self.tx_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLog {
    pub log_index: u64,
    pub address: Address,
    pub topics: Vec<Topic>,
    #[serde(with = "primitives::hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub contract_address: Option<Address>,
    pub status: bool,
    pub tx_type: u8,
    pub cumulative_gas_used: u64,
    pub logs: Vec<ReceiptLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Read-side filter over stored transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    /// `None` means every tracked account.
    pub addresses: Option<Vec<Address>>,
    pub from_ts: Option<Timestamp>,
    pub to_ts: Option<Timestamp>,
    pub tx_hash: Option<TxHash>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order: SortOrder,
}

impl TransactionFilter {
    pub fn for_hash(hash: TxHash) -> Self {
        Self {
            tx_hash: Some(hash),
            ..Self::default()
        }
    }

    pub fn for_addresses(addresses: Vec<Address>) -> Self {
        Self {
            addresses: Some(addresses),
            ..Self::default()
        }
    }

    pub fn with_range(mut self, from_ts: Option<Timestamp>, to_ts: Option<Timestamp>) -> Self {
        self.from_ts = from_ts;
        self.to_ts = to_ts;
        self
    }

    pub fn with_limit(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches_time(&self, ts: Timestamp) -> bool {
        self.from_ts.is_none_or(|from| ts >= from) && self.to_ts.is_none_or(|to| ts <= to)
    }
}
