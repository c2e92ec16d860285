//! Etherscan-compatible explorer API.
//!
//! Account endpoints answer with a `{status, message, result}` envelope, proxy endpoints with a
//! JSON-RPC body. Both are unwrapped here into domain records; pagination and time windows are
//! left to the caller.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use txsync_core::{
    decode_hex, parse_hex_quantity, Address, InternalTransaction, ParseError, Receipt, ReceiptLog,
    Timestamp, TokenTransfer, Topic, Transaction, TxHash,
};

use crate::net::{HttpError, RateLimitedClient};

/// Upper block bound used when a time cannot be resolved to a block yet.
const LATEST_BLOCK: u64 = 99_999_999;

#[derive(Debug, Clone)]
pub struct ExplorerOptions {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chain_id: u64,
    pub page_size: u32,
    /// Deepest row reachable by paging one block span.
    pub result_window: u32,
    pub requests_per_second: u32,
    pub timeout_secs: u64,
}

impl Default for ExplorerOptions {
    fn default() -> Self {
        Self {
            base_url: txsync_config::ETHERSCAN_API_URL.to_string(),
            api_key: None,
            chain_id: 1,
            page_size: txsync_config::DEFAULT_PAGE_SIZE,
            result_window: txsync_config::MAX_RESULT_WINDOW,
            requests_per_second: txsync_config::DEFAULT_REQUESTS_PER_SECOND,
            timeout_secs: txsync_config::DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EtherscanError {
    #[error("explorer rate limit reached: {0}")]
    RateLimited(String),
    #[error("explorer unreachable: {0}")]
    Transport(String),
    #[error("explorer rejected the request: {0}")]
    Rejected(String),
    #[error("malformed explorer response: {0}")]
    Malformed(String),
}

impl From<HttpError> for EtherscanError {
    fn from(value: HttpError) -> Self {
        match value {
            HttpError::Status(StatusCode::TOO_MANY_REQUESTS) => {
                Self::RateLimited(StatusCode::TOO_MANY_REQUESTS.to_string())
            }
            HttpError::Status(status) => Self::Transport(format!("HTTP {status}")),
            HttpError::Transport(e) => Self::Transport(e.to_string()),
            HttpError::Decode(e) => Self::Malformed(e.to_string()),
        }
    }
}

impl From<ParseError> for EtherscanError {
    fn from(value: ParseError) -> Self {
        Self::Malformed(value.to_string())
    }
}

impl From<serde_json::Error> for EtherscanError {
    fn from(value: serde_json::Error) -> Self {
        Self::Malformed(value.to_string())
    }
}

/// Paginated account list endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAction {
    Transactions,
    InternalTransactions,
    TokenTransfers,
}

impl ListAction {
    pub fn action(self) -> &'static str {
        match self {
            ListAction::Transactions => "txlist",
            ListAction::InternalTransactions => "txlistinternal",
            ListAction::TokenTransfers => "tokentx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closest {
    Before,
    After,
}

impl Closest {
    fn as_str(self) -> &'static str {
        match self {
            Closest::Before => "before",
            Closest::After => "after",
        }
    }
}

#[derive(Deserialize)]
struct AccountEnvelope {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
    // Throttled proxy calls come back in the account envelope shape.
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    block_number: String,
    time_stamp: String,
    hash: String,
    nonce: String,
    from: String,
    #[serde(default)]
    to: String,
    value: String,
    gas: String,
    gas_price: String,
    #[serde(default)]
    gas_used: String,
    #[serde(default)]
    input: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInternalTransaction {
    block_number: String,
    time_stamp: String,
    hash: String,
    from: String,
    #[serde(default)]
    to: String,
    value: String,
    #[serde(default)]
    contract_address: String,
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    is_error: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenTransfer {
    block_number: String,
    time_stamp: String,
    hash: String,
    from: String,
    to: String,
    value: String,
    contract_address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRpcTransaction {
    hash: String,
    block_number: Option<String>,
    from: String,
    to: Option<String>,
    value: String,
    gas: String,
    #[serde(default)]
    gas_price: Option<String>,
    #[serde(default)]
    input: String,
    nonce: String,
    #[serde(default)]
    chain_id: Option<String>,
}

#[derive(Deserialize)]
struct RawRpcBlock {
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRpcReceipt {
    transaction_hash: String,
    #[serde(default)]
    contract_address: Option<String>,
    cumulative_gas_used: String,
    #[serde(default)]
    gas_used: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "type", default)]
    tx_type: Option<String>,
    #[serde(default)]
    logs: Vec<RawRpcLog>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRpcLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
    log_index: String,
}

fn is_rate_limit_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("too many")
}

fn parse_dec_u64(field: &str, s: &str) -> Result<u64, ParseError> {
    s.trim()
        .parse()
        .map_err(|e| ParseError::Integer(format!("{field}={s}: {e}")))
}

fn parse_dec_u128(field: &str, s: &str) -> Result<u128, ParseError> {
    s.trim()
        .parse()
        .map_err(|e| ParseError::Integer(format!("{field}={s}: {e}")))
}

fn parse_hex_u64(field: &str, s: &str) -> Result<u64, ParseError> {
    let v = parse_hex_quantity(s)?;
    u64::try_from(v).map_err(|_| ParseError::Integer(format!("{field}={s}: out of range")))
}

fn parse_optional_address(s: Option<&str>) -> Result<Option<Address>, ParseError> {
    match s.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => Ok(Some(s.parse()?)),
    }
}

impl RawTransaction {
    fn into_transaction(self, chain_id: u64) -> Result<Transaction, ParseError> {
        Ok(Transaction {
            hash: self.hash.parse()?,
            chain_id,
            timestamp: parse_dec_u64("timeStamp", &self.time_stamp)?,
            block_number: parse_dec_u64("blockNumber", &self.block_number)?,
            from_address: self.from.parse()?,
            to_address: parse_optional_address(Some(&self.to))?,
            value: parse_dec_u128("value", &self.value)?,
            gas: parse_dec_u64("gas", &self.gas)?,
            gas_price: parse_dec_u128("gasPrice", &self.gas_price)?,
            gas_used: if self.gas_used.is_empty() {
                0
            } else {
                parse_dec_u64("gasUsed", &self.gas_used)?
            },
            input_data: decode_hex(&self.input)?,
            nonce: parse_dec_u64("nonce", &self.nonce)?,
        })
    }
}

/// Rows without a trace id get one derived from the call itself, so the same call maps to
/// the same id on every page and every run.
fn decode_internal_rows(
    rows: Vec<RawInternalTransaction>,
) -> Result<Vec<InternalTransaction>, ParseError> {
    rows.into_iter()
        .map(|raw| {
            let to_address = match parse_optional_address(Some(&raw.to))? {
                Some(to) => Some(to),
                None => parse_optional_address(Some(&raw.contract_address))?,
            };
            let from_address: Address = raw.from.parse()?;
            let value = parse_dec_u128("value", &raw.value)?;
            let trace_id = match raw.trace_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    let to = to_address.map(|a| a.to_string()).unwrap_or_default();
                    format!("call:{from_address}:{to}:{value}")
                }
            };
            Ok(InternalTransaction {
                parent_hash: raw.hash.parse()?,
                trace_id,
                timestamp: parse_dec_u64("timeStamp", &raw.time_stamp)?,
                block_number: parse_dec_u64("blockNumber", &raw.block_number)?,
                from_address,
                to_address,
                value,
                is_error: raw.is_error.trim() == "1",
            })
        })
        .collect()
}

impl RawTokenTransfer {
    fn into_transfer(self) -> Result<TokenTransfer, ParseError> {
        // uint256 amounts wider than u128 only come from pathological tokens.
        let value = parse_dec_u128("value", &self.value).unwrap_or_else(|_| {
            warn!(tx = %self.hash, value = %self.value, "token amount exceeds u128, saturating");
            u128::MAX
        });
        Ok(TokenTransfer {
            tx_hash: self.hash.parse()?,
            token: self.contract_address.parse()?,
            from_address: self.from.parse()?,
            to_address: self.to.parse()?,
            value,
            timestamp: parse_dec_u64("timeStamp", &self.time_stamp)?,
            block_number: parse_dec_u64("blockNumber", &self.block_number)?,
        })
    }
}

impl RawRpcReceipt {
    fn into_receipt(self) -> Result<Receipt, ParseError> {
        let logs = self
            .logs
            .into_iter()
            .map(|log| -> Result<ReceiptLog, ParseError> {
                Ok(ReceiptLog {
                    log_index: parse_hex_u64("logIndex", &log.log_index)?,
                    address: log.address.parse()?,
                    topics: log
                        .topics
                        .iter()
                        .map(|t| t.parse::<Topic>())
                        .collect::<Result<_, _>>()?,
                    data: decode_hex(&log.data)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Receipt {
            tx_hash: self.transaction_hash.parse()?,
            contract_address: parse_optional_address(self.contract_address.as_deref())?,
            // Pre-Byzantium receipts carry a state root instead of a status.
            status: match self.status.as_deref() {
                Some(s) => parse_hex_quantity(s)? == 1,
                None => true,
            },
            tx_type: match self.tx_type.as_deref() {
                Some(t) => u8::try_from(parse_hex_quantity(t)?)
                    .map_err(|_| ParseError::Integer(format!("type={t}: out of range")))?,
                None => 0,
            },
            cumulative_gas_used: parse_hex_u64("cumulativeGasUsed", &self.cumulative_gas_used)?,
            logs,
        })
    }
}

/// Thin client over the explorer HTTP API.
#[derive(Debug, Clone)]
pub struct EtherscanApi {
    http: RateLimitedClient,
    base_url: Url,
    api_key: Option<String>,
    chain_id: u64,
    page_size: u32,
    result_window: u32,
}

impl EtherscanApi {
    pub fn new(options: &ExplorerOptions) -> Result<Self, EtherscanError> {
        let http = RateLimitedClient::with_timeout(
            Duration::from_secs(options.timeout_secs),
            txsync_config::clamp_requests_per_second(options.requests_per_second),
        )?;
        Self::with_client(http, options)
    }

    pub fn with_client(
        http: RateLimitedClient,
        options: &ExplorerOptions,
    ) -> Result<Self, EtherscanError> {
        let base_url = Url::parse(&options.base_url).map_err(|e| {
            EtherscanError::Rejected(format!("invalid explorer url {}: {e}", options.base_url))
        })?;
        Ok(Self {
            http,
            base_url,
            api_key: options.api_key.clone().filter(|k| !k.is_empty()),
            chain_id: options.chain_id,
            page_size: txsync_config::clamp_page_size(options.page_size),
            result_window: options.result_window.min(txsync_config::MAX_RESULT_WINDOW),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn result_window(&self) -> u32 {
        self.result_window
    }

    fn params(&self, module: &str, action: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("module", module.to_string()), ("action", action.to_string())];
        if let Some(key) = &self.api_key {
            params.push(("apikey", key.clone()));
        }
        params
    }

    async fn account_call(&self, params: &[(&str, String)]) -> Result<Value, EtherscanError> {
        let envelope: AccountEnvelope = self.http.get_json(&self.base_url, params).await?;
        if envelope.status == "1" {
            return Ok(envelope.result);
        }
        if envelope.message.starts_with("No transactions found")
            || envelope.message.starts_with("No records found")
        {
            return Ok(Value::Array(Vec::new()));
        }
        let detail = match envelope.result {
            Value::String(s) if !s.is_empty() => s,
            _ => envelope.message,
        };
        if is_rate_limit_message(&detail) {
            Err(EtherscanError::RateLimited(detail))
        } else {
            Err(EtherscanError::Rejected(detail))
        }
    }

    async fn proxy_call(&self, params: &[(&str, String)]) -> Result<Value, EtherscanError> {
        let envelope: RpcEnvelope = self.http.get_json(&self.base_url, params).await?;
        if let Some(err) = envelope.error {
            return Err(if is_rate_limit_message(&err.message) {
                EtherscanError::RateLimited(err.message)
            } else {
                EtherscanError::Rejected(err.message)
            });
        }
        if envelope.status.as_deref() == Some("0") {
            let detail = match envelope.result {
                Value::String(s) => s,
                _ => envelope.message.unwrap_or_default(),
            };
            return Err(if is_rate_limit_message(&detail) {
                EtherscanError::RateLimited(detail)
            } else {
                EtherscanError::Rejected(detail)
            });
        }
        Ok(envelope.result)
    }

    fn decode<T: DeserializeOwned>(value: Value) -> Result<T, EtherscanError> {
        Ok(serde_json::from_value(value)?)
    }

    async fn block_by_time(
        &self,
        ts: Timestamp,
        closest: Closest,
    ) -> Result<Option<u64>, EtherscanError> {
        let mut params = self.params("block", "getblocknobytime");
        params.push(("timestamp", ts.to_string()));
        params.push(("closest", closest.as_str().to_string()));
        match self.account_call(&params).await {
            Ok(Value::String(s)) => Ok(Some(parse_dec_u64("blockNumber", &s)?)),
            Ok(other) => Err(EtherscanError::Malformed(format!(
                "unexpected block number {other}"
            ))),
            Err(EtherscanError::Rejected(msg)) if msg.contains("No closest block") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block span covering `[from, to]`, or `None` when `from` lies beyond the chain head.
    pub async fn block_span(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Option<(u64, u64)>, EtherscanError> {
        let Some(start) = self.block_by_time(from, Closest::After).await? else {
            return Ok(None);
        };
        let end = self
            .block_by_time(to, Closest::Before)
            .await?
            .unwrap_or(LATEST_BLOCK);
        if end < start {
            return Ok(None);
        }
        Ok(Some((start, end)))
    }

    async fn list_rows<T: DeserializeOwned>(
        &self,
        action: ListAction,
        address: &Address,
        blocks: (u64, u64),
        page: u32,
    ) -> Result<Vec<T>, EtherscanError> {
        let mut params = self.params("account", action.action());
        params.push(("address", address.to_string()));
        params.push(("startblock", blocks.0.to_string()));
        params.push(("endblock", blocks.1.to_string()));
        params.push(("page", page.to_string()));
        params.push(("offset", self.page_size.to_string()));
        params.push(("sort", "asc".to_string()));
        let result = self.account_call(&params).await?;
        let rows: Vec<T> = Self::decode(result)?;
        debug!(action = action.action(), %address, page, rows = rows.len(), "explorer page");
        Ok(rows)
    }

    pub async fn transactions_page(
        &self,
        address: &Address,
        blocks: (u64, u64),
        page: u32,
    ) -> Result<Vec<Transaction>, EtherscanError> {
        let rows: Vec<RawTransaction> = self
            .list_rows(ListAction::Transactions, address, blocks, page)
            .await?;
        rows.into_iter()
            .map(|r| r.into_transaction(self.chain_id).map_err(Into::into))
            .collect()
    }

    pub async fn internal_transactions_page(
        &self,
        address: &Address,
        blocks: (u64, u64),
        page: u32,
    ) -> Result<Vec<InternalTransaction>, EtherscanError> {
        let rows: Vec<RawInternalTransaction> = self
            .list_rows(ListAction::InternalTransactions, address, blocks, page)
            .await?;
        Ok(decode_internal_rows(rows)?)
    }

    pub async fn token_transfers_page(
        &self,
        address: &Address,
        blocks: (u64, u64),
        page: u32,
    ) -> Result<Vec<TokenTransfer>, EtherscanError> {
        let rows: Vec<RawTokenTransfer> = self
            .list_rows(ListAction::TokenTransfers, address, blocks, page)
            .await?;
        rows.into_iter()
            .map(|r| r.into_transfer().map_err(Into::into))
            .collect()
    }

    async fn raw_receipt(&self, hash: &TxHash) -> Result<Option<RawRpcReceipt>, EtherscanError> {
        let mut params = self.params("proxy", "eth_getTransactionReceipt");
        params.push(("txhash", hash.to_string()));
        match self.proxy_call(&params).await? {
            Value::Null => Ok(None),
            value => Ok(Some(Self::decode(value)?)),
        }
    }

    /// Mined transaction by hash; `None` when unknown or still pending.
    pub async fn transaction_by_hash(
        &self,
        hash: &TxHash,
    ) -> Result<Option<Transaction>, EtherscanError> {
        let mut params = self.params("proxy", "eth_getTransactionByHash");
        params.push(("txhash", hash.to_string()));
        let raw: RawRpcTransaction = match self.proxy_call(&params).await? {
            Value::Null => return Ok(None),
            value => Self::decode(value)?,
        };
        let Some(block_tag) = raw.block_number.clone() else {
            return Ok(None);
        };

        let mut params = self.params("proxy", "eth_getBlockByNumber");
        params.push(("tag", block_tag.clone()));
        params.push(("boolean", "false".to_string()));
        let block: RawRpcBlock = match self.proxy_call(&params).await? {
            Value::Null => {
                return Err(EtherscanError::Malformed(format!(
                    "block {block_tag} of {hash} not found"
                )))
            }
            value => Self::decode(value)?,
        };

        let gas_used = match self.raw_receipt(hash).await? {
            Some(receipt) => match receipt.gas_used.as_deref() {
                Some(g) => parse_hex_u64("gasUsed", g)?,
                None => 0,
            },
            None => 0,
        };

        Ok(Some(Transaction {
            hash: raw.hash.parse()?,
            chain_id: match raw.chain_id.as_deref() {
                Some(c) => parse_hex_u64("chainId", c)?,
                None => self.chain_id,
            },
            timestamp: parse_hex_u64("timestamp", &block.timestamp)?,
            block_number: parse_hex_u64("blockNumber", &block_tag)?,
            from_address: raw.from.parse()?,
            to_address: parse_optional_address(raw.to.as_deref())?,
            value: parse_hex_quantity(&raw.value)?,
            gas: parse_hex_u64("gas", &raw.gas)?,
            gas_price: match raw.gas_price.as_deref() {
                Some(p) => parse_hex_quantity(p)?,
                None => 0,
            },
            gas_used,
            input_data: decode_hex(&raw.input)?,
            nonce: parse_hex_u64("nonce", &raw.nonce)?,
        }))
    }

    /// Receipt by hash; `None` while the transaction is unknown or pending.
    pub async fn transaction_receipt(
        &self,
        hash: &TxHash,
    ) -> Result<Option<Receipt>, EtherscanError> {
        match self.raw_receipt(hash).await? {
            Some(raw) => Ok(Some(raw.into_receipt()?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_hex(b: u8) -> String {
        format!("0x{}", hex_byte(b).repeat(32))
    }

    fn addr_hex(b: u8) -> String {
        format!("0x{}", hex_byte(b).repeat(20))
    }

    fn hex_byte(b: u8) -> String {
        format!("{b:02x}")
    }

    fn raw_internal(parent: u8, trace_id: Option<&str>) -> RawInternalTransaction {
        RawInternalTransaction {
            block_number: "100".into(),
            time_stamp: "1000".into(),
            hash: hash_hex(parent),
            from: addr_hex(1),
            to: String::new(),
            value: "7".into(),
            contract_address: addr_hex(9),
            trace_id: trace_id.map(str::to_string),
            is_error: "0".into(),
        }
    }

    fn ids(rows: Vec<RawInternalTransaction>) -> Vec<String> {
        decode_internal_rows(rows)
            .unwrap()
            .into_iter()
            .map(|i| i.trace_id)
            .collect()
    }

    #[test]
    fn internal_trace_ids_keep_the_full_call_path() {
        let rows = vec![
            raw_internal(1, Some("0")),
            raw_internal(1, Some("0_1")),
            raw_internal(1, Some("1")),
        ];
        assert_eq!(ids(rows), vec!["0", "0_1", "1"]);

        let decoded = decode_internal_rows(vec![raw_internal(1, Some("0"))]).unwrap();
        // Contract creations report the created contract as recipient.
        assert_eq!(decoded[0].to_address, Some(Address([9; 20])));
        assert!(!decoded[0].is_error);
    }

    #[test]
    fn missing_trace_ids_do_not_depend_on_page_position() {
        let mut other_call = raw_internal(1, None);
        other_call.value = "8".into();

        let first_page = ids(vec![raw_internal(1, None)]);
        let second_page = ids(vec![other_call]);
        assert_ne!(first_page, second_page);

        // The same call decodes to the same id wherever it appears.
        let again = ids(vec![raw_internal(2, Some("3")), raw_internal(1, None)]);
        assert_eq!(again[1], first_page[0]);
    }

    #[test]
    fn reverted_internal_calls_are_flagged() {
        let mut row = raw_internal(1, Some("0_2"));
        row.is_error = "1".into();
        let decoded = decode_internal_rows(vec![row]).unwrap();
        assert!(decoded[0].is_error);
    }

    #[test]
    fn oversized_receipt_type_is_rejected() {
        let receipt = |tx_type: &str| RawRpcReceipt {
            transaction_hash: hash_hex(1),
            contract_address: None,
            cumulative_gas_used: "0x5208".into(),
            gas_used: None,
            status: Some("0x1".into()),
            tx_type: Some(tx_type.into()),
            logs: vec![],
        };
        assert_eq!(receipt("0x2").into_receipt().unwrap().tx_type, 2);
        assert!(matches!(
            receipt("0x102").into_receipt(),
            Err(ParseError::Integer(_))
        ));
    }

    #[test]
    fn rate_limit_messages_are_recognised() {
        assert!(is_rate_limit_message("Max rate limit reached"));
        assert!(is_rate_limit_message("Too many invalid api key attempts"));
        assert!(!is_rate_limit_message("Invalid API Key"));
    }
}
