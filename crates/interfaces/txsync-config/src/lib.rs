//! Central configuration constants for runtime limits and defaults.

/// Etherscan-compatible API endpoint used when none is configured.
pub const ETHERSCAN_API_URL: &str = "https://api.etherscan.io/api";

/// Records requested per explorer page.
pub const DEFAULT_PAGE_SIZE: u32 = 1_000;

/// Minimum accepted page size.
pub const MIN_PAGE_SIZE: u32 = 1;

/// The explorer refuses pages larger than this.
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// The explorer refuses requests where `page * offset` exceeds this.
pub const MAX_RESULT_WINDOW: u32 = 10_000;

/// Free-tier explorer keys allow five calls per second.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;

/// Minimum allowed request rate.
pub const MIN_REQUESTS_PER_SECOND: u32 = 1;

/// Maximum allowed request rate.
pub const MAX_REQUESTS_PER_SECOND: u32 = 50;

/// Receipts fetched per backfill pass.
pub const DEFAULT_RECEIPT_BACKFILL_LIMIT: usize = 100;

/// HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TXSYNC_DATA_DIR";

/// Environment variable carrying the explorer API key.
pub const API_KEY_ENV: &str = "ETHERSCAN_API_KEY";

/// Clamp a page size into the accepted range.
pub fn clamp_page_size(v: u32) -> u32 {
    v.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

/// Clamp a request rate into the accepted range.
pub fn clamp_requests_per_second(v: u32) -> u32 {
    v.clamp(MIN_REQUESTS_PER_SECOND, MAX_REQUESTS_PER_SECOND)
}
