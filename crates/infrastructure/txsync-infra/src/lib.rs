pub mod etherscan;
pub mod net;

// Re-exports for convenience
pub use etherscan::{EtherscanApi, EtherscanError, ExplorerOptions, ListAction};
pub use net::{HttpError, RateLimitedClient};
