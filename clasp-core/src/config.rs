//! Engine tunables. The host owns loading and merging; this crate only
//! defines the shape and the defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::correlator::RetryPolicy;
use crate::transfer::TransferOptions;

/// Knobs for request retries and file transfers. Deserializable from any
/// self-describing format the host picks; absent fields take the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Send attempts per request before it times out (default 3).
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,
    /// Timeout for the first attempt, doubling per retry (default 5000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Recoverable block failures tolerated at one offset (default 3).
    #[serde(default = "default_block_retry_budget")]
    pub block_retry_budget: u32,
    /// Floor for new-sync block-size negotiation (default 256).
    #[serde(default = "default_min_block_size")]
    pub min_block_size: u32,
    /// Request new-sync file blocks outside the sealed channel (default true).
    #[serde(default = "default_plaintext_file_blocks")]
    pub plaintext_file_blocks: bool,
}

fn default_request_attempts() -> u32 {
    3
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_block_retry_budget() -> u32 {
    3
}
fn default_min_block_size() -> u32 {
    256
}
fn default_plaintext_file_blocks() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_attempts: default_request_attempts(),
            request_timeout_ms: default_request_timeout_ms(),
            block_retry_budget: default_block_retry_budget(),
            min_block_size: default_min_block_size(),
            plaintext_file_blocks: default_plaintext_file_blocks(),
        }
    }
}

impl Config {
    pub fn request_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.request_attempts.max(1),
            timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            retry_budget: self.block_retry_budget,
            min_block_size: self.min_block_size.max(1),
            plaintext_blocks: self.plaintext_file_blocks,
        }
    }
}
