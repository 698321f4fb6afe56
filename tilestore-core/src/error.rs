// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error taxonomy for the trace store.
//!
//! Four families of failure surface to callers:
//!
//! - **Not found**: unknown commits or digests.
//! - **Corruption**: stored data that cannot be decoded. Always fatal.
//! - **Transient store errors**: I/O, timeouts. Surfaced, never retried internally.
//! - **Partial batch writes**: some mutation batches of a Put failed.
//!
//! Schema races are resolved internally and only surface as [`TileStoreError::Contention`]
//! when the retry cap is exhausted.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, TileStoreError>;

/// A failed half-open row range `[start, end)` of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub start: usize,
    pub end: usize,
    pub reason: String,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.start, self.end, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum TileStoreError {
    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Commit index out of range: {0}")]
    CommitIndexOutOfRange(usize),

    #[error("No commits found")]
    NoCommits,

    #[error("Digest not found: {0}")]
    DigestNotFound(String),

    #[error("Corrupted digest id - never registered: {0}")]
    UnknownDigestId(u64),

    #[error("Corrupted trace key {key}: {reason}")]
    CorruptTraceKey { key: String, reason: String },

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Read deadline exceeded")]
    DeadlineExceeded,

    #[error("{} of {total_batches} write batches failed: {}", failures.len(), format_failures(failures))]
    BatchWrite {
        total_batches: usize,
        failures: Vec<BatchFailure>,
    },

    #[error("Gave up on {operation} after {attempts} conflicting attempts")]
    Contention { operation: String, attempts: u32 },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Invalid digest: {0:?}")]
    InvalidDigest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TileStoreError {
    /// Whether replaying the whole operation may succeed.
    ///
    /// Put is idempotent per (trace, commit, timestamp), so every transient
    /// failure of a write can be answered by retrying the entire call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TileStoreError::Store(_)
                | TileStoreError::Timeout { .. }
                | TileStoreError::DeadlineExceeded
                | TileStoreError::BatchWrite { .. }
                | TileStoreError::Contention { .. }
        )
    }

    /// Whether the error indicates stored data that cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TileStoreError::UnknownDigestId(_)
                | TileStoreError::CorruptTraceKey { .. }
                | TileStoreError::Corruption(_)
        )
    }
}

impl From<bincode::Error> for TileStoreError {
    fn from(e: bincode::Error) -> Self {
        TileStoreError::Serialization(e.to_string())
    }
}

fn format_failures(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
