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

//! Wide-column store abstraction
//!
//! The engine needs only a handful of primitives from its backing store:
//! point and prefix reads with a latest-version filter, per-row conditional
//! mutations, unconditional bulk mutations and an atomic counter. Every cell
//! carries an explicit millisecond timestamp; a column may hold several
//! versions, newest first.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tilestore_core::Result;

/// Cell version timestamp in milliseconds since the Unix epoch
pub type Timestamp = i64;

/// One version of one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub family: String,
    pub column: String,
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

/// Cells of a row, ordered by (family, column) then newest version first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub cells: Vec<Cell>,
}

impl Row {
    /// Cells of a single family
    pub fn family<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells.iter().filter(move |c| c.family == family)
    }

    /// Newest version of a column
    pub fn latest(&self, family: &str, column: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .filter(|c| c.family == family && c.column == column)
            .max_by_key(|c| c.timestamp)
    }
}

/// Version filter applied by reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFilter {
    /// Only the newest version of each column
    #[default]
    LatestOnly,
    AllVersions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    /// Write a version. Replaces an existing version with the same timestamp.
    Set {
        family: String,
        column: String,
        timestamp: Timestamp,
        value: Vec<u8>,
    },
    /// Drop versions with `start <= timestamp < end`
    DeleteTimestampRange {
        family: String,
        column: String,
        start: Timestamp,
        end: Timestamp,
    },
}

/// Ordered list of operations applied atomically to one row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    ops: Vec<MutationOp>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        family: &str,
        column: &str,
        timestamp: Timestamp,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(MutationOp::Set {
            family: family.to_string(),
            column: column.to_string(),
            timestamp,
            value: value.into(),
        });
        self
    }

    pub fn delete_timestamp_range(
        &mut self,
        family: &str,
        column: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> &mut Self {
        self.ops.push(MutationOp::DeleteTimestampRange {
            family: family.to_string(),
            column: column.to_string(),
            start,
            end,
        });
        self
    }

    pub fn ops(&self) -> &[MutationOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Condition evaluated against the current row before a conditional mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Any version of the column exists
    ColumnExists { family: String, column: String },
    /// The newest version of the column holds exactly `value`
    LatestValueEquals {
        family: String,
        column: String,
        value: Vec<u8>,
    },
}

/// A row of a bulk write that the store rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Position of the row in the bulk request
    pub index: usize,
    pub reason: String,
}

#[async_trait]
pub trait WideColumnStore: Send + Sync {
    /// Read one row. `None` if the row has no cells.
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>>;

    /// Stream every row whose key starts with `prefix`, in key order
    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>>;

    /// Evaluate `predicate` on the row and atomically apply `if_true` or
    /// `if_false`. Returns whether the predicate matched.
    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool>;

    /// Apply mutations to many rows. Each row is atomic on its own; the
    /// returned list names the rows that failed.
    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>>;

    /// Atomically add `delta` to a big-endian u64 counter cell and return
    /// the new value
    async fn increment_counter(
        &self,
        key: &str,
        family: &str,
        column: &str,
        delta: u64,
    ) -> Result<u64>;
}
