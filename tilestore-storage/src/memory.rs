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

//! In-memory wide-column store
//!
//! Backs tests and the replay CLI. Rows live in one ordered map behind a
//! `parking_lot::RwLock`; every primitive takes the lock once, which makes
//! each row mutation atomic.

use crate::store::{
    Cell, Mutation, MutationOp, Predicate, ReadFilter, Row, RowError, Timestamp, WideColumnStore,
};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tilestore_core::{Result, TileStoreError};

/// (family, column)
type ColumnKey = (String, String);

/// Versions of a column, newest first
type Versions = Vec<(Timestamp, Vec<u8>)>;

#[derive(Debug, Default)]
struct StoredRow {
    columns: BTreeMap<ColumnKey, Versions>,
}

impl StoredRow {
    fn to_row(&self, key: &str, filter: ReadFilter) -> Row {
        let mut cells = Vec::new();
        for ((family, column), versions) in &self.columns {
            let take = match filter {
                ReadFilter::LatestOnly => 1,
                ReadFilter::AllVersions => versions.len(),
            };
            for (ts, value) in versions.iter().take(take) {
                cells.push(Cell {
                    family: family.clone(),
                    column: column.clone(),
                    timestamp: *ts,
                    value: value.clone(),
                });
            }
        }
        Row {
            key: key.to_string(),
            cells,
        }
    }

    fn latest(&self, family: &str, column: &str) -> Option<&[u8]> {
        self.columns
            .get(&(family.to_string(), column.to_string()))
            .and_then(|v| v.first())
            .map(|(_, value)| value.as_slice())
    }

    fn matches(&self, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::ColumnExists { family, column } => self.latest(family, column).is_some(),
            Predicate::LatestValueEquals {
                family,
                column,
                value,
            } => self.latest(family, column) == Some(value.as_slice()),
        }
    }

    fn apply(&mut self, mutation: &Mutation) {
        for op in mutation.ops() {
            match op {
                MutationOp::Set {
                    family,
                    column,
                    timestamp,
                    value,
                } => {
                    let versions = self
                        .columns
                        .entry((family.clone(), column.clone()))
                        .or_default();
                    versions.retain(|(ts, _)| ts != timestamp);
                    let at = versions.partition_point(|(ts, _)| ts > timestamp);
                    versions.insert(at, (*timestamp, value.clone()));
                }
                MutationOp::DeleteTimestampRange {
                    family,
                    column,
                    start,
                    end,
                } => {
                    let key = (family.clone(), column.clone());
                    if let Some(versions) = self.columns.get_mut(&key) {
                        versions.retain(|(ts, _)| ts < start || ts >= end);
                        if versions.is_empty() {
                            self.columns.remove(&key);
                        }
                    }
                }
            }
        }
    }
}

/// Process-local [`WideColumnStore`]
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: RwLock<BTreeMap<String, StoredRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty rows
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Every version of every column in a row, for inspection in tests
    pub fn dump_row(&self, key: &str) -> Option<Row> {
        self.rows
            .read()
            .get(key)
            .map(|r| r.to_row(key, ReadFilter::AllVersions))
    }

    fn mutate(rows: &mut BTreeMap<String, StoredRow>, key: &str, mutation: &Mutation) {
        let row = rows.entry(key.to_string()).or_default();
        row.apply(mutation);
        if row.columns.is_empty() {
            rows.remove(key);
        }
    }
}

#[async_trait]
impl WideColumnStore for InMemoryStore {
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>> {
        Ok(self.rows.read().get(key).map(|r| r.to_row(key, filter)))
    }

    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>> {
        let rows: Vec<Result<Row>> = self
            .rows
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| Ok(r.to_row(k, filter)))
            .collect();
        stream::iter(rows).boxed()
    }

    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool> {
        let mut rows = self.rows.write();
        let matched = rows.get(key).map_or(false, |r| r.matches(&predicate));
        let chosen = if matched { if_true } else { if_false };
        if let Some(mutation) = chosen {
            Self::mutate(&mut rows, key, &mutation);
        }
        Ok(matched)
    }

    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>> {
        let mut stored = self.rows.write();
        for (key, mutation) in &rows {
            Self::mutate(&mut stored, key, mutation);
        }
        Ok(Vec::new())
    }

    async fn increment_counter(
        &self,
        key: &str,
        family: &str,
        column: &str,
        delta: u64,
    ) -> Result<u64> {
        let mut rows = self.rows.write();
        let current = match rows.get(key).and_then(|r| r.latest(family, column)) {
            None => 0,
            Some(bytes) if bytes.len() == 8 => BigEndian::read_u64(bytes),
            Some(bytes) => {
                return Err(TileStoreError::Corruption(format!(
                    "counter {}:{}:{} holds {} bytes",
                    key,
                    family,
                    column,
                    bytes.len()
                )))
            }
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| TileStoreError::Store(format!("counter {} overflow", key)))?;

        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, next);
        let mut m = Mutation::new();
        m.delete_timestamp_range(family, column, 0, Timestamp::MAX)
            .set(family, column, 0, buf.to_vec());
        Self::mutate(&mut rows, key, &m);
        Ok(next)
    }
}
