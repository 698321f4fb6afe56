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

//! Fixtures and fault-injecting stores shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tilestore_core::{Commit, Entry, Params, Result, TileStoreError, TraceStoreConfig};
use tilestore_storage::{
    InMemoryCommitHistory, InMemoryStore, Mutation, Predicate, ReadFilter, Row, RowError,
    ShardedTraceStore, WideColumnStore,
};

pub fn base_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000, 0).unwrap()
}

/// History of `n` commits `c0..c{n-1}`, one second apart
pub fn history(n: usize) -> Arc<InMemoryCommitHistory> {
    let h = InMemoryCommitHistory::new();
    for i in 0..n {
        h.push(Commit {
            hash: format!("c{}", i),
            author: format!("author{}@example.com", i % 3),
            commit_time: base_time() + Duration::seconds(i as i64),
        })
        .unwrap();
    }
    Arc::new(h)
}

pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn entry(pairs: &[(&str, &str)], digest: &str) -> Entry {
    Entry {
        params: params(pairs),
        digest: digest.to_string(),
    }
}

/// Route engine logs through the test harness. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn trace_store(
    tile_size: u32,
    n_commits: usize,
    store: Arc<dyn WideColumnStore>,
) -> ShardedTraceStore {
    init_tracing();
    ShardedTraceStore::new(
        TraceStoreConfig::for_testing(tile_size),
        store,
        history(n_commits),
    )
    .unwrap()
}

pub fn deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + std::time::Duration::from_secs(10)
}

/// Yields to the scheduler before every call so concurrent writers
/// interleave between reading state and writing it back
pub struct YieldingStore {
    pub inner: Arc<InMemoryStore>,
}

#[async_trait]
impl WideColumnStore for YieldingStore {
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>> {
        tokio::task::yield_now().await;
        self.inner.read_row(key, filter).await
    }

    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>> {
        self.inner.read_rows(prefix, filter)
    }

    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner
            .apply_conditional(key, predicate, if_true, if_false)
            .await
    }

    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>> {
        self.inner.apply_bulk(rows).await
    }

    async fn increment_counter(&self, key: &str, family: &str, column: &str, delta: u64) -> Result<u64> {
        tokio::task::yield_now().await;
        self.inner.increment_counter(key, family, column, delta).await
    }
}

/// Reports the first `losses` conditional writes on OPS rows as lost races
/// without applying them
pub struct CasLosingStore {
    pub inner: Arc<InMemoryStore>,
    pub losses: AtomicU32,
}

impl CasLosingStore {
    pub fn new(inner: Arc<InMemoryStore>, losses: u32) -> Self {
        Self {
            inner,
            losses: AtomicU32::new(losses),
        }
    }

    fn take_loss(&self) -> bool {
        self.losses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WideColumnStore for CasLosingStore {
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>> {
        self.inner.read_row(key, filter).await
    }

    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>> {
        self.inner.read_rows(prefix, filter)
    }

    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool> {
        if key.starts_with(":o:") && self.take_loss() {
            // A lost CAS does not match; a lost create finds the row taken.
            return Ok(matches!(predicate, Predicate::ColumnExists { .. }));
        }
        self.inner
            .apply_conditional(key, predicate, if_true, if_false)
            .await
    }

    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>> {
        self.inner.apply_bulk(rows).await
    }

    async fn increment_counter(&self, key: &str, family: &str, column: &str, delta: u64) -> Result<u64> {
        self.inner.increment_counter(key, family, column, delta).await
    }
}

/// Fails bulk writes of exactly `fail_len` rows, either outright or by
/// rejecting every row
pub struct FailingBulkStore {
    pub inner: Arc<InMemoryStore>,
    pub fail_len: usize,
    pub reject_rows: bool,
}

#[async_trait]
impl WideColumnStore for FailingBulkStore {
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>> {
        self.inner.read_row(key, filter).await
    }

    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>> {
        self.inner.read_rows(prefix, filter)
    }

    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool> {
        self.inner
            .apply_conditional(key, predicate, if_true, if_false)
            .await
    }

    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>> {
        if rows.len() != self.fail_len {
            return self.inner.apply_bulk(rows).await;
        }
        if self.reject_rows {
            return Ok((0..rows.len())
                .map(|index| RowError {
                    index,
                    reason: "resource exhausted".into(),
                })
                .collect());
        }
        Err(TileStoreError::Store("unavailable".into()))
    }

    async fn increment_counter(&self, key: &str, family: &str, column: &str, delta: u64) -> Result<u64> {
        self.inner.increment_counter(key, family, column, delta).await
    }
}

/// Sleeps before every point read
pub struct SlowStore {
    pub inner: Arc<InMemoryStore>,
    pub delay: std::time::Duration,
}

#[async_trait]
impl WideColumnStore for SlowStore {
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_row(key, filter).await
    }

    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>> {
        self.inner.read_rows(prefix, filter)
    }

    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool> {
        self.inner
            .apply_conditional(key, predicate, if_true, if_false)
            .await
    }

    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>> {
        self.inner.apply_bulk(rows).await
    }

    async fn increment_counter(&self, key: &str, family: &str, column: &str, delta: u64) -> Result<u64> {
        self.inner.increment_counter(key, family, column, delta).await
    }
}

/// Fails every prefix scan that starts with `prefix`, e.g. one shard's
/// trace rows
pub struct FailingScanStore {
    pub inner: Arc<InMemoryStore>,
    pub prefix: String,
}

impl FailingScanStore {
    pub fn new(inner: Arc<InMemoryStore>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl WideColumnStore for FailingScanStore {
    async fn read_row(&self, key: &str, filter: ReadFilter) -> Result<Option<Row>> {
        self.inner.read_row(key, filter).await
    }

    fn read_rows(&self, prefix: &str, filter: ReadFilter) -> BoxStream<'static, Result<Row>> {
        if prefix.starts_with(&self.prefix) {
            let err = TileStoreError::Store(format!("scan of {} failed", prefix));
            return futures::stream::iter(vec![Err(err)]).boxed();
        }
        self.inner.read_rows(prefix, filter)
    }

    async fn apply_conditional(
        &self,
        key: &str,
        predicate: Predicate,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Result<bool> {
        self.inner
            .apply_conditional(key, predicate, if_true, if_false)
            .await
    }

    async fn apply_bulk(&self, rows: Vec<(String, Mutation)>) -> Result<Vec<RowError>> {
        self.inner.apply_bulk(rows).await
    }

    async fn increment_counter(&self, key: &str, family: &str, column: &str, delta: u64) -> Result<u64> {
        self.inner.increment_counter(key, family, column, delta).await
    }
}
