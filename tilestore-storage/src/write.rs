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

//! Write path
//!
//! A Put makes the tile's OPS and the digest map cover every param and
//! digest of the batch before the first trace cell is written, so any cell a
//! reader can see is decodable.

use crate::rows::{offset_column, row_name, validate_digest, TRACE_FAMILY, TYPE_TRACE};
use crate::stats::StoreStatsAtomic;
use crate::store::Mutation;
use crate::tasks::with_timeout;
use crate::tiling::TileKey;
use crate::trace_store::ShardedTraceStore;
use chrono::{DateTime, Utc};
use tilestore_core::{
    validate_params, BatchFailure, DigestMap, DigestSet, Entry, OrderedParamSet, ParamSet, Result,
    TileStoreError,
};
use tracing::{debug, warn};

impl ShardedTraceStore {
    pub(crate) async fn put_entries(
        &self,
        commit_hash: &str,
        entries: &[Entry],
        ts: DateTime<Utc>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut param_set = ParamSet::new();
        let mut digest_set = DigestSet::new();
        for entry in entries {
            validate_params(&entry.params)?;
            validate_digest(&entry.digest)?;
            param_set.add_params(&entry.params);
            digest_set.insert(entry.digest.clone());
        }

        let position = self.history.index_of(commit_hash).await?;
        let (tile, offset) = self.window.tile_of(position)?;

        let ops = self.ops.update(tile, &param_set).await?;
        let digest_map = self.digests.ensure(&digest_set).await?;
        let still_missing = digest_map.delta(&digest_set);
        if !still_missing.is_empty() {
            return Err(TileStoreError::Corruption(format!(
                "digest map lacks {} digests after registration",
                still_missing.len()
            )));
        }

        let rows = self.create_put_mutations(entries, ts, tile, offset, &ops, &digest_map)?;
        self.apply_bulk_batched(rows, self.config.max_batch_size)
            .await?;

        StoreStatsAtomic::incr(&self.stats.puts);
        StoreStatsAtomic::add(&self.stats.entries_written, entries.len() as u64);
        debug!(
            commit = commit_hash,
            tile = %tile,
            offset,
            entries = entries.len(),
            "put complete"
        );
        Ok(())
    }

    /// One (row, mutation) per entry: write the digest id at the commit's
    /// column and drop older versions of that cell.
    pub(crate) fn create_put_mutations(
        &self,
        entries: &[Entry],
        ts: DateTime<Utc>,
        tile: TileKey,
        offset: usize,
        ops: &OrderedParamSet,
        digest_map: &DigestMap,
    ) -> Result<Vec<(String, Mutation)>> {
        let ts = ts.timestamp_millis();
        let column = offset_column(offset);

        entries
            .iter()
            .map(|entry| {
                let key = ops.encode_params_as_string(&entry.params)?;
                let row = row_name(self.config.shards, TYPE_TRACE, tile, &key);
                let id = digest_map.id(&entry.digest)?;

                let mut m = Mutation::new();
                m.set(TRACE_FAMILY, &column, ts, id.to_bytes().to_vec())
                    .delete_timestamp_range(TRACE_FAMILY, &column, 0, ts - 1);
                Ok((row, m))
            })
            .collect()
    }

    /// Apply rows in parallel batches of at most `batch_size`. Every batch
    /// runs to completion; all failed ranges are reported together.
    pub(crate) async fn apply_bulk_batched(
        &self,
        rows: Vec<(String, Mutation)>,
        batch_size: usize,
    ) -> Result<()> {
        let total_rows = rows.len();
        let mut batches = Vec::new();
        let mut rest = rows;
        let mut start = 0;
        while !rest.is_empty() {
            let tail = rest.split_off(batch_size.min(rest.len()));
            let chunk = std::mem::replace(&mut rest, tail);
            let end = start + chunk.len();

            let store = self.store.clone();
            let timeout = self.config.write_timeout();
            let handle = tokio::spawn(async move {
                with_timeout("apply bulk", timeout, store.apply_bulk(chunk)).await
            });
            batches.push((start, end, handle));
            start = end;
        }

        let total_batches = batches.len();
        let mut failures = Vec::new();
        for (start, end, handle) in batches {
            let reason = match handle.await {
                Ok(Ok(row_errors)) if row_errors.is_empty() => None,
                Ok(Ok(row_errors)) => Some(format!(
                    "{} rows rejected, first: row {}: {}",
                    row_errors.len(),
                    start + row_errors[0].index,
                    row_errors[0].reason
                )),
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("batch task failed: {}", e)),
            };
            match reason {
                None => StoreStatsAtomic::incr(&self.stats.batches_applied),
                Some(reason) => {
                    warn!(batch.start = start, batch.end = end, %reason, "write batch failed");
                    StoreStatsAtomic::incr(&self.stats.batches_failed);
                    failures.push(BatchFailure { start, end, reason });
                }
            }
        }

        if failures.is_empty() {
            debug!(rows = total_rows, batches = total_batches, "bulk write applied");
            Ok(())
        } else {
            Err(TileStoreError::BatchWrite {
                total_batches,
                failures,
            })
        }
    }
}
