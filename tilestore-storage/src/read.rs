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

//! Read path
//!
//! A query window may span several storage tiles. Every tile in range is
//! loaded concurrently (its OPS plus one prefix scan per shard), together
//! with the digest map, and the decoded segments are spliced into one trace
//! matrix:
//!
//! ```text
//! tiles:    [ .... s####### ][ ########## ][ ####e .... ]
//! output:        [ seg 0    |    seg 1     |  seg 2 ]
//! ```

use crate::ops::OpsManager;
use crate::rows::{extract_subkey, shard_prefix, TRACE_FAMILY, TYPE_TRACE};
use crate::stats::StoreStatsAtomic;
use crate::store::{ReadFilter, WideColumnStore};
use crate::tasks::{fan_out, with_deadline};
use crate::tiling::TileKey;
use crate::trace_store::ShardedTraceStore;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tilestore_core::{
    Commit, DigestId, DigestMap, EncodedTrace, OrderedParamSet, ParamSet, Result, Tile,
    TileStoreError, TraceMap, TraceRepr,
};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Raw content of one storage tile
#[derive(Debug, Clone)]
pub struct EncodedTile {
    pub ops: Arc<OrderedParamSet>,
    /// encoded trace key -> one id per tile offset
    pub traces: HashMap<String, Vec<DigestId>>,
}

/// Everything needed to load a tile from inside a spawned task
#[derive(Clone)]
struct TileLoader {
    store: Arc<dyn WideColumnStore>,
    ops: Arc<OpsManager>,
    shards: u32,
    tile_size: usize,
}

impl TileLoader {
    /// OPS of a tile straight from the store
    async fn reread_ops(self, tile: TileKey) -> Result<Arc<OrderedParamSet>> {
        Ok(self.ops.refresh(tile).await?.0.ops)
    }

    async fn load_tile(self, tile: TileKey) -> Result<EncodedTile> {
        let (ops, traces) =
            tokio::try_join!(self.ops.get(tile), self.load_encoded_traces(tile))?;
        Ok(EncodedTile {
            ops: ops.0.ops,
            traces,
        })
    }

    async fn load_encoded_traces(&self, tile: TileKey) -> Result<HashMap<String, Vec<DigestId>>> {
        let tile_size = self.tile_size;
        let scans = (0..self.shards).map(|shard| {
            let mut rows = self
                .store
                .read_rows(&shard_prefix(shard, TYPE_TRACE, tile), ReadFilter::LatestOnly);
            async move {
                let mut found = HashMap::new();
                while let Some(row) = rows.try_next().await? {
                    let key = extract_subkey(&row.key)?.to_string();
                    let ids = found
                        .entry(key)
                        .or_insert_with(|| vec![DigestId::MISSING; tile_size]);
                    for cell in row.family(TRACE_FAMILY) {
                        let offset: usize = cell.column.parse().map_err(|_| {
                            TileStoreError::Corruption(format!(
                                "trace row {} has non-numeric column {:?}",
                                row.key, cell.column
                            ))
                        })?;
                        // Only happens if tile_size changed for an existing table.
                        let slot = ids.get_mut(offset).ok_or_else(|| {
                            TileStoreError::Corruption(format!(
                                "trace row {} has offset {} outside tile of {}",
                                row.key, offset, tile_size
                            ))
                        })?;
                        *slot = DigestId::from_bytes(&cell.value)?;
                    }
                }
                Ok::<_, TileStoreError>(found)
            }
        });

        // A trace always maps to the same shard, so shard results are disjoint.
        let mut merged = HashMap::new();
        for shard_traces in fan_out(scans.collect::<Vec<_>>()).await? {
            merged.extend(shard_traces);
        }
        Ok(merged)
    }
}

/// Decode and splice tiles (oldest first) into one matrix of `n_commits`.
/// The first tile starts at `start_offset`, the last ends at `end_offset`.
fn splice_tiles(
    tiles: &[EncodedTile],
    digest_map: &DigestMap,
    tile_size: usize,
    mut start_offset: usize,
    end_offset: usize,
    n_commits: usize,
) -> Result<(TraceMap, ParamSet)> {
    let mut traces = TraceMap::new();
    let mut param_set = ParamSet::new();

    let mut commit_idx = 0;
    for (i, tile) in tiles.iter().enumerate() {
        let last_offset = if i + 1 == tiles.len() {
            end_offset
        } else {
            tile_size - 1
        };
        let seg_len = last_offset + 1 - start_offset;

        for (key, ids) in &tile.traces {
            let repr = TraceRepr::Encoded(EncodedTrace {
                key: key.clone(),
                ids: ids.clone(),
            });
            let segment = repr.into_decoded(&tile.ops, digest_map, start_offset, seg_len)?;
            param_set.add_params(&segment.keys);

            let trace = traces.entry_or_empty(segment.id(), &segment.keys, n_commits);
            for (slot, digest) in trace.digests[commit_idx..]
                .iter_mut()
                .zip(segment.digests)
            {
                *slot = digest;
            }
        }

        commit_idx += seg_len;
        start_offset = 0;
    }

    param_set.normalize();
    Ok((traces, param_set))
}

impl ShardedTraceStore {
    fn loader(&self) -> TileLoader {
        TileLoader {
            store: self.store.clone(),
            ops: self.ops.clone(),
            shards: self.config.shards,
            tile_size: self.window.tile_size(),
        }
    }

    /// Load one tile's OPS and encoded traces
    pub async fn load_tile(&self, tile: TileKey) -> Result<EncodedTile> {
        self.loader().load_tile(tile).await
    }

    /// Traces between (`start_tile`, `start_offset`) and (`end_tile`,
    /// `end_offset`), both inclusive, with the union of the tiles' params.
    pub(crate) async fn get_traces_in_range(
        &self,
        start_tile: TileKey,
        end_tile: TileKey,
        start_offset: usize,
        end_offset: usize,
    ) -> Result<(TraceMap, ParamSet)> {
        let tile_size = self.window.tile_size();
        let n_commits = self.window.position_of(end_tile, end_offset)
            - self.window.position_of(start_tile, start_offset)
            + 1;

        let loader = self.loader();
        let keys: Vec<TileKey> = self
            .window
            .keys_oldest_first(start_tile, end_tile)
            .collect();
        let loads = keys
            .iter()
            .map(|&tile| loader.clone().load_tile(tile))
            .collect::<Vec<_>>();
        let (mut tiles, mut digest_map) = tokio::try_join!(fan_out(loads), self.digests.load())?;
        StoreStatsAtomic::add(&self.stats.tiles_read, tiles.len() as u64);

        let mut ops_reread = false;
        let mut digests_reloaded = false;
        loop {
            match splice_tiles(&tiles, &digest_map, tile_size, start_offset, end_offset, n_commits) {
                Err(TileStoreError::CorruptTraceKey { key, reason }) if !ops_reread => {
                    // A cached OPS can predate codes another process added to
                    // the tile; only the stored OPS is authoritative.
                    warn!(%key, %reason, "trace key not decodable with cached OPS, rereading");
                    let rereads = keys
                        .iter()
                        .map(|&tile| loader.clone().reread_ops(tile))
                        .collect::<Vec<_>>();
                    for (tile, ops) in tiles.iter_mut().zip(fan_out(rereads).await?) {
                        tile.ops = ops;
                    }
                    ops_reread = true;
                }
                Err(TileStoreError::UnknownDigestId(id)) if !digests_reloaded => {
                    // Cells written after the map was read; the map is always
                    // durable before the cells referencing it, so reload once.
                    warn!(id, "digest id not in map, reloading digest map");
                    digest_map = self.digests.load().await?;
                    digests_reloaded = true;
                }
                other => return other,
            }
        }
    }

    /// Commit metadata for hashes, in order
    pub(crate) async fn make_tile_commits(&self, hashes: &[String]) -> Result<Vec<Commit>> {
        let details = self.history.details_multi(hashes).await?;
        hashes
            .iter()
            .zip(details)
            .map(|(hash, commit)| commit.ok_or_else(|| TileStoreError::CommitNotFound(hash.clone())))
            .collect()
    }

    pub(crate) async fn read_tile(
        &self,
        n_commits: usize,
        deadline: Instant,
    ) -> Result<(Tile, Vec<Commit>)> {
        with_deadline(deadline, async {
            let idx_commits = self.history.last_n_index(n_commits).await?;
            let (first, last) = match (idx_commits.first(), idx_commits.last()) {
                (Some(f), Some(l)) => (f, l),
                _ => return Err(TileStoreError::NoCommits),
            };
            let (start_tile, start_offset) = self.window.tile_of(first.index)?;
            let (end_tile, end_offset) = self.window.tile_of(last.index)?;
            let hashes: Vec<String> = idx_commits.iter().map(|c| c.hash.clone()).collect();

            let (commits, (traces, param_set)) = tokio::try_join!(
                self.make_tile_commits(&hashes),
                self.get_traces_in_range(start_tile, end_tile, start_offset, end_offset)
            )?;
            debug!(
                commits = commits.len(),
                traces = traces.len(),
                tiles = start_tile.0 - end_tile.0 + 1,
                "tile assembled"
            );

            let tile = Tile {
                traces,
                param_set,
                commits: commits.clone(),
            };
            Ok((tile, commits))
        })
        .await
    }

    pub(crate) async fn read_dense_tile(
        &self,
        n_commits: usize,
        deadline: Instant,
    ) -> Result<(Tile, Vec<Commit>)> {
        with_deadline(deadline, async {
            let head = self
                .history
                .last_n_index(1)
                .await?
                .pop()
                .ok_or(TileStoreError::NoCommits)?;

            let (mut tile, mut end_offset) = self.window.tile_of(head.index)?;
            let mut tile_start = head.index - end_offset;
            let mut commits_with_data: Vec<usize> = Vec::with_capacity(n_commits);
            let mut param_set = ParamSet::new();
            let mut all_traces = TraceMap::new();

            // Newest tile first, stepping back until enough commits have data.
            loop {
                let (traces, params) = self.get_traces_in_range(tile, tile, 0, end_offset).await?;
                param_set.add_param_set(&params);

                let mut filled = traces.commit_indices_with_data();
                let wanted = n_commits - commits_with_data.len();
                if filled.len() > wanted {
                    filled.drain(..filled.len() - wanted);
                }
                commits_with_data.extend(filled.iter().map(|i| tile_start + i));
                all_traces.prepend_traces(traces.make_from_commit_indexes(&filled));

                match tile.older() {
                    Some(older) if commits_with_data.len() < n_commits => {
                        tile = older;
                        end_offset = self.window.tile_size() - 1;
                        tile_start -= self.window.tile_size();
                    }
                    _ => break,
                }
            }

            if commits_with_data.is_empty() {
                return Ok((Tile::default(), Vec::new()));
            }
            commits_with_data.sort_unstable();

            let oldest_idx = commits_with_data[0];
            let oldest = self.history.by_index(oldest_idx).await?;
            let mut hashes = self
                .history
                .from_timestamp(oldest.timestamp - chrono::Duration::milliseconds(1))
                .await?;
            // Commits can share a timestamp with the oldest one.
            if let Some(pos) = hashes.iter().position(|h| *h == oldest.hash) {
                hashes.drain(..pos);
            }

            let all_commits = self.make_tile_commits(&hashes).await?;
            let dense_commits = commits_with_data
                .iter()
                .map(|&idx| {
                    all_commits
                        .get(idx - oldest_idx)
                        .cloned()
                        .ok_or(TileStoreError::CommitIndexOutOfRange(idx))
                })
                .collect::<Result<Vec<_>>>()?;

            param_set.normalize();
            debug!(
                dense = dense_commits.len(),
                spanned = all_commits.len(),
                traces = all_traces.len(),
                "dense tile assembled"
            );
            let tile = Tile {
                traces: all_traces,
                param_set,
                commits: dense_commits,
            };
            Ok((tile, all_commits))
        })
        .await
    }
}
