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

//! Tilestore Storage
//!
//! Time-windowed, sharded trace storage on top of a wide-column store.
//!
//! ## Architecture
//!
//! - **Tiling**: commit positions are grouped into fixed-size tiles; each
//!   tile has its own param schema (OPS) and its own trace rows.
//! - **Sharding**: trace and digest-map rows are spread over N row-key
//!   prefixes so a tile is read with N parallel prefix scans.
//! - **Digest map**: one global digest -> id mapping, grown with
//!   create-if-absent writes.
//! - **OPS**: per-tile append-only schema, grown with compare-and-swap.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tilestore_storage::{InMemoryCommitHistory, InMemoryStore, ShardedTraceStore, TraceStore};
//!
//! let store = ShardedTraceStore::new(config, Arc::new(InMemoryStore::new()), history)?;
//! store.put("abc", &entries, Utc::now()).await?;
//! let (tile, commits) = store.get_tile(50, Instant::now() + Duration::from_secs(5)).await?;
//! ```

pub mod commits;
pub mod digest_map;
pub mod memory;
pub mod ops;
pub mod read;
pub mod retry;
pub mod rows;
pub mod stats;
pub mod store;
pub mod tasks;
pub mod tiling;
pub mod trace_store;
mod write;

pub use commits::{CommitHistory, InMemoryCommitHistory};
pub use digest_map::{DigestMapManager, IdPool};
pub use memory::InMemoryStore;
pub use ops::{OpsCache, OpsCacheEntry, OpsManager};
pub use read::EncodedTile;
pub use retry::{Attempt, ConflictRetry};
pub use stats::{StoreStats, StoreStatsAtomic};
pub use store::{
    Cell, Mutation, MutationOp, Predicate, ReadFilter, Row, RowError, Timestamp, WideColumnStore,
};
pub use tiling::{TileKey, TileWindow};
pub use trace_store::{ShardedTraceStore, TraceStore};
