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

//! Tilestore Core
//!
//! Data model for the trace matrix: parameters, the per-tile ordered param
//! set, digests and digest ids, traces and tiles. Pure data, no I/O.

pub mod config;
pub mod digest;
pub mod error;
pub mod ordered_param_set;
pub mod params;
pub mod tile;

pub use config::{
    TraceStoreConfig, DEFAULT_MAX_BATCH_SIZE, DEFAULT_RESERVED_IDS, DEFAULT_SHARDS,
    DEFAULT_TILE_SIZE,
};
pub use digest::{Digest, DigestId, DigestMap, DigestSet, MISSING_DIGEST};
pub use error::{BatchFailure, Result, TileStoreError};
pub use ordered_param_set::{hash_encoded, OrderedParamSet};
pub use params::{trace_id_from_params, validate_params, ParamSet, Params, TraceId};
pub use tile::{Commit, EncodedTrace, Entry, IndexCommit, Tile, Trace, TraceMap, TraceRepr};
