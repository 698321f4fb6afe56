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

//! Physical row naming.
//!
//! Trace rows and digest-map rows are spread over `shards` prefixes so a
//! tile can be scanned with one prefix range per shard. Layout:
//!
//! ```text
//! sharded:  :{shard:04}:{type}:{tile_key:010}:{subkey}
//! ops:      :o:{tile_key:010}:
//! counter:  <idcounter>
//! ```

use crate::tiling::TileKey;
use tilestore_core::{Digest, Result, TileStoreError};

/// Row type of trace rows
pub const TYPE_TRACE: &str = "t";
/// Row type of digest-map rows
pub const TYPE_DIGEST_MAP: &str = "d";
/// Row type of OPS rows
pub const TYPE_OPS: &str = "o";

/// Family holding one cell per commit offset
pub const TRACE_FAMILY: &str = "T";
/// Family holding one cell per digest suffix
pub const DIGEST_MAP_FAMILY: &str = "D";
/// Family holding the tile schema
pub const OPS_FAMILY: &str = "P";
pub const OPS_HASH_COLUMN: &str = "H";
pub const OPS_SCHEMA_COLUMN: &str = "OPS";

pub const ID_COUNTER_ROW: &str = "<idcounter>";
pub const ID_COUNTER_FAMILY: &str = "I";
pub const ID_COUNTER_COLUMN: &str = "idc";

/// Characters of a digest used as its digest-map row subkey
pub const DIGEST_PREFIX_LEN: usize = 3;

/// Shard of a subkey (CRC32 IEEE modulo shard count)
pub fn shard_of(subkey: &str, shards: u32) -> u32 {
    crc32fast::hash(subkey.as_bytes()) % shards
}

/// Row key for `subkey` in a given shard
pub fn sharded_row_name(shard: u32, row_type: &str, tile: TileKey, subkey: &str) -> String {
    format!(":{:04}:{}:{}:{}", shard, row_type, tile, subkey)
}

/// Prefix covering every row of one shard and type in a tile
pub fn shard_prefix(shard: u32, row_type: &str, tile: TileKey) -> String {
    sharded_row_name(shard, row_type, tile, "")
}

/// Row key with the shard derived from the subkey
pub fn row_name(shards: u32, row_type: &str, tile: TileKey, subkey: &str) -> String {
    sharded_row_name(shard_of(subkey, shards), row_type, tile, subkey)
}

/// Single OPS row of a tile
pub fn ops_row_name(tile: TileKey) -> String {
    format!(":{}:{}:", TYPE_OPS, tile)
}

/// Subkey portion of a sharded row key
pub fn extract_subkey(row_key: &str) -> Result<&str> {
    // ":" shard ":" type ":" tile ":" subkey
    row_key
        .splitn(5, ':')
        .nth(4)
        .ok_or_else(|| TileStoreError::Corruption(format!("malformed row key {:?}", row_key)))
}

/// Reject digests that cannot be bucketed into the digest map
pub fn validate_digest(digest: &str) -> Result<()> {
    if digest.len() <= DIGEST_PREFIX_LEN || !digest.is_char_boundary(DIGEST_PREFIX_LEN) {
        return Err(TileStoreError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}

/// Digest-map (row, column) of a digest. The first characters pick the row,
/// the rest name the column.
pub fn digest_row_and_column(shards: u32, digest: &Digest) -> Result<(String, String)> {
    validate_digest(digest)?;
    let (prefix, suffix) = digest.split_at(DIGEST_PREFIX_LEN);
    Ok((
        row_name(shards, TYPE_DIGEST_MAP, TileKey::DIGEST_MAP, prefix),
        suffix.to_string(),
    ))
}

/// Column of a trace row for a commit offset
pub fn offset_column(offset: usize) -> String {
    offset.to_string()
}
