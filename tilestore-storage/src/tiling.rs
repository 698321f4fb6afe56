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

//! Tile windowing
//!
//! Maps a commit position to the tile holding it and the offset inside that
//! tile. Tile keys start at `u32::MAX` and decrease as history grows, so an
//! ascending scan over row keys yields the newest tile first.
//!
//! ```text
//! position:  0 .. T-1 | T .. 2T-1 | 2T .. 3T-1
//! index:         0    |     1     |     2
//! key:       u32::MAX | u32::MAX-1| u32::MAX-2
//! ```

use std::fmt;
use tilestore_core::{Result, TileStoreError};

/// Storage key of a tile. Smaller keys are newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileKey(pub u32);

impl TileKey {
    /// Key reserved for the global digest map rows. Real tile indices stop
    /// one short of it.
    pub const DIGEST_MAP: TileKey = TileKey(0);

    /// Largest index a real tile can have
    pub const MAX_INDEX: u32 = u32::MAX - 1;

    /// Key of the tile with the given index (0 = oldest)
    pub fn from_index(index: u32) -> Self {
        TileKey(u32::MAX - index)
    }

    /// Tile index of this key (0 = oldest)
    pub fn index(self) -> u32 {
        u32::MAX - self.0
    }

    /// Next tile back in time, or None at the oldest tile
    pub fn older(self) -> Option<TileKey> {
        if self.index() == 0 {
            None
        } else {
            Some(TileKey(self.0 + 1))
        }
    }

    /// Next tile forward in time
    pub fn newer(self) -> TileKey {
        TileKey(self.0 - 1)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

/// Fixed-size commit windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    tile_size: u32,
}

impl TileWindow {
    pub fn new(tile_size: u32) -> Result<Self> {
        if tile_size == 0 {
            return Err(TileStoreError::InvalidConfig("tile_size must be >= 1".into()));
        }
        Ok(Self { tile_size })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size as usize
    }

    /// (tile key, offset in tile) for a commit position. Positions past the
    /// last real tile would collide with the digest map rows.
    pub fn tile_of(&self, position: usize) -> Result<(TileKey, usize)> {
        let size = self.tile_size as usize;
        let index = u32::try_from(position / size)
            .ok()
            .filter(|&i| i <= TileKey::MAX_INDEX)
            .ok_or(TileStoreError::CommitIndexOutOfRange(position))?;
        Ok((TileKey::from_index(index), position % size))
    }

    /// Inverse of [`TileWindow::tile_of`]
    pub fn position_of(&self, key: TileKey, offset: usize) -> usize {
        key.index() as usize * self.tile_size as usize + offset
    }

    /// Position of the first (oldest) commit of a tile
    pub fn first_position(&self, key: TileKey) -> usize {
        self.position_of(key, 0)
    }

    /// Keys from `newest` back to `oldest`, inclusive
    pub fn keys_newest_first(&self, newest: TileKey, oldest: TileKey) -> impl Iterator<Item = TileKey> {
        (newest.0..=oldest.0).map(TileKey)
    }

    /// Keys from `oldest` forward to `newest`, inclusive
    pub fn keys_oldest_first(&self, oldest: TileKey, newest: TileKey) -> impl Iterator<Item = TileKey> {
        (newest.0..=oldest.0).rev().map(TileKey)
    }
}
