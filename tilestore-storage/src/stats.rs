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

//! Engine counters
//!
//! Hot counters are plain atomics bumped with `Relaxed` ordering; readers
//! take a [`StoreStats`] snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub puts: u64,
    pub entries_written: u64,
    pub batches_applied: u64,
    pub batches_failed: u64,
    pub tiles_read: u64,
    pub digests_registered: u64,
    pub digest_collisions: u64,
    pub id_counter_requests: u64,
    pub ops_updates: u64,
    pub ops_conflicts: u64,
    /// Size of the digest map when it was last loaded
    pub digest_map_size: u64,
}

#[derive(Debug, Default)]
pub struct StoreStatsAtomic {
    pub puts: AtomicU64,
    pub entries_written: AtomicU64,
    pub batches_applied: AtomicU64,
    pub batches_failed: AtomicU64,
    pub tiles_read: AtomicU64,
    pub digests_registered: AtomicU64,
    pub digest_collisions: AtomicU64,
    pub id_counter_requests: AtomicU64,
    pub ops_updates: AtomicU64,
    pub ops_conflicts: AtomicU64,
    pub digest_map_size: AtomicU64,
}

impl StoreStatsAtomic {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> StoreStats {
        StoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            entries_written: self.entries_written.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            tiles_read: self.tiles_read.load(Ordering::Relaxed),
            digests_registered: self.digests_registered.load(Ordering::Relaxed),
            digest_collisions: self.digest_collisions.load(Ordering::Relaxed),
            id_counter_requests: self.id_counter_requests.load(Ordering::Relaxed),
            ops_updates: self.ops_updates.load(Ordering::Relaxed),
            ops_conflicts: self.ops_conflicts.load(Ordering::Relaxed),
            digest_map_size: self.digest_map_size.load(Ordering::Relaxed),
        }
    }
}
