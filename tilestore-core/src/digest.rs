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

//! Digests and their compact integer ids.

use crate::error::{Result, TileStoreError};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Content hash of a test result, e.g. an image checksum
pub type Digest = String;

/// Set of digests seen in one write
pub type DigestSet = BTreeSet<Digest>;

/// Sentinel digest for a commit with no data
pub const MISSING_DIGEST: &str = "";

/// Compact surrogate for a digest. Id 0 means "missing".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DigestId(pub u64);

impl DigestId {
    pub const MISSING: DigestId = DigestId(0);

    /// Width of the stored binary form
    pub const ENCODED_LEN: usize = 8;

    pub fn is_missing(self) -> bool {
        self == Self::MISSING
    }

    /// Fixed-width big-endian cell value
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        BigEndian::write_u64(&mut buf, self.0);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(TileStoreError::Corruption(format!(
                "digest id cell has {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        Ok(DigestId(BigEndian::read_u64(bytes)))
    }
}

impl fmt::Display for DigestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global bidirectional digest <-> id mapping.
///
/// The missing sentinel is always present as `"" <-> 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMap {
    to_id: HashMap<Digest, DigestId>,
    to_digest: HashMap<DigestId, Digest>,
}

impl Default for DigestMap {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl DigestMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut to_id = HashMap::with_capacity(capacity + 1);
        let mut to_digest = HashMap::with_capacity(capacity + 1);
        to_id.insert(MISSING_DIGEST.to_string(), DigestId::MISSING);
        to_digest.insert(DigestId::MISSING, MISSING_DIGEST.to_string());
        Self { to_id, to_digest }
    }

    /// Add mappings. Fails without modifying the map if any entry would
    /// break the 1:1 relation with an existing one.
    pub fn add(&mut self, mappings: &HashMap<Digest, DigestId>) -> Result<()> {
        for (digest, id) in mappings {
            if digest.as_str() == MISSING_DIGEST || id.is_missing() {
                return Err(TileStoreError::Corruption(format!(
                    "attempted to map reserved digest/id: {:?} -> {}",
                    digest, id
                )));
            }
            if let Some(existing) = self.to_id.get(digest) {
                if existing != id {
                    return Err(TileStoreError::Corruption(format!(
                        "digest {} already mapped to {}, not {}",
                        digest, existing, id
                    )));
                }
            }
            if let Some(existing) = self.to_digest.get(id) {
                if existing != digest {
                    return Err(TileStoreError::Corruption(format!(
                        "id {} already mapped to {}, not {}",
                        id, existing, digest
                    )));
                }
            }
        }
        for (digest, id) in mappings {
            self.to_id.insert(digest.clone(), *id);
            self.to_digest.insert(*id, digest.clone());
        }
        Ok(())
    }

    /// Id of a digest
    pub fn id(&self, digest: &str) -> Result<DigestId> {
        self.to_id
            .get(digest)
            .copied()
            .ok_or_else(|| TileStoreError::DigestNotFound(digest.to_string()))
    }

    /// Digests for a slice of ids. An unregistered id is corruption.
    pub fn decode_ids(&self, ids: &[DigestId]) -> Result<Vec<Digest>> {
        ids.iter()
            .map(|id| {
                self.to_digest
                    .get(id)
                    .cloned()
                    .ok_or(TileStoreError::UnknownDigestId(id.0))
            })
            .collect()
    }

    /// Digests from `digests` that have no id yet
    pub fn delta(&self, digests: &DigestSet) -> Vec<Digest> {
        digests
            .iter()
            .filter(|d| !self.to_id.contains_key(d.as_str()))
            .cloned()
            .collect()
    }

    /// Number of registered digests, not counting the missing sentinel
    pub fn len(&self) -> usize {
        self.to_id.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
