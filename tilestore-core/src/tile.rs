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

//! In-memory trace matrix ("tile") returned by reads.
//!
//! Traces have two representations. On the storage side a trace is an
//! [`EncodedTrace`]: a compact key plus one [`DigestId`] per commit offset of a
//! storage tile. Consumers see a [`Trace`]: the decoded params plus one digest
//! string per queried commit. [`TraceRepr`] tags the two so tile assembly can
//! only splice decoded data.

use crate::digest::{Digest, DigestId, DigestMap, MISSING_DIGEST};
use crate::error::Result;
use crate::ordered_param_set::OrderedParamSet;
use crate::params::{trace_id_from_params, ParamSet, Params, TraceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One result to write: the trace it belongs to and its digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub params: Params,
    pub digest: Digest,
}

/// Trace as stored: compact OPS-encoded key and digest ids per tile offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTrace {
    pub key: String,
    pub ids: Vec<DigestId>,
}

/// Trace as consumed: params and one digest per commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub keys: Params,
    pub digests: Vec<Digest>,
}

/// Storage vs. decoded form of a trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRepr {
    Encoded(EncodedTrace),
    Decoded(Trace),
}

impl TraceRepr {
    /// Decode the `[start, start + len)` offsets of a trace.
    ///
    /// Already decoded traces are sliced as-is.
    pub fn into_decoded(
        self,
        ops: &OrderedParamSet,
        digests: &DigestMap,
        start: usize,
        len: usize,
    ) -> Result<Trace> {
        match self {
            TraceRepr::Decoded(mut t) => {
                t.digests = t.digests.into_iter().skip(start).take(len).collect();
                Ok(t)
            }
            TraceRepr::Encoded(enc) => {
                let keys = ops.decode_params_from_string(&enc.key)?;
                let end = (start + len).min(enc.ids.len());
                let slice = enc.ids.get(start..end).unwrap_or(&[]);
                let digests = digests.decode_ids(slice)?;
                Ok(Trace { keys, digests })
            }
        }
    }
}

impl Trace {
    /// A trace with `n` missing commits
    pub fn new_empty(keys: Params, n: usize) -> Self {
        Self {
            keys,
            digests: vec![MISSING_DIGEST.to_string(); n],
        }
    }

    pub fn id(&self) -> TraceId {
        trace_id_from_params(&self.keys)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn is_missing(&self, idx: usize) -> bool {
        self.digests
            .get(idx)
            .map_or(true, |d| d.as_str() == MISSING_DIGEST)
    }
}

/// Decoded traces keyed by canonical trace id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMap(BTreeMap<TraceId, Trace>);

impl TraceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Trace> {
        self.0.get(id)
    }

    /// Existing trace, or a new all-missing one of `n_commits` length
    pub fn entry_or_empty(&mut self, id: TraceId, keys: &Params, n_commits: usize) -> &mut Trace {
        self.0
            .entry(id)
            .or_insert_with(|| Trace::new_empty(keys.clone(), n_commits))
    }

    pub fn insert(&mut self, trace: Trace) {
        self.0.insert(trace.id(), trace);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TraceId, &Trace)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of commits the traces span (all traces have equal length)
    pub fn n_commits(&self) -> usize {
        self.0.values().next().map_or(0, Trace::len)
    }

    /// Sorted commit offsets where at least one trace has data
    pub fn commit_indices_with_data(&self) -> Vec<usize> {
        (0..self.n_commits())
            .filter(|&i| self.0.values().any(|t| !t.is_missing(i)))
            .collect()
    }

    /// New map keeping only the given commit offsets, in the given order
    pub fn make_from_commit_indexes(&self, indices: &[usize]) -> TraceMap {
        let traces = self
            .0
            .iter()
            .map(|(id, t)| {
                let digests = indices
                    .iter()
                    .map(|&i| {
                        t.digests
                            .get(i)
                            .cloned()
                            .unwrap_or_else(|| MISSING_DIGEST.to_string())
                    })
                    .collect();
                (
                    id.clone(),
                    Trace {
                        keys: t.keys.clone(),
                        digests,
                    },
                )
            })
            .collect();
        TraceMap(traces)
    }

    /// Put `older` in front of every trace, padding traces that only exist
    /// on one side with missing digests.
    pub fn prepend_traces(&mut self, older: TraceMap) {
        let own_len = self.n_commits();
        let older_len = older.n_commits();

        for (id, mut old) in older.0 {
            match self.0.remove(&id) {
                Some(current) => old.digests.extend(current.digests),
                None => old
                    .digests
                    .extend(std::iter::repeat(MISSING_DIGEST.to_string()).take(own_len)),
            }
            self.0.insert(id, old);
        }

        for trace in self.0.values_mut() {
            if trace.digests.len() < older_len + own_len {
                let mut padded = vec![MISSING_DIGEST.to_string(); older_len];
                padded.append(&mut trace.digests);
                trace.digests = padded;
            }
        }
    }
}

impl FromIterator<Trace> for TraceMap {
    fn from_iter<I: IntoIterator<Item = Trace>>(iter: I) -> Self {
        let mut map = TraceMap::new();
        for t in iter {
            map.insert(t);
        }
        map
    }
}

/// Commit metadata attached to a tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    pub commit_time: DateTime<Utc>,
}

/// Commit descriptor from the history provider: position plus identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCommit {
    pub index: usize,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

/// A window of history: traces x commits plus the union of their params
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub traces: TraceMap,
    pub param_set: ParamSet,
    pub commits: Vec<Commit>,
}

impl Tile {
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty() && self.commits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(pairs: &[(&str, &str)], digests: &[&str]) -> Trace {
        Trace {
            keys: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            digests: digests.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_commit_indices_with_data() {
        let map: TraceMap = vec![
            trace(&[("t", "a")], &["", "", "d1", "", ""]),
            trace(&[("t", "b")], &["", "", "", "", "d2"]),
        ]
        .into_iter()
        .collect();
        assert_eq!(map.n_commits(), 5);
        assert_eq!(map.commit_indices_with_data(), vec![2, 4]);

        let dense = map.make_from_commit_indexes(&[2, 4]);
        assert_eq!(dense.get(",t=a,").unwrap().digests, vec!["d1", ""]);
        assert_eq!(dense.get(",t=b,").unwrap().digests, vec!["", "d2"]);
    }

    #[test]
    fn test_prepend_traces_pads_both_sides() {
        let mut newer: TraceMap = vec![
            trace(&[("t", "a")], &["a3", "a4"]),
            trace(&[("t", "new")], &["", "n4"]),
        ]
        .into_iter()
        .collect();
        let older: TraceMap = vec![
            trace(&[("t", "a")], &["a1"]),
            trace(&[("t", "gone")], &["g1"]),
        ]
        .into_iter()
        .collect();

        newer.prepend_traces(older);
        assert_eq!(newer.get(",t=a,").unwrap().digests, vec!["a1", "a3", "a4"]);
        assert_eq!(newer.get(",t=gone,").unwrap().digests, vec!["g1", "", ""]);
        assert_eq!(newer.get(",t=new,").unwrap().digests, vec!["", "", "n4"]);
    }

    #[test]
    fn test_prepend_into_empty() {
        let mut acc = TraceMap::new();
        acc.prepend_traces(vec![trace(&[("t", "a")], &["x"])].into_iter().collect());
        assert_eq!(acc.get(",t=a,").unwrap().digests, vec!["x"]);
    }

    #[test]
    fn test_encoded_trace_decodes_slice() {
        let mut ops = OrderedParamSet::new();
        let mut ps = ParamSet::new();
        let keys: Params = [("os".to_string(), "linux".to_string())].into_iter().collect();
        ps.add_params(&keys);
        ops.update(&ps);

        let mut dm = DigestMap::new();
        let mut m = std::collections::HashMap::new();
        m.insert("abcd".to_string(), DigestId(7));
        dm.add(&m).unwrap();

        let repr = TraceRepr::Encoded(EncodedTrace {
            key: ops.encode_params_as_string(&keys).unwrap(),
            ids: vec![DigestId(0), DigestId(7), DigestId(0), DigestId(7)],
        });
        let t = repr.into_decoded(&ops, &dm, 1, 2).unwrap();
        assert_eq!(t.keys, keys);
        assert_eq!(t.digests, vec!["abcd", ""]);

        let bad = TraceRepr::Encoded(EncodedTrace {
            key: ",0=0,".into(),
            ids: vec![DigestId(99)],
        });
        assert!(bad.into_decoded(&ops, &dm, 0, 1).unwrap_err().is_corruption());
    }
}
