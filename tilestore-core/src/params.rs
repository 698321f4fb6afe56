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

//! Trace parameters and parameter sets.
//!
//! A trace is named by a sorted `key=value` map. Its canonical string id is
//! `,k1=v1,k2=v2,` with keys in ascending order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters identifying one trace (sorted by key)
pub type Params = BTreeMap<String, String>;

/// Canonical trace identifier, e.g. `,device=foo,test=bar,`
pub type TraceId = String;

/// Build the canonical trace id for a parameter map.
pub fn trace_id_from_params(params: &Params) -> TraceId {
    let mut id = String::with_capacity(params.len() * 16 + 1);
    id.push(',');
    for (k, v) in params {
        id.push_str(k);
        id.push('=');
        id.push_str(v);
        id.push(',');
    }
    id
}

/// Check that a parameter map can be stored and decoded unambiguously.
///
/// Keys and values may not be empty or contain the `,` and `=` separators.
pub fn validate_params(params: &Params) -> crate::Result<()> {
    if params.is_empty() {
        return Err(crate::TileStoreError::InvalidParams("empty params".into()));
    }
    for (k, v) in params {
        for s in [k, v] {
            if s.is_empty() || s.contains(',') || s.contains('=') {
                return Err(crate::TileStoreError::InvalidParams(format!(
                    "bad key/value {:?}={:?}",
                    k, v
                )));
            }
        }
    }
    Ok(())
}

/// All observed values per key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSet(BTreeMap<String, Vec<String>>);

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every key/value of a single trace
    pub fn add_params(&mut self, params: &Params) {
        for (k, v) in params {
            self.add(k, v);
        }
    }

    /// Merge another paramset into this one
    pub fn add_param_set(&mut self, other: &ParamSet) {
        for (k, values) in &other.0 {
            for v in values {
                self.add(k, v);
            }
        }
    }

    /// Add a single key/value pair if not already present.
    /// Values keep insertion order until [`ParamSet::normalize`] is called.
    pub fn add(&mut self, key: &str, value: &str) {
        let values = self.0.entry(key.to_string()).or_default();
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }

    /// Sort values under each key
    pub fn normalize(&mut self) {
        for values in self.0.values_mut() {
            values.sort();
        }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.get(key).is_some_and(|vs| vs.iter().any(|v| v == value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Vec<String>>> for ParamSet {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        let mut ps = ParamSet::new();
        for (k, values) in map {
            for v in values {
                ps.add(&k, &v);
            }
        }
        ps
    }
}
