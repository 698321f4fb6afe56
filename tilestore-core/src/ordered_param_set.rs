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

//! Ordered Param Set (OPS)
//!
//! Per-tile, append-only schema that assigns a small integer to every observed
//! parameter key and to every observed value under that key. Trace identities
//! are stored in the compact form `,<key code>=<value code>,...` instead of the
//! full `,key=value,...` string.
//!
//! ```text
//! key_order:  [os, test]
//! values:     os   -> [linux, android]
//!             test -> [foo, bar]
//!
//! {os=android, test=foo}  <->  ",0=1,1=0,"
//! ```
//!
//! Codes are positions in `key_order` and in each value list. Both lists only
//! ever grow, so a code once issued keeps its meaning for the life of the tile.

use crate::error::{Result, TileStoreError};
use crate::params::{ParamSet, Params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// Serialized form. The lookup index is derived state and never stored.
#[derive(Serialize, Deserialize)]
struct OpsWire {
    key_order: Vec<String>,
    values: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedParamSet {
    key_order: Vec<String>,
    values: BTreeMap<String, Vec<String>>,
    /// key -> (key code, value -> value code)
    index: HashMap<String, (usize, HashMap<String, usize>)>,
}

impl OrderedParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys in code order
    pub fn key_order(&self) -> &[String] {
        &self.key_order
    }

    /// Values of `key` in code order
    pub fn values(&self, key: &str) -> Option<&[String]> {
        self.values.get(key).map(|v| v.as_slice())
    }

    /// Code assigned to `key=value`, if any
    pub fn code_of(&self, key: &str, value: &str) -> Option<(usize, usize)> {
        let (key_code, values) = self.index.get(key)?;
        values.get(value).map(|value_code| (*key_code, *value_code))
    }

    pub fn is_empty(&self) -> bool {
        self.key_order.is_empty()
    }

    /// All key/value pairs of `ps` that have no code yet.
    pub fn delta(&self, ps: &ParamSet) -> ParamSet {
        let mut missing = ParamSet::new();
        for (k, values) in ps.iter() {
            for v in values {
                if self.code_of(k, v).is_none() {
                    missing.add(k, v);
                }
            }
        }
        missing
    }

    /// Assign codes to every new key/value in `ps`.
    ///
    /// New keys are appended in sorted order, then new values under each key
    /// in sorted order, so two writers extending the same OPS with the same
    /// paramset produce identical results.
    pub fn update(&mut self, ps: &ParamSet) {
        let mut new_keys: Vec<&String> = ps
            .keys()
            .filter(|k| !self.index.contains_key(k.as_str()))
            .collect();
        new_keys.sort();
        for k in new_keys {
            let code = self.key_order.len();
            self.key_order.push(k.clone());
            self.values.insert(k.clone(), Vec::new());
            self.index.insert(k.clone(), (code, HashMap::new()));
        }

        for (k, values) in ps.iter() {
            let mut fresh: Vec<&String> = values
                .iter()
                .filter(|v| self.code_of(k, v).is_none())
                .collect();
            fresh.sort();
            fresh.dedup();
            let (Some(list), Some((_, lookup))) = (self.values.get_mut(k), self.index.get_mut(k))
            else {
                continue;
            };
            for v in fresh {
                lookup.insert(v.clone(), list.len());
                list.push(v.clone());
            }
        }
    }

    /// Encode a trace's params in the compact `,k=v,` code form.
    ///
    /// Pairs are emitted in key-code order, so the output is stable for a
    /// fixed OPS state.
    pub fn encode_params_as_string(&self, params: &Params) -> Result<String> {
        let mut codes: Vec<(usize, usize)> = Vec::with_capacity(params.len());
        for (k, v) in params {
            let code = self.code_of(k, v).ok_or_else(|| {
                TileStoreError::InvalidParams(format!("no code for {}={}", k, v))
            })?;
            codes.push(code);
        }
        codes.sort_unstable();

        let mut out = String::with_capacity(codes.len() * 6 + 1);
        out.push(',');
        for (kc, vc) in codes {
            // Writing to a String cannot fail
            let _ = write!(out, "{}={},", kc, vc);
        }
        Ok(out)
    }

    /// Decode a compact trace key back to its params.
    pub fn decode_params_from_string(&self, encoded: &str) -> Result<Params> {
        let corrupt = |reason: String| TileStoreError::CorruptTraceKey {
            key: encoded.to_string(),
            reason,
        };

        let inner = encoded
            .strip_prefix(',')
            .and_then(|s| s.strip_suffix(','))
            .ok_or_else(|| corrupt("missing ',' delimiters".into()))?;
        if inner.is_empty() {
            return Err(corrupt("no params".into()));
        }

        let mut params = Params::new();
        for pair in inner.split(',') {
            let (kc, vc) = pair
                .split_once('=')
                .ok_or_else(|| corrupt(format!("malformed pair {:?}", pair)))?;
            let kc: usize = kc
                .parse()
                .map_err(|_| corrupt(format!("bad key code {:?}", kc)))?;
            let vc: usize = vc
                .parse()
                .map_err(|_| corrupt(format!("bad value code {:?}", vc)))?;
            let key = self
                .key_order
                .get(kc)
                .ok_or_else(|| corrupt(format!("unknown key code {}", kc)))?;
            let value = self
                .values
                .get(key)
                .and_then(|vs| vs.get(vc))
                .ok_or_else(|| corrupt(format!("unknown value code {} for key {}", vc, key)))?;
            params.insert(key.clone(), value.clone());
        }
        Ok(params)
    }

    /// Every key/value pair as a paramset (values in code order)
    pub fn param_set(&self) -> ParamSet {
        ParamSet::from(self.values.clone())
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = OpsWire {
            key_order: self.key_order.clone(),
            values: self.values.clone(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    /// Deserialize from storage, rebuilding the lookup index
    pub fn decode(data: &[u8]) -> Result<Self> {
        let wire: OpsWire = bincode::deserialize(data)?;
        let mut index = HashMap::with_capacity(wire.key_order.len());
        for (code, key) in wire.key_order.iter().enumerate() {
            let values = wire.values.get(key).ok_or_else(|| {
                TileStoreError::Corruption(format!("OPS key {} has no value list", key))
            })?;
            let lookup = values
                .iter()
                .enumerate()
                .map(|(i, v)| (v.clone(), i))
                .collect();
            index.insert(key.clone(), (code, lookup));
        }
        if wire.values.len() != wire.key_order.len() {
            return Err(TileStoreError::Corruption(
                "OPS value lists do not match key order".into(),
            ));
        }
        Ok(Self {
            key_order: wire.key_order,
            values: wire.values,
            index,
        })
    }

    /// Content hash of the serialized form, used for compare-and-swap.
    pub fn content_hash(&self) -> Result<String> {
        Ok(hash_encoded(&self.encode()?))
    }
}

/// Hex blake3 digest of serialized OPS bytes
pub fn hash_encoded(encoded: &[u8]) -> String {
    hex::encode(blake3::hash(encoded).as_bytes())
}
