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

//! Fixture replay: feed recorded commits and results through a fresh
//! in-memory trace store and read the resulting tile back.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tilestore_core::{Commit, Digest, Entry, ParamSet, Tile, TraceId, TraceStoreConfig};
use tilestore_storage::{InMemoryCommitHistory, InMemoryStore, ShardedTraceStore, TraceStore};
use tracing::info;

/// Read deadline for the final tile query
const READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    pub commits: Vec<FixtureCommit>,
    #[serde(default)]
    pub results: Vec<FixtureResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureCommit {
    pub hash: String,
    #[serde(default)]
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

/// Results of one commit. Without a timestamp the write happens "now".
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureResult {
    pub commit: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub entries: Vec<Entry>,
}

impl Fixture {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub commits: Vec<Commit>,
    pub params: ParamSet,
    pub traces: BTreeMap<TraceId, Vec<Digest>>,
}

impl From<Tile> for Report {
    fn from(tile: Tile) -> Self {
        let traces = tile
            .traces
            .iter()
            .map(|(id, t)| (id.clone(), t.digests.clone()))
            .collect();
        Report {
            commits: tile.commits,
            params: tile.param_set,
            traces,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Commits to read back; None reads the whole history
    pub commits: Option<usize>,
    pub dense: bool,
}

pub async fn replay(
    config: TraceStoreConfig,
    fixture: Fixture,
    options: ReplayOptions,
) -> Result<Report> {
    let commits = fixture.commits.into_iter().map(|c| Commit {
        hash: c.hash,
        author: c.author,
        commit_time: c.timestamp,
    });
    let history = Arc::new(
        InMemoryCommitHistory::from_commits(commits).context("Invalid commit list in fixture")?,
    );
    let n_commits = options.commits.unwrap_or_else(|| history.len());

    let store = ShardedTraceStore::new(config, Arc::new(InMemoryStore::new()), history)
        .context("Failed to open trace store")?;

    for result in &fixture.results {
        let ts = result.timestamp.unwrap_or_else(Utc::now);
        store
            .put(&result.commit, &result.entries, ts)
            .await
            .with_context(|| format!("Failed to write results for commit {}", result.commit))?;
    }

    let deadline = tokio::time::Instant::now() + READ_DEADLINE;
    let (tile, _) = if options.dense {
        store.get_dense_tile(n_commits, deadline).await
    } else {
        store.get_tile(n_commits, deadline).await
    }
    .context("Failed to read tile")?;

    let stats = store.stats();
    info!(
        puts = stats.puts,
        entries = stats.entries_written,
        digests = stats.digests_registered,
        tiles_read = stats.tiles_read,
        "replay complete"
    );
    Ok(Report::from(tile))
}
