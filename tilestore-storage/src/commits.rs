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

//! Commit history provider
//!
//! The engine never stores commits itself. It asks a history provider for
//! the position of a commit hash and for metadata when assembling tiles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tilestore_core::{Commit, IndexCommit, Result, TileStoreError};

#[async_trait]
pub trait CommitHistory: Send + Sync {
    /// Position of a commit (0 = first commit of the repo)
    async fn index_of(&self, hash: &str) -> Result<usize>;

    /// Up to `n` most recent commits, oldest first
    async fn last_n_index(&self, n: usize) -> Result<Vec<IndexCommit>>;

    /// Commit at a position
    async fn by_index(&self, index: usize) -> Result<IndexCommit>;

    /// Metadata for each hash, `None` for hashes the provider does not know
    async fn details_multi(&self, hashes: &[String]) -> Result<Vec<Option<Commit>>>;

    /// Hashes of commits with a timestamp strictly after `t`, oldest first
    async fn from_timestamp(&self, t: DateTime<Utc>) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct History {
    commits: Vec<Commit>,
    by_hash: HashMap<String, usize>,
}

/// Linear commit history held in memory
#[derive(Debug, Default)]
pub struct InMemoryCommitHistory {
    inner: RwLock<History>,
}

impl InMemoryCommitHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_commits(commits: impl IntoIterator<Item = Commit>) -> Result<Self> {
        let history = Self::new();
        for c in commits {
            history.push(c)?;
        }
        Ok(history)
    }

    /// Append a commit at the head. Hashes must be unique and commit times
    /// must not go backwards.
    pub fn push(&self, commit: Commit) -> Result<usize> {
        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&commit.hash) {
            return Err(TileStoreError::InvalidParams(format!(
                "duplicate commit {}",
                commit.hash
            )));
        }
        if let Some(head) = inner.commits.last() {
            if commit.commit_time < head.commit_time {
                return Err(TileStoreError::InvalidParams(format!(
                    "commit {} is older than head {}",
                    commit.hash, head.hash
                )));
            }
        }
        let index = inner.commits.len();
        inner.by_hash.insert(commit.hash.clone(), index);
        inner.commits.push(commit);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.inner.read().commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn index_commit(index: usize, c: &Commit) -> IndexCommit {
    IndexCommit {
        index,
        hash: c.hash.clone(),
        timestamp: c.commit_time,
    }
}

#[async_trait]
impl CommitHistory for InMemoryCommitHistory {
    async fn index_of(&self, hash: &str) -> Result<usize> {
        self.inner
            .read()
            .by_hash
            .get(hash)
            .copied()
            .ok_or_else(|| TileStoreError::CommitNotFound(hash.to_string()))
    }

    async fn last_n_index(&self, n: usize) -> Result<Vec<IndexCommit>> {
        let inner = self.inner.read();
        let start = inner.commits.len().saturating_sub(n);
        Ok(inner.commits[start..]
            .iter()
            .enumerate()
            .map(|(i, c)| index_commit(start + i, c))
            .collect())
    }

    async fn by_index(&self, index: usize) -> Result<IndexCommit> {
        self.inner
            .read()
            .commits
            .get(index)
            .map(|c| index_commit(index, c))
            .ok_or(TileStoreError::CommitIndexOutOfRange(index))
    }

    async fn details_multi(&self, hashes: &[String]) -> Result<Vec<Option<Commit>>> {
        let inner = self.inner.read();
        Ok(hashes
            .iter()
            .map(|h| inner.by_hash.get(h).map(|&i| inner.commits[i].clone()))
            .collect())
    }

    async fn from_timestamp(&self, t: DateTime<Utc>) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let start = inner.commits.partition_point(|c| c.commit_time <= t);
        Ok(inner.commits[start..].iter().map(|c| c.hash.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn commit(hash: &str, secs: i64) -> Commit {
        Commit {
            hash: hash.into(),
            author: "dev@example.com".into(),
            commit_time: Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap(),
        }
    }

    fn history() -> InMemoryCommitHistory {
        InMemoryCommitHistory::from_commits(vec![
            commit("c0", 0),
            commit("c1", 10),
            commit("c2", 10),
            commit("c3", 20),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_index_lookups() {
        let h = history();
        assert_eq!(h.index_of("c2").await.unwrap(), 2);
        assert!(matches!(
            h.index_of("nope").await,
            Err(TileStoreError::CommitNotFound(_))
        ));
        assert_eq!(h.by_index(3).await.unwrap().hash, "c3");
        assert!(h.by_index(4).await.is_err());
    }

    #[tokio::test]
    async fn test_last_n() {
        let h = history();
        let last = h.last_n_index(2).await.unwrap();
        assert_eq!(last.iter().map(|c| c.index).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(h.last_n_index(10).await.unwrap().len(), 4);
        assert!(InMemoryCommitHistory::new().last_n_index(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_timestamp_includes_ties_after_cutoff() {
        let h = history();
        let c1 = h.by_index(1).await.unwrap();
        let hashes = h
            .from_timestamp(c1.timestamp - Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(hashes, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_details_multi() {
        let h = history();
        let details = h
            .details_multi(&["c3".to_string(), "zz".to_string()])
            .await
            .unwrap();
        assert_eq!(details[0].as_ref().unwrap().hash, "c3");
        assert!(details[1].is_none());
    }

    #[test]
    fn test_push_rejects_duplicates_and_time_travel() {
        let h = history();
        assert!(h.push(commit("c0", 30)).is_err());
        assert!(h.push(commit("c4", 5)).is_err());
        assert_eq!(h.push(commit("c4", 20)).unwrap(), 4);
    }
}
