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

//! Structured fan-out over shards and tiles.

use std::future::Future;
use std::time::Duration;
use tilestore_core::{Result, TileStoreError};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Run futures concurrently and collect their outputs in input order.
///
/// The first error aborts every task still running and is returned; no task
/// outlives the call.
pub async fn fan_out<T, Fut>(futures: impl IntoIterator<Item = Fut>) -> Result<Vec<T>>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let mut set = JoinSet::new();
    let mut count = 0;
    for (idx, fut) in futures.into_iter().enumerate() {
        set.spawn(async move { (idx, fut.await) });
        count += 1;
    }

    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (idx, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                set.abort_all();
                return Err(TileStoreError::Store(format!("task failed: {}", e)));
            }
        };
        match result {
            Ok(value) => slots[idx] = Some(value),
            Err(e) => {
                set.abort_all();
                return Err(e);
            }
        }
    }

    slots
        .into_iter()
        .map(|s| s.ok_or_else(|| TileStoreError::Store("task produced no result".into())))
        .collect()
}

/// Fail with `DeadlineExceeded` if `fut` is not done by `deadline`
pub async fn with_deadline<T>(deadline: Instant, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| TileStoreError::DeadlineExceeded)?
}

/// Bound a single store call by a fixed timeout
pub async fn with_timeout<T>(
    operation: &str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TileStoreError::Timeout {
            operation: operation.to_string(),
            after,
        })?
}
