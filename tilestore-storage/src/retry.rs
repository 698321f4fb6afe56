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

//! Optimistic-concurrency retry
//!
//! Schema growth and digest registration both follow the same shape: read
//! the current state, compute the next one, issue a conditional write, and
//! start over if another writer got there first. [`ConflictRetry::run`]
//! owns the loop so callers only describe a single attempt.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tilestore_core::{Result, TileStoreError, TraceStoreConfig};
use tracing::warn;

/// Outcome of one optimistic attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Committed(T),
    /// Lost a race. The state must be re-read.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct ConflictRetry {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl ConflictRetry {
    pub fn from_config(config: &TraceStoreConfig) -> Self {
        Self {
            max_attempts: config.max_conflict_retries,
            initial_delay: config.conflict_backoff(),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let clamped = (base * jitter_factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped.max(0.0))
    }

    /// Run `attempt` until it commits, fails, or the attempt cap is hit.
    ///
    /// Errors from an attempt end the loop immediately; only
    /// [`Attempt::Conflict`] is retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        for n in 0..self.max_attempts {
            if n > 0 {
                tokio::time::sleep(self.delay_for_attempt(n - 1)).await;
            }
            match attempt(n).await? {
                Attempt::Committed(value) => return Ok(value),
                Attempt::Conflict => {
                    warn!(operation, attempt = n + 1, "conflicting write, retrying");
                }
            }
        }
        Err(TileStoreError::Contention {
            operation: operation.to_string(),
            attempts: self.max_attempts,
        })
    }
}
