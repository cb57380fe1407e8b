//! Run one operation across many targets with an all-or-nothing result
//!
//! Used by functions that act on every pod of a workload. Concurrency is
//! bounded by a semaphore; results are collected from a `JoinSet` so a
//! panicking target is reported like any other failure.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Bounded concurrent fan-out
#[derive(Clone, Copy, Debug)]
pub struct FanOut {
    limit: usize,
}

impl FanOut {
    /// Fan out at most `limit` targets at a time (at least one)
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Run `op` for every target
    ///
    /// Returns one result per target, or an aggregate error holding every
    /// failure message if any target failed. Successful results are dropped
    /// in that case.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        targets: Vec<String>,
        op: F,
    ) -> Result<BTreeMap<String, T>>
    where
        T: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let total = targets.len();
        let permits = Arc::new(Semaphore::new(self.limit));
        let mut set = JoinSet::new();
        for target in targets {
            let work = op(target.clone());
            let permits = permits.clone();
            set.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => work.await,
                    Err(e) => Err(Error::execution("fan-out", e.to_string())),
                };
                (target, result)
            });
        }
        debug!(targets = total, limit = self.limit, "fan-out started");

        let mut results = BTreeMap::new();
        let mut errors = Vec::new();
        for _ in 0..total {
            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    set.abort_all();
                    return Err(Error::cancelled("waiting for fan-out targets"));
                }
                joined = set.join_next() => joined,
            };
            match joined {
                Some(Ok((target, Ok(value)))) => {
                    results.insert(target, value);
                }
                Some(Ok((target, Err(e)))) => errors.push(format!("{target}: {e}")),
                Some(Err(e)) => errors.push(format!("task failed: {e}")),
                None => break,
            }
        }

        if errors.is_empty() {
            Ok(results)
        } else {
            warn!(failed = errors.len(), targets = total, "fan-out failed");
            Err(Error::Aggregate { errors })
        }
    }
}
