//! Bounded fan-out of per-host tasks
//!
//! Each call owns its own [`tokio::task::JoinSet`] holding at most `max_workers` tasks;
//! nothing is kept between calls. Results are keyed by host identity and a panicking task
//! is reported as a failed result for its host.

use std::collections::HashMap;
use std::future::Future;
use tracing::Instrument;
use tracing::instrument::WithSubscriber;

use common::{HostResults, OperationResult};

#[derive(Debug, Clone)]
pub struct FanOutExecutor {
    max_workers: usize,
    dispatch: tracing::Dispatch,
}

impl FanOutExecutor {
    /// Tasks log through `dispatch`, a worker cap of 0 is treated as 1
    pub fn new(max_workers: usize, dispatch: tracing::Dispatch) -> Self {
        Self {
            max_workers: max_workers.max(1),
            dispatch,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn record(
        joined: Result<(tokio::task::Id, OperationResult), tokio::task::JoinError>,
        pending: &mut HashMap<tokio::task::Id, String>,
        results: &mut HostResults,
    ) {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(error) => (
                error.id(),
                OperationResult::fault(
                    format!("host task failed: {}", error),
                    std::time::Duration::ZERO,
                ),
            ),
        };
        match pending.remove(&id) {
            Some(host) => {
                results.insert(host, result);
            }
            None => tracing::error!("result for unknown task {} dropped", id),
        }
    }

    /// Run every `(host, task)` pair and collect the results once all of them finished
    pub async fn run<Fut>(&self, tasks: impl IntoIterator<Item = (String, Fut)>) -> HostResults
    where
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        let mut join_set = tokio::task::JoinSet::new();
        let mut pending = HashMap::new();
        let mut results = HostResults::new();
        for (host, task) in tasks {
            while join_set.len() >= self.max_workers {
                match join_set.join_next_with_id().await {
                    Some(joined) => Self::record(joined, &mut pending, &mut results),
                    None => break,
                }
            }
            let span_host = host.clone();
            let task = async move {
                let span = tracing::info_span!("host", host = %span_host);
                task.instrument(span).await
            };
            let handle = join_set.spawn(task.with_subscriber(self.dispatch.clone()));
            pending.insert(handle.id(), host);
        }
        while let Some(joined) = join_set.join_next_with_id().await {
            Self::record(joined, &mut pending, &mut results);
        }
        results
    }
}
