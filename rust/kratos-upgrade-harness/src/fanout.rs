//! Fan-out / fan-in barrier over cluster members
//!
//! Per-member operations (votes, stop, swap, start) are order independent,
//! so they are dispatched together. The step completes when every member
//! succeeded, or fails on the first member error. Remaining tasks are
//! aborted and awaited before returning so nothing keeps running against
//! the cluster behind the caller's back.

use std::future::Future;
use tokio::task::JoinSet;
use tracing::debug;

use crate::cluster::ClusterError;

/// First member operation that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    /// Position of the member in the dispatched list (`None` if the task panicked)
    pub index: Option<usize>,

    /// Member label (node name or validator key)
    pub member: String,

    pub error: ClusterError,
}

/// Run every member operation concurrently, surfacing the first failure
///
/// Returns the number of members that completed.
pub async fn fan_out<Fut>(tasks: Vec<(String, Fut)>) -> Result<usize, MemberFailure>
where
    Fut: Future<Output = Result<(), ClusterError>> + Send + 'static,
{
    let total = tasks.len();
    let mut set = JoinSet::new();

    for (index, (member, op)) in tasks.into_iter().enumerate() {
        set.spawn(async move {
            let result = op.await;
            (index, member, result)
        });
    }

    let mut completed = 0;
    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok((_, member, Ok(()))) => {
                debug!("Member {} done ({}/{})", member, completed + 1, total);
                completed += 1;
                continue;
            }
            Ok((index, member, Err(error))) => MemberFailure {
                index: Some(index),
                member,
                error,
            },
            Err(join_error) => MemberFailure {
                index: None,
                member: "<task>".to_string(),
                error: ClusterError::NodeOperation(format!("Member task aborted: {}", join_error)),
            },
        };

        // Abort stragglers and wait for them to unwind
        set.shutdown().await;
        return Err(failure);
    }

    Ok(completed)
}
