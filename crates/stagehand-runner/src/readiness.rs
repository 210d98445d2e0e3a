use crate::options::AccessOptions;
use crate::retry::{retry, RetryPolicy};
use crate::tools::{ClusterClient, NodeStatus};
use crate::HarnessError;

/// Waits for worker nodes to join and report Ready. Control-plane completion
/// says nothing about this, so it is polled separately.
pub struct ReadinessPoller<'a> {
    client: &'a dyn ClusterClient,
    policy: RetryPolicy,
    expected_workers: Option<usize>,
}

impl<'a> ReadinessPoller<'a> {
    pub fn new(client: &'a dyn ClusterClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            expected_workers: None,
        }
    }

    pub fn expect_workers(mut self, count: Option<usize>) -> Self {
        self.expected_workers = count;
        self
    }

    pub fn wait_for_workers_ready(&self, handle: &AccessOptions) -> Result<usize, HarnessError> {
        retry("worker nodes ready", &self.policy, |_| {
            let nodes = self.client.list_nodes(handle).map_err(|e| e.to_string())?;
            check_nodes(&nodes, self.expected_workers)
        })
        .map(|count| {
            tracing::info!(nodes = count, "all worker nodes ready");
            count
        })
        .map_err(|e| HarnessError::ClusterNotReady(e.to_string()))
    }
}

fn check_nodes(nodes: &[NodeStatus], expected: Option<usize>) -> Result<usize, String> {
    if nodes.is_empty() {
        return Err("no nodes registered yet".to_string());
    }
    let not_ready: Vec<&str> = nodes
        .iter()
        .filter(|n| !n.ready)
        .map(|n| n.name.as_str())
        .collect();
    if !not_ready.is_empty() {
        return Err(format!("nodes not ready: {}", not_ready.join(", ")));
    }
    if let Some(want) = expected {
        if nodes.len() < want {
            return Err(format!("{} of {} expected nodes registered", nodes.len(), want));
        }
    }
    Ok(nodes.len())
}
