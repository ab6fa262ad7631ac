//! Preferred-node choice over the current topology.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use vellum_common::{Result, ServerNode, Topology, VellumError};

/// Picks which node serves the next request.
///
/// The selector keeps a cursor into the topology's ordered node list and
/// only moves it on failover. Reads take the cursor modulo the current list
/// length, so a topology swap that shrinks the list can never yield an
/// out-of-range index.
pub struct NodeSelector {
    topology: Arc<RwLock<Topology>>,
    current: AtomicUsize,
}

impl NodeSelector {
    pub fn new(topology: Arc<RwLock<Topology>>) -> Self {
        Self {
            topology,
            current: AtomicUsize::new(0),
        }
    }

    /// The node the cursor points at.
    pub async fn current_node(&self) -> Result<ServerNode> {
        let topology = self.topology.read().await;
        if topology.nodes.is_empty() {
            return Err(VellumError::NoNodesAvailable);
        }
        let index = self.current.load(Ordering::Relaxed) % topology.nodes.len();
        Ok(topology.nodes[index].clone())
    }

    /// Advances the cursor past a failed node and returns the next one.
    /// Rotation wraps modulo the node list length.
    pub async fn on_failure(&self) -> Result<ServerNode> {
        let topology = self.topology.read().await;
        if topology.nodes.is_empty() {
            return Err(VellumError::NoNodesAvailable);
        }
        let index = self
            .current
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            % topology.nodes.len();
        Ok(topology.nodes[index].clone())
    }

    pub async fn node_count(&self) -> usize {
        self.topology.read().await.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector_over(urls: &[&str]) -> NodeSelector {
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        let topology = Topology::seed(&urls, "db").unwrap();
        NodeSelector::new(Arc::new(RwLock::new(topology)))
    }

    #[tokio::test]
    async fn test_current_node_is_stable_without_failures() {
        let selector = selector_over(&["http://a:1", "http://b:1", "http://c:1"]);
        for _ in 0..5 {
            assert_eq!(selector.current_node().await.unwrap().url, "http://a:1");
        }
    }

    #[tokio::test]
    async fn test_on_failure_rotates_modulo_length() {
        let selector = selector_over(&["http://a:1", "http://b:1", "http://c:1"]);
        assert_eq!(selector.on_failure().await.unwrap().url, "http://b:1");
        assert_eq!(selector.on_failure().await.unwrap().url, "http://c:1");
        // wraps around
        assert_eq!(selector.on_failure().await.unwrap().url, "http://a:1");
        assert_eq!(selector.current_node().await.unwrap().url, "http://a:1");
    }

    #[tokio::test]
    async fn test_single_node_always_selected() {
        let selector = selector_over(&["http://only:1"]);
        assert_eq!(selector.on_failure().await.unwrap().url, "http://only:1");
        assert_eq!(selector.current_node().await.unwrap().url, "http://only:1");
    }

    #[tokio::test]
    async fn test_index_survives_topology_shrink() {
        let urls: Vec<String> = ["http://a:1", "http://b:1", "http://c:1"]
            .iter()
            .map(|u| u.to_string())
            .collect();
        let topology = Arc::new(RwLock::new(Topology::seed(&urls, "db").unwrap()));
        let selector = NodeSelector::new(topology.clone());

        selector.on_failure().await.unwrap();
        selector.on_failure().await.unwrap(); // cursor now at index 2

        // topology swap shrinks the list to one node
        *topology.write().await = Topology::seed(&[urls[0].clone()], "db").unwrap();
        assert_eq!(selector.current_node().await.unwrap().url, "http://a:1");
    }
}
