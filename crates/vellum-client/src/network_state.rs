//! Per-(store, database) network state.
//!
//! Holds the pieces every request consults: the current topology, the
//! conventions, the caller-supplied transport options, and the node
//! selector. The topology is only ever replaced wholesale under the write
//! lock, so readers never observe a torn cluster view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use vellum_common::{
    Command, Conventions, GetClusterTopologyCommand, Result, Topology, VellumError,
};

use crate::connection::TransportOptions;
use crate::executor::{ExecutorHandle, RequestOptions};
use crate::node_selector::NodeSelector;

pub struct NetworkState {
    pub database: String,
    pub conventions: Arc<Conventions>,
    pub transport: TransportOptions,
    pub selector: NodeSelector,
    topology: Arc<RwLock<Topology>>,
    refresh_in_flight: AtomicBool,
}

impl NetworkState {
    /// Seeds the state from the caller's node URLs. Fails if the URL list
    /// is empty; the topology is non-empty for as long as the state lives.
    pub fn new(
        urls: &[String],
        database: &str,
        conventions: Arc<Conventions>,
        transport: TransportOptions,
    ) -> Result<Self> {
        let topology = Arc::new(RwLock::new(Topology::seed(urls, database)?));
        Ok(Self {
            database: database.to_string(),
            conventions,
            transport,
            selector: NodeSelector::new(topology.clone()),
            topology,
            refresh_in_flight: AtomicBool::new(false),
        })
    }

    /// Shared handle to the topology, for executors that stamp the etag
    /// header at submission time.
    pub fn topology_handle(&self) -> Arc<RwLock<Topology>> {
        self.topology.clone()
    }

    /// A point-in-time snapshot of the cluster view.
    pub async fn topology(&self) -> Topology {
        self.topology.read().await.clone()
    }

    pub async fn etag(&self) -> String {
        self.topology.read().await.etag.clone()
    }

    /// Re-fetches the topology through the given executor and swaps it in.
    ///
    /// Idempotent under concurrency: while one refresh is in flight, further
    /// calls return immediately: the server asked for *a* refresh, not one
    /// per response that carried the header.
    pub async fn refresh(&self, executor: &ExecutorHandle) -> Result<()> {
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let result = self.refresh_inner(executor).await;
        self.refresh_in_flight.store(false, Ordering::Release);
        result
    }

    async fn refresh_inner(&self, executor: &ExecutorHandle) -> Result<()> {
        let command =
            Command::GetClusterTopology(GetClusterTopologyCommand::new(self.database.clone()));
        let response = executor
            .execute(command, Vec::new(), RequestOptions::default())
            .await?;

        let fresh: Topology = serde_json::from_value(response.body)
            .map_err(|e| VellumError::InvalidResponsePayload(e.to_string()))?;
        if fresh.nodes.is_empty() {
            warn!("server returned a topology with no nodes, keeping the current one");
            return Err(VellumError::NoNodesAvailable);
        }

        let mut topology = self.topology.write().await;
        info!(
            old_etag = %topology.etag,
            new_etag = %fresh.etag,
            nodes = fresh.nodes.len(),
            "topology refreshed"
        );
        *topology = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_state() {
        let state = NetworkState::new(
            &["http://a:1".to_string()],
            "northwind",
            Arc::new(Conventions::default()),
            TransportOptions::default(),
        )
        .unwrap();

        assert_eq!(state.etag().await, "0");
        let topology = state.topology().await;
        assert_eq!(topology.nodes.len(), 1);
        assert_eq!(topology.nodes[0].database, "northwind");
    }

    #[tokio::test]
    async fn test_empty_urls_refused() {
        let result = NetworkState::new(
            &[],
            "northwind",
            Arc::new(Conventions::default()),
            TransportOptions::default(),
        );
        assert!(matches!(result, Err(VellumError::NoNodesAvailable)));
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_later_swaps() {
        let state = NetworkState::new(
            &["http://a:1".to_string()],
            "db",
            Arc::new(Conventions::default()),
            TransportOptions::default(),
        )
        .unwrap();

        let snapshot = state.topology().await;
        *state.topology_handle().write().await =
            Topology::seed(&["http://b:1".to_string()], "db").unwrap();

        assert_eq!(snapshot.nodes[0].url, "http://a:1");
        assert_eq!(state.topology().await.nodes[0].url, "http://b:1");
    }
}
