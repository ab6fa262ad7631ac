//! The document store: lifecycle glue over one logical database.
//!
//! A [`DocumentStore`] is a cheap-clone handle bound to one database across
//! a cluster. It owns the network state, two registries (sessions and
//! per-node request executors), and the background task that refreshes the
//! topology when a server asks for it. Executors register on first use and
//! are respawned when their actor has died. Nothing here is a global;
//! every lookup goes through the store handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use vellum_common::{Command, Conventions, Result, ServerNode, Topology, VellumError};

use crate::connection::TransportOptions;
use crate::executor::{ExecutorHandle, RequestExecutor, RequestOptions, ServerResponse};
use crate::network_state::NetworkState;
use crate::session::{DocumentSession, SessionHandle};

/// Key of the executor registry: one executor per `(node URL, database)`.
type ExecutorKey = (String, String);

pub struct StoreInner {
    database: String,
    conventions: Arc<Conventions>,
    network: NetworkState,
    executors: RwLock<HashMap<ExecutorKey, ExecutorHandle>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    session_counter: AtomicU64,
    refresh_tx: mpsc::UnboundedSender<()>,
    refresher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Ok(mut refresher) = self.refresher.lock() {
            if let Some(task) = refresher.take() {
                task.abort();
            }
        }
    }
}

/// Handle to one logical database across a cluster.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    /// Opens a store with default conventions and plain-HTTP transport.
    pub fn new(urls: Vec<String>, database: impl Into<String>) -> Result<Self> {
        Self::with_conventions(
            urls,
            database,
            Conventions::default(),
            TransportOptions::default(),
        )
    }

    /// Opens a store with explicit conventions and transport options.
    pub fn with_conventions(
        urls: Vec<String>,
        database: impl Into<String>,
        conventions: Conventions,
        transport: TransportOptions,
    ) -> Result<Self> {
        let database = database.into();
        let conventions = Arc::new(conventions);
        let network = NetworkState::new(&urls, &database, conventions.clone(), transport)?;

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(StoreInner {
            database: database.clone(),
            conventions,
            network,
            executors: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            refresh_tx,
            refresher: std::sync::Mutex::new(None),
        });

        let refresher = tokio::spawn(run_topology_refresher(
            Arc::downgrade(&inner),
            refresh_rx,
        ));
        if let Ok(mut slot) = inner.refresher.lock() {
            *slot = Some(refresher);
        }

        info!(%database, nodes = urls.len(), "document store initialized");
        Ok(Self { inner })
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn conventions(&self) -> &Conventions {
        &self.inner.conventions
    }

    /// A point-in-time snapshot of the cluster view.
    pub async fn topology(&self) -> Topology {
        self.inner.network.topology().await
    }

    /// Opens a session and registers it under a store-unique id.
    pub async fn open_session(&self) -> Result<SessionHandle> {
        let id = format!(
            "session-{}",
            self.inner.session_counter.fetch_add(1, Ordering::Relaxed) + 1
        );
        let handle = DocumentSession::spawn(id.clone(), self.clone(), self.inner.conventions.clone());
        self.inner
            .sessions
            .write()
            .await
            .insert(id, handle.clone());
        Ok(handle)
    }

    /// Looks up a registered session by id.
    pub async fn session(&self, id: &str) -> Option<SessionHandle> {
        self.inner.sessions.read().await.get(id).cloned()
    }

    /// Deregisters a session. Its actor stops once the last caller handle
    /// is dropped; staged state is discarded with it.
    pub async fn close_session(&self, id: &str) {
        self.inner.sessions.write().await.remove(id);
    }

    /// Executes a command with failover: the current node first, rotating
    /// through the topology on retry-exhausted or transport errors, each
    /// node tried at most once. Non-retryable outcomes surface immediately.
    pub async fn execute(
        &self,
        command: Command,
        headers: Vec<(String, String)>,
        options: RequestOptions,
    ) -> Result<ServerResponse> {
        let attempts = self.inner.network.selector.node_count().await.max(1);
        let mut node = self.inner.network.selector.current_node().await?;
        let mut last_error = None;

        for attempt in 0..attempts {
            let result = match self.executor_for(&node).await {
                Ok(executor) => {
                    executor
                        .execute(command.clone(), headers.clone(), options.clone())
                        .await
                }
                Err(error) => Err(error),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt + 1 < attempts => {
                    warn!(
                        node = %node.url,
                        %error,
                        "node failed, rotating to the next topology node"
                    );
                    node = self.inner.network.selector.on_failure().await?;
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or(VellumError::NoNodesAvailable))
    }

    /// Returns the registered executor for a node, spawning one when none
    /// exists or the previous actor has died.
    pub(crate) async fn executor_for(&self, node: &ServerNode) -> Result<ExecutorHandle> {
        let key: ExecutorKey = (node.url.clone(), node.database.clone());

        {
            let executors = self.inner.executors.read().await;
            if let Some(handle) = executors.get(&key) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut executors = self.inner.executors.write().await;
        // the registration may have raced; re-check under the write lock
        if let Some(handle) = executors.get(&key) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let handle = RequestExecutor::spawn(
            node.clone(),
            self.inner.conventions.clone(),
            &self.inner.network.transport,
            self.inner.network.topology_handle(),
            self.inner.refresh_tx.clone(),
            true,
        )
        .await?;
        executors.insert(key, handle.clone());
        Ok(handle)
    }

    /// Refreshes the topology through the current node. Usually driven by
    /// the background refresher, but callable directly.
    pub async fn refresh_topology(&self) -> Result<()> {
        let node = self.inner.network.selector.current_node().await?;
        let executor = self.executor_for(&node).await?;
        self.inner.network.refresh(&executor).await
    }
}

/// Listens for refresh signals emitted by executors that saw a
/// `Refresh-Topology` response header. Holds only a weak handle so a
/// dropped store is not kept alive by its own background task.
async fn run_topology_refresher(
    store: Weak<StoreInner>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
) {
    while refresh_rx.recv().await.is_some() {
        let Some(inner) = store.upgrade() else {
            break;
        };
        let store = DocumentStore { inner };
        if let Err(error) = store.refresh_topology().await {
            warn!(%error, "topology refresh failed");
        }
    }
}
