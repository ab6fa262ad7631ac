//! Vellum client.
//!
//! This crate is the driver core: open a [`DocumentStore`] against a named
//! database exposed by one or more server nodes, open sessions that behave
//! as units of work, and let the request layer route every command across
//! the cluster with retries, topology refresh, and failover.
//!
//! # Architecture
//!
//! - **[`connection`]**: one persistent hyper HTTP/1.1 connection per
//!   node, streaming responses back as wire events
//! - **[`executor`]**: the per-node actor that submits commands, assembles
//!   and classifies responses, and drives the retry loop
//! - **[`node_selector`]** / **[`network_state`]**: which node serves the
//!   next request, and the shared cluster view it comes from
//! - **[`session`]**: the unit-of-work actor: staged documents, staged
//!   deletions, deferred commands, one batched commit
//! - **[`store`]**: lifecycle glue: registries, failover, the topology
//!   refresher
//!
//! # Example
//!
//! ```no_run
//! use vellum_client::DocumentStore;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = DocumentStore::new(
//!         vec!["http://127.0.0.1:8080".to_string()],
//!         "northwind",
//!     )?;
//!
//!     let session = store.open_session().await?;
//!     session.store(json!({"id": "users/1", "name": "a"})).await?;
//!     session.save_changes().await?;
//!
//!     let user = session.load("users/1").await?;
//!     println!("loaded: {user}");
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod executor;
pub mod network_state;
pub mod node_selector;
pub mod session;
pub mod store;

pub use connection::{RequestRef, TransportOptions, WireEvent};
pub use executor::{ExecutorHandle, RequestOptions, ServerResponse};
pub use network_state::NetworkState;
pub use node_selector::NodeSelector;
pub use session::{DeletedEntity, DocumentInfo, SaveChangesSummary, SessionHandle};
pub use store::DocumentStore;

pub use vellum_common::{Conventions, VellumError};
