//! Vellum common types.
//!
//! This crate carries the pieces of the driver every component agrees on:
//! the wire protocol (commands, topology, batch payloads), the error
//! taxonomy, and the store-wide conventions. The driver itself (connection
//! handling, request execution, sessions) lives in `vellum-client`.
//!
//! # Overview
//!
//! Vellum is a client driver for a document-oriented database cluster. The
//! server exposes database-scoped HTTP endpoints (`/docs`, `/bulk_docs`)
//! plus a server-root topology endpoint; all bodies are JSON.
//!
//! # Components
//!
//! - [`protocol`]: commands, topology, batch payloads, [`VellumError`]
//! - [`conventions`]: limits and toggles shared across a store
//!
//! # Example
//!
//! ```
//! use vellum_common::{Command, GetDocumentsCommand, ServerNode};
//!
//! let node = ServerNode::new("http://127.0.0.1:8080", "northwind");
//! let request = Command::GetDocuments(GetDocumentsCommand::single("users/1"))
//!     .create_request(&node)
//!     .unwrap();
//! assert!(request.is_read_request);
//! ```

pub mod conventions;
pub mod protocol;

pub use conventions::Conventions;
pub use protocol::*;
