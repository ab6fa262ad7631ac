//! Protocol definitions shared by every driver component.
//!
//! The server speaks HTTP/1.1 with JSON bodies. This module holds the
//! pieces of that contract the rest of the driver builds on:
//!
//! - **[`error`]**: the [`VellumError`] taxonomy with retryable /
//!   non-retryable classification and the crate-wide [`Result`] alias
//! - **[`commands`]**: the [`Command`] sum type: one variant per server
//!   endpoint, each rendering itself into a [`RawRequest`] against a node
//! - **[`topology`]**: the cluster view ([`Topology`], [`ServerNode`])
//! - **[`batch`]**: `bulk_docs` payloads and result discriminators

pub mod batch;
pub mod commands;
pub mod error;
pub mod topology;


pub use batch::{BatchResultType, DeleteCommandData, PutCommandData, SaveChangesData};
pub use commands::{
    BatchCommand, Command, GetClusterTopologyCommand, GetDocumentsCommand, RawRequest,
};
pub use error::{Result, VellumError};
pub use topology::{Scheme, ServerNode, Topology};
