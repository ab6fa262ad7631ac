//! The command contract.
//!
//! Every server endpoint the driver talks to is one variant of [`Command`].
//! A command is a value: it knows how to render itself into a
//! [`RawRequest`] against a concrete node, and the request executor
//! interprets the rest (headers, guards, retries). Adding an endpoint means
//! adding a variant and an arm in `create_request`; nothing else changes.

use hyper::Method;
use serde_json::{json, Value};

use crate::protocol::error::Result;
use crate::protocol::topology::ServerNode;

/// A fully rendered request, ready for submission on a connection.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub url: String,
    /// JSON body, absent for bodiless requests.
    pub body: Option<Value>,
    /// Read requests are subject to the local GET URL length guard.
    pub is_read_request: bool,
}

/// Sum type over the endpoints the driver core uses.
#[derive(Debug, Clone)]
pub enum Command {
    GetDocuments(GetDocumentsCommand),
    Batch(BatchCommand),
    GetClusterTopology(GetClusterTopologyCommand),
}

impl Command {
    /// Renders the command against a node, populating method, URL, body and
    /// the read/write flag.
    pub fn create_request(&self, node: &ServerNode) -> Result<RawRequest> {
        match self {
            Command::GetDocuments(cmd) => cmd.create_request(node),
            Command::Batch(cmd) => cmd.create_request(node),
            Command::GetClusterTopology(cmd) => cmd.create_request(node),
        }
    }
}

/// `GET {base}/docs`: load documents by id, optionally with includes.
///
/// Parameter encoding follows the server's conventions: `id` repeats once
/// per value, absent optionals are omitted entirely, booleans render
/// lower-case.
#[derive(Debug, Clone, Default)]
pub struct GetDocumentsCommand {
    pub ids: Vec<String>,
    pub start: Option<usize>,
    pub page_size: Option<usize>,
    pub metadata_only: Option<bool>,
    pub includes: Vec<String>,
}

impl GetDocumentsCommand {
    /// Command for a single document id.
    pub fn single(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            ..Default::default()
        }
    }

    /// Adds include paths resolved server-side alongside the documents.
    pub fn with_includes(mut self, includes: Vec<String>) -> Self {
        self.includes = includes;
        self
    }

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest> {
        let mut query = Vec::new();
        for id in &self.ids {
            query.push(format!("id={}", encode_query_value(id)));
        }
        if let Some(start) = self.start {
            query.push(format!("start={start}"));
        }
        if let Some(page_size) = self.page_size {
            query.push(format!("pageSize={page_size}"));
        }
        if let Some(metadata_only) = self.metadata_only {
            query.push(format!("metadataOnly={metadata_only}"));
        }
        for include in &self.includes {
            query.push(format!("includes={}", encode_query_value(include)));
        }

        Ok(RawRequest {
            method: Method::GET,
            url: format!("{}/docs?{}", node.database_url(), query.join("&")),
            body: None,
            is_read_request: true,
        })
    }
}

/// `POST {base}/bulk_docs`: commit a batch of commands in one round trip.
#[derive(Debug, Clone)]
pub struct BatchCommand {
    pub commands: Vec<Value>,
}

impl BatchCommand {
    pub fn new(commands: Vec<Value>) -> Self {
        Self { commands }
    }

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest> {
        Ok(RawRequest {
            method: Method::POST,
            url: format!("{}/bulk_docs", node.database_url()),
            body: Some(json!({ "Commands": self.commands })),
            is_read_request: false,
        })
    }
}

/// `GET {url}/topology?name={database}`: fetch the cluster view.
#[derive(Debug, Clone)]
pub struct GetClusterTopologyCommand {
    pub database: String,
}

impl GetClusterTopologyCommand {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest> {
        Ok(RawRequest {
            method: Method::GET,
            url: format!(
                "{}/topology?name={}",
                node.url.trim_end_matches('/'),
                encode_query_value(&self.database)
            ),
            body: None,
            is_read_request: true,
        })
    }
}

/// Percent-encodes the characters that would corrupt a query string.
///
/// Document ids routinely contain `/`, which is legal in a query component
/// and left as-is.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'%' | b'&' | b'+' | b'#' | b'?' | b'=' => {
                out.push_str(&format!("%{byte:02X}"));
            }
            byte if byte.is_ascii_graphic() => out.push(byte as char),
            // space, controls, non-ASCII
            byte => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
