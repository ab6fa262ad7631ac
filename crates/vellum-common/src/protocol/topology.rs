//! Cluster topology wire types.
//!
//! A [`Topology`] is the cluster view the server hands back from its
//! topology endpoint: an opaque etag plus an ordered node list. The driver
//! swaps in a fresh instance on every refresh and never mutates one in
//! place.

use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, VellumError};

/// Immutable identity of one server node.
///
/// `url` is the server root (scheme, host, port); the node serves exactly
/// one `database`. Mutable runtime state (health, the connection handle,
/// in-flight requests) belongs to the request executor that owns the node,
/// not to this wire struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerNode {
    /// Server root URL, e.g. `http://live-test.example:8080`.
    pub url: String,
    /// Database this node serves.
    pub database: String,
    /// Cluster tag assigned by the server, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_tag: Option<String>,
}

impl ServerNode {
    /// Creates a node identity from a server root URL and database name.
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            cluster_tag: None,
        }
    }

    /// Base URL for database-scoped endpoints:
    /// `{url}/databases/{database}`.
    pub fn database_url(&self) -> String {
        format!("{}/databases/{}", self.url.trim_end_matches('/'), self.database)
    }

    /// Splits the node URL into `(scheme, host, port)`.
    ///
    /// The port defaults to 80 for `http` and 443 for `https` when the URL
    /// does not carry one explicitly.
    pub fn endpoint(&self) -> Result<(Scheme, String, u16)> {
        let (scheme, rest) = if let Some(rest) = self.url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(VellumError::Connection(format!(
                "node URL '{}' has no http/https scheme",
                self.url
            )));
        };

        let authority = rest.split('/').next().unwrap_or(rest);
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    VellumError::Connection(format!(
                        "node URL '{}' has an invalid port",
                        self.url
                    ))
                })?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), scheme.default_port()),
        };

        if host.is_empty() {
            return Err(VellumError::Connection(format!(
                "node URL '{}' has an empty host",
                self.url
            )));
        }

        Ok((scheme, host, port))
    }
}

/// URL scheme of a server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The cluster view: an etag plus an ordered, non-empty node list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    /// Opaque version token; echoed back to the server as `Topology-Etag`.
    pub etag: String,
    /// Ordered node list; the node selector indexes into it.
    pub nodes: Vec<ServerNode>,
}

impl Topology {
    /// Seeds an initial topology from caller-supplied URLs, before the
    /// first refresh has run. The etag starts at `"0"` so any server-side
    /// topology is considered newer.
    pub fn seed(urls: &[String], database: &str) -> Result<Self> {
        if urls.is_empty() {
            return Err(VellumError::NoNodesAvailable);
        }
        Ok(Self {
            etag: "0".to_string(),
            nodes: urls
                .iter()
                .map(|url| ServerNode::new(url.clone(), database.to_string()))
                .collect(),
        })
    }
}
