//! Per-node request executor.
//!
//! One executor actor exists per `(node URL, database)` pair. It owns the
//! node's [`NodeConnection`] exclusively, accepts command executions from
//! any number of callers, parks each caller on a oneshot reply keyed by the
//! request ref, assembles the streamed wire events into a `(status,
//! headers, body)` triple, classifies the outcome, and drives the
//! constant-backoff retry loop for retryable outcomes.
//!
//! The actor starts only if the initial connect succeeds; whoever spawned
//! it decides what to do with a connect failure. A transport failure during
//! streaming answers every parked caller with a closed-channel error and
//! ends the actor; HTTP-level failures answer only the request they hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use hyper::HeaderMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use vellum_common::{Command, Conventions, RawRequest, Result, ServerNode, Topology, VellumError};

use crate::connection::{NodeConnection, RequestRef, TransportOptions, WireEvent};

const TOPOLOGY_ETAG: HeaderName = HeaderName::from_static("topology-etag");
const REFRESH_TOPOLOGY: &str = "Refresh-Topology";
const DATABASE_MISSING: &str = "Database-Missing";

/// Per-call retry policy.
///
/// Retries apply only to outcomes classified retryable, sleep a constant
/// `retry_backoff_ms` between attempts, and are off unless
/// `retry_on_failure` is set.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub retry_on_failure: bool,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            retry_on_failure: false,
            retry_count: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl RequestOptions {
    /// Retries enabled with the given bound and backoff.
    pub fn retrying(retry_count: u32, retry_backoff_ms: u64) -> Self {
        Self {
            retry_on_failure: true,
            retry_count,
            retry_backoff_ms,
        }
    }

    fn effective_retry_count(&self) -> u32 {
        if self.retry_on_failure {
            self.retry_count
        } else {
            0
        }
    }
}

/// A classified successful response.
#[derive(Debug)]
pub struct ServerResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Outcome of classifying one assembled response.
#[derive(Debug)]
pub(crate) enum Disposition {
    Success,
    Retry(VellumError),
    Fail(VellumError),
}

/// Classifies an assembled `(status, headers, body)` triple.
///
/// Pure: the same triple and policy always produce the same disposition.
/// The rules apply in order: specific statuses, then body-level error
/// markers, then the transient 5xx family.
pub(crate) fn classify_response(
    status: u16,
    headers: &HeaderMap,
    body: &Value,
    retry_on_stale: bool,
) -> Disposition {
    match status {
        404 => return Disposition::Fail(VellumError::DocumentNotFound),
        403 => return Disposition::Fail(VellumError::Unauthorized),
        409 => return Disposition::Retry(VellumError::Conflict(server_message(body))),
        410 => return Disposition::Retry(VellumError::NodeGone(server_message(body))),
        _ => {}
    }

    if body.get("Error").is_some() {
        return Disposition::Fail(VellumError::Server(server_message(body)));
    }

    if body.get("IsStale").and_then(Value::as_bool) == Some(true) {
        let message = server_message(body);
        return if retry_on_stale {
            Disposition::Retry(VellumError::Stale(message))
        } else {
            Disposition::Fail(VellumError::Stale(message))
        };
    }

    if matches!(status, 408 | 502 | 503 | 504) {
        let message = server_message(body);
        return if headers.contains_key(DATABASE_MISSING) {
            Disposition::Fail(VellumError::Server(message))
        } else {
            Disposition::Retry(VellumError::Unavailable(message))
        };
    }

    Disposition::Success
}

fn server_message(body: &Value) -> String {
    body.get("Message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "the server did not provide a message".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeHealth {
    Healthy,
    Unhealthy,
}

enum ExecutorMessage {
    Execute {
        command: Command,
        headers: Vec<(String, String)>,
        options: RequestOptions,
        respond_to: oneshot::Sender<Result<ServerResponse>>,
    },
    UpdateClusterTag {
        tag: String,
    },
}

struct InFlight {
    raw: RawRequest,
    extra_headers: Vec<(String, String)>,
    options: RequestOptions,
    attempts_left: u32,
    respond_to: oneshot::Sender<Result<ServerResponse>>,
    status: Option<u16>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl InFlight {
    fn reset_response(&mut self) {
        self.status = None;
        self.headers = HeaderMap::new();
        self.body.clear();
    }
}

/// Cheap-clone handle to a running executor actor.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<ExecutorMessage>,
    timeout: Duration,
}

impl ExecutorHandle {
    /// Executes a command against the owned node and awaits the classified
    /// reply, bounded by the conventions timeout. On timeout the reply
    /// channel is abandoned; the executor discards the eventual result.
    pub async fn execute(
        &self,
        command: Command,
        headers: Vec<(String, String)>,
        options: RequestOptions,
    ) -> Result<ServerResponse> {
        let (respond_to, reply) = oneshot::channel();
        self.tx
            .send(ExecutorMessage::Execute {
                command,
                headers,
                options,
                respond_to,
            })
            .map_err(|_| VellumError::ChannelClosed)?;

        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VellumError::ChannelClosed),
            Err(_) => Err(VellumError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    /// Updates the node's cluster tag; fire-and-forget.
    pub fn update_cluster_tag(&self, tag: impl Into<String>) {
        let _ = self.tx.send(ExecutorMessage::UpdateClusterTag { tag: tag.into() });
    }

    /// True once the actor has stopped and can no longer serve requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The executor actor. Constructed through [`RequestExecutor::spawn`].
pub struct RequestExecutor {
    node: ServerNode,
    health: NodeHealth,
    conventions: Arc<Conventions>,
    connection: NodeConnection,
    topology: Arc<RwLock<Topology>>,
    refresh_tx: mpsc::UnboundedSender<()>,
    retry_on_stale: bool,
    // backoff timers land here so the caller-facing inbox can close
    // independently of pending retries
    retry_tx: mpsc::UnboundedSender<RequestRef>,
    retry_rx: mpsc::UnboundedReceiver<RequestRef>,
    inbox: mpsc::UnboundedReceiver<ExecutorMessage>,
    wire: mpsc::UnboundedReceiver<WireEvent>,
    in_flight: HashMap<RequestRef, InFlight>,
}

impl RequestExecutor {
    /// Connects to the node and starts the actor.
    ///
    /// The connect happens before anything is spawned: a failure is
    /// returned to the caller and no actor exists afterwards.
    pub async fn spawn(
        node: ServerNode,
        conventions: Arc<Conventions>,
        transport: &TransportOptions,
        topology: Arc<RwLock<Topology>>,
        refresh_tx: mpsc::UnboundedSender<()>,
        retry_on_stale: bool,
    ) -> Result<ExecutorHandle> {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let connection = NodeConnection::connect(&node, transport, wire_tx).await?;

        let (tx, inbox) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let timeout = conventions.timeout;
        let executor = Self {
            node,
            health: NodeHealth::Healthy,
            conventions,
            connection,
            topology,
            refresh_tx,
            retry_on_stale,
            retry_tx,
            retry_rx,
            inbox,
            wire: wire_rx,
            in_flight: HashMap::new(),
        };
        tokio::spawn(executor.run());

        Ok(ExecutorHandle { tx, timeout })
    }

    async fn run(mut self) {
        info!(
            node = %self.node.url,
            database = %self.node.database,
            "request executor started"
        );

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    // every handle dropped; nothing can reach us again
                    None => break,
                },
                Some(request_ref) = self.retry_rx.recv() => {
                    if let Some(mut entry) = self.in_flight.remove(&request_ref) {
                        entry.reset_response();
                        self.submit_entry(entry).await;
                    }
                },
                event = self.wire.recv() => match event {
                    Some(WireEvent::TransportClosed { reason }) => {
                        self.on_transport_closed(&reason);
                        break;
                    }
                    Some(event) => self.handle_wire(event).await,
                    None => {
                        self.on_transport_closed("wire channel closed");
                        break;
                    }
                },
            }
        }

        info!(node = %self.node.url, "request executor stopped");
    }

    async fn handle_message(&mut self, message: ExecutorMessage) {
        match message {
            ExecutorMessage::Execute {
                command,
                headers,
                options,
                respond_to,
            } => self.handle_execute(command, headers, options, respond_to).await,
            ExecutorMessage::UpdateClusterTag { tag } => {
                debug!(node = %self.node.url, %tag, "cluster tag updated");
                self.node.cluster_tag = Some(tag);
            }
        }
    }

    async fn handle_execute(
        &mut self,
        command: Command,
        headers: Vec<(String, String)>,
        options: RequestOptions,
        respond_to: oneshot::Sender<Result<ServerResponse>>,
    ) {
        let raw = match command.create_request(&self.node) {
            Ok(raw) => raw,
            Err(error) => {
                let _ = respond_to.send(Err(error));
                return;
            }
        };

        // local guard: an over-long GET never touches the network.
        // character count per the conventions contract; a byte-limited
        // server would need raw.url.len() here instead.
        let url_chars = raw.url.chars().count();
        if raw.is_read_request && url_chars > self.conventions.max_length_of_query_using_get_url {
            let _ = respond_to.send(Err(VellumError::MaximumUrlLengthReached(url_chars)));
            return;
        }

        let entry = InFlight {
            attempts_left: options.effective_retry_count(),
            raw,
            extra_headers: headers,
            options,
            respond_to,
            status: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        self.submit_entry(entry).await;
    }

    /// Builds the header set for this submission and puts the request on
    /// the wire. Headers are rebuilt per attempt so the topology etag
    /// reflects the moment of submission.
    async fn submit_entry(&mut self, entry: InFlight) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if !self.conventions.disable_topology_update {
            let etag = self.topology.read().await.etag.clone();
            match HeaderValue::from_str(&etag) {
                Ok(value) => {
                    headers.insert(TOPOLOGY_ETAG, value);
                }
                Err(_) => warn!(%etag, "topology etag is not a valid header value"),
            }
        }

        for (name, value) in &entry.extra_headers {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    warn!(%name, "skipping invalid request header name");
                    continue;
                }
            };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name, value);
                }
                Err(_) => warn!("skipping invalid request header value"),
            }
        }

        match self.connection.submit(
            entry.raw.method.clone(),
            &entry.raw.url,
            headers,
            entry.raw.body.as_ref(),
        ) {
            Ok(request_ref) => {
                self.in_flight.insert(request_ref, entry);
            }
            Err(error) => {
                let _ = entry.respond_to.send(Err(error));
            }
        }
    }

    async fn handle_wire(&mut self, event: WireEvent) {
        match event {
            WireEvent::Status { request_ref, code } => {
                if let Some(entry) = self.in_flight.get_mut(&request_ref) {
                    entry.status = Some(code);
                }
            }
            WireEvent::Headers {
                request_ref,
                headers,
            } => {
                if let Some(entry) = self.in_flight.get_mut(&request_ref) {
                    entry.headers = headers;
                }
            }
            WireEvent::Data { request_ref, chunk } => {
                if let Some(entry) = self.in_flight.get_mut(&request_ref) {
                    entry.body.extend_from_slice(&chunk);
                }
            }
            WireEvent::Done { request_ref } => self.complete(request_ref).await,
            WireEvent::StreamError { request_ref, error } => {
                warn!(node = %self.node.url, %error, "response stream error");
                if let Some(entry) = self.in_flight.remove(&request_ref) {
                    if error.is_retryable() {
                        self.schedule_retry(request_ref, entry, error);
                    } else {
                        let _ = entry.respond_to.send(Err(error));
                    }
                }
            }
            WireEvent::TransportClosed { .. } => unreachable!("handled by the run loop"),
        }
    }

    /// Decodes and classifies a fully assembled response.
    async fn complete(&mut self, request_ref: RequestRef) {
        let Some(entry) = self.in_flight.remove(&request_ref) else {
            // a retry replaced the ref, or the transport already failed it
            debug!(request_ref, "done event for unknown request ref");
            return;
        };

        let status = entry.status.unwrap_or(0);
        let body = if entry.body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&entry.body) {
                Ok(value) => value,
                Err(e) => {
                    self.set_health(NodeHealth::Healthy);
                    let _ = entry
                        .respond_to
                        .send(Err(VellumError::InvalidResponsePayload(e.to_string())));
                    return;
                }
            }
        };

        match classify_response(status, &entry.headers, &body, self.retry_on_stale) {
            Disposition::Success => {
                self.set_health(NodeHealth::Healthy);
                if !self.conventions.disable_topology_update
                    && entry.headers.contains_key(REFRESH_TOPOLOGY)
                {
                    debug!(node = %self.node.url, "server requested a topology refresh");
                    let _ = self.refresh_tx.send(());
                }
                let _ = entry.respond_to.send(Ok(ServerResponse {
                    status,
                    headers: entry.headers,
                    body,
                }));
            }
            Disposition::Fail(error) => {
                self.set_health(NodeHealth::Healthy);
                let _ = entry.respond_to.send(Err(error));
            }
            Disposition::Retry(error) => {
                self.set_health(NodeHealth::Unhealthy);
                self.schedule_retry(request_ref, entry, error);
            }
        }
    }

    /// Consumes one retry attempt, or answers with the final error when the
    /// budget is spent. The backoff timer runs in its own task so other
    /// in-flight requests keep streaming.
    fn schedule_retry(&mut self, request_ref: RequestRef, mut entry: InFlight, error: VellumError) {
        if entry.attempts_left == 0 {
            let _ = entry.respond_to.send(Err(error));
            return;
        }
        entry.attempts_left -= 1;

        let backoff_ms = entry.options.retry_backoff_ms;
        warn!(
            node = %self.node.url,
            %error,
            backoff_ms,
            attempts_left = entry.attempts_left,
            "retrying request"
        );

        self.in_flight.insert(request_ref, entry);
        let tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            let _ = tx.send(request_ref);
        });
    }

    /// Fails every parked caller; the actor ends right after.
    fn on_transport_closed(&mut self, reason: &str) {
        warn!(node = %self.node.url, %reason, "transport closed");
        self.set_health(NodeHealth::Unhealthy);
        for (_, entry) in self.in_flight.drain() {
            let _ = entry.respond_to.send(Err(VellumError::ChannelClosed));
        }
    }

    fn set_health(&mut self, health: NodeHealth) {
        if self.health != health {
            debug!(node = %self.node.url, ?health, "node health changed");
            self.health = health;
        }
    }
}
