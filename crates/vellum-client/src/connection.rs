//! One persistent HTTP connection to one server node.
//!
//! A [`NodeConnection`] owns a hyper HTTP/1.1 client connection exclusively:
//! the request executor that created it is the only submitter, and a
//! dedicated task drives the hyper connection future. Submitted requests are
//! sent FIFO on the wire; each response is streamed back to the owning
//! executor's inbox as a sequence of [`WireEvent`]s keyed by the request's
//! [`RequestRef`], so the executor can assemble and classify it
//! incrementally.
//!
//! Transport-level failures (connect refused, TLS failure, connection reset)
//! surface as [`WireEvent::TransportClosed`] and end the owning executor.
//! HTTP-level failures on a single response surface as
//! [`WireEvent::StreamError`] for that request only; the connection keeps
//! serving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderValue, HOST};
use hyper::{HeaderMap, Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;
use vellum_common::{Result, Scheme, ServerNode, VellumError};

/// Opaque identifier tagging one in-flight request on the wire.
pub type RequestRef = u64;

static REQUEST_REF_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_ref() -> RequestRef {
    // Relaxed is enough, only uniqueness matters
    REQUEST_REF_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Caller-supplied transport configuration.
///
/// The driver performs no key management: the certificate blob and path are
/// carried opaquely, and `https` nodes use the prebuilt rustls config as-is.
#[derive(Clone, Default)]
pub struct TransportOptions {
    /// Opaque client certificate blob, carried for the caller's TLS setup.
    pub certificate: Option<Vec<u8>>,
    /// Path the certificate was loaded from, if any.
    pub certificate_path: Option<String>,
    /// TLS client configuration; required for `https` nodes.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("certificate", &self.certificate.as_ref().map(|c| c.len()))
            .field("certificate_path", &self.certificate_path)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Events streamed from the connection to the owning executor, one response
/// unfolding as `Status`, `Headers`, zero or more `Data` chunks, then `Done`.
#[derive(Debug)]
pub enum WireEvent {
    Status {
        request_ref: RequestRef,
        code: u16,
    },
    Headers {
        request_ref: RequestRef,
        headers: HeaderMap,
    },
    Data {
        request_ref: RequestRef,
        chunk: Bytes,
    },
    Done {
        request_ref: RequestRef,
    },
    /// HTTP-level failure on one response; the connection continues.
    StreamError {
        request_ref: RequestRef,
        error: VellumError,
    },
    /// The connection itself is gone; no further events will arrive.
    TransportClosed {
        reason: String,
    },
}

struct Submission {
    request_ref: RequestRef,
    request: Request<Full<Bytes>>,
}

/// Submit handle for one persistent connection.
pub struct NodeConnection {
    submit_tx: mpsc::UnboundedSender<Submission>,
    authority: String,
}

impl NodeConnection {
    /// Establishes the TCP (and for `https`, TLS) transport, performs the
    /// HTTP/1.1 handshake, and spawns the connection driver plus the submit
    /// loop. A connect failure is returned to the caller; nothing is
    /// spawned in that case.
    pub async fn connect(
        node: &ServerNode,
        transport: &TransportOptions,
        events: mpsc::UnboundedSender<WireEvent>,
    ) -> Result<Self> {
        let (scheme, host, port) = node.endpoint()?;
        let authority = format!("{host}:{port}");

        let tls_config = match scheme {
            Scheme::Http => None,
            Scheme::Https => Some(transport.tls.clone().ok_or_else(|| {
                VellumError::Tls(format!(
                    "node {} uses https but no TLS client configuration was supplied",
                    node.url
                ))
            })?),
        };

        let tcp = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
            VellumError::Connection(format!("failed to connect to {authority}: {e}"))
        })?;

        let sender = match tls_config {
            None => {
                let (sender, conn) = http1::handshake(TokioIo::new(tcp))
                    .await
                    .map_err(|e| VellumError::Connection(e.to_string()))?;
                spawn_connection_driver(conn, events.clone());
                sender
            }
            Some(config) => {
                let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                    .map_err(|_| VellumError::Tls(format!("invalid TLS server name '{host}'")))?;
                let tls = tokio_rustls::TlsConnector::from(config)
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| VellumError::Tls(e.to_string()))?;
                let (sender, conn) = http1::handshake(TokioIo::new(tls))
                    .await
                    .map_err(|e| VellumError::Connection(e.to_string()))?;
                spawn_connection_driver(conn, events.clone());
                sender
            }
        };

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_submit_loop(sender, submit_rx, events));

        debug!(%authority, "node connection established");
        Ok(Self {
            submit_tx,
            authority,
        })
    }

    /// Enqueues one request and returns the ref its wire events will carry.
    ///
    /// The URL is reduced to origin-form for the request line; the
    /// connection's authority becomes the `Host` header.
    pub fn submit(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Option<&Value>,
    ) -> Result<RequestRef> {
        let request_ref = next_request_ref();

        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(value)?),
            None => Bytes::new(),
        };

        headers.insert(
            HOST,
            HeaderValue::from_str(&self.authority)
                .map_err(|e| VellumError::Http(e.to_string()))?,
        );

        let mut request = Request::builder()
            .method(method)
            .uri(origin_form(url))
            .body(Full::new(payload))?;
        *request.headers_mut() = headers;

        self.submit_tx
            .send(Submission {
                request_ref,
                request,
            })
            .map_err(|_| VellumError::Connection("connection is closed".to_string()))?;

        Ok(request_ref)
    }
}

/// Strips scheme and authority so the request line stays in origin-form.
fn origin_form(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            match rest.find('/') {
                Some(path_start) => &rest[path_start..],
                None => "/",
            }
        }
        None => url,
    }
}

fn spawn_connection_driver<I>(
    conn: http1::Connection<I, Full<Bytes>>,
    events: mpsc::UnboundedSender<WireEvent>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reason = match conn.await {
            Ok(()) => "connection closed".to_string(),
            Err(e) => e.to_string(),
        };
        let _ = events.send(WireEvent::TransportClosed { reason });
    });
}

/// Sends queued requests FIFO and streams every response back as events.
///
/// HTTP/1.1 completes responses in submission order, so one response is
/// streamed to the end before the next queued request goes out; callers
/// queue freely in the submit channel meanwhile.
async fn run_submit_loop(
    mut sender: SendRequest<Full<Bytes>>,
    mut submit_rx: mpsc::UnboundedReceiver<Submission>,
    events: mpsc::UnboundedSender<WireEvent>,
) {
    while let Some(Submission {
        request_ref,
        request,
    }) = submit_rx.recv().await
    {
        if let Err(e) = sender.ready().await {
            let _ = events.send(WireEvent::TransportClosed {
                reason: e.to_string(),
            });
            return;
        }

        let response = match sender.send_request(request).await {
            Ok(response) => response,
            Err(e) => {
                // the request never completed; the executor may retry it
                let _ = events.send(WireEvent::StreamError {
                    request_ref,
                    error: VellumError::Connection(e.to_string()),
                });
                continue;
            }
        };

        let (parts, mut body) = response.into_parts();
        let _ = events.send(WireEvent::Status {
            request_ref,
            code: parts.status.as_u16(),
        });
        let _ = events.send(WireEvent::Headers {
            request_ref,
            headers: parts.headers,
        });

        let mut completed = true;
        while let Some(next) = body.frame().await {
            match next {
                Ok(frame) => {
                    if let Ok(chunk) = frame.into_data() {
                        let _ = events.send(WireEvent::Data { request_ref, chunk });
                    }
                }
                Err(e) => {
                    let _ = events.send(WireEvent::StreamError {
                        request_ref,
                        error: VellumError::Http(e.to_string()),
                    });
                    completed = false;
                    break;
                }
            }
        }
        if completed {
            let _ = events.send(WireEvent::Done { request_ref });
        }
    }
}
