//! In-process mock database server for driver tests.
//!
//! Binds a real TCP listener on `127.0.0.1:0` and speaks just enough
//! HTTP/1.1 to serve the driver: persistent connections, one canned
//! response per request, chosen by a caller-supplied responder closure.
//! Every request is recorded so tests can assert on exactly what hit the
//! wire.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }

    /// Value of one query parameter, e.g. `id`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params(name).first().copied()
    }

    /// All values of a repeated query parameter, in order.
    pub fn query_params(&self, name: &str) -> Vec<&str> {
        let Some((_, query)) = self.target.split_once('?') else {
            return Vec::new();
        };
        query
            .split('&')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                (key == name).then_some(value)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay_ms: u64,
    pub close_connection: bool,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
            delay_ms: 0,
            close_connection: false,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
            delay_ms: 0,
            close_connection: false,
        }
    }

    /// Drops the connection instead of answering.
    pub fn drop_connection() -> Self {
        Self {
            close_connection: true,
            ..Self::empty(0)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

/// Starts the server. The responder sees each recorded request and its
/// zero-based position in the global request log.
pub async fn spawn_server<F>(responder: F) -> MockServer
where
    F: Fn(&RecordedRequest, usize) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock server");
    let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let responder = Arc::new(responder);

    let log = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_connection(socket, log.clone(), responder.clone()));
        }
    });

    MockServer { url, requests }
}

async fn serve_connection<F>(
    mut socket: TcpStream,
    log: Arc<Mutex<Vec<RecordedRequest>>>,
    responder: Arc<F>,
) where
    F: Fn(&RecordedRequest, usize) -> MockResponse + Send + Sync + 'static,
{
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(request) = read_request(&mut socket, &mut buffer).await {
        let index = {
            let mut log = log.lock().await;
            log.push(request.clone());
            log.len() - 1
        };
        let response = responder(&request, index);
        if response.close_connection {
            break;
        }
        if response.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(response.delay_ms)).await;
        }
        if socket
            .write_all(format_response(&response).as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn read_request(socket: &mut TcpStream, buffer: &mut Vec<u8>) -> Option<RecordedRequest> {
    loop {
        if let Some(headers_end) = find_subslice(buffer, b"\r\n\r\n") {
            let header_text = String::from_utf8_lossy(&buffer[..headers_end]).to_string();
            let mut lines = header_text.split("\r\n");
            let request_line = lines.next()?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next()?.to_string();
            let target = parts.next()?.to_string();
            let headers: Vec<(String, String)> = lines
                .filter_map(|line| {
                    line.split_once(':')
                        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                })
                .collect();

            let content_length = headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.parse::<usize>().ok())
                .unwrap_or(0);

            let body_start = headers_end + 4;
            while buffer.len() < body_start + content_length {
                if !read_more(socket, buffer).await {
                    return None;
                }
            }
            let body =
                String::from_utf8_lossy(&buffer[body_start..body_start + content_length])
                    .to_string();
            // keep pipelined bytes for the next request
            buffer.drain(..body_start + content_length);

            return Some(RecordedRequest {
                method,
                target,
                headers,
                body,
            });
        }

        if !read_more(socket, buffer).await {
            return None;
        }
    }
}

async fn read_more(socket: &mut TcpStream, buffer: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match socket.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buffer.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn format_response(response: &MockResponse) -> String {
    let reason = match response.status {
        200 => "OK",
        201 => "Created",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "OK",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n",
        response.status,
        reason,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head + &response.body
}

/// A canned single-document load response for the given id.
pub fn document_response(id: &str, entity: Value) -> MockResponse {
    let mut document = entity;
    if let Some(object) = document.as_object_mut() {
        object.insert(
            "@metadata".to_string(),
            serde_json::json!({
                "@id": id,
                "@change-vector": format!("A:1-{id}"),
                "@collection": "Users",
                "@last-modified": "2024-01-01T00:00:00Z"
            }),
        );
    }
    MockResponse::json(200, serde_json::json!({ "Results": [document], "Includes": {} }))
}
