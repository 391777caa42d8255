//! HTTP/JSON transport for the experiment engine.
//!
//! One task per connection; the head is parsed with `httparse`, the body is
//! read by `Content-Length`, and every request is answered and closed. Engine
//! calls are synchronous, so they run on the blocking pool.
//!
//! Routing lives in [`route`], a pure function over the engine, so it can be
//! exercised without sockets.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::bucketing::AssignmentDecision;
use crate::engine::ExperimentEngine;
use crate::error::ExperimentError;
use crate::model::{NewExperiment, TransitionAction};

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 1 << 20;
const MAX_HEADERS: usize = 32;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Query-string helpers
// ---------------------------------------------------------------------------

/// Simple percent-decoding for URL query parameters.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                match std::str::from_utf8(&hex).ok().and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => bytes.push(byte),
                    None => {
                        bytes.push(b'%');
                        bytes.extend_from_slice(&hex);
                    }
                }
            }
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse query string into key-value pairs. Later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self { status, body: json!({ "error": message.into() }) }
    }

    fn from_serialize<T: serde::Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, e.to_string()),
        }
    }

    pub fn to_http(&self) -> Vec<u8> {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            reason_phrase(self.status),
            body.len(),
            body,
        )
        .into_bytes()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        _ => "Internal Server Error",
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &ExperimentError) -> u16 {
    match err {
        ExperimentError::NotFound { .. } => 404,
        ExperimentError::Validation(_) => 422,
        ExperimentError::InvalidTransition { .. } | ExperimentError::NotDeletable { .. } => 409,
        _ => 500,
    }
}

fn from_error(err: ExperimentError) -> HttpResponse {
    let status = status_for(&err);
    if status == 500 {
        warn!(error = %err, "request failed");
    }
    HttpResponse::error(status, err.to_string())
}

fn respond<T: serde::Serialize>(result: crate::error::Result<T>, status: u16) -> HttpResponse {
    match result {
        Ok(v) => HttpResponse::from_serialize(status, &v),
        Err(e) => from_error(e),
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AssignBody {
    visitor_id: String,
}

#[derive(Debug, Deserialize)]
struct ConversionBody {
    visitor_id: String,
    customer_id: String,
    subscription_id: String,
    revenue_cents: u64,
}

#[derive(Debug, Deserialize)]
struct ChurnBody {
    customer_id: String,
    lifetime_revenue_cents: u64,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, HttpResponse> {
    serde_json::from_slice(body)
        .map_err(|e| HttpResponse::error(400, format!("invalid JSON body: {e}")))
}

fn assignment_json(decision: AssignmentDecision) -> Value {
    match decision {
        AssignmentDecision::Assigned(v) => json!({
            "assigned": true,
            "assignment_id": v.assignment_id,
            "variant_id": v.variant_id,
            "variant_name": v.variant_name,
            "price_cents": v.price_cents,
            "is_control": v.is_control,
        }),
        AssignmentDecision::NotAssigned(reason) => json!({
            "assigned": false,
            "reason": reason,
        }),
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Dispatch one request against the engine.
pub fn route(
    engine: &ExperimentEngine,
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
) -> HttpResponse {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        ("GET", ["health"]) => HttpResponse::ok(json!({ "status": "ok" })),

        ("POST", ["api", "experiments"]) => match parse_body::<NewExperiment>(body) {
            Ok(req) => respond(engine.create_experiment(req), 201),
            Err(resp) => resp,
        },
        ("GET", ["api", "experiments"]) => {
            let params = parse_query(query);
            match params.get("org").filter(|o| !o.is_empty()) {
                Some(org) => respond(engine.list_experiments(org), 200),
                None => HttpResponse::error(400, "missing required query parameter 'org'"),
            }
        }

        ("GET", ["api", "experiments", id]) => respond(engine.get_experiment(id), 200),
        ("DELETE", ["api", "experiments", id]) => match engine.delete_experiment(id) {
            Ok(()) => HttpResponse::ok(json!({ "deleted": true })),
            Err(e) => from_error(e),
        },

        ("GET", ["api", "experiments", id, "results"]) => respond(engine.get_results(id), 200),

        ("POST", ["api", "experiments", id, "assign"]) => match parse_body::<AssignBody>(body) {
            Ok(req) => match engine.assign_visitor(id, &req.visitor_id) {
                Ok(decision) => HttpResponse::ok(assignment_json(decision)),
                Err(e) => from_error(e),
            },
            Err(resp) => resp,
        },
        ("POST", ["api", "experiments", id, "conversions"]) => {
            match parse_body::<ConversionBody>(body) {
                Ok(req) => respond(
                    engine.record_conversion(
                        id,
                        &req.visitor_id,
                        &req.customer_id,
                        &req.subscription_id,
                        req.revenue_cents,
                    ),
                    200,
                ),
                Err(resp) => resp,
            }
        }
        ("POST", ["api", "experiments", id, "churns"]) => match parse_body::<ChurnBody>(body) {
            Ok(req) => respond(
                engine.record_churn(id, &req.customer_id, req.lifetime_revenue_cents),
                200,
            ),
            Err(resp) => resp,
        },
        ("POST", ["api", "experiments", id, action]) => match action.parse::<TransitionAction>() {
            Ok(action) => respond(engine.transition(id, action), 200),
            Err(_) => HttpResponse::error(404, format!("no such route: {path}")),
        },

        (_, ["health"]) | (_, ["api", "experiments", ..]) => {
            HttpResponse::error(405, format!("{method} not allowed on {path}"))
        }
        _ => HttpResponse::error(404, format!("no such route: {path}")),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind the API listener.
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Accept connections forever.
pub async fn run(listener: TcpListener, engine: Arc<ExperimentEngine>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "pricing experiment API listening");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, engine).await {
                warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(engine: Arc<ExperimentEngine>, addr: &str) -> std::io::Result<()> {
    let listener = bind(addr).await?;
    run(listener, engine).await
}

struct RequestHead {
    method: String,
    target: String,
    content_length: usize,
    header_len: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, BoxError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let content_length = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .map(|h| std::str::from_utf8(h.value).map(|v| v.trim().parse::<usize>()))
        .transpose()?
        .transpose()?
        .unwrap_or(0);
    Ok(Some(RequestHead {
        method: req.method.unwrap_or("GET").to_string(),
        target: req.path.unwrap_or("/").to_string(),
        content_length,
        header_len,
    }))
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: Arc<ExperimentEngine>,
) -> Result<(), BoxError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let head = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() > MAX_BODY_BYTES {
            stream.write_all(&HttpResponse::error(413, "request head too large").to_http()).await?;
            return Ok(());
        }
    };

    if head.content_length > MAX_BODY_BYTES {
        stream.write_all(&HttpResponse::error(413, "request body too large").to_http()).await?;
        return Ok(());
    }
    let body_end = head.header_len + head.content_length;
    while buf.len() < body_end {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = buf.get(head.header_len..body_end.min(buf.len())).unwrap_or(&[]).to_vec();

    let (path, query) = match head.target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (head.target.clone(), String::new()),
    };
    let method = head.method;
    let response =
        tokio::task::spawn_blocking(move || route(&engine, &method, &path, &query, &body)).await?;

    stream.write_all(&response.to_http()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
