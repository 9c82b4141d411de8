use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::Path,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Largest body served by `/bytes/{n}`.
pub const MAX_BYTES: usize = 16 * 1024 * 1024;

/// What `/inspect` saw of the request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inspection {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Header names are lowercase; repeated headers keep the last value.
    pub headers: BTreeMap<String, String>,
    pub body_len: usize,
}

pub fn app() -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/status/{code}", any(status))
        .route("/echo", any(echo))
        .route("/inspect", any(inspect))
        .route("/bytes/{n}", get(bytes))
        .layer(middleware::map_response(stamp_request_id))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Serve on a random loopback port from a background thread with its own
/// current-thread runtime. Returns the bound address.
pub fn spawn() -> std::io::Result<SocketAddr> {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = std_listener.local_addr()?;
    std_listener.set_nonblocking(true)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::spawn(move || {
        rt.block_on(async move {
            let served = match TcpListener::from_std(std_listener) {
                Ok(listener) => run(listener).await,
                Err(e) => Err(e),
            };
            if let Err(e) = served {
                tracing::error!(%addr, error = %e, "mock server stopped");
            }
        });
    });
    Ok(addr)
}

async fn stamp_request_id(mut response: Response) -> Response {
    if let Ok(id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        response.headers_mut().insert("x-request-id", id);
    }
    response
}

async fn hello() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "hello")
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    tracing::debug!(%method, bytes = body.len(), "echo");
    (
        [
            (header::CONTENT_TYPE, content_type.to_str().unwrap_or_default().to_string()),
            (header::HeaderName::from_static("x-echo-method"), method.to_string()),
        ],
        body,
    )
}

async fn inspect(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Inspection> {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    Json(Inspection {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body_len: body.len(),
    })
}

async fn bytes(Path(n): Path<usize>) -> Result<Vec<u8>, StatusCode> {
    if n > MAX_BYTES {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    Ok(pattern(n))
}

/// Deterministic body content served by `/bytes/{n}`.
pub fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}
