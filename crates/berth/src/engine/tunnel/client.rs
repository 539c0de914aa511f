//! HTTP/1.1 client for the `berth-service` socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use berth_protocol::wire::{ErrorResponse, codes};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::engine::EngineContext;
use crate::error::{EngineError, EngineResult};

/// Aborts the connection task when the request is finished or dropped.
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Client bound to one service socket.
///
/// Each request opens its own connection, so a cancelled call never leaves
/// a half-read response on a shared connection.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    socket_path: PathBuf,
    requests: Arc<AtomicUsize>,
}

impl ServiceClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of requests attempted so far.
    pub fn requests_sent(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub async fn get<T: DeserializeOwned>(&self, ctx: &EngineContext, path: &str) -> EngineResult<T> {
        ctx.run(async {
            let bytes = self.request(Method::GET, path, None).await?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        ctx: &EngineContext,
        path: &str,
        body: Option<&B>,
    ) -> EngineResult<T> {
        ctx.run(async {
            let body = body.map(serde_json::to_vec).transpose()?;
            let bytes = self.request(Method::POST, path, body).await?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .await
    }

    /// POST expecting no response body.
    pub async fn post_empty(&self, ctx: &EngineContext, path: &str) -> EngineResult<()> {
        ctx.run(async {
            self.request(Method::POST, path, None).await?;
            Ok(())
        })
        .await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        ctx: &EngineContext,
        path: &str,
    ) -> EngineResult<T> {
        ctx.run(async {
            let bytes = self.request(Method::DELETE, path, None).await?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .await
    }

    pub async fn delete_empty(&self, ctx: &EngineContext, path: &str) -> EngineResult<()> {
        ctx.run(async {
            self.request(Method::DELETE, path, None).await?;
            Ok(())
        })
        .await
    }

    /// GET `path` and stream the response body into `out`. Returns the byte count.
    pub async fn download<W>(&self, ctx: &EngineContext, path: &str, out: &mut W) -> EngineResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        ctx.run(async {
            let (response, _conn) = self.send(Method::GET, path, None).await?;
            let mut body = check_status(response).await?.into_body();
            let mut written = 0u64;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| EngineError::transport(format!("reading body: {e}")))?;
                if let Ok(data) = frame.into_data() {
                    out.write_all(&data).await?;
                    written += data.len() as u64;
                }
            }
            out.flush().await?;
            Ok(written)
        })
        .await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> EngineResult<Bytes> {
        let (response, _conn) = self.send(method, path, body).await?;
        let response = check_status(response).await?;
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| EngineError::transport(format!("reading body: {e}")))?
            .to_bytes();
        Ok(bytes)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> EngineResult<(Response<Incoming>, ConnectionGuard)> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            EngineError::transport(format!(
                "cannot connect to service at {}: {e}",
                self.socket_path.display()
            ))
        })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| EngineError::transport(format!("HTTP handshake failed: {e}")))?;
        let guard = ConnectionGuard(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("service connection closed: {}", e);
            }
        }));

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(format!("http://localhost{path}"))
            .header("Host", "localhost");
        let payload = match body {
            Some(bytes) => {
                builder = builder
                    .header("Content-Type", "application/json")
                    .header("Content-Length", bytes.len());
                Bytes::from(bytes)
            }
            None => Bytes::new(),
        };
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| EngineError::transport(format!("building request: {e}")))?;

        trace!(%method, path, "sending request");
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| EngineError::transport(format!("sending request: {e}")))?;
        Ok((response, guard))
    }
}

/// Turn a non-2xx response into the error its body describes.
async fn check_status(response: Response<Incoming>) -> EngineResult<Response<Incoming>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| EngineError::transport(format!("reading error body: {e}")))?
        .to_bytes();
    Err(error_from_body(status, &bytes))
}

fn error_from_body(status: StatusCode, bytes: &[u8]) -> EngineError {
    match serde_json::from_slice::<ErrorResponse>(bytes) {
        Ok(body) => EngineError::from_response(status.as_u16(), body),
        Err(_) => EngineError::Remote {
            status: status.as_u16(),
            code: codes::INTERNAL.to_string(),
            message: String::from_utf8_lossy(bytes).trim().to_string(),
        },
    }
}

/// `?key=value&...` with every value percent-encoded. Empty when `pairs` is.
pub(crate) fn query_string(pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect();
    format!("?{}", joined.join("&"))
}

/// Percent-encode one path segment.
pub(crate) fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_encodes_values() {
        assert_eq!(query_string(&[]), "");
        let q = query_string(&[
            ("all", "true".to_string()),
            ("filters", r#"{"reference":["a b"]}"#.to_string()),
        ]);
        assert_eq!(q, "?all=true&filters=%7B%22reference%22%3A%5B%22a%20b%22%5D%7D");
    }

    #[test]
    fn test_segment_escapes_slash() {
        assert_eq!(segment("mirror/alpine:3"), "mirror%2Falpine%3A3");
    }

    #[test]
    fn test_error_from_plain_body() {
        let err = error_from_body(StatusCode::BAD_GATEWAY, b"upstream down\n");
        match err {
            EngineError::Remote { status, message, .. } => {
                assert_eq!(status, 502);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ServiceClient::new(dir.path().join("missing.sock"));
        let err = client
            .get::<serde_json::Value>(&EngineContext::new(), "/v1/_ping")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert_eq!(client.requests_sent(), 1);
    }
}
