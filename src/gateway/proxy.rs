//! Request forwarding for the native gateway

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, Response, StatusCode};
use reqwest::{Client, Url};
use tracing::debug;

use crate::error::{LunaError, LunaResult};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards gateway requests to instance URLs over a shared HTTP client
pub struct ForwardingProxy {
    client: Client,
}

impl ForwardingProxy {
    /// Create new forwarding proxy
    pub fn new() -> LunaResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LunaError::Proxy(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Forward a request to `target` with its path replaced by `path`.
    ///
    /// The original query string, method, headers and body are carried
    /// over; hop-by-hop headers are stripped in both directions.
    pub async fn forward(
        &self,
        target: &Url,
        path: &str,
        request: Request,
    ) -> LunaResult<Response<Body>> {
        let mut url = target.clone();
        url.set_path(path);
        url.set_query(request.uri().query());

        debug!(target = %url, "forwarding request");

        let method = request.method().clone();
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers() {
            if should_skip_header(name) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        let body_bytes = to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| LunaError::Proxy(format!("failed to read request body: {}", e)))?;

        let mut upstream_request = self.client.request(method, url).headers(headers);
        if !body_bytes.is_empty() {
            upstream_request = upstream_request.body(body_bytes);
        }

        let upstream_response = upstream_request
            .send()
            .await
            .map_err(|e| LunaError::Proxy(format!("failed to forward request: {}", e)))?;

        let status = upstream_response.status();
        let response_headers = upstream_response.headers().clone();
        let response_bytes = upstream_response
            .bytes()
            .await
            .map_err(|e| LunaError::Proxy(format!("failed to read response body: {}", e)))?;

        let mut response = Response::builder()
            .status(status)
            .body(Body::from(response_bytes))
            .map_err(|e| LunaError::Proxy(format!("failed to build response: {}", e)))?;
        for (name, value) in &response_headers {
            if should_skip_header(name) {
                continue;
            }
            response.headers_mut().append(name.clone(), value.clone());
        }

        Ok(response)
    }
}

fn should_skip_header(name: &HeaderName) -> bool {
    let skip_headers = ["host", "connection", "content-length", "transfer-encoding"];
    skip_headers.contains(&name.as_str())
}

/// JSON error response in the gateway's envelope
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    json_response(status, body.to_string())
}

/// Body served for services whose most recent record reported DOWN
pub fn offline_response() -> Response<Body> {
    let body = serde_json::json!({ "online": false });
    json_response(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use axum::routing::any;
    use axum::Router;

    use super::*;

    async fn echo(request: Request<Body>) -> axum::Json<serde_json::Value> {
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or("").to_string();
        let headers = request.headers().clone();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let body = to_bytes(request.into_body(), MAX_BODY_BYTES).await.unwrap();
        axum::Json(serde_json::json!({
            "path": path,
            "query": query,
            "host": header("host"),
            "x-trace": header("x-trace"),
            "body": String::from_utf8_lossy(&body),
        }))
    }

    async fn spawn_echo_server() -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/{*rest}", any(echo));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr).parse().unwrap()
    }

    #[test]
    fn hop_by_hop_headers_are_skipped() {
        assert!(should_skip_header(&HeaderName::from_static("host")));
        assert!(should_skip_header(&HeaderName::from_static("connection")));
        assert!(should_skip_header(&HeaderName::from_static("content-length")));
        assert!(should_skip_header(&HeaderName::from_static(
            "transfer-encoding"
        )));
        assert!(!should_skip_header(&HeaderName::from_static("x-trace")));
        assert!(!should_skip_header(&HeaderName::from_static("accept")));
    }

    #[tokio::test]
    async fn error_response_carries_the_envelope() {
        let response = error_response(StatusCode::NOT_FOUND, "service 'orders' is not registered");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"], "service 'orders' is not registered");
        assert_eq!(value["status"], 404);
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn offline_response_reports_online_false() {
        let response = offline_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, serde_json::json!({ "online": false }));
    }

    #[tokio::test]
    async fn forward_rewrites_path_and_carries_the_request_over() {
        let target = spawn_echo_server().await;
        let proxy = ForwardingProxy::new().unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/orders/items?limit=5")
            .header("host", "luna")
            .header("x-trace", "abc")
            .body(Body::from("payload"))
            .unwrap();

        let response = proxy.forward(&target, "/items", request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["path"], "/items");
        assert_eq!(value["query"], "limit=5");
        assert_eq!(value["x-trace"], "abc");
        assert_eq!(value["body"], "payload");
        // the incoming host header is stripped, not forwarded
        assert_ne!(value["host"], "luna");
    }

    #[tokio::test]
    async fn forward_reports_unreachable_targets() {
        let proxy = ForwardingProxy::new().unwrap();
        // bind then drop a listener so the port is known to be closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target: Url = format!("http://{}/", addr).parse().unwrap();

        let request = Request::builder()
            .uri("/api/orders")
            .body(Body::empty())
            .unwrap();

        let result = proxy.forward(&target, "/", request).await;
        assert!(matches!(result, Err(LunaError::Proxy(_))));
    }
}
