//! The single outward-facing HTTP endpoint.
//!
//! Serves the aggregated exposition payload on `/metrics` (and on `/`,
//! for scrapers configured with a bare host address). Everything else
//! is a plain 404.

use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::exposition::CONTENT_TYPE_004;
use crate::pipeline::{MetricsAggregator, accepts_gzip, gzip};

async fn serve_metrics(
    State(aggregator): State<Arc<MetricsAggregator>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let body = match aggregator.aggregate(query.as_deref()).await {
        Ok(body) => body,
        Err(err) => {
            log::error!("failed to assemble metrics payload: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to assemble metrics payload",
            )
                .into_response();
        }
    };

    let wants_gzip = accepts_gzip(
        headers
            .get_all(header::ACCEPT_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    );
    if !wants_gzip {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_004)],
            body,
        )
            .into_response();
    }
    match gzip(&body) {
        Ok(compressed) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, CONTENT_TYPE_004),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            compressed,
        )
            .into_response(),
        Err(err) => {
            log::error!("failed to compress metrics payload: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to compress metrics payload",
            )
                .into_response()
        }
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub struct MetricsServer {
    router: axum::Router,
}

impl MetricsServer {
    pub fn new(aggregator: Arc<MetricsAggregator>) -> Self {
        let router = axum::Router::new()
            .route("/metrics", get(serve_metrics))
            .route("/", get(serve_metrics))
            .fallback(not_found)
            .with_state(aggregator);
        Self { router }
    }

    pub async fn listen(self, addr: impl ToSocketAddrs) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router.into_make_service()).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::pipeline::EndpointSource;
    use crate::registry::Endpoint;

    struct NoEndpoints;

    impl EndpointSource for NoEndpoints {
        fn endpoints(&self) -> Vec<Endpoint> {
            Vec::new()
        }
    }

    async fn spawn_server() -> SocketAddr {
        let aggregator = Arc::new(MetricsAggregator::new(Arc::new(NoEndpoints)));
        let server = MetricsServer::new(aggregator);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, server.router.into_make_service())
                .await
                .unwrap()
        });
        addr
    }

    async fn request(addr: SocketAddr, target: &str, extra_headers: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!(
                    "GET {target} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n{extra_headers}\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn metrics_route_serves_the_exposition_payload() {
        let addr = spawn_server().await;
        let response = request(addr, "/metrics", "").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-type: text/plain; version=0.0.4; charset=utf-8\r\n"));
        assert!(response.ends_with("#KADVISOR\n"));
    }

    #[tokio::test]
    async fn root_route_serves_the_same_payload() {
        let addr = spawn_server().await;
        let response = request(addr, "/", "").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("#KADVISOR\n"));
    }

    #[tokio::test]
    async fn unknown_routes_get_a_plain_404() {
        let addr = spawn_server().await;
        let response = request(addr, "/healthz", "").await;

        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("Not Found"));
    }

    #[tokio::test]
    async fn gzip_is_applied_when_the_scraper_accepts_it() {
        let addr = spawn_server().await;
        let response = request(addr, "/metrics", "Accept-Encoding: deflate, gzip\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-encoding: gzip\r\n"));
    }

    #[tokio::test]
    async fn gzip_is_skipped_without_a_matching_token() {
        let addr = spawn_server().await;
        let response = request(addr, "/metrics", "Accept-Encoding: br\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!response.contains("content-encoding"));
    }
}
