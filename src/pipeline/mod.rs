//! Scrape fan-out and merge behind the `/metrics` endpoint.
//!
//! Every request triggers one scrape task per watched container. Each
//! task fetches and parses its agent's payload into private state; a
//! failing or malformed agent costs only its own samples. The
//! coordinator merges the survivors, derives the container-level
//! families and serializes the result.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::ResultOkLogExt;
use crate::exposition::{MetricFamily, ParseError, write_text};
use crate::registry::{Endpoint, WatchedContainerRegistry};

mod derive;

pub use derive::derive_container_metrics;

/// Per-agent budget covering connect, request and body read.
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// First line of every aggregated payload, marking it as merged output
/// rather than a single agent's.
const EXPOSITION_BANNER: &[u8] = b"#KADVISOR\n";

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("failed to connect to agent at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http handshake with agent at {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: hyper::Error,
    },
    #[error("failed to build scrape request for {addr}: {source}")]
    BuildRequest {
        addr: String,
        #[source]
        source: hyper::http::Error,
    },
    #[error("scrape of {addr} failed: {source}")]
    Request {
        addr: String,
        #[source]
        source: hyper::Error,
    },
    #[error("agent at {addr} returned status {status}")]
    Status { addr: String, status: StatusCode },
    #[error("scrape of {addr} timed out")]
    Timeout { addr: String },
    #[error("discarding malformed payload from {addr}: {source}")]
    Malformed {
        addr: String,
        #[source]
        source: ParseError,
    },
    #[error("scrape task failed: {source}")]
    Task {
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Where the scrape targets come from. The registry is the production
/// source.
pub trait EndpointSource: Send + Sync {
    fn endpoints(&self) -> Vec<Endpoint>;
}

impl EndpointSource for WatchedContainerRegistry {
    fn endpoints(&self) -> Vec<Endpoint> {
        WatchedContainerRegistry::endpoints(self)
    }
}

pub struct MetricsAggregator {
    source: Arc<dyn EndpointSource>,
    scrape_timeout: Duration,
}

impl MetricsAggregator {
    pub fn new(source: Arc<dyn EndpointSource>) -> Self {
        Self {
            source,
            scrape_timeout: SCRAPE_TIMEOUT,
        }
    }

    /// Scrapes every current endpoint in parallel and returns the
    /// merged exposition payload. `query` is the raw query string of
    /// the incoming request and is forwarded verbatim, so node-exporter
    /// collector filters keep working through the aggregation.
    pub async fn aggregate(&self, query: Option<&str>) -> std::io::Result<Vec<u8>> {
        let endpoints = self.source.endpoints();
        let mut scrapes = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let query = query.map(str::to_owned);
            let limit = self.scrape_timeout;
            scrapes.push(tokio::spawn(scrape_endpoint(endpoint, query, limit)));
        }

        let mut families: HashMap<String, MetricFamily> = HashMap::new();
        for handle in scrapes {
            let result = match handle.await {
                Ok(result) => result,
                Err(source) => Err(ScrapeError::Task { source }),
            };
            if let Some(scraped) = result.ok_log() {
                merge(&mut families, scraped);
            }
        }
        derive_container_metrics(&mut families);

        let mut names: Vec<&String> = families.keys().collect();
        names.sort();
        let mut out = Vec::new();
        out.extend_from_slice(EXPOSITION_BANNER);
        write_text(&mut out, names.into_iter().map(|name| &families[name]))?;
        Ok(out)
    }
}

/// Fetches and parses one agent, returning its families with the
/// endpoint's identity tags already injected.
async fn scrape_endpoint(
    endpoint: Endpoint,
    query: Option<String>,
    limit: Duration,
) -> Result<HashMap<String, MetricFamily>, ScrapeError> {
    let addr = format!("{}:{}", endpoint.ip_address, endpoint.port);
    let target = match query {
        Some(query) => format!("{}?{query}", endpoint.path),
        None => endpoint.path.clone(),
    };
    let body = tokio::time::timeout(limit, fetch(&addr, &target))
        .await
        .map_err(|_| ScrapeError::Timeout { addr: addr.clone() })??;

    let tags: Vec<(String, String)> = endpoint.tags.into_iter().collect();
    let mut families = HashMap::new();
    crate::exposition::collect(body.reader(), &mut families, &tags)
        .map_err(|source| ScrapeError::Malformed { addr, source })?;
    Ok(families)
}

async fn fetch(addr: &str, target: &str) -> Result<Bytes, ScrapeError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ScrapeError::Connect {
            addr: addr.to_owned(),
            source,
        })?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|source| ScrapeError::Handshake {
            addr: addr.to_owned(),
            source,
        })?;
    {
        let addr = addr.to_owned();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("connection to agent at {addr} ended: {err}");
            }
        });
    }

    // The agents always speak plain text; a compressed answer would
    // defeat the merge.
    let request = Request::builder()
        .method(Method::GET)
        .uri(target)
        .header(header::HOST, addr)
        .header(header::ACCEPT_ENCODING, "identity")
        .body(Full::new(Bytes::new()))
        .map_err(|source| ScrapeError::BuildRequest {
            addr: addr.to_owned(),
            source,
        })?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|source| ScrapeError::Request {
            addr: addr.to_owned(),
            source,
        })?;
    if response.status() != StatusCode::OK {
        return Err(ScrapeError::Status {
            addr: addr.to_owned(),
            status: response.status(),
        });
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|source| ScrapeError::Request {
            addr: addr.to_owned(),
            source,
        })?
        .to_bytes();
    Ok(body)
}

fn merge(into: &mut HashMap<String, MetricFamily>, from: HashMap<String, MetricFamily>) {
    for (name, family) in from {
        match into.entry(name) {
            Entry::Occupied(existing) => existing.into_mut().samples.extend(family.samples),
            Entry::Vacant(slot) => {
                slot.insert(family);
            }
        }
    }
}

/// Whether any `Accept-Encoding` value lists gzip. Header values are
/// comma-separated token lists and may repeat across header lines.
pub fn accepts_gzip<'a>(values: impl IntoIterator<Item = &'a str>) -> bool {
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("gzip"))
}

pub fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    struct StaticEndpoints(Vec<Endpoint>);

    impl EndpointSource for StaticEndpoints {
        fn endpoints(&self) -> Vec<Endpoint> {
            self.0.clone()
        }
    }

    fn endpoint(port: u16, name: &str) -> Endpoint {
        Endpoint {
            ip_address: "127.0.0.1".to_owned(),
            port,
            path: "/metrics".to_owned(),
            tags: BTreeMap::from([("name".to_owned(), name.to_owned())]),
        }
    }

    fn aggregator(endpoints: Vec<Endpoint>) -> MetricsAggregator {
        MetricsAggregator::new(Arc::new(StaticEndpoints(endpoints)))
    }

    /// Answers a single plain-HTTP scrape and returns the raw request
    /// bytes the client sent.
    async fn serve_once(listener: TcpListener, body: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    const UP: &str = "# TYPE up gauge\nup 1\n";

    #[tokio::test]
    async fn aggregates_and_tags_multiple_agents() {
        let (l1, p1) = listener().await;
        let (l2, p2) = listener().await;
        let s1 = tokio::spawn(serve_once(l1, UP));
        let s2 = tokio::spawn(serve_once(l2, UP));

        let body = aggregator(vec![endpoint(p1, "web-1"), endpoint(p2, "web-2")])
            .aggregate(None)
            .await
            .unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.starts_with("#KADVISOR\n"));
        assert!(text.contains("up{name=\"web-1\"} 1\n"));
        assert!(text.contains("up{name=\"web-2\"} 1\n"));
        s1.await.unwrap();
        s2.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_agent_does_not_poison_the_scrape() {
        let (dead, dead_port) = listener().await;
        drop(dead);
        let (live, live_port) = listener().await;
        let server = tokio::spawn(serve_once(live, UP));

        let body = aggregator(vec![endpoint(dead_port, "gone"), endpoint(live_port, "web-1")])
            .aggregate(None)
            .await
            .unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.contains("up{name=\"web-1\"} 1\n"));
        assert!(!text.contains("gone"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_whole() {
        let (bad, bad_port) = listener().await;
        let (good, good_port) = listener().await;
        let s1 = tokio::spawn(serve_once(bad, "# TYPE junk gauge\njunk one two three\n"));
        let s2 = tokio::spawn(serve_once(good, UP));

        let body = aggregator(vec![endpoint(bad_port, "bad"), endpoint(good_port, "web-1")])
            .aggregate(None)
            .await
            .unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.contains("up{name=\"web-1\"} 1\n"));
        assert!(!text.contains("junk"));
        s1.await.unwrap();
        s2.await.unwrap();
    }

    #[tokio::test]
    async fn query_string_is_forwarded_verbatim() {
        let (l, port) = listener().await;
        let server = tokio::spawn(serve_once(l, UP));

        aggregator(vec![endpoint(port, "web-1")])
            .aggregate(Some("collect%5B%5D=meminfo"))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(
            request.starts_with("GET /metrics?collect%5B%5D=meminfo HTTP/1.1\r\n"),
            "unexpected request line: {request}"
        );
    }

    #[tokio::test]
    async fn derives_container_memory_over_the_merged_result() {
        let payload = "\
# TYPE node_memory_MemTotal_bytes gauge
node_memory_MemTotal_bytes 1000
# TYPE node_memory_MemFree_bytes gauge
node_memory_MemFree_bytes 400
# TYPE node_memory_Buffers_bytes gauge
node_memory_Buffers_bytes 100
# TYPE node_memory_Cached_bytes gauge
node_memory_Cached_bytes 200
";
        let (l, port) = listener().await;
        let server = tokio::spawn(serve_once(l, payload));

        let body = aggregator(vec![endpoint(port, "web-1")])
            .aggregate(None)
            .await
            .unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.contains("container_memory_usage_bytes{name=\"web-1\"} 600\n"));
        assert!(text.contains("container_memory_rss{name=\"web-1\"} 300\n"));
        assert!(text.contains("container_memory_cache{name=\"web-1\"} 200\n"));
        server.await.unwrap();
    }

    #[test]
    fn accept_encoding_matches_whole_tokens_case_insensitively() {
        assert!(accepts_gzip(["gzip"]));
        assert!(accepts_gzip(["deflate, GZIP"]));
        assert!(accepts_gzip(["identity", " gzip "]));
        assert!(!accepts_gzip(["identity"]));
        assert!(!accepts_gzip(["supergzip"]));
        assert!(!accepts_gzip([]));
    }

    #[test]
    fn gzip_round_trips() {
        use std::io::Read;

        let compressed = gzip(b"#KADVISOR\nup 1\n").unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"#KADVISOR\nup 1\n");
    }
}
