//! Docker Engine API client over the local unix socket.
//!
//! One short-lived HTTP/1 connection per call: connect the socket,
//! handshake, send, collect. The event subscription keeps its
//! connection open and forwards newline-delimited JSON events over an
//! mpsc channel until the daemon closes the stream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSummary, Error, Event, ExecInfo, ExecOptions,
    Result, async_trait,
};

pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    /// Creates a client from a `unix://<path>` connection uri.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let path = uri
            .strip_prefix("unix://")
            .ok_or_else(|| Error::UnsupportedUri(uri.to_owned()))?;
        if path.is_empty() {
            return Err(Error::UnsupportedUri(uri.to_owned()));
        }
        Ok(Self {
            socket: PathBuf::from(path),
        })
    }

    async fn connect(
        &self,
    ) -> Result<(
        hyper::client::conn::http1::SendRequest<Full<Bytes>>,
        tokio::task::JoinHandle<()>,
    )> {
        let stream = tokio::net::UnixStream::connect(&self.socket)
            .await
            .map_err(|source| Error::Connect {
                path: self.socket.clone(),
                source,
            })?;
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| Error::Handshake { source })?;
        let driver = tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("docker connection closed: {err}");
            }
        });

        Ok((sender, driver))
    }

    /// Sends one request and collects the whole response body.
    async fn roundtrip(
        &self,
        method: Method,
        path: &str,
        body: Option<(Bytes, &str)>,
    ) -> Result<Bytes> {
        let (mut sender, _driver) = self.connect().await?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "docker");
        let payload = match body {
            Some((bytes, content_type)) => {
                builder = builder.header(CONTENT_TYPE, content_type);
                Full::new(bytes)
            }
            None => Full::default(),
        };
        let request = builder
            .body(payload)
            .map_err(|source| Error::BuildRequest {
                path: path.to_owned(),
                source,
            })?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|source| Error::Request {
                path: path.to_owned(),
                source,
            })?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|source| Error::Request {
                path: path.to_owned(),
                source,
            })?
            .to_bytes();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                status,
                path: path.to_owned(),
            });
        }

        Ok(bytes)
    }

    fn decode<T: serde::de::DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|source| Error::Decode {
            path: path.to_owned(),
            source,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filters = serde_json::json!({ "label": [label] }).to_string();
        let path = format!("/containers/json?filters={}", query_encode(&filters));
        let bytes = self.roundtrip(Method::GET, &path, None).await?;
        let wire: Vec<ContainerSummaryWire> = Self::decode(&path, &bytes)?;

        Ok(wire
            .into_iter()
            .map(|c| ContainerSummary { id: c.id })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let path = format!("/containers/{id}/json");
        let bytes = self.roundtrip(Method::GET, &path, None).await?;
        let wire: ContainerInspectWire = Self::decode(&path, &bytes)?;

        Ok(wire.into())
    }

    async fn copy_to_container(&self, local: &Path, id: &str, remote_dir: &str) -> Result<()> {
        let src = local.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || build_archive(&src))
            .await
            .expect("spawn_blocking panicked")
            .map_err(|source| Error::Archive {
                path: local.to_path_buf(),
                source,
            })?;
        let path = format!("/containers/{id}/archive?path={}", query_encode(remote_dir));
        self.roundtrip(
            Method::PUT,
            &path,
            Some((Bytes::from(archive), "application/x-tar")),
        )
        .await?;

        Ok(())
    }

    async fn exec_create(&self, id: &str, cmd: &[String], opts: ExecOptions) -> Result<String> {
        let path = format!("/containers/{id}/exec");
        let body = serde_json::to_vec(&ExecCreateRequest {
            attach_stdin: opts.attach_stdin,
            attach_stdout: opts.attach_stdout,
            attach_stderr: opts.attach_stderr,
            cmd,
        })
        .map_err(|source| Error::Decode {
            path: path.clone(),
            source,
        })?;
        let bytes = self
            .roundtrip(
                Method::POST,
                &path,
                Some((Bytes::from(body), "application/json")),
            )
            .await?;
        let wire: ExecCreateResponse = Self::decode(&path, &bytes)?;

        Ok(wire.id)
    }

    async fn exec_start(&self, exec_id: &str, detach: bool) -> Result<String> {
        let path = format!("/exec/{exec_id}/start");
        let body = serde_json::to_vec(&ExecStartRequest { detach }).map_err(|source| {
            Error::Decode {
                path: path.clone(),
                source,
            }
        })?;
        let bytes = self
            .roundtrip(
                Method::POST,
                &path,
                Some((Bytes::from(body), "application/json")),
            )
            .await?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInfo> {
        let path = format!("/exec/{exec_id}/json");
        let bytes = self.roundtrip(Method::GET, &path, None).await?;
        let wire: ExecInspectWire = Self::decode(&path, &bytes)?;

        Ok(ExecInfo {
            container_id: wire.container_id,
            pid: wire.pid,
        })
    }

    async fn events(&self, label: &str, actions: &[&str]) -> Result<mpsc::Receiver<Event>> {
        let filters = serde_json::json!({
            "type": ["container"],
            "label": [label],
            "event": actions,
        })
        .to_string();
        let path = format!("/events?filters={}", query_encode(&filters));

        let (mut sender, _driver) = self.connect().await?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(&path)
            .header(HOST, "docker")
            .body(Full::default())
            .map_err(|source| Error::BuildRequest {
                path: path.clone(),
                source,
            })?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|source| Error::Request {
                path: path.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus {
                status: response.status(),
                path,
            });
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Keep the request handle alive so the connection stays up
            // for the lifetime of the stream.
            let _sender = sender;
            let mut body = response.into_body();
            let mut buf: Vec<u8> = Vec::new();
            loop {
                let frame = match body.frame().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        log::error!("docker event stream failed: {err}");
                        break;
                    }
                    None => break,
                };
                let Some(data) = frame.data_ref() else {
                    continue;
                };
                buf.extend_from_slice(data);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<EventWire>(line) {
                        Ok(event) => {
                            if tx.send(event.into()).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => log::warn!("skipping undecodable docker event: {err}"),
                    }
                }
            }
            log::debug!("docker event stream ended");
        });

        Ok(rx)
    }
}

fn build_archive(src: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let metadata = std::fs::metadata(src)?;
    if metadata.is_dir() {
        builder.append_dir_all(".", src)?;
    } else {
        let name = src
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("agent"));
        let mut file = std::fs::File::open(src)?;
        builder.append_file(name, &mut file)?;
    }

    builder.into_inner()
}

/// Percent-encodes a query parameter value. Only unreserved characters
/// pass through, which is what the daemon expects for the JSON
/// `filters` parameter.
fn query_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, serde::Deserialize)]
struct ContainerSummaryWire {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, serde::Deserialize)]
struct ContainerInspectWire {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: StateWire,
    #[serde(rename = "Config")]
    config: ConfigWire,
    #[serde(rename = "HostConfig", default)]
    host_config: HostConfigWire,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettingsWire,
}

#[derive(Debug, serde::Deserialize)]
struct StateWire {
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ConfigWire {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct HostConfigWire {
    #[serde(rename = "Runtime", default)]
    runtime: String,
}

#[derive(Debug, Default, serde::Deserialize)]
struct NetworkSettingsWire {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, NetworkWire>,
}

#[derive(Debug, serde::Deserialize)]
struct NetworkWire {
    #[serde(rename = "IPAddress")]
    ip_address: String,
}

impl From<ContainerInspectWire> for ContainerInfo {
    fn from(wire: ContainerInspectWire) -> Self {
        ContainerInfo {
            id: wire.id,
            name: wire.name,
            image: wire.config.image,
            running: wire.state.running,
            runtime: wire.host_config.runtime,
            labels: wire.config.labels,
            networks: wire
                .network_settings
                .networks
                .into_iter()
                .map(|(name, net)| (name, net.ip_address))
                .collect(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ExecCreateRequest<'a> {
    #[serde(rename = "AttachStdin")]
    attach_stdin: bool,
    #[serde(rename = "AttachStdout")]
    attach_stdout: bool,
    #[serde(rename = "AttachStderr")]
    attach_stderr: bool,
    #[serde(rename = "Cmd")]
    cmd: &'a [String],
}

#[derive(Debug, serde::Deserialize)]
struct ExecCreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, serde::Serialize)]
struct ExecStartRequest {
    #[serde(rename = "Detach")]
    detach: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ExecInspectWire {
    #[serde(rename = "ContainerID")]
    container_id: String,
    #[serde(rename = "Pid")]
    pid: i64,
}

#[derive(Debug, serde::Deserialize)]
struct EventWire {
    #[serde(rename = "Type")]
    typ: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: ActorWire,
}

#[derive(Debug, serde::Deserialize)]
struct ActorWire {
    #[serde(rename = "ID")]
    id: String,
}

impl From<EventWire> for Event {
    fn from(wire: EventWire) -> Self {
        Event {
            typ: wire.typ,
            action: wire.action,
            actor_id: wire.actor.id,
        }
    }
}
