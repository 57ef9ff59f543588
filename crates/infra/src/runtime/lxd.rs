//! LXD REST API adapter.
//!
//! Talks to the daemon either over its local unix socket (the default, as the
//! `lxc` client does) or over HTTPS with a trusted client certificate. Exec
//! runs in record-output mode (no websockets): the command's stdout and stderr
//! are stored by LXD as log files, fetched once the operation finished and
//! then deleted.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use reqwest::header::{CONTENT_TYPE, HOST, HeaderMap};
use reqwest::{Client, Identity, Method, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::{
    ByteStream, CloneOptions, ContainerRuntime, ExecRequest, FileKind, Instance, Operation,
    OutputSink, RemoteFile, RuntimeError, StateChange,
};

/// Socket of the snap-packaged daemon.
pub const SNAP_SOCKET: &str = "/var/snap/lxd/common/lxd/unix.socket";
/// Socket of a distribution-packaged daemon.
pub const SYSTEM_SOCKET: &str = "/var/lib/lxd/unix.socket";

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LxdEndpoint {
    /// Local unix socket; access is governed by socket permissions.
    Unix(PathBuf),
    /// `https://` (or plain `http://`) base URL.
    Remote(String),
}

impl LxdEndpoint {
    /// The snap socket if it exists, else the system one.
    pub fn default_socket() -> Self {
        let snap = Path::new(SNAP_SOCKET);
        if snap.exists() {
            LxdEndpoint::Unix(snap.to_path_buf())
        } else {
            LxdEndpoint::Unix(PathBuf::from(SYSTEM_SOCKET))
        }
    }
}

impl fmt::Display for LxdEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LxdEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            LxdEndpoint::Remote(url) => f.write_str(url),
        }
    }
}

/// Connection settings for an LXD daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LxdConfig {
    pub endpoint: LxdEndpoint,
    /// PEM client certificate trusted by the daemon (remote endpoints only).
    pub client_cert: Option<PathBuf>,
    /// PEM private key for `client_cert`.
    pub client_key: Option<PathBuf>,
    pub accept_invalid_certs: bool,
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self {
            endpoint: LxdEndpoint::default_socket(),
            client_cert: None,
            client_key: None,
            accept_invalid_certs: false,
        }
    }
}

/// [`ContainerRuntime`] backed by LXD.
#[derive(Debug, Clone)]
pub struct LxdRuntime {
    api: Api,
    /// `instances` on servers with the instances API, `containers` before.
    collection: &'static str,
    /// Whether the server can copy without snapshots (LXD >= 2.17).
    instance_only: bool,
    server_version: String,
}

/// Standard LXD response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: JsonValue,
    #[serde(default)]
    operation: String,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    #[serde(default)]
    api_extensions: Vec<String>,
    environment: ServerEnvironment,
}

#[derive(Debug, Deserialize)]
struct ServerEnvironment {
    server_version: String,
}

#[derive(Debug, Deserialize)]
struct OperationBody {
    status_code: u16,
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Option<JsonValue>,
}

impl LxdRuntime {
    /// Set up the transport and read the server's version and API level.
    pub async fn connect(config: &LxdConfig) -> Result<Self, RuntimeError> {
        let api = match &config.endpoint {
            LxdEndpoint::Unix(socket) => Api {
                transport: Transport::Unix(socket.clone()),
                // Only the path and query are sent over the socket.
                base: parse_url("http://lxd")?,
            },
            LxdEndpoint::Remote(url) => Api {
                transport: Transport::Tcp(remote_client(config).await?),
                base: parse_url(url)?,
            },
        };

        let envelope = api.call(Method::GET, "/1.0", None).await?;
        let info: ServerInfo = serde_json::from_value(envelope.metadata)
            .map_err(|e| RuntimeError::Protocol(format!("server info: {e}")))?;

        let collection = if info.api_extensions.iter().any(|e| e == "instances") {
            "instances"
        } else {
            "containers"
        };
        let instance_only = version_at_least(&info.environment.server_version, 2, 17);

        debug!(
            endpoint = %config.endpoint,
            server_version = %info.environment.server_version,
            collection,
            instance_only,
            "connected to lxd"
        );

        Ok(Self {
            api,
            collection,
            instance_only,
            server_version: info.environment.server_version,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn instance_path(&self, name: &str) -> String {
        format!("/1.0/{}/{}", self.collection, name)
    }

    fn operation(&self, envelope: &Envelope) -> Result<LxdOperation, RuntimeError> {
        if envelope.kind != "async" || envelope.operation.is_empty() {
            return Err(RuntimeError::Protocol(format!(
                "expected an async operation, got {:?} response",
                envelope.kind
            )));
        }
        Ok(LxdOperation {
            api: self.api.clone(),
            wait_path: format!("{}/wait", envelope.operation),
        })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for LxdRuntime {
    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, RuntimeError> {
        match self.api.call(Method::GET, &self.instance_path(name), None).await {
            Ok(envelope) => serde_json::from_value(envelope.metadata)
                .map(Some)
                .map_err(|e| RuntimeError::Protocol(format!("instance {name}: {e}"))),
            Err(RuntimeError::Api { code: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn clone_instance(
        &self,
        source: &Instance,
        dest_name: &str,
        options: &CloneOptions,
    ) -> Result<Box<dyn Operation>, RuntimeError> {
        let only_key = if self.collection == "instances" {
            "instance_only"
        } else {
            "container_only"
        };

        let mut copy_source = json!({
            "type": "copy",
            "source": source.name,
            "live": options.live,
        });
        if options.instance_only && self.instance_only {
            copy_source[only_key] = JsonValue::Bool(true);
        }

        let body = json!({
            "name": dest_name,
            "architecture": source.architecture,
            "config": source.config,
            "devices": source.devices,
            "ephemeral": source.ephemeral,
            "profiles": source.profiles,
            "source": copy_source,
        });

        let path = format!("/1.0/{}", self.collection);
        let envelope = self.api.call(Method::POST, &path, Some(&body)).await?;
        Ok(Box::new(self.operation(&envelope)?))
    }

    async fn set_state(
        &self,
        name: &str,
        change: &StateChange,
    ) -> Result<Box<dyn Operation>, RuntimeError> {
        let body = json!({
            "action": change.action.as_str(),
            "timeout": change.timeout.as_secs(),
            "force": change.force,
            "stateful": change.stateful,
        });

        let path = format!("{}/state", self.instance_path(name));
        let envelope = self.api.call(Method::PUT, &path, Some(&body)).await?;
        Ok(Box::new(self.operation(&envelope)?))
    }

    async fn exec(
        &self,
        name: &str,
        request: ExecRequest,
    ) -> Result<Box<dyn Operation>, RuntimeError> {
        if !request.stdin.is_empty() {
            return Err(RuntimeError::Protocol(
                "stdin is not supported in record-output mode".to_string(),
            ));
        }

        let body = json!({
            "command": request.command,
            "environment": request.environment,
            "wait-for-websocket": false,
            "record-output": true,
            "interactive": false,
            "width": 0,
            "height": 0,
        });

        let path = format!("{}/exec", self.instance_path(name));
        let envelope = self.api.call(Method::POST, &path, Some(&body)).await?;

        Ok(Box::new(LxdExecOperation {
            op: self.operation(&envelope)?,
            request,
        }))
    }

    async fn open_file(&self, name: &str, path: &str) -> Result<RemoteFile, RuntimeError> {
        let mut url = self.api.url(&format!("{}/files", self.instance_path(name)));
        url.query_pairs_mut().append_pair("path", path);
        let reply = self.api.transport.send(Method::GET, url, None).await?;

        if !reply.status.is_success() {
            return Err(reply.into_error().await);
        }

        let kind = reply
            .header("X-LXD-type")
            .and_then(FileKind::parse)
            .unwrap_or(FileKind::File);
        let mode = reply
            .header("X-LXD-mode")
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .unwrap_or(0o644);

        Ok(RemoteFile {
            kind,
            mode,
            body: Box::new(reply),
        })
    }
}

/// Handle on `/1.0/operations/<id>`.
struct LxdOperation {
    api: Api,
    wait_path: String,
}

impl LxdOperation {
    /// Wait for completion and return the operation's metadata.
    async fn finish(&self) -> Result<JsonValue, RuntimeError> {
        let envelope = self.api.call(Method::GET, &self.wait_path, None).await?;
        let op: OperationBody = serde_json::from_value(envelope.metadata)
            .map_err(|e| RuntimeError::Protocol(format!("operation: {e}")))?;

        // 200 = Success; 400 Failure, 401 Cancelled.
        if op.status_code != 200 {
            let reason = if op.err.is_empty() { op.status } else { op.err };
            return Err(RuntimeError::OperationFailed(reason));
        }

        Ok(op.metadata.unwrap_or(JsonValue::Null))
    }
}

#[async_trait::async_trait]
impl Operation for LxdOperation {
    async fn wait(&mut self) -> Result<(), RuntimeError> {
        self.finish().await.map(|_| ())
    }
}

struct LxdExecOperation {
    op: LxdOperation,
    request: ExecRequest,
}

impl LxdExecOperation {
    async fn drain_log(&self, log_path: &str, sink: &dyn OutputSink) -> Result<(), RuntimeError> {
        let api = &self.op.api;
        let mut reply = api.transport.send(Method::GET, api.url(log_path), None).await?;
        if !reply.status.is_success() {
            return Err(reply.into_error().await);
        }
        while let Some(chunk) = reply.chunk().await? {
            sink.write(&chunk);
        }

        if let Err(e) = api.transport.send(Method::DELETE, api.url(log_path), None).await {
            warn!(log = %log_path, error = %e, "failed to delete exec log");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Operation for LxdExecOperation {
    async fn wait(&mut self) -> Result<(), RuntimeError> {
        let metadata = self.op.finish().await?;

        if let Some(output) = metadata.get("output").and_then(JsonValue::as_object) {
            if let Some(path) = output.get("1").and_then(JsonValue::as_str) {
                self.drain_log(path, self.request.stdout.as_ref()).await?;
            }
            if let Some(path) = output.get("2").and_then(JsonValue::as_str) {
                if let Err(e) = self.drain_log(path, self.request.stderr.as_ref()).await {
                    warn!(error = %e, "failed to fetch exec stderr");
                }
            }
        }

        match metadata.get("return").and_then(JsonValue::as_i64) {
            Some(0) => Ok(()),
            Some(code) => Err(RuntimeError::NonZeroExit(code)),
            None => Err(RuntimeError::Protocol(
                "exec operation did not report an exit status".to_string(),
            )),
        }
    }
}

/// Base URL plus the transport that carries requests to it.
#[derive(Debug, Clone)]
struct Api {
    transport: Transport,
    base: Url,
}

impl Api {
    /// Absolute URL for an API path, which may carry its own query string.
    fn url(&self, target: &str) -> Url {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }

    /// Send a request and unwrap the standard envelope.
    async fn call(
        &self,
        method: Method,
        target: &str,
        body: Option<&JsonValue>,
    ) -> Result<Envelope, RuntimeError> {
        let reply = self.transport.send(method, self.url(target), body).await?;
        if !reply.status.is_success() {
            return Err(reply.into_error().await);
        }

        let envelope: Envelope = reply.json().await?;
        if envelope.kind == "error" {
            return Err(RuntimeError::Api {
                code: envelope.error_code,
                message: envelope.error,
            });
        }
        Ok(envelope)
    }
}

#[derive(Debug, Clone)]
enum Transport {
    Tcp(Client),
    /// One HTTP/1 connection per request over the daemon's socket.
    Unix(PathBuf),
}

impl Transport {
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&JsonValue>,
    ) -> Result<Reply, RuntimeError> {
        match self {
            Transport::Tcp(client) => {
                let mut request = client.request(method, url);
                if let Some(body) = body {
                    request = request.json(body);
                }
                let response = request.send().await?;
                Ok(Reply {
                    status: response.status(),
                    headers: response.headers().clone(),
                    body: ReplyBody::Tcp(response),
                })
            }
            Transport::Unix(socket) => send_unix(socket, method, &url, body).await,
        }
    }
}

async fn send_unix(
    socket: &Path,
    method: Method,
    url: &Url,
    body: Option<&JsonValue>,
) -> Result<Reply, RuntimeError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| RuntimeError::Transport(format!("{}: {e}", socket.display())))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(transport_error)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "lxd socket connection closed with error");
        }
    });

    let target = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };
    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(target)
        .header(HOST, "lxd");
    let payload = match body {
        Some(body) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            serde_json::to_vec(body).map_err(|e| RuntimeError::Protocol(e.to_string()))?
        }
        None => Vec::new(),
    };
    let request = builder
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| RuntimeError::Protocol(e.to_string()))?;

    let response = sender.send_request(request).await.map_err(transport_error)?;
    let (parts, body) = response.into_parts();
    Ok(Reply {
        status: parts.status,
        headers: parts.headers,
        body: ReplyBody::Unix(body),
    })
}

/// Response from either transport, body not yet read.
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: ReplyBody,
}

enum ReplyBody {
    Tcp(Response),
    Unix(Incoming),
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, RuntimeError> {
        match &mut self.body {
            ReplyBody::Tcp(response) => Ok(response.chunk().await?),
            ReplyBody::Unix(body) => loop {
                match body.frame().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(transport_error(e)),
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            return Ok(Some(data));
                        }
                    }
                }
            },
        }
    }

    async fn bytes(mut self) -> Result<Vec<u8>, RuntimeError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn json<T: DeserializeOwned>(self) -> Result<T, RuntimeError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Protocol(e.to_string()))
    }

    /// Turn a non-success reply into an error, preferring LXD's own message.
    async fn into_error(self) -> RuntimeError {
        let status = self.status.as_u16();
        match self.json::<Envelope>().await {
            Ok(envelope) if !envelope.error.is_empty() => RuntimeError::Api {
                code: if envelope.error_code != 0 {
                    envelope.error_code
                } else {
                    status
                },
                message: envelope.error,
            },
            _ => RuntimeError::Api {
                code: status,
                message: format!("http status {status}"),
            },
        }
    }
}

#[async_trait::async_trait]
impl ByteStream for Reply {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RuntimeError> {
        Ok(self.chunk().await?.map(|b| b.to_vec()))
    }
}

async fn remote_client(config: &LxdConfig) -> Result<Client, RuntimeError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(config.accept_invalid_certs);

    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        let mut pem = read_pem(cert).await?;
        pem.push(b'\n');
        pem.extend(read_pem(key).await?);
        builder = builder.identity(Identity::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, RuntimeError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| RuntimeError::Transport(format!("reading {}: {e}", path.display())))
}

fn parse_url(raw: &str) -> Result<Url, RuntimeError> {
    Url::parse(raw).map_err(|e| RuntimeError::Transport(format!("{raw}: {e}")))
}

fn transport_error(err: hyper::Error) -> RuntimeError {
    RuntimeError::Transport(err.to_string())
}

/// Compare a dotted `major.minor[.patch]` version string.
fn version_at_least(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let have = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
    have >= (major, minor)
}
