//! Docker Engine API client.
//!
//! Talks HTTP/1.1 to the daemon over its unix socket.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{ContainerConfig, ContainerLogs, ContainerRuntime, RuntimeError};

/// Docker runtime over the Engine API.
pub struct DockerRuntime {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<&'a [String]>,
    env: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<&'a str>,
    labels: &'a std::collections::HashMap<String, String>,
    network_disabled: bool,
    host_config: HostConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    binds: Vec<String>,
    memory: u64,
    nano_cpus: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    device_requests: Vec<DeviceRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceRequest {
    driver: &'static str,
    count: i64,
    capabilities: Vec<Vec<&'static str>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
}

/// One line of the image pull progress stream.
#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

impl DockerRuntime {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.request(Method::GET, "/_ping", None).await.map(|_| ())
    }

    fn create_body(config: &ContainerConfig) -> CreateBody<'_> {
        let binds = config
            .mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{mode}", m.source.display(), m.target)
            })
            .collect();

        let device_requests = if config.resources.gpu_count > 0 {
            vec![DeviceRequest {
                driver: "nvidia",
                count: config.resources.gpu_count as i64,
                capabilities: vec![vec!["gpu"]],
            }]
        } else {
            Vec::new()
        };

        CreateBody {
            image: &config.image,
            entrypoint: (!config.entrypoint.is_empty()).then_some(config.entrypoint.as_slice()),
            env: &config.env,
            working_dir: config.working_dir.as_deref(),
            labels: &config.labels,
            network_disabled: config.network_disabled,
            host_config: HostConfig {
                binds,
                memory: config.resources.memory_bytes,
                nano_cpus: config.resources.nano_cpus,
                device_requests,
            },
        }
    }

    /// Performs a request and returns the body of a successful response.
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, RuntimeError> {
        let uri = Uri::new(&self.socket_path, path_and_query);

        debug!(method = %method, path = path_and_query, "Docker API request");

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        if body.is_some() {
            request = request.header("Content-Type", "application/json");
        }
        let request = request.body(body.map(Body::from).unwrap_or_else(Body::empty))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(bytes.to_vec());
        }

        let message = error_message(&bytes);
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(message));
        }
        error!(status = %status, message = %message, "Docker API error");
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Extracts `message` from a Docker error body, falling back to the raw
/// text.
fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

/// `/images/create` for one image. The engine pulls every tag when `tag` is
/// empty, so an untagged name pulls `latest`. Digest references are sent
/// whole in `fromImage`.
fn pull_path(image: &str) -> String {
    if image.contains('@') {
        return with_query("/images/create", &[("fromImage", image)]);
    }
    // A ':' before the last '/' is a registry port, not a tag.
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let (name, tag) = match image[name_start..].rfind(':') {
        Some(i) => image.split_at(name_start + i),
        None => (image, ":latest"),
    };
    with_query("/images/create", &[("fromImage", name), ("tag", &tag[1..])])
}

/// Builds `path?k=v&...` with form-encoded values.
fn with_query(path: &str, pairs: &[(&str, &str)]) -> String {
    let mut url = match Url::parse("http://docker") {
        Ok(url) => url,
        Err(_) => return path.to_string(),
    };
    url.set_path(path);
    url.query_pairs_mut().extend_pairs(pairs);
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Splits a multiplexed (non-TTY) log stream into stdout and stderr.
///
/// Each frame is an 8-byte header `[stream, 0, 0, 0, len (u32 BE)]`
/// followed by `len` bytes of payload. A truncated trailing frame keeps
/// whatever payload arrived.
pub(crate) fn demux_logs(mut raw: &[u8]) -> ContainerLogs {
    let mut logs = ContainerLogs::default();
    while raw.len() >= 8 {
        let stream = raw[0];
        let len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let payload = &raw[8..];
        let take = len.min(payload.len());
        match stream {
            2 => logs.stderr.extend_from_slice(&payload[..take]),
            _ => logs.stdout.extend_from_slice(&payload[..take]),
        }
        raw = &payload[take..];
    }
    logs
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let body = self
            .request(Method::POST, &pull_path(image), None)
            .await?;

        // Pull failures can arrive inside a 200 progress stream.
        for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Ok(PullProgress { error: Some(message) }) = serde_json::from_slice(line) {
                return Err(RuntimeError::Api {
                    status: 500,
                    message,
                });
            }
        }
        Ok(())
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let path = with_query("/containers/create", &[("name", &config.name)]);
        let body = serde_json::to_vec(&Self::create_body(config))?;
        let response = self.request(Method::POST, &path, Some(body)).await?;
        let created: CreateResponse = serde_json::from_slice(&response)?;
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.request(Method::POST, &format!("/containers/{id}/start"), None)
            .await
            .map(|_| ())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let path = with_query(&format!("/containers/{id}/wait"), &[("condition", "not-running")]);
        let response = self.request(Method::POST, &path, None).await?;
        let waited: WaitResponse = serde_json::from_slice(&response)?;
        match waited.error {
            Some(err) if !err.message.is_empty() => Err(RuntimeError::Api {
                status: 500,
                message: err.message,
            }),
            _ => Ok(waited.status_code),
        }
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs, RuntimeError> {
        let path = with_query(
            &format!("/containers/{id}/logs"),
            &[("stdout", "1"), ("stderr", "1")],
        );
        let raw = self.request(Method::GET, &path, None).await?;
        Ok(demux_logs(&raw))
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError> {
        let filters = serde_json::json!({ "label": [format!("{key}={value}")] }).to_string();
        let path = with_query("/containers/json", &[("all", "1"), ("filters", &filters)]);
        let response = self.request(Method::GET, &path, None).await?;
        let containers: Vec<ContainerSummary> = serde_json::from_slice(&response)?;
        Ok(containers.into_iter().map(|c| c.id).collect())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let path = with_query(&format!("/containers/{id}"), &[("force", "1"), ("v", "1")]);
        self.request(Method::DELETE, &path, None).await.map(|_| ())
    }
}
