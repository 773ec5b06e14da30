//! External bid probes.
//!
//! Both probes receive [`ProbeData`](crate::ProbeData) as JSON and answer
//! synchronously within a timeout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bidmesh_model::ResourceUsage;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::BidStrategyError;
use crate::types::{BidStrategy, BidStrategyRequest, BidStrategyResponse};

/// Environment variable carrying the probe payload for exec probes.
pub const PROBE_DATA_ENV: &str = "BIDMESH_JOB_SELECTION_PROBE_DATA";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs the probe payload to a URL.
///
/// A 2xx status bids, anything else rejects. A 2xx body that decodes as a
/// [`BidStrategyResponse`] overrides the status-based decision.
#[derive(Debug, Clone)]
pub struct HttpProbeStrategy {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbeStrategy {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl BidStrategy for HttpProbeStrategy {
    async fn should_bid(
        &self,
        request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&request.probe_data())
            .send()
            .await?;

        let status = response.status();
        debug!(url = %self.url, status = %status, "http probe answered");
        if !status.is_success() {
            return Ok(BidStrategyResponse::reject(format!(
                "http probe {} returned status {}",
                self.url, status
            )));
        }

        let body = response.bytes().await?;
        match serde_json::from_slice::<BidStrategyResponse>(&body) {
            Ok(decision) => Ok(decision),
            Err(_) => Ok(BidStrategyResponse::bid()),
        }
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        _usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        Ok(BidStrategyResponse::bid())
    }
}

/// Runs a shell command with the probe payload on stdin and in
/// [`PROBE_DATA_ENV`]. Exit status 0 bids, anything else rejects.
#[derive(Debug, Clone)]
pub struct ExecProbeStrategy {
    command: String,
    timeout: Duration,
}

impl ExecProbeStrategy {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, payload: Vec<u8>) -> Result<BidStrategyResponse, BidStrategyError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(PROBE_DATA_ENV, String::from_utf8_lossy(&payload).as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // The probe may exit without reading stdin.
            let _ = stdin.write_all(&payload).await;
        }

        let output = child.wait_with_output().await?;
        debug!(command = %self.command, status = %output.status, "exec probe finished");

        if output.status.success() {
            return Ok(BidStrategyResponse::bid());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("no output");
        Ok(BidStrategyResponse::reject(format!(
            "exec probe exited with {}: {detail}",
            output.status
        )))
    }
}

#[async_trait]
impl BidStrategy for ExecProbeStrategy {
    async fn should_bid(
        &self,
        request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        let payload = serde_json::to_vec(&request.probe_data())?;
        tokio::time::timeout(self.timeout, self.run(payload))
            .await
            .map_err(|_| BidStrategyError::Timeout(self.timeout))?
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        _usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        Ok(BidStrategyResponse::bid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmesh_id::NodeId;
    use bidmesh_model::{DockerSpec, Job, Spec};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> BidStrategyRequest {
        let spec = Spec {
            docker: DockerSpec {
                image: "ubuntu".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        BidStrategyRequest::new(NodeId::new(), Job::new("client", spec))
    }

    #[tokio::test]
    async fn test_http_probe_2xx_bids() {
        let server = MockServer::start().await;
        let req = request();
        Mock::given(method("POST"))
            .and(path("/probe"))
            .and(body_partial_json(serde_json::json!({
                "job_id": req.job.id().to_string(),
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let probe = HttpProbeStrategy::new(format!("{}/probe", server.uri()));
        assert!(probe.should_bid(&req).await.unwrap().should_bid());
    }

    #[tokio::test]
    async fn test_http_probe_error_status_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpProbeStrategy::new(server.uri());
        let response = probe.should_bid(&request()).await.unwrap();
        assert!(response.is_reject());
        assert!(response.reason().contains("503"));
    }

    #[tokio::test]
    async fn test_http_probe_body_overrides() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "shouldBid": false,
                "shouldWait": true,
                "reason": "awaiting operator",
            })))
            .mount(&server)
            .await;

        let probe = HttpProbeStrategy::new(server.uri());
        let response = probe.should_bid(&request()).await.unwrap();
        assert!(response.should_wait());
        assert_eq!(response.reason(), "awaiting operator");
    }

    #[tokio::test]
    async fn test_exec_probe_exit_codes() {
        let yes = ExecProbeStrategy::new("exit 0");
        assert!(yes.should_bid(&request()).await.unwrap().should_bid());

        let no = ExecProbeStrategy::new("echo 'not today' >&2; exit 3");
        let response = no.should_bid(&request()).await.unwrap();
        assert!(response.is_reject());
        assert!(response.reason().contains("not today"));
    }

    #[tokio::test]
    async fn test_exec_probe_sees_payload() {
        let probe = ExecProbeStrategy::new(format!(
            "grep -q '\"job_id\"' && test -n \"${PROBE_DATA_ENV}\""
        ));
        assert!(probe.should_bid(&request()).await.unwrap().should_bid());
    }

    #[tokio::test]
    async fn test_exec_probe_timeout() {
        let probe = ExecProbeStrategy::new("sleep 5").with_timeout(Duration::from_millis(50));
        assert!(matches!(
            probe.should_bid(&request()).await,
            Err(BidStrategyError::Timeout(_))
        ));
    }
}
