//! In-memory container runtime.
//!
//! Understands a handful of entrypoints well enough to exercise the
//! executor: `echo [-n]`, `true`, `false`, `sleep <secs>`, `cat <path>` and
//! `cp <src> <dst>`. Paths are resolved through the container's mounts.
//! Any other program fails to start as if it were missing from the image.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ContainerConfig, ContainerLogs, ContainerRuntime, Mount, RuntimeError};

/// A container known to the mock.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub config: ContainerConfig,
    pub started: bool,
    exit_code: Option<i64>,
    sleep: Option<Duration>,
    logs: ContainerLogs,
    killed: CancellationToken,
}

/// Mock container runtime for testing and development.
#[derive(Default)]
pub struct MockRuntime {
    counter: AtomicU64,
    containers: Mutex<HashMap<String, MockContainer>>,
    missing_images: Mutex<HashSet<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes pulls of `image` fail.
    pub fn without_image(self, image: impl Into<String>) -> Self {
        self.lock_images().insert(image.into());
        self
    }

    /// Containers that have not been removed.
    pub fn containers(&self) -> Vec<MockContainer> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_images(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.missing_images.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{counter:016x}")
    }
}

/// Maps a container path to the host path behind its mount.
fn resolve(mounts: &[Mount], path: &str) -> Option<PathBuf> {
    mounts
        .iter()
        .filter_map(|m| {
            let rest = path.strip_prefix(m.target.trim_end_matches('/'))?;
            if rest.is_empty() {
                Some(m.source.clone())
            } else {
                rest.strip_prefix('/').map(|rest| m.source.join(rest))
            }
        })
        .next()
}

enum Outcome {
    Exited(i64),
    Sleeps(Duration),
}

/// Runs `program` and records its output.
fn execute(config: &ContainerConfig, logs: &mut ContainerLogs) -> Result<Outcome, RuntimeError> {
    let Some((program, args)) = config.entrypoint.split_first() else {
        return Ok(Outcome::Exited(0));
    };

    match program.as_str() {
        "true" => Ok(Outcome::Exited(0)),
        "false" => Ok(Outcome::Exited(1)),
        "echo" => {
            let (newline, words) = match args.split_first() {
                Some((flag, rest)) if flag == "-n" => (false, rest),
                _ => (true, args),
            };
            logs.stdout.extend_from_slice(words.join(" ").as_bytes());
            if newline {
                logs.stdout.push(b'\n');
            }
            Ok(Outcome::Exited(0))
        }
        "sleep" => {
            let secs = args.first().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            Ok(Outcome::Sleeps(Duration::from_secs_f64(secs.max(0.0))))
        }
        "cat" => {
            for path in args {
                match resolve(&config.mounts, path).map(std::fs::read) {
                    Some(Ok(data)) => logs.stdout.extend_from_slice(&data),
                    _ => {
                        logs.stderr
                            .extend_from_slice(format!("cat: {path}: No such file or directory\n").as_bytes());
                        return Ok(Outcome::Exited(1));
                    }
                }
            }
            Ok(Outcome::Exited(0))
        }
        "cp" => {
            let [src, dst] = args else {
                logs.stderr.extend_from_slice(b"cp: missing file operand\n");
                return Ok(Outcome::Exited(1));
            };
            let writable = config
                .mounts
                .iter()
                .any(|m| !m.read_only && dst.starts_with(m.target.as_str()));
            let copied = match (resolve(&config.mounts, src), resolve(&config.mounts, dst)) {
                (Some(from), Some(to)) if writable => std::fs::copy(from, to).is_ok(),
                _ => false,
            };
            if copied {
                Ok(Outcome::Exited(0))
            } else {
                logs.stderr
                    .extend_from_slice(format!("cp: cannot copy '{src}' to '{dst}'\n").as_bytes());
                Ok(Outcome::Exited(1))
            }
        }
        other => Err(RuntimeError::Api {
            status: 400,
            message: format!(
                "failed to create task for container: exec: \"{other}\": executable file not found in $PATH"
            ),
        }),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.lock_images().contains(image) {
            return Err(RuntimeError::Api {
                status: 404,
                message: format!("pull access denied for {image}, repository does not exist"),
            });
        }
        debug!(image = %image, "[MOCK] Pulled image");
        Ok(())
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let mut containers = self.lock();
        if containers.values().any(|c| c.config.name == config.name) {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("container name \"{}\" is already in use", config.name),
            });
        }
        let id = self.next_id();
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                config: config.clone(),
                started: false,
                exit_code: None,
                sleep: None,
                logs: ContainerLogs::default(),
                killed: CancellationToken::new(),
            },
        );
        info!(container_id = %id, name = %config.name, "[MOCK] Created container");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.lock();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        let mut logs = ContainerLogs::default();
        match execute(&container.config, &mut logs)? {
            Outcome::Exited(code) => container.exit_code = Some(code),
            Outcome::Sleeps(duration) => container.sleep = Some(duration),
        }
        container.logs = logs;
        container.started = true;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let (exit_code, sleep, killed) = {
            let containers = self.lock();
            let container = containers
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            (container.exit_code, container.sleep, container.killed.clone())
        };

        if let Some(code) = exit_code {
            return Ok(code);
        }
        let Some(duration) = sleep else {
            // Never started.
            return Ok(0);
        };

        let code = tokio::select! {
            _ = tokio::time::sleep(duration) => 0,
            _ = killed.cancelled() => 137,
        };
        if let Some(container) = self.lock().get_mut(id) {
            container.exit_code = Some(code);
        }
        Ok(code)
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs, RuntimeError> {
        self.lock()
            .get(id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .lock()
            .values()
            .filter(|c| c.config.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| c.id.clone())
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let removed = self
            .lock()
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        removed.killed.cancel();
        debug!(container_id = %id, "[MOCK] Removed container");
        Ok(())
    }
}
