use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File the container's stdout is captured into.
pub const STDOUT_FILE: &str = "stdout";
/// File the container's stderr is captured into.
pub const STDERR_FILE: &str = "stderr";
/// File holding the container's exit code as decimal text.
pub const EXIT_CODE_FILE: &str = "exitCode";

/// Outcome of one shard execution attempt.
///
/// A failed run still carries whatever was captured before the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunResult {
    /// `None` if the container never exited (setup failure, wait error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<PathBuf>,

    /// Combined error message, if anything went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    /// A result for a run that failed before producing any output.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Exit code zero and no error.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}
