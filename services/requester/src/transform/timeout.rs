use std::time::Duration;

use async_trait::async_trait;
use bidmesh_model::Job;

use super::{TransformError, Transformer};

/// Gives every job a usable execution timeout.
///
/// An unset timeout, or one below `min`, is replaced with `default`.
#[derive(Debug, Clone)]
pub struct TimeoutApplier {
    min: Duration,
    default: Duration,
}

impl TimeoutApplier {
    pub fn new(min: Duration, default: Duration) -> Self {
        Self { min, default }
    }
}

#[async_trait]
impl Transformer for TimeoutApplier {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn transform(&self, job: &mut Job) -> Result<bool, TransformError> {
        match job.spec.execution_timeout() {
            Some(timeout) if timeout >= self.min => Ok(false),
            _ => {
                job.spec.timeout_secs = Some(self.default.as_secs().max(1));
                Ok(true)
            }
        }
    }
}
