//! Configuration for the requester.

use std::time::Duration;

use anyhow::{Context, Result};
use bidmesh_bidstrategy::{JobSelectionPolicy, Locality};

/// Requester configuration.
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Shortest execution timeout a job may ask for.
    pub min_job_execution_timeout: Duration,

    /// Timeout applied to jobs that ask for none (or too little).
    pub default_job_execution_timeout: Duration,

    /// How often the housekeeping sweep runs.
    pub housekeeping_interval: Duration,

    /// Identity allowed to approve jobs. Empty means nobody.
    pub job_approver: String,

    /// Stall window for job waiters.
    pub stall_check_interval: Duration,

    /// Which jobs this requester is willing to schedule.
    pub job_selection_policy: JobSelectionPolicy,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            min_job_execution_timeout: Duration::from_secs(10),
            default_job_execution_timeout: Duration::from_secs(30 * 60),
            housekeeping_interval: Duration::from_secs(30),
            job_approver: String::new(),
            stall_check_interval: Duration::from_secs(60),
            job_selection_policy: JobSelectionPolicy::default(),
        }
    }
}

impl RequesterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            min_job_execution_timeout: env_secs(
                "BIDMESH_MIN_JOB_EXECUTION_TIMEOUT",
                defaults.min_job_execution_timeout,
            )?,
            default_job_execution_timeout: env_secs(
                "BIDMESH_DEFAULT_JOB_EXECUTION_TIMEOUT",
                defaults.default_job_execution_timeout,
            )?,
            housekeeping_interval: env_secs(
                "BIDMESH_HOUSEKEEPING_INTERVAL",
                defaults.housekeeping_interval,
            )?,
            // Deliberately empty when unset: nobody may approve.
            job_approver: std::env::var("BIDMESH_JOB_APPROVER").unwrap_or_default(),
            stall_check_interval: env_secs(
                "BIDMESH_STALL_CHECK_INTERVAL",
                defaults.stall_check_interval,
            )?,
            job_selection_policy: selection_policy_from_env()?,
        })
    }
}

fn selection_policy_from_env() -> Result<JobSelectionPolicy> {
    let locality = match std::env::var("BIDMESH_JOB_SELECTION_LOCALITY") {
        Ok(raw) => raw
            .parse::<Locality>()
            .map_err(anyhow::Error::msg)
            .context("BIDMESH_JOB_SELECTION_LOCALITY")?,
        Err(_) => Locality::default(),
    };

    Ok(JobSelectionPolicy {
        locality,
        reject_stateless: env_flag("BIDMESH_JOB_SELECTION_REJECT_STATELESS"),
        accept_networked: env_flag("BIDMESH_JOB_SELECTION_ACCEPT_NETWORKED"),
        probe_http: std::env::var("BIDMESH_JOB_SELECTION_PROBE_HTTP").ok(),
        probe_exec: std::env::var("BIDMESH_JOB_SELECTION_PROBE_EXEC").ok(),
    })
}

/// True for `1`, `true` or `yes` (any case).
pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Reads a duration in whole seconds, falling back to `default` when unset.
pub(crate) fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a number of seconds, got '{raw}'"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RequesterConfig::default();
        assert!(config.min_job_execution_timeout < config.default_job_execution_timeout);
        assert!(config.job_approver.is_empty());
        assert_eq!(config.job_selection_policy.locality, Locality::Anywhere);
    }

    #[test]
    fn test_env_secs_fallback() {
        let d = env_secs("BIDMESH_TEST_UNSET_DURATION", Duration::from_secs(7)).unwrap();
        assert_eq!(d, Duration::from_secs(7));
    }
}
