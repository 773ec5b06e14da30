//! Job specification types.
//!
//! A [`Spec`] is immutable once the job has been persisted. Transforms run
//! by the requester may rewrite it before that point (for example replacing
//! inline data with a content reference).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Execution engine for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    Docker,
}

/// Container workload description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DockerSpec {
    /// Image reference, e.g. `ubuntu:24.04`.
    pub image: String,

    /// Entrypoint override; empty means the image default.
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Environment in `KEY=value` form.
    #[serde(default)]
    pub environment_variables: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

/// Requested resources, as human-readable quantities.
///
/// Parsed with [`crate::ResourceUsage::parse`]. Empty strings mean "no
/// explicit request".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    /// CPU cores, `"1.5"` or millicores `"500m"`.
    #[serde(default)]
    pub cpu: String,

    /// Memory, e.g. `"512Mb"`, `"2Gi"`.
    #[serde(default)]
    pub memory: String,

    /// Scratch disk, same units as memory.
    #[serde(default)]
    pub disk: String,

    /// Number of GPUs.
    #[serde(default)]
    pub gpu: String,
}

/// Container network access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    /// No network at all.
    #[default]
    None,
    /// Default bridge networking.
    Full,
}

/// Where the data behind a [`StorageSpec`] comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageSource {
    /// Raw data embedded in the job. The requester pins this to the content
    /// store and rewrites it to [`StorageSource::Content`] before persisting.
    Inline { data: String },

    /// Content-addressed reference into the content store.
    Content { cid: String },

    /// A directory already present on the compute node.
    LocalDirectory { source_path: String },
}

/// Discriminant of [`StorageSource`], used to pick a storage driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSourceType {
    Inline,
    Content,
    LocalDirectory,
}

impl std::fmt::Display for StorageSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageSourceType::Inline => "inline",
            StorageSourceType::Content => "content",
            StorageSourceType::LocalDirectory => "local_directory",
        };
        f.write_str(s)
    }
}

/// An input volume: a data source plus where it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(default)]
    pub name: String,

    /// Mount path inside the container.
    #[serde(default)]
    pub path: String,

    pub source: StorageSource,
}

impl StorageSpec {
    pub fn source_type(&self) -> StorageSourceType {
        match self.source {
            StorageSource::Inline { .. } => StorageSourceType::Inline,
            StorageSource::Content { .. } => StorageSourceType::Content,
            StorageSource::LocalDirectory { .. } => StorageSourceType::LocalDirectory,
        }
    }
}

/// An output volume. Each one gets its own directory in the shard's
/// results directory, bind-mounted read-write at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutputSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub path: String,
}

/// How many shards the job is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub concurrency: u32,
}

impl Default for Deal {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Partitioning of `inputs` across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Number of input volumes handed to each shard.
    pub batch_size: u32,
}

/// The immutable job specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Spec {
    #[serde(default)]
    pub engine: Engine,

    pub docker: DockerSpec,

    #[serde(default)]
    pub resources: ResourceSpec,

    #[serde(default)]
    pub network: Network,

    /// Shard-specific inputs (partitioned by `sharding`).
    #[serde(default)]
    pub inputs: Vec<StorageSpec>,

    /// Inputs shared by every shard.
    #[serde(default)]
    pub contexts: Vec<StorageSpec>,

    #[serde(default)]
    pub outputs: Vec<OutputSpec>,

    /// Execution timeout in seconds. `None` or `0` means "use the default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub deal: Deal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingConfig>,

    /// Free-form labels.
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl Spec {
    /// Execution timeout, if one has been set.
    pub fn execution_timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }

    /// Number of shards this job runs as.
    pub fn shard_count(&self) -> u32 {
        self.deal.concurrency.max(1)
    }

    /// Every storage spec the job references: contexts, then inputs.
    pub fn all_inputs(&self) -> impl Iterator<Item = &StorageSpec> {
        self.contexts.iter().chain(self.inputs.iter())
    }

    /// Checks the structural rules a spec must satisfy before any side
    /// effect happens.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.docker.image.trim().is_empty() {
            return Err(ModelError::InvalidSpec("docker image is required".into()));
        }

        if self.deal.concurrency == 0 {
            return Err(ModelError::InvalidSpec(
                "deal concurrency must be at least 1".into(),
            ));
        }

        if let Some(sharding) = self.sharding {
            if sharding.batch_size == 0 {
                return Err(ModelError::InvalidSpec(
                    "sharding batch size must be at least 1".into(),
                ));
            }
        }

        for input in self.all_inputs() {
            if input.path.is_empty() {
                return Err(ModelError::InvalidSpec(format!(
                    "input volume '{}' has no mount path",
                    input.name
                )));
            }
        }

        for output in &self.outputs {
            output.validate()?;
        }

        Ok(())
    }
}

impl OutputSpec {
    /// Output volumes need both a name (results folder) and a mount path.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.is_empty() {
            return Err(ModelError::InvalidSpec(format!(
                "output volume has no name: {self:?}"
            )));
        }
        if self.path.is_empty() {
            return Err(ModelError::InvalidSpec(format!(
                "output volume has no path: {self:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn spec() -> Spec {
        Spec {
            docker: DockerSpec {
                image: "ubuntu:24.04".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_spec_is_valid() {
        assert!(spec().validate().is_ok());
        assert_eq!(spec().shard_count(), 1);
    }

    #[rstest]
    #[case::no_name(OutputSpec { name: "".into(), path: "/outputs".into() })]
    #[case::no_path(OutputSpec { name: "outputs".into(), path: "".into() })]
    fn test_malformed_outputs_rejected(#[case] output: OutputSpec) {
        let mut s = spec();
        s.outputs.push(output);
        assert!(matches!(s.validate(), Err(ModelError::InvalidSpec(_))));
    }

    #[test]
    fn test_missing_image_rejected() {
        let mut s = spec();
        s.docker.image = "  ".into();
        assert!(s.validate().is_err());
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some(0), None)]
    #[case(Some(90), Some(Duration::from_secs(90)))]
    fn test_execution_timeout(#[case] secs: Option<u64>, #[case] expected: Option<Duration>) {
        let mut s = spec();
        s.timeout_secs = secs;
        assert_eq!(s.execution_timeout(), expected);
    }

    #[test]
    fn test_storage_source_tagged_json() {
        let volume = StorageSpec {
            name: "data".into(),
            path: "/inputs".into(),
            source: StorageSource::Content { cid: "abc".into() },
        };
        let json = serde_json::to_value(&volume).unwrap();
        assert_eq!(json["source"]["type"], "content");
        assert_eq!(volume.source_type(), StorageSourceType::Content);
    }
}
