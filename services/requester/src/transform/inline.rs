use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_model::{Job, StorageSource};
use bidmesh_storage::ContentPinner;

use super::{TransformError, Transformer};

/// Pins inline input data and replaces it with a content reference, so the
/// persisted job never carries raw payloads.
pub struct InlineStoragePinner {
    pinner: Arc<dyn ContentPinner>,
}

impl InlineStoragePinner {
    pub fn new(pinner: Arc<dyn ContentPinner>) -> Self {
        Self { pinner }
    }
}

#[async_trait]
impl Transformer for InlineStoragePinner {
    fn name(&self) -> &'static str {
        "inline_storage_pinner"
    }

    async fn transform(&self, job: &mut Job) -> Result<bool, TransformError> {
        let mut modified = false;
        let volumes = job.spec.inputs.iter_mut().chain(job.spec.contexts.iter_mut());
        for volume in volumes {
            let StorageSource::Inline { data } = &volume.source else {
                continue;
            };
            let cid = self
                .pinner
                .pin_bytes(data.as_bytes())
                .await
                .map_err(|source| TransformError::Storage {
                    transform: "inline_storage_pinner",
                    source,
                })?;
            volume.source = StorageSource::Content { cid };
            modified = true;
        }
        Ok(modified)
    }
}
