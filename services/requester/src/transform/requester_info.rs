use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bidmesh_id::NodeId;
use bidmesh_model::{Job, RequesterInfo};

use super::{TransformError, Transformer};

/// Stamps the requester's node ID and public key onto the job.
#[derive(Debug, Clone)]
pub struct RequesterInfoStamper {
    info: RequesterInfo,
}

impl RequesterInfoStamper {
    pub fn new(node_id: NodeId, public_key: &[u8]) -> Self {
        Self {
            info: RequesterInfo {
                node_id,
                public_key: STANDARD.encode(public_key),
            },
        }
    }
}

#[async_trait]
impl Transformer for RequesterInfoStamper {
    fn name(&self) -> &'static str {
        "requester_info"
    }

    async fn transform(&self, job: &mut Job) -> Result<bool, TransformError> {
        if job.requester.as_ref() == Some(&self.info) {
            return Ok(false);
        }
        job.requester = Some(self.info.clone());
        Ok(true)
    }
}
