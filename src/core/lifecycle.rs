use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::core::allocator::ids_from_listing;
use crate::core::client::{ClusterApi, PowerAction};
use crate::core::vm::ProvisioningResult;
use crate::errors::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Vm,
    Container,
}

impl InstanceKind {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceKind::Vm => "VM",
            InstanceKind::Container => "container",
        }
    }
}

/// Operations on instances that already exist. Each one checks the node's
/// listing first so a typo'd id is a clean `InstanceNotFound`.
pub struct InstanceLifecycle<'a> {
    api: &'a dyn ClusterApi,
}

impl<'a> InstanceLifecycle<'a> {
    pub fn new(api: &'a dyn ClusterApi) -> Self {
        Self { api }
    }

    pub async fn list(&self, node: &str, kind: InstanceKind) -> ProvisionResult<Value> {
        let listing = match kind {
            InstanceKind::Vm => self.api.list_vms(node).await?,
            InstanceKind::Container => self.api.list_containers(node).await?,
        };
        Ok(listing)
    }

    pub async fn ensure_exists(&self, node: &str, kind: InstanceKind, id: u32) -> ProvisionResult<()> {
        let listing = self.list(node, kind).await?;
        if ids_from_listing(&listing).contains(&id) {
            Ok(())
        } else {
            Err(ProvisionError::InstanceNotFound {
                node: node.to_string(),
                vmid: id,
            })
        }
    }

    /// Current status object.
    pub async fn get(&self, node: &str, kind: InstanceKind, id: u32) -> ProvisionResult<Value> {
        self.ensure_exists(node, kind, id).await?;
        let status = match kind {
            InstanceKind::Vm => self.api.vm_status(node, id).await,
            InstanceKind::Container => self.api.container_status(node, id).await,
        };
        status.map_err(|e| ProvisionError::from_remote(e, node, id))
    }

    pub async fn start(&self, node: &str, kind: InstanceKind, id: u32) -> ProvisionResult<ProvisioningResult> {
        self.power(node, kind, id, PowerAction::Start).await
    }

    pub async fn stop(&self, node: &str, kind: InstanceKind, id: u32) -> ProvisionResult<ProvisioningResult> {
        self.power(node, kind, id, PowerAction::Stop).await
    }

    async fn power(
        &self,
        node: &str,
        kind: InstanceKind,
        id: u32,
        action: PowerAction,
    ) -> ProvisionResult<ProvisioningResult> {
        self.ensure_exists(node, kind, id).await?;
        info!(node, id, action = action.as_str(), "Changing {} power state", kind.label());
        let response = match kind {
            InstanceKind::Vm => self.api.vm_power(node, id, action).await,
            InstanceKind::Container => self.api.container_power(node, id, action).await,
        };
        response
            .map(ProvisioningResult::from_response)
            .map_err(|e| ProvisionError::from_remote(e, node, id))
    }

    pub async fn delete(&self, node: &str, kind: InstanceKind, id: u32) -> ProvisionResult<ProvisioningResult> {
        self.ensure_exists(node, kind, id).await?;
        info!(node, id, "Deleting {}", kind.label());
        let response = match kind {
            InstanceKind::Vm => self.api.delete_vm(node, id).await,
            InstanceKind::Container => self.api.delete_container(node, id).await,
        };
        response
            .map(ProvisioningResult::from_response)
            .map_err(|e| ProvisionError::from_remote(e, node, id))
    }
}
