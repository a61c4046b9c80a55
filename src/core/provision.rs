use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ContainerDefaults, ProvisioningSettings, Settings};
use crate::core::allocator::IdAllocator;
use crate::core::catalog::{CatalogFetcher, ResourceCatalog};
use crate::core::client::{CloneRequest, ClusterApi, PowerAction};
use crate::core::payload::{PayloadEncoder, ReconfigurePlan};
use crate::core::validator::{validate_container, validate_vm};
use crate::core::vm::{ContainerSpec, ProvisionOutcome, ProvisioningResult, VmSpec};
use crate::errors::{ProvisionError, ProvisionResult, ProvisionStage};

/// How a clone task ended, as far as the settle loop could tell.
#[derive(Debug)]
enum Settled {
    Done,
    Failed(String),
}

/// Entry point for everything that creates instances.
///
/// Holds no per-request state: every call refetches the catalog and
/// instance list, so one `Provisioner` can serve concurrent requests.
pub struct Provisioner {
    api: Arc<dyn ClusterApi>,
    settings: ProvisioningSettings,
    containers: ContainerDefaults,
    templates: BTreeMap<String, u32>,
    default_node: String,
    encoder: PayloadEncoder,
}

impl Provisioner {
    pub fn new(api: Arc<dyn ClusterApi>, settings: &Settings) -> Self {
        Self::from_parts(
            api,
            settings.provisioning.clone(),
            settings.containers.clone(),
            settings.templates.clone(),
            settings.proxmox.node.clone(),
        )
    }

    pub fn from_parts(
        api: Arc<dyn ClusterApi>,
        settings: ProvisioningSettings,
        containers: ContainerDefaults,
        templates: BTreeMap<String, u32>,
        default_node: String,
    ) -> Self {
        let encoder = PayloadEncoder::new(settings.default_disk_size_gib);
        Self {
            api,
            settings,
            containers,
            templates,
            default_node,
            encoder,
        }
    }

    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    pub fn default_node(&self) -> &str {
        &self.default_node
    }

    pub fn encoder(&self) -> &PayloadEncoder {
        &self.encoder
    }

    /// `node` if given and non-empty, otherwise the configured default.
    pub fn resolve_node(&self, node: Option<&str>) -> String {
        node.filter(|n| !n.trim().is_empty())
            .unwrap_or(self.default_node.as_str())
            .to_string()
    }

    pub async fn fetch_catalog(&self, node: &str) -> ProvisionResult<ResourceCatalog> {
        CatalogFetcher::new(self.api(), &self.templates).fetch(node).await
    }

    pub async fn allocate_id(&self, node: &str) -> ProvisionResult<u32> {
        IdAllocator::new(self.api(), &self.settings.allocation)
            .allocate_id(node)
            .await
    }

    /// Fresh catalog plus the node's instance set, then the VM checks.
    pub async fn validate(&self, spec: &VmSpec) -> ProvisionResult<()> {
        let node = self.resolve_node(spec.node.as_deref());
        let catalog = self.fetch_catalog(&node).await?;
        validate_vm(self.api(), &catalog, &self.settings.default_bridges, spec).await
    }

    /// Template requests clone, everything else is created from scratch.
    pub async fn provision_vm(&self, spec: VmSpec) -> ProvisionResult<ProvisionOutcome> {
        if spec.template.is_some() {
            self.provision_from_template(spec).await
        } else {
            self.provision_direct(spec).await
        }
    }

    pub async fn provision_direct(&self, mut spec: VmSpec) -> ProvisionResult<ProvisionOutcome> {
        let node = self.resolve_node(spec.node.as_deref());
        spec.node = Some(node.clone());

        let catalog = self.fetch_catalog(&node).await?;

        spec.apply_defaults(&self.settings.defaults);
        spec.normalize_ostype();
        let vmid = match spec.vmid {
            Some(vmid) => vmid,
            None => self.allocate_id(&node).await?,
        };
        spec.vmid = Some(vmid);
        if spec.name.is_none() {
            spec.name = Some(format!("vm-{}", vmid));
        }
        if spec.iso.is_none() && !spec.wants_cloud_init() {
            let ostype = spec.ostype.as_deref().unwrap_or_default();
            spec.iso = Some(catalog.default_media_for(ostype, &self.settings.defaults.iso));
        }

        validate_vm(self.api(), &catalog, &self.settings.default_bridges, &spec).await?;
        let payload = self.encoder.build_vm_payload(&spec, vmid)?;

        info!(node = %node, vmid, name = ?spec.name, "Creating VM");
        let response = self
            .api
            .create_vm(&node, &payload)
            .await
            .map_err(|e| ProvisionError::from_remote_create(e, &node, vmid))?;

        Ok(ProvisionOutcome {
            node,
            vmid,
            name: spec.name,
            source_template: None,
            result: ProvisioningResult::from_response(response),
            started: false,
            skipped: Vec::new(),
        })
    }

    /// Clone, wait for the clone to land, then push only what the caller
    /// overrode. Once the clone call succeeds every failure is partial: the
    /// instance is there and the caller has to know about it.
    pub async fn provision_from_template(
        &self,
        mut spec: VmSpec,
    ) -> ProvisionResult<ProvisionOutcome> {
        let template = spec
            .template
            .clone()
            .ok_or(ProvisionError::MissingField { field: "template" })?;
        let node = self.resolve_node(spec.node.as_deref());
        spec.node = Some(node.clone());
        spec.normalize_ostype();

        let catalog = self.fetch_catalog(&node).await?;
        let source = catalog
            .template_id(&template)
            .ok_or_else(|| ProvisionError::TemplateNotFound {
                template: template.clone(),
                available: catalog.template_names(),
            })?;

        let vmid = match spec.vmid {
            Some(vmid) => vmid,
            None => self.allocate_id(&node).await?,
        };
        spec.vmid = Some(vmid);

        validate_vm(self.api(), &catalog, &self.settings.default_bridges, &spec).await?;

        let request = CloneRequest {
            newid: vmid,
            name: spec.name.clone(),
            target: node.clone(),
            full: 1,
        };
        info!(node = %node, source, vmid, template = %template, "Cloning template");
        let response = self
            .api
            .clone_vm(&node, source, &request)
            .await
            .map_err(|e| ProvisionError::from_remote_create(e, &node, vmid))?;
        let result = ProvisioningResult::from_response(response);

        // from here on the instance exists
        if let Some(upid) = result.upid() {
            match self.settle(&node, upid).await {
                Ok(Settled::Done) => {}
                Ok(Settled::Failed(exit)) => {
                    error!(node = %node, vmid, upid, exit = %exit, "Clone task failed");
                    return Err(ProvisionError::RemoteRejected {
                        status: None,
                        message: format!("clone task {} ended with {}", upid, exit),
                    });
                }
                Err(e) => return Err(ProvisionError::partial(&node, vmid, ProvisionStage::Settle, e)),
            }
        }

        let current = self
            .api
            .vm_config(&node, vmid)
            .await
            .map_err(|e| ProvisionError::partial(&node, vmid, ProvisionStage::ReadConfig, e.into()))?;

        let ReconfigurePlan { payload, skipped } =
            self.encoder
                .plan_reconfigure(&spec, &current, &self.settings.cloudinit_storage);
        if payload.is_empty() {
            debug!(node = %node, vmid, "Nothing to reconfigure");
        } else {
            debug!(node = %node, vmid, keys = ?payload.keys().collect::<Vec<_>>(), "Reconfiguring clone");
            self.api
                .update_vm_config(&node, vmid, &payload)
                .await
                .map_err(|e| {
                    ProvisionError::partial(&node, vmid, ProvisionStage::Reconfigure, e.into())
                })?;
        }

        let mut started = false;
        if spec.wants_cloud_init() {
            self.api
                .vm_power(&node, vmid, PowerAction::Start)
                .await
                .map_err(|e| ProvisionError::partial(&node, vmid, ProvisionStage::PowerOn, e.into()))?;
            started = true;
        }

        if !skipped.is_empty() {
            warn!(node = %node, vmid, ?skipped, "Clone is missing requested changes");
        }
        info!(node = %node, vmid, source, started, "Template provisioning finished");
        Ok(ProvisionOutcome {
            node,
            vmid,
            name: spec.name,
            source_template: Some(source),
            result,
            started,
            skipped,
        })
    }

    /// Polls the task until it stops or the settle deadline passes.
    async fn settle(&self, node: &str, upid: &str) -> ProvisionResult<Settled> {
        let deadline = Instant::now() + self.settings.settle_timeout();
        let interval = self.settings.settle_poll_interval();

        loop {
            let status = self.api.task_status(node, upid).await?;
            if let Some(outcome) = task_outcome(&status) {
                debug!(node, upid, ?outcome, "Task settled");
                return Ok(outcome);
            }
            if Instant::now() + interval > deadline {
                warn!(node, upid, "Gave up waiting for task");
                return Err(ProvisionError::RemoteUnavailable(format!(
                    "task {} did not finish within {}s",
                    upid,
                    self.settings.settle_timeout().as_secs()
                )));
            }
            sleep(interval).await;
        }
    }

    pub async fn provision_container(
        &self,
        mut spec: ContainerSpec,
    ) -> ProvisionResult<ProvisionOutcome> {
        let node = self.resolve_node(spec.node.as_deref());
        spec.node = Some(node.clone());
        spec.apply_defaults(&self.containers);

        let catalog = self.fetch_catalog(&node).await?;
        let ctid = match spec.ctid {
            Some(ctid) => ctid,
            None => self.allocate_id(&node).await?,
        };
        spec.ctid = Some(ctid);
        if spec.hostname.is_none() {
            spec.hostname = Some(format!("ct-{}", ctid));
        }

        validate_container(self.api(), &catalog, &self.settings.default_bridges, &spec).await?;
        let payload = self.encoder.build_container_payload(&spec, ctid)?;

        info!(node = %node, ctid, hostname = ?spec.hostname, "Creating container");
        let response = self
            .api
            .create_container(&node, &payload)
            .await
            .map_err(|e| ProvisionError::from_remote_create(e, &node, ctid))?;

        Ok(ProvisionOutcome {
            node,
            vmid: ctid,
            name: spec.hostname,
            source_template: None,
            result: ProvisioningResult::from_response(response),
            started: false,
            skipped: Vec::new(),
        })
    }
}

/// `None` while the task is still running.
fn task_outcome(status: &Value) -> Option<Settled> {
    if status.get("status").and_then(Value::as_str) != Some("stopped") {
        return None;
    }
    let exit = status
        .get("exitstatus")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    if exit == "OK" {
        Some(Settled::Done)
    } else {
        Some(Settled::Failed(exit.to_string()))
    }
}
