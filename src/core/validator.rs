use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::core::allocator::instance_ids;
use crate::core::catalog::{MediaKind, ResourceCatalog};
use crate::core::client::ClusterApi;
use crate::core::vm::{ContainerSpec, VmSpec};
use crate::errors::{ProvisionError, ProvisionResult};

/// Admissibility checks against one catalog snapshot.
///
/// Checks run in a fixed order and stop at the first failure. Empty catalog
/// categories are treated as unknown and let requests through; the control
/// plane gets the final say on those.
pub struct SpecValidator<'a> {
    catalog: &'a ResourceCatalog,
    default_bridges: &'a [String],
}

impl<'a> SpecValidator<'a> {
    pub fn new(catalog: &'a ResourceCatalog, default_bridges: &'a [String]) -> Self {
        Self {
            catalog,
            default_bridges,
        }
    }

    /// `existing` is the node's instance set, VMs and containers together.
    pub fn validate_vm(&self, spec: &VmSpec, existing: &BTreeSet<u32>) -> ProvisionResult<()> {
        let node = required(spec.node.as_deref(), "node")?;
        // clones inherit disk and NIC from the template
        if spec.template.is_none() {
            required(spec.disk.as_deref(), "disk")?;
            required(spec.bridge.as_deref(), "bridge")?;
        }

        if let Some(vmid) = spec.vmid {
            check_unique(node, vmid, existing)?;
        }
        if let Some(disk) = spec.disk.as_deref() {
            self.check_storage(storage_name(disk))?;
        }
        if let Some(bridge) = spec.bridge.as_deref() {
            self.check_bridge(bridge)?;
        }
        if let Some(iso) = spec.iso.as_deref() {
            if !spec.wants_cloud_init() {
                self.check_media(MediaKind::Iso, iso)?;
            }
        }

        debug!(node, vmid = ?spec.vmid, "VM spec is admissible");
        Ok(())
    }

    pub fn validate_container(
        &self,
        spec: &ContainerSpec,
        existing: &BTreeSet<u32>,
    ) -> ProvisionResult<()> {
        let node = required(spec.node.as_deref(), "node")?;
        required(spec.password.as_deref(), "password")?;
        if spec.disk.is_none() {
            return Err(ProvisionError::MissingField { field: "disk" });
        }
        let storage = required(spec.storage.as_deref(), "storage")?;
        let template = required(spec.template.as_deref(), "template")?;
        let bridge = required(spec.bridge.as_deref(), "bridge")?;

        if let Some(ctid) = spec.ctid {
            check_unique(node, ctid, existing)?;
        }
        self.check_storage(storage)?;
        self.check_media(MediaKind::ContainerTemplate, template)?;
        self.check_bridge(bridge)?;

        debug!(node, ctid = ?spec.ctid, "Container spec is admissible");
        Ok(())
    }

    pub fn check_storage(&self, storage: &str) -> ProvisionResult<()> {
        if self.catalog.storage.is_empty() {
            warn!(storage, "Storage list unavailable, admitting without confirmation");
            return Ok(());
        }
        if self.catalog.has_storage(storage) {
            return Ok(());
        }
        Err(ProvisionError::StorageNotFound {
            storage: storage.to_string(),
            available: self.catalog.storage_names(),
        })
    }

    pub fn check_bridge(&self, bridge: &str) -> ProvisionResult<()> {
        if self.catalog.has_bridge(bridge) {
            return Ok(());
        }
        if self.default_bridges.iter().any(|b| b == bridge) {
            debug!(bridge, "Admitting default bridge");
            return Ok(());
        }
        if self.catalog.bridges.is_empty() {
            warn!(bridge, "Bridge list unavailable, admitting without confirmation");
            return Ok(());
        }

        let mut available = self.catalog.bridge_names();
        for default in self.default_bridges {
            if !available.contains(default) {
                available.push(default.clone());
            }
        }
        Err(ProvisionError::NetworkNotFound {
            bridge: bridge.to_string(),
            available,
        })
    }

    pub fn check_media(&self, kind: MediaKind, reference: &str) -> ProvisionResult<()> {
        if self.catalog.has_media(kind, reference) {
            return Ok(());
        }
        if is_qualified_media(kind, reference) {
            warn!(media = reference, "Media not in catalog, admitting by naming convention");
            return Ok(());
        }
        Err(ProvisionError::MediaNotFound {
            media: reference.to_string(),
            available: self.catalog.media_refs(kind),
        })
    }
}

/// Fetches the node's instance set and runs the VM checks.
pub async fn validate_vm(
    api: &dyn ClusterApi,
    catalog: &ResourceCatalog,
    default_bridges: &[String],
    spec: &VmSpec,
) -> ProvisionResult<()> {
    let node = required(spec.node.as_deref(), "node")?;
    let existing = instance_ids(api, node).await?;
    SpecValidator::new(catalog, default_bridges).validate_vm(spec, &existing)
}

pub async fn validate_container(
    api: &dyn ClusterApi,
    catalog: &ResourceCatalog,
    default_bridges: &[String],
    spec: &ContainerSpec,
) -> ProvisionResult<()> {
    let node = required(spec.node.as_deref(), "node")?;
    let existing = instance_ids(api, node).await?;
    SpecValidator::new(catalog, default_bridges).validate_container(spec, &existing)
}

pub fn check_unique(node: &str, vmid: u32, existing: &BTreeSet<u32>) -> ProvisionResult<()> {
    if existing.contains(&vmid) {
        return Err(ProvisionError::AlreadyExists {
            node: node.to_string(),
            vmid,
        });
    }
    Ok(())
}

/// Pool name of a disk descriptor: everything before the first `:`.
pub fn storage_name(disk: &str) -> &str {
    let volume = disk.split(',').next().unwrap_or(disk);
    volume.split(':').next().unwrap_or(volume).trim()
}

/// `<storage>:<iso|vztmpl>/<file>`
pub fn is_qualified_media(kind: MediaKind, reference: &str) -> bool {
    let Some((storage, path)) = reference.split_once(':') else {
        return false;
    };
    let Some(file) = path.strip_prefix(kind.dir()).and_then(|p| p.strip_prefix('/')) else {
        return false;
    };
    !storage.is_empty()
        && !storage.contains(char::is_whitespace)
        && !file.is_empty()
        && !file.contains(char::is_whitespace)
}

fn required<'s>(value: Option<&'s str>, field: &'static str) -> ProvisionResult<&'s str> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ProvisionError::MissingField { field })
}
