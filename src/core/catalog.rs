use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::core::client::ClusterApi;
use crate::errors::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub kind: Option<String>,
    /// Empty means the control plane didn't say.
    pub content: Vec<String>,
    pub shared: bool,
}

impl StoragePool {
    /// Pools with unknown content are listed too; the content call will tell.
    pub fn may_hold_media(&self) -> bool {
        self.content.is_empty()
            || self.content.iter().any(|c| c == "iso" || c == "vztmpl")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    pub kind: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Iso,
    ContainerTemplate,
}

impl MediaKind {
    fn from_content(content: &str) -> Option<Self> {
        match content {
            "iso" => Some(MediaKind::Iso),
            "vztmpl" => Some(MediaKind::ContainerTemplate),
            _ => None,
        }
    }

    /// Directory segment in a storage-qualified reference (`local:iso/x.iso`).
    pub fn dir(&self) -> &'static str {
        match self {
            MediaKind::Iso => "iso",
            MediaKind::ContainerTemplate => "vztmpl",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub volid: String,
    pub storage: String,
    pub kind: MediaKind,
    pub format: Option<String>,
    pub size: Option<u64>,
}

/// Point-in-time view of what the cluster offers a node. Never refreshed;
/// build a new one for every admissibility check. An empty list in any
/// category means "unknown", not "none".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCatalog {
    pub node: String,
    pub storage: Vec<StoragePool>,
    pub bridges: Vec<Bridge>,
    pub media: Vec<MediaEntry>,
    pub templates: BTreeMap<String, u32>,
}

impl ResourceCatalog {
    pub fn storage_names(&self) -> Vec<String> {
        self.storage.iter().map(|s| s.name.clone()).collect()
    }

    pub fn bridge_names(&self) -> Vec<String> {
        self.bridges.iter().map(|b| b.name.clone()).collect()
    }

    pub fn media_refs(&self, kind: MediaKind) -> Vec<String> {
        self.media
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.volid.clone())
            .collect()
    }

    pub fn has_storage(&self, name: &str) -> bool {
        self.storage.iter().any(|s| s.name == name)
    }

    pub fn has_bridge(&self, name: &str) -> bool {
        self.bridges.iter().any(|b| b.name == name)
    }

    pub fn has_media(&self, kind: MediaKind, volid: &str) -> bool {
        self.media.iter().any(|m| m.kind == kind && m.volid == volid)
    }

    pub fn template_id(&self, name: &str) -> Option<u32> {
        self.templates.get(name).copied()
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Picks an installer ISO matching the OS family, or `fallback`.
    pub fn default_media_for(&self, ostype: &str, fallback: &str) -> String {
        let isos = self.media_refs(MediaKind::Iso);
        let find = |needle: &str| {
            isos.iter()
                .find(|volid| volid.to_lowercase().contains(needle))
                .cloned()
        };

        let picked = if ostype.starts_with('w') {
            find("windows")
        } else {
            find("debian").or_else(|| find("ubuntu"))
        };
        picked.unwrap_or_else(|| fallback.to_string())
    }
}

pub struct CatalogFetcher<'a> {
    api: &'a dyn ClusterApi,
    registry: &'a BTreeMap<String, u32>,
}

impl<'a> CatalogFetcher<'a> {
    pub fn new(api: &'a dyn ClusterApi, registry: &'a BTreeMap<String, u32>) -> Self {
        Self { api, registry }
    }

    /// Best-effort read of every category. A failing category degrades to an
    /// empty list; only a missing node name is an error.
    pub async fn fetch(&self, node: &str) -> ProvisionResult<ResourceCatalog> {
        if node.is_empty() {
            return Err(ProvisionError::MissingField { field: "node" });
        }

        let storage = self.fetch_storage(node).await;
        let bridges = self.fetch_bridges(node).await;
        let media = self.fetch_media(node, &storage).await;
        let templates = self.fetch_templates(node).await;

        info!(
            node,
            storage = storage.len(),
            bridges = bridges.len(),
            media = media.len(),
            templates = templates.len(),
            "Fetched resource catalog"
        );

        Ok(ResourceCatalog {
            node: node.to_string(),
            storage,
            bridges,
            media,
            templates,
        })
    }

    async fn fetch_storage(&self, node: &str) -> Vec<StoragePool> {
        match self.api.cluster_storage().await {
            Ok(data) => {
                let pools = parse_storage(&data);
                if !pools.is_empty() {
                    return pools;
                }
                debug!(node, "Cluster storage view is empty, asking the node");
            }
            Err(e) => warn!(node, error = %e, "Cluster storage query failed, asking the node"),
        }

        match self.api.node_storage(node).await {
            Ok(data) => parse_storage(&data),
            Err(e) => {
                warn!(node, error = %e, "Node storage query failed, storage is unknown");
                Vec::new()
            }
        }
    }

    async fn fetch_bridges(&self, node: &str) -> Vec<Bridge> {
        match self.api.node_networks(node).await {
            Ok(data) => parse_bridges(&data),
            Err(e) => {
                warn!(node, error = %e, "Network query failed, bridges are unknown");
                Vec::new()
            }
        }
    }

    async fn fetch_media(&self, node: &str, storage: &[StoragePool]) -> Vec<MediaEntry> {
        let mut media = Vec::new();
        for pool in storage.iter().filter(|p| p.may_hold_media()) {
            match self.api.storage_content(node, &pool.name).await {
                Ok(data) => media.extend(parse_media(&data, &pool.name)),
                Err(e) => warn!(node, storage = %pool.name, error = %e, "Skipping storage content"),
            }
        }
        media
    }

    async fn fetch_templates(&self, node: &str) -> BTreeMap<String, u32> {
        let mut templates = BTreeMap::new();
        match self.api.list_vms(node).await {
            Ok(data) => templates.extend(parse_templates(&data)),
            Err(e) => warn!(node, error = %e, "Instance listing failed, using template registry only"),
        }
        // registry wins on conflicts
        templates.extend(self.registry.iter().map(|(k, v)| (k.clone(), *v)));
        templates
    }
}

/// Numbers show up as JSON numbers or numeric strings depending on endpoint.
pub fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Flags show up as booleans or 0/1.
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn content_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn rows(data: &Value) -> &[Value] {
    data.as_array().map(Vec::as_slice).unwrap_or(&[])
}

pub fn parse_storage(data: &Value) -> Vec<StoragePool> {
    let mut pools: Vec<StoragePool> = Vec::new();
    for row in rows(data) {
        let Some(name) = row.get("storage").and_then(Value::as_str) else {
            continue;
        };
        // the cluster view repeats shared storage once per node
        if pools.iter().any(|p| p.name == name) {
            continue;
        }
        let kind = row
            .get("plugintype")
            .or_else(|| row.get("type"))
            .and_then(Value::as_str)
            .filter(|k| *k != "storage")
            .map(String::from);
        pools.push(StoragePool {
            name: name.to_string(),
            kind,
            content: content_list(row.get("content")),
            shared: row.get("shared").and_then(value_as_bool).unwrap_or(false),
        });
    }
    pools
}

pub fn parse_bridges(data: &Value) -> Vec<Bridge> {
    rows(data)
        .iter()
        .filter_map(|row| {
            let name = row.get("iface").and_then(Value::as_str)?;
            let kind = row.get("type").and_then(Value::as_str);
            if let Some(kind) = kind {
                if kind != "bridge" && kind != "OVSBridge" {
                    return None;
                }
            }
            Some(Bridge {
                name: name.to_string(),
                kind: kind.map(String::from),
                active: row.get("active").and_then(value_as_bool).unwrap_or(false),
            })
        })
        .collect()
}

pub fn parse_media(data: &Value, storage: &str) -> Vec<MediaEntry> {
    rows(data)
        .iter()
        .filter_map(|row| {
            let kind = row
                .get("content")
                .and_then(Value::as_str)
                .and_then(MediaKind::from_content)?;
            let volid = row.get("volid").and_then(Value::as_str)?;
            Some(MediaEntry {
                volid: volid.to_string(),
                storage: storage.to_string(),
                kind,
                format: row.get("format").and_then(Value::as_str).map(String::from),
                size: row.get("size").and_then(Value::as_u64),
            })
        })
        .collect()
}

pub fn parse_templates(data: &Value) -> BTreeMap<String, u32> {
    rows(data)
        .iter()
        .filter(|row| row.get("template").and_then(value_as_bool).unwrap_or(false))
        .filter_map(|row| {
            let name = row.get("name").and_then(Value::as_str)?;
            let vmid = row.get("vmid").and_then(value_as_u32)?;
            Some((name.to_string(), vmid))
        })
        .collect()
}
