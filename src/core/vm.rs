use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ContainerDefaults, VmDefaults};

/// A "create this VM" request, as loose as callers like to send it.
///
/// Every field is optional: the direct path fills gaps from configured
/// defaults, the template path only sends what the caller actually set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// MB
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    /// `storage[:size]`, size in G or M
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default, alias = "net", deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub iso: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub ostype: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub cloudinit: bool,
    #[serde(flatten)]
    pub cloud_init: CloudInitConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInitConfig {
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub ciuser: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub cipassword: Option<String>,
    /// One or more OpenSSH public keys; spaces between keys are fine.
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub sshkeys: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub nameserver: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub searchdomain: Option<String>,
    /// e.g. `ip=10.0.0.5/24,gw=10.0.0.1`; DHCP when absent
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub ipconfig: Option<String>,
}

impl VmSpec {
    pub fn wants_cloud_init(&self) -> bool {
        self.cloudinit
    }

    /// Only fills what's missing; identity and boot media are left alone since
    /// those come from the allocator and the catalog.
    pub fn apply_defaults(&mut self, defaults: &VmDefaults) {
        self.cores.get_or_insert(defaults.cores);
        self.memory.get_or_insert(defaults.memory_mb);
        self.disk.get_or_insert_with(|| defaults.disk.clone());
        self.bridge.get_or_insert_with(|| defaults.bridge.clone());
        self.ostype.get_or_insert_with(|| defaults.ostype.clone());
        self.cpu.get_or_insert_with(|| defaults.cpu.clone());
        self.sockets.get_or_insert(defaults.sockets);
    }

    pub fn normalize_ostype(&mut self) {
        if let Some(ostype) = self.ostype.as_mut() {
            *ostype = normalize_ostype(ostype);
        }
    }
}

/// Friendly OS names to the hypervisor's OS type tags.
pub fn normalize_ostype(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "debian" | "ubuntu" | "linux" => "l26".to_string(),
        "windows" => "win10".to_string(),
        _ => raw.to_string(),
    }
}

/// Container (LXC) creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, alias = "vmid", deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub ctid: Option<u32>,
    #[serde(default, alias = "name", deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub swap: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// GiB
    #[serde(default, deserialize_with = "lenient::opt_u32", skip_serializing_if = "Option::is_none")]
    pub disk: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, alias = "net", deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing)]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unprivileged: Option<bool>,
}

impl ContainerSpec {
    pub fn apply_defaults(&mut self, defaults: &ContainerDefaults) {
        self.memory.get_or_insert(defaults.memory_mb);
        self.swap.get_or_insert(defaults.swap_mb);
        self.cores.get_or_insert(defaults.cores);
        self.disk.get_or_insert(defaults.disk_gib);
        self.storage.get_or_insert_with(|| defaults.storage.clone());
        self.bridge.get_or_insert_with(|| defaults.bridge.clone());
        self.template.get_or_insert_with(|| defaults.template.clone());
        self.unprivileged.get_or_insert(defaults.unprivileged);
    }
}

/// What a successful remote call handed back. The control plane either
/// answers with the finished object or with a task handle to poll; both are
/// success.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisioningResult {
    Completed { data: Value },
    Task { upid: String },
}

impl ProvisioningResult {
    pub fn from_response(data: Value) -> Self {
        match data {
            Value::String(s) if is_task_handle(&s) => ProvisioningResult::Task { upid: s },
            other => ProvisioningResult::Completed { data: other },
        }
    }

    pub fn upid(&self) -> Option<&str> {
        match self {
            ProvisioningResult::Task { upid } => Some(upid),
            ProvisioningResult::Completed { .. } => None,
        }
    }
}

pub fn is_task_handle(s: &str) -> bool {
    s.starts_with("UPID:")
}

/// Summary handed to the caller after a provisioning workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionOutcome {
    pub node: String,
    pub vmid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_template: Option<u32>,
    pub result: ProvisioningResult,
    pub started: bool,
    /// Requested changes the clone could not take.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

/// Request bodies come from humans and old scripts: numbers arrive as
/// strings, "" means "not set".
mod lenient {
    use serde::{de, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("expected a non-negative integer, got {}", n))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| de::Error::custom(format!("expected a number, got {:?}", s))),
            Some(other) => Err(de::Error::custom(format!("expected a number, got {}", other))),
        }
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        match opt_u64(d)? {
            None => Ok(None),
            Some(n) => u32::try_from(n)
                .map(Some)
                .map_err(|_| de::Error::custom(format!("{} is out of range", n))),
        }
    }
}
