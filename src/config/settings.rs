/*
* Proxmox Provisioner Configuration
* ---------------------------------
* @project: proxmox-provisioner
*
* Where we decide which cluster we talk to, how we prove who we are, and what
* a VM looks like when the caller couldn't be bothered to tell us.
*
* Configuration Hierarchy (from lowest to highest priority):
* -----------------------------------------------------
* 1. Hardcoded defaults (set_default calls below)
* 2. default.toml (base configuration)
* 3. local.toml (environment-specific, optional)
* 4. Environment variables: APP_ prefix, "__" between sections
*    e.g. APP_PROXMOX__TOKEN_SECRET=... (keep secrets out of git, please)
*
* Sections:
* --------
* 1. server       - the thin HTTP surface (bind address, bearer token, limits)
* 2. proxmox      - remote control plane URL, API token, default node, timeouts
* 3. provisioning - identifier allocation policy, settle polling, defaults
* 4. containers   - defaults for the LXC path
* 5. templates    - template registry: logical name -> source VMID
*
* The template registry is read-only for the engine. Nothing in here opens a
* connection; the client gets built from these values in main/cli.
*/

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::allocator::AllocationPolicy;

/// Placeholder token shipped in `default.toml` and written by `init`.
pub const DEFAULT_API_TOKEN: &str = "change-me";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub proxmox: ProxmoxSettings,
    pub provisioning: ProvisioningSettings,
    pub containers: ContainerDefaults,
    #[serde(default)]
    pub templates: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    pub api_token: String,
    pub max_concurrent_requests: usize,
    pub body_limit_bytes: usize,
}

impl ServerSettings {
    /// An empty token would lock every caller out.
    pub fn check_api_token(&self) -> Result<(), ConfigError> {
        if self.api_token.trim().is_empty() {
            return Err(ConfigError::Message(
                "server.api_token is empty; set APP_SERVER__API_TOKEN".to_string(),
            ));
        }
        Ok(())
    }

    pub fn uses_default_token(&self) -> bool {
        self.api_token == DEFAULT_API_TOKEN
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxSettings {
    pub base_url: String,
    pub node: String,
    pub token_id: String,
    pub token_secret: String,
    pub accept_invalid_certs: bool,
    pub request_timeout_secs: u64,
}

impl ProxmoxSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSettings {
    pub allocation: AllocationPolicy,
    pub default_disk_size_gib: u32,
    pub settle_timeout_secs: u64,
    pub settle_poll_interval_ms: u64,
    pub cloudinit_storage: String,
    pub default_bridges: Vec<String>,
    pub defaults: VmDefaults,
}

impl ProvisioningSettings {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn settle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settle_poll_interval_ms)
    }
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            allocation: AllocationPolicy::default(),
            default_disk_size_gib: 50,
            settle_timeout_secs: 300,
            settle_poll_interval_ms: 2000,
            cloudinit_storage: "local-lvm".to_string(),
            default_bridges: vec!["vmbr0".to_string(), "vmbr1".to_string()],
            defaults: VmDefaults::default(),
        }
    }
}

/// Values filled into a direct-creation request the caller left empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDefaults {
    pub cores: u32,
    pub memory_mb: u64,
    pub disk: String,
    pub bridge: String,
    pub ostype: String,
    pub cpu: String,
    pub sockets: u32,
    pub iso: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cores: 2,
            memory_mb: 4096,
            disk: "local-lvm:32".to_string(),
            bridge: "vmbr0".to_string(),
            ostype: "l26".to_string(),
            cpu: "host".to_string(),
            sockets: 1,
            iso: "local:iso/debian-12.9.0-amd64-netinst.iso".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDefaults {
    pub memory_mb: u64,
    pub swap_mb: u64,
    pub cores: u32,
    pub disk_gib: u32,
    pub storage: String,
    pub bridge: String,
    pub unprivileged: bool,
    pub template: String,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            memory_mb: 2000,
            swap_mb: 2000,
            cores: 2,
            disk_gib: 8,
            storage: "local".to_string(),
            bridge: "vmbr0".to_string(),
            unprivileged: true,
            template: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".to_string(),
        }
    }
}

impl Settings {
    /// Loads from `$CONFIG_PATH` (default `config/`).
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::new_from_file(Path::new(&config_path))
    }

    pub fn new_from_file(config_dir: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_dir.display());

        let defaults = generate_default_config();
        let config = Config::builder()
            // Start with default settings
            .add_source(Config::try_from(&defaults)?)
            // Add configuration from files
            .add_source(File::from(config_dir.join("default")).required(false))
            .add_source(File::from(config_dir.join("local")).required(false))
            // APP_PROXMOX__NODE=pve2 and friends
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        config.try_deserialize()
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_prefix: "/api/v1".to_string(),
            api_token: DEFAULT_API_TOKEN.to_string(),
            max_concurrent_requests: 64,
            body_limit_bytes: 64 * 1024,
        },
        proxmox: ProxmoxSettings {
            base_url: "https://localhost:8006/api2/json".to_string(),
            node: "pve".to_string(),
            token_id: String::new(),
            token_secret: String::new(),
            accept_invalid_certs: true,
            request_timeout_secs: 30,
        },
        provisioning: ProvisioningSettings::default(),
        containers: ContainerDefaults::default(),
        templates: BTreeMap::new(),
    }
}
