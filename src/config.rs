pub mod settings;

pub use settings::{
    generate_default_config, ContainerDefaults, ProvisioningSettings, ProxmoxSettings,
    ServerSettings, Settings, VmDefaults, DEFAULT_API_TOKEN,
};
