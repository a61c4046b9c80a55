// Turns validated specs into the control plane's flat key=value config grammar.
//
// Quirks worth knowing before touching anything here:
//   - disks are always emitted as `<storage>:<GiB>,format=raw` on virtio0
//   - ide2 is the boot media slot, for both CD-ROMs and the cloud-init drive,
//     and attaching a second cloud-init drive there is a hard remote error
//   - sshkeys wants newline separated keys, url-encoded, inside JSON

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::client::Payload;
use crate::core::vm::{CloudInitConfig, ContainerSpec, VmSpec};
use crate::errors::{ProvisionError, ProvisionResult};

pub const DISK_FORMAT: &str = "raw";
pub const BOOT_DISK_SLOT: &str = "virtio0";
pub const MEDIA_SLOT: &str = "ide2";
pub const NIC_MODEL: &str = "virtio";
pub const SCSI_CONTROLLER: &str = "virtio-scsi-pci";

/// Same set a browser's encodeURIComponent leaves alone.
const SSH_KEY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub storage: String,
    pub size_gib: u32,
}

impl DiskDescriptor {
    /// Accepts `storage`, `storage:32`, `storage:32G`, `storage:2048M`, and
    /// anything we emitted ourselves (trailing `,key=value` options are dropped).
    pub fn parse(raw: &str, default_size_gib: u32) -> ProvisionResult<Self> {
        let raw = raw.trim();
        let volume = raw.split(',').next().unwrap_or_default();
        let (storage, size) = match volume.split_once(':') {
            Some((storage, size)) => (storage.trim(), size.trim()),
            None => (volume.trim(), ""),
        };

        if storage.is_empty() {
            return Err(ProvisionError::InvalidField {
                field: "disk",
                reason: format!("no storage name in {:?}", raw),
            });
        }

        let size_gib = if size.is_empty() {
            default_size_gib
        } else {
            parse_size_gib(size).ok_or_else(|| ProvisionError::InvalidField {
                field: "disk",
                reason: format!("size {:?} is not a number of G or M", size),
            })?
        };

        Ok(Self {
            storage: storage.to_string(),
            size_gib,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{},format={}", self.storage, self.size_gib, DISK_FORMAT)
    }
}

fn parse_size_gib(size: &str) -> Option<u32> {
    let (digits, megabytes) = match size.chars().last()? {
        'G' | 'g' => (&size[..size.len() - 1], false),
        'M' | 'm' => (&size[..size.len() - 1], true),
        _ => (size, false),
    };
    let value: u32 = digits.trim().parse().ok()?;
    if value == 0 {
        None
    } else if megabytes {
        Some(value.div_ceil(1024))
    } else {
        Some(value)
    }
}

/// Storage name of a volume reference such as `local-lvm:vm-201-disk-0,size=32G`.
pub fn storage_of_volume(volume: &str) -> Option<&str> {
    let (storage, _) = volume.split_once(':')?;
    let storage = storage.trim();
    (!storage.is_empty()).then_some(storage)
}

pub fn is_cloudinit_drive(value: &str) -> bool {
    value.contains("cloudinit")
}

/// `ide2`, `scsi1`, `virtio0`... but not `scsihw`.
pub fn is_drive_slot(key: &str) -> bool {
    ["ide", "sata", "scsi", "virtio"].iter().any(|bus| {
        key.strip_prefix(bus)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Slot already holding a cloud-init drive, wherever the template put it.
pub fn cloudinit_slot(config: &Value) -> Option<&str> {
    config
        .as_object()?
        .iter()
        .find(|(key, value)| {
            is_drive_slot(key) && value.as_str().is_some_and(is_cloudinit_drive)
        })
        .map(|(key, _)| key.as_str())
}

/// Splits free-form key input into one key per line. Users paste keys
/// separated by spaces; each key starts at its type token.
pub fn normalize_ssh_keys(raw: &str) -> String {
    let mut keys: Vec<Vec<&str>> = Vec::new();
    for token in raw.split_whitespace() {
        match keys.last_mut() {
            Some(current) if !is_key_type(token) => current.push(token),
            _ => keys.push(vec![token]),
        }
    }
    keys.iter()
        .map(|parts| parts.join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

/// What actually goes over the wire for `sshkeys`.
pub fn encode_ssh_keys(raw: &str) -> String {
    utf8_percent_encode(&normalize_ssh_keys(raw), SSH_KEY_ESCAPE).to_string()
}

pub fn bridge_descriptor(bridge: &str) -> String {
    format!("{},bridge={}", NIC_MODEL, bridge)
}

pub fn cdrom_descriptor(media: &str) -> String {
    format!("{},media=cdrom", media)
}

pub fn cloudinit_descriptor(storage: &str) -> String {
    format!("{}:cloudinit", storage)
}

/// Update for a cloned instance, plus whatever was asked for but left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconfigurePlan {
    pub payload: Payload,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    default_disk_size_gib: u32,
}

impl PayloadEncoder {
    pub fn new(default_disk_size_gib: u32) -> Self {
        Self {
            default_disk_size_gib,
        }
    }

    /// Full create payload for the direct path.
    pub fn build_vm_payload(&self, spec: &VmSpec, vmid: u32) -> ProvisionResult<Payload> {
        let disk = spec.disk.as_deref().ok_or(ProvisionError::MissingField { field: "disk" })?;
        let bridge = spec
            .bridge
            .as_deref()
            .ok_or(ProvisionError::MissingField { field: "bridge" })?;
        let disk = DiskDescriptor::parse(disk, self.default_disk_size_gib)?;

        let mut payload = Payload::new();
        payload.insert("vmid".into(), json!(vmid));
        insert_sizing(&mut payload, spec);
        payload.insert(BOOT_DISK_SLOT.into(), json!(disk.encode()));
        payload.insert("net0".into(), json!(bridge_descriptor(bridge)));
        payload.insert("scsihw".into(), json!(SCSI_CONTROLLER));
        payload.insert("bootdisk".into(), json!(BOOT_DISK_SLOT));
        payload.insert("acpi".into(), json!(1));

        if spec.wants_cloud_init() {
            payload.insert(MEDIA_SLOT.into(), json!(cloudinit_descriptor(&disk.storage)));
            insert_cloud_init(&mut payload, &spec.cloud_init);
        } else if let Some(iso) = spec.iso.as_deref() {
            payload.insert(MEDIA_SLOT.into(), json!(cdrom_descriptor(iso)));
        }

        Ok(payload)
    }

    /// Incremental update for a freshly cloned instance: only the fields the
    /// caller set, checked against `current` so no second cloud-init drive is
    /// ever attached.
    pub fn plan_reconfigure(
        &self,
        spec: &VmSpec,
        current: &Value,
        cloudinit_storage: &str,
    ) -> ReconfigurePlan {
        let mut plan = ReconfigurePlan::default();
        let payload = &mut plan.payload;
        insert_sizing(payload, spec);
        if let Some(bridge) = spec.bridge.as_deref() {
            payload.insert("net0".into(), json!(bridge_descriptor(bridge)));
        }
        if spec.disk.is_some() {
            debug!("Ignoring disk override on a cloned instance; resizing is not supported");
        }

        let media = current.get(MEDIA_SLOT).and_then(Value::as_str);

        if spec.wants_cloud_init() {
            match (cloudinit_slot(current), media) {
                (Some(slot), _) => {
                    debug!(slot, "Cloud-init drive already attached");
                }
                (None, None) => {
                    let storage = cloudinit_storage_for(current, cloudinit_storage);
                    payload.insert(MEDIA_SLOT.into(), json!(cloudinit_descriptor(&storage)));
                }
                (None, Some(existing)) => {
                    warn!(existing, "Media slot holds a CD-ROM, not attaching a cloud-init drive");
                    plan.skipped.push(format!(
                        "cloud-init drive not attached: {} holds {}",
                        MEDIA_SLOT, existing
                    ));
                }
            }
            insert_cloud_init(payload, &spec.cloud_init);
        } else if let Some(iso) = spec.iso.as_deref() {
            match media {
                Some(existing) if is_cloudinit_drive(existing) => {
                    warn!(iso, "Media slot holds the cloud-init drive, not swapping in boot media");
                    plan.skipped.push(format!(
                        "boot media {} not attached: {} holds the cloud-init drive",
                        iso, MEDIA_SLOT
                    ));
                }
                _ => {
                    payload.insert(MEDIA_SLOT.into(), json!(cdrom_descriptor(iso)));
                }
            }
        }

        plan
    }

    pub fn build_container_payload(&self, spec: &ContainerSpec, ctid: u32) -> ProvisionResult<Payload> {
        let password = spec
            .password
            .as_deref()
            .ok_or(ProvisionError::MissingField { field: "password" })?;
        let storage = spec
            .storage
            .as_deref()
            .ok_or(ProvisionError::MissingField { field: "storage" })?;
        let disk = spec.disk.ok_or(ProvisionError::MissingField { field: "disk" })?;
        let template = spec
            .template
            .as_deref()
            .ok_or(ProvisionError::MissingField { field: "template" })?;
        let bridge = spec
            .bridge
            .as_deref()
            .ok_or(ProvisionError::MissingField { field: "bridge" })?;

        let hostname = spec
            .hostname
            .clone()
            .unwrap_or_else(|| format!("ct-{}", ctid));

        let mut payload = Payload::new();
        payload.insert("vmid".into(), json!(ctid));
        payload.insert("hostname".into(), json!(hostname));
        if let Some(cores) = spec.cores {
            payload.insert("cores".into(), json!(cores));
        }
        if let Some(memory) = spec.memory {
            payload.insert("memory".into(), json!(memory));
        }
        if let Some(swap) = spec.swap {
            payload.insert("swap".into(), json!(swap));
        }
        payload.insert("storage".into(), json!(storage));
        payload.insert("rootfs".into(), json!(format!("{}:{}", storage, disk)));
        payload.insert(
            "net0".into(),
            json!(format!("name=eth0,bridge={},ip=dhcp", bridge)),
        );
        payload.insert("ostemplate".into(), json!(template));
        payload.insert(
            "unprivileged".into(),
            json!(u8::from(spec.unprivileged.unwrap_or(true))),
        );
        payload.insert("password".into(), json!(password));
        Ok(payload)
    }
}

/// Cloud-init drive goes next to the boot disk when we can tell where that is.
pub fn cloudinit_storage_for(config: &Value, fallback: &str) -> String {
    let boot_slot = config
        .get("bootdisk")
        .and_then(Value::as_str)
        .unwrap_or(BOOT_DISK_SLOT);
    [boot_slot, "virtio0", "scsi0", "sata0"]
        .iter()
        .filter_map(|slot| config.get(*slot).and_then(Value::as_str))
        .find_map(storage_of_volume)
        .unwrap_or(fallback)
        .to_string()
}

fn insert_sizing(payload: &mut Payload, spec: &VmSpec) {
    if let Some(name) = &spec.name {
        payload.insert("name".into(), json!(name));
    }
    if let Some(cores) = spec.cores {
        payload.insert("cores".into(), json!(cores));
    }
    if let Some(memory) = spec.memory {
        payload.insert("memory".into(), json!(memory));
    }
    if let Some(sockets) = spec.sockets {
        payload.insert("sockets".into(), json!(sockets));
    }
    if let Some(cpu) = &spec.cpu {
        payload.insert("cpu".into(), json!(cpu));
    }
    if let Some(ostype) = &spec.ostype {
        payload.insert("ostype".into(), json!(ostype));
    }
}

fn insert_cloud_init(payload: &mut Payload, ci: &CloudInitConfig) {
    if let Some(user) = &ci.ciuser {
        payload.insert("ciuser".into(), json!(user));
    }
    if let Some(password) = &ci.cipassword {
        payload.insert("cipassword".into(), json!(password));
    }
    if let Some(keys) = &ci.sshkeys {
        payload.insert("sshkeys".into(), json!(encode_ssh_keys(keys)));
    }
    if let Some(ns) = &ci.nameserver {
        payload.insert("nameserver".into(), json!(ns));
    }
    if let Some(domain) = &ci.searchdomain {
        payload.insert("searchdomain".into(), json!(domain));
    }
    let ip = ci.ipconfig.as_deref().unwrap_or("ip=dhcp");
    payload.insert("ipconfig0".into(), json!(ip));
}
