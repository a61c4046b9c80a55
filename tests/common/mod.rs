// In-memory stand-in for a Proxmox node. Good enough to watch the engine
// clone, poll, reconfigure and trip over its own ide2 slot. 🧪
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use proxmox_provisioner::config::{ContainerDefaults, ProvisioningSettings};
use proxmox_provisioner::core::client::{CloneRequest, ClusterApi, Payload, PowerAction};
use proxmox_provisioner::{Provisioner, RemoteError};

pub const NODE: &str = "pve";

#[derive(Debug, Clone)]
pub struct Instance {
    pub config: Map<String, Value>,
    pub running: bool,
    pub template: bool,
}

#[derive(Debug)]
pub struct ClusterState {
    pub storage: Vec<Value>,
    pub networks: Vec<Value>,
    pub content: BTreeMap<String, Vec<Value>>,
    pub vms: BTreeMap<u32, Instance>,
    pub containers: BTreeMap<u32, Instance>,
    /// upid -> polls left before the task reports stopped
    pub tasks: BTreeMap<String, u32>,
    pub clone_polls: u32,
    pub task_exit: String,
    /// operation names that answer 503
    pub failing: BTreeSet<String>,
    /// operation names that answer with a fixed error
    pub rejections: BTreeMap<String, RemoteError>,
    pub calls: Vec<String>,
    task_seq: u32,
}

pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    /// local (iso + vztmpl), local-lvm (images), bridge vmbr0, one Debian ISO,
    /// one container template, and template VM 100 "ubuntu-22".
    pub fn new() -> Self {
        let mut content = BTreeMap::new();
        content.insert(
            "local".to_string(),
            vec![
                json!({"volid": "local:iso/debian-12.9.0-amd64-netinst.iso", "content": "iso", "format": "iso", "size": 650000000u64}),
                json!({"volid": "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst", "content": "vztmpl", "format": "tzst"}),
            ],
        );

        let mut vms = BTreeMap::new();
        let template_config = json!({
            "name": "ubuntu-22-template",
            "cores": 2,
            "memory": 2048,
            "virtio0": "local-lvm:base-100-disk-0,size=32G",
            "ide2": "local-lvm:vm-100-cloudinit,media=cdrom",
            "net0": "virtio=BC:24:11:00:00:01,bridge=vmbr0",
            "template": 1,
        });
        vms.insert(
            100,
            Instance {
                config: object(template_config),
                running: false,
                template: true,
            },
        );

        Self {
            state: Mutex::new(ClusterState {
                storage: vec![
                    json!({"storage": "local", "node": NODE, "plugintype": "dir", "content": "iso,vztmpl,backup", "shared": 0}),
                    json!({"storage": "local-lvm", "node": NODE, "plugintype": "lvmthin", "content": "images,rootdir", "shared": 0}),
                ],
                networks: vec![
                    json!({"iface": "vmbr0", "type": "bridge", "active": 1}),
                    json!({"iface": "eno1", "type": "eth", "active": 1}),
                ],
                content,
                vms,
                containers: BTreeMap::new(),
                tasks: BTreeMap::new(),
                clone_polls: 2,
                task_exit: "OK".to_string(),
                failing: BTreeSet::new(),
                rejections: BTreeMap::new(),
                calls: Vec::new(),
                task_seq: 0,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn fail_on(&self, op: &str) {
        self.state().failing.insert(op.to_string());
    }

    pub fn reject_on(&self, op: &str, err: RemoteError) {
        self.state().rejections.insert(op.to_string(), err);
    }

    pub fn add_vm(&self, vmid: u32, config: Value) {
        self.state().vms.insert(
            vmid,
            Instance {
                config: object(config),
                running: false,
                template: false,
            },
        );
    }

    pub fn add_container(&self, ctid: u32, hostname: &str) {
        self.state().containers.insert(
            ctid,
            Instance {
                config: object(json!({"hostname": hostname})),
                running: false,
                template: false,
            },
        );
    }

    pub fn vm_config_of(&self, vmid: u32) -> Option<Map<String, Value>> {
        self.state().vms.get(&vmid).map(|i| i.config.clone())
    }

    pub fn is_running(&self, vmid: u32) -> bool {
        self.state().vms.get(&vmid).map(|i| i.running).unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn enter(&self, call: String) -> Result<MutexGuard<'_, ClusterState>, RemoteError> {
        let mut state = self.state();
        let op = call.split_whitespace().next().unwrap_or_default().to_string();
        state.calls.push(call);
        if state.failing.contains(&op) {
            return Err(RemoteError::Unavailable {
                status: 503,
                message: format!("{} is down", op),
            });
        }
        if let Some(err) = state.rejections.get(&op) {
            return Err(err.clone());
        }
        Ok(state)
    }
}

impl ClusterState {
    fn next_upid(&mut self, kind: &str, id: u32) -> String {
        self.task_seq += 1;
        format!(
            "UPID:{}:0000{:04X}:00C3D4E5:65F0A0B0:{}:{}:root@pam:",
            NODE, self.task_seq, kind, id
        )
    }

    fn id_taken(&self, id: u32) -> bool {
        self.vms.contains_key(&id) || self.containers.contains_key(&id)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn listing(instances: &BTreeMap<u32, Instance>, name_key: &str) -> Value {
    Value::Array(
        instances
            .iter()
            .map(|(id, inst)| {
                json!({
                    "vmid": id,
                    "name": inst.config.get(name_key).cloned().unwrap_or(Value::Null),
                    "status": if inst.running { "running" } else { "stopped" },
                    "template": u8::from(inst.template),
                })
            })
            .collect(),
    )
}

fn payload_id(payload: &Payload) -> u32 {
    payload.get("vmid").and_then(Value::as_u64).unwrap_or_default() as u32
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn nodes(&self) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let _state = self.enter("nodes".into())?;
        Ok(json!([{"node": NODE, "status": "online"}]))
    }

    async fn cluster_storage(&self) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter("cluster_storage".into())?;
        Ok(Value::Array(state.storage.clone()))
    }

    async fn node_storage(&self, node: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("node_storage {}", node))?;
        Ok(Value::Array(state.storage.clone()))
    }

    async fn node_networks(&self, node: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("node_networks {}", node))?;
        Ok(Value::Array(state.networks.clone()))
    }

    async fn storage_content(&self, _node: &str, storage: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("storage_content {}", storage))?;
        Ok(Value::Array(state.content.get(storage).cloned().unwrap_or_default()))
    }

    async fn list_vms(&self, node: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("list_vms {}", node))?;
        Ok(listing(&state.vms, "name"))
    }

    async fn vm_status(&self, _node: &str, vmid: u32) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("vm_status {}", vmid))?;
        match state.vms.get(&vmid) {
            Some(inst) => Ok(json!({"vmid": vmid, "status": if inst.running { "running" } else { "stopped" }})),
            None => Err(RemoteError::NotFound(format!("VM {} does not exist", vmid))),
        }
    }

    async fn vm_config(&self, _node: &str, vmid: u32) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("vm_config {}", vmid))?;
        state
            .vms
            .get(&vmid)
            .map(|inst| Value::Object(inst.config.clone()))
            .ok_or_else(|| {
                RemoteError::NotFound(format!("Configuration file 'qemu-server/{}.conf' does not exist", vmid))
            })
    }

    async fn create_vm(&self, _node: &str, payload: &Payload) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let vmid = payload_id(payload);
        let mut state = self.enter(format!("create_vm {}", vmid))?;
        if state.id_taken(vmid) {
            return Err(RemoteError::AlreadyExists(format!(
                "unable to create VM {} - VM {} already exists on node '{}'",
                vmid, vmid, NODE
            )));
        }
        let config = payload
            .iter()
            .filter(|(k, _)| k.as_str() != "vmid")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        state.vms.insert(
            vmid,
            Instance {
                config,
                running: false,
                template: false,
            },
        );
        Ok(Value::String(state.next_upid("qmcreate", vmid)))
    }

    async fn clone_vm(&self, _node: &str, source: u32, request: &CloneRequest) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("clone_vm {}->{}", source, request.newid))?;
        let Some(template) = state.vms.get(&source).cloned() else {
            return Err(RemoteError::NotFound(format!("VM {} does not exist", source)));
        };
        if state.id_taken(request.newid) {
            return Err(RemoteError::AlreadyExists(format!(
                "unable to create VM {}: config file already exists",
                request.newid
            )));
        }

        let mut config = template.config;
        config.remove("template");
        if let Some(name) = &request.name {
            config.insert("name".into(), json!(name));
        }
        state.vms.insert(
            request.newid,
            Instance {
                config,
                running: false,
                template: false,
            },
        );

        let upid = state.next_upid("qmclone", source);
        let polls = state.clone_polls;
        state.tasks.insert(upid.clone(), polls);
        Ok(Value::String(upid))
    }

    async fn update_vm_config(&self, _node: &str, vmid: u32, payload: &Payload) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("update_vm_config {}", vmid))?;
        let Some(inst) = state.vms.get_mut(&vmid) else {
            return Err(RemoteError::NotFound(format!("VM {} does not exist", vmid)));
        };
        let occupied = inst.config.contains_key("ide2");
        let has_ci = inst
            .config
            .values()
            .any(|v| v.as_str().is_some_and(|s| s.contains("cloudinit")));
        let attaching_ci = payload
            .get("ide2")
            .and_then(Value::as_str)
            .map(|v| v.contains("cloudinit"))
            .unwrap_or(false);
        if attaching_ci && (occupied || has_ci) {
            return Err(RemoteError::Rejected {
                status: 500,
                message: "ide2: cloudinit drive already exists".to_string(),
            });
        }
        for (k, v) in payload {
            inst.config.insert(k.clone(), v.clone());
        }
        Ok(Value::Null)
    }

    async fn vm_power(&self, _node: &str, vmid: u32, action: PowerAction) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("vm_power {} {}", vmid, action.as_str()))?;
        let Some(inst) = state.vms.get_mut(&vmid) else {
            return Err(RemoteError::NotFound(format!("VM {} does not exist", vmid)));
        };
        inst.running = action == PowerAction::Start;
        let kind = format!("qm{}", action.as_str());
        Ok(Value::String(state.next_upid(&kind, vmid)))
    }

    async fn delete_vm(&self, _node: &str, vmid: u32) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("delete_vm {}", vmid))?;
        if state.vms.remove(&vmid).is_none() {
            return Err(RemoteError::NotFound(format!("VM {} does not exist", vmid)));
        }
        Ok(Value::String(state.next_upid("qmdestroy", vmid)))
    }

    async fn list_containers(&self, node: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("list_containers {}", node))?;
        Ok(listing(&state.containers, "hostname"))
    }

    async fn container_status(&self, _node: &str, ctid: u32) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let state = self.enter(format!("container_status {}", ctid))?;
        match state.containers.get(&ctid) {
            Some(inst) => Ok(json!({"vmid": ctid, "status": if inst.running { "running" } else { "stopped" }})),
            None => Err(RemoteError::NotFound(format!("CT {} does not exist", ctid))),
        }
    }

    async fn create_container(&self, _node: &str, payload: &Payload) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let ctid = payload_id(payload);
        let mut state = self.enter(format!("create_container {}", ctid))?;
        if state.id_taken(ctid) {
            return Err(RemoteError::AlreadyExists(format!("CT {} already exists on node '{}'", ctid, NODE)));
        }
        let config = payload
            .iter()
            .filter(|(k, _)| k.as_str() != "vmid")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        state.containers.insert(
            ctid,
            Instance {
                config,
                running: false,
                template: false,
            },
        );
        Ok(Value::String(state.next_upid("vzcreate", ctid)))
    }

    async fn container_power(&self, _node: &str, ctid: u32, action: PowerAction) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("container_power {} {}", ctid, action.as_str()))?;
        let Some(inst) = state.containers.get_mut(&ctid) else {
            return Err(RemoteError::NotFound(format!("CT {} does not exist", ctid)));
        };
        inst.running = action == PowerAction::Start;
        let kind = format!("vz{}", action.as_str());
        Ok(Value::String(state.next_upid(&kind, ctid)))
    }

    async fn delete_container(&self, _node: &str, ctid: u32) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("delete_container {}", ctid))?;
        if state.containers.remove(&ctid).is_none() {
            return Err(RemoteError::NotFound(format!("CT {} does not exist", ctid)));
        }
        Ok(Value::String(state.next_upid("vzdestroy", ctid)))
    }

    async fn task_status(&self, _node: &str, upid: &str) -> Result<Value, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.enter(format!("task_status {}", upid))?;
        let exit = state.task_exit.clone();
        match state.tasks.get_mut(upid) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Ok(json!({"status": "running", "upid": upid}))
            }
            Some(_) => Ok(json!({"status": "stopped", "exitstatus": exit, "upid": upid})),
            None => Err(RemoteError::NotFound(format!("no such task '{}'", upid))),
        }
    }
}

pub fn fast_settings() -> ProvisioningSettings {
    ProvisioningSettings {
        settle_poll_interval_ms: 10,
        settle_timeout_secs: 5,
        ..Default::default()
    }
}

pub fn registry() -> BTreeMap<String, u32> {
    BTreeMap::from([("ubuntu-22".to_string(), 100)])
}

pub fn provisioner_with(fake: Arc<FakeCluster>, settings: ProvisioningSettings) -> Provisioner {
    Provisioner::from_parts(
        fake,
        settings,
        ContainerDefaults::default(),
        registry(),
        NODE.to_string(),
    )
}

pub fn provisioner(fake: Arc<FakeCluster>) -> Provisioner {
    provisioner_with(fake, fast_settings())
}
