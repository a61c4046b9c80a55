use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::ProxmoxSettings;
use crate::errors::{ProvisionError, RemoteError};

/// Flat key-value configuration, the grammar every create/update call speaks.
pub type Payload = BTreeMap<String, Value>;

/// Power transitions the workflow and lifecycle calls use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneRequest {
    pub newid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub target: String,
    pub full: u8,
}

/// Everything the engine needs from the remote control plane.
///
/// Every method returns the already-unwrapped `data` field of the response.
/// Listings come back as raw JSON on purpose: the catalog and allocator own
/// the normalization of the many shapes the control plane produces.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn nodes(&self) -> Result<Value, RemoteError>;
    async fn cluster_storage(&self) -> Result<Value, RemoteError>;
    async fn node_storage(&self, node: &str) -> Result<Value, RemoteError>;
    async fn node_networks(&self, node: &str) -> Result<Value, RemoteError>;
    async fn storage_content(&self, node: &str, storage: &str) -> Result<Value, RemoteError>;

    async fn list_vms(&self, node: &str) -> Result<Value, RemoteError>;
    async fn vm_status(&self, node: &str, vmid: u32) -> Result<Value, RemoteError>;
    async fn vm_config(&self, node: &str, vmid: u32) -> Result<Value, RemoteError>;
    async fn create_vm(&self, node: &str, payload: &Payload) -> Result<Value, RemoteError>;
    async fn clone_vm(&self, node: &str, source: u32, request: &CloneRequest) -> Result<Value, RemoteError>;
    async fn update_vm_config(&self, node: &str, vmid: u32, payload: &Payload) -> Result<Value, RemoteError>;
    async fn vm_power(&self, node: &str, vmid: u32, action: PowerAction) -> Result<Value, RemoteError>;
    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<Value, RemoteError>;

    async fn list_containers(&self, node: &str) -> Result<Value, RemoteError>;
    async fn container_status(&self, node: &str, ctid: u32) -> Result<Value, RemoteError>;
    async fn create_container(&self, node: &str, payload: &Payload) -> Result<Value, RemoteError>;
    async fn container_power(&self, node: &str, ctid: u32, action: PowerAction) -> Result<Value, RemoteError>;
    async fn delete_container(&self, node: &str, ctid: u32) -> Result<Value, RemoteError>;

    async fn task_status(&self, node: &str, upid: &str) -> Result<Value, RemoteError>;
}

/// HTTPS client for the control plane's REST interface.
#[derive(Debug, Clone)]
pub struct ProxmoxClient {
    base_url: String,
    auth_header: Option<String>,
    client: Client,
    timeout: Duration,
}

impl ProxmoxClient {
    pub fn new(settings: &ProxmoxSettings) -> Result<Self, ProvisionError> {
        let client = Client::builder()
            // self-signed certs are the norm on these clusters
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|e| ProvisionError::Config(format!("failed to build HTTP client: {}", e)))?;

        let auth_header = if settings.token_id.is_empty() || settings.token_secret.is_empty() {
            None
        } else {
            Some(format!("PVEAPIToken={}={}", settings.token_id, settings.token_secret))
        };

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth_header,
            client,
            timeout: settings.request_timeout(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, method: Method, endpoint: &str, payload: Option<&Payload>) -> Result<Value, RemoteError> {
        let url = format!("{}{}", self.base_url, endpoint);
        match payload {
            Some(body) => debug!(%method, %url, payload = %redacted(body), "Remote request"),
            None => debug!(%method, %url, "Remote request"),
        }

        let mut request = self.client.request(method.clone(), &url).timeout(self.timeout);
        if let Some(header) = &self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| transport_error(&method, &url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error(&method, &url, e))?;
        debug!(%method, %url, status = status.as_u16(), "Remote response");

        if status.is_client_error() || status.is_server_error() {
            let err = classify_failure(status, &body);
            error!(%method, %url, status = status.as_u16(), error = %err, "Remote call failed");
            return Err(err);
        }

        unwrap_envelope(&body)
    }
}

fn transport_error(method: &Method, url: &str, err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(format!("{} {}", method, url))
    } else {
        RemoteError::Transport(format!("{} {}: {}", method, url, err))
    }
}

/// Pulls `data` out of a successful response. A missing field is `null`.
pub fn unwrap_envelope(body: &str) -> Result<Value, RemoteError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let mut parsed: Value =
        serde_json::from_str(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok(parsed.get_mut("data").map(Value::take).unwrap_or(Value::Null))
}

/// Turns a failed response into one of the closed set of remote error kinds.
/// Status codes decide first; message text is only consulted for the two
/// conditions the control plane reports as plain 500s.
pub fn classify_failure(status: StatusCode, body: &str) -> RemoteError {
    let message = failure_message(status, body);
    let code = status.as_u16();

    match status {
        StatusCode::NOT_IMPLEMENTED => RemoteError::NotImplemented(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Unauthorized { status: code, message }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            RemoteError::Unavailable { status: code, message }
        }
        StatusCode::CONFLICT => RemoteError::AlreadyExists(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        _ => {
            let lowered = message.to_lowercase();
            if lowered.contains("already exists") {
                RemoteError::AlreadyExists(message)
            } else if lowered.contains("does not exist") {
                RemoteError::NotFound(message)
            } else {
                RemoteError::Rejected { status: code, message }
            }
        }
    }
}

fn failure_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(errors) = parsed.get("errors").filter(|e| !e.is_null()) {
            return errors.to_string();
        }
        match parsed.get("data") {
            Some(Value::Object(data)) => {
                if let Some(msg) = data.get("msg").and_then(Value::as_str) {
                    return msg.to_string();
                }
            }
            Some(Value::Null) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                return "internal server error with no details; likely invalid VM parameters, \
                        insufficient disk space, missing privileges, or a storage \
                        configuration problem"
                    .to_string();
            }
            _ => {}
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    } else {
        trimmed.to_string()
    }
}

/// Payload rendered for logs with secrets masked.
fn redacted(payload: &Payload) -> String {
    let mut masked = payload.clone();
    for key in ["password", "cipassword"] {
        if let Some(value) = masked.get_mut(key) {
            *value = Value::String("***".to_string());
        }
    }
    serde_json::to_string(&masked).unwrap_or_default()
}

#[async_trait]
impl ClusterApi for ProxmoxClient {
    async fn nodes(&self) -> Result<Value, RemoteError> {
        self.call(Method::GET, "/nodes", None).await
    }

    async fn cluster_storage(&self) -> Result<Value, RemoteError> {
        self.call(Method::GET, "/cluster/resources?type=storage", None).await
    }

    async fn node_storage(&self, node: &str) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/storage", node), None).await
    }

    async fn node_networks(&self, node: &str) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/network", node), None).await
    }

    async fn storage_content(&self, node: &str, storage: &str) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/storage/{}/content", node, storage), None)
            .await
    }

    async fn list_vms(&self, node: &str) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/qemu", node), None).await
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/qemu/{}/status/current", node, vmid), None)
            .await
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/qemu/{}/config", node, vmid), None).await
    }

    async fn create_vm(&self, node: &str, payload: &Payload) -> Result<Value, RemoteError> {
        self.call(Method::POST, &format!("/nodes/{}/qemu", node), Some(payload)).await
    }

    async fn clone_vm(&self, node: &str, source: u32, request: &CloneRequest) -> Result<Value, RemoteError> {
        let payload = to_payload(request)?;
        self.call(Method::POST, &format!("/nodes/{}/qemu/{}/clone", node, source), Some(&payload))
            .await
    }

    async fn update_vm_config(&self, node: &str, vmid: u32, payload: &Payload) -> Result<Value, RemoteError> {
        // PUT applies synchronously; POST would hand back a task
        self.call(Method::PUT, &format!("/nodes/{}/qemu/{}/config", node, vmid), Some(payload))
            .await
    }

    async fn vm_power(&self, node: &str, vmid: u32, action: PowerAction) -> Result<Value, RemoteError> {
        let endpoint = format!("/nodes/{}/qemu/{}/status/{}", node, vmid, action.as_str());
        self.call(Method::POST, &endpoint, None).await
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<Value, RemoteError> {
        self.call(Method::DELETE, &format!("/nodes/{}/qemu/{}", node, vmid), None).await
    }

    async fn list_containers(&self, node: &str) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/lxc", node), None).await
    }

    async fn container_status(&self, node: &str, ctid: u32) -> Result<Value, RemoteError> {
        self.call(Method::GET, &format!("/nodes/{}/lxc/{}/status/current", node, ctid), None)
            .await
    }

    async fn create_container(&self, node: &str, payload: &Payload) -> Result<Value, RemoteError> {
        self.call(Method::POST, &format!("/nodes/{}/lxc", node), Some(payload)).await
    }

    async fn container_power(&self, node: &str, ctid: u32, action: PowerAction) -> Result<Value, RemoteError> {
        let endpoint = format!("/nodes/{}/lxc/{}/status/{}", node, ctid, action.as_str());
        self.call(Method::POST, &endpoint, None).await
    }

    async fn delete_container(&self, node: &str, ctid: u32) -> Result<Value, RemoteError> {
        self.call(Method::DELETE, &format!("/nodes/{}/lxc/{}", node, ctid), None).await
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<Value, RemoteError> {
        let upid = utf8_percent_encode(upid, NON_ALPHANUMERIC);
        self.call(Method::GET, &format!("/nodes/{}/tasks/{}/status", node, upid), None).await
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Payload, RemoteError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| RemoteError::Decode(e.to_string()))
}
