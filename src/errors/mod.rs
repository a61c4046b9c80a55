use std::fmt;
use thiserror::Error;

/// Errors produced by the remote-call client.
///
/// This is the only place where raw HTTP status codes and response bodies are
/// interpreted. Everything above the client works with these kinds and never
/// inspects free text again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication rejected (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not implemented by the remote control plane: {0}")]
    NotImplemented(String),

    #[error("remote control plane unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("remote rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Which step of a multi-call workflow was in flight when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Settle,
    ReadConfig,
    Reconfigure,
    PowerOn,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStage::Settle => write!(f, "settle"),
            ProvisionStage::ReadConfig => write!(f, "read-config"),
            ProvisionStage::Reconfigure => write!(f, "reconfigure"),
            ProvisionStage::PowerOn => write!(f, "power-on"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("instance with ID {vmid} already exists on node {node}")]
    AlreadyExists { node: String, vmid: u32 },

    #[error("storage {storage} not found. Available storages: [{}]", .available.join(", "))]
    StorageNotFound {
        storage: String,
        available: Vec<String>,
    },

    #[error("network bridge {bridge} not found. Available bridges: [{}]", .available.join(", "))]
    NetworkNotFound {
        bridge: String,
        available: Vec<String>,
    },

    #[error("boot media {media} not found. Available media: [{}]", .available.join(", "))]
    MediaNotFound {
        media: String,
        available: Vec<String>,
    },

    #[error("template {template} not found. Available templates: [{}]", .available.join(", "))]
    TemplateNotFound {
        template: String,
        available: Vec<String>,
    },

    #[error("instance with ID {vmid} does not exist on node {node}")]
    InstanceNotFound { node: String, vmid: u32 },

    #[error("no free identifier left in range {start}..={end}")]
    IdRangeExhausted { start: u32, end: u32 },

    #[error("remote control plane unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("remote control plane rejected the request: {message}")]
    RemoteRejected { status: Option<u16>, message: String },

    #[error(
        "remote control plane does not support this request (501). \
         The parameters may not match this server version, or a required \
         feature is missing: {0}"
    )]
    RemoteUnsupported(String),

    #[error("instance {vmid} on node {node} was created but the {stage} step failed: {source}")]
    PartialProvisioning {
        node: String,
        vmid: u32,
        stage: ProvisionStage,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Maps a client error in the context of a call that targets `vmid` on
    /// `node`, so a remote "already exists" surfaces exactly like the local
    /// inventory check does.
    pub fn from_remote(err: RemoteError, node: &str, vmid: u32) -> Self {
        match err {
            RemoteError::AlreadyExists(_) => ProvisionError::AlreadyExists {
                node: node.to_string(),
                vmid,
            },
            RemoteError::NotFound(_) => ProvisionError::InstanceNotFound {
                node: node.to_string(),
                vmid,
            },
            other => other.into(),
        }
    }

    /// Like [`from_remote`](Self::from_remote), for calls that create `vmid`.
    /// A "does not exist" from a create refers to something the payload named
    /// (storage, template, bridge), never the new instance, so the remote text
    /// is passed through as a rejection.
    pub fn from_remote_create(err: RemoteError, node: &str, vmid: u32) -> Self {
        match err {
            RemoteError::AlreadyExists(_) => ProvisionError::AlreadyExists {
                node: node.to_string(),
                vmid,
            },
            other => other.into(),
        }
    }

    /// Wraps a failure that happened after the instance already exists.
    pub fn partial(node: &str, vmid: u32, stage: ProvisionStage, source: ProvisionError) -> Self {
        ProvisionError::PartialProvisioning {
            node: node.to_string(),
            vmid,
            stage,
            source: Box::new(source),
        }
    }

    /// Only transport-level trouble is worth retrying; everything else needs a
    /// different request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::RemoteUnavailable(_))
    }

    /// HTTP status the API surface answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            ProvisionError::MissingField { .. }
            | ProvisionError::InvalidField { .. }
            | ProvisionError::StorageNotFound { .. }
            | ProvisionError::NetworkNotFound { .. }
            | ProvisionError::MediaNotFound { .. }
            | ProvisionError::TemplateNotFound { .. } => 400,
            ProvisionError::InstanceNotFound { .. } => 404,
            ProvisionError::AlreadyExists { .. } => 409,
            ProvisionError::IdRangeExhausted { .. } => 507,
            ProvisionError::RemoteUnavailable(_) => 503,
            ProvisionError::RemoteRejected { .. } | ProvisionError::RemoteUnsupported(_) => 502,
            ProvisionError::PartialProvisioning { .. } | ProvisionError::Config(_) => 500,
        }
    }
}

impl From<RemoteError> for ProvisionError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(msg) | RemoteError::Timeout(msg) => {
                ProvisionError::RemoteUnavailable(msg)
            }
            RemoteError::Unavailable { status, message } => {
                ProvisionError::RemoteUnavailable(format!("status {}: {}", status, message))
            }
            RemoteError::NotImplemented(msg) => ProvisionError::RemoteUnsupported(msg),
            RemoteError::Unauthorized { status, message } => ProvisionError::RemoteRejected {
                status: Some(status),
                message,
            },
            RemoteError::Rejected { status, message } => ProvisionError::RemoteRejected {
                status: Some(status),
                message,
            },
            RemoteError::NotFound(message) | RemoteError::AlreadyExists(message) => {
                ProvisionError::RemoteRejected { status: None, message }
            }
            RemoteError::Decode(message) => ProvisionError::RemoteRejected { status: None, message },
        }
    }
}

impl From<config::ConfigError> for ProvisionError {
    fn from(err: config::ConfigError) -> Self {
        ProvisionError::Config(err.to_string())
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
