use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::errors::ProvisionError;

/// `{ success, data?, error? }`, the shape every endpoint answers with.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<Value> {
    pub fn failure(message: impl Into<String>, data: Option<Value>) -> Json<Self> {
        Json(Self {
            success: false,
            data,
            error: Some(message.into()),
        })
    }
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // partial failures tell the caller what is left behind
        let data = match &self {
            ProvisionError::PartialProvisioning {
                node, vmid, stage, ..
            } => Some(json!({ "node": node, "vmid": vmid, "stage": stage.to_string() })),
            ProvisionError::AlreadyExists { node, vmid } => Some(json!({ "node": node, "vmid": vmid })),
            _ => None,
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), "Request failed: {}", self);
        } else {
            warn!(status = status.as_u16(), "Request rejected: {}", self);
        }

        (status, ApiResponse::failure(self.to_string(), data)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProvisionStage;

    #[test]
    fn statuses_follow_the_error() {
        let resp = ProvisionError::MissingField { field: "node" }.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ProvisionError::partial(
            "pve",
            201,
            ProvisionStage::Reconfigure,
            ProvisionError::RemoteUnavailable("timeout".into()),
        )
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
