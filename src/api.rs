//! JSON envelope shared by the check endpoint and the control plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, request_id: Option<String>, trace_id: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            trace_id,
            request_id,
        }
    }

    pub fn fail(
        code: impl Into<String>,
        message: impl Into<String>,
        details: HashMap<String, String>,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorInfo {
                code: code.into(),
                message: message.into(),
                details,
            }),
            trace_id,
            request_id: None,
        }
    }
}
