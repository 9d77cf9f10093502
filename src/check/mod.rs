pub mod coordinator;
pub mod replay;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use coordinator::CheckCoordinator;

/// Free-form caller metadata (client ip, user id, ...).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    /// Caller-supplied idempotency token
    pub request_id: String,

    pub tenant_id: String,

    pub resource_key: String,

    /// Units to consume; absent means 1
    #[serde(default)]
    pub tokens: Option<u64>,

    /// When the request happened on the caller's side (epoch millis)
    #[serde(default)]
    pub timestamp: Option<i64>,

    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl CheckRequest {
    pub fn new(request_id: &str, tenant_id: &str, resource_key: &str, tokens: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            tenant_id: tenant_id.to_string(),
            resource_key: resource_key.to_string(),
            tokens: Some(tokens),
            timestamp: None,
            metadata: None,
        }
    }

    pub fn tokens_requested(&self) -> u64 {
        self.tokens.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,

    /// Best-effort estimate
    pub remaining: u64,

    pub policy_version: Option<String>,

    pub reason: Reason,

    pub tenant_id: String,

    pub resource_key: String,

    pub request_id: String,

    /// Server time of the decision (epoch millis)
    pub timestamp: i64,
}

/// Why a check was denied; `None` for allowed checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    #[serde(rename = "")]
    None,
    PolicyNotFound,
    QuotaExceeded,
    PolicyDisabled,
    InternalError,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::None => "",
            Reason::PolicyNotFound => "policy_not_found",
            Reason::QuotaExceeded => "quota_exceeded",
            Reason::PolicyDisabled => "policy_disabled",
            Reason::InternalError => "internal_error",
        }
    }
}

impl FromStr for Reason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" => Ok(Reason::None),
            "policy_not_found" => Ok(Reason::PolicyNotFound),
            "quota_exceeded" => Ok(Reason::QuotaExceeded),
            "policy_disabled" => Ok(Reason::PolicyDisabled),
            "internal_error" => Ok(Reason::InternalError),
            other => Err(format!("unknown reason '{}'", other)),
        }
    }
}

/// Which tier produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPath {
    Local,
    Distributed,
    PolicyNotFound,
    Error,
}

impl ProcessPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessPath::Local => "local",
            ProcessPath::Distributed => "distributed",
            ProcessPath::PolicyNotFound => "policy_not_found",
            ProcessPath::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_round_trips_through_wire_strings() {
        for reason in [
            Reason::None,
            Reason::PolicyNotFound,
            Reason::QuotaExceeded,
            Reason::PolicyDisabled,
            Reason::InternalError,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
            assert_eq!(reason.as_str().parse::<Reason>().unwrap(), reason);
        }
    }

    #[test]
    fn request_defaults_to_one_token() {
        let req: CheckRequest = serde_json::from_str(
            r#"{"requestId":"r1","tenantId":"t1","resourceKey":"/orders","metadata":{"ip":"10.0.0.1"}}"#,
        )
        .unwrap();
        assert_eq!(req.tokens_requested(), 1);
        assert_eq!(req.metadata.unwrap()["ip"], "10.0.0.1");
    }

    #[test]
    fn response_serializes_camel_case() {
        let resp = CheckResponse {
            allowed: false,
            remaining: 0,
            policy_version: None,
            reason: Reason::PolicyNotFound,
            tenant_id: "t".into(),
            resource_key: "/r".into(),
            request_id: "id".into(),
            timestamp: 1,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["reason"], "policy_not_found");
        assert_eq!(value["requestId"], "id");
        assert!(value["policyVersion"].is_null());
    }
}
