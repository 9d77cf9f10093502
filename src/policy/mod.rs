pub mod cache;
pub mod source;
pub mod syncer;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use cache::PolicyCache;
pub use source::{FilePolicySource, HttpPolicySource, PolicySource};
pub use syncer::PolicySyncer;

/// Enforcement parameters for one (tenant, resource) pair, as published by
/// the system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub tenant_id: String,

    pub resource_key: String,

    /// Token ceiling of the bucket
    pub capacity: u64,

    /// Tokens per second, kept at the precision it was published with
    pub refill_rate: Decimal,

    /// Missing means disabled
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Policy {
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(&self.tenant_id, &self.resource_key)
    }
}

/// Identity of a policy and of the buckets enforcing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub tenant_id: String,
    pub resource_key: String,
}

impl PolicyKey {
    pub fn new(tenant_id: &str, resource_key: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            resource_key: resource_key.to_string(),
        }
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.tenant_id, self.resource_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn deserializes_camel_case_with_exact_rate() {
        let json = r#"{
            "tenantId": "tenant_001",
            "resourceKey": "/api/v1/orders",
            "capacity": 1000,
            "refillRate": "0.0001",
            "enabled": true,
            "version": "v3",
            "id": 7,
            "policyType": "TOKEN_BUCKET"
        }"#;

        let policy: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.tenant_id, "tenant_001");
        assert_eq!(policy.capacity, 1000);
        assert_eq!(policy.refill_rate, Decimal::from_str("0.0001").unwrap());
        assert_eq!(policy.refill_rate.to_string(), "0.0001");
        assert!(policy.enabled);
        assert_eq!(policy.id, Some(7));
    }

    #[test]
    fn missing_enabled_flag_means_disabled() {
        let json = r#"{"tenantId":"t","resourceKey":"r","capacity":5,"refillRate":"1"}"#;
        let policy: Policy = serde_json::from_str(json).unwrap();
        assert!(!policy.enabled);
        assert_eq!(policy.version, "");
    }

    #[test]
    fn key_display_joins_tenant_and_resource() {
        assert_eq!(PolicyKey::new("t1", "/a").to_string(), "t1|/a");
    }
}
