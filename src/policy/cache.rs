//! Read-mostly policy snapshot shared by every check.
//!
//! A sync builds a complete new snapshot and swaps it in with a single
//! pointer store; readers keep whatever `Arc` they loaded and never observe
//! a half-built mapping.

use crate::config::validator::validate_policy;
use crate::policy::{Policy, PolicyKey};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable view of the enforcement rules at one point in time.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    active: HashMap<PolicyKey, Arc<Policy>>,
    disabled: HashSet<PolicyKey>,
}

impl PolicySnapshot {
    /// Build a snapshot from the full published list. Disabled entries are
    /// remembered but never enforced; entries that fail validation are dropped.
    pub fn build(policies: Vec<Policy>) -> Self {
        let mut active = HashMap::with_capacity(policies.len());
        let mut disabled = HashSet::new();

        for policy in policies {
            if let Err(e) = validate_policy(&policy) {
                warn!(
                    tenant_id = %policy.tenant_id,
                    resource_key = %policy.resource_key,
                    "Skipping invalid policy: {}",
                    e
                );
                continue;
            }

            let key = policy.key();
            if !policy.enabled {
                active.remove(&key);
                disabled.insert(key);
                continue;
            }

            debug!(
                "Cached policy: tenant={}, resource={}, capacity={}, refill_rate={}",
                policy.tenant_id, policy.resource_key, policy.capacity, policy.refill_rate
            );
            disabled.remove(&key);
            if active.insert(key.clone(), Arc::new(policy)).is_some() {
                warn!("Duplicate policy for {}; keeping the last one", key);
            }
        }

        Self { active, disabled }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

pub struct PolicyCache {
    snapshot: ArcSwap<PolicySnapshot>,
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PolicySnapshot::default()),
        }
    }

    /// Enabled policy for the pair, if any.
    pub fn find_policy(&self, tenant_id: &str, resource_key: &str) -> Option<Arc<Policy>> {
        let key = PolicyKey::new(tenant_id, resource_key);
        self.snapshot.load().active.get(&key).cloned()
    }

    /// Whether the pair exists in the system of record but is switched off.
    pub fn is_disabled(&self, tenant_id: &str, resource_key: &str) -> bool {
        let key = PolicyKey::new(tenant_id, resource_key);
        self.snapshot.load().disabled.contains(&key)
    }

    /// Replace the whole snapshot. Returns the number of enforceable policies.
    pub fn update_policies(&self, policies: Vec<Policy>) -> usize {
        info!("Updating policy cache with {} policies", policies.len());

        let snapshot = PolicySnapshot::build(policies);
        let active = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));
        crate::metrics::update_policy_cache_size(active);

        info!("Policy cache updated, active policies: {}", active);
        active
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}
