use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::core::catalog::value_as_u32;
use crate::core::client::ClusterApi;
use crate::errors::{ProvisionError, ProvisionResult};

/// How a fresh instance identifier is chosen.
///
/// The allocator is advisory only: it never reserves anything, and two
/// concurrent callers can be handed the same value. The create call at the
/// remote end is the only real arbiter of uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// One past the highest identifier in use, never below `floor + 1`.
    NextAfterMax { floor: u32 },
    /// Lowest unused identifier inside `start..=end`.
    FirstFree { start: u32, end: u32 },
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        AllocationPolicy::NextAfterMax { floor: 100 }
    }
}

impl AllocationPolicy {
    /// What an empty node gets.
    pub fn baseline(&self) -> u32 {
        match self {
            AllocationPolicy::NextAfterMax { floor } => floor + 1,
            AllocationPolicy::FirstFree { start, .. } => *start,
        }
    }

    pub fn next_id(&self, used: &BTreeSet<u32>) -> ProvisionResult<u32> {
        match *self {
            AllocationPolicy::NextAfterMax { floor } => {
                let highest = used.iter().next_back().copied().unwrap_or(floor).max(floor);
                highest
                    .checked_add(1)
                    .ok_or(ProvisionError::IdRangeExhausted { start: floor, end: u32::MAX })
            }
            AllocationPolicy::FirstFree { start, end } => (start..=end)
                .find(|id| !used.contains(id))
                .ok_or(ProvisionError::IdRangeExhausted { start, end }),
        }
    }
}

/// Pulls `vmid` out of every row of an instance listing. Rows without a
/// usable identifier are skipped; a payload that isn't a list yields nothing.
pub fn ids_from_listing(listing: &Value) -> BTreeSet<u32> {
    match listing.as_array() {
        Some(rows) => rows
            .iter()
            .filter_map(|row| row.get("vmid").and_then(value_as_u32))
            .collect(),
        None => {
            if !listing.is_null() {
                warn!("Instance listing has unexpected shape, treating as empty");
            }
            BTreeSet::new()
        }
    }
}

/// Every identifier in use on `node`. VMs and containers share one
/// identifier space, so both listings are merged.
pub async fn instance_ids(api: &dyn ClusterApi, node: &str) -> ProvisionResult<BTreeSet<u32>> {
    let mut ids = ids_from_listing(&api.list_vms(node).await?);
    ids.extend(ids_from_listing(&api.list_containers(node).await?));
    debug!(node, count = ids.len(), "Collected instance identifiers");
    Ok(ids)
}

pub struct IdAllocator<'a> {
    api: &'a dyn ClusterApi,
    policy: &'a AllocationPolicy,
}

impl<'a> IdAllocator<'a> {
    pub fn new(api: &'a dyn ClusterApi, policy: &'a AllocationPolicy) -> Self {
        Self { api, policy }
    }

    pub async fn allocate_id(&self, node: &str) -> ProvisionResult<u32> {
        let used = instance_ids(self.api, node).await?;
        let id = self.policy.next_id(&used)?;
        debug!(node, vmid = id, policy = ?self.policy, "Allocated identifier");
        Ok(id)
    }
}
