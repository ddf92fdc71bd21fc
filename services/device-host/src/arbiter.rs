//! Master/slave arbitration over named shared resources.
//!
//! The first claimant of a resource is its master and holds the write
//! lease; later claimants observe. Releasing the master promotes the next
//! claimant in the same call, so there is never a moment with zero or two
//! masters. There is no priority override.

use std::collections::HashMap;

use fleet_id::DeviceName;
use tracing::{debug, info};

/// Ordered claimant lists keyed by resource name.
#[derive(Debug, Default)]
pub struct ResourceArbiter {
    claims: HashMap<String, Vec<DeviceName>>,
}

impl ResourceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `claimant` to the resource's list. Idempotent. Returns true if
    /// the claimant is master afterwards.
    pub fn request(&mut self, claimant: &DeviceName, resource: &str) -> bool {
        let claimants = self.claims.entry(resource.to_string()).or_default();
        if !claimants.contains(claimant) {
            claimants.push(claimant.clone());
            debug!(%resource, claimant = %claimant, position = claimants.len() - 1, "Resource requested");
        }
        claimants.first() == Some(claimant)
    }

    /// Remove `claimant` from the resource. Returns the new master when the
    /// release promoted someone.
    pub fn release(&mut self, claimant: &DeviceName, resource: &str) -> Option<DeviceName> {
        let claimants = self.claims.get_mut(resource)?;
        let index = claimants.iter().position(|c| c == claimant)?;
        claimants.remove(index);

        let promoted = if index == 0 { claimants.first().cloned() } else { None };
        if let Some(master) = &promoted {
            info!(%resource, released = %claimant, master = %master, "Resource master promoted");
        }
        if claimants.is_empty() {
            self.claims.remove(resource);
        }
        promoted
    }

    /// Drop `claimant` from every resource. Returns `(resource, new master)`
    /// for each promotion.
    pub fn release_all(&mut self, claimant: &DeviceName) -> Vec<(String, DeviceName)> {
        let mut resources: Vec<String> = self
            .claims
            .iter()
            .filter(|(_, claimants)| claimants.contains(claimant))
            .map(|(resource, _)| resource.clone())
            .collect();
        resources.sort();

        resources
            .into_iter()
            .filter_map(|resource| {
                let promoted = self.release(claimant, &resource)?;
                Some((resource, promoted))
            })
            .collect()
    }

    pub fn is_master(&self, claimant: &DeviceName, resource: &str) -> bool {
        self.master_of(resource) == Some(claimant)
    }

    pub fn master_of(&self, resource: &str) -> Option<&DeviceName> {
        self.claims.get(resource).and_then(|c| c.first())
    }

    /// Claimants in order, master first.
    pub fn claimants(&self, resource: &str) -> &[DeviceName] {
        self.claims.get(resource).map(Vec::as_slice).unwrap_or(&[])
    }
}
