//! Policy Registry - one [`DestinationPolicy`] per destination id
//!
//! Policies are created lazily on first use. Insertion goes through the
//! `DashMap` entry API so racing workers always end up sharing one instance.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::policy::{CircuitState, DestinationPolicy, PolicyConfig, PolicySnapshot};
use crate::sender_metrics;

pub struct PolicyRegistry {
    policies: DashMap<String, Arc<DestinationPolicy>>,
    config: PolicyConfig,
    clock: Arc<dyn Clock>,
}

impl PolicyRegistry {
    pub fn new(config: PolicyConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PolicyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get the policy for a destination, creating it if absent
    pub fn get_or_create(&self, destination_id: &str) -> Arc<DestinationPolicy> {
        if let Some(policy) = self.policies.get(destination_id) {
            return Arc::clone(policy.value());
        }
        self.create_if_absent(destination_id)
    }

    /// Slow path of `get_or_create`; another worker may have inserted first
    fn create_if_absent(&self, destination_id: &str) -> Arc<DestinationPolicy> {
        let mut created = false;
        let policy = self
            .policies
            .entry(destination_id.to_string())
            .or_insert_with(|| {
                created = true;
                debug!(destination_id, "Creating destination policy");
                Arc::new(DestinationPolicy::new(
                    destination_id,
                    self.config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .value()
            .clone();

        if created {
            sender_metrics::set_policies_tracked(self.policies.len());
        }
        policy
    }

    pub fn get(&self, destination_id: &str) -> Option<Arc<DestinationPolicy>> {
        self.policies.get(destination_id).map(|p| Arc::clone(p.value()))
    }

    /// Stop tracking a destination. Returns whether a policy was removed.
    pub fn remove_if_present(&self, destination_id: &str) -> bool {
        let removed = self.policies.remove(destination_id).is_some();
        if removed {
            sender_metrics::set_policies_tracked(self.policies.len());
        }
        removed
    }

    /// Remove a policy only if `predicate` still holds for it.
    ///
    /// The predicate runs under the map's shard lock, so a policy touched
    /// between a scan and the removal can be spared.
    pub fn remove_if<F>(&self, destination_id: &str, predicate: F) -> bool
    where
        F: FnOnce(&DestinationPolicy) -> bool,
    {
        let removed = self
            .policies
            .remove_if(destination_id, |_, policy| predicate(policy.as_ref()))
            .is_some();
        if removed {
            sender_metrics::set_policies_tracked(self.policies.len());
        }
        removed
    }

    /// Snapshot of the currently tracked policies
    pub fn list_all(&self) -> Vec<Arc<DestinationPolicy>> {
        self.policies.iter().map(|p| Arc::clone(p.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Stats for every tracked destination
    pub fn stats(&self) -> HashMap<String, PolicySnapshot> {
        self.policies
            .iter()
            .map(|p| (p.key().clone(), p.value().snapshot()))
            .collect()
    }

    /// Number of destinations whose circuit is not closed
    pub fn open_count(&self) -> usize {
        self.policies
            .iter()
            .filter(|p| p.value().circuit_state() != CircuitState::Closed)
            .count()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}
