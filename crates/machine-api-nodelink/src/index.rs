//! In-memory Machine lookup by provider ID and InternalIP
//!
//! Rebuilt purely from the Machine watch stream, so a relist restores it.
//! When two Machines claim the same address or provider ID, the one
//! indexed first keeps it; the other takes over only once the first lets go.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;

use machine_api_common::crd::{Machine, INTERNAL_IP};

/// Machines indexed by provider ID and InternalIP
#[derive(Debug, Default)]
pub struct MachineIndex {
    machines: DashMap<String, Arc<Machine>>,
    by_address: DashMap<String, String>,
    by_provider_id: DashMap<String, String>,
}

impl MachineIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a Machine, replacing whatever was indexed for it before
    pub fn upsert(&self, machine: Machine) {
        let key = machine.key();
        let addresses = internal_ips(&machine);
        let provider_id = machine.provider_id().map(str::to_string);

        let previous = self.machines.insert(key.clone(), Arc::new(machine));
        if let Some(previous) = previous {
            let stale: Vec<String> = internal_ips(&previous)
                .into_iter()
                .filter(|a| !addresses.contains(a))
                .collect();
            self.release_addresses(&key, &stale);
            if let Some(old_id) = previous.provider_id() {
                if provider_id.as_deref() != Some(old_id) {
                    self.release_provider_id(&key, old_id);
                }
            }
        }

        for address in addresses {
            self.by_address.entry(address).or_insert_with(|| key.clone());
        }
        if let Some(id) = provider_id {
            self.by_provider_id.entry(id).or_insert_with(|| key.clone());
        }
    }

    /// Drop a Machine and every entry it owns
    pub fn remove(&self, machine: &Machine) {
        let key = machine.key();
        let Some((_, previous)) = self.machines.remove(&key) else {
            return;
        };
        let addresses: Vec<String> = internal_ips(&previous).into_iter().collect();
        self.release_addresses(&key, &addresses);
        if let Some(id) = previous.provider_id() {
            self.release_provider_id(&key, id);
        }
    }

    /// Machine whose `spec.providerID` equals `provider_id`
    pub fn by_provider_id(&self, provider_id: &str) -> Option<Arc<Machine>> {
        let key = self.by_provider_id.get(provider_id)?.value().clone();
        self.get(&key)
    }

    /// Machine reporting `address` as an InternalIP
    pub fn by_address(&self, address: &str) -> Option<Arc<Machine>> {
        let key = self.by_address.get(address)?.value().clone();
        self.get(&key)
    }

    /// Machine backing a Node
    ///
    /// A matching provider ID wins; otherwise the Node's InternalIPs are
    /// tried in the order the Node reports them.
    pub fn find_for_node(&self, node: &Node) -> Option<Arc<Machine>> {
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .filter(|id| !id.is_empty());
        if let Some(machine) = provider_id.and_then(|id| self.by_provider_id(id)) {
            return Some(machine);
        }
        node_internal_ips(node).find_map(|ip| self.by_address(ip))
    }

    /// Forget everything, ahead of a relist
    pub fn clear(&self) {
        self.machines.clear();
        self.by_address.clear();
        self.by_provider_id.clear();
    }

    /// Number of indexed Machines
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether no Machines are indexed
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    fn get(&self, key: &str) -> Option<Arc<Machine>> {
        self.machines.get(key).map(|m| m.value().clone())
    }

    fn release_addresses(&self, key: &str, addresses: &[String]) {
        for address in addresses {
            if self
                .by_address
                .remove_if(address, |_, owner| owner == key)
                .is_some()
            {
                if let Some(heir) = self.claimant(key, |m| internal_ips(m).contains(address)) {
                    self.by_address.insert(address.clone(), heir);
                }
            }
        }
    }

    fn release_provider_id(&self, key: &str, provider_id: &str) {
        if self
            .by_provider_id
            .remove_if(provider_id, |_, owner| owner == key)
            .is_some()
        {
            if let Some(heir) = self.claimant(key, |m| m.provider_id() == Some(provider_id)) {
                self.by_provider_id.insert(provider_id.to_string(), heir);
            }
        }
    }

    /// Another indexed Machine matching `claims`, if any
    fn claimant(&self, excluding: &str, claims: impl Fn(&Machine) -> bool) -> Option<String> {
        self.machines
            .iter()
            .find(|entry| entry.key() != excluding && claims(entry.value().as_ref()))
            .map(|entry| entry.key().clone())
    }
}

fn internal_ips(machine: &Machine) -> HashSet<String> {
    machine.internal_ips().map(str::to_string).collect()
}

fn node_internal_ips(node: &Node) -> impl Iterator<Item = &str> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or(&[])
        .iter()
        .filter(|a| a.type_ == INTERNAL_IP)
        .map(|a| a.address.as_str())
}
