//! Identifier-keyed registry of live device handles.
//! Bridges discovery results to constructed devices, so callers' handles
//! survive a device changing its network address.

use crate::device::Device;
use crate::discovery::{DiscoveredDevice, Discovery};
use crate::error::Result;
use crate::klap::Credentials;
use crate::transport::Transport;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maps stable device identifiers to live [`Device`] instances.
///
/// The identifier survives reconnects and address changes; the endpoint does
/// not. `refresh()` keeps existing handles valid by updating their endpoint
/// in place instead of constructing duplicates. The map is the only state
/// mutated by concurrent refreshes and is guarded accordingly; individual
/// device calls never hold the map lock, so one slow device cannot stall
/// another's traffic.
pub struct Registry {
    credentials: Credentials,
    discovery: Discovery,
    devices: RwLock<HashMap<String, Device>>,
}

impl Registry {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            discovery: Discovery::new(),
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Use a customized discovery configuration (timeout, broadcast address).
    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = discovery;
        self
    }

    /// Run one discovery pass and merge the results into the registry.
    /// Returns the number of responders seen.
    pub async fn refresh(&self) -> Result<usize> {
        let found = self.discovery.discover().await?;
        let count = found.len();

        // Endpoint moves are applied after the map lock is released:
        // updating a transport waits on its session mutex, which may be held
        // by an in-flight call on that device.
        let mut moved: Vec<(Device, DiscoveredDevice)> = Vec::new();

        {
            let mut devices = self.devices.write().await;
            for entry in found {
                let id = entry.descriptor.device_id.clone();
                if let Some(existing) = devices.get(&id) {
                    existing.replace_descriptor(entry.descriptor.clone());
                    if existing.transport().endpoint() != entry.endpoint {
                        moved.push((existing.clone(), entry));
                    } else {
                        debug!("Device {} unchanged at {:?}", id, entry.endpoint);
                    }
                } else {
                    info!(
                        "Registering device {} ({}) at {:?}",
                        id, entry.descriptor.model, entry.endpoint
                    );
                    let transport = Arc::new(
                        Transport::new(entry.endpoint, self.credentials.clone())
                            .with_variant(entry.variant),
                    );
                    devices.insert(id, Device::new(transport, entry.descriptor));
                }
            }
        }

        for (device, entry) in moved {
            info!(
                "Device {} moved to {:?}, reconnecting on next use",
                device.id(),
                entry.endpoint
            );
            device.transport().set_endpoint(entry.endpoint).await;
        }

        Ok(count)
    }

    /// Get a device handle by its stable identifier.
    pub async fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    /// Snapshot of all known devices keyed by identifier.
    pub async fn devices(&self) -> HashMap<String, Device> {
        self.devices.read().await.clone()
    }

    /// Known device identifiers.
    pub async fn ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Drop a device handle from the registry.
    pub async fn remove(&self, id: &str) -> Option<Device> {
        self.devices.write().await.remove(id)
    }
}
