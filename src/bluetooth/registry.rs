//! Device and subscription registries
//!
//! Both are plain data structures; the manager keeps them behind a single
//! lock so that connection transitions and subscription cleanup are atomic
//! with respect to operation dispatch.

use std::collections::HashMap;

use log::debug;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bluetooth::advertisement::{
    AddressType, AdvertisementData, AdvertisementReport, PeripheralInfo,
};
use crate::bluetooth::identity::{format_address, format_device_id};
use crate::bluetooth::topology::TopologyCache;
use crate::bluetooth::transport::LinkHandle;

/// Connection lifecycle of one device
///
/// Every connect attempt gets a fresh epoch. Work started against a
/// connection carries its epoch and is stale once the state no longer
/// holds the same one.
#[derive(Debug)]
pub enum ConnectionState {
    Unconnected,
    Connecting {
        epoch: u64,
        /// Connect requests waiting on this attempt
        waiters: usize,
    },
    Connected {
        epoch: u64,
        link: LinkHandle,
        cache: TopologyCache,
    },
    /// Link closing on request, cache and subscriptions already released
    Disconnecting {
        epoch: u64,
        link: LinkHandle,
    },
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnecting { .. } => "disconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Everything known about one peripheral
#[derive(Debug)]
pub struct DeviceRecord {
    /// Registry key, never changes
    pub id: String,
    /// Raw 48-bit address
    pub address: u64,
    pub address_type: AddressType,
    pub connectable: bool,
    /// Last advertised signal strength in dBm
    pub rssi: i16,
    pub advertisement: AdvertisementData,
    pub state: ConnectionState,
}

impl DeviceRecord {
    fn from_report(report: &AdvertisementReport) -> Self {
        Self {
            id: format_device_id(report.address),
            address: report.address,
            address_type: report.address_type,
            connectable: report.kind.connectable().unwrap_or(false),
            rssi: report.rssi,
            advertisement: report.data.clone(),
            state: ConnectionState::Unconnected,
        }
    }

    pub fn peripheral_info(&self) -> PeripheralInfo {
        PeripheralInfo::new(
            self.address,
            self.address_type,
            self.connectable,
            self.rssi,
            self.advertisement.clone(),
        )
    }

    /// The link and cache of the connection with `epoch`, if it is still current
    pub fn connection_mut(&mut self, epoch: u64) -> Option<(LinkHandle, &mut TopologyCache)> {
        match &mut self.state {
            ConnectionState::Connected { epoch: current, link, cache } if *current == epoch => {
                Some((*link, cache))
            }
            _ => None,
        }
    }

    /// The current link, if connected
    pub fn link(&self) -> Option<LinkHandle> {
        match &self.state {
            ConnectionState::Connected { link, .. } => Some(*link),
            _ => None,
        }
    }
}

/// Address-keyed registry of every device seen during the process lifetime
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceRecord>,
    /// Active value subscriptions of connected devices
    pub subscriptions: SubscriptionRegistry,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record on first sight, otherwise refresh signal strength
    /// and advertisement data in place
    ///
    /// Returns the record and whether it was just created.
    pub fn upsert_on_advertisement(&mut self, report: &AdvertisementReport) -> (&DeviceRecord, bool) {
        let id = format_device_id(report.address);
        let mut is_new = false;
        let record = self.devices.entry(id).or_insert_with(|| {
            is_new = true;
            DeviceRecord::from_report(report)
        });

        if !is_new {
            record.rssi = report.rssi;
            if report.address_type != AddressType::Unknown {
                record.address_type = report.address_type;
            }
            if let Some(connectable) = report.kind.connectable() {
                record.connectable = connectable;
            }
            record.advertisement.merge(report.data.clone());
        } else {
            debug!("New device {} ({})", record.id, format_address(report.address));
        }

        (record, is_new)
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Find a device by raw address
    pub fn id_for_address(&self, address: u64) -> Option<String> {
        let id = format_device_id(address);
        self.devices.contains_key(&id).then_some(id)
    }

    /// Install a fresh connection with an empty topology cache
    ///
    /// Returns false for unknown devices.
    pub fn mark_connected(&mut self, id: &str, link: LinkHandle, epoch: u64) -> bool {
        match self.devices.get_mut(id) {
            Some(record) => {
                record.state = ConnectionState::Connected { epoch, link, cache: TopologyCache::new() };
                true
            }
            None => false,
        }
    }

    /// Clear the connection, drop its topology cache and release every
    /// subscription of the device
    ///
    /// Returns the link that was open, if any.
    pub fn mark_disconnected(&mut self, id: &str) -> Option<LinkHandle> {
        let record = self.devices.get_mut(id)?;
        let previous = std::mem::replace(&mut record.state, ConnectionState::Unconnected);
        let released = self.subscriptions.remove_device(id);
        if released > 0 {
            debug!("Released {} subscriptions of {}", released, id);
        }
        match previous {
            ConnectionState::Connected { link, .. } => Some(link),
            _ => None,
        }
    }
}

/// Identifies one characteristic value subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub device_id: String,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl SubscriptionKey {
    pub fn new(device_id: impl Into<String>, service: Uuid, characteristic: Uuid) -> Self {
        Self { device_id: device_id.into(), service, characteristic }
    }
}

/// Owns the task forwarding value pushes; dropping it stops forwarding
#[derive(Debug)]
pub struct SubscriptionHandle {
    forwarder: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(forwarder: JoinHandle<()>) -> Self {
        Self { forwarder }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// At most one subscription per key
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKey, SubscriptionHandle>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. When the key is already present the
    /// existing one is kept and `handle` is released.
    ///
    /// Returns whether `handle` was stored.
    pub fn subscribe(&mut self, key: SubscriptionKey, handle: SubscriptionHandle) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, handle);
        true
    }

    /// Remove and release a subscription. Absent keys are a no-op.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Release every subscription of a device
    pub fn remove_device(&mut self, device_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.device_id != device_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
