//! Parsed advertisement payloads and the peripheral info carried by scan events

use std::collections::HashMap;

use uuid::Uuid;

use crate::bluetooth::identity::{format_address, format_device_id};

/// Kind of advertising PDU a report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisementKind {
    /// ADV_IND
    ConnectableUndirected,
    /// ADV_DIRECT_IND
    ConnectableDirected,
    /// ADV_SCAN_IND
    ScannableUndirected,
    /// ADV_NONCONN_IND
    NonConnectableUndirected,
    /// SCAN_RSP
    ScanResponse,
}

impl AdvertisementKind {
    /// Whether the advertiser accepts connections, `None` for scan responses
    /// which carry no information about it
    pub fn connectable(&self) -> Option<bool> {
        match self {
            Self::ConnectableUndirected | Self::ConnectableDirected => Some(true),
            Self::ScannableUndirected | Self::NonConnectableUndirected => Some(false),
            Self::ScanResponse => None,
        }
    }
}

/// Bluetooth address type of an advertiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    Unknown,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Random => "random",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for AddressType {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Fields parsed out of an advertisement or scan response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// Complete or shortened local name
    pub local_name: Option<String>,
    /// Advertised TX power level in dBm
    pub tx_power_level: Option<i16>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    /// Replace this payload with `update`, keeping fields the update lacks
    pub fn merge(&mut self, update: AdvertisementData) {
        if update.local_name.is_some() {
            self.local_name = update.local_name;
        }
        if update.tx_power_level.is_some() {
            self.tx_power_level = update.tx_power_level;
        }
        if !update.manufacturer_data.is_empty() {
            self.manufacturer_data = update.manufacturer_data;
        }
        if !update.service_data.is_empty() {
            self.service_data = update.service_data;
        }
        if !update.service_uuids.is_empty() {
            self.service_uuids = update.service_uuids;
        }
    }

    /// Whether the payload advertises any of `filter` (an empty filter matches all)
    pub fn advertises_any(&self, filter: &[Uuid]) -> bool {
        filter.is_empty()
            || self
                .service_uuids
                .iter()
                .chain(self.service_data.keys())
                .any(|uuid| filter.contains(uuid))
    }
}

/// One advertisement as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementReport {
    /// Raw 48-bit address
    pub address: u64,
    pub address_type: AddressType,
    /// Signal strength in dBm
    pub rssi: i16,
    pub kind: AdvertisementKind,
    pub data: AdvertisementData,
}

/// Snapshot of a peripheral delivered with every `scan` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    /// Device identifier used as the registry key
    pub id: String,
    /// Display form of the address
    pub address: String,
    pub address_type: AddressType,
    pub connectable: bool,
    /// Signal strength in dBm
    pub rssi: i16,
    pub advertisement: AdvertisementData,
}

impl PeripheralInfo {
    /// Build the snapshot for a raw address
    pub fn new(
        raw: u64,
        address_type: AddressType,
        connectable: bool,
        rssi: i16,
        advertisement: AdvertisementData,
    ) -> Self {
        Self {
            id: format_device_id(raw),
            address: format_address(raw),
            address_type,
            connectable,
            rssi,
            advertisement,
        }
    }
}
