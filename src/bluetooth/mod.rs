//! BLE central: scanning, connections and GATT operations

pub mod adapter;
pub mod advertisement;
pub mod btleplug_transport;
pub mod events;
pub mod identity;
pub mod manager;
pub mod registry;
pub mod topology;
pub mod transport;
pub mod uuid;

pub use adapter::{AdapterInfo, AdapterState};

pub use advertisement::{
    AddressType, AdvertisementData, AdvertisementKind, AdvertisementReport, PeripheralInfo,
};

pub use btleplug_transport::{list_adapters, BtleplugTransport};

pub use events::{
    receiver_to_stream, BleEvent, DiscoveredCharacteristic, EventBroker, EventFilter, EventType,
    SubscriberId,
};

pub use identity::{format_address, format_device_id, parse_device_id};

pub use manager::{BleManager, ManagerConfig};

pub use transport::{
    CharProperties, CharacteristicHandle, ClientConfiguration, DescriptorHandle, GattTransport,
    LinkHandle, RemoteCharacteristic, RemoteDescriptor, RemoteService, ServiceHandle,
    TransportError, TransportEvent, ValueStream, WriteKind,
};

pub use self::uuid::{canonicalize_uuid, uuid_to_string, UuidParseError};
