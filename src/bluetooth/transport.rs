//! Capability interface over the platform Bluetooth stack
//!
//! The manager never talks to a radio directly. Every GATT call goes through
//! [`GattTransport`] and every unsolicited signal (advertisements, link loss,
//! radio state) arrives as a [`TransportEvent`] on a channel handed to the
//! manager at construction.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use crate::bluetooth::adapter::AdapterState;
use crate::bluetooth::advertisement::AdvertisementReport;
use crate::error::GattError;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

opaque_handle!(
    /// An open connection to a peripheral
    LinkHandle
);
opaque_handle!(
    /// A service on a particular link
    ServiceHandle
);
opaque_handle!(
    /// A characteristic on a particular link
    CharacteristicHandle
);
opaque_handle!(
    /// A descriptor on a particular link
    DescriptorHandle
);

bitflags::bitflags! {
    /// Characteristic property bits as found in the characteristic declaration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharProperties {
    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "broadcast"),
        (Self::READ, "read"),
        (Self::WRITE_WITHOUT_RESPONSE, "writeWithoutResponse"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "authenticatedSignedWrites"),
        (Self::EXTENDED_PROPERTIES, "extendedProperties"),
    ];

    /// Property names in declaration bit order
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub handle: ServiceHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub uuid: Uuid,
    pub handle: DescriptorHandle,
}

/// How a characteristic value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Value written to the Client Characteristic Configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfiguration {
    None,
    Notify,
    Indicate,
}

/// Failure reported by a transport call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The call did not complete
    #[error("{0}")]
    Failed(String),

    /// The call completed with a non-success GATT status
    #[error("GATT status {status}, protocol error {protocol_error:?}")]
    Status { status: u8, protocol_error: Option<u8> },
}

impl TransportError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<TransportError> for GattError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Failed(message) => GattError::Transport(message),
            status @ TransportError::Status { .. } => GattError::Protocol(status.to_string()),
        }
    }
}

/// Unsolicited signal from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An advertisement or scan response was received
    Advertisement(AdvertisementReport),
    /// The platform stopped scanning on its own
    ScanStopped,
    /// A link was lost without being asked to disconnect
    LinkLost { address: u64, link: LinkHandle },
    /// The radio changed power state
    Radio(AdapterState),
}

/// Stream of characteristic value pushes
pub type ValueStream = BoxStream<'static, Vec<u8>>;

/// Asynchronous GATT client capability
///
/// Payload-bearing calls return `Ok(None)` when the call succeeded but
/// produced nothing. Handles are only valid together with the link that
/// produced them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Start watching for advertisements, optionally filtered by service
    async fn start_scan(&self, services: Vec<Uuid>) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, address: u64) -> Result<Option<LinkHandle>, TransportError>;

    async fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError>;

    /// Primary services, restricted to `uuid` when given
    async fn services(
        &self,
        link: LinkHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteService>>, TransportError>;

    async fn included_services(
        &self,
        link: LinkHandle,
        service: ServiceHandle,
    ) -> Result<Option<Vec<RemoteService>>, TransportError>;

    /// Characteristics of `service`, restricted to `uuid` when given
    async fn characteristics(
        &self,
        link: LinkHandle,
        service: ServiceHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteCharacteristic>>, TransportError>;

    /// Descriptors of `characteristic`, restricted to `uuid` when given
    async fn descriptors(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteDescriptor>>, TransportError>;

    async fn read_characteristic(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    async fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), TransportError>;

    /// Write the CCCD of `characteristic`
    async fn write_client_configuration(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        configuration: ClientConfiguration,
    ) -> Result<(), TransportError>;

    /// Value pushes for `characteristic`; ends when the link goes away
    async fn subscribe_values(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<ValueStream, TransportError>;

    async fn read_descriptor(
        &self,
        link: LinkHandle,
        descriptor: DescriptorHandle,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    async fn write_descriptor(
        &self,
        link: LinkHandle,
        descriptor: DescriptorHandle,
        data: Vec<u8>,
    ) -> Result<(), TransportError>;
}
