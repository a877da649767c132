//! [`GattTransport`] over the platform stack through `btleplug`

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    AddressType as BtAddressType, Central, CentralEvent, Characteristic, Descriptor,
    Manager as _, Peripheral as _, PeripheralProperties, ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{future, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bluetooth::adapter::{AdapterInfo, AdapterState};
use crate::bluetooth::advertisement::{
    AddressType, AdvertisementData, AdvertisementKind, AdvertisementReport,
};
use crate::bluetooth::identity::{address_from_bytes, format_address};
use crate::bluetooth::transport::{
    CharProperties, CharacteristicHandle, ClientConfiguration, DescriptorHandle, GattTransport,
    LinkHandle, RemoteCharacteristic, RemoteDescriptor, RemoteService, ServiceHandle,
    TransportError, TransportEvent, ValueStream, WriteKind,
};
use crate::error::ErrorContext;

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        TransportError::Failed(err.to_string())
    }
}

/// List the adapters of the platform
pub async fn list_adapters() -> Result<Vec<AdapterInfo>, TransportError> {
    let manager = Manager::new().await?;
    let mut infos = Vec::new();
    for (index, adapter) in manager.adapters().await?.into_iter().enumerate() {
        let name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| format!("adapter {}", index));
        infos.push(AdapterInfo { index, name, is_default: index == 0 });
    }
    Ok(infos)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AttributePath {
    Service(Uuid),
    Characteristic(Uuid, Uuid),
    Descriptor(Uuid, Uuid, Uuid),
}

/// Platform objects behind the opaque handles given to the manager
///
/// The same attribute on the same link always maps to the same handle.
#[derive(Default)]
struct Arena {
    next_id: u64,
    links: HashMap<LinkHandle, (u64, Peripheral)>,
    by_address: HashMap<u64, LinkHandle>,
    interned: HashMap<(LinkHandle, AttributePath), u64>,
    services: HashMap<ServiceHandle, (LinkHandle, Service)>,
    characteristics: HashMap<CharacteristicHandle, (LinkHandle, Characteristic)>,
    descriptors: HashMap<DescriptorHandle, (LinkHandle, Descriptor)>,
}

impl Arena {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn intern(&mut self, link: LinkHandle, path: AttributePath) -> u64 {
        if let Some(id) = self.interned.get(&(link, path.clone())) {
            return *id;
        }
        let id = self.allocate();
        self.interned.insert((link, path), id);
        id
    }

    fn open_link(&mut self, address: u64, peripheral: Peripheral) -> LinkHandle {
        let link = LinkHandle(self.allocate());
        self.links.insert(link, (address, peripheral));
        self.by_address.insert(address, link);
        link
    }

    /// Forget a link and every handle issued for it
    fn release_link(&mut self, link: LinkHandle) -> Option<Peripheral> {
        let (address, peripheral) = self.links.remove(&link)?;
        if self.by_address.get(&address) == Some(&link) {
            self.by_address.remove(&address);
        }
        self.interned.retain(|(owner, _), _| *owner != link);
        self.services.retain(|_, (owner, _)| *owner != link);
        self.characteristics.retain(|_, (owner, _)| *owner != link);
        self.descriptors.retain(|_, (owner, _)| *owner != link);
        Some(peripheral)
    }

    fn peripheral(&self, link: LinkHandle) -> Result<Peripheral, TransportError> {
        self.links
            .get(&link)
            .map(|(_, peripheral)| peripheral.clone())
            .ok_or_else(|| TransportError::failed(format!("{} is closed", link)))
    }

    fn service(&self, link: LinkHandle, handle: ServiceHandle) -> Result<Service, TransportError> {
        match self.services.get(&handle) {
            Some((owner, service)) if *owner == link => Ok(service.clone()),
            _ => Err(TransportError::failed(format!("{} is not valid on {}", handle, link))),
        }
    }

    fn characteristic(
        &self,
        link: LinkHandle,
        handle: CharacteristicHandle,
    ) -> Result<Characteristic, TransportError> {
        match self.characteristics.get(&handle) {
            Some((owner, characteristic)) if *owner == link => Ok(characteristic.clone()),
            _ => Err(TransportError::failed(format!("{} is not valid on {}", handle, link))),
        }
    }

    fn descriptor(&self, link: LinkHandle, handle: DescriptorHandle) -> Result<Descriptor, TransportError> {
        match self.descriptors.get(&handle) {
            Some((owner, descriptor)) if *owner == link => Ok(descriptor.clone()),
            _ => Err(TransportError::failed(format!("{} is not valid on {}", handle, link))),
        }
    }
}

/// Transport backed by the first `btleplug` adapter
pub struct BtleplugTransport {
    adapter: Adapter,
    arena: Arc<Mutex<Arena>>,
    pump: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the default adapter
    ///
    /// Returns the transport and the channel its signals arrive on.
    pub async fn new() -> Result<(Self, UnboundedReceiver<TransportEvent>), TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::failed("no Bluetooth adapters found"))?;
        Self::with_adapter(adapter).await
    }

    /// Wrap an adapter that was already selected
    pub async fn with_adapter(adapter: Adapter) -> Result<(Self, UnboundedReceiver<TransportEvent>), TransportError> {
        let (tx, rx) = unbounded_channel();
        let arena = Arc::new(Mutex::new(Arena::default()));

        let central_events = adapter.events().await?;
        // btleplug has no radio state notifications; an adapter that opened is on
        let _ = tx.send(TransportEvent::Radio(AdapterState::On));

        let pump = tokio::spawn(Self::pump(adapter.clone(), arena.clone(), central_events, tx));
        Ok((Self { adapter, arena, pump }, rx))
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pump(
        adapter: Adapter,
        arena: Arc<Mutex<Arena>>,
        mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        tx: UnboundedSender<TransportEvent>,
    ) {
        let ctx = ErrorContext::new("BtleplugTransport", "pump");
        while let Some(event) = central_events.next().await {
            let forwarded = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    match Self::advertisement(&adapter, &id).await {
                        Ok(Some(report)) => Some(TransportEvent::Advertisement(report)),
                        Ok(None) => None,
                        Err(err) => {
                            debug!("{}no properties for {:?}: {}", ctx, id, err);
                            None
                        }
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let address = match adapter.peripheral(&id).await {
                        Ok(peripheral) => address_from_bytes(peripheral.address().into_inner()),
                        Err(err) => {
                            warn!("{}disconnected peripheral {:?} vanished: {}", ctx, id, err);
                            continue;
                        }
                    };
                    let mut arena = arena.lock().unwrap_or_else(PoisonError::into_inner);
                    arena.by_address.get(&address).copied().map(|link| {
                        arena.release_link(link);
                        debug!("{}link {} to {} lost", ctx, link, format_address(address));
                        TransportEvent::LinkLost { address, link }
                    })
                }
                _ => None,
            };

            if let Some(event) = forwarded {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
        debug!("{}central event stream ended", ctx);
    }

    async fn advertisement(
        adapter: &Adapter,
        id: &PeripheralId,
    ) -> Result<Option<AdvertisementReport>, TransportError> {
        let peripheral = adapter.peripheral(id).await?;
        Ok(peripheral.properties().await?.and_then(Self::report_from_properties))
    }

    /// Properties without a signal strength were not produced by an advertisement
    fn report_from_properties(properties: PeripheralProperties) -> Option<AdvertisementReport> {
        let rssi = properties.rssi?;
        let address_type = match properties.address_type {
            Some(BtAddressType::Public) => AddressType::Public,
            Some(BtAddressType::Random) => AddressType::Random,
            None => AddressType::Unknown,
        };
        Some(AdvertisementReport {
            address: address_from_bytes(properties.address.into_inner()),
            address_type,
            rssi,
            // The PDU type is not exposed by btleplug
            kind: AdvertisementKind::ConnectableUndirected,
            data: AdvertisementData {
                local_name: properties.local_name,
                tx_power_level: properties.tx_power_level,
                manufacturer_data: properties.manufacturer_data,
                service_data: properties.service_data,
                service_uuids: properties.services,
            },
        })
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn start_scan(&self, services: Vec<Uuid>) -> Result<(), TransportError> {
        self.adapter.start_scan(ScanFilter { services }).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: u64) -> Result<Option<LinkHandle>, TransportError> {
        let ctx = ErrorContext::new("BtleplugTransport", "connect").with_metadata("address", format_address(address));
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| address_from_bytes(peripheral.address().into_inner()) == address);
        let Some(peripheral) = peripheral else {
            debug!("{}no peripheral with this address", ctx);
            return Ok(None);
        };

        peripheral.connect().await?;
        peripheral.discover_services().await?;
        let link = self.arena().open_link(address, peripheral);
        debug!("{}opened {}", ctx, link);
        Ok(Some(link))
    }

    async fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError> {
        let peripheral = self
            .arena()
            .release_link(link)
            .ok_or_else(|| TransportError::failed(format!("{} is closed", link)))?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn services(&self, link: LinkHandle, uuid: Option<Uuid>) -> Result<Option<Vec<RemoteService>>, TransportError> {
        let peripheral = self.arena().peripheral(link)?;
        let mut arena = self.arena();
        let services = peripheral
            .services()
            .into_iter()
            .filter(|service| service.primary && uuid.map_or(true, |wanted| service.uuid == wanted))
            .map(|service| {
                let handle = ServiceHandle(arena.intern(link, AttributePath::Service(service.uuid)));
                let remote = RemoteService { uuid: service.uuid, handle };
                arena.services.insert(handle, (link, service));
                remote
            })
            .collect();
        Ok(Some(services))
    }

    async fn included_services(
        &self,
        _link: LinkHandle,
        _service: ServiceHandle,
    ) -> Result<Option<Vec<RemoteService>>, TransportError> {
        Err(TransportError::failed("included services are not available through btleplug"))
    }

    async fn characteristics(
        &self,
        link: LinkHandle,
        service: ServiceHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteCharacteristic>>, TransportError> {
        let mut arena = self.arena();
        let service = arena.service(link, service)?;
        let characteristics = service
            .characteristics
            .into_iter()
            .filter(|characteristic| uuid.map_or(true, |wanted| characteristic.uuid == wanted))
            .map(|characteristic| {
                let path = AttributePath::Characteristic(service.uuid, characteristic.uuid);
                let handle = CharacteristicHandle(arena.intern(link, path));
                let remote = RemoteCharacteristic {
                    uuid: characteristic.uuid,
                    handle,
                    properties: CharProperties::from_bits_truncate(characteristic.properties.bits()),
                };
                arena.characteristics.insert(handle, (link, characteristic));
                remote
            })
            .collect();
        Ok(Some(characteristics))
    }

    async fn descriptors(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteDescriptor>>, TransportError> {
        let mut arena = self.arena();
        let characteristic = arena.characteristic(link, characteristic)?;
        let descriptors = characteristic
            .descriptors
            .into_iter()
            .filter(|descriptor| uuid.map_or(true, |wanted| descriptor.uuid == wanted))
            .map(|descriptor| {
                let path = AttributePath::Descriptor(
                    descriptor.service_uuid,
                    descriptor.characteristic_uuid,
                    descriptor.uuid,
                );
                let handle = DescriptorHandle(arena.intern(link, path));
                let remote = RemoteDescriptor { uuid: descriptor.uuid, handle };
                arena.descriptors.insert(handle, (link, descriptor));
                remote
            })
            .collect();
        Ok(Some(descriptors))
    }

    async fn read_characteristic(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let (peripheral, characteristic) = {
            let arena = self.arena();
            (arena.peripheral(link)?, arena.characteristic(link, characteristic)?)
        };
        Ok(Some(peripheral.read(&characteristic).await?))
    }

    async fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = {
            let arena = self.arena();
            (arena.peripheral(link)?, arena.characteristic(link, characteristic)?)
        };
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral.write(&characteristic, &data, write_type).await?;
        Ok(())
    }

    /// btleplug chooses between notify and indicate on its own
    async fn write_client_configuration(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
        configuration: ClientConfiguration,
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) = {
            let arena = self.arena();
            (arena.peripheral(link)?, arena.characteristic(link, characteristic)?)
        };
        match configuration {
            ClientConfiguration::Notify | ClientConfiguration::Indicate => {
                peripheral.subscribe(&characteristic).await?
            }
            ClientConfiguration::None => peripheral.unsubscribe(&characteristic).await?,
        }
        Ok(())
    }

    async fn subscribe_values(
        &self,
        link: LinkHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<ValueStream, TransportError> {
        let (peripheral, characteristic) = {
            let arena = self.arena();
            (arena.peripheral(link)?, arena.characteristic(link, characteristic)?)
        };
        let uuid = characteristic.uuid;
        let values = peripheral
            .notifications()
            .await?
            .filter(move |notification| future::ready(notification.uuid == uuid))
            .map(|notification| notification.value);
        Ok(values.boxed())
    }

    async fn read_descriptor(
        &self,
        link: LinkHandle,
        descriptor: DescriptorHandle,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let (peripheral, descriptor) = {
            let arena = self.arena();
            (arena.peripheral(link)?, arena.descriptor(link, descriptor)?)
        };
        Ok(Some(peripheral.read_descriptor(&descriptor).await?))
    }

    async fn write_descriptor(
        &self,
        link: LinkHandle,
        descriptor: DescriptorHandle,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        let (peripheral, descriptor) = {
            let arena = self.arena();
            (arena.peripheral(link)?, arena.descriptor(link, descriptor)?)
        };
        peripheral.write_descriptor(&descriptor, &data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::BDAddr;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_from_properties() {
        let properties = PeripheralProperties {
            address: BDAddr::from([0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]),
            address_type: Some(BtAddressType::Random),
            local_name: Some("Sensor".to_string()),
            rssi: Some(-61),
            ..Default::default()
        };

        let report = BtleplugTransport::report_from_properties(properties).unwrap();
        assert_eq!(report.address, 0x0a1b_2c3d_4e5f);
        assert_eq!(report.address_type, AddressType::Random);
        assert_eq!(report.rssi, -61);
        assert_eq!(report.data.local_name.as_deref(), Some("Sensor"));
    }

    #[test]
    fn test_properties_without_rssi_are_not_advertisements() {
        let properties = PeripheralProperties::default();
        assert!(BtleplugTransport::report_from_properties(properties).is_none());
    }

    #[test]
    fn test_attribute_paths_intern_per_link() {
        let mut arena = Arena::default();
        let path = AttributePath::Service(Uuid::nil());
        let first = arena.intern(LinkHandle(1), path.clone());
        assert_eq!(arena.intern(LinkHandle(1), path.clone()), first);
        assert_ne!(arena.intern(LinkHandle(2), path), first);
    }
}
