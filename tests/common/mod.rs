//! Scripted transport and manager harness shared by the integration tests
//!
//! `FakeTransport` serves a fixed GATT database, counts every call and can
//! hold connects or reads until a test releases them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use gatt_central::bluetooth::uuid::from_short_id;
use gatt_central::bluetooth::{
    format_device_id, AddressType, AdvertisementData, AdvertisementKind, AdvertisementReport,
    BleEvent, BleManager, CharProperties, CharacteristicHandle, ClientConfiguration,
    DescriptorHandle, GattTransport, LinkHandle, ManagerConfig, RemoteCharacteristic,
    RemoteDescriptor, RemoteService, ServiceHandle, TransportError, TransportEvent, ValueStream,
    WriteKind,
};

pub const ADDRESS: u64 = 0x0a1b_2c3d_4e5f;
pub const OTHER_ADDRESS: u64 = 0x1122_3344_5566;
pub const RSSI: i16 = -48;

/// Battery level, readable and notifying
pub const BATTERY_LEVEL: CharacteristicHandle = CharacteristicHandle(20);
/// Temperature measurement, indicating
pub const TEMPERATURE: CharacteristicHandle = CharacteristicHandle(30);

/// How long a test waits for an expected event
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-method call counters
#[derive(Debug, Default)]
pub struct Calls {
    pub start_scan: AtomicUsize,
    pub stop_scan: AtomicUsize,
    pub connect: AtomicUsize,
    pub disconnect: AtomicUsize,
    pub services: AtomicUsize,
    pub characteristics: AtomicUsize,
    pub descriptors: AtomicUsize,
    pub read: AtomicUsize,
    pub write: AtomicUsize,
    pub client_configuration: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Scripted reply replacing what the database would answer
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The call fails with this error
    Fail(TransportError),
    /// The call succeeds without a payload
    Empty,
}

impl Outcome {
    fn reply<T>(self) -> Result<Option<T>, TransportError> {
        match self {
            Outcome::Fail(err) => Err(err),
            Outcome::Empty => Ok(None),
        }
    }
}

struct Characteristic {
    remote: RemoteCharacteristic,
    descriptors: Vec<RemoteDescriptor>,
}

struct Service {
    remote: RemoteService,
    characteristics: Vec<Characteristic>,
}

/// Transport double serving
///
/// - `1800` with `2a00` (read)
/// - `180f` with `2a19` (read, notify) and its CCCD `2902`
/// - `1809` with `2a1c` (notify, indicate), including `1800`
pub struct FakeTransport {
    pub calls: Calls,
    database: Vec<Service>,
    next_link: AtomicU64,
    fail_connect: bool,
    failing_scan_starts: AtomicUsize,
    fail_disable: AtomicBool,
    services_outcome: Mutex<Option<Outcome>>,
    read_outcome: Mutex<Option<Outcome>>,
    connect_gate: Option<Arc<Notify>>,
    read_gate: Mutex<Option<Arc<Notify>>>,
    read_started: Notify,
    client_configurations: Mutex<Vec<(CharacteristicHandle, ClientConfiguration)>>,
    writes: Mutex<Vec<(CharacteristicHandle, Vec<u8>, WriteKind)>>,
    descriptor_values: Mutex<HashMap<DescriptorHandle, Vec<u8>>>,
    pushers: Mutex<HashMap<CharacteristicHandle, UnboundedSender<Vec<u8>>>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        let characteristic = |uuid: u16, handle, properties, descriptors| Characteristic {
            remote: RemoteCharacteristic { uuid: from_short_id(uuid), handle, properties },
            descriptors,
        };
        let database = vec![
            Service {
                remote: RemoteService { uuid: from_short_id(0x1800), handle: ServiceHandle(1) },
                characteristics: vec![characteristic(
                    0x2a00,
                    CharacteristicHandle(10),
                    CharProperties::READ | CharProperties::WRITE,
                    vec![],
                )],
            },
            Service {
                remote: RemoteService { uuid: from_short_id(0x180f), handle: ServiceHandle(2) },
                characteristics: vec![characteristic(
                    0x2a19,
                    BATTERY_LEVEL,
                    CharProperties::READ | CharProperties::NOTIFY,
                    vec![RemoteDescriptor { uuid: from_short_id(0x2902), handle: DescriptorHandle(200) }],
                )],
            },
            Service {
                remote: RemoteService { uuid: from_short_id(0x1809), handle: ServiceHandle(3) },
                characteristics: vec![characteristic(
                    0x2a1c,
                    TEMPERATURE,
                    CharProperties::NOTIFY | CharProperties::INDICATE,
                    vec![],
                )],
            },
        ];

        let mut descriptor_values = HashMap::new();
        descriptor_values.insert(DescriptorHandle(200), vec![0x00, 0x00]);

        Self {
            calls: Calls::default(),
            database,
            next_link: AtomicU64::new(0),
            fail_connect: false,
            failing_scan_starts: AtomicUsize::new(0),
            fail_disable: AtomicBool::new(false),
            services_outcome: Mutex::new(None),
            read_outcome: Mutex::new(None),
            connect_gate: None,
            read_gate: Mutex::new(None),
            read_started: Notify::new(),
            client_configurations: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            descriptor_values: Mutex::new(descriptor_values),
            pushers: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeTransport {
    /// Every connect fails
    pub fn failing_connect() -> Self {
        Self { fail_connect: true, ..Self::default() }
    }

    /// Connects wait until the returned gate is notified
    pub fn gated_connect() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (Self { connect_gate: Some(gate.clone()), ..Self::default() }, gate)
    }

    /// The next `count` scan starts fail
    pub fn fail_scan_starts(&self, count: usize) {
        self.failing_scan_starts.store(count, Ordering::SeqCst);
    }

    /// Writing the `None` client configuration fails while set
    pub fn fail_disable(&self, fail: bool) {
        self.fail_disable.store(fail, Ordering::SeqCst);
    }

    /// Service discovery answers with `outcome` from now on
    pub fn script_services(&self, outcome: Outcome) {
        *self.services_outcome.lock().unwrap() = Some(outcome);
    }

    /// Characteristic reads answer with `outcome` from now on
    pub fn script_reads(&self, outcome: Outcome) {
        *self.read_outcome.lock().unwrap() = Some(outcome);
    }

    /// Reads issued from now on wait until the returned gate is notified
    pub fn hold_reads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.read_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Resolves once a characteristic read reached the transport
    pub async fn read_started(&self) {
        self.read_started.notified().await;
    }

    /// Most recently opened link
    pub fn last_link(&self) -> LinkHandle {
        LinkHandle(self.next_link.load(Ordering::SeqCst))
    }

    pub fn client_configurations(&self) -> Vec<(CharacteristicHandle, ClientConfiguration)> {
        self.client_configurations.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(CharacteristicHandle, Vec<u8>, WriteKind)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn descriptor_value(&self, handle: DescriptorHandle) -> Option<Vec<u8>> {
        self.descriptor_values.lock().unwrap().get(&handle).cloned()
    }

    /// Push a value to the subscriber of `characteristic`; false if nobody listens
    pub fn push(&self, characteristic: CharacteristicHandle, value: Vec<u8>) -> bool {
        match self.pushers.lock().unwrap().get(&characteristic) {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    fn characteristic(&self, handle: CharacteristicHandle) -> Option<&Characteristic> {
        self.database
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.remote.handle == handle)
    }

    fn has_descriptor(&self, handle: DescriptorHandle) -> bool {
        self.database
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .flat_map(|characteristic| characteristic.descriptors.iter())
            .any(|descriptor| descriptor.handle == handle)
    }
}

fn wanted(filter: Option<Uuid>, uuid: &Uuid) -> bool {
    filter.map_or(true, |filter| filter == *uuid)
}

#[async_trait]
impl GattTransport for FakeTransport {
    async fn start_scan(&self, _services: Vec<Uuid>) -> Result<(), TransportError> {
        self.calls.start_scan.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_scan_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::failed("adapter busy"));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.calls.stop_scan.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, _address: u64) -> Result<Option<LinkHandle>, TransportError> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.connect_gate {
            gate.notified().await;
        }
        if self.fail_connect {
            return Err(TransportError::failed("page timeout"));
        }
        Ok(Some(LinkHandle(self.next_link.fetch_add(1, Ordering::SeqCst) + 1)))
    }

    async fn disconnect(&self, _link: LinkHandle) -> Result<(), TransportError> {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn services(
        &self,
        _link: LinkHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteService>>, TransportError> {
        self.calls.services.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.services_outcome.lock().unwrap().clone() {
            return outcome.reply();
        }
        Ok(Some(
            self.database
                .iter()
                .map(|service| service.remote)
                .filter(|service| wanted(uuid, &service.uuid))
                .collect(),
        ))
    }

    async fn included_services(
        &self,
        _link: LinkHandle,
        service: ServiceHandle,
    ) -> Result<Option<Vec<RemoteService>>, TransportError> {
        // The health thermometer service includes the generic access service
        let included = match service {
            ServiceHandle(3) => vec![self.database[0].remote],
            _ => Vec::new(),
        };
        Ok(Some(included))
    }

    async fn characteristics(
        &self,
        _link: LinkHandle,
        service: ServiceHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteCharacteristic>>, TransportError> {
        self.calls.characteristics.fetch_add(1, Ordering::SeqCst);
        Ok(self.database.iter().find(|s| s.remote.handle == service).map(|service| {
            service
                .characteristics
                .iter()
                .map(|characteristic| characteristic.remote)
                .filter(|characteristic| wanted(uuid, &characteristic.uuid))
                .collect()
        }))
    }

    async fn descriptors(
        &self,
        _link: LinkHandle,
        characteristic: CharacteristicHandle,
        uuid: Option<Uuid>,
    ) -> Result<Option<Vec<RemoteDescriptor>>, TransportError> {
        self.calls.descriptors.fetch_add(1, Ordering::SeqCst);
        Ok(self.characteristic(characteristic).map(|characteristic| {
            characteristic
                .descriptors
                .iter()
                .copied()
                .filter(|descriptor| wanted(uuid, &descriptor.uuid))
                .collect()
        }))
    }

    async fn read_characteristic(
        &self,
        _link: LinkHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.calls.read.fetch_add(1, Ordering::SeqCst);
        self.read_started.notify_one();
        let gate = self.read_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(outcome) = self.read_outcome.lock().unwrap().clone() {
            return outcome.reply();
        }
        match characteristic {
            BATTERY_LEVEL => Ok(Some(vec![87])),
            CharacteristicHandle(10) => Ok(Some(b"Thermometer".to_vec())),
            _ => Err(TransportError::Status { status: 2, protocol_error: Some(0x02) }),
        }
    }

    async fn write_characteristic(
        &self,
        _link: LinkHandle,
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        self.calls.write.fetch_add(1, Ordering::SeqCst);
        self.writes.lock().unwrap().push((characteristic, data, kind));
        Ok(())
    }

    async fn write_client_configuration(
        &self,
        _link: LinkHandle,
        characteristic: CharacteristicHandle,
        configuration: ClientConfiguration,
    ) -> Result<(), TransportError> {
        self.calls.client_configuration.fetch_add(1, Ordering::SeqCst);
        if configuration == ClientConfiguration::None && self.fail_disable.load(Ordering::SeqCst) {
            return Err(TransportError::failed("configuration write rejected"));
        }
        self.client_configurations
            .lock()
            .unwrap()
            .push((characteristic, configuration));
        Ok(())
    }

    async fn subscribe_values(
        &self,
        _link: LinkHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<ValueStream, TransportError> {
        let (tx, rx) = unbounded_channel();
        self.pushers.lock().unwrap().insert(characteristic, tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn read_descriptor(
        &self,
        _link: LinkHandle,
        descriptor: DescriptorHandle,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.descriptor_value(descriptor))
    }

    async fn write_descriptor(
        &self,
        _link: LinkHandle,
        descriptor: DescriptorHandle,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        if !self.has_descriptor(descriptor) {
            return Err(TransportError::failed("no such descriptor"));
        }
        self.descriptor_values.lock().unwrap().insert(descriptor, data);
        Ok(())
    }
}

/// Advertisement from `address` listing `services`
pub fn advertisement(address: u64, services: &[u16]) -> TransportEvent {
    TransportEvent::Advertisement(AdvertisementReport {
        address,
        address_type: AddressType::Public,
        rssi: RSSI,
        kind: AdvertisementKind::ConnectableUndirected,
        data: AdvertisementData {
            local_name: Some("Thermometer".to_string()),
            service_uuids: services.iter().copied().map(from_short_id).collect(),
            ..AdvertisementData::default()
        },
    })
}

/// Manager wired to a fake transport
pub struct Harness {
    pub manager: BleManager,
    pub events: UnboundedReceiver<BleEvent>,
    pub signals: UnboundedSender<TransportEvent>,
    pub transport: Arc<FakeTransport>,
    pub device_id: String,
}

impl Harness {
    pub fn new(transport: FakeTransport) -> Self {
        Self::with_config(transport, ManagerConfig::default())
    }

    pub fn with_config(transport: FakeTransport, config: ManagerConfig) -> Self {
        let transport = Arc::new(transport);
        let (signals, signal_rx) = unbounded_channel();
        let (manager, events) = BleManager::new(transport.clone(), signal_rx, config);
        Self { manager, events, signals, transport, device_id: format_device_id(ADDRESS) }
    }

    pub fn signal(&self, event: TransportEvent) {
        self.signals.send(event).unwrap();
    }

    /// Make the device known to the registry without a scan running
    pub async fn discover_device(&self) {
        self.signal(advertisement(ADDRESS, &[0x180f]));
        let manager = self.manager.clone();
        let id = self.device_id.clone();
        wait_until(move || manager.is_known(&id)).await;
    }

    /// Known and connected device
    pub async fn connected(transport: FakeTransport) -> Self {
        Self::connected_with_config(transport, ManagerConfig::default()).await
    }

    pub async fn connected_with_config(transport: FakeTransport, config: ManagerConfig) -> Self {
        let mut harness = Self::with_config(transport, config);
        harness.discover_device().await;
        harness.manager.connect(&harness.device_id).unwrap();
        let id = harness.device_id.clone();
        assert_eq!(
            harness.next_event().await,
            BleEvent::Connected { device_id: id, result: Ok(()) }
        );
        harness
    }

    pub async fn next_event(&mut self) -> BleEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    /// Assert that nothing is emitted for a little while
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), self.events.recv()).await {
            panic!("unexpected event: {:?}", event);
        }
    }
}

/// Poll `condition` until it holds
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
