//! The GATT central manager
//!
//! [`BleManager`] owns the device registry and turns every request into a
//! synchronous acknowledgment plus exactly one terminal [`BleEvent`].
//! Requests validate their preconditions on the calling thread, then run
//! their transport chain as a task on the runtime captured at construction.
//!
//! All shared state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. Work started against a connection remembers the
//! connection's epoch; once the device disconnects (or reconnects) that
//! work can no longer reach the cache or registry and its event reports
//! the device as not connected.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bluetooth::adapter::AdapterState;
use crate::bluetooth::advertisement::{AdvertisementReport, PeripheralInfo};
use crate::bluetooth::events::{BleEvent, DiscoveredCharacteristic};
use crate::bluetooth::registry::{
    ConnectionState, DeviceRegistry, SubscriptionHandle, SubscriptionKey,
};
use crate::bluetooth::topology::{CacheAccess, Resolver, TopologyCache};
use crate::bluetooth::transport::{
    CharProperties, ClientConfiguration, GattTransport, LinkHandle, TransportEvent, ValueStream,
    WriteKind,
};
use crate::bluetooth::uuid::{canonicalize_uuid, canonicalize_uuids, uuid_to_string};
use crate::error::{ErrorContext, GattError};
use crate::logging::PerformanceLogger;

/// Runtime settings of the manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Upper bound for one operation's transport chain; `None` waits forever
    pub operation_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct ScanSession {
    active: bool,
    /// Bumped by every scan request; a failed start only ends its own request
    generation: u64,
    allow_duplicates: bool,
    filter: Vec<Uuid>,
    /// Devices reported since the current scan started
    seen: HashSet<String>,
    /// Last queued scan transport call; the next one waits for it
    tail: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct State {
    registry: DeviceRegistry,
    scan: ScanSession,
    adapter_state: AdapterState,
    next_epoch: u64,
}

impl State {
    fn require_known(&self, device_id: &str) -> Result<(), GattError> {
        if self.registry.contains(device_id) {
            Ok(())
        } else {
            Err(GattError::DeviceNotFound(device_id.to_string()))
        }
    }

    /// Link and epoch of the device's current connection
    fn require_connected(&self, device_id: &str) -> Result<(LinkHandle, u64), GattError> {
        let record = self
            .registry
            .get(device_id)
            .ok_or_else(|| GattError::DeviceNotFound(device_id.to_string()))?;
        match &record.state {
            ConnectionState::Connected { link, epoch, .. } => Ok((*link, *epoch)),
            _ => Err(GattError::NotConnected(device_id.to_string())),
        }
    }
}

struct Inner {
    state: Mutex<State>,
    transport: Arc<dyn GattTransport>,
    events: UnboundedSender<BleEvent>,
    runtime: Handle,
    config: ManagerConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BleEvent) {
        match event.error() {
            Some(_) => warn!("{}", event),
            None => debug!("{}", event),
        }
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped, event discarded");
        }
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(report) => self.on_advertisement(report),
            TransportEvent::ScanStopped => self.on_scan_stopped(),
            TransportEvent::LinkLost { address, link } => self.on_link_lost(address, link),
            TransportEvent::Radio(state) => self.on_radio(state),
        }
    }

    fn on_advertisement(&self, report: AdvertisementReport) {
        let mut state = self.lock();
        let State { registry, scan, .. } = &mut *state;
        let (record, _) = registry.upsert_on_advertisement(&report);

        if !scan.active || !record.advertisement.advertises_any(&scan.filter) {
            return;
        }
        let first_sight = scan.seen.insert(record.id.clone());
        if first_sight || scan.allow_duplicates {
            let event = BleEvent::Scan {
                device_id: record.id.clone(),
                rssi: record.rssi,
                info: record.peripheral_info(),
            };
            self.emit(event);
        }
    }

    fn on_scan_stopped(&self) {
        let mut state = self.lock();
        if state.scan.active {
            state.scan.active = false;
            self.emit(BleEvent::ScanState(Ok(false)));
        } else {
            debug!("Scan stop signal while idle ignored");
        }
    }

    fn on_radio(&self, adapter_state: AdapterState) {
        let mut state = self.lock();
        if state.adapter_state != adapter_state {
            info!("Radio state {} -> {}", state.adapter_state, adapter_state);
            state.adapter_state = adapter_state;
            self.emit(BleEvent::RadioState(adapter_state));
        }
    }

    /// Link loss takes the same cleanup path as an explicit disconnect
    fn on_link_lost(&self, address: u64, lost: LinkHandle) {
        let mut state = self.lock();
        let Some(id) = state.registry.id_for_address(address) else {
            debug!("Link loss for unknown address ignored");
            return;
        };
        let current = match state.registry.get(&id).map(|record| &record.state) {
            Some(ConnectionState::Connected { link, .. }) => Some(*link),
            Some(ConnectionState::Disconnecting { link, .. }) => Some(*link),
            _ => None,
        };
        if current != Some(lost) {
            debug!("Stale link loss for {} ignored", id);
            return;
        }

        state.registry.mark_disconnected(&id);
        info!("Link to {} lost", id);
        self.emit(BleEvent::Disconnected { device_id: id, result: Ok(()) });
    }

    async fn bounded<T>(
        &self,
        chain: impl Future<Output = Result<T, GattError>>,
    ) -> Result<T, GattError> {
        match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, chain)
                .await
                .unwrap_or_else(|_| Err(GattError::Transport("timed out".to_string()))),
            None => chain.await,
        }
    }

    /// Settle a connect attempt. Attempts cancelled by a disconnect close
    /// their late link and stay silent; the disconnect already answered them.
    fn finish_connect(self: &Arc<Self>, device_id: &str, epoch: u64, result: Result<LinkHandle, GattError>) {
        let mut state = self.lock();
        let waiters = match state.registry.get(device_id).map(|record| &record.state) {
            Some(ConnectionState::Connecting { epoch: current, waiters }) if *current == epoch => *waiters,
            _ => {
                drop(state);
                if let Ok(link) = result {
                    debug!("Closing {} of cancelled connect to {}", link, device_id);
                    let transport = self.transport.clone();
                    self.runtime.spawn(async move {
                        if let Err(err) = transport.disconnect(link).await {
                            warn!("Failed to close {}: {}", link, err);
                        }
                    });
                }
                return;
            }
        };

        let result = match result {
            Ok(link) => {
                state.registry.mark_connected(device_id, link, epoch);
                info!("Connected to {} over {}", device_id, link);
                Ok(())
            }
            Err(err) => {
                if let Some(record) = state.registry.get_mut(device_id) {
                    record.state = ConnectionState::Unconnected;
                }
                Err(err)
            }
        };
        for _ in 0..waiters {
            self.emit(BleEvent::Connected { device_id: device_id.to_string(), result: result.clone() });
        }
    }
}

/// One in-flight operation bound to the connection it started on
#[derive(Clone)]
struct OpContext {
    inner: Arc<Inner>,
    device_id: String,
    link: LinkHandle,
    epoch: u64,
}

impl CacheAccess for OpContext {
    fn with_cache<R>(&self, f: impl FnOnce(&mut TopologyCache) -> R) -> Result<R, GattError> {
        let mut state = self.inner.lock();
        state
            .registry
            .get_mut(&self.device_id)
            .and_then(|record| record.connection_mut(self.epoch))
            .map(|(_, cache)| f(cache))
            .ok_or_else(|| GattError::NotConnected(self.device_id.clone()))
    }
}

impl OpContext {
    fn transport(&self) -> &dyn GattTransport {
        self.inner.transport.as_ref()
    }

    fn resolver(&self) -> Resolver<'_, Self> {
        Resolver::new(self.transport(), self.link, self)
    }

    fn ensure_current(&self) -> Result<(), GattError> {
        self.with_cache(|_| ())
    }

    /// Run `f` on the registry while the connection is still current
    fn with_registry<R>(&self, f: impl FnOnce(&mut DeviceRegistry) -> R) -> Result<R, GattError> {
        let mut state = self.inner.lock();
        let current = state
            .registry
            .get_mut(&self.device_id)
            .and_then(|record| record.connection_mut(self.epoch))
            .is_some();
        if current {
            Ok(f(&mut state.registry))
        } else {
            Err(GattError::NotConnected(self.device_id.clone()))
        }
    }

    /// Forward value pushes as `read` events until the stream ends or the
    /// returned task is aborted
    fn spawn_forwarder(&self, mut values: ValueStream, service: String, characteristic: String) -> JoinHandle<()> {
        let events = self.inner.events.clone();
        let device_id = self.device_id.clone();
        self.inner.runtime.spawn(async move {
            while let Some(value) = values.next().await {
                let event = BleEvent::Read {
                    device_id: device_id.clone(),
                    service: service.clone(),
                    characteristic: characteristic.clone(),
                    result: Ok(value),
                    is_notification: true,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("Value stream of {} {} ended", device_id, characteristic);
        })
    }
}

fn parse_uuid(input: &str) -> Result<Uuid, GattError> {
    canonicalize_uuid(input).map_err(GattError::from)
}

/// Shortest form of a UUID string, or the input as given when it does not parse
fn display_uuid(input: &str) -> String {
    canonicalize_uuid(input)
        .map(|uuid| uuid_to_string(&uuid))
        .unwrap_or_else(|_| input.to_string())
}

fn passes(filter: &[Uuid], uuid: &Uuid) -> bool {
    filter.is_empty() || filter.contains(uuid)
}

/// Asynchronous GATT central
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct BleManager {
    inner: Arc<Inner>,
}

impl BleManager {
    /// Create a manager over `transport`, consuming its signal channel
    ///
    /// Returns the manager and the receiver of every event it emits.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(
        transport: Arc<dyn GattTransport>,
        transport_events: UnboundedReceiver<TransportEvent>,
        config: ManagerConfig,
    ) -> (Self, UnboundedReceiver<BleEvent>) {
        let (events, event_rx) = unbounded_channel();
        let runtime = Handle::current();
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            transport,
            events,
            runtime: runtime.clone(),
            config,
        });

        runtime.spawn(Self::pump(Arc::downgrade(&inner), transport_events));
        (Self { inner }, event_rx)
    }

    async fn pump(inner: Weak<Inner>, mut transport_events: UnboundedReceiver<TransportEvent>) {
        while let Some(event) = transport_events.recv().await {
            let Some(manager) = inner.upgrade() else {
                break;
            };
            manager.handle_transport_event(event);
        }
        debug!("Transport event pump stopped");
    }

    /// Last radio state reported by the transport
    pub fn adapter_state(&self) -> AdapterState {
        self.inner.lock().adapter_state
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scan.active
    }

    /// Snapshot of one known device
    pub fn device(&self, device_id: &str) -> Option<PeripheralInfo> {
        self.inner.lock().registry.get(device_id).map(|record| record.peripheral_info())
    }

    /// Snapshot of every known device
    pub fn devices(&self) -> Vec<PeripheralInfo> {
        self.inner.lock().registry.records().map(|record| record.peripheral_info()).collect()
    }

    /// Connection state name of a known device
    pub fn connection_state(&self, device_id: &str) -> Option<&'static str> {
        self.inner.lock().registry.get(device_id).map(|record| record.state.name())
    }

    pub fn is_subscribed(&self, device_id: &str, service: &str, characteristic: &str) -> bool {
        match (canonicalize_uuid(service), canonicalize_uuid(characteristic)) {
            (Ok(service), Ok(characteristic)) => self
                .inner
                .lock()
                .registry
                .subscriptions
                .is_subscribed(&SubscriptionKey::new(device_id, service, characteristic)),
            _ => false,
        }
    }

    /// Number of topology entries cached for the device's current connection
    pub fn cached_entries(&self, device_id: &str) -> Option<usize> {
        match &self.inner.lock().registry.get(device_id)?.state {
            ConnectionState::Connected { cache, .. } => Some(cache.entry_count()),
            _ => None,
        }
    }

    fn reject<T>(
        &self,
        err: GattError,
        finish: impl FnOnce(Result<T, GattError>) -> BleEvent,
    ) -> Result<(), GattError> {
        self.inner.emit(finish(Err(err.clone())));
        Err(err)
    }

    /// Check that the device is connected and the arguments are valid
    fn validate<V>(
        &self,
        device_id: &str,
        args: Result<V, GattError>,
    ) -> Result<(OpContext, V), GattError> {
        let (link, epoch) = self.inner.lock().require_connected(device_id)?;
        let args = args?;
        let ctx = OpContext { inner: self.inner.clone(), device_id: device_id.to_string(), link, epoch };
        Ok((ctx, args))
    }

    fn spawn_chain<V, T, Fut>(
        &self,
        operation: &'static str,
        ctx: OpContext,
        args: V,
        finish: impl FnOnce(Result<T, GattError>) -> BleEvent + Send + 'static,
        chain: impl FnOnce(OpContext, V) -> Fut + Send + 'static,
    ) where
        V: Send + 'static,
        T: Send + 'static,
        Fut: Future<Output = Result<T, GattError>> + Send + 'static,
    {
        let log_ctx = ErrorContext::new("BleManager", operation).with_metadata("device", &ctx.device_id);
        debug!("{}dispatching on {}", log_ctx, ctx.link);

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let perf = PerformanceLogger::new("BleManager", operation);
            let result = inner
                .bounded(chain(ctx.clone(), args))
                .await
                .and_then(|value| ctx.ensure_current().map(|()| value));
            perf.finish();
            if let Err(err) = &result {
                debug!("{}chain failed: {}", log_ctx, err);
            }
            inner.emit(finish(result));
        });
    }

    fn dispatch<V, T, Fut>(
        &self,
        operation: &'static str,
        device_id: &str,
        args: Result<V, GattError>,
        finish: impl FnOnce(Result<T, GattError>) -> BleEvent + Send + 'static,
        chain: impl FnOnce(OpContext, V) -> Fut + Send + 'static,
    ) -> Result<(), GattError>
    where
        V: Send + 'static,
        T: Send + 'static,
        Fut: Future<Output = Result<T, GattError>> + Send + 'static,
    {
        match self.validate(device_id, args) {
            Ok((ctx, args)) => {
                self.spawn_chain(operation, ctx, args, finish, chain);
                Ok(())
            }
            Err(err) => self.reject(err, finish),
        }
    }

    /// Queue a scan transport call behind the previous one
    fn queue_scan_call(&self, state: &mut State, call: impl Future<Output = ()> + Send + 'static) {
        let previous = state.scan.tail.take();
        let task = self.inner.runtime.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            call.await;
        });
        state.scan.tail = Some(task);
    }

    /// Start scanning, or restart with a new filter while already scanning
    ///
    /// Emits `scanState(true)` once the transport has started, followed by
    /// `scan` events. Without `allow_duplicates` each device is reported
    /// once per scan.
    pub fn scan<S: AsRef<str>>(&self, service_uuids: &[S], allow_duplicates: bool) -> Result<(), GattError> {
        let filter = match canonicalize_uuids(service_uuids) {
            Ok(filter) => filter,
            Err(err) => return self.reject(err.into(), BleEvent::ScanState),
        };

        let mut state = self.inner.lock();
        state.scan.active = true;
        state.scan.generation += 1;
        let generation = state.scan.generation;
        state.scan.allow_duplicates = allow_duplicates;
        state.scan.filter = filter.clone();
        state.scan.seen.clear();
        debug!("Scan requested, {} service filters, duplicates {}", filter.len(), allow_duplicates);

        let inner = self.inner.clone();
        self.queue_scan_call(&mut state, async move {
            let result = inner.transport.start_scan(filter).await;
            match result {
                Ok(()) => inner.emit(BleEvent::ScanState(Ok(true))),
                Err(err) => {
                    {
                        let mut state = inner.lock();
                        if state.scan.generation == generation {
                            state.scan.active = false;
                        }
                    }
                    inner.emit(BleEvent::ScanState(Err(err.into())));
                }
            }
        });
        Ok(())
    }

    /// Stop scanning; idempotent
    pub fn stop_scan(&self) -> Result<(), GattError> {
        let mut state = self.inner.lock();
        if !state.scan.active {
            drop(state);
            self.inner.emit(BleEvent::ScanState(Ok(false)));
            return Ok(());
        }
        state.scan.active = false;

        let inner = self.inner.clone();
        self.queue_scan_call(&mut state, async move {
            if let Err(err) = inner.transport.stop_scan().await {
                warn!("Failed to stop scan: {}", err);
            }
            inner.emit(BleEvent::ScanState(Ok(false)));
        });
        Ok(())
    }

    /// Connect to a known device
    ///
    /// Connecting an already connected device answers immediately. Requests
    /// arriving while an attempt is running share that attempt.
    pub fn connect(&self, device_id: &str) -> Result<(), GattError> {
        let id = device_id.to_string();
        let finish = |result| BleEvent::Connected { device_id: id, result };

        let mut guard = self.inner.lock();
        let State { registry, next_epoch, .. } = &mut *guard;
        let Some(record) = registry.get_mut(device_id) else {
            drop(guard);
            return self.reject(GattError::DeviceNotFound(device_id.to_string()), finish);
        };

        let (address, epoch) = match &mut record.state {
            ConnectionState::Connected { .. } => {
                drop(guard);
                self.inner.emit(finish(Ok(())));
                return Ok(());
            }
            ConnectionState::Connecting { waiters, .. } => {
                *waiters += 1;
                debug!("Connect to {} already in progress, {} waiting", device_id, waiters);
                return Ok(());
            }
            ConnectionState::Disconnecting { .. } => {
                drop(guard);
                return self.reject(GattError::Transport("disconnect in progress".to_string()), finish);
            }
            ConnectionState::Unconnected => {
                *next_epoch += 1;
                record.state = ConnectionState::Connecting { epoch: *next_epoch, waiters: 1 };
                (record.address, *next_epoch)
            }
        };
        drop(guard);

        debug!("Connecting to {} (epoch {})", device_id, epoch);
        let inner = self.inner.clone();
        let id = device_id.to_string();
        self.inner.runtime.spawn(async move {
            let perf = PerformanceLogger::new("BleManager", "connect");
            let result = inner
                .bounded(async {
                    inner
                        .transport
                        .connect(address)
                        .await?
                        .ok_or_else(|| GattError::EmptyResult("connect".to_string()))
                })
                .await;
            perf.finish();
            inner.finish_connect(&id, epoch, result);
        });
        Ok(())
    }

    /// Disconnect a device, or cancel its running connect attempt
    ///
    /// The topology cache and every subscription of the device are released
    /// before the transport is asked to close the link.
    pub fn disconnect(&self, device_id: &str) -> Result<(), GattError> {
        let id = device_id.to_string();
        let finish = |result| BleEvent::Disconnected { device_id: id, result };

        let mut state = self.inner.lock();
        let Some(record) = state.registry.get_mut(device_id) else {
            drop(state);
            return self.reject(GattError::DeviceNotFound(device_id.to_string()), finish);
        };

        match record.state {
            ConnectionState::Connected { epoch, link, .. } => {
                state.registry.mark_disconnected(device_id);
                if let Some(record) = state.registry.get_mut(device_id) {
                    record.state = ConnectionState::Disconnecting { epoch, link };
                }
                drop(state);

                let inner = self.inner.clone();
                let id = device_id.to_string();
                self.inner.runtime.spawn(async move {
                    if let Err(err) = inner.transport.disconnect(link).await {
                        warn!("Closing {} of {} failed: {}", link, id, err);
                    }
                    let mut state = inner.lock();
                    let still_ours = matches!(
                        state.registry.get(&id).map(|record| &record.state),
                        Some(ConnectionState::Disconnecting { epoch: current, .. }) if *current == epoch
                    );
                    if still_ours {
                        state.registry.mark_disconnected(&id);
                        drop(state);
                        info!("Disconnected from {}", id);
                        inner.emit(BleEvent::Disconnected { device_id: id, result: Ok(()) });
                    }
                });
                Ok(())
            }
            ConnectionState::Connecting { waiters, .. } => {
                record.state = ConnectionState::Unconnected;
                drop(state);
                info!("Connect to {} cancelled", device_id);
                for _ in 0..waiters {
                    self.inner.emit(BleEvent::Connected {
                        device_id: device_id.to_string(),
                        result: Err(GattError::Transport("connect cancelled by disconnect".to_string())),
                    });
                }
                self.reject(GattError::NotConnected(device_id.to_string()), finish)
            }
            ConnectionState::Unconnected | ConnectionState::Disconnecting { .. } => {
                drop(state);
                self.reject(GattError::NotConnected(device_id.to_string()), finish)
            }
        }
    }

    /// Report the last advertised signal strength of a connected device
    pub fn update_rssi(&self, device_id: &str) -> Result<(), GattError> {
        let id = device_id.to_string();
        let finish = |result| BleEvent::Rssi { device_id: id, result };

        let state = self.inner.lock();
        let rssi = state
            .require_connected(device_id)
            .map(|_| state.registry.get(device_id).map_or(0, |record| record.rssi));
        drop(state);

        match rssi {
            Ok(rssi) => {
                self.inner.emit(finish(Ok(rssi)));
                Ok(())
            }
            Err(err) => self.reject(err, finish),
        }
    }

    /// Discover primary services, keeping those in `filter` (all when empty)
    pub fn discover_services<S: AsRef<str>>(&self, device_id: &str, filter: &[S]) -> Result<(), GattError> {
        let id = device_id.to_string();
        let args = canonicalize_uuids(filter).map_err(GattError::from);
        self.dispatch(
            "discover_services",
            device_id,
            args,
            |result| BleEvent::ServicesDiscovered { device_id: id, result },
            discover_services_chain,
        )
    }

    /// Discover the services included by `service`
    pub fn discover_included_services<S: AsRef<str>>(
        &self,
        device_id: &str,
        service: &str,
        filter: &[S],
    ) -> Result<(), GattError> {
        let (id, service_id) = (device_id.to_string(), display_uuid(service));
        let args = parse_uuid(service)
            .and_then(|service| Ok((service, canonicalize_uuids(filter)?)));
        self.dispatch(
            "discover_included_services",
            device_id,
            args,
            |result| BleEvent::IncludedServicesDiscovered { device_id: id, service: service_id, result },
            discover_included_services_chain,
        )
    }

    /// Discover the characteristics of `service` with their properties
    pub fn discover_characteristics<S: AsRef<str>>(
        &self,
        device_id: &str,
        service: &str,
        filter: &[S],
    ) -> Result<(), GattError> {
        let (id, service_id) = (device_id.to_string(), display_uuid(service));
        let args = parse_uuid(service)
            .and_then(|service| Ok((service, canonicalize_uuids(filter)?)));
        self.dispatch(
            "discover_characteristics",
            device_id,
            args,
            |result| BleEvent::CharacteristicsDiscovered { device_id: id, service: service_id, result },
            discover_characteristics_chain,
        )
    }

    /// Discover the descriptors of a characteristic
    pub fn discover_descriptors(&self, device_id: &str, service: &str, characteristic: &str) -> Result<(), GattError> {
        let (id, service_id, characteristic_id) =
            (device_id.to_string(), display_uuid(service), display_uuid(characteristic));
        let args = parse_uuid(service).and_then(|service| Ok((service, parse_uuid(characteristic)?)));
        self.dispatch(
            "discover_descriptors",
            device_id,
            args,
            |result| BleEvent::DescriptorsDiscovered {
                device_id: id,
                service: service_id,
                characteristic: characteristic_id,
                result,
            },
            discover_descriptors_chain,
        )
    }

    /// Read a characteristic value
    pub fn read(&self, device_id: &str, service: &str, characteristic: &str) -> Result<(), GattError> {
        let (id, service_id, characteristic_id) =
            (device_id.to_string(), display_uuid(service), display_uuid(characteristic));
        let args = parse_uuid(service).and_then(|service| Ok((service, parse_uuid(characteristic)?)));
        self.dispatch(
            "read",
            device_id,
            args,
            |result| BleEvent::Read {
                device_id: id,
                service: service_id,
                characteristic: characteristic_id,
                result,
                is_notification: false,
            },
            read_chain,
        )
    }

    /// Write a characteristic value
    pub fn write(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        data: Vec<u8>,
        without_response: bool,
    ) -> Result<(), GattError> {
        let (id, service_id, characteristic_id) =
            (device_id.to_string(), display_uuid(service), display_uuid(characteristic));
        let kind = if without_response { WriteKind::WithoutResponse } else { WriteKind::WithResponse };
        let args = parse_uuid(service)
            .and_then(|service| Ok((service, parse_uuid(characteristic)?, data, kind)));
        self.dispatch(
            "write",
            device_id,
            args,
            |result| BleEvent::Write {
                device_id: id,
                service: service_id,
                characteristic: characteristic_id,
                result,
            },
            write_chain,
        )
    }

    /// Enable or disable value pushes for a characteristic
    ///
    /// Indications are used when the characteristic supports them,
    /// notifications otherwise. Asking for the state already in place
    /// answers immediately without touching the transport.
    pub fn notify(&self, device_id: &str, service: &str, characteristic: &str, enable: bool) -> Result<(), GattError> {
        let (id, service_id, characteristic_id) =
            (device_id.to_string(), display_uuid(service), display_uuid(characteristic));
        let args = parse_uuid(service).and_then(|service| Ok((service, parse_uuid(characteristic)?)));
        let finish = |result| BleEvent::Notify {
            device_id: id,
            service: service_id,
            characteristic: characteristic_id,
            result,
        };

        let (ctx, (service, characteristic)) = match self.validate(device_id, args) {
            Ok(validated) => validated,
            Err(err) => return self.reject(err, finish),
        };

        let key = SubscriptionKey::new(device_id, service, characteristic);
        let subscribed = self.inner.lock().registry.subscriptions.is_subscribed(&key);
        if subscribed == enable {
            debug!("Subscription of {} already {}", device_id, if enable { "on" } else { "off" });
            self.inner.emit(finish(Ok(enable)));
            return Ok(());
        }

        self.spawn_chain("notify", ctx, (key, enable), finish, notify_chain);
        Ok(())
    }

    /// Read a descriptor value
    pub fn read_value(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        descriptor: &str,
    ) -> Result<(), GattError> {
        let (id, service_id, characteristic_id, descriptor_id) = (
            device_id.to_string(),
            display_uuid(service),
            display_uuid(characteristic),
            display_uuid(descriptor),
        );
        let args = parse_uuid(service)
            .and_then(|service| Ok((service, parse_uuid(characteristic)?, parse_uuid(descriptor)?)));
        self.dispatch(
            "read_value",
            device_id,
            args,
            |result| BleEvent::ReadValue {
                device_id: id,
                service: service_id,
                characteristic: characteristic_id,
                descriptor: descriptor_id,
                result,
            },
            read_value_chain,
        )
    }

    /// Write a descriptor value
    pub fn write_value(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        descriptor: &str,
        data: Vec<u8>,
    ) -> Result<(), GattError> {
        let (id, service_id, characteristic_id, descriptor_id) = (
            device_id.to_string(),
            display_uuid(service),
            display_uuid(characteristic),
            display_uuid(descriptor),
        );
        let args = parse_uuid(service).and_then(|service| {
            Ok((service, parse_uuid(characteristic)?, parse_uuid(descriptor)?, data))
        });
        self.dispatch(
            "write_value",
            device_id,
            args,
            |result| BleEvent::WriteValue {
                device_id: id,
                service: service_id,
                characteristic: characteristic_id,
                descriptor: descriptor_id,
                result,
            },
            write_value_chain,
        )
    }

    /// Whether the device id is in the registry
    pub fn is_known(&self, device_id: &str) -> bool {
        self.inner.lock().require_known(device_id).is_ok()
    }
}

async fn discover_services_chain(ctx: OpContext, filter: Vec<Uuid>) -> Result<Vec<String>, GattError> {
    let services = ctx
        .transport()
        .services(ctx.link, None)
        .await?
        .ok_or_else(|| GattError::EmptyResult("get services".to_string()))?;

    ctx.with_cache(|cache| services.iter().for_each(|service| cache.insert_service(*service)))?;
    Ok(services
        .iter()
        .filter(|service| passes(&filter, &service.uuid))
        .map(|service| uuid_to_string(&service.uuid))
        .collect())
}

async fn discover_included_services_chain(
    ctx: OpContext,
    (service, filter): (Uuid, Vec<Uuid>),
) -> Result<Vec<String>, GattError> {
    let handle = ctx.resolver().service(&service).await?;
    let included = ctx
        .transport()
        .included_services(ctx.link, handle)
        .await?
        .ok_or_else(|| GattError::EmptyResult("get included services".to_string()))?;

    Ok(included
        .iter()
        .filter(|included| passes(&filter, &included.uuid))
        .map(|included| uuid_to_string(&included.uuid))
        .collect())
}

async fn discover_characteristics_chain(
    ctx: OpContext,
    (service, filter): (Uuid, Vec<Uuid>),
) -> Result<Vec<DiscoveredCharacteristic>, GattError> {
    let handle = ctx.resolver().service(&service).await?;
    let characteristics = ctx
        .transport()
        .characteristics(ctx.link, handle, None)
        .await?
        .ok_or_else(|| GattError::EmptyResult("get characteristics".to_string()))?;

    ctx.with_cache(|cache| {
        for characteristic in &characteristics {
            cache.insert_characteristic(&service, *characteristic);
        }
    })?;
    Ok(characteristics
        .iter()
        .filter(|characteristic| passes(&filter, &characteristic.uuid))
        .map(|characteristic| DiscoveredCharacteristic {
            uuid: uuid_to_string(&characteristic.uuid),
            properties: characteristic.properties.names(),
        })
        .collect())
}

async fn discover_descriptors_chain(
    ctx: OpContext,
    (service, characteristic): (Uuid, Uuid),
) -> Result<Vec<String>, GattError> {
    let parent = ctx.resolver().characteristic(&service, &characteristic).await?;
    let descriptors = ctx
        .transport()
        .descriptors(ctx.link, parent.handle, None)
        .await?
        .ok_or_else(|| GattError::EmptyResult("get descriptors".to_string()))?;

    ctx.with_cache(|cache| {
        for descriptor in &descriptors {
            cache.insert_descriptor(&service, &characteristic, *descriptor);
        }
    })?;
    Ok(descriptors.iter().map(|descriptor| uuid_to_string(&descriptor.uuid)).collect())
}

async fn read_chain(ctx: OpContext, (service, characteristic): (Uuid, Uuid)) -> Result<Vec<u8>, GattError> {
    let remote = ctx.resolver().characteristic(&service, &characteristic).await?;
    ctx.transport()
        .read_characteristic(ctx.link, remote.handle)
        .await?
        .ok_or_else(|| GattError::EmptyResult("read".to_string()))
}

async fn write_chain(
    ctx: OpContext,
    (service, characteristic, data, kind): (Uuid, Uuid, Vec<u8>, WriteKind),
) -> Result<(), GattError> {
    let remote = ctx.resolver().characteristic(&service, &characteristic).await?;
    ctx.transport()
        .write_characteristic(ctx.link, remote.handle, data, kind)
        .await?;
    Ok(())
}

async fn notify_chain(ctx: OpContext, (key, enable): (SubscriptionKey, bool)) -> Result<bool, GattError> {
    let remote = ctx.resolver().characteristic(&key.service, &key.characteristic).await?;

    if enable {
        let values = ctx.transport().subscribe_values(ctx.link, remote.handle).await?;
        let mode = if remote.properties.contains(CharProperties::INDICATE) {
            ClientConfiguration::Indicate
        } else {
            ClientConfiguration::Notify
        };
        ctx.transport()
            .write_client_configuration(ctx.link, remote.handle, mode)
            .await?;

        let forwarder = ctx.spawn_forwarder(
            values,
            uuid_to_string(&key.service),
            uuid_to_string(&key.characteristic),
        );
        let handle = SubscriptionHandle::new(forwarder);
        ctx.with_registry(|registry| registry.subscriptions.subscribe(key, handle))?;
    } else {
        // The subscription stays registered until the remote has accepted the change
        ctx.transport()
            .write_client_configuration(ctx.link, remote.handle, ClientConfiguration::None)
            .await?;
        ctx.with_registry(|registry| registry.subscriptions.unsubscribe(&key))?;
    }
    Ok(enable)
}

async fn read_value_chain(
    ctx: OpContext,
    (service, characteristic, descriptor): (Uuid, Uuid, Uuid),
) -> Result<Vec<u8>, GattError> {
    let handle = ctx.resolver().descriptor(&service, &characteristic, &descriptor).await?;
    ctx.transport()
        .read_descriptor(ctx.link, handle)
        .await?
        .ok_or_else(|| GattError::EmptyResult("read descriptor".to_string()))
}

async fn write_value_chain(
    ctx: OpContext,
    (service, characteristic, descriptor, data): (Uuid, Uuid, Uuid, Vec<u8>),
) -> Result<(), GattError> {
    let handle = ctx.resolver().descriptor(&service, &characteristic, &descriptor).await?;
    ctx.transport().write_descriptor(ctx.link, handle, data).await?;
    Ok(())
}
