//! Terminal events emitted by the manager and fan-out to subscribers

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use log::{debug, warn};
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::bluetooth::adapter::AdapterState;
use crate::bluetooth::advertisement::PeripheralInfo;
use crate::error::GattError;

/// Characteristic as reported by `characteristicsDiscovered`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Shortest string form of the UUID
    pub uuid: String,
    /// Property names, e.g. `["read", "notify"]`
    pub properties: Vec<&'static str>,
}

/// Type of BLE event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    RadioState,
    ScanState,
    Scan,
    Connected,
    Disconnected,
    Rssi,
    ServicesDiscovered,
    IncludedServicesDiscovered,
    CharacteristicsDiscovered,
    Read,
    Write,
    Notify,
    DescriptorsDiscovered,
    ReadValue,
    WriteValue,
}

impl EventType {
    /// Event name as delivered to the embedding caller
    pub fn name(&self) -> &'static str {
        match self {
            Self::RadioState => "radioState",
            Self::ScanState => "scanState",
            Self::Scan => "scan",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Rssi => "rssi",
            Self::ServicesDiscovered => "servicesDiscovered",
            Self::IncludedServicesDiscovered => "includedServicesDiscovered",
            Self::CharacteristicsDiscovered => "characteristicsDiscovered",
            Self::Read => "read",
            Self::Write => "write",
            Self::Notify => "notify",
            Self::DescriptorsDiscovered => "descriptorsDiscovered",
            Self::ReadValue => "readValue",
            Self::WriteValue => "writeValue",
        }
    }
}

/// Event emitted by the manager
///
/// Every accepted request ends in exactly one of these. Service,
/// characteristic and descriptor ids are the shortest string form of their
/// UUIDs, so callers can match them against what they asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    /// Radio power state changed
    RadioState(AdapterState),
    /// Scanning started (`Ok(true)`), stopped (`Ok(false)`) or failed to start
    ScanState(Result<bool, GattError>),
    /// Advertisement received
    Scan { device_id: String, rssi: i16, info: PeripheralInfo },
    Connected { device_id: String, result: Result<(), GattError> },
    Disconnected { device_id: String, result: Result<(), GattError> },
    Rssi { device_id: String, result: Result<i16, GattError> },
    ServicesDiscovered { device_id: String, result: Result<Vec<String>, GattError> },
    IncludedServicesDiscovered {
        device_id: String,
        service: String,
        result: Result<Vec<String>, GattError>,
    },
    CharacteristicsDiscovered {
        device_id: String,
        service: String,
        result: Result<Vec<DiscoveredCharacteristic>, GattError>,
    },
    /// Value read on request, or pushed by a subscription when `is_notification`
    Read {
        device_id: String,
        service: String,
        characteristic: String,
        result: Result<Vec<u8>, GattError>,
        is_notification: bool,
    },
    Write {
        device_id: String,
        service: String,
        characteristic: String,
        result: Result<(), GattError>,
    },
    /// Subscription state after the request
    Notify {
        device_id: String,
        service: String,
        characteristic: String,
        result: Result<bool, GattError>,
    },
    DescriptorsDiscovered {
        device_id: String,
        service: String,
        characteristic: String,
        result: Result<Vec<String>, GattError>,
    },
    ReadValue {
        device_id: String,
        service: String,
        characteristic: String,
        descriptor: String,
        result: Result<Vec<u8>, GattError>,
    },
    WriteValue {
        device_id: String,
        service: String,
        characteristic: String,
        descriptor: String,
        result: Result<(), GattError>,
    },
}

impl BleEvent {
    /// Get the type of this event
    pub fn get_type(&self) -> EventType {
        match self {
            Self::RadioState(_) => EventType::RadioState,
            Self::ScanState(_) => EventType::ScanState,
            Self::Scan { .. } => EventType::Scan,
            Self::Connected { .. } => EventType::Connected,
            Self::Disconnected { .. } => EventType::Disconnected,
            Self::Rssi { .. } => EventType::Rssi,
            Self::ServicesDiscovered { .. } => EventType::ServicesDiscovered,
            Self::IncludedServicesDiscovered { .. } => EventType::IncludedServicesDiscovered,
            Self::CharacteristicsDiscovered { .. } => EventType::CharacteristicsDiscovered,
            Self::Read { .. } => EventType::Read,
            Self::Write { .. } => EventType::Write,
            Self::Notify { .. } => EventType::Notify,
            Self::DescriptorsDiscovered { .. } => EventType::DescriptorsDiscovered,
            Self::ReadValue { .. } => EventType::ReadValue,
            Self::WriteValue { .. } => EventType::WriteValue,
        }
    }

    /// Event name, e.g. `servicesDiscovered`
    pub fn name(&self) -> &'static str {
        self.get_type().name()
    }

    /// Get the device id from this event, if it concerns one device
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::RadioState(_) | Self::ScanState(_) => None,
            Self::Scan { device_id, .. }
            | Self::Connected { device_id, .. }
            | Self::Disconnected { device_id, .. }
            | Self::Rssi { device_id, .. }
            | Self::ServicesDiscovered { device_id, .. }
            | Self::IncludedServicesDiscovered { device_id, .. }
            | Self::CharacteristicsDiscovered { device_id, .. }
            | Self::Read { device_id, .. }
            | Self::Write { device_id, .. }
            | Self::Notify { device_id, .. }
            | Self::DescriptorsDiscovered { device_id, .. }
            | Self::ReadValue { device_id, .. }
            | Self::WriteValue { device_id, .. } => Some(device_id),
        }
    }

    /// The failure carried by this event, if any
    pub fn error(&self) -> Option<&GattError> {
        match self {
            Self::ScanState(result) => result.as_ref().err(),
            Self::Connected { result, .. }
            | Self::Disconnected { result, .. }
            | Self::Write { result, .. }
            | Self::WriteValue { result, .. } => result.as_ref().err(),
            Self::Rssi { result, .. } => result.as_ref().err(),
            Self::ServicesDiscovered { result, .. }
            | Self::IncludedServicesDiscovered { result, .. }
            | Self::DescriptorsDiscovered { result, .. } => result.as_ref().err(),
            Self::CharacteristicsDiscovered { result, .. } => result.as_ref().err(),
            Self::Read { result, .. } | Self::ReadValue { result, .. } => result.as_ref().err(),
            Self::Notify { result, .. } => result.as_ref().err(),
            Self::RadioState(_) | Self::Scan { .. } => None,
        }
    }
}

impl fmt::Display for BleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(device_id) = self.device_id() {
            write!(f, "({})", device_id)?;
        }
        if let Some(err) = self.error() {
            write!(f, " failed: {}", err)?;
        }
        Ok(())
    }
}

/// Defines which events a subscriber is interested in
pub enum EventFilter {
    /// Accept all events
    All,
    /// Only specific event types
    EventTypes(Vec<EventType>),
    /// Only events for specific device ids
    Devices(Vec<String>),
    /// Custom filter function
    Custom(Box<dyn Fn(&BleEvent) -> bool + Send + Sync + 'static>),
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "EventFilter::All"),
            Self::EventTypes(types) => write!(f, "EventFilter::EventTypes({:?})", types),
            Self::Devices(ids) => write!(f, "EventFilter::Devices({:?})", ids),
            Self::Custom(_) => write!(f, "EventFilter::Custom(<function>)"),
        }
    }
}

impl EventFilter {
    pub fn all() -> Self {
        Self::All
    }

    pub fn event_types(types: Vec<EventType>) -> Self {
        Self::EventTypes(types)
    }

    pub fn devices(ids: Vec<String>) -> Self {
        Self::Devices(ids)
    }

    pub fn custom<F>(filter_fn: F) -> Self
    where
        F: Fn(&BleEvent) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Box::new(filter_fn))
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &BleEvent) -> bool {
        match self {
            Self::All => true,
            Self::EventTypes(types) => types.contains(&event.get_type()),
            Self::Devices(ids) => event
                .device_id()
                .map_or(false, |id| ids.iter().any(|wanted| wanted == id)),
            Self::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Subscriber ID type
pub type SubscriberId = u32;

struct Subscriber {
    id: SubscriberId,
    sender: Sender<BleEvent>,
    filter: EventFilter,
}

/// Distributes manager events to any number of filtered subscribers
///
/// Each subscriber gets a bounded channel. A subscriber that falls behind
/// loses events rather than stalling the others; one whose receiver was
/// dropped is removed.
pub struct EventBroker {
    next_subscriber_id: SubscriberId,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
    task: Option<JoinHandle<()>>,
}

impl EventBroker {
    /// Create a broker whose subscriber channels hold `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            next_subscriber_id: 1,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            task: None,
        }
    }

    /// Start distributing events read from `rx`
    ///
    /// Must be called from within a tokio runtime. Restarting replaces the
    /// previous source.
    pub fn start(&mut self, mut rx: UnboundedReceiver<BleEvent>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let subscribers = self.subscribers.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
                subscribers.retain(|subscriber| {
                    if !subscriber.filter.matches(&event) {
                        return !subscriber.sender.is_closed();
                    }
                    match subscriber.sender.try_send(event.clone()) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => {
                            warn!("Subscriber {} is lagging, dropped {}", subscriber.id, event);
                            true
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("Subscriber {} went away", subscriber.id);
                            false
                        }
                    }
                });
            }
            debug!("Event source closed, broker stopping");
        }));
    }

    /// Subscribe to events with a filter
    pub fn subscribe(&mut self, filter: EventFilter) -> (SubscriberId, Receiver<BleEvent>) {
        let (tx, rx) = channel(self.capacity);
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;

        self.lock_subscribers().push(Subscriber { id, sender: tx, filter });
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.lock_subscribers().retain(|s| s.id != id);
    }

    /// Replace a subscriber's filter; false if the id is unknown
    pub fn modify_filter(&mut self, id: SubscriberId, filter: EventFilter) -> bool {
        match self.lock_subscribers().iter_mut().find(|s| s.id == id) {
            Some(subscriber) => {
                subscriber.filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Stop distributing and close every subscriber channel
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.lock_subscribers().clear();
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Drop for EventBroker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A helper to create a Stream from an event receiver
pub fn receiver_to_stream(mut rx: Receiver<BleEvent>) -> impl Stream<Item = BleEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}
