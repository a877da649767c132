//! Per-connection GATT topology cache and lookup chaining
//!
//! A [`TopologyCache`] is owned by the connection it was built on and is
//! dropped with it, so handles from one link can never be served on the
//! next. [`Resolver`] walks service, characteristic and descriptor lookups,
//! hitting the transport only for entries the cache does not hold yet.

use std::collections::HashMap;

use log::debug;
use uuid::Uuid;

use crate::bluetooth::transport::{
    CharProperties, CharacteristicHandle, DescriptorHandle, GattTransport, LinkHandle,
    RemoteCharacteristic, RemoteDescriptor, RemoteService, ServiceHandle,
};
use crate::bluetooth::uuid::uuid_to_string;
use crate::error::{AttributeKind, GattError};

#[derive(Debug, Clone)]
pub struct CharacteristicEntry {
    pub handle: CharacteristicHandle,
    pub properties: CharProperties,
    descriptors: HashMap<Uuid, DescriptorHandle>,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub handle: ServiceHandle,
    characteristics: HashMap<Uuid, CharacteristicEntry>,
}

/// Handles discovered on one connection, keyed by UUID path
#[derive(Debug, Clone, Default)]
pub struct TopologyCache {
    services: HashMap<Uuid, ServiceEntry>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self, service: &Uuid) -> Option<ServiceHandle> {
        self.services.get(service).map(|entry| entry.handle)
    }

    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<RemoteCharacteristic> {
        self.services
            .get(service)?
            .characteristics
            .get(characteristic)
            .map(|entry| RemoteCharacteristic {
                uuid: *characteristic,
                handle: entry.handle,
                properties: entry.properties,
            })
    }

    pub fn descriptor(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        descriptor: &Uuid,
    ) -> Option<DescriptorHandle> {
        self.services
            .get(service)?
            .characteristics
            .get(characteristic)?
            .descriptors
            .get(descriptor)
            .copied()
    }

    /// Cache a service. Re-inserting the same handle keeps what was
    /// already learned below it.
    pub fn insert_service(&mut self, service: RemoteService) {
        match self.services.get_mut(&service.uuid) {
            Some(entry) if entry.handle == service.handle => {}
            _ => {
                self.services.insert(
                    service.uuid,
                    ServiceEntry { handle: service.handle, characteristics: HashMap::new() },
                );
            }
        }
    }

    /// Cache a characteristic under an already cached service
    ///
    /// Returns false when the service is not cached.
    pub fn insert_characteristic(&mut self, service: &Uuid, characteristic: RemoteCharacteristic) -> bool {
        let Some(entry) = self.services.get_mut(service) else {
            return false;
        };
        match entry.characteristics.get_mut(&characteristic.uuid) {
            Some(existing) if existing.handle == characteristic.handle => {
                existing.properties = characteristic.properties;
            }
            _ => {
                entry.characteristics.insert(
                    characteristic.uuid,
                    CharacteristicEntry {
                        handle: characteristic.handle,
                        properties: characteristic.properties,
                        descriptors: HashMap::new(),
                    },
                );
            }
        }
        true
    }

    /// Cache a descriptor under an already cached characteristic
    ///
    /// Returns false when the characteristic is not cached.
    pub fn insert_descriptor(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        descriptor: RemoteDescriptor,
    ) -> bool {
        match self
            .services
            .get_mut(service)
            .and_then(|entry| entry.characteristics.get_mut(characteristic))
        {
            Some(entry) => {
                entry.descriptors.insert(descriptor.uuid, descriptor.handle);
                true
            }
            None => false,
        }
    }

    /// Number of cached services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Total number of cached entries at every level
    pub fn entry_count(&self) -> usize {
        self.services
            .values()
            .map(|service| {
                1 + service
                    .characteristics
                    .values()
                    .map(|characteristic| 1 + characteristic.descriptors.len())
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Access to the cache of the connection an operation was started on
///
/// Implementations fail with [`GattError::NotConnected`] once that
/// connection is gone, which keeps late completions from writing into a
/// newer connection's cache.
pub trait CacheAccess {
    fn with_cache<R>(&self, f: impl FnOnce(&mut TopologyCache) -> R) -> Result<R, GattError>;
}

/// Resolves UUID paths to handles for one link
pub struct Resolver<'a, C> {
    transport: &'a dyn GattTransport,
    link: LinkHandle,
    cache: &'a C,
}

impl<'a, C: CacheAccess> Resolver<'a, C> {
    pub fn new(transport: &'a dyn GattTransport, link: LinkHandle, cache: &'a C) -> Self {
        Self { transport, link, cache }
    }

    pub async fn service(&self, service: &Uuid) -> Result<ServiceHandle, GattError> {
        if let Some(handle) = self.cache.with_cache(|cache| cache.service(service))? {
            return Ok(handle);
        }

        debug!("Querying service {} on {}", uuid_to_string(service), self.link);
        let found = self
            .transport
            .services(self.link, Some(*service))
            .await?
            .ok_or_else(|| GattError::EmptyResult("get service".to_string()))?
            .into_iter()
            .find(|remote| remote.uuid == *service)
            .ok_or_else(|| GattError::not_found(AttributeKind::Service, uuid_to_string(service)))?;

        self.cache.with_cache(|cache| cache.insert_service(found))?;
        Ok(found.handle)
    }

    pub async fn characteristic(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<RemoteCharacteristic, GattError> {
        if let Some(found) = self
            .cache
            .with_cache(|cache| cache.characteristic(service, characteristic))?
        {
            return Ok(found);
        }

        let service_handle = self.service(service).await?;

        debug!(
            "Querying characteristic {} of {} on {}",
            uuid_to_string(characteristic),
            uuid_to_string(service),
            self.link
        );
        let found = self
            .transport
            .characteristics(self.link, service_handle, Some(*characteristic))
            .await?
            .ok_or_else(|| GattError::EmptyResult("get characteristic".to_string()))?
            .into_iter()
            .find(|remote| remote.uuid == *characteristic)
            .ok_or_else(|| {
                GattError::not_found(AttributeKind::Characteristic, uuid_to_string(characteristic))
            })?;

        self.cache.with_cache(|cache| {
            cache.insert_service(RemoteService { uuid: *service, handle: service_handle });
            cache.insert_characteristic(service, found);
        })?;
        Ok(found)
    }

    pub async fn descriptor(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        descriptor: &Uuid,
    ) -> Result<DescriptorHandle, GattError> {
        if let Some(handle) = self
            .cache
            .with_cache(|cache| cache.descriptor(service, characteristic, descriptor))?
        {
            return Ok(handle);
        }

        let parent = self.characteristic(service, characteristic).await?;

        debug!(
            "Querying descriptor {} of {} on {}",
            uuid_to_string(descriptor),
            uuid_to_string(characteristic),
            self.link
        );
        let found = self
            .transport
            .descriptors(self.link, parent.handle, Some(*descriptor))
            .await?
            .ok_or_else(|| GattError::EmptyResult("get descriptor".to_string()))?
            .into_iter()
            .find(|remote| remote.uuid == *descriptor)
            .ok_or_else(|| GattError::not_found(AttributeKind::Descriptor, uuid_to_string(descriptor)))?;

        self.cache.with_cache(|cache| {
            cache.insert_characteristic(service, parent);
            cache.insert_descriptor(service, characteristic, found);
        })?;
        Ok(found.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::transport::{MockGattTransport, TransportError};
    use crate::bluetooth::uuid::from_short_id;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const LINK: LinkHandle = LinkHandle(1);

    struct TestCache(Mutex<Option<TopologyCache>>);

    impl TestCache {
        fn connected() -> Self {
            Self(Mutex::new(Some(TopologyCache::new())))
        }

        fn disconnect(&self) {
            *self.0.lock().unwrap() = None;
        }

        fn entries(&self) -> usize {
            self.0.lock().unwrap().as_ref().map_or(0, |cache| cache.entry_count())
        }
    }

    impl CacheAccess for TestCache {
        fn with_cache<R>(&self, f: impl FnOnce(&mut TopologyCache) -> R) -> Result<R, GattError> {
            match self.0.lock().unwrap().as_mut() {
                Some(cache) => Ok(f(cache)),
                None => Err(GattError::NotConnected("test".to_string())),
            }
        }
    }

    fn battery_service() -> RemoteService {
        RemoteService { uuid: from_short_id(0x180f), handle: ServiceHandle(10) }
    }

    fn battery_level() -> RemoteCharacteristic {
        RemoteCharacteristic {
            uuid: from_short_id(0x2a19),
            handle: CharacteristicHandle(11),
            properties: CharProperties::READ | CharProperties::NOTIFY,
        }
    }

    fn cccd() -> RemoteDescriptor {
        RemoteDescriptor { uuid: from_short_id(0x2902), handle: DescriptorHandle(12) }
    }

    #[tokio::test]
    async fn test_repeat_resolution_hits_cache() {
        let mut transport = MockGattTransport::new();
        transport
            .expect_services()
            .times(1)
            .returning(|_, _| Ok(Some(vec![battery_service()])));
        transport
            .expect_characteristics()
            .times(1)
            .returning(|_, _, _| Ok(Some(vec![battery_level()])));
        transport
            .expect_descriptors()
            .times(1)
            .returning(|_, _, _| Ok(Some(vec![cccd()])));

        let cache = TestCache::connected();
        let resolver = Resolver::new(&transport, LINK, &cache);
        let (svc, chr, dsc) = (from_short_id(0x180f), from_short_id(0x2a19), from_short_id(0x2902));

        for _ in 0..3 {
            assert_eq!(resolver.descriptor(&svc, &chr, &dsc).await, Ok(DescriptorHandle(12)));
        }
        assert_eq!(resolver.characteristic(&svc, &chr).await, Ok(battery_level()));
        assert_eq!(resolver.service(&svc).await, Ok(ServiceHandle(10)));
        assert_eq!(cache.entries(), 3);
    }

    #[tokio::test]
    async fn test_chain_short_circuits_on_missing_service() {
        let mut transport = MockGattTransport::new();
        transport.expect_services().times(1).returning(|_, _| Ok(Some(vec![])));
        transport.expect_characteristics().never();
        transport.expect_descriptors().never();

        let cache = TestCache::connected();
        let resolver = Resolver::new(&transport, LINK, &cache);
        let result = resolver
            .descriptor(&from_short_id(0x180f), &from_short_id(0x2a19), &from_short_id(0x2902))
            .await;

        assert_eq!(result, Err(GattError::not_found(AttributeKind::Service, "180f")));
        assert_eq!(cache.entries(), 0);
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let mut transport = MockGattTransport::new();
        transport.expect_services().times(1).returning(|_, _| Ok(None));

        let cache = TestCache::connected();
        let resolver = Resolver::new(&transport, LINK, &cache);
        assert_eq!(
            resolver.service(&from_short_id(0x180f)).await,
            Err(GattError::EmptyResult("get service".to_string()))
        );

        let mut transport = MockGattTransport::new();
        transport
            .expect_services()
            .times(1)
            .returning(|_, _| Err(TransportError::failed("unreachable")));
        let resolver = Resolver::new(&transport, LINK, &cache);
        assert_eq!(
            resolver.service(&from_short_id(0x180f)).await,
            Err(GattError::Transport("unreachable".to_string()))
        );
    }

    #[tokio::test]
    async fn test_stale_connection_is_not_repopulated() {
        let mut transport = MockGattTransport::new();
        transport.expect_services().never();

        let cache = TestCache::connected();
        cache.disconnect();
        let resolver = Resolver::new(&transport, LINK, &cache);

        assert!(matches!(
            resolver.service(&from_short_id(0x180f)).await,
            Err(GattError::NotConnected(_))
        ));
        assert_eq!(cache.entries(), 0);
    }

    #[test]
    fn test_reinsert_same_service_keeps_children() {
        let mut cache = TopologyCache::new();
        let svc = battery_service();
        cache.insert_service(svc);
        assert!(cache.insert_characteristic(&svc.uuid, battery_level()));
        cache.insert_service(svc);
        assert!(cache.characteristic(&svc.uuid, &battery_level().uuid).is_some());

        // A different handle for the same UUID replaces the subtree
        cache.insert_service(RemoteService { uuid: svc.uuid, handle: ServiceHandle(99) });
        assert!(cache.characteristic(&svc.uuid, &battery_level().uuid).is_none());
        assert_eq!(cache.service(&svc.uuid), Some(ServiceHandle(99)));
    }

    #[test]
    fn test_insert_under_missing_parent() {
        let mut cache = TopologyCache::new();
        assert!(!cache.insert_characteristic(&from_short_id(0x180f), battery_level()));
        assert!(!cache.insert_descriptor(&from_short_id(0x180f), &from_short_id(0x2a19), cccd()));
        assert!(cache.is_empty());
    }
}
