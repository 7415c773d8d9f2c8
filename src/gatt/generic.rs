//! The built-in Generic Attribute Profile service.
//!
//! Exposes the Service Changed characteristic and indicates affected handle
//! ranges to subscribed peers whenever services are registered or removed
//! (Vol 3, Part G, 7).

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use heapless::Vec;

use crate::att::{AttErrorCode, Handle, INVALID_HANDLE};
use crate::attribute::{
    AccessRequirements, GENERIC_ATTRIBUTE_SERVICE_UUID16, SERVICE_CHANGED_UUID16,
};
use crate::attribute_server::WriteKind;
use crate::config;
use crate::gatt::{
    Characteristic, CharacteristicProp, IdType, LocalServiceManager, Service, ServiceChangedEvent,
    ServiceHandler,
};
use crate::{Error, PeerId};

/// Sends an indication to one subscribed peer. Implemented by the host glue
/// that knows which attribute server belongs to which peer.
pub trait Indicator {
    type Error;

    /// Indicate `value` for `handle` to `peer` and wait for confirmation.
    async fn indicate(&self, peer: PeerId, handle: Handle, value: &[u8])
        -> Result<(), Self::Error>;
}

/// Hook persisting a peer's Service Changed subscription across reconnects.
pub type PersistHook = fn(peer: PeerId, notify: bool, indicate: bool);

const SERVICE_CHANGED_CHRC_ID: IdType = 0;

struct GasState {
    /// Value handle of the Service Changed characteristic, discovered when a
    /// peer first configures it.
    svc_changed_handle: Handle,
    subscribers: Vec<PeerId, { config::SERVICE_CHANGED_MAX_SUBSCRIBERS }>,
    persist: Option<PersistHook>,
}

/// The Generic Attribute service. Register exactly one per host.
pub struct GenericAttributeService<'a, 'd, M: RawMutex, const MAX: usize> {
    manager: &'a LocalServiceManager<'d, M, MAX>,
    service_id: IdType,
    state: BlockingMutex<M, RefCell<GasState>>,
}

impl<'a, 'd, M: RawMutex, const MAX: usize> GenericAttributeService<'a, 'd, M, MAX> {
    /// Register the service: primary, with a single Service Changed
    /// characteristic carrying the Indicate property and no readable or
    /// writable value. Subscribing requires no link security.
    pub async fn register(manager: &'a LocalServiceManager<'d, M, MAX>) -> Result<Self, Error> {
        let mut service = Service::new(true, GENERIC_ATTRIBUTE_SERVICE_UUID16);
        service.add_characteristic(Characteristic::new(
            SERVICE_CHANGED_CHRC_ID,
            SERVICE_CHANGED_UUID16,
            [CharacteristicProp::Indicate],
            0,
            AccessRequirements::disallowed(),
            AccessRequirements::disallowed(),
            AccessRequirements::allowed(),
        ))?;
        let service_id = manager.register_service(service).await?;

        Ok(Self {
            manager,
            service_id,
            state: BlockingMutex::new(RefCell::new(GasState {
                svc_changed_handle: INVALID_HANDLE,
                subscribers: Vec::new(),
                persist: None,
            })),
        })
    }

    pub fn service_id(&self) -> IdType {
        self.service_id
    }

    /// Install a hook invoked whenever a peer's subscription changes, so the
    /// application can store it for reconnects. Without one, a warning is
    /// logged on every change.
    pub fn set_persist_hook(&self, hook: PersistHook) {
        self.state.lock(|s| s.borrow_mut().persist = Some(hook));
    }

    /// Wrap an application handler so configuration changes reach this
    /// service. Pass the result to the attribute server.
    pub fn wrap<T: ServiceHandler>(&self, inner: T) -> GenericAttributeHandler<'_, 'a, 'd, M, T, MAX> {
        GenericAttributeHandler { gas: self, inner }
    }

    /// Track a peer's Service Changed subscription. Invoked (usually through
    /// [`wrap`](Self::wrap)) for every characteristic configuration change.
    pub fn on_characteristic_configured(
        &self,
        peer: PeerId,
        service_id: IdType,
        _chrc_id: IdType,
        notify: bool,
        indicate: bool,
    ) {
        if service_id != self.service_id {
            return;
        }
        let Some(cfg) =
            self.manager
                .get_characteristic_config(service_id, SERVICE_CHANGED_CHRC_ID, peer)
        else {
            debug!("[gatt] peer {} has not configured service changed", peer.0);
            return;
        };

        let persist = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.svc_changed_handle == INVALID_HANDLE {
                s.svc_changed_handle = cfg.handle;
            }
            if indicate {
                if !s.subscribers.contains(&peer) && s.subscribers.push(peer).is_err() {
                    warn!(
                        "[gatt] subscriber table full, dropping service changed subscription of {}",
                        peer.0
                    );
                }
                debug!("[gatt] service changed enabled for peer {}", peer.0);
            } else {
                s.subscribers.retain(|p| *p != peer);
                debug!("[gatt] service changed disabled for peer {}", peer.0);
            }
            s.persist
        });

        match persist {
            Some(hook) => hook(peer, notify, indicate),
            None => warn!("[gatt] no hook to persist service changed configuration of peer {}", peer.0),
        }
    }

    /// Drop a disconnecting peer's subscription.
    pub fn disconnect_client(&self, peer: PeerId) {
        self.state
            .lock(|s| s.borrow_mut().subscribers.retain(|p| *p != peer));
    }

    /// Consume the manager's reshape events and indicate the affected handle
    /// ranges to every subscribed peer. Never returns normally.
    pub async fn run<I: Indicator>(&self, indicator: &I) -> Result<(), Error> {
        let events = self.manager.service_changes();
        loop {
            let event = events.receive().await;
            self.handle_service_changed(indicator, event).await;
        }
    }

    async fn handle_service_changed<I: Indicator>(&self, indicator: &I, event: ServiceChangedEvent) {
        // Peers are not told about this service's own lifecycle.
        if event.service_id == self.service_id {
            return;
        }
        let (handle, subscribers) = self.state.lock(|s| {
            let s = s.borrow();
            (s.svc_changed_handle, s.subscribers.clone())
        });
        // Nobody has configured the characteristic yet.
        if handle == INVALID_HANDLE {
            return;
        }

        let mut value = [0u8; 4];
        value[..2].copy_from_slice(&event.start.to_le_bytes());
        value[2..].copy_from_slice(&event.end.to_le_bytes());
        for peer in subscribers {
            trace!(
                "[gatt] indicating peer {} of changed handles [{}, {}]",
                peer.0,
                event.start,
                event.end
            );
            if indicator.indicate(peer, handle, &value).await.is_err() {
                warn!("[gatt] service changed indication to peer {} failed", peer.0);
            }
        }
    }
}

/// A [`ServiceHandler`] wrapper feeding configuration changes to the generic
/// attribute service before the application sees them.
pub struct GenericAttributeHandler<'g, 'a, 'd, M: RawMutex, T: ServiceHandler, const MAX: usize> {
    gas: &'g GenericAttributeService<'a, 'd, M, MAX>,
    inner: T,
}

impl<'g, 'a, 'd, M: RawMutex, T: ServiceHandler, const MAX: usize> ServiceHandler
    for GenericAttributeHandler<'g, 'a, 'd, M, T, MAX>
{
    async fn read(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        self.inner.read(peer, service_id, id, offset, data).await
    }

    async fn write(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode> {
        self.inner.write(peer, service_id, id, offset, data, kind).await
    }

    fn characteristic_configured(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        chrc_id: IdType,
        notify: bool,
        indicate: bool,
    ) {
        self.gas
            .on_characteristic_configured(peer, service_id, chrc_id, notify, indicate);
        self.inner
            .characteristic_configured(peer, service_id, chrc_id, notify, indicate);
    }
}
