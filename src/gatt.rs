//! GATT local services layered on the attribute database.
//!
//! A [`Service`] definition describes characteristics and descriptors; the
//! [`LocalServiceManager`] turns it into an attribute grouping, synthesizing
//! the declaration attributes and the client characteristic configuration
//! descriptor, and routes dynamic attribute I/O to the application's
//! [`ServiceHandler`].

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::{Channel, DynamicReceiver};
use heapless::Vec;

use crate::att::{AttErrorCode, Handle};
use crate::attribute::{
    AccessRequirements, CHARACTERISTIC_CCCD_UUID16, CHARACTERISTIC_EXT_PROPERTIES_UUID16,
    CHARACTERISTIC_SCCD_UUID16, CHARACTERISTIC_UUID16, PRIMARY_SERVICE_UUID16,
    SECONDARY_SERVICE_UUID16,
};
use crate::attribute_server::{AttrHandler, WriteKind};
use crate::config;
use crate::database::{AttributeDatabase, DatabaseInner};
use crate::types::uuid::Uuid;
use crate::{Error, PeerId};

pub mod access;
pub mod generic;

/// An identifier for a local service, characteristic or descriptor.
pub type IdType = u64;

/// Notification bit of a client characteristic configuration value.
pub const CCC_NOTIFICATION_BIT: u16 = 0x0001;

/// Indication bit of a client characteristic configuration value.
pub const CCC_INDICATION_BIT: u16 = 0x0002;

/// Characteristic properties (Vol 3, Part G, 3.3.1.1).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CharacteristicProp {
    /// Broadcast
    Broadcast = 0x01,
    /// Read
    Read = 0x02,
    /// Write without response
    WriteWithoutResponse = 0x04,
    /// Write
    Write = 0x08,
    /// Notify
    Notify = 0x10,
    /// Indicate
    Indicate = 0x20,
    /// Authenticated signed writes
    AuthenticatedWrite = 0x40,
    /// Extended properties
    Extended = 0x80,
}

/// Properties of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicProps(u8);

impl<'a> From<&'a [CharacteristicProp]> for CharacteristicProps {
    fn from(props: &'a [CharacteristicProp]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= *prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl<const T: usize> From<[CharacteristicProp; T]> for CharacteristicProps {
    fn from(props: [CharacteristicProp; T]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl CharacteristicProps {
    /// Check if any of the properties are set.
    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        for p in props {
            if (*p as u8) & self.0 != 0 {
                return true;
            }
        }
        false
    }

    /// The raw bitset as it appears in the characteristic declaration.
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Characteristic extended properties bitset (Vol 3, Part G, 3.3.3.1).
pub type ExtendedProperties = u16;

/// Extended property: reliable writes supported.
pub const EXTENDED_PROP_RELIABLE_WRITE: ExtendedProperties = 0x0001;

/// Extended property: writable auxiliaries.
pub const EXTENDED_PROP_WRITABLE_AUXILIARIES: ExtendedProperties = 0x0002;

/// A characteristic descriptor definition.
pub struct Descriptor {
    id: IdType,
    uuid: Uuid,
    read_reqs: AccessRequirements,
    write_reqs: AccessRequirements,
}

impl Descriptor {
    pub fn new(
        id: IdType,
        uuid: Uuid,
        read_reqs: AccessRequirements,
        write_reqs: AccessRequirements,
    ) -> Self {
        Self {
            id,
            uuid,
            read_reqs,
            write_reqs,
        }
    }

    pub fn id(&self) -> IdType {
        self.id
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

/// A characteristic definition.
pub struct Characteristic {
    id: IdType,
    uuid: Uuid,
    props: CharacteristicProps,
    ext_props: ExtendedProperties,
    read_reqs: AccessRequirements,
    write_reqs: AccessRequirements,
    update_reqs: AccessRequirements,
    descriptors: Vec<Descriptor, { config::GATT_MAX_DESCRIPTORS }>,
}

impl Characteristic {
    /// Define a characteristic. `update_reqs` is the security a peer needs
    /// on its link before it may subscribe to notifications or indications.
    pub fn new(
        id: IdType,
        uuid: Uuid,
        props: impl Into<CharacteristicProps>,
        ext_props: ExtendedProperties,
        read_reqs: AccessRequirements,
        write_reqs: AccessRequirements,
        update_reqs: AccessRequirements,
    ) -> Self {
        Self {
            id,
            uuid,
            props: props.into(),
            ext_props,
            read_reqs,
            write_reqs,
            update_reqs,
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor definition.
    pub fn add_descriptor(&mut self, descriptor: Descriptor) -> Result<(), Error> {
        self.descriptors
            .push(descriptor)
            .map_err(|_| Error::InsufficientSpace)
    }

    pub fn id(&self) -> IdType {
        self.id
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn props(&self) -> CharacteristicProps {
        self.props
    }
}

/// A service definition: the structure of a GATT service, not its state.
pub struct Service {
    primary: bool,
    uuid: Uuid,
    characteristics: Vec<Characteristic, { config::GATT_MAX_CHARACTERISTICS }>,
}

impl Service {
    pub fn new(primary: bool, uuid: Uuid) -> Self {
        Self {
            primary,
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Attach a characteristic definition.
    pub fn add_characteristic(&mut self, characteristic: Characteristic) -> Result<(), Error> {
        self.characteristics
            .push(characteristic)
            .map_err(|_| Error::InsufficientSpace)
    }

    pub fn primary(&self) -> bool {
        self.primary
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

/// The application-side delegate answering reads and writes of the dynamic
/// attributes of its registered services.
pub trait ServiceHandler {
    /// Read the value of the characteristic or descriptor with the given id.
    ///
    /// Return the number of bytes read into `data`.
    async fn read(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode>;

    /// Write the value of the characteristic or descriptor with the given
    /// id. Errors reported for a [`WriteKind::Command`] write are discarded.
    async fn write(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode>;

    /// A peer changed a client characteristic configuration. Fires only on
    /// an actual value change.
    fn characteristic_configured(
        &mut self,
        _peer: PeerId,
        _service_id: IdType,
        _chrc_id: IdType,
        _notify: bool,
        _indicate: bool,
    ) {
    }
}

impl<T: ServiceHandler> ServiceHandler for &mut T {
    async fn read(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        (**self).read(peer, service_id, id, offset, data).await
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
        (**self).write(peer, service_id, id, offset, data, kind).await
    }

    fn characteristic_configured(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        chrc_id: IdType,
        notify: bool,
        indicate: bool,
    ) {
        (**self).characteristic_configured(peer, service_id, chrc_id, notify, indicate)
    }
}

/// A service was registered or unregistered, reshaping the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceChangedEvent {
    pub service_id: IdType,
    pub start: Handle,
    pub end: Handle,
}

/// A peer's notify/indicate subscription for one characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClientCharacteristicConfig {
    /// The characteristic value handle.
    pub handle: Handle,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Clone, Copy)]
enum RouteKind {
    Characteristic {
        id: IdType,
        props: CharacteristicProps,
    },
    Descriptor {
        id: IdType,
    },
    ClientConfig {
        chrc_id: IdType,
        chrc_handle: Handle,
        props: CharacteristicProps,
    },
}

#[derive(Clone, Copy)]
struct AttrRoute {
    handle: Handle,
    service_id: IdType,
    kind: RouteKind,
}

#[derive(Clone, Copy)]
struct ServiceRecord {
    id: IdType,
    start: Handle,
    end: Handle,
}

struct CccRow {
    service_id: IdType,
    chrc_id: IdType,
    peer: PeerId,
    value: u16,
}

struct ManagerState<const MAX: usize> {
    services: Vec<ServiceRecord, { config::GATT_MAX_SERVICES }>,
    routes: Vec<AttrRoute, MAX>,
    ccc: Vec<CccRow, { config::GATT_CCC_TABLE_SIZE }>,
    next_id: IdType,
}

const MAX_ROUTES_PER_SERVICE: usize =
    config::GATT_MAX_CHARACTERISTICS * (2 + config::GATT_MAX_DESCRIPTORS);

/// Registers local GATT services into a shared attribute database and tracks
/// their per-peer subscription state.
pub struct LocalServiceManager<'d, M: RawMutex, const MAX: usize> {
    db: &'d AttributeDatabase<M, MAX>,
    state: BlockingMutex<M, RefCell<ManagerState<MAX>>>,
    changes: Channel<M, ServiceChangedEvent, { config::SERVICE_CHANGED_QUEUE_SIZE }>,
}

impl<'d, M: RawMutex, const MAX: usize> LocalServiceManager<'d, M, MAX> {
    pub fn new(db: &'d AttributeDatabase<M, MAX>) -> Self {
        Self {
            db,
            state: BlockingMutex::new(RefCell::new(ManagerState {
                services: Vec::new(),
                routes: Vec::new(),
                ccc: Vec::new(),
                next_id: 1,
            })),
            changes: Channel::new(),
        }
    }

    /// The database services are registered into.
    pub fn database(&self) -> &'d AttributeDatabase<M, MAX> {
        self.db
    }

    /// Stream of database reshape events, consumed by the generic attribute
    /// service for Service Changed indications.
    pub fn service_changes(&self) -> DynamicReceiver<'_, ServiceChangedEvent> {
        self.changes.receiver().into()
    }

    /// Register a service, allocating a grouping for its attribute layout.
    ///
    /// Characteristics (and descriptors) with 16-bit UUIDs are laid out
    /// before those with 128-bit UUIDs, per the GATT recommendation. Returns
    /// the new service's id, counting up from 1.
    pub async fn register_service(&self, service: Service) -> Result<IdType, Error> {
        let (attr_count, route_count) = Self::validate(&service)?;

        self.state.lock(|s| {
            let s = s.borrow();
            if s.services.is_full() || s.routes.len() + route_count > MAX {
                Err(Error::InsufficientSpace)
            } else {
                Ok(())
            }
        })?;

        let group_type = if service.primary() {
            PRIMARY_SERVICE_UUID16
        } else {
            SECONDARY_SERVICE_UUID16
        };

        let mut routes: Vec<AttrRoute, MAX_ROUTES_PER_SERVICE> = Vec::new();
        let start;
        {
            let mut db = self.db.lock().await;
            start = db.new_grouping(group_type, attr_count, service.uuid().as_raw())?;

            let mut populate = || -> Result<(), Error> {
                for uuid_size in [2usize, 16] {
                    for chrc in service
                        .characteristics
                        .iter()
                        .filter(|c| c.uuid.compact_size() == uuid_size)
                    {
                        Self::add_characteristic(&mut db, start, chrc, &mut routes)?;
                    }
                }
                Ok(())
            };
            if let Err(e) = populate() {
                db.remove_grouping(start);
                return Err(e);
            }
            db.set_active(start, true);
        }

        let end = start + attr_count as Handle;
        let id = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let id = s.next_id;
            s.next_id += 1;
            // Capacity was checked up front.
            let _ = s.services.push(ServiceRecord { id, start, end });
            for mut route in routes {
                route.service_id = id;
                let _ = s.routes.push(route);
            }
            id
        });

        debug!(
            "[gatt] registered service {} at handles [{}, {}]",
            id, start, end
        );
        self.notify_service_changed(ServiceChangedEvent {
            service_id: id,
            start,
            end,
        });
        Ok(id)
    }

    /// Remove a registered service, freeing its handle range for reuse.
    pub async fn unregister_service(&self, id: IdType) -> bool {
        let record = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let idx = s.services.iter().position(|r| r.id == id)?;
            let record = s.services.swap_remove(idx);
            s.routes.retain(|r| r.service_id != id);
            s.ccc.retain(|row| row.service_id != id);
            Some(record)
        });
        let Some(record) = record else {
            return false;
        };

        self.db.lock().await.remove_grouping(record.start);
        debug!(
            "[gatt] unregistered service {} at handles [{}, {}]",
            id, record.start, record.end
        );
        self.notify_service_changed(ServiceChangedEvent {
            service_id: id,
            start: record.start,
            end: record.end,
        });
        true
    }

    /// A peer's subscription state for one characteristic. Peers that never
    /// wrote the configuration read as all-zero.
    pub fn get_characteristic_config(
        &self,
        service_id: IdType,
        chrc_id: IdType,
        peer: PeerId,
    ) -> Option<ClientCharacteristicConfig> {
        self.state.lock(|s| {
            let s = s.borrow();
            let handle = s.routes.iter().find_map(|r| {
                if r.service_id != service_id {
                    return None;
                }
                match r.kind {
                    RouteKind::ClientConfig {
                        chrc_id: id,
                        chrc_handle,
                        ..
                    } if id == chrc_id => Some(chrc_handle),
                    _ => None,
                }
            })?;
            let value = s
                .ccc
                .iter()
                .find(|row| {
                    row.service_id == service_id && row.chrc_id == chrc_id && row.peer == peer
                })
                .map(|row| row.value)
                .unwrap_or(0);
            Some(ClientCharacteristicConfig {
                handle,
                notify: value & CCC_NOTIFICATION_BIT != 0,
                indicate: value & CCC_INDICATION_BIT != 0,
            })
        })
    }

    /// Forget everything known about a disconnecting peer.
    pub fn disconnect_client(&self, peer: PeerId) {
        self.state.lock(|s| {
            s.borrow_mut().ccc.retain(|row| row.peer != peer);
        });
    }

    /// Adapt an application [`ServiceHandler`] into the [`AttrHandler`] a
    /// connection's attribute server consumes.
    pub fn handler<T: ServiceHandler>(
        &self,
        peer: PeerId,
        app: T,
    ) -> ManagedHandler<'_, 'd, M, T, MAX> {
        ManagedHandler {
            manager: self,
            peer,
            app,
        }
    }

    fn validate(service: &Service) -> Result<(usize, usize), Error> {
        const MAX_IDS: usize =
            config::GATT_MAX_CHARACTERISTICS * (1 + config::GATT_MAX_DESCRIPTORS);
        let mut ids: Vec<IdType, MAX_IDS> = Vec::new();
        let mut attr_count = 0usize;
        let mut route_count = 0usize;

        let mut claim = |id: IdType, ids: &mut Vec<IdType, MAX_IDS>| -> Result<(), Error> {
            if ids.contains(&id) {
                debug!("[gatt] service definition repeats id {}", id);
                return Err(Error::InvalidServiceDefinition);
            }
            ids.push(id).map_err(|_| Error::InsufficientSpace)
        };

        for chrc in &service.characteristics {
            claim(chrc.id, &mut ids)?;

            // Declaration and value attributes.
            attr_count += 2;
            route_count += 1;

            if chrc
                .props
                .any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate])
            {
                if !chrc.update_reqs.allowed() {
                    debug!("[gatt] characteristic {} has no update permission", chrc.id);
                    return Err(Error::InvalidServiceDefinition);
                }
                attr_count += 1;
                route_count += 1;
            }
            if chrc.ext_props != 0 {
                attr_count += 1;
            }

            for desc in &chrc.descriptors {
                // These descriptor types are managed internally.
                if desc.uuid == CHARACTERISTIC_CCCD_UUID16
                    || desc.uuid == CHARACTERISTIC_EXT_PROPERTIES_UUID16
                    || desc.uuid == CHARACTERISTIC_SCCD_UUID16
                {
                    debug!("[gatt] service definition uses reserved descriptor type");
                    return Err(Error::InvalidServiceDefinition);
                }
                claim(desc.id, &mut ids)?;
                attr_count += 1;
                route_count += 1;
            }
        }
        Ok((attr_count, route_count))
    }

    fn add_characteristic(
        db: &mut DatabaseInner<MAX>,
        group_start: Handle,
        chrc: &Characteristic,
        routes: &mut Vec<AttrRoute, MAX_ROUTES_PER_SERVICE>,
    ) -> Result<(), Error> {
        // Characteristic declaration (Vol 3, Part G, 3.3.1).
        let decl_handle = db
            .add_attribute(
                group_start,
                CHARACTERISTIC_UUID16,
                AccessRequirements::allowed(),
                AccessRequirements::disallowed(),
            )
            .ok_or(Error::InsufficientSpace)?;

        // Characteristic value declaration (Vol 3, Part G, 3.3.2).
        let value_handle = db
            .add_attribute(
                group_start,
                chrc.uuid.clone(),
                chrc.read_reqs,
                chrc.write_reqs,
            )
            .ok_or(Error::InsufficientSpace)?;
        routes
            .push(AttrRoute {
                handle: value_handle,
                service_id: 0,
                kind: RouteKind::Characteristic {
                    id: chrc.id,
                    props: chrc.props,
                },
            })
            .map_err(|_| Error::InsufficientSpace)?;

        // The declaration value is properties, value handle, then the
        // characteristic UUID (2 or 16 octets, never 4).
        let mut decl_value = [0u8; 19];
        decl_value[0] = chrc.props.raw();
        decl_value[1..3].copy_from_slice(&value_handle.to_le_bytes());
        let uuid_size = chrc.uuid.compact_size();
        decl_value[3..3 + uuid_size].copy_from_slice(chrc.uuid.as_raw());
        if let Some(attr) = db.attribute_mut(decl_handle) {
            attr.set_value(&decl_value[..3 + uuid_size]);
        }

        if chrc
            .props
            .any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate])
        {
            // Readable without authentication or authorization; the service
            // decides the encryption and the write requirements.
            let read_reqs =
                AccessRequirements::new(chrc.update_reqs.encryption_required(), false, false);
            let ccc_handle = db
                .add_attribute(
                    group_start,
                    CHARACTERISTIC_CCCD_UUID16,
                    read_reqs,
                    chrc.update_reqs,
                )
                .ok_or(Error::InsufficientSpace)?;
            routes
                .push(AttrRoute {
                    handle: ccc_handle,
                    service_id: 0,
                    kind: RouteKind::ClientConfig {
                        chrc_id: chrc.id,
                        chrc_handle: value_handle,
                        props: chrc.props,
                    },
                })
                .map_err(|_| Error::InsufficientSpace)?;
        }

        if chrc.ext_props != 0 {
            let handle = db
                .add_attribute(
                    group_start,
                    CHARACTERISTIC_EXT_PROPERTIES_UUID16,
                    AccessRequirements::allowed(),
                    AccessRequirements::disallowed(),
                )
                .ok_or(Error::InsufficientSpace)?;
            if let Some(attr) = db.attribute_mut(handle) {
                attr.set_value(&chrc.ext_props.to_le_bytes());
            }
        }

        for uuid_size in [2usize, 16] {
            for desc in chrc
                .descriptors
                .iter()
                .filter(|d| d.uuid.compact_size() == uuid_size)
            {
                let handle = db
                    .add_attribute(group_start, desc.uuid.clone(), desc.read_reqs, desc.write_reqs)
                    .ok_or(Error::InsufficientSpace)?;
                routes
                    .push(AttrRoute {
                        handle,
                        service_id: 0,
                        kind: RouteKind::Descriptor { id: desc.id },
                    })
                    .map_err(|_| Error::InsufficientSpace)?;
            }
        }
        Ok(())
    }

    fn notify_service_changed(&self, event: ServiceChangedEvent) {
        if self.changes.try_send(event).is_err() {
            warn!(
                "[gatt] service changed queue full, dropping event for service {}",
                event.service_id
            );
        }
    }

    fn route_for(&self, handle: Handle) -> Option<(IdType, RouteKind)> {
        self.state.lock(|s| {
            s.borrow()
                .routes
                .iter()
                .find(|r| r.handle == handle)
                .map(|r| (r.service_id, r.kind))
        })
    }

    fn ccc_value(&self, service_id: IdType, chrc_id: IdType, peer: PeerId) -> u16 {
        self.state.lock(|s| {
            s.borrow()
                .ccc
                .iter()
                .find(|row| {
                    row.service_id == service_id && row.chrc_id == chrc_id && row.peer == peer
                })
                .map(|row| row.value)
                .unwrap_or(0)
        })
    }

    async fn dispatch_read<T: ServiceHandler>(
        &self,
        app: &mut T,
        peer: PeerId,
        handle: Handle,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        match self.route_for(handle) {
            None => {
                warn!("[gatt] read of unmanaged handle {}", handle);
                Err(AttErrorCode::UnlikelyError)
            }
            Some((service_id, RouteKind::Characteristic { id, props })) => {
                // The ATT permission check passed; the property bits decide
                // whether the read procedure itself is supported.
                if !props.any(&[CharacteristicProp::Read]) {
                    return Err(AttErrorCode::ReadNotPermitted);
                }
                app.read(peer, service_id, id, offset, data).await
            }
            Some((service_id, RouteKind::Descriptor { id })) => {
                app.read(peer, service_id, id, offset, data).await
            }
            Some((service_id, RouteKind::ClientConfig { chrc_id, .. })) => {
                if offset != 0 {
                    return Err(AttErrorCode::InvalidOffset);
                }
                if data.len() < 2 {
                    return Err(AttErrorCode::UnlikelyError);
                }
                let value = self.ccc_value(service_id, chrc_id, peer);
                data[..2].copy_from_slice(&value.to_le_bytes());
                Ok(2)
            }
        }
    }

    async fn dispatch_write<T: ServiceHandler>(
        &self,
        app: &mut T,
        peer: PeerId,
        handle: Handle,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode> {
        match self.route_for(handle) {
            None => {
                warn!("[gatt] write of unmanaged handle {}", handle);
                Err(AttErrorCode::UnlikelyError)
            }
            Some((service_id, RouteKind::Characteristic { id, props })) => {
                // Write requests need the write procedure, write commands the
                // write-without-response procedure. No fallbacks.
                let supported = match kind {
                    WriteKind::Request => props.any(&[CharacteristicProp::Write]),
                    WriteKind::Command => props.any(&[CharacteristicProp::WriteWithoutResponse]),
                };
                if !supported {
                    return Err(AttErrorCode::WriteNotPermitted);
                }
                app.write(peer, service_id, id, offset, data, kind).await
            }
            Some((service_id, RouteKind::Descriptor { id })) => {
                // Descriptors cannot be written with the write-without-response
                // procedure.
                if kind == WriteKind::Command {
                    return Err(AttErrorCode::WriteNotPermitted);
                }
                app.write(peer, service_id, id, offset, data, kind).await
            }
            Some((service_id, RouteKind::ClientConfig { chrc_id, props, .. })) => {
                if kind == WriteKind::Command {
                    return Err(AttErrorCode::WriteNotPermitted);
                }
                self.write_ccc(app, peer, service_id, chrc_id, props, offset, data)
            }
        }
    }

    fn write_ccc<T: ServiceHandler>(
        &self,
        app: &mut T,
        peer: PeerId,
        service_id: IdType,
        chrc_id: IdType,
        props: CharacteristicProps,
        offset: u16,
        data: &[u8],
    ) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::InvalidOffset);
        }
        if data.len() != 2 {
            return Err(AttErrorCode::InvalidAttributeValueLength);
        }
        let value = u16::from_le_bytes([data[0], data[1]]);
        if value & !(CCC_NOTIFICATION_BIT | CCC_INDICATION_BIT) != 0 {
            return Err(AttErrorCode::InvalidPdu);
        }
        let notify = value & CCC_NOTIFICATION_BIT != 0;
        let indicate = value & CCC_INDICATION_BIT != 0;
        if notify && !props.any(&[CharacteristicProp::Notify]) {
            return Err(AttErrorCode::WriteNotPermitted);
        }
        if indicate && !props.any(&[CharacteristicProp::Indicate]) {
            return Err(AttErrorCode::WriteNotPermitted);
        }

        let changed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let current = s
                .ccc
                .iter_mut()
                .find(|row| {
                    row.service_id == service_id && row.chrc_id == chrc_id && row.peer == peer
                });
            match current {
                Some(row) => {
                    let changed = row.value != value;
                    row.value = value;
                    Ok(changed)
                }
                None if value == 0 => Ok(false),
                None => s
                    .ccc
                    .push(CccRow {
                        service_id,
                        chrc_id,
                        peer,
                        value,
                    })
                    .map(|_| true)
                    .map_err(|_| AttErrorCode::InsufficientResources),
            }
        })?;
        // A row holding zero is equivalent to no row at all.
        if value == 0 {
            self.state.lock(|s| {
                s.borrow_mut().ccc.retain(|row| {
                    !(row.service_id == service_id && row.chrc_id == chrc_id && row.peer == peer)
                })
            });
        }

        if changed {
            trace!(
                "[gatt] peer {} configured characteristic {}: notify={}, indicate={}",
                peer.0,
                chrc_id,
                notify,
                indicate
            );
            app.characteristic_configured(peer, service_id, chrc_id, notify, indicate);
        }
        Ok(())
    }
}

/// Adapts a [`ServiceHandler`] plus the manager's routing into the
/// [`AttrHandler`] consumed by an attribute server.
pub struct ManagedHandler<'a, 'd, M: RawMutex, T: ServiceHandler, const MAX: usize> {
    manager: &'a LocalServiceManager<'d, M, MAX>,
    peer: PeerId,
    app: T,
}

impl<'a, 'd, M: RawMutex, T: ServiceHandler, const MAX: usize> AttrHandler
    for ManagedHandler<'a, 'd, M, T, MAX>
{
    async fn read(
        &mut self,
        _uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        self.manager
            .dispatch_read(&mut self.app, self.peer, handle, offset, data)
            .await
    }

    async fn write(
        &mut self,
        _uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode> {
        self.manager
            .dispatch_write(&mut self.app, self.peer, handle, offset, data, kind)
            .await
    }
}
