//! The built-in Generic Access Profile service.
//!
//! Exposes the device name, appearance and peripheral preferred connection
//! parameter characteristics (Vol 3, Part C, 12).

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use heapless::Vec;

use crate::att::AttErrorCode;
use crate::attribute::{
    AccessRequirements, CHARACTERISTIC_APPEARANCE_UUID16, CHARACTERISTIC_DEVICE_NAME_UUID16,
    CHARACTERISTIC_PPCP_UUID16, GENERIC_ACCESS_SERVICE_UUID16,
};
use crate::attribute_server::WriteKind;
use crate::gatt::{Characteristic, CharacteristicProp, IdType, LocalServiceManager, Service, ServiceHandler};
use crate::{Error, PeerId};

const DEVICE_NAME_ID: IdType = 0;
const APPEARANCE_ID: IdType = 1;
const PREFERRED_CONNECTION_PARAMETERS_ID: IdType = 2;

/// The longest device name the characteristic can carry.
pub const MAX_DEVICE_NAME_LENGTH: usize = 248;

/// Connection parameter fields may hold this to leave them unspecified.
pub const UNSPECIFIED_CONNECTION_PARAMETER: u16 = 0xffff;

const CONNECTION_INTERVAL_MIN: u16 = 0x0006;
const CONNECTION_INTERVAL_MAX: u16 = 0x0c80;
const CONNECTION_LATENCY_MAX: u16 = 0x01f3;
const SUPERVISION_TIMEOUT_MIN: u16 = 0x000a;
const SUPERVISION_TIMEOUT_MAX: u16 = 0x0c80;

/// The connection parameters a peripheral asks its central to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PreferredConnectionParameters {
    /// Minimum connection interval, in 1.25 ms units.
    pub min_interval: u16,
    /// Maximum connection interval, in 1.25 ms units.
    pub max_interval: u16,
    /// Maximum peripheral latency, in connection events.
    pub max_latency: u16,
    /// Supervision timeout, in 10 ms units.
    pub supervision_timeout: u16,
}

impl PreferredConnectionParameters {
    fn valid(&self) -> bool {
        let min_specified = self.min_interval != UNSPECIFIED_CONNECTION_PARAMETER;
        if min_specified
            && !(CONNECTION_INTERVAL_MIN..=CONNECTION_INTERVAL_MAX).contains(&self.min_interval)
        {
            return false;
        }
        if self.max_interval != UNSPECIFIED_CONNECTION_PARAMETER {
            if !(CONNECTION_INTERVAL_MIN..=CONNECTION_INTERVAL_MAX).contains(&self.max_interval) {
                return false;
            }
            if min_specified && self.max_interval < self.min_interval {
                return false;
            }
        }
        if self.max_latency > CONNECTION_LATENCY_MAX {
            return false;
        }
        if self.supervision_timeout != UNSPECIFIED_CONNECTION_PARAMETER
            && !(SUPERVISION_TIMEOUT_MIN..=SUPERVISION_TIMEOUT_MAX)
                .contains(&self.supervision_timeout)
        {
            return false;
        }
        true
    }

    fn encode(&self) -> [u8; 8] {
        let mut value = [0u8; 8];
        value[0..2].copy_from_slice(&self.min_interval.to_le_bytes());
        value[2..4].copy_from_slice(&self.max_interval.to_le_bytes());
        value[4..6].copy_from_slice(&self.max_latency.to_le_bytes());
        value[6..8].copy_from_slice(&self.supervision_timeout.to_le_bytes());
        value
    }
}

struct AccessState {
    device_name: Vec<u8, MAX_DEVICE_NAME_LENGTH>,
    appearance: u16,
    preferred_connection_parameters: Option<PreferredConnectionParameters>,
}

/// The Generic Access service: device name, appearance and preferred
/// connection parameters, all read-only without security.
pub struct GenericAccessService<'a, 'd, M: RawMutex, const MAX: usize> {
    manager: &'a LocalServiceManager<'d, M, MAX>,
    service_id: IdType,
    state: BlockingMutex<M, RefCell<AccessState>>,
}

impl<'a, 'd, M: RawMutex, const MAX: usize> GenericAccessService<'a, 'd, M, MAX> {
    /// Register the service with the given initial device name.
    pub async fn register(
        manager: &'a LocalServiceManager<'d, M, MAX>,
        device_name: &str,
    ) -> Result<GenericAccessService<'a, 'd, M, MAX>, Error> {
        let mut service = Service::new(true, GENERIC_ACCESS_SERVICE_UUID16);
        for (id, uuid) in [
            (DEVICE_NAME_ID, CHARACTERISTIC_DEVICE_NAME_UUID16),
            (APPEARANCE_ID, CHARACTERISTIC_APPEARANCE_UUID16),
            (
                PREFERRED_CONNECTION_PARAMETERS_ID,
                CHARACTERISTIC_PPCP_UUID16,
            ),
        ] {
            service.add_characteristic(Characteristic::new(
                id,
                uuid,
                [CharacteristicProp::Read],
                0,
                AccessRequirements::allowed(),
                AccessRequirements::disallowed(),
                AccessRequirements::disallowed(),
            ))?;
        }
        let service_id = manager.register_service(service).await?;

        let this = Self {
            manager,
            service_id,
            state: BlockingMutex::new(RefCell::new(AccessState {
                device_name: Vec::new(),
                appearance: 0,
                preferred_connection_parameters: None,
            })),
        };
        this.update_device_name(device_name.as_bytes());
        Ok(this)
    }

    pub fn service_id(&self) -> IdType {
        self.service_id
    }

    /// Remove the service from the database.
    pub async fn unregister(&self) -> bool {
        self.manager.unregister_service(self.service_id).await
    }

    /// Replace the device name, truncating it to
    /// [`MAX_DEVICE_NAME_LENGTH`] octets.
    pub fn update_device_name(&self, device_name: &[u8]) {
        let mut device_name = device_name;
        if device_name.len() > MAX_DEVICE_NAME_LENGTH {
            trace!(
                "[gatt] device name of {} octets truncated to {}",
                device_name.len(),
                MAX_DEVICE_NAME_LENGTH
            );
            device_name = &device_name[..MAX_DEVICE_NAME_LENGTH];
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.device_name.clear();
            let _ = s.device_name.extend_from_slice(device_name);
        });
    }

    /// Replace the appearance category value.
    pub fn update_appearance(&self, appearance: u16) {
        self.state.lock(|s| s.borrow_mut().appearance = appearance);
    }

    /// Replace (or clear) the preferred connection parameters. Returns false
    /// and changes nothing when a field is outside its valid range.
    pub fn update_preferred_connection_parameters(
        &self,
        parameters: Option<PreferredConnectionParameters>,
    ) -> bool {
        if let Some(parameters) = &parameters {
            if !parameters.valid() {
                warn!("[gatt] rejecting out-of-range preferred connection parameters");
                return false;
            }
        }
        self.state
            .lock(|s| s.borrow_mut().preferred_connection_parameters = parameters);
        true
    }

    /// Wrap an application handler so reads of this service are answered
    /// here. Pass the result to the attribute server.
    pub fn wrap<T: ServiceHandler>(&self, inner: T) -> GenericAccessHandler<'_, 'a, 'd, M, T, MAX> {
        GenericAccessHandler { gap: self, inner }
    }

    fn read_value(&self, id: IdType, offset: u16, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::InvalidOffset);
        }
        self.state.lock(|s| {
            let s = s.borrow();
            match id {
                DEVICE_NAME_ID => {
                    let take = s.device_name.len().min(data.len());
                    data[..take].copy_from_slice(&s.device_name[..take]);
                    Ok(take)
                }
                APPEARANCE_ID => {
                    let encoded = s.appearance.to_le_bytes();
                    let take = encoded.len().min(data.len());
                    data[..take].copy_from_slice(&encoded[..take]);
                    Ok(take)
                }
                PREFERRED_CONNECTION_PARAMETERS_ID => {
                    let Some(parameters) = &s.preferred_connection_parameters else {
                        return Err(AttErrorCode::ReadNotPermitted);
                    };
                    let encoded = parameters.encode();
                    let take = encoded.len().min(data.len());
                    data[..take].copy_from_slice(&encoded[..take]);
                    Ok(take)
                }
                _ => Err(AttErrorCode::ReadNotPermitted),
            }
        })
    }
}

/// A [`ServiceHandler`] wrapper answering reads of the generic access
/// service and forwarding everything else to the application.
pub struct GenericAccessHandler<'g, 'a, 'd, M: RawMutex, T: ServiceHandler, const MAX: usize> {
    gap: &'g GenericAccessService<'a, 'd, M, MAX>,
    inner: T,
}

impl<'g, 'a, 'd, M: RawMutex, T: ServiceHandler, const MAX: usize> ServiceHandler
    for GenericAccessHandler<'g, 'a, 'd, M, T, MAX>
{
    async fn read(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        if service_id == self.gap.service_id {
            return self.gap.read_value(id, offset, data);
        }
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
        if service_id == self.gap.service_id {
            // Nothing here is writable; the permissions already said so.
            return Err(AttErrorCode::UnlikelyError);
        }
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
        self.inner
            .characteristic_configured(peer, service_id, chrc_id, notify, indicate)
    }
}
