//! Attributes and their access requirements.

use core::fmt;

use heapless::Vec;

use crate::att::{Handle, MAX_ATTRIBUTE_VALUE_LENGTH};
pub use crate::types::uuid::Uuid;

/// UUID for primary service groupings.
pub const PRIMARY_SERVICE_UUID16: Uuid = Uuid::new_short(0x2800);

/// UUID for secondary service groupings.
pub const SECONDARY_SERVICE_UUID16: Uuid = Uuid::new_short(0x2801);

/// UUID for characteristic declarations.
pub const CHARACTERISTIC_UUID16: Uuid = Uuid::new_short(0x2803);

/// UUID for the characteristic extended properties descriptor.
pub const CHARACTERISTIC_EXT_PROPERTIES_UUID16: Uuid = Uuid::new_short(0x2900);

/// UUID for the client characteristic configuration descriptor.
pub const CHARACTERISTIC_CCCD_UUID16: Uuid = Uuid::new_short(0x2902);

/// UUID for the server characteristic configuration descriptor.
pub const CHARACTERISTIC_SCCD_UUID16: Uuid = Uuid::new_short(0x2903);

/// UUID for the generic access service.
pub const GENERIC_ACCESS_SERVICE_UUID16: Uuid = Uuid::new_short(0x1800);

/// UUID for the device name characteristic.
pub const CHARACTERISTIC_DEVICE_NAME_UUID16: Uuid = Uuid::new_short(0x2a00);

/// UUID for the appearance characteristic.
pub const CHARACTERISTIC_APPEARANCE_UUID16: Uuid = Uuid::new_short(0x2a01);

/// UUID for the peripheral preferred connection parameters characteristic.
pub const CHARACTERISTIC_PPCP_UUID16: Uuid = Uuid::new_short(0x2a04);

/// UUID for the generic attribute service.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID16: Uuid = Uuid::new_short(0x1801);

/// UUID for the service changed characteristic.
pub const SERVICE_CHANGED_UUID16: Uuid = Uuid::new_short(0x2a05);

const PERMISSION_BIT_ALLOWED: u8 = 1 << 0;
const PERMISSION_BIT_ENCRYPTION_REQUIRED: u8 = 1 << 1;
const PERMISSION_BIT_AUTHENTICATION_REQUIRED: u8 = 1 << 2;
const PERMISSION_BIT_AUTHORIZATION_REQUIRED: u8 = 1 << 3;

/// Encryption key size required when none is given explicitly.
const DEFAULT_MIN_ENC_KEY_SIZE: u8 = 16;

/// Read or write access requirements of an attribute.
///
/// The default value disallows access entirely.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccessRequirements {
    bits: u8,
    min_enc_key_size: u8,
}

impl AccessRequirements {
    /// Access is never permitted.
    pub const fn disallowed() -> Self {
        Self {
            bits: 0,
            min_enc_key_size: 0,
        }
    }

    /// Access is permitted without any security.
    pub const fn allowed() -> Self {
        Self::new(false, false, false)
    }

    /// Access is permitted with the given link security requirements.
    pub const fn new(encryption: bool, authentication: bool, authorization: bool) -> Self {
        let mut bits = PERMISSION_BIT_ALLOWED;
        if encryption {
            bits |= PERMISSION_BIT_ENCRYPTION_REQUIRED;
        }
        if authentication {
            bits |= PERMISSION_BIT_AUTHENTICATION_REQUIRED;
        }
        if authorization {
            bits |= PERMISSION_BIT_AUTHORIZATION_REQUIRED;
        }
        Self {
            bits,
            min_enc_key_size: DEFAULT_MIN_ENC_KEY_SIZE,
        }
    }

    /// Lower the required encryption key size.
    pub const fn with_min_enc_key_size(mut self, size: u8) -> Self {
        self.min_enc_key_size = size;
        self
    }

    /// Whether this attribute can be accessed at all.
    pub fn allowed(&self) -> bool {
        self.bits & PERMISSION_BIT_ALLOWED != 0
    }

    /// Whether access needs no security at all.
    pub fn allowed_without_security(&self) -> bool {
        self.bits == PERMISSION_BIT_ALLOWED
    }

    pub fn encryption_required(&self) -> bool {
        self.bits & PERMISSION_BIT_ENCRYPTION_REQUIRED != 0
    }

    pub fn authentication_required(&self) -> bool {
        self.bits & PERMISSION_BIT_AUTHENTICATION_REQUIRED != 0
    }

    pub fn authorization_required(&self) -> bool {
        self.bits & PERMISSION_BIT_AUTHORIZATION_REQUIRED != 0
    }

    pub fn min_enc_key_size(&self) -> u8 {
        self.min_enc_key_size
    }
}

/// A single attribute record.
///
/// An attribute either carries a cached *static* value (set once, writes
/// forbidden) or is *dynamic*, in which case reads and writes are served by
/// the attribute handler the server was given. Instances are created by
/// populating a grouping in the database.
pub struct Attribute {
    handle: Handle,
    att_type: Uuid,
    read_reqs: AccessRequirements,
    write_reqs: AccessRequirements,
    value: Option<Vec<u8, MAX_ATTRIBUTE_VALUE_LENGTH>>,
}

impl Attribute {
    pub(crate) fn new(
        handle: Handle,
        att_type: Uuid,
        read_reqs: AccessRequirements,
        write_reqs: AccessRequirements,
    ) -> Self {
        Self {
            handle,
            att_type,
            read_reqs,
            write_reqs,
            value: None,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn att_type(&self) -> &Uuid {
        &self.att_type
    }

    pub fn read_reqs(&self) -> &AccessRequirements {
        &self.read_reqs
    }

    pub fn write_reqs(&self) -> &AccessRequirements {
        &self.write_reqs
    }

    /// The cached value, or `None` when this attribute is dynamic.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Whether reads and writes must go through the attribute handler.
    pub fn is_dynamic(&self) -> bool {
        self.value.is_none()
    }

    /// Assign the static value. Once assigned it cannot be replaced, and a
    /// static value cannot be given to an attribute that permits writes as
    /// those must reach the service layer.
    ///
    /// Panics when either contract is violated or the value is empty or
    /// longer than [`MAX_ATTRIBUTE_VALUE_LENGTH`].
    pub fn set_value(&mut self, value: &[u8]) {
        assert!(!value.is_empty());
        assert!(value.len() <= MAX_ATTRIBUTE_VALUE_LENGTH);
        assert!(!self.write_reqs.allowed());
        assert!(self.value.is_none());
        let mut stored = Vec::new();
        stored.extend_from_slice(value).unwrap();
        self.value = Some(stored);
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("handle", &self.handle)
            .field("type", &self.att_type)
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Attribute {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", defmt::Debug2Format(self))
    }
}
