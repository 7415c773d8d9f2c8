//! Bluetooth UUIDs in their 16-bit alias and full 128-bit forms.
//!
//! Values in the SIG-reserved range are carried as 16-bit aliases and can be
//! promoted to the full form by inserting them into the Bluetooth Base UUID
//! (`00000000-0000-1000-8000-00805F9B34FB`). GATT declarations never use the
//! 32-bit alias form, so it is not representable here.

use core::fmt;

use crate::codec;
use crate::cursor::Encode;

/// The Bluetooth Base UUID, little-endian.
pub const BASE_UUID: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// A 16-bit or 128-bit Bluetooth UUID, stored little-endian.
#[derive(Clone, Eq)]
pub enum Uuid {
    Uuid16([u8; 2]),
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Create a UUID from a 16-bit SIG alias.
    pub const fn new_short(val: u16) -> Self {
        Self::Uuid16(val.to_le_bytes())
    }

    /// Create a UUID from full little-endian 128-bit data.
    pub const fn new_long(val: [u8; 16]) -> Self {
        Self::Uuid128(val)
    }

    /// Decode a UUID from its little-endian wire form (2 or 16 octets).
    pub fn from_slice(data: &[u8]) -> Result<Self, codec::Error> {
        match data.len() {
            2 => Ok(Self::Uuid16([data[0], data[1]])),
            16 => {
                let mut val = [0u8; 16];
                val.copy_from_slice(data);
                Ok(Self::Uuid128(val))
            }
            _ => Err(codec::Error::Malformed),
        }
    }

    /// The little-endian wire representation.
    pub fn as_raw(&self) -> &[u8] {
        match self {
            Self::Uuid16(uuid) => uuid.as_slice(),
            Self::Uuid128(uuid) => uuid.as_slice(),
        }
    }

    /// The compact encoded size in octets (2 or 16).
    pub fn compact_size(&self) -> usize {
        match self {
            Self::Uuid16(_) => 2,
            Self::Uuid128(_) => 16,
        }
    }

    /// The Find Information format octet for this UUID size.
    pub fn format(&self) -> u8 {
        match self {
            Self::Uuid16(_) => 0x01,
            Self::Uuid128(_) => 0x02,
        }
    }

    /// The 16-bit alias value. Only meaningful for [`Uuid::Uuid16`].
    pub fn as_short(&self) -> u16 {
        match self {
            Self::Uuid16(uuid) => u16::from_le_bytes(*uuid),
            Self::Uuid128(uuid) => u16::from_le_bytes([uuid[12], uuid[13]]),
        }
    }

    /// Promote to the full 128-bit form using the Base UUID.
    pub fn as_uuid128(&self) -> [u8; 16] {
        match self {
            Self::Uuid128(uuid) => *uuid,
            Self::Uuid16(alias) => {
                let mut uuid = BASE_UUID;
                uuid[12] = alias[0];
                uuid[13] = alias[1];
                uuid
            }
        }
    }
}

/// Equality is canonical: a 16-bit alias equals its Base-UUID promotion.
impl PartialEq for Uuid {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Uuid16(a), Self::Uuid16(b)) => a == b,
            (Self::Uuid128(a), Self::Uuid128(b)) => a == b,
            _ => self.as_uuid128() == other.as_uuid128(),
        }
    }
}

impl From<u16> for Uuid {
    fn from(val: u16) -> Self {
        Self::new_short(val)
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(val: [u8; 16]) -> Self {
        Self::new_long(val)
    }
}

impl Encode for Uuid {
    fn size(&self) -> usize {
        self.compact_size()
    }
    fn encode_to(&self, dest: &mut [u8]) {
        dest.copy_from_slice(self.as_raw());
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid16(_) => write!(f, "Uuid16({:#06x})", self.as_short()),
            Self::Uuid128(uuid) => {
                write!(f, "Uuid128(")?;
                for octet in uuid.iter().rev() {
                    write!(f, "{:02x}", octet)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Uuid {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", defmt::Debug2Format(self))
    }
}
