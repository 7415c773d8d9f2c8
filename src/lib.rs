//! An async BLE ATT/GATT server.
//!
//! The crate implements the host side of the Attribute Protocol: a shared
//! [`AttributeDatabase`](database::AttributeDatabase) of handle groupings, a
//! per-connection [`AttributeServer`](attribute_server::AttributeServer)
//! state machine speaking the ATT wire protocol over a pluggable bearer, a
//! [`LocalServiceManager`](gatt::LocalServiceManager) layering GATT service,
//! characteristic and descriptor semantics on top, and the built-in
//! [Generic Attribute service](gatt::generic::GenericAttributeService) that
//! indicates database reshapes to subscribed peers.
//!
//! Everything runs on a single cooperative dispatcher: state is shared with
//! `embassy-sync` primitives, storage is `heapless`, and the only suspension
//! points are attribute handler calls and outbound indications awaiting
//! their confirmation.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

// Must come first so its macros are visible to the other modules.
mod fmt;

pub mod att;
pub mod attribute;
pub mod attribute_server;
pub mod codec;
pub mod config;
pub mod cursor;
pub mod database;
pub mod gatt;
pub mod mock_bearer;
pub mod security;
pub mod types;
pub mod write_queue;

use att::AttErrorCode;

/// Identifies a peer device across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerId(pub u64);

impl core::fmt::Display for PeerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "peer:{:#x}", self.0)
    }
}

/// Errors of the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A fixed-capacity table or buffer is full.
    InsufficientSpace,
    /// The requested entity does not exist.
    NotFound,
    /// A value failed validation.
    InvalidValue,
    /// A service definition was rejected.
    InvalidServiceDefinition,
    /// An ATT transaction timed out.
    Timeout,
    /// Encoding or decoding failed.
    Codec(codec::Error),
    /// A protocol error reported by a peer or a handler.
    Att(AttErrorCode),
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Self {
        Error::Codec(e)
    }
}

impl From<AttErrorCode> for Error {
    fn from(e: AttErrorCode) -> Self {
        Error::Att(e)
    }
}

/// Host errors combined with the transport errors of a bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleHostError<E> {
    BleHost(Error),
    Bearer(E),
}

impl<E> From<Error> for BleHostError<E> {
    fn from(e: Error) -> Self {
        BleHostError::BleHost(e)
    }
}

impl<E> From<codec::Error> for BleHostError<E> {
    fn from(e: codec::Error) -> Self {
        BleHostError::BleHost(Error::Codec(e))
    }
}

impl<E> From<AttErrorCode> for BleHostError<E> {
    fn from(e: AttErrorCode) -> Self {
        BleHostError::BleHost(Error::Att(e))
    }
}

/// Commonly used types.
pub mod prelude {
    pub use crate::att::{AttErrorCode, Handle};
    pub use crate::attribute::{AccessRequirements, Attribute, Uuid};
    pub use crate::attribute_server::{AttBearer, AttrHandler, AttributeServer, WriteKind};
    pub use crate::database::AttributeDatabase;
    pub use crate::gatt::access::{GenericAccessService, PreferredConnectionParameters};
    pub use crate::gatt::generic::{GenericAttributeService, Indicator};
    pub use crate::gatt::{
        Characteristic, CharacteristicProp, CharacteristicProps, Descriptor, IdType,
        LocalServiceManager, Service, ServiceChangedEvent, ServiceHandler,
    };
    pub use crate::security::{SecurityLevel, SecurityProperties};
    pub use crate::{BleHostError, Error, PeerId};
}
