//! Compile-time tuning knobs.
//!
//! These bound the fixed-capacity tables the crate allocates. They are plain
//! constants rather than cargo features; adjust them by patching the crate if
//! a deployment needs different sizes.

/// Maximum number of staged writes a peer may queue with Prepare Write
/// Request before the server answers with `PrepareQueueFull`.
pub const PREPARE_WRITE_QUEUE_SIZE: usize = 20;

/// ATT MTU this server asks for during MTU exchange.
pub const PREFERRED_ATT_MTU: u16 = 247;

/// Maximum number of services a [`LocalServiceManager`] can carry at once.
///
/// [`LocalServiceManager`]: crate::gatt::LocalServiceManager
pub const GATT_MAX_SERVICES: usize = 8;

/// Maximum number of characteristics per service definition.
pub const GATT_MAX_CHARACTERISTICS: usize = 8;

/// Maximum number of user descriptors per characteristic definition.
pub const GATT_MAX_DESCRIPTORS: usize = 4;

/// Maximum number of (characteristic, peer) client configuration rows kept
/// across all services.
pub const GATT_CCC_TABLE_SIZE: usize = 16;

/// Maximum number of peers that may subscribe to Service Changed
/// indications at the same time.
pub const SERVICE_CHANGED_MAX_SUBSCRIBERS: usize = 8;

/// Depth of the queue buffering service-changed events for indication
/// fan-out.
pub const SERVICE_CHANGED_QUEUE_SIZE: usize = 4;
