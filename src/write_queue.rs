//! Staged writes queued by the ATT Prepare Write method.

use heapless::{Deque, Vec};

use crate::att::{Handle, MAX_ATTRIBUTE_VALUE_LENGTH};
use crate::config;

/// A single write staged for atomic submission by Execute Write.
#[derive(Debug)]
pub struct QueuedWrite {
    handle: Handle,
    offset: u16,
    value: Vec<u8, MAX_ATTRIBUTE_VALUE_LENGTH>,
}

impl QueuedWrite {
    /// Stage a write by copying `value`. Returns `None` when the value does
    /// not fit an attribute.
    pub fn new(handle: Handle, offset: u16, value: &[u8]) -> Option<Self> {
        Some(Self {
            handle,
            offset,
            value: Vec::from_slice(value).ok()?,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// The per-bearer FIFO of staged writes.
///
/// Bounded; a peer overflowing it is answered with `PrepareQueueFull`.
pub type PrepareWriteQueue = Deque<QueuedWrite, { config::PREPARE_WRITE_QUEUE_SIZE }>;
