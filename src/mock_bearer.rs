//! An in-memory ATT bearer for exercising servers in tests.

use core::cell::Cell;
use core::convert::Infallible;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::attribute_server::AttBearer;
use crate::config;
use crate::security::SecurityProperties;

/// One PDU on a mock link.
pub type MockPdu = Vec<u8, { config::PREFERRED_ATT_MTU as usize }>;

const QUEUE_DEPTH: usize = 4;

/// A loopback ATT link. The test drives the client side directly; the server
/// under test owns the [`MockBearer`] side. The link's security level is
/// mutable so tests can "encrypt" it.
pub struct MockLink<M: RawMutex> {
    to_server: Channel<M, MockPdu, QUEUE_DEPTH>,
    to_client: Channel<M, MockPdu, QUEUE_DEPTH>,
    security: BlockingMutex<M, Cell<SecurityProperties>>,
}

impl<M: RawMutex> MockLink<M> {
    pub const fn new() -> Self {
        Self {
            to_server: Channel::new(),
            to_client: Channel::new(),
            security: BlockingMutex::new(Cell::new(SecurityProperties::INSECURE)),
        }
    }

    /// The bearer end, to hand to an attribute server.
    pub fn bearer(&self) -> MockBearer<'_, M> {
        MockBearer { link: self }
    }

    pub fn set_security(&self, security: SecurityProperties) {
        self.security.lock(|cell| cell.set(security));
    }

    pub fn security(&self) -> SecurityProperties {
        self.security.lock(|cell| cell.get())
    }

    /// Deliver a PDU from the peer to the server.
    pub async fn client_send(&self, pdu: &[u8]) {
        self.to_server.send(Vec::from_slice(pdu).unwrap()).await;
    }

    /// Wait for the next PDU the server sent.
    pub async fn client_receive(&self) -> MockPdu {
        self.to_client.receive().await
    }

    /// The next PDU the server sent, if one is queued.
    pub fn try_client_receive(&self) -> Option<MockPdu> {
        self.to_client.try_receive().ok()
    }
}

impl<M: RawMutex> Default for MockLink<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// The server end of a [`MockLink`].
pub struct MockBearer<'a, M: RawMutex> {
    link: &'a MockLink<M>,
}

impl<'a, M: RawMutex> AttBearer for MockBearer<'a, M> {
    type Error = Infallible;

    async fn send(&self, pdu: &[u8]) -> Result<(), Self::Error> {
        self.link.to_client.send(Vec::from_slice(pdu).unwrap()).await;
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let pdu = self.link.to_server.receive().await;
        buf[..pdu.len()].copy_from_slice(&pdu);
        Ok(pdu.len())
    }

    fn security(&self) -> SecurityProperties {
        self.link.security()
    }
}
