//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use gatt_host::att::{AttErrorCode, Handle};
use gatt_host::attribute_server::{AttrHandler, AttributeServer, WriteKind};
use gatt_host::database::AttributeDatabase;
use gatt_host::mock_bearer::{MockBearer, MockLink};
use gatt_host::types::uuid::Uuid;
use gatt_host::PeerId;

pub type TestMutex = CriticalSectionRawMutex;
pub const DB_SIZE: usize = 32;
pub type TestDb = AttributeDatabase<TestMutex, DB_SIZE>;
pub type TestLink = MockLink<TestMutex>;
pub type TestServer<'d, 'l> = AttributeServer<'d, TestMutex, MockBearer<'l, TestMutex>, DB_SIZE>;

pub const PEER: PeerId = PeerId(1);

pub const TEST_TYPE1: Uuid = Uuid::new_short(0xbeef);
pub const TEST_TYPE2: Uuid = Uuid::new_short(0xcafe);

/// An [`AttrHandler`] recording every call, with programmable values and
/// error outcomes per handle.
#[derive(Default)]
pub struct RecordingHandler {
    pub reads: Vec<(Handle, u16)>,
    pub writes: Vec<(Handle, u16, Vec<u8>, WriteKind)>,
    pub read_values: HashMap<Handle, Vec<u8>>,
    pub read_errors: HashMap<Handle, AttErrorCode>,
    pub write_errors: HashMap<Handle, AttErrorCode>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value a handle accumulated through offset writes.
    pub fn written(&self, handle: Handle) -> Vec<u8> {
        let mut out = Vec::new();
        for (h, offset, data, _) in &self.writes {
            if *h != handle {
                continue;
            }
            let offset = *offset as usize;
            if out.len() < offset + data.len() {
                out.resize(offset + data.len(), 0);
            }
            out[offset..offset + data.len()].copy_from_slice(data);
        }
        out
    }
}

impl AttrHandler for RecordingHandler {
    async fn read(
        &mut self,
        _uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        self.reads.push((handle, offset));
        if let Some(code) = self.read_errors.get(&handle) {
            return Err(*code);
        }
        let value = self.read_values.get(&handle).cloned().unwrap_or_default();
        let offset = offset as usize;
        if offset > value.len() {
            return Err(AttErrorCode::InvalidOffset);
        }
        let take = (value.len() - offset).min(data.len());
        data[..take].copy_from_slice(&value[offset..offset + take]);
        Ok(take)
    }

    async fn write(
        &mut self,
        _uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode> {
        self.writes.push((handle, offset, data.to_vec(), kind));
        match self.write_errors.get(&handle) {
            Some(code) => Err(*code),
            None => Ok(()),
        }
    }
}

/// Install the test logger once. Logs show up when the crate is built with
/// `--features log` and `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Feed one PDU through the server, returning any response PDU.
pub async fn request<T: AttrHandler>(
    server: &TestServer<'_, '_>,
    handler: &mut T,
    pdu: &[u8],
) -> Option<Vec<u8>> {
    let mut rsp = [0u8; 600];
    let len = server.process(pdu, &mut rsp, handler).await.unwrap();
    len.map(|n| rsp[..n].to_vec())
}
