//! The per-connection ATT protocol server.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::with_timeout;

use crate::att::{
    AttErrorCode, AttReq, DecodeError, Handle, ATT_ERROR_RSP, ATT_EXCHANGE_MTU_RSP,
    ATT_EXECUTE_WRITE_REQ, ATT_EXECUTE_WRITE_RSP, ATT_FIND_BY_TYPE_VALUE_REQ,
    ATT_FIND_BY_TYPE_VALUE_RSP,
    ATT_FIND_INFORMATION_REQ, ATT_FIND_INFORMATION_RSP, ATT_HANDLE_VALUE_IND, ATT_HANDLE_VALUE_NTF,
    ATT_PREPARE_WRITE_REQ, ATT_PREPARE_WRITE_RSP, ATT_READ_BLOB_REQ, ATT_READ_BLOB_RSP,
    ATT_READ_BY_GROUP_TYPE_REQ, ATT_READ_BY_GROUP_TYPE_RSP, ATT_READ_BY_TYPE_REQ,
    ATT_READ_BY_TYPE_RSP, ATT_READ_REQ, ATT_READ_RSP, ATT_WRITE_REQ, ATT_WRITE_RSP,
    EXECUTE_WRITE_CANCEL_ALL, EXECUTE_WRITE_PENDING, LE_MIN_MTU, MAX_ATTRIBUTE_VALUE_LENGTH,
    MAX_READ_BY_GROUP_TYPE_VALUE_LENGTH, MAX_READ_BY_TYPE_VALUE_LENGTH, TRANSACTION_TIMEOUT,
};
use crate::attribute::{PRIMARY_SERVICE_UUID16, SECONDARY_SERVICE_UUID16};
use crate::codec;
use crate::config;
use crate::cursor::WriteCursor;
use crate::database::AttributeDatabase;
use crate::security::{check_read_permissions, check_write_permissions, SecurityProperties};
use crate::types::uuid::Uuid;
use crate::write_queue::{PrepareWriteQueue, QueuedWrite};
use crate::{BleHostError, Error, PeerId};

/// An ATT bearer: a byte-oriented PDU transport with a security level.
pub trait AttBearer {
    type Error;

    /// Send one outbound PDU.
    async fn send(&self, pdu: &[u8]) -> Result<(), Self::Error>;

    /// Receive one inbound PDU into `buf`, returning its length.
    async fn receive(&self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// The security properties the link currently provides.
    fn security(&self) -> SecurityProperties;
}

impl<B: AttBearer> AttBearer for &B {
    type Error = B::Error;

    async fn send(&self, pdu: &[u8]) -> Result<(), Self::Error> {
        (**self).send(pdu).await
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).receive(buf).await
    }

    fn security(&self) -> SecurityProperties {
        (**self).security()
    }
}

/// Whether a write expects a response or is a fire-and-forget command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteKind {
    Request,
    Command,
}

/// A callback trait serving the values of dynamic attributes.
pub trait AttrHandler {
    /// Read data for an attribute into `data`, starting at `offset` octets
    /// into the value.
    ///
    /// Return the number of bytes read.
    async fn read(
        &mut self,
        uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode>;

    /// Write data to an attribute, starting at `offset` octets into the
    /// value. Errors reported for a [`WriteKind::Command`] write are
    /// discarded.
    async fn write(
        &mut self,
        uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode>;
}

impl<T: AttrHandler> AttrHandler for &mut T {
    async fn read(
        &mut self,
        uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        (**self).read(uuid, handle, offset, data).await
    }

    async fn write(
        &mut self,
        uuid: &Uuid,
        handle: Handle,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode> {
        (**self).write(uuid, handle, offset, data, kind).await
    }
}

struct ServerState {
    mtu: u16,
    prepare_queue: PrepareWriteQueue,
}

/// The ATT server state machine for one connection.
///
/// Binds a bearer and a shared attribute database. Inbound request PDUs are
/// consumed by [`process`](Self::process) (usually via [`run`](Self::run)),
/// authorized against the link security and answered on the bearer. Outbound
/// updates are emitted with [`notify`](Self::notify) and
/// [`indicate`](Self::indicate).
pub struct AttributeServer<'d, M: RawMutex, B: AttBearer, const MAX: usize> {
    db: &'d AttributeDatabase<M, MAX>,
    bearer: B,
    peer: PeerId,
    state: BlockingMutex<M, RefCell<ServerState>>,
    /// Serializes outbound indications; held while one is unconfirmed.
    indications: Mutex<M, ()>,
    confirmation: Signal<M, ()>,
}

impl<'d, M: RawMutex, B: AttBearer, const MAX: usize> AttributeServer<'d, M, B, MAX> {
    /// Create a server for the connection to `peer` over `bearer`.
    pub fn new(db: &'d AttributeDatabase<M, MAX>, bearer: B, peer: PeerId) -> Self {
        Self {
            db,
            bearer,
            peer,
            state: BlockingMutex::new(RefCell::new(ServerState {
                mtu: LE_MIN_MTU,
                prepare_queue: PrepareWriteQueue::new(),
            })),
            indications: Mutex::new(()),
            confirmation: Signal::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The MTU currently in effect on this bearer.
    pub fn mtu(&self) -> u16 {
        self.state.lock(|s| s.borrow().mtu)
    }

    pub fn bearer(&self) -> &B {
        &self.bearer
    }

    /// Pump the bearer: receive PDUs, process them, send the responses.
    ///
    /// Returns when the bearer reports a transport error. Processing errors
    /// (such as undecodable PDUs) are logged and do not end the loop.
    pub async fn run<T: AttrHandler>(&self, handler: &mut T) -> Result<(), BleHostError<B::Error>> {
        let mut rx = [0u8; config::PREFERRED_ATT_MTU as usize];
        let mut tx = [0u8; config::PREFERRED_ATT_MTU as usize];
        loop {
            let len = self
                .bearer
                .receive(&mut rx)
                .await
                .map_err(BleHostError::Bearer)?;
            if len == 0 {
                continue;
            }
            match self.process(&rx[..len], &mut tx, handler).await {
                Ok(Some(n)) => self.bearer.send(&tx[..n]).await.map_err(BleHostError::Bearer)?,
                Ok(None) => {}
                Err(e) => warn!("[att] error processing request: {:?}", e),
            }
        }
    }

    /// Process one inbound PDU and encode any response into `rsp`.
    ///
    /// Returns the length of the response to send, or `None` when the PDU
    /// produces no response (commands, confirmations, malformed commands).
    pub async fn process<T: AttrHandler>(
        &self,
        pdu: &[u8],
        rsp: &mut [u8],
        handler: &mut T,
    ) -> Result<Option<usize>, Error> {
        let req = match AttReq::decode(pdu) {
            Ok(req) => req,
            Err(err) => {
                if err.is_silent() {
                    trace!("[att] dropping undecodable pdu: {:?}", err);
                    return Ok(None);
                }
                let code = match err {
                    DecodeError::UnsupportedOpcode { .. } => AttErrorCode::RequestNotSupported,
                    _ => AttErrorCode::InvalidPdu,
                };
                let w = WriteCursor::new(rsp);
                return Ok(Some(Self::error_response(w, err.opcode(), 0, code)?));
            }
        };

        // Cap the response to the MTU in effect when the request arrived.
        let mtu = self.mtu() as usize;
        let buf_len = rsp.len().min(mtu);
        let buf = &mut rsp[..buf_len];

        let len = match req {
            AttReq::ExchangeMtu { mtu } => self.handle_exchange_mtu(buf, mtu)?,
            AttReq::FindInformation { start, end } => {
                self.handle_find_information(buf, start, end).await?
            }
            AttReq::FindByTypeValue {
                start,
                end,
                att_type,
                att_value,
            } => {
                self.handle_find_by_type_value(buf, start, end, att_type, att_value)
                    .await?
            }
            AttReq::ReadByType {
                start,
                end,
                att_type,
            } => {
                self.handle_read_by_type(buf, start, end, att_type, handler)
                    .await?
            }
            AttReq::ReadByGroupType {
                start,
                end,
                group_type,
            } => {
                self.handle_read_by_group_type(buf, start, end, group_type)
                    .await?
            }
            AttReq::Read { handle } => self.handle_read(buf, handle, handler).await?,
            AttReq::ReadBlob { handle, offset } => {
                self.handle_read_blob(buf, handle, offset, handler).await?
            }
            AttReq::Write { handle, data } => {
                self.handle_write_req(buf, handle, data, handler).await?
            }
            AttReq::WriteCmd { handle, data } => {
                self.handle_write_cmd(handle, data, handler).await;
                return Ok(None);
            }
            AttReq::PrepareWrite {
                handle,
                offset,
                value,
            } => self.handle_prepare_write(buf, handle, offset, value)?,
            AttReq::ExecuteWrite { flags } => {
                self.handle_execute_write(buf, flags, handler).await?
            }
            AttReq::Confirmation => {
                self.handle_confirmation();
                return Ok(None);
            }
        };
        Ok(Some(len))
    }

    /// Emit a Notification PDU carrying `value`, truncated to the MTU.
    pub async fn notify(&self, handle: Handle, value: &[u8]) -> Result<(), BleHostError<B::Error>> {
        let mut buf = [0u8; config::PREFERRED_ATT_MTU as usize];
        let mtu = self.mtu() as usize;
        let mut w = WriteCursor::new(&mut buf[..mtu]);
        w.write(ATT_HANDLE_VALUE_NTF)?;
        w.write(handle)?;
        let take = value.len().min(w.available());
        w.append(&value[..take])?;
        self.bearer.send(w.finish()).await.map_err(BleHostError::Bearer)
    }

    /// Emit an Indication PDU carrying `value` and wait for the peer's
    /// Confirmation.
    ///
    /// At most one indication is outstanding per bearer; concurrent callers
    /// queue in order. Fails with [`Error::Timeout`] when no Confirmation
    /// arrives within the ATT transaction timeout, after which the link is
    /// expected to be torn down.
    pub async fn indicate(&self, handle: Handle, value: &[u8]) -> Result<(), BleHostError<B::Error>> {
        let _outstanding = self.indications.lock().await;
        self.confirmation.reset();

        let mut buf = [0u8; config::PREFERRED_ATT_MTU as usize];
        let mtu = self.mtu() as usize;
        let mut w = WriteCursor::new(&mut buf[..mtu]);
        w.write(ATT_HANDLE_VALUE_IND)?;
        w.write(handle)?;
        let take = value.len().min(w.available());
        w.append(&value[..take])?;
        self.bearer.send(w.finish()).await.map_err(BleHostError::Bearer)?;

        with_timeout(TRANSACTION_TIMEOUT, self.confirmation.wait())
            .await
            .map_err(|_| Error::Timeout)?;
        Ok(())
    }

    fn take_prepare_queue(&self) -> PrepareWriteQueue {
        self.state.lock(|s| {
            core::mem::replace(&mut s.borrow_mut().prepare_queue, PrepareWriteQueue::new())
        })
    }

    fn handle_confirmation(&self) {
        if self.indications.try_lock().is_ok() {
            warn!("[att] unexpected confirmation");
            return;
        }
        self.confirmation.signal(());
    }

    fn error_response(
        mut w: WriteCursor<'_>,
        request: u8,
        handle: Handle,
        code: AttErrorCode,
    ) -> Result<usize, codec::Error> {
        w.reset();
        w.write(ATT_ERROR_RSP)?;
        w.write(request)?;
        w.write(handle)?;
        w.write(code as u8)?;
        Ok(w.len())
    }

    fn handle_exchange_mtu(&self, buf: &mut [u8], client_mtu: u16) -> Result<usize, Error> {
        let server_mtu = config::PREFERRED_ATT_MTU;
        let mut w = WriteCursor::new(buf);
        w.write(ATT_EXCHANGE_MTU_RSP)?;
        w.write(server_mtu)?;

        let mtu = client_mtu.min(server_mtu).max(LE_MIN_MTU);
        self.state.lock(|s| s.borrow_mut().mtu = mtu);
        debug!("[att] mtu exchange: client {}, effective {}", client_mtu, mtu);
        Ok(w.len())
    }

    async fn handle_find_information(
        &self,
        buf: &mut [u8],
        start: Handle,
        end: Handle,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        if start == 0 || start > end {
            return Ok(Self::error_response(
                w,
                ATT_FIND_INFORMATION_REQ,
                start,
                AttErrorCode::InvalidHandle,
            )?);
        }

        let (mut header, mut body) = w.split(2)?;
        let mut format = 0u8;
        {
            let db = self.db.lock().await;
            let mut it = db.iter(start, end, None, false);
            while let Some(att) = it.next() {
                // Entries must share one UUID size; the first match fixes it.
                if format == 0 {
                    format = att.att_type().format();
                } else if att.att_type().format() != format {
                    break;
                }
                if body.available() < 2 + att.att_type().compact_size() {
                    break;
                }
                body.write(att.handle())?;
                body.append(att.att_type().as_raw())?;
            }
        }

        if body.is_empty() {
            return Ok(Self::error_response(
                w,
                ATT_FIND_INFORMATION_REQ,
                start,
                AttErrorCode::AttributeNotFound,
            )?);
        }
        header.write(ATT_FIND_INFORMATION_RSP)?;
        header.write(format)?;
        Ok(header.len() + body.len())
    }

    async fn handle_find_by_type_value(
        &self,
        buf: &mut [u8],
        start: Handle,
        end: Handle,
        att_type: u16,
        att_value: &[u8],
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        if start == 0 || start > end {
            return Ok(Self::error_response(
                w,
                ATT_FIND_BY_TYPE_VALUE_REQ,
                start,
                AttErrorCode::InvalidHandle,
            )?);
        }

        w.write(ATT_FIND_BY_TYPE_VALUE_RSP)?;
        {
            let db = self.db.lock().await;
            let mut it = db.iter(start, end, Some(Uuid::new_short(att_type)), false);
            while let Some(att) = it.next() {
                // Dynamic values never match a Find By Type Value request.
                let Some(value) = att.value() else {
                    continue;
                };
                if value != att_value {
                    continue;
                }
                if w.available() < 4 {
                    break;
                }
                let group_end = match db.grouping_containing(att.handle()) {
                    Some(g) if g.active() => g.end_handle(),
                    _ => att.handle(),
                };
                w.write(att.handle())?;
                w.write(group_end)?;
            }
        }

        if w.len() > 1 {
            Ok(w.len())
        } else {
            Ok(Self::error_response(
                w,
                ATT_FIND_BY_TYPE_VALUE_REQ,
                start,
                AttErrorCode::AttributeNotFound,
            )?)
        }
    }

    async fn handle_read_by_type<T: AttrHandler>(
        &self,
        buf: &mut [u8],
        start: Handle,
        end: Handle,
        att_type: Uuid,
        handler: &mut T,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        if start == 0 || start > end {
            return Ok(Self::error_response(
                w,
                ATT_READ_BY_TYPE_REQ,
                start,
                AttErrorCode::InvalidHandle,
            )?);
        }

        let (mut header, mut body) = w.split(2)?;
        let db = self.db.lock().await;
        let security = self.bearer.security();

        let mut entries = 0usize;
        let mut entry_size = 0usize;
        // Untruncated value length every static entry must share.
        let mut value_size = 0usize;
        let mut refused: Option<AttErrorCode> = None;
        let mut dynamic: Option<(Handle, Uuid)> = None;

        {
            let mut it = db.iter(start, end, Some(att_type), false);
            while let Some(att) = it.next() {
                if let Err(code) = check_read_permissions(att.read_reqs(), &security) {
                    // An error only if this would have been the first result;
                    // otherwise stop and return what was accumulated.
                    if entries == 0 {
                        refused = Some(code);
                    }
                    break;
                }
                let Some(value) = att.value() else {
                    if entries == 0 {
                        dynamic = Some((att.handle(), att.att_type().clone()));
                    }
                    break;
                };
                if entries == 0 {
                    value_size = value.len();
                    let take = value_size
                        .min(MAX_READ_BY_TYPE_VALUE_LENGTH)
                        .min(body.available().saturating_sub(2));
                    entry_size = 2 + take;
                    body.write(att.handle())?;
                    body.append(&value[..take])?;
                } else {
                    if value.len() != value_size || body.available() < entry_size {
                        break;
                    }
                    body.write(att.handle())?;
                    body.append(&value[..entry_size - 2])?;
                }
                entries += 1;
            }
        }

        if let Some((handle, uuid)) = dynamic {
            // A dynamic first match produces exactly one handler-read entry.
            body.write(handle)?;
            let cap = body.available().min(MAX_READ_BY_TYPE_VALUE_LENGTH);
            let read_buf = &mut body.write_buf()[..cap];
            match handler.read(&uuid, handle, 0, read_buf).await {
                Ok(n) => {
                    body.commit(n)?;
                    entry_size = 2 + n;
                    entries = 1;
                }
                Err(code) => {
                    return Ok(Self::error_response(w, ATT_READ_BY_TYPE_REQ, handle, code)?);
                }
            }
        }

        if entries == 0 {
            let code = refused.unwrap_or(AttErrorCode::AttributeNotFound);
            return Ok(Self::error_response(w, ATT_READ_BY_TYPE_REQ, start, code)?);
        }
        header.write(ATT_READ_BY_TYPE_RSP)?;
        header.write(entry_size as u8)?;
        Ok(header.len() + body.len())
    }

    async fn handle_read_by_group_type(
        &self,
        buf: &mut [u8],
        start: Handle,
        end: Handle,
        group_type: Uuid,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        if start == 0 || start > end {
            return Ok(Self::error_response(
                w,
                ATT_READ_BY_GROUP_TYPE_REQ,
                start,
                AttErrorCode::InvalidHandle,
            )?);
        }
        if group_type != PRIMARY_SERVICE_UUID16 && group_type != SECONDARY_SERVICE_UUID16 {
            return Ok(Self::error_response(
                w,
                ATT_READ_BY_GROUP_TYPE_REQ,
                start,
                AttErrorCode::UnsupportedGroupType,
            )?);
        }

        let (mut header, mut body) = w.split(2)?;
        let db = self.db.lock().await;
        let security = self.bearer.security();

        let mut entries = 0usize;
        let mut entry_size = 0usize;
        let mut value_size = 0usize;
        let mut refused: Option<AttErrorCode> = None;

        {
            let mut it = db.iter(start, end, Some(group_type), true);
            while let Some(att) = it.next() {
                if let Err(code) = check_read_permissions(att.read_reqs(), &security) {
                    if entries == 0 {
                        refused = Some(code);
                    }
                    break;
                }
                // Declaration attributes always carry a static value.
                let Some(value) = att.value() else {
                    break;
                };
                let Some(grouping) = db.grouping_containing(att.handle()) else {
                    break;
                };
                if entries == 0 {
                    value_size = value.len();
                    let take = value_size
                        .min(MAX_READ_BY_GROUP_TYPE_VALUE_LENGTH)
                        .min(body.available().saturating_sub(4));
                    entry_size = 4 + take;
                } else if value.len() != value_size || body.available() < entry_size {
                    break;
                }
                body.write(grouping.start_handle())?;
                body.write(grouping.end_handle())?;
                body.append(&value[..entry_size - 4])?;
                entries += 1;
            }
        }

        if entries == 0 {
            let code = refused.unwrap_or(AttErrorCode::AttributeNotFound);
            return Ok(Self::error_response(w, ATT_READ_BY_GROUP_TYPE_REQ, start, code)?);
        }
        header.write(ATT_READ_BY_GROUP_TYPE_RSP)?;
        header.write(entry_size as u8)?;
        Ok(header.len() + body.len())
    }

    async fn handle_read<T: AttrHandler>(
        &self,
        buf: &mut [u8],
        handle: Handle,
        handler: &mut T,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        let db = self.db.lock().await;
        let Some(att) = db.find_attribute(handle) else {
            return Ok(Self::error_response(
                w,
                ATT_READ_REQ,
                handle,
                AttErrorCode::InvalidHandle,
            )?);
        };
        if let Err(code) = check_read_permissions(att.read_reqs(), &self.bearer.security()) {
            return Ok(Self::error_response(w, ATT_READ_REQ, handle, code)?);
        }

        w.write(ATT_READ_RSP)?;
        match att.value() {
            Some(value) => {
                let take = value.len().min(w.available());
                w.append(&value[..take])?;
            }
            None => {
                let uuid = att.att_type().clone();
                match handler.read(&uuid, handle, 0, w.write_buf()).await {
                    Ok(n) => w.commit(n)?,
                    Err(code) => {
                        return Ok(Self::error_response(w, ATT_READ_REQ, handle, code)?);
                    }
                }
            }
        }
        Ok(w.len())
    }

    async fn handle_read_blob<T: AttrHandler>(
        &self,
        buf: &mut [u8],
        handle: Handle,
        offset: u16,
        handler: &mut T,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        let db = self.db.lock().await;
        let Some(att) = db.find_attribute(handle) else {
            return Ok(Self::error_response(
                w,
                ATT_READ_BLOB_REQ,
                handle,
                AttErrorCode::InvalidHandle,
            )?);
        };
        if let Err(code) = check_read_permissions(att.read_reqs(), &self.bearer.security()) {
            return Ok(Self::error_response(w, ATT_READ_BLOB_REQ, handle, code)?);
        }

        w.write(ATT_READ_BLOB_RSP)?;
        match att.value() {
            Some(value) => {
                let offset = offset as usize;
                if offset >= value.len() {
                    return Ok(Self::error_response(
                        w,
                        ATT_READ_BLOB_REQ,
                        handle,
                        AttErrorCode::InvalidOffset,
                    )?);
                }
                let take = (value.len() - offset).min(w.available());
                w.append(&value[offset..offset + take])?;
            }
            None => {
                let uuid = att.att_type().clone();
                match handler.read(&uuid, handle, offset, w.write_buf()).await {
                    Ok(n) => w.commit(n)?,
                    Err(code) => {
                        return Ok(Self::error_response(w, ATT_READ_BLOB_REQ, handle, code)?);
                    }
                }
            }
        }
        Ok(w.len())
    }

    async fn handle_write_req<T: AttrHandler>(
        &self,
        buf: &mut [u8],
        handle: Handle,
        data: &[u8],
        handler: &mut T,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        let db = self.db.lock().await;
        let Some(att) = db.find_attribute(handle) else {
            return Ok(Self::error_response(
                w,
                ATT_WRITE_REQ,
                handle,
                AttErrorCode::InvalidHandle,
            )?);
        };
        if let Err(code) = check_write_permissions(att.write_reqs(), &self.bearer.security()) {
            return Ok(Self::error_response(w, ATT_WRITE_REQ, handle, code)?);
        }
        // Attributes with a static value cannot be written.
        if !att.is_dynamic() {
            return Ok(Self::error_response(
                w,
                ATT_WRITE_REQ,
                handle,
                AttErrorCode::WriteNotPermitted,
            )?);
        }
        if data.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
            return Ok(Self::error_response(
                w,
                ATT_WRITE_REQ,
                handle,
                AttErrorCode::InvalidAttributeValueLength,
            )?);
        }

        let uuid = att.att_type().clone();
        match handler.write(&uuid, handle, 0, data, WriteKind::Request).await {
            Ok(()) => {
                w.write(ATT_WRITE_RSP)?;
                Ok(w.len())
            }
            Err(code) => Ok(Self::error_response(w, ATT_WRITE_REQ, handle, code)?),
        }
    }

    async fn handle_write_cmd<T: AttrHandler>(&self, handle: Handle, data: &[u8], handler: &mut T) {
        let db = self.db.lock().await;
        let Some(att) = db.find_attribute(handle) else {
            return;
        };
        if check_write_permissions(att.write_reqs(), &self.bearer.security()).is_err() {
            return;
        }
        if !att.is_dynamic() || data.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
            return;
        }
        let uuid = att.att_type().clone();
        // Commands never carry a response; any error is dropped.
        let _ = handler.write(&uuid, handle, 0, data, WriteKind::Command).await;
    }

    fn handle_prepare_write(
        &self,
        buf: &mut [u8],
        handle: Handle,
        offset: u16,
        value: &[u8],
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        let Some(entry) = QueuedWrite::new(handle, offset, value) else {
            return Ok(Self::error_response(
                w,
                ATT_PREPARE_WRITE_REQ,
                handle,
                AttErrorCode::InvalidAttributeValueLength,
            )?);
        };
        let queued = self
            .state
            .lock(|s| s.borrow_mut().prepare_queue.push_back(entry).is_ok());
        if !queued {
            return Ok(Self::error_response(
                w,
                ATT_PREPARE_WRITE_REQ,
                handle,
                AttErrorCode::PrepareQueueFull,
            )?);
        }

        w.write(ATT_PREPARE_WRITE_RSP)?;
        w.write(handle)?;
        w.write(offset)?;
        w.append(value)?;
        Ok(w.len())
    }

    async fn handle_execute_write<T: AttrHandler>(
        &self,
        buf: &mut [u8],
        flags: u8,
        handler: &mut T,
    ) -> Result<usize, Error> {
        let mut w = WriteCursor::new(buf);
        match flags {
            EXECUTE_WRITE_CANCEL_ALL => {
                self.take_prepare_queue();
                w.write(ATT_EXECUTE_WRITE_RSP)?;
                Ok(w.len())
            }
            EXECUTE_WRITE_PENDING => {
                let queue = self.take_prepare_queue();
                let result = self
                    .db
                    .execute_write_queue(self.peer, queue, self.bearer.security(), handler)
                    .await;
                match result {
                    Ok(()) => {
                        w.write(ATT_EXECUTE_WRITE_RSP)?;
                        Ok(w.len())
                    }
                    Err((handle, code)) => {
                        Ok(Self::error_response(w, ATT_EXECUTE_WRITE_REQ, handle, code)?)
                    }
                }
            }
            _ => Ok(Self::error_response(
                w,
                ATT_EXECUTE_WRITE_REQ,
                0,
                AttErrorCode::InvalidPdu,
            )?),
        }
    }
}
