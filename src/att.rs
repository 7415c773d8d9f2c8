//! Attribute protocol opcodes, error codes and request decoding.

use embassy_time::Duration;

use crate::cursor::ReadCursor;
use crate::types::uuid::Uuid;

/// A server identifies each attribute with a 16-bit handle.
pub type Handle = u16;

pub const INVALID_HANDLE: Handle = 0x0000;
pub const HANDLE_MIN: Handle = 0x0001;
pub const HANDLE_MAX: Handle = 0xFFFF;

/// Minimum ATT MTU on LE links.
pub const LE_MIN_MTU: u16 = 23;

/// Minimum ATT MTU on BR/EDR links.
pub const BREDR_MIN_MTU: u16 = 48;

/// The maximum length of an attribute value.
pub const MAX_ATTRIBUTE_VALUE_LENGTH: usize = 512;

/// Longest attribute value that fits a Read By Type response entry.
pub const MAX_READ_BY_TYPE_VALUE_LENGTH: usize = 253;

/// Longest attribute value that fits a Read By Group Type response entry.
pub const MAX_READ_BY_GROUP_TYPE_VALUE_LENGTH: usize = 251;

/// The ATT transaction timeout.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Opcode bit flagging an authentication signature suffix.
pub const AUTH_SIGNATURE_FLAG: u8 = 0x80;

/// Opcode bit flagging a command (no response expected).
pub const COMMAND_FLAG: u8 = 0x40;

pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub const ATT_FIND_INFORMATION_REQ: u8 = 0x04;
pub const ATT_FIND_INFORMATION_RSP: u8 = 0x05;
pub const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub const ATT_READ_REQ: u8 = 0x0A;
pub const ATT_READ_RSP: u8 = 0x0B;
pub const ATT_READ_BLOB_REQ: u8 = 0x0C;
pub const ATT_READ_BLOB_RSP: u8 = 0x0D;
pub const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1D;
pub const ATT_HANDLE_VALUE_CFM: u8 = 0x1E;
pub const ATT_WRITE_CMD: u8 = 0x52;

/// Execute Write Request flag: discard the prepare queue.
pub const EXECUTE_WRITE_CANCEL_ALL: u8 = 0x00;

/// Execute Write Request flag: commit the prepare queue.
pub const EXECUTE_WRITE_PENDING: u8 = 0x01;

/// ATT protocol error codes carried in an Error Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AttErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    AttributeNotFound = 0x0A,
    AttributeNotLong = 0x0B,
    InsufficientEncryptionKeySize = 0x0C,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    InsufficientEncryption = 0x0F,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
}

/// A decoded inbound ATT PDU the server knows how to process.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttReq<'d> {
    ExchangeMtu {
        mtu: u16,
    },
    FindInformation {
        start: Handle,
        end: Handle,
    },
    FindByTypeValue {
        start: Handle,
        end: Handle,
        att_type: u16,
        att_value: &'d [u8],
    },
    ReadByType {
        start: Handle,
        end: Handle,
        att_type: Uuid,
    },
    ReadByGroupType {
        start: Handle,
        end: Handle,
        group_type: Uuid,
    },
    Read {
        handle: Handle,
    },
    ReadBlob {
        handle: Handle,
        offset: u16,
    },
    Write {
        handle: Handle,
        data: &'d [u8],
    },
    WriteCmd {
        handle: Handle,
        data: &'d [u8],
    },
    PrepareWrite {
        handle: Handle,
        offset: u16,
        value: &'d [u8],
    },
    ExecuteWrite {
        flags: u8,
    },
    Confirmation,
}

/// Why an inbound PDU could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The PDU did not carry an opcode octet.
    Empty,
    /// The opcode is known but the payload length is wrong for it.
    InvalidPdu { opcode: u8 },
    /// The opcode is not part of the supported set, or the PDU carries an
    /// authentication signature.
    UnsupportedOpcode { opcode: u8 },
}

impl<'d> AttReq<'d> {
    /// Decode one inbound PDU, validating the payload length against the
    /// opcode's fixed or minimum length.
    pub fn decode(pdu: &'d [u8]) -> Result<AttReq<'d>, DecodeError> {
        let (&opcode, payload) = pdu.split_first().ok_or(DecodeError::Empty)?;

        // Authentication signatures are not supported by this server.
        if opcode & AUTH_SIGNATURE_FLAG != 0 {
            return Err(DecodeError::UnsupportedOpcode { opcode });
        }

        let invalid = DecodeError::InvalidPdu { opcode };
        let mut r = ReadCursor::new(payload);
        let req = match opcode {
            ATT_EXCHANGE_MTU_REQ => {
                Self::check_len(payload, 2, 2).ok_or(invalid)?;
                AttReq::ExchangeMtu {
                    mtu: r.read().map_err(|_| invalid)?,
                }
            }
            ATT_FIND_INFORMATION_REQ => {
                Self::check_len(payload, 4, 4).ok_or(invalid)?;
                AttReq::FindInformation {
                    start: r.read().map_err(|_| invalid)?,
                    end: r.read().map_err(|_| invalid)?,
                }
            }
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                Self::check_len(payload, 6, usize::MAX).ok_or(invalid)?;
                AttReq::FindByTypeValue {
                    start: r.read().map_err(|_| invalid)?,
                    end: r.read().map_err(|_| invalid)?,
                    att_type: r.read().map_err(|_| invalid)?,
                    att_value: r.remaining(),
                }
            }
            ATT_READ_BY_TYPE_REQ | ATT_READ_BY_GROUP_TYPE_REQ => {
                if payload.len() != 6 && payload.len() != 20 {
                    return Err(invalid);
                }
                let start = r.read().map_err(|_| invalid)?;
                let end = r.read().map_err(|_| invalid)?;
                let uuid = Uuid::from_slice(r.remaining()).map_err(|_| invalid)?;
                if opcode == ATT_READ_BY_TYPE_REQ {
                    AttReq::ReadByType {
                        start,
                        end,
                        att_type: uuid,
                    }
                } else {
                    AttReq::ReadByGroupType {
                        start,
                        end,
                        group_type: uuid,
                    }
                }
            }
            ATT_READ_REQ => {
                Self::check_len(payload, 2, 2).ok_or(invalid)?;
                AttReq::Read {
                    handle: r.read().map_err(|_| invalid)?,
                }
            }
            ATT_READ_BLOB_REQ => {
                Self::check_len(payload, 4, 4).ok_or(invalid)?;
                AttReq::ReadBlob {
                    handle: r.read().map_err(|_| invalid)?,
                    offset: r.read().map_err(|_| invalid)?,
                }
            }
            ATT_WRITE_REQ => {
                Self::check_len(payload, 2, usize::MAX).ok_or(invalid)?;
                AttReq::Write {
                    handle: r.read().map_err(|_| invalid)?,
                    data: r.remaining(),
                }
            }
            ATT_WRITE_CMD => {
                Self::check_len(payload, 2, usize::MAX).ok_or(invalid)?;
                AttReq::WriteCmd {
                    handle: r.read().map_err(|_| invalid)?,
                    data: r.remaining(),
                }
            }
            ATT_PREPARE_WRITE_REQ => {
                Self::check_len(payload, 4, usize::MAX).ok_or(invalid)?;
                AttReq::PrepareWrite {
                    handle: r.read().map_err(|_| invalid)?,
                    offset: r.read().map_err(|_| invalid)?,
                    value: r.remaining(),
                }
            }
            ATT_EXECUTE_WRITE_REQ => {
                Self::check_len(payload, 1, 1).ok_or(invalid)?;
                AttReq::ExecuteWrite {
                    flags: r.read().map_err(|_| invalid)?,
                }
            }
            ATT_HANDLE_VALUE_CFM => {
                Self::check_len(payload, 0, 0).ok_or(invalid)?;
                AttReq::Confirmation
            }
            _ => return Err(DecodeError::UnsupportedOpcode { opcode }),
        };
        Ok(req)
    }

    fn check_len(payload: &[u8], min: usize, max: usize) -> Option<()> {
        (payload.len() >= min && payload.len() <= max).then_some(())
    }
}

impl DecodeError {
    /// The opcode the error refers to, zero when none was present.
    pub fn opcode(&self) -> u8 {
        match self {
            DecodeError::Empty => 0,
            DecodeError::InvalidPdu { opcode } => *opcode,
            DecodeError::UnsupportedOpcode { opcode } => *opcode,
        }
    }

    /// Whether the offending PDU must not be answered at all.
    pub fn is_silent(&self) -> bool {
        match self {
            DecodeError::Empty => true,
            DecodeError::InvalidPdu { opcode } | DecodeError::UnsupportedOpcode { opcode } => {
                *opcode & COMMAND_FLAG != 0 || *opcode == ATT_HANDLE_VALUE_CFM
            }
        }
    }
}
