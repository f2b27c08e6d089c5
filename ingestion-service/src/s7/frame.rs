//! ISO-on-TCP framing and the handful of S7 PDUs the client needs.
//!
//! Layering on the wire:
//!
//! ```text
//! TPKT (4 bytes) | COTP (3 bytes for DT, 18 for CR) | S7 header | params | data
//! ```
//!
//! `TpktCodec` strips/adds the TPKT header; everything above it is built and
//! parsed by the free functions in this module.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;

const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: [u8; 3] = [0x02, 0xF0, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const ACK_HEADER_LEN: usize = 12;

const FN_SETUP_COMMUNICATION: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;
const AREA_DB: u8 = 0x84;
const TRANSPORT_BYTE: u8 = 0x02;
/// Data item transport size for byte/word/dword payloads, length in bits.
const DATA_BYTE_BITS: u8 = 0x04;
const ITEM_OK: u8 = 0xFF;
const JOB_HEADER_LEN: usize = 10;
const ITEM_PARAMS_LEN: usize = 14;

/// Bytes of a read response that are not payload: ack header, the two
/// parameter bytes and the four-byte data item header.
pub const READ_OVERHEAD: usize = ACK_HEADER_LEN + 2 + 4;

/// Bytes of a write request that are not payload: job header, item
/// parameters and the four-byte data item header.
pub const WRITE_OVERHEAD: usize = JOB_HEADER_LEN + ITEM_PARAMS_LEN + 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("device rejected request: error class {class:#04x}, code {code:#04x}")]
    Rejected { class: u8, code: u8 },
    #[error("item failed with return code {0:#04x}")]
    ItemFailed(u8),
}

/// Length-prefixed TPKT framing (RFC 1006).
#[derive(Debug, Default, Clone, Copy)]
pub struct TpktCodec;

impl Decoder for TpktCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < TPKT_HEADER_LEN {
            return Ok(None);
        }
        if src[0] != TPKT_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected TPKT version {:#04x}", src[0]),
            ));
        }

        let len = usize::from(u16::from_be_bytes([src[2], src[3]]));
        if len < TPKT_HEADER_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("TPKT length {len} shorter than its header"),
            ));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        frame.advance(TPKT_HEADER_LEN);
        Ok(Some(frame.freeze()))
    }
}

impl Encoder<Bytes> for TpktCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u16::try_from(item.len() + TPKT_HEADER_LEN).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "TPKT payload too large")
        })?;
        dst.reserve(usize::from(len));
        dst.put_u8(TPKT_VERSION);
        dst.put_u8(0);
        dst.put_u16(len);
        dst.put_slice(&item);
        Ok(())
    }
}

/// COTP connection request addressed to the CPU at `rack`/`slot`.
pub fn connection_request(rack: u8, slot: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u8(0x11); // length of the rest of the header
    buf.put_u8(0xE0); // CR
    buf.put_u16(0x0000); // destination reference
    buf.put_u16(0x0001); // source reference
    buf.put_u8(0x00); // class 0
    buf.put_slice(&[0xC0, 0x01, 0x0A]); // TPDU size 1024
    buf.put_slice(&[0xC1, 0x02, 0x01, 0x00]); // source TSAP
    buf.put_slice(&[0xC2, 0x02, 0x01, rack.wrapping_mul(32).wrapping_add(slot)]);
    buf.freeze()
}

pub fn parse_connection_confirm(frame: &[u8]) -> Result<(), FrameError> {
    match frame.get(1) {
        Some(code) if code & 0xF0 == COTP_CONNECT_CONFIRM => Ok(()),
        Some(_) => Err(FrameError::Malformed("expected COTP connection confirm")),
        None => Err(FrameError::Malformed("empty COTP frame")),
    }
}

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(COTP_DATA.len() + JOB_HEADER_LEN + params.len() + data.len());
    buf.put_slice(&COTP_DATA);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(ROSCTR_JOB);
    buf.put_u16(0x0000);
    buf.put_u16(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    buf.put_slice(params);
    buf.put_slice(data);
    buf.freeze()
}

/// Single-item S7ANY address of `length` bytes at `offset` in data block `block`.
fn item_params(function: u8, block: u16, offset: u32, length: u16) -> BytesMut {
    let bit_address = offset * 8;
    let mut params = BytesMut::with_capacity(ITEM_PARAMS_LEN);
    params.put_u8(function);
    params.put_u8(0x01); // one item
    params.put_slice(&[0x12, 0x0A, 0x10]); // variable spec, S7ANY
    params.put_u8(TRANSPORT_BYTE);
    params.put_u16(length);
    params.put_u16(block);
    params.put_u8(AREA_DB);
    params.put_slice(&bit_address.to_be_bytes()[1..]);
    params
}

/// S7 "setup communication" asking for a PDU of `pdu_size` bytes.
pub fn setup_communication(pdu_ref: u16, pdu_size: u16) -> Bytes {
    let mut params = [FN_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01, 0, 0];
    params[6..8].copy_from_slice(&pdu_size.to_be_bytes());
    job(pdu_ref, &params, &[])
}

/// S7 "read var" of `length` bytes at `offset` in data block `block`.
pub fn read_var_request(pdu_ref: u16, block: u16, offset: u32, length: u16) -> Bytes {
    job(pdu_ref, &item_params(FN_READ_VAR, block, offset, length), &[])
}

/// S7 "write var" of `payload` at `offset` in data block `block`.
///
/// Callers keep `payload` within the negotiated PDU (see `WRITE_OVERHEAD`).
pub fn write_var_request(pdu_ref: u16, block: u16, offset: u32, payload: &[u8]) -> Bytes {
    let length = payload.len() as u16;
    let params = item_params(FN_WRITE_VAR, block, offset, length);
    let mut data = BytesMut::with_capacity(4 + payload.len());
    data.put_u8(0x00); // reserved
    data.put_u8(DATA_BYTE_BITS);
    data.put_u16(length * 8);
    data.put_slice(payload);
    job(pdu_ref, &params, &data)
}

/// Ack-data body split into (params, data), after header checks.
fn ack_data(frame: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    let s7 = match frame {
        [0x02, 0xF0, _, rest @ ..] => rest,
        _ => return Err(FrameError::Malformed("expected COTP data frame")),
    };
    if s7.len() < ACK_HEADER_LEN {
        return Err(FrameError::Malformed("S7 header truncated"));
    }
    if s7[0] != S7_PROTOCOL_ID || s7[1] != ROSCTR_ACK_DATA {
        return Err(FrameError::Malformed("expected S7 ack-data"));
    }
    let (class, code) = (s7[10], s7[11]);
    if class != 0 || code != 0 {
        return Err(FrameError::Rejected { class, code });
    }

    let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
    let data_len = usize::from(u16::from_be_bytes([s7[8], s7[9]]));
    let body = &s7[ACK_HEADER_LEN..];
    if body.len() < param_len + data_len {
        return Err(FrameError::Malformed("S7 body shorter than declared"));
    }
    Ok((&body[..param_len], &body[param_len..param_len + data_len]))
}

/// Negotiated PDU size from a setup-communication ack.
pub fn parse_setup_response(frame: &[u8]) -> Result<u16, FrameError> {
    let (params, _) = ack_data(frame)?;
    if params.len() < 8 || params[0] != FN_SETUP_COMMUNICATION {
        return Err(FrameError::Malformed("expected setup-communication parameters"));
    }
    Ok(u16::from_be_bytes([params[6], params[7]]))
}

/// Payload bytes of a single-item read-var ack.
pub fn parse_read_response(frame: &[u8]) -> Result<Bytes, FrameError> {
    let (params, data) = ack_data(frame)?;
    if params.len() < 2 || params[0] != FN_READ_VAR {
        return Err(FrameError::Malformed("expected read-var parameters"));
    }
    if data.len() < 4 {
        return Err(FrameError::Malformed("read item header truncated"));
    }
    if data[0] != ITEM_OK {
        return Err(FrameError::ItemFailed(data[0]));
    }

    let declared = usize::from(u16::from_be_bytes([data[2], data[3]]));
    // Transport sizes 0x03 (bit) and 0x09 (octet string) count bytes; the
    // rest count bits.
    let byte_len = match data[1] {
        0x03 | 0x09 => declared,
        _ => declared / 8,
    };
    let payload = &data[4..];
    if payload.len() < byte_len {
        return Err(FrameError::Malformed("read item shorter than declared"));
    }
    Ok(Bytes::copy_from_slice(&payload[..byte_len]))
}

/// Result of a single-item write-var ack.
pub fn parse_write_response(frame: &[u8]) -> Result<(), FrameError> {
    let (params, data) = ack_data(frame)?;
    if params.len() < 2 || params[0] != FN_WRITE_VAR {
        return Err(FrameError::Malformed("expected write-var parameters"));
    }
    match data.first() {
        Some(&ITEM_OK) => Ok(()),
        Some(&code) => Err(FrameError::ItemFailed(code)),
        None => Err(FrameError::Malformed("write item status missing")),
    }
}
