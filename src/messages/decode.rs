//! Low-level readers for the protobuf wire format used on the IDSCP2 channel.
//!
//! All readers operate on a `&mut &[u8]` cursor and forward it past the
//! consumed bytes. Unknown fields inside a sub-message are skipped so that
//! records from newer peers still decode.

use super::error::DecodeError;

pub(super) const WIRE_VARINT: u32 = 0;
pub(super) const WIRE_LEN: u32 = 2;

pub(super) fn decode_varint(stream: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    for (i, byte) in stream.iter().enumerate() {
        // 10 bytes encode up to 64 bits
        if i == 10 {
            return Err(DecodeError::InvalidVarint);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *stream = &stream[i + 1..];
            return Ok(value);
        }
    }
    Err(DecodeError::InvalidVarint)
}

/// Read a field key, returning `(field_number, wire_type)`.
pub(super) fn decode_key(stream: &mut &[u8]) -> Result<(u32, u32), DecodeError> {
    let key = decode_varint(stream)?;
    let field = u32::try_from(key >> 3).map_err(|_| DecodeError::InvalidVarint)?;
    Ok((field, (key & 0x7) as u32))
}

pub(super) fn decode_len_payload<'a>(stream: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let len = decode_varint(stream)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEnd)?;
    if stream.len() < len {
        return Err(DecodeError::UnexpectedEnd);
    }
    let (payload, rest) = stream.split_at(len);
    *stream = rest;
    Ok(payload)
}

pub(super) fn decode_string(stream: &mut &[u8]) -> Result<String, DecodeError> {
    let payload = decode_len_payload(stream)?;
    String::from_utf8(payload.to_vec()).map_err(|_| DecodeError::InvalidString)
}

pub(super) fn decode_bool(stream: &mut &[u8]) -> Result<bool, DecodeError> {
    Ok(decode_varint(stream)? != 0)
}

/// Skip over a field of the given wire type without interpreting it.
pub(super) fn skip_field(wire_type: u32, stream: &mut &[u8]) -> Result<(), DecodeError> {
    match wire_type {
        WIRE_VARINT => {
            decode_varint(stream)?;
        }
        WIRE_LEN => {
            decode_len_payload(stream)?;
        }
        other => return Err(DecodeError::UnsupportedWireType(other)),
    }
    Ok(())
}
