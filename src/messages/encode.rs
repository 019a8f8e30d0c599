//! Low-level writers for the protobuf wire format used on the IDSCP2 channel.
//!
//! Only the two wire types the protocol needs are provided: varint (0) and
//! length-delimited (2). Fields holding their proto3 default value are
//! omitted, which keeps records byte-compatible with the deployed peers.

const WIRE_VARINT: u32 = 0;
const WIRE_LEN: u32 = 2;

pub(super) fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn encode_key(field: u32, wire_type: u32, out: &mut Vec<u8>) {
    encode_varint(u64::from(field << 3 | wire_type), out);
}

/// Write a varint field, omitting it when the value is zero.
pub(super) fn encode_u64_field(field: u32, value: u64, out: &mut Vec<u8>) {
    if value == 0 {
        return;
    }
    encode_key(field, WIRE_VARINT, out);
    encode_varint(value, out);
}

pub(super) fn encode_bool_field(field: u32, value: bool, out: &mut Vec<u8>) {
    encode_u64_field(field, u64::from(value), out);
}

/// Write a length-delimited field, omitting it when the payload is empty.
pub(super) fn encode_bytes_field(field: u32, value: &[u8], out: &mut Vec<u8>) {
    if value.is_empty() {
        return;
    }
    encode_len_field(field, value, out);
}

/// Write a length-delimited field even when the payload is empty. Used for
/// nested messages whose presence itself is meaningful.
pub(super) fn encode_len_field(field: u32, value: &[u8], out: &mut Vec<u8>) {
    encode_key(field, WIRE_LEN, out);
    encode_varint(value.len() as u64, out);
    out.extend_from_slice(value);
}

pub(super) fn encode_str_fields(field: u32, values: &[String], out: &mut Vec<u8>) {
    for value in values {
        encode_len_field(field, value.as_bytes(), out);
    }
}
