//! The IDSCP2 message taxonomy and its wire representation.
//!
//! Every record on the secure channel is a `u32` big-endian length prefix
//! followed by one serialized [`IdscpMessage`]. The body uses the protobuf
//! wire format of the deployed protocol; the union tag numbers below are
//! fixed and must never be renumbered. We provide a minimalist encoder and
//! decoder that is sufficient for exactly these messages; this is explicitly
//! not a general protobuf implementation.

mod decode;
mod encode;
pub mod error;

pub use error::DecodeError;

use decode::{
    decode_bool, decode_key, decode_len_payload, decode_string, decode_varint, skip_field,
    WIRE_LEN, WIRE_VARINT,
};
use encode::{
    encode_bool_field, encode_bytes_field, encode_len_field, encode_str_fields, encode_u64_field,
};

/// Union tags of [`IdscpMessage`] on the wire (protobuf field numbers).
const TAG_HELLO: u32 = 1;
const TAG_CLOSE: u32 = 2;
const TAG_DAT_EXPIRED: u32 = 3;
const TAG_DAT: u32 = 4;
const TAG_RE_RA: u32 = 5;
const TAG_RA_PROVER: u32 = 6;
const TAG_RA_VERIFIER: u32 = 7;
const TAG_DATA: u32 = 8;
const TAG_ACK: u32 = 9;

/// Why a peer closed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum CloseCause {
    UserShutdown = 0,
    Timeout = 1,
    HandshakeFailed = 2,
    RaProverFailed = 3,
    RaVerifierFailed = 4,
    DatInvalid = 5,
    Error = 6,
}

impl CloseCause {
    fn from_wire(value: u64) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => CloseCause::UserShutdown,
            1 => CloseCause::Timeout,
            2 => CloseCause::HandshakeFailed,
            3 => CloseCause::RaProverFailed,
            4 => CloseCause::RaVerifierFailed,
            5 => CloseCause::DatInvalid,
            6 => CloseCause::Error,
            other => return Err(DecodeError::InvalidEnumValue(other)),
        })
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let name = match self {
            CloseCause::UserShutdown => "user shutdown",
            CloseCause::Timeout => "timeout",
            CloseCause::HandshakeFailed => "handshake failed",
            CloseCause::RaProverFailed => "ra prover failed",
            CloseCause::RaVerifierFailed => "ra verifier failed",
            CloseCause::DatInvalid => "invalid dat",
            CloseCause::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Opening message of the handshake, sent by both peers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdscpHello {
    /// The sender's dynamic attribute token.
    pub dat: Vec<u8>,
    /// RA suites the sender can run as prover, most preferred first.
    pub supported_ra_suites: Vec<String>,
    /// RA suites the sender accepts from the peer's prover, most preferred first.
    pub expected_ra_suites: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdscpClose {
    pub cause_code: CloseCause,
    pub cause_msg: String,
}

/// One IDSCP2 record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdscpMessage {
    Hello(IdscpHello),
    Close(IdscpClose),
    /// The peer's DAT has run out; it must present a fresh one.
    DatExpired,
    /// A fresh DAT, in response to `DatExpired`.
    Dat { token: Vec<u8> },
    /// Request to repeat remote attestation mid-session.
    ReRa { cause: String },
    /// Payload produced by a prover, consumed by the peer's verifier.
    RaProver { data: Vec<u8> },
    /// Payload produced by a verifier, consumed by the peer's prover.
    RaVerifier { data: Vec<u8> },
    Data {
        payload: Vec<u8>,
        /// Sequence bit of the stop-and-wait ACK mode; always `false` when
        /// the mode is off.
        alternating_bit: bool,
    },
    Ack { alternating_bit: bool },
}

impl IdscpMessage {
    pub fn close(cause_code: CloseCause, cause_msg: impl Into<String>) -> Self {
        IdscpMessage::Close(IdscpClose {
            cause_code,
            cause_msg: cause_msg.into(),
        })
    }

    /// Short variant name for logging.
    pub fn variant(&self) -> &'static str {
        match self {
            IdscpMessage::Hello(_) => "Hello",
            IdscpMessage::Close(_) => "Close",
            IdscpMessage::DatExpired => "DatExpired",
            IdscpMessage::Dat { .. } => "Dat",
            IdscpMessage::ReRa { .. } => "ReRa",
            IdscpMessage::RaProver { .. } => "RaProver",
            IdscpMessage::RaVerifier { .. } => "RaVerifier",
            IdscpMessage::Data { .. } => "Data",
            IdscpMessage::Ack { .. } => "Ack",
        }
    }

    /// Serialize into a record body (without the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            IdscpMessage::Hello(hello) => {
                encode_bytes_field(1, &hello.dat, &mut body);
                encode_str_fields(2, &hello.supported_ra_suites, &mut body);
                encode_str_fields(3, &hello.expected_ra_suites, &mut body);
            }
            IdscpMessage::Close(close) => {
                encode_u64_field(1, close.cause_code as u64, &mut body);
                encode_bytes_field(2, close.cause_msg.as_bytes(), &mut body);
            }
            IdscpMessage::DatExpired => {}
            IdscpMessage::Dat { token } => {
                encode_bytes_field(1, token, &mut body);
            }
            IdscpMessage::ReRa { cause } => {
                encode_bytes_field(1, cause.as_bytes(), &mut body);
            }
            IdscpMessage::RaProver { data } => {
                encode_bytes_field(1, data, &mut body);
            }
            IdscpMessage::RaVerifier { data } => {
                encode_bytes_field(1, data, &mut body);
            }
            IdscpMessage::Data {
                payload,
                alternating_bit,
            } => {
                encode_bytes_field(1, payload, &mut body);
                encode_bool_field(2, *alternating_bit, &mut body);
            }
            IdscpMessage::Ack { alternating_bit } => {
                encode_bool_field(1, *alternating_bit, &mut body);
            }
        }

        let tag = match self {
            IdscpMessage::Hello(_) => TAG_HELLO,
            IdscpMessage::Close(_) => TAG_CLOSE,
            IdscpMessage::DatExpired => TAG_DAT_EXPIRED,
            IdscpMessage::Dat { .. } => TAG_DAT,
            IdscpMessage::ReRa { .. } => TAG_RE_RA,
            IdscpMessage::RaProver { .. } => TAG_RA_PROVER,
            IdscpMessage::RaVerifier { .. } => TAG_RA_VERIFIER,
            IdscpMessage::Data { .. } => TAG_DATA,
            IdscpMessage::Ack { .. } => TAG_ACK,
        };

        let mut record = Vec::with_capacity(body.len() + 4);
        encode_len_field(tag, &body, &mut record);
        record
    }

    /// Parse a record body. An empty body is malformed: every record must
    /// carry exactly one variant.
    pub fn decode(mut record: &[u8]) -> Result<IdscpMessage, DecodeError> {
        if record.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut message = None;
        while !record.is_empty() {
            let (tag, wire_type) = decode_key(&mut record)?;
            if wire_type != WIRE_LEN {
                return Err(DecodeError::UnsupportedWireType(wire_type));
            }
            let mut body = decode_len_payload(&mut record)?;
            // protobuf oneof semantics: the last occurrence wins
            message = Some(match tag {
                TAG_HELLO => decode_hello(&mut body)?,
                TAG_CLOSE => decode_close(&mut body)?,
                TAG_DAT_EXPIRED => {
                    decode_empty(&mut body)?;
                    IdscpMessage::DatExpired
                }
                TAG_DAT => IdscpMessage::Dat {
                    token: decode_single_bytes(&mut body)?,
                },
                TAG_RE_RA => {
                    let cause = decode_single_bytes(&mut body)?;
                    IdscpMessage::ReRa {
                        cause: String::from_utf8(cause).map_err(|_| DecodeError::InvalidString)?,
                    }
                }
                TAG_RA_PROVER => IdscpMessage::RaProver {
                    data: decode_single_bytes(&mut body)?,
                },
                TAG_RA_VERIFIER => IdscpMessage::RaVerifier {
                    data: decode_single_bytes(&mut body)?,
                },
                TAG_DATA => decode_data(&mut body)?,
                TAG_ACK => decode_ack(&mut body)?,
                other => return Err(DecodeError::UnknownMessage(other)),
            });
        }

        message.ok_or(DecodeError::Empty)
    }
}

fn decode_hello(body: &mut &[u8]) -> Result<IdscpMessage, DecodeError> {
    let mut hello = IdscpHello::default();
    while !body.is_empty() {
        let (field, wire_type) = decode_key(body)?;
        match (field, wire_type) {
            (1, WIRE_LEN) => hello.dat = decode_len_payload(body)?.to_vec(),
            (2, WIRE_LEN) => hello.supported_ra_suites.push(decode_string(body)?),
            (3, WIRE_LEN) => hello.expected_ra_suites.push(decode_string(body)?),
            _ => skip_field(wire_type, body)?,
        }
    }
    Ok(IdscpMessage::Hello(hello))
}

fn decode_close(body: &mut &[u8]) -> Result<IdscpMessage, DecodeError> {
    let mut cause_code = CloseCause::UserShutdown;
    let mut cause_msg = String::new();
    while !body.is_empty() {
        let (field, wire_type) = decode_key(body)?;
        match (field, wire_type) {
            (1, WIRE_VARINT) => cause_code = CloseCause::from_wire(decode_varint(body)?)?,
            (2, WIRE_LEN) => cause_msg = decode_string(body)?,
            _ => skip_field(wire_type, body)?,
        }
    }
    Ok(IdscpMessage::Close(IdscpClose {
        cause_code,
        cause_msg,
    }))
}

fn decode_data(body: &mut &[u8]) -> Result<IdscpMessage, DecodeError> {
    let mut payload = Vec::new();
    let mut alternating_bit = false;
    while !body.is_empty() {
        let (field, wire_type) = decode_key(body)?;
        match (field, wire_type) {
            (1, WIRE_LEN) => payload = decode_len_payload(body)?.to_vec(),
            (2, WIRE_VARINT) => alternating_bit = decode_bool(body)?,
            _ => skip_field(wire_type, body)?,
        }
    }
    Ok(IdscpMessage::Data {
        payload,
        alternating_bit,
    })
}

fn decode_ack(body: &mut &[u8]) -> Result<IdscpMessage, DecodeError> {
    let mut alternating_bit = false;
    while !body.is_empty() {
        let (field, wire_type) = decode_key(body)?;
        match (field, wire_type) {
            (1, WIRE_VARINT) => alternating_bit = decode_bool(body)?,
            _ => skip_field(wire_type, body)?,
        }
    }
    Ok(IdscpMessage::Ack { alternating_bit })
}

/// Sub-messages holding exactly one `bytes` field.
fn decode_single_bytes(body: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut value = Vec::new();
    while !body.is_empty() {
        let (field, wire_type) = decode_key(body)?;
        match (field, wire_type) {
            (1, WIRE_LEN) => value = decode_len_payload(body)?.to_vec(),
            _ => skip_field(wire_type, body)?,
        }
    }
    Ok(value)
}

/// Sub-messages with no declared fields; skip whatever newer peers added.
fn decode_empty(body: &mut &[u8]) -> Result<(), DecodeError> {
    while !body.is_empty() {
        let (_, wire_type) = decode_key(body)?;
        skip_field(wire_type, body)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: IdscpMessage) {
        let encoded = message.encode();
        assert_eq!(IdscpMessage::decode(&encoded), Ok(message));
    }

    #[test]
    fn all_variants_roundtrip() {
        roundtrip(IdscpMessage::Hello(IdscpHello {
            dat: b"token".to_vec(),
            supported_ra_suites: vec!["Dummy".into(), "TPM".into()],
            expected_ra_suites: vec!["Dummy".into()],
        }));
        roundtrip(IdscpMessage::close(CloseCause::Timeout, "handshake expired"));
        roundtrip(IdscpMessage::DatExpired);
        roundtrip(IdscpMessage::Dat {
            token: b"fresh".to_vec(),
        });
        roundtrip(IdscpMessage::ReRa {
            cause: "periodic".into(),
        });
        roundtrip(IdscpMessage::RaProver {
            data: vec![0, 1, 2, 255],
        });
        roundtrip(IdscpMessage::RaVerifier { data: vec![42] });
        roundtrip(IdscpMessage::Data {
            payload: b"PING".to_vec(),
            alternating_bit: true,
        });
        roundtrip(IdscpMessage::Ack {
            alternating_bit: false,
        });
    }

    #[test]
    fn empty_fields_roundtrip() {
        roundtrip(IdscpMessage::Hello(IdscpHello::default()));
        roundtrip(IdscpMessage::close(CloseCause::UserShutdown, ""));
        roundtrip(IdscpMessage::Dat { token: vec![] });
        roundtrip(IdscpMessage::ReRa { cause: "".into() });
        roundtrip(IdscpMessage::Data {
            payload: vec![],
            alternating_bit: false,
        });
    }

    #[test]
    fn empty_record_is_malformed() {
        assert_eq!(IdscpMessage::decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn unknown_top_level_tag_rejected() {
        // field 15, wire type 2, zero-length body
        let record = [0x7a, 0x00];
        assert_eq!(
            IdscpMessage::decode(&record),
            Err(DecodeError::UnknownMessage(15))
        );
    }

    #[test]
    fn truncated_record_rejected() {
        let mut encoded = IdscpMessage::Data {
            payload: b"payload".to_vec(),
            alternating_bit: false,
        }
        .encode();
        encoded.truncate(encoded.len() - 3);
        assert_eq!(
            IdscpMessage::decode(&encoded),
            Err(DecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn unknown_sub_fields_are_skipped() {
        // Ack with an extra unknown varint field 7
        let record = [
            0x4a, 0x04, // field 9 (Ack), length 4
            0x08, 0x01, // alternating_bit = true
            0x38, 0x2a, // field 7 varint 42 (from a newer peer)
        ];
        assert_eq!(
            IdscpMessage::decode(&record),
            Ok(IdscpMessage::Ack {
                alternating_bit: true
            })
        );
    }

    #[test]
    fn close_cause_out_of_range_rejected() {
        let record = [
            0x12, 0x02, // field 2 (Close), length 2
            0x08, 0x63, // cause_code = 99
        ];
        assert_eq!(
            IdscpMessage::decode(&record),
            Err(DecodeError::InvalidEnumValue(99))
        );
    }
}
