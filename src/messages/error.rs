/// An error type to indicate something went wrong while decoding a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The record body was empty; every record must carry a message variant
    Empty,
    /// A varint ran past the end of the record or exceeded 64 bits
    InvalidVarint,
    /// A length-delimited field claimed more bytes than the record holds
    UnexpectedEnd,
    /// The top-level tag does not name a known message variant
    UnknownMessage(u32),
    /// A wire type other than varint or length-delimited was encountered
    UnsupportedWireType(u32),
    /// A string field did not hold valid UTF-8
    InvalidString,
    /// An enum field held a value outside its declared range
    InvalidEnumValue(u64),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            DecodeError::Empty => write!(f, "empty record"),
            DecodeError::InvalidVarint => write!(f, "malformed varint"),
            DecodeError::UnexpectedEnd => write!(f, "record truncated"),
            DecodeError::UnknownMessage(tag) => write!(f, "unknown message tag {tag}"),
            DecodeError::UnsupportedWireType(t) => write!(f, "unsupported wire type {t}"),
            DecodeError::InvalidString => write!(f, "invalid utf-8 in string field"),
            DecodeError::InvalidEnumValue(v) => write!(f, "enum value {v} out of range"),
        }
    }
}

impl std::error::Error for DecodeError {}
