//! Bluetooth-tailored UUID parsing and formatting
//!
//! 16- and 32-bit aliases expand over the Bluetooth Base UUID
//! `00000000-0000-1000-8000-00805f9b34fb`. Output prefers the 4 character
//! alias whenever the UUID is a 16-bit alias, so it can be parsed back.

use std::fmt;

use uuid::Uuid;

const BASE_UUID_BYTES: [u8; 16] = [
    0, 0, 0, 0, 0, 0, 0x10, 0, 0x80, 0, 0, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
];

/// The Bluetooth Base UUID
pub const fn base_uuid() -> Uuid {
    Uuid::from_bytes(BASE_UUID_BYTES)
}

/// Expand a 16-bit assigned number into its 128-bit UUID
pub fn from_short_id(id: u16) -> Uuid {
    from_short_id32(u32::from(id))
}

/// Expand a 32-bit assigned number into its 128-bit UUID
pub fn from_short_id32(id: u32) -> Uuid {
    let mut bytes = BASE_UUID_BYTES;
    bytes[..4].copy_from_slice(&id.to_be_bytes());
    Uuid::from_bytes(bytes)
}

/// The 16-bit alias of `uuid`, if it has one
pub fn short_id(uuid: &Uuid) -> Option<u16> {
    let bytes = uuid.as_bytes();
    if bytes[4..] == BASE_UUID_BYTES[4..] && bytes[..2] == [0, 0] {
        Some(u16::from_be_bytes([bytes[2], bytes[3]]))
    } else {
        None
    }
}

/// UUID string that could not be canonicalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidParseError(String);

impl fmt::Display for UuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid UUID string: {:?}", self.0)
    }
}

impl std::error::Error for UuidParseError {}

impl From<UuidParseError> for crate::error::GattError {
    fn from(err: UuidParseError) -> Self {
        Self::InvalidUuid(err.0)
    }
}

/// Parse any of the accepted textual UUID forms into the 128-bit form
///
/// Accepted: 4 hex chars (16-bit alias), 8 hex chars (32-bit alias),
/// 32 hex chars and the dashed 36 char form. Case-insensitive.
pub fn canonicalize_uuid(input: &str) -> Result<Uuid, UuidParseError> {
    let s = input.trim();
    let err = || UuidParseError(input.to_string());
    match s.len() {
        4 | 8 if s.chars().all(|c| c.is_ascii_hexdigit()) => {
            let id = u32::from_str_radix(s, 16).map_err(|_| err())?;
            Ok(from_short_id32(id))
        }
        32 if s.chars().all(|c| c.is_ascii_hexdigit()) => Uuid::parse_str(s).map_err(|_| err()),
        36 => {
            let dashes_ok = [8, 13, 18, 23].iter().all(|&i| s.as_bytes()[i] == b'-');
            if !dashes_ok {
                return Err(err());
            }
            Uuid::parse_str(s).map_err(|_| err())
        }
        _ => Err(err()),
    }
}

/// Parse a list of UUID strings, failing on the first invalid one
pub fn canonicalize_uuids<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Uuid>, UuidParseError> {
    inputs.iter().map(|s| canonicalize_uuid(s.as_ref())).collect()
}

/// Format a UUID in its shortest faithful form
pub fn uuid_to_string(uuid: &Uuid) -> String {
    match short_id(uuid) {
        Some(id) => format!("{:04x}", id),
        None => uuid.hyphenated().to_string(),
    }
}
