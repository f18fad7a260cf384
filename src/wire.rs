use crate::{Cookie, Error, SubcircId};
use bytes::{BufMut, BytesMut};

/// Relay command codepoints used by the splitting extension.
///
/// The handshake commands travel between client and merge point on existing
/// circuit-layer cells; the core only ever sees the decrypted payload after
/// the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// client → middle: propose a new 20-byte cookie.
    SetCookie,
    /// middle → client: cookie outcome.
    CookieSet,
    /// client → middle: attach this circuit using a previously set cookie.
    Join,
    /// middle → client: join outcome carrying the assigned sub-circuit ID.
    Joined,
    /// client → middle: schedule for the inbound (middle → client) direction.
    Instruction,
    /// client → middle: schedule for the outbound (client → middle) direction.
    Info,
}

impl RelayCommand {
    pub fn value(&self) -> u8 {
        match self {
            RelayCommand::SetCookie => 40,
            RelayCommand::CookieSet => 41,
            RelayCommand::Join => 42,
            RelayCommand::Joined => 43,
            RelayCommand::Instruction => 44,
            RelayCommand::Info => 45,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            40 => Some(RelayCommand::SetCookie),
            41 => Some(RelayCommand::CookieSet),
            42 => Some(RelayCommand::Join),
            43 => Some(RelayCommand::Joined),
            44 => Some(RelayCommand::Instruction),
            45 => Some(RelayCommand::Info),
            _ => None,
        }
    }
}

/// Payload of SET_COOKIE and JOIN: the bare cookie.
pub(crate) fn cookie_payload(cookie: &Cookie) -> Vec<u8> {
    cookie.as_bytes().to_vec()
}

pub(crate) fn parse_cookie(payload: &[u8]) -> Result<Cookie, Error> {
    Cookie::from_slice(payload)
}

/// Payload of COOKIE_SET and JOINED: `0x01 | id` on success, `0x00` on
/// failure. The ID travels in network byte order with the width of the ID
/// type (one byte).
pub(crate) fn ack_payload(id: Option<SubcircId>) -> Vec<u8> {
    let mut payload = BytesMut::with_capacity(2);

    match id {
        Some(id) => {
            payload.put_u8(0x01);
            payload.put_u8(id.value());
        }
        None => payload.put_u8(0x00),
    }

    payload.freeze().to_vec()
}

pub(crate) fn parse_ack(payload: &[u8]) -> Result<Option<SubcircId>, Error> {
    match payload {
        [0x00] => Ok(None),
        [0x01, id] => Ok(Some(SubcircId::new(*id))),
        _ => Err(Error::Protocol("acknowledgement has wrong length")),
    }
}
