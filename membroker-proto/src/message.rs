//! The fixed 12-byte wire message and its typed counterpart.

use crate::error::ErrorCode;
use crate::opcode::{Direction, Opcode};

/// Three big-endian signed 32-bit words, exactly as they travel on the wire.
/// Decoding bytes into a `RawMessage` always succeeds; only interpreting the
/// `opcode` field as a typed [`Opcode`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    pub client_id: i32,
    pub opcode: i32,
    pub param: i32,
}

pub const WIRE_SIZE: usize = 12;

impl RawMessage {
    pub const fn new(client_id: i32, opcode: i32, param: i32) -> Self {
        Self {
            client_id,
            opcode,
            param,
        }
    }

    pub fn to_bytes(self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.client_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.opcode.to_be_bytes());
        buf[8..12].copy_from_slice(&self.param.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; WIRE_SIZE]) -> Self {
        Self {
            client_id: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            opcode: i32::from_be_bytes(buf[4..8].try_into().unwrap()),
            param: i32::from_be_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    /// Interprets the raw opcode as a typed [`Opcode`], checking that it is
    /// legal to have arrived travelling `from` the given direction.
    pub fn into_message(self, from: Direction) -> Result<Message, ErrorCode> {
        let opcode = Opcode::from_i32(self.opcode).ok_or(ErrorCode::BadCode)?;
        opcode.validate_direction(from)?;
        Ok(Message {
            client_id: self.client_id,
            opcode,
            param: self.param,
        })
    }
}

/// A message whose opcode has already been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub client_id: i32,
    pub opcode: Opcode,
    pub param: i32,
}

impl Message {
    pub const fn new(client_id: i32, opcode: Opcode, param: i32) -> Self {
        Self {
            client_id,
            opcode,
            param,
        }
    }

    pub const fn into_raw(self) -> RawMessage {
        RawMessage::new(self.client_id, self.opcode.as_i32(), self.param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let raw = RawMessage::new(7, Opcode::Share.as_i32(), -12345);
        assert_eq!(RawMessage::from_bytes(raw.to_bytes()), raw);
    }

    #[test]
    fn big_endian_byte_order() {
        let raw = RawMessage::new(1, 0, 0);
        assert_eq!(raw.to_bytes()[0..4], [0, 0, 0, 1]);
    }

    #[test]
    fn rejects_wrong_direction() {
        // REGISTER is only ever sent by a client; a broker-to-client
        // decode must reject it rather than accept a message no client
        // opcode classification admits.
        let raw = RawMessage::new(1, Opcode::Register.as_i32(), 4);
        assert_eq!(
            raw.into_message(Direction::BrokerToClient),
            Err(ErrorCode::BadCode)
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        let raw = RawMessage::new(1, 99, 0);
        assert_eq!(
            raw.into_message(Direction::ClientToBroker),
            Err(ErrorCode::BadCode)
        );
    }
}
