//! Wire opcodes and the direction each one is valid to travel in.

use crate::error::ErrorCode;

/// Which side of the connection may legally send a given [`Opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Only a client may send this opcode to the broker.
    ClientToBroker,
    /// Only the broker may send this opcode to a client.
    BrokerToClient,
    /// Either side may send this opcode.
    Both,
}

/// A wire-level operation code. Stable integer values, 1..=12; 0 is reserved
/// as an explicit invalid sentinel rather than a valid variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    Request = 1,
    Reserve = 2,
    Return = 3,
    Terminate = 4,
    Status = 5,
    Register = 6,
    Share = 7,
    Query = 8,
    QueryAvailable = 9,
    Available = 10,
    Total = 11,
    Deny = 12,
}

impl Opcode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Request),
            2 => Some(Self::Reserve),
            3 => Some(Self::Return),
            4 => Some(Self::Terminate),
            5 => Some(Self::Status),
            6 => Some(Self::Register),
            7 => Some(Self::Share),
            8 => Some(Self::Query),
            9 => Some(Self::QueryAvailable),
            10 => Some(Self::Available),
            11 => Some(Self::Total),
            12 => Some(Self::Deny),
            _ => None,
        }
    }

    /// The direction this opcode is legal to travel in.
    ///
    /// Several opcodes are reused for both a client's ask and the broker's
    /// matching reply on the same wire value: `REQUEST`/`RESERVE` double as
    /// the broker's solicitation of a donor, `SHARE` doubles as a donor's
    /// reply to that solicitation, `RETURN` doubles as the broker returning
    /// surplus to a source, `QUERY`/`TOTAL` carry the broker's answer back
    /// on the same opcode, and `TERMINATE` doubles as the broker's
    /// acknowledgement. Those are `Both`; only opcodes with no reply-reuse
    /// are restricted to one side.
    pub const fn direction(self) -> Direction {
        match self {
            Self::Request | Self::Reserve | Self::Return | Self::Terminate | Self::Share
            | Self::Query | Self::Total => Direction::Both,
            Self::Status | Self::Register | Self::QueryAvailable | Self::Deny => {
                Direction::ClientToBroker
            }
            Self::Available => Direction::BrokerToClient,
        }
    }

    /// Validates that this opcode is legal to arrive travelling in `from`.
    pub fn validate_direction(self, from: Direction) -> Result<(), ErrorCode> {
        let allowed = self.direction();
        if allowed == from || allowed == Direction::Both || from == Direction::Both {
            Ok(())
        } else {
            Err(ErrorCode::BadCode)
        }
    }

    /// A short human-readable name, for logs and diagnostic dumps.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Reserve => "RESERVE",
            Self::Return => "RETURN",
            Self::Terminate => "TERMINATE",
            Self::Status => "STATUS",
            Self::Register => "REGISTER",
            Self::Share => "SHARE",
            Self::Query => "QUERY",
            Self::QueryAvailable => "QUERY_AVAILABLE",
            Self::Available => "AVAILABLE",
            Self::Total => "TOTAL",
            Self::Deny => "DENY",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Opcode::Request)]
    #[case(6, Opcode::Register)]
    #[case(12, Opcode::Deny)]
    fn decodes_known_values(#[case] raw: i32, #[case] expected: Opcode) {
        assert_eq!(Opcode::from_i32(raw), Some(expected));
    }

    #[test]
    fn rejects_invalid_sentinel_and_out_of_range() {
        assert_eq!(Opcode::from_i32(0), None);
        assert_eq!(Opcode::from_i32(13), None);
        assert_eq!(Opcode::from_i32(-1), None);
    }

    #[test]
    fn share_travels_both_ways() {
        // A donor's reply to a solicitation, and the broker's grant to a
        // requester, are both SHARE on the wire.
        assert!(
            Opcode::Share
                .validate_direction(Direction::ClientToBroker)
                .is_ok()
        );
        assert!(
            Opcode::Share
                .validate_direction(Direction::BrokerToClient)
                .is_ok()
        );
    }

    #[test]
    fn request_travels_both_ways() {
        // A client's ask, and the broker's solicitation of a donor, are
        // both REQUEST on the wire.
        assert!(
            Opcode::Request
                .validate_direction(Direction::BrokerToClient)
                .is_ok()
        );
    }

    #[test]
    fn register_is_client_to_broker_only() {
        assert!(
            Opcode::Register
                .validate_direction(Direction::BrokerToClient)
                .is_err()
        );
    }

    #[test]
    fn deny_is_client_to_broker_only() {
        assert!(
            Opcode::Deny
                .validate_direction(Direction::BrokerToClient)
                .is_err()
        );
    }
}
