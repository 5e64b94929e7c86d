//! Wire protocol for membroker: the fixed 12-byte message, its codec, the
//! opcode/direction taxonomy, the wire-level error codes, and the socket
//! path conventions shared by the broker and its clients.

pub mod codec;
pub mod error;
pub mod memsize;
pub mod message;
pub mod opcode;
pub mod paths;
pub mod register;

pub use codec::{recv_message, send_message, CodecError};
pub use error::{decode_page_result, tag_bad_pages, ErrorCode, BAD_PAGES};
pub use memsize::{page_size, parse_amount, MemSizeError};
pub use message::{Message, RawMessage, WIRE_SIZE};
pub use opcode::{Direction, Opcode};
pub use paths::{control_socket_path, debug_socket_path};
pub use register::{pack_register_arg, unpack_register_arg};
