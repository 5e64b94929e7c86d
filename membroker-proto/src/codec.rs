//! Complete-send/complete-receive framing over the fixed 12-byte message.
//!
//! The codec is stateless: every call either fully sends or fully receives
//! one [`RawMessage`], looping through short reads/writes and restarting on
//! interruption, the same guarantee the original synchronous send/recv loop
//! gave its callers.

use std::io::{self, Read, Write};

use crate::message::{RawMessage, WIRE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection before any bytes of a new message
    /// arrived. Distinct from a short/garbled read mid-message, which is an
    /// `Io` error: this is the expected shape of a clean disconnect.
    #[error("channel closed")]
    Closed,
}

/// Sends a message, looping until all 12 bytes are written.
pub fn send_message<W: Write>(writer: &mut W, msg: RawMessage) -> Result<(), CodecError> {
    let buf = msg.to_bytes();
    let mut sent = 0;
    while sent < buf.len() {
        match writer.write(&buf[sent..]) {
            Ok(0) => return Err(CodecError::Io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(())
}

/// Receives a message, looping until all 12 bytes are read.
///
/// Returns [`CodecError::Closed`] if the peer disconnected before any bytes
/// of this message arrived; returns [`CodecError::Io`] if it disconnected
/// partway through (a garbled/short message, not a clean EOF boundary).
pub fn recv_message<R: Read>(reader: &mut R) -> Result<RawMessage, CodecError> {
    let mut buf = [0u8; WIRE_SIZE];
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => {
                if total == 0 {
                    return Err(CodecError::Closed);
                }
                return Err(CodecError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(RawMessage::from_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use std::io::Cursor;

    #[test]
    fn sends_and_receives_round_trip() {
        let msg = RawMessage::new(3, Opcode::Request.as_i32(), 40);
        let mut buf = Vec::new();
        send_message(&mut buf, msg).unwrap();
        assert_eq!(buf.len(), WIRE_SIZE);

        let mut cursor = Cursor::new(buf);
        let decoded = recv_message(&mut cursor).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn empty_stream_is_closed_not_an_error() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(recv_message(&mut cursor), Err(CodecError::Closed)));
    }

    #[test]
    fn truncated_mid_message_is_io_error() {
        let mut cursor = Cursor::new(vec![0u8; 5]);
        assert!(matches!(recv_message(&mut cursor), Err(CodecError::Io(_))));
    }

    #[test]
    fn handles_short_reads_across_multiple_chunks() {
        struct OneByteAtATime(Cursor<Vec<u8>>);
        impl Read for OneByteAtATime {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(&mut buf[..1.min(buf.len())])
            }
        }

        let msg = RawMessage::new(-4, Opcode::Share.as_i32(), 0);
        let mut reader = OneByteAtATime(Cursor::new(msg.to_bytes().to_vec()));
        assert_eq!(recv_message(&mut reader).unwrap(), msg);
    }
}
