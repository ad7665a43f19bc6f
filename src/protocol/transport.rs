//! Length-prefixed bincode framing.

use std::io::{ErrorKind, Read, Write};

use tracing::trace;

use super::message::Message;
use crate::errors::{HeError, HeResult, ProtocolError};

/// Largest accepted message body, 2 GiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 2 << 30;

pub fn write_message<W: Write>(writer: &mut W, message: &Message, limit: u64) -> HeResult<()> {
    let body = bincode::serialize(message)?;
    let size = body.len() as u64;
    if size > limit {
        return Err(ProtocolError::MessageTooLarge { size, limit }.into());
    }
    write_frame(writer, size, &body).map_err(|e| -> HeError {
        if is_disconnect(e.kind()) {
            ProtocolError::PeerDisconnected.into()
        } else {
            e.into()
        }
    })?;
    trace!(size, message = %message.summary(), "sent");
    Ok(())
}

/// Reads one message. A closed or reset stream is a disconnect.
pub fn read_message<R: Read>(reader: &mut R, limit: u64) -> HeResult<Message> {
    let mut header = [0u8; 8];
    read_exact_or_disconnect(reader, &mut header)?;
    let size = u64::from_le_bytes(header);
    if size > limit {
        return Err(ProtocolError::MessageTooLarge { size, limit }.into());
    }
    let len = usize::try_from(size).map_err(|_| ProtocolError::MessageTooLarge { size, limit })?;
    let mut body = vec![0u8; len];
    read_exact_or_disconnect(reader, &mut body)?;
    let message: Message = bincode::deserialize(&body)
        .map_err(|e| ProtocolError::malformed(e.to_string()))?;
    trace!(size, message = %message.summary(), "received");
    Ok(message)
}

fn write_frame<W: Write>(writer: &mut W, size: u64, body: &[u8]) -> std::io::Result<()> {
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

/// I/O error kinds that mean the other side has gone away.
pub(crate) fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

fn read_exact_or_disconnect<R: Read>(reader: &mut R, buf: &mut [u8]) -> HeResult<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if is_disconnect(e.kind()) => Err(ProtocolError::PeerDisconnected.into()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Function, function};
    use std::io::Cursor;

    #[test]
    fn framing_round_trip() {
        let message = Message::request(Function::new(function::RELU).with_gc(true), 42, Vec::new());
        let mut buf = Vec::new();
        write_message(&mut buf, &message, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let size = u64::from_le_bytes(buf[..8].try_into().unwrap());
        assert_eq!(size as usize, buf.len() - 8);
        let back = read_message(&mut Cursor::new(buf), DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn truncated_stream_is_a_disconnect() {
        let err = read_message(&mut Cursor::new(vec![1u8, 2, 3]), 1024).unwrap_err();
        assert!(matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::PeerDisconnected
            }
        ));
    }

    #[test]
    fn oversized_messages_are_refused() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(1u64 << 40).to_le_bytes());
        let err = read_message(&mut Cursor::new(buf), 1 << 20).unwrap_err();
        assert!(matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::MessageTooLarge { .. }
            }
        ));
    }
}
