//! Packet contracts and the concrete wire formats the framework ships.

use crate::buffer::Buffer;
use crate::error::NetResult;

pub mod apns;
pub mod http;
pub mod msg;

/// A framed application message. Serialization goes either straight into a
/// channel's write buffer or into an owned byte string.
pub trait Packet {
    /// Serializes into the buffer. Returns bytes written.
    fn write(&self, buf: &mut Buffer) -> NetResult<usize>;

    /// Serializes into an owned byte string.
    fn to_bytes(&self) -> Vec<u8>;

    /// Resets to the default state.
    fn clear(&mut self);
}

/// Incremental parser over a channel's read buffer. Strictly left-to-right:
/// a call either consumes one complete packet, consumes nothing and asks for
/// more data (`Ok(None)`), or reports a framing violation.
pub trait Parser {
    type Output: Packet;

    fn parse(&mut self, buf: &mut Buffer) -> NetResult<Option<Self::Output>>;

    /// Drops any parked partial state.
    fn reset(&mut self);
}

/// Helper shared by the write-side packet impls: copy finished bytes into
/// the buffer in one grab/commit pair.
pub(crate) fn write_bytes(buf: &mut Buffer, bytes: &[u8]) -> NetResult<usize> {
    let span = buf.grab_write(bytes.len())?;
    span.copy_from_slice(bytes);
    buf.commit_write(bytes.len());
    Ok(bytes.len())
}

/// Unframed passthrough packet: whatever bytes are buffered form one packet.
/// The echo service runs on this.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPacket {
    pub body: Vec<u8>,
}

impl RawPacket {
    pub fn new(body: Vec<u8>) -> RawPacket {
        RawPacket { body }
    }
}

impl Packet for RawPacket {
    fn write(&self, buf: &mut Buffer) -> NetResult<usize> {
        write_bytes(buf, &self.body)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.body.clone()
    }

    fn clear(&mut self) {
        self.body.clear();
    }
}

#[derive(Debug, Default)]
pub struct RawParser;

impl Parser for RawParser {
    type Output = RawPacket;

    fn parse(&mut self, buf: &mut Buffer) -> NetResult<Option<RawPacket>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let body = buf.grab_read().to_vec();
        buf.commit_read(body.len());
        Ok(Some(RawPacket::new(body)))
    }

    fn reset(&mut self) {}
}
