//! Legacy APNs binary packets. Requests only ever leave the process; the
//! receive path carries the fixed six-byte error response.

use crate::buffer::Buffer;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::packet::{write_bytes, Packet, Parser};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const CMD_REQUEST: u8 = 0x02;
pub const CMD_RESPONSE: u8 = 0x08;

pub const RESPONSE_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApnsItemId {
    DeviceToken = 0x01,
    Payload = 0x02,
    NotiId = 0x03,
    ExpDate = 0x04,
    Priority = 0x05,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApnsItem {
    pub id: u8,
    pub body: Vec<u8>,
}

impl ApnsItem {
    pub fn new(id: ApnsItemId, body: Vec<u8>) -> ApnsItem {
        ApnsItem { id: id as u8, body }
    }
}

/// Outbound notification frame: `cmd, u32 frame size, items`, integers
/// big-endian, each item `u8 id, u16 size, bytes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApnsPacket {
    pub items: Vec<ApnsItem>,
}

impl ApnsPacket {
    pub fn push(&mut self, id: ApnsItemId, body: Vec<u8>) {
        self.items.push(ApnsItem::new(id, body));
    }

    pub fn packet_size(&self) -> usize {
        let items: usize = self.items.iter().map(|item| 3 + item.body.len()).sum();
        1 + 4 + items
    }
}

impl Packet for ApnsPacket {
    fn write(&self, buf: &mut Buffer) -> NetResult<usize> {
        let bytes = self.to_bytes();
        write_bytes(buf, &bytes)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packet_size());

        out.push(CMD_REQUEST);
        let frame: usize = self.items.iter().map(|item| 3 + item.body.len()).sum();
        out.write_u32::<BigEndian>(frame as u32).expect("vec write");

        for item in &self.items {
            out.push(item.id);
            out.write_u16::<BigEndian>(item.body.len() as u16)
                .expect("vec write");
            out.extend_from_slice(&item.body);
        }

        out
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// The six-byte error response: `cmd 0x08, status, u32 notification id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApnsResponsePacket {
    pub status: u8,
    pub noti_id: u32,
}

impl Packet for ApnsResponsePacket {
    fn write(&self, buf: &mut Buffer) -> NetResult<usize> {
        let bytes = self.to_bytes();
        write_bytes(buf, &bytes)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESPONSE_SIZE);
        out.push(CMD_RESPONSE);
        out.push(self.status);
        out.write_u32::<BigEndian>(self.noti_id).expect("vec write");
        out
    }

    fn clear(&mut self) {
        *self = ApnsResponsePacket::default();
    }
}

/// Reads exactly six bytes per response; anything not starting with the
/// response command byte is a framing violation.
#[derive(Debug, Default)]
pub struct ApnsResponseParser;

impl Parser for ApnsResponseParser {
    type Output = ApnsResponsePacket;

    fn parse(&mut self, buf: &mut Buffer) -> NetResult<Option<ApnsResponsePacket>> {
        if buf.len() < RESPONSE_SIZE {
            return Ok(None);
        }

        let mut data = buf.grab_read();

        let cmd = data.read_u8().expect("sized read");
        if cmd != CMD_RESPONSE {
            return Err(NetError::Fatal(ErrorKind::InvalidPacket));
        }

        let status = data.read_u8().expect("sized read");
        let noti_id = data.read_u32::<BigEndian>().expect("sized read");

        buf.commit_read(RESPONSE_SIZE);

        Ok(Some(ApnsResponsePacket { status, noti_id }))
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_buffer() -> Buffer {
        Buffer::new(65536, 65536 * 4)
    }

    #[test]
    fn test_request_layout() {
        let mut pk = ApnsPacket::default();
        pk.push(ApnsItemId::DeviceToken, vec![0xAA; 32]);
        pk.push(ApnsItemId::Payload, b"{\"aps\":{}}".to_vec());

        let bytes = pk.to_bytes();
        assert_eq!(bytes.len(), pk.packet_size());
        assert_eq!(bytes[0], CMD_REQUEST);

        // Frame size covers every item header and body.
        let frame = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(frame, bytes.len() - 5);

        // First item header.
        assert_eq!(bytes[5], ApnsItemId::DeviceToken as u8);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 32);
    }

    #[test]
    fn test_response_roundtrip() {
        let res = ApnsResponsePacket {
            status: 8,
            noti_id: 0xDEADBEEF,
        };

        let mut buf = test_buffer();
        res.write(&mut buf).unwrap();

        let mut parser = ApnsResponseParser::default();
        let parsed = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, res);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_needs_exactly_six_bytes() {
        let mut buf = test_buffer();
        let span = buf.grab_write(5).unwrap();
        span.copy_from_slice(&[CMD_RESPONSE, 0, 0, 0, 0]);
        buf.commit_write(5);

        let mut parser = ApnsResponseParser::default();
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_response_wrong_command_rejected() {
        let mut buf = test_buffer();
        let span = buf.grab_write(6).unwrap();
        span.copy_from_slice(&[CMD_REQUEST, 0, 0, 0, 0, 0]);
        buf.commit_write(6);

        let mut parser = ApnsResponseParser::default();
        let err = parser.parse(&mut buf).unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::InvalidPacket));
    }
}
