//! The default message framing: a US-ASCII header line terminated by CRLF,
//! followed by an exact-length binary body.
//!
//! `CODE SP TRID SP FLAGS SP BODY_LEN[ SP TOTAL SP INDEX][ SP APPENDIX]\r\n`

use crate::buffer::Buffer;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::packet::{Packet, Parser};
use std::fmt;
use std::mem;
use std::str;

/// Smallest parseable header: 1-byte code, three 1-byte numeric fields,
/// three separators and CRLF.
pub const MIN_HEADER_SIZE: usize = 12;
pub const MAX_HEADER_SIZE: usize = 4 * 1024;
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_ENCRYPTED: u8 = 0x02;
pub const FLAG_CHUNKED: u8 = 0x04;

/// Packet code: up to four printable bytes, compared as a single word.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Code {
    bytes: [u8; 4],
    len: u8,
}

impl Code {
    pub fn new(text: &str) -> Code {
        let mut code = Code::default();
        for (idx, b) in text.bytes().take(4).enumerate() {
            code.bytes[idx] = b;
            code.len = idx as u8 + 1;
        }
        code
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // Only validated printable ASCII ever lands in here.
        str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        *self = Code::default();
    }
}

impl PartialEq<&str> for Code {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl From<&str> for Code {
    fn from(text: &str) -> Code {
        Code::new(text)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Code({})", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgPacket {
    pub code: Code,
    pub trid: u16,
    pub flags: u8,
    pub chunk_total: u16,
    pub chunk_index: u16,
    pub appendix: String,
    pub body: Vec<u8>,
}

impl MsgPacket {
    pub fn new(code: &str) -> MsgPacket {
        MsgPacket {
            code: Code::new(code),
            ..MsgPacket::default()
        }
    }

    #[inline]
    pub fn flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flag(FLAG_COMPRESSED)
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flag(FLAG_ENCRYPTED)
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.flag(FLAG_CHUNKED)
    }

    /// Copies code and transaction id from a request; the usual way to start
    /// a response.
    #[inline]
    pub fn set_code_trid(&mut self, other: &MsgPacket) {
        self.code = other.code;
        self.trid = other.trid;
    }

    fn flags_field(&self) -> [u8; 3] {
        let mut out = [b'0'; 3];
        for (idx, slot) in out.iter_mut().enumerate() {
            if (self.flags >> idx) & 1 == 1 {
                *slot = b'1';
            }
        }
        out
    }

    fn header_bytes(&self) -> Vec<u8> {
        let flags = self.flags_field();
        let mut head = format!(
            "{} {} {} {}",
            self.code,
            self.trid,
            str::from_utf8(&flags).unwrap_or("000"),
            self.body.len()
        );

        if self.is_chunked() {
            head.push_str(&format!(" {} {}", self.chunk_total, self.chunk_index));
        }

        if !self.appendix.is_empty() {
            head.push(' ');
            head.push_str(&self.appendix);
        }

        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Total serialized size, header included.
    pub fn packet_size(&self) -> usize {
        self.header_bytes().len() + self.body.len()
    }
}

impl Packet for MsgPacket {
    fn write(&self, buf: &mut Buffer) -> NetResult<usize> {
        let head = self.header_bytes();
        let total = head.len() + self.body.len();

        let span = buf.grab_write(total)?;
        span[..head.len()].copy_from_slice(&head);
        span[head.len()..].copy_from_slice(&self.body);
        buf.commit_write(total);

        Ok(total)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    fn clear(&mut self) {
        *self = MsgPacket::default();
    }
}

fn parse_flags(field: &str) -> Option<u8> {
    if field.is_empty() || field.len() > 3 {
        return None;
    }

    let mut flags = 0u8;
    for (idx, ch) in field.bytes().enumerate() {
        match ch {
            b'0' => {}
            b'1' => flags |= 1 << idx,
            _ => return None,
        }
    }

    Some(flags)
}

fn code_ok(field: &str) -> bool {
    !field.is_empty()
        && field.len() <= 4
        && field.bytes().all(|b| b.is_ascii_graphic())
}

/// Parses one header line (without the CRLF). Returns the packet shell plus
/// the body length it promises.
fn parse_header(line: &[u8]) -> NetResult<(MsgPacket, usize)> {
    let text = str::from_utf8(line).map_err(|_| NetError::Fatal(ErrorKind::InvalidPacket))?;
    let mut fields = text.splitn(5, ' ');

    let code = fields.next().filter(|f| code_ok(*f));
    let trid = fields.next().and_then(|f| f.parse::<u16>().ok());
    let flags = fields.next().and_then(parse_flags);
    let body_len = fields.next().and_then(|f| f.parse::<usize>().ok());

    let (code, trid, flags) = match (code, trid, flags) {
        (Some(code), Some(trid), Some(flags)) => (code, trid, flags),
        _ => return Err(NetError::Fatal(ErrorKind::InvalidPacket)),
    };

    let body_len = match body_len {
        Some(len) if len <= MAX_BODY_SIZE => len,
        Some(_) => return Err(NetError::Fatal(ErrorKind::PacketTooLarge)),
        None => return Err(NetError::Fatal(ErrorKind::InvalidPacket)),
    };

    let mut packet = MsgPacket::new(code);
    packet.trid = trid;
    packet.flags = flags;

    let mut rest = fields.next().unwrap_or("");

    if packet.is_chunked() {
        let mut tail = rest.splitn(3, ' ');
        let total = tail.next().and_then(|f| f.parse::<u16>().ok());
        let index = tail.next().and_then(|f| f.parse::<u16>().ok());

        match (total, index) {
            (Some(total), Some(index)) if total > 0 && index > 0 => {
                packet.chunk_total = total;
                packet.chunk_index = index;
            }
            _ => return Err(NetError::Fatal(ErrorKind::InvalidPacket)),
        }

        rest = tail.next().unwrap_or("");
    }

    packet.appendix = rest.to_string();

    Ok((packet, body_len))
}

enum State {
    Header,
    /// Header parsed and consumed; waiting on `need` body bytes.
    Body { packet: MsgPacket, need: usize },
}

pub struct MsgParser {
    state: State,
}

impl Default for MsgParser {
    fn default() -> MsgParser {
        MsgParser {
            state: State::Header,
        }
    }
}

impl Parser for MsgParser {
    type Output = MsgPacket;

    fn parse(&mut self, buf: &mut Buffer) -> NetResult<Option<MsgPacket>> {
        if let State::Header = self.state {
            let data = buf.grab_read();

            if data.len() < MIN_HEADER_SIZE {
                return Ok(None);
            }

            let window = &data[..data.len().min(MAX_HEADER_SIZE + 2)];
            let eol = match find_crlf(window) {
                Some(pos) => pos,
                None => {
                    if data.len() > MAX_HEADER_SIZE {
                        return Err(NetError::Fatal(ErrorKind::InvalidPacket));
                    }
                    return Ok(None);
                }
            };

            if eol > MAX_HEADER_SIZE {
                return Err(NetError::Fatal(ErrorKind::InvalidPacket));
            }

            let (packet, need) = parse_header(&data[..eol])?;
            buf.commit_read(eol + 2);

            if need == 0 {
                return Ok(Some(packet));
            }

            self.state = State::Body { packet, need };
        }

        if let State::Body { need, .. } = &self.state {
            if buf.len() < *need {
                return Ok(None);
            }

            let state = mem::replace(&mut self.state, State::Header);
            if let State::Body { mut packet, need } = state {
                packet.body = buf.grab_read()[..need].to_vec();
                buf.commit_read(need);
                return Ok(Some(packet));
            }
        }

        Ok(None)
    }

    fn reset(&mut self) {
        self.state = State::Header;
    }
}

fn find_crlf(window: &[u8]) -> Option<usize> {
    window.windows(2).position(|pair| pair == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_buffer() -> Buffer {
        Buffer::new(65536, MAX_BODY_SIZE * 4)
    }

    fn feed(parser: &mut MsgParser, buf: &mut Buffer, bytes: &[u8]) -> NetResult<Option<MsgPacket>> {
        let span = buf.grab_write(bytes.len()).unwrap();
        span.copy_from_slice(bytes);
        buf.commit_write(bytes.len());
        parser.parse(buf)
    }

    #[test]
    fn test_code_compare() {
        let code = Code::new("ECHO");
        assert_eq!(code, "ECHO");
        assert_eq!(code.as_str(), "ECHO");
        assert_eq!(Code::new("TOOLONG").as_str(), "TOOL");
        assert!(Code::default().is_empty());
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let mut pk = MsgPacket::new("ECHO");
        pk.trid = 17;
        pk.appendix = "tok=abc".to_string();
        pk.body = b"hello world".to_vec();

        let mut buf = test_buffer();
        pk.write(&mut buf).unwrap();

        let mut parser = MsgParser::default();
        let parsed = parser.parse(&mut buf).unwrap().unwrap();

        assert_eq!(parsed, pk);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_chunked() {
        let mut pk = MsgPacket::new("PUSH");
        pk.trid = 9;
        pk.set_flag(FLAG_CHUNKED, true);
        pk.chunk_total = 3;
        pk.chunk_index = 2;
        pk.body = vec![0u8; 128];

        let mut buf = test_buffer();
        pk.write(&mut buf).unwrap();

        let mut parser = MsgParser::default();
        let parsed = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, pk);
    }

    #[test]
    fn test_wire_shape() {
        let mut pk = MsgPacket::new("AB");
        pk.trid = 3;
        pk.set_flag(FLAG_COMPRESSED, true);
        pk.body = b"xy".to_vec();

        assert_eq!(pk.to_bytes(), b"AB 3 100 2\r\nxy".to_vec());
        assert_eq!(pk.packet_size(), pk.to_bytes().len());
    }

    #[test]
    fn test_short_input_consumes_nothing() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        assert!(feed(&mut parser, &mut buf, b"ECHO 1").unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_body_parked_across_reads() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        assert!(feed(&mut parser, &mut buf, b"ECHO 1 000 11\r\nhello ")
            .unwrap()
            .is_none());

        let parsed = feed(&mut parser, &mut buf, b"world").unwrap().unwrap();
        assert_eq!(parsed.code, "ECHO");
        assert_eq!(parsed.body, b"hello world");
    }

    #[test]
    fn test_two_packets_in_one_read() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        let bytes = b"AAA 1 000 2\r\nxxBBB 2 000 0\r\n";
        let span = buf.grab_write(bytes.len()).unwrap();
        span.copy_from_slice(bytes);
        buf.commit_write(bytes.len());

        let first = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.code, "AAA");
        assert_eq!(first.body, b"xx");

        let second = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(second.code, "BBB");
        assert!(second.body.is_empty());

        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_body_too_large_rejected() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        let err = feed(&mut parser, &mut buf, b"CODE 0 000 9999999999\r\n").unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::PacketTooLarge));
    }

    #[test]
    fn test_header_too_long_rejected() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        let junk = vec![b'a'; MAX_HEADER_SIZE + 16];
        let err = feed(&mut parser, &mut buf, &junk).unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::InvalidPacket));
    }

    #[test]
    fn test_chunked_zero_total_rejected() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        let err = feed(&mut parser, &mut buf, b"CODE 1 001 0 0 1\r\n").unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::InvalidPacket));
    }

    #[test]
    fn test_chunked_zero_index_rejected() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        let err = feed(&mut parser, &mut buf, b"CODE 1 001 0 4 0\r\n").unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::InvalidPacket));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let mut parser = MsgParser::default();
        let mut buf = test_buffer();

        let err = feed(&mut parser, &mut buf, b"no numeric fields here\r\n").unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::InvalidPacket));
    }

    #[test]
    fn test_set_code_trid() {
        let mut req = MsgPacket::new("LOAD");
        req.trid = 77;

        let mut res = MsgPacket::default();
        res.set_code_trid(&req);
        assert_eq!(res.code, "LOAD");
        assert_eq!(res.trid, 77);
    }
}
