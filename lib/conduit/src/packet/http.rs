//! HTTP request/response framing. Only framing: a request line or status
//! line, a CRLF-terminated header block and a Content-Length body. Routing,
//! chunked transfer and connection management stay with the application.

use crate::buffer::Buffer;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::packet::{write_bytes, Packet, Parser};
use std::mem;
use std::str;

pub const MAX_HTTP_HEADER_SIZE: usize = 8 * 1024;
pub const MAX_HTTP_BODY_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequestPacket {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequestPacket {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }
}

impl Packet for HttpRequestPacket {
    fn write(&self, buf: &mut Buffer) -> NetResult<usize> {
        let bytes = self.to_bytes();
        write_bytes(buf, &bytes)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version).into_bytes();

        let mut has_length = false;
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("Content-Length") {
                has_length = true;
            }
            out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        if !self.body.is_empty() && !has_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    fn clear(&mut self) {
        *self = HttpRequestPacket::default();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponsePacket {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for HttpResponsePacket {
    fn default() -> HttpResponsePacket {
        HttpResponsePacket::new(200)
    }
}

impl HttpResponsePacket {
    pub fn new(status: u16) -> HttpResponsePacket {
        HttpResponsePacket {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason_phrase(status).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        for (key, slot) in self.headers.iter_mut() {
            if key.eq_ignore_ascii_case(name) {
                *slot = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }
}

impl Packet for HttpResponsePacket {
    fn write(&self, buf: &mut Buffer) -> NetResult<usize> {
        let bytes = self.to_bytes();
        write_bytes(buf, &bytes)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            format!("{} {} {}\r\n", self.version, self.status, self.reason).into_bytes();

        let mut has_length = false;
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("Content-Length") {
                has_length = true;
            }
            out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        // Correct framing is the one promise this layer makes.
        if !has_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    fn clear(&mut self) {
        *self = HttpResponsePacket::new(200);
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

enum State {
    Header,
    Body {
        packet: HttpRequestPacket,
        need: usize,
    },
}

/// Server-side request parser.
pub struct HttpRequestParser {
    state: State,
}

impl Default for HttpRequestParser {
    fn default() -> HttpRequestParser {
        HttpRequestParser {
            state: State::Header,
        }
    }
}

fn parse_head(head: &[u8]) -> NetResult<HttpRequestPacket> {
    let text = str::from_utf8(head).map_err(|_| NetError::Fatal(ErrorKind::InvalidPacket))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');

    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) if !m.is_empty() && !u.is_empty() && v.starts_with("HTTP/") => {
            (m, u, v)
        }
        _ => return Err(NetError::Fatal(ErrorKind::InvalidPacket)),
    };

    let mut packet = HttpRequestPacket {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
        body: Vec::new(),
    };

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let colon = match line.find(':') {
            Some(pos) => pos,
            None => return Err(NetError::Fatal(ErrorKind::InvalidPacket)),
        };

        packet.headers.push((
            line[..colon].trim().to_string(),
            line[colon + 1..].trim().to_string(),
        ));
    }

    Ok(packet)
}

impl Parser for HttpRequestParser {
    type Output = HttpRequestPacket;

    fn parse(&mut self, buf: &mut Buffer) -> NetResult<Option<HttpRequestPacket>> {
        if let State::Header = self.state {
            let data = buf.grab_read();

            let window = &data[..data.len().min(MAX_HTTP_HEADER_SIZE + 4)];
            let end = match find_block_end(window) {
                Some(pos) => pos,
                None => {
                    if data.len() > MAX_HTTP_HEADER_SIZE {
                        return Err(NetError::Fatal(ErrorKind::InvalidPacket));
                    }
                    return Ok(None);
                }
            };

            if end > MAX_HTTP_HEADER_SIZE {
                return Err(NetError::Fatal(ErrorKind::InvalidPacket));
            }

            let packet = parse_head(&data[..end])?;

            let need = match packet.content_length() {
                Some(len) if len > MAX_HTTP_BODY_SIZE => {
                    return Err(NetError::Fatal(ErrorKind::PacketTooLarge))
                }
                Some(len) => len,
                None => 0,
            };

            buf.commit_read(end + 4);

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

fn find_block_end(window: &[u8]) -> Option<usize> {
    window.windows(4).position(|quad| quad == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_buffer() -> Buffer {
        Buffer::new(65536, MAX_HTTP_BODY_SIZE * 4)
    }

    fn feed(
        parser: &mut HttpRequestParser,
        buf: &mut Buffer,
        bytes: &[u8],
    ) -> NetResult<Option<HttpRequestPacket>> {
        let span = buf.grab_write(bytes.len()).unwrap();
        span.copy_from_slice(bytes);
        buf.commit_write(bytes.len());
        parser.parse(buf)
    }

    #[test]
    fn test_parse_simple_get() {
        let mut parser = HttpRequestParser::default();
        let mut buf = test_buffer();

        let req = feed(&mut parser, &mut buf, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap()
            .unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_post_with_body_across_reads() {
        let mut parser = HttpRequestParser::default();
        let mut buf = test_buffer();

        let head = b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 9\r\n\r\nfirst";
        assert!(feed(&mut parser, &mut buf, head).unwrap().is_none());

        let req = feed(&mut parser, &mut buf, b"-bit").unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body, b"first-bit");
    }

    #[test]
    fn test_partial_header_waits() {
        let mut parser = HttpRequestParser::default();
        let mut buf = test_buffer();

        assert!(feed(&mut parser, &mut buf, b"GET / HTTP/1.1\r\nHost:")
            .unwrap()
            .is_none());
        assert_eq!(buf.len(), 21);
    }

    #[test]
    fn test_bad_request_line_rejected() {
        let mut parser = HttpRequestParser::default();
        let mut buf = test_buffer();

        let err = feed(&mut parser, &mut buf, b"NOT-HTTP\r\n\r\n").unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::InvalidPacket));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut parser = HttpRequestParser::default();
        let mut buf = test_buffer();

        let head = format!(
            "PUT /big HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_HTTP_BODY_SIZE + 1
        );
        let err = feed(&mut parser, &mut buf, head.as_bytes()).unwrap_err();
        assert_eq!(err, NetError::Fatal(ErrorKind::PacketTooLarge));
    }

    #[test]
    fn test_response_framing_sets_content_length() {
        let mut res = HttpResponsePacket::new(200);
        res.set_header("Content-Type", "text/plain");
        res.body = b"hello".to_vec();

        let bytes = res.to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_request_write_roundtrip() {
        let mut req = HttpRequestPacket::default();
        req.method = "POST".to_string();
        req.uri = "/mirror".to_string();
        req.version = "HTTP/1.1".to_string();
        req.headers.push(("Host".to_string(), "svc".to_string()));
        req.body = b"payload".to_vec();

        let mut buf = test_buffer();
        req.write(&mut buf).unwrap();

        let mut parser = HttpRequestParser::default();
        let parsed = parser.parse(&mut buf).unwrap().unwrap();

        assert_eq!(parsed.method, req.method);
        assert_eq!(parsed.uri, req.uri);
        assert_eq!(parsed.header("host"), Some("svc"));
        assert_eq!(parsed.body, req.body);
    }

    #[test]
    fn test_response_status_reasons() {
        assert_eq!(HttpResponsePacket::new(404).reason, "Not Found");
        assert_eq!(HttpResponsePacket::new(599).reason, "Unknown");
    }
}
