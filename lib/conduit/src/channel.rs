//! Buffered, framed endpoint over one TCP or TLS connection. The channel
//! owns the descriptor and the buffer pair, drives a packet parser on the
//! read side and a drain queue on the write side, and surfaces everything to
//! the application through the `Handler` hooks.

use crate::buffer::Buffer;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::packet::{Packet, Parser};
use crate::poller::{Poller, ERROR, HANG_UP, INVALID, PRIORITY_READABLE, READABLE, WRITABLE};
use crate::reactor::{Client, Turn};
use crate::sockaddr::SockAddr;
use crate::socket::{self, Fd, FdIo};
use crate::tls::TlsSession;
use ballast::logging::{self, Logger};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Bytes pulled off the socket per readiness event before yielding back to
/// the reactor.
pub const READ_HIGH_WATER: usize = 65536;

const READ_BUF_SIZE: usize = 65536;
const WRITE_BUF_SIZE: usize = 65536;
const BUF_CAP: usize = crate::packet::msg::MAX_BODY_SIZE * 4;

/// User hooks for one channel flavor. The associated parser decides the wire
/// format; the hooks receive complete packets and error events.
pub trait Handler {
    type Parser: Parser + Default;

    /// A complete packet arrived.
    fn on_packet(
        &mut self,
        ch: &mut ChannelCore,
        turn: &mut Turn,
        packet: <Self::Parser as Parser>::Output,
    );

    /// An outbound connect finished successfully.
    fn on_connected(&mut self, _ch: &mut ChannelCore, _turn: &mut Turn) {}

    /// The socket reported writability, before the queue drains. Handlers
    /// holding their own outbound queue top up the write buffer here.
    fn on_writable(&mut self, _ch: &mut ChannelCore, _turn: &mut Turn) {}

    /// The single error hook. The default logs and expires the channel.
    fn on_error(&mut self, ch: &mut ChannelCore, _turn: &mut Turn, kind: ErrorKind) {
        logging::debug!(ch.log(), "channel error"; "kind" => kind.as_str());
        ch.expire();
    }
}

enum Transport {
    Plain,
    Tls(TlsSession),
}

/// The parser-independent half of a channel: descriptor, buffers, transport
/// and timestamps. Handlers receive this to write responses and to manage
/// the channel lifecycle.
pub struct ChannelCore {
    fd: Fd,
    poller: Rc<Poller>,
    rbuf: Buffer,
    wbuf: Buffer,
    transport: Transport,
    peer: Option<SockAddr>,
    last_read: Instant,
    last_write: Instant,
    ping_timeout: Option<Duration>,
    connecting: bool,
    expired: bool,
    log: Logger,
}

impl ChannelCore {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    #[inline]
    pub fn peer(&self) -> Option<&SockAddr> {
        self.peer.as_ref()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    #[inline]
    pub fn last_read_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_read)
    }

    #[inline]
    pub fn last_write_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_write)
    }

    /// Marks the channel for teardown on the next tick.
    #[inline]
    pub fn expire(&mut self) {
        self.expired = true;
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Serializes a packet into the write queue and arms writability.
    /// Partial drains are the poller's business from here on.
    pub fn write<P: Packet>(&mut self, packet: &P) -> NetResult<usize> {
        let written = packet.write(&mut self.wbuf)?;

        // A channel not yet registered simply misses the mask update here;
        // registration installs the write interest through `interest()`.
        let _ = self.poller.or_mask(self.fd.raw(), WRITABLE);

        Ok(written)
    }

    /// Bytes still queued for the kernel.
    #[inline]
    pub fn pending_write(&self) -> usize {
        self.wbuf.len()
    }

    fn fill_read(&mut self) -> io::Result<usize> {
        let fd = self.fd.raw();
        match &mut self.transport {
            Transport::Plain => self.rbuf.ingress(FdIo(fd), READ_HIGH_WATER),
            Transport::Tls(session) => session.read_into(fd, &mut self.rbuf, READ_HIGH_WATER),
        }
    }

    fn flush_write(&mut self) -> io::Result<usize> {
        let fd = self.fd.raw();
        let n = match &mut self.transport {
            Transport::Plain => self.wbuf.egress(FdIo(fd))?,
            Transport::Tls(session) => session.write_from(fd, &mut self.wbuf)?,
        };

        let still_pending = !self.wbuf.is_empty()
            || matches!(&self.transport, Transport::Tls(session) if session.wants_write());

        if !still_pending {
            let _ = self.poller.and_mask(fd, !WRITABLE);
        }

        Ok(n)
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        // Deregistration before close; reactor-driven teardown has already
        // done this and the call degrades to a no-op.
        self.poller.remove(self.fd.raw());
    }
}

/// A channel: core state plus a parser and the user handler.
pub struct Channel<H: Handler> {
    core: ChannelCore,
    parser: H::Parser,
    handler: H,
}

impl<H: Handler> Channel<H> {
    /// Wraps an accepted (or otherwise connected) descriptor.
    pub fn new(
        fd: Fd,
        poller: Rc<Poller>,
        tls: Option<TlsSession>,
        peer: Option<SockAddr>,
        ping_timeout: Option<Duration>,
        log: Logger,
        handler: H,
    ) -> Channel<H> {
        let now = Instant::now();

        Channel {
            core: ChannelCore {
                fd,
                poller,
                rbuf: Buffer::new(READ_BUF_SIZE, BUF_CAP),
                wbuf: Buffer::new(WRITE_BUF_SIZE, BUF_CAP),
                transport: match tls {
                    Some(session) => Transport::Tls(session),
                    None => Transport::Plain,
                },
                peer,
                last_read: now,
                last_write: now,
                ping_timeout,
                connecting: false,
                expired: false,
                log,
            },
            parser: H::Parser::default(),
            handler,
        }
    }

    /// Starts an outbound connect. The channel arms writability and settles
    /// the outcome on the first readiness event.
    pub fn connect(
        addr: &SockAddr,
        poller: Rc<Poller>,
        ping_timeout: Option<Duration>,
        log: Logger,
        handler: H,
    ) -> NetResult<Channel<H>> {
        let (fd, _in_progress) = socket::connect_async(addr)?;

        let mut channel = Channel::new(
            fd,
            poller,
            None,
            Some(addr.clone()),
            ping_timeout,
            log,
            handler,
        );
        channel.core.connecting = true;

        Ok(channel)
    }

    #[inline]
    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    #[inline]
    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    #[inline]
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn read_ready(&mut self, turn: &mut Turn) {
        let core = &mut self.core;
        let handler = &mut self.handler;
        let parser = &mut self.parser;

        match core.fill_read() {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                handler.on_error(core, turn, ErrorKind::ReadClosed);
                core.expire();
                return;
            }
            Err(ref err) => {
                logging::debug!(core.log, "read failed"; "err" => %err);
                handler.on_error(core, turn, ErrorKind::ReadFailed);
                core.expire();
                return;
            }
        }

        loop {
            match parser.parse(&mut core.rbuf) {
                Ok(Some(packet)) => {
                    core.last_read = turn.now;
                    handler.on_packet(core, turn, packet);

                    if core.expired {
                        return;
                    }
                }
                Ok(None) => return,
                Err(NetError::Wait) => return,
                Err(NetError::Fatal(kind)) => {
                    handler.on_error(core, turn, kind);
                    core.expire();
                    return;
                }
            }
        }
    }

    fn write_ready(&mut self, turn: &mut Turn) {
        let core = &mut self.core;

        self.handler.on_writable(core, turn);

        match core.flush_write() {
            Ok(n) => {
                if n > 0 {
                    core.last_write = turn.now;
                }
            }
            Err(ref err) => {
                logging::debug!(core.log, "write failed"; "err" => %err);
                self.handler.on_error(core, turn, ErrorKind::WriteFailed);
                core.expire();
            }
        }
    }
}

impl<H: Handler> Client for Channel<H> {
    fn interest(&self) -> u32 {
        if self.core.connecting {
            WRITABLE
        } else if self.core.pending_write() > 0 {
            READABLE | WRITABLE
        } else {
            READABLE
        }
    }

    fn on_io(&mut self, turn: &mut Turn, fd: RawFd, mask: u32, remove: &mut bool) {
        if mask & (ERROR | INVALID) != 0 {
            let kind = if self.core.connecting {
                ErrorKind::ConnectFailed
            } else {
                ErrorKind::ReadFailed
            };
            self.handler.on_error(&mut self.core, turn, kind);
            self.core.expire();
            *remove = true;
            return;
        }

        if self.core.connecting && mask & WRITABLE != 0 {
            let (connected, errno) = socket::is_connected(fd);

            if !connected {
                logging::debug!(self.core.log, "connect failed"; "errno" => errno);
                self.handler.on_error(&mut self.core, turn, ErrorKind::ConnectFailed);
                self.core.expire();
                *remove = true;
                return;
            }

            self.core.connecting = false;
            if turn.poller.set_mask(fd, READABLE).is_err() {
                self.core.expire();
                *remove = true;
                return;
            }

            self.handler.on_connected(&mut self.core, turn);
        }

        if mask & (READABLE | PRIORITY_READABLE | HANG_UP) != 0 && !self.core.expired {
            self.read_ready(turn);
        }

        if mask & WRITABLE != 0 && !self.core.connecting && !self.core.expired {
            self.write_ready(turn);
        }

        if self.core.expired {
            *remove = true;
        }
    }

    fn on_sweep(&mut self, turn: &mut Turn, now: Instant) -> bool {
        if self.core.expired {
            return false;
        }

        if let Some(timeout) = self.core.ping_timeout {
            if self.core.last_read_elapsed(now) >= timeout {
                self.handler.on_error(&mut self.core, turn, ErrorKind::PingTimeout);
                self.core.expire();
            }
        }

        !self.core.expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::msg::{MsgPacket, MsgParser};
    use crate::packet::RawParser;
    use crate::reactor::Reactor;
    use std::cell::RefCell;
    use std::net::TcpListener;

    struct Recorder {
        packets: Rc<RefCell<Vec<MsgPacket>>>,
        errors: Rc<RefCell<Vec<ErrorKind>>>,
        echo: bool,
    }

    impl Handler for Recorder {
        type Parser = MsgParser;

        fn on_packet(&mut self, ch: &mut ChannelCore, _turn: &mut Turn, packet: MsgPacket) {
            if self.echo {
                ch.write(&packet).unwrap();
            }
            self.packets.borrow_mut().push(packet);
        }

        fn on_error(&mut self, ch: &mut ChannelCore, _turn: &mut Turn, kind: ErrorKind) {
            self.errors.borrow_mut().push(kind);
            ch.expire();
        }
    }

    struct LoopEnv {
        reactor: Reactor,
        server_fd: RawFd,
        client: std::net::TcpStream,
        packets: Rc<RefCell<Vec<MsgPacket>>>,
        errors: Rc<RefCell<Vec<ErrorKind>>>,
    }

    /// One server-side channel over a real loopback connection.
    fn loopback(echo: bool, ping_timeout: Option<Duration>) -> LoopEnv {
        use std::os::unix::io::IntoRawFd;

        let log = ballast::logging::null();
        let mut reactor = Reactor::new(None, log.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let raw = accepted.into_raw_fd();
        socket::set_nonblocking(raw, true).unwrap();

        let packets = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(Vec::new()));

        let channel = Channel::new(
            Fd::new(raw),
            reactor.poller().clone(),
            None,
            None,
            ping_timeout,
            log,
            Recorder {
                packets: packets.clone(),
                errors: errors.clone(),
                echo,
            },
        );

        reactor.register(raw, Box::new(channel)).unwrap();

        LoopEnv {
            reactor,
            server_fd: raw,
            client,
            packets,
            errors,
        }
    }

    fn pump(env: &mut LoopEnv, rounds: usize) {
        for _ in 0..rounds {
            env.reactor.dispatch(50).unwrap();
        }
    }

    #[test]
    fn test_packets_delivered_in_order() {
        use std::io::Write;

        let mut env = loopback(false, None);

        let mut wire = Vec::new();
        for i in 0..5u16 {
            let mut pk = MsgPacket::new("SEQ");
            pk.trid = i;
            pk.body = format!("payload-{}", i).into_bytes();
            wire.extend_from_slice(&pk.to_bytes());
        }
        env.client.write_all(&wire).unwrap();

        pump(&mut env, 5);

        let packets = env.packets.borrow();
        assert_eq!(packets.len(), 5);
        for (i, pk) in packets.iter().enumerate() {
            assert_eq!(pk.trid, i as u16);
            assert_eq!(pk.body, format!("payload-{}", i).into_bytes());
        }
    }

    #[test]
    fn test_echo_roundtrip_identity() {
        use std::io::{Read, Write};

        let mut env = loopback(true, None);

        let mut pk = MsgPacket::new("ECHO");
        pk.trid = 1;
        pk.body = b"hello world".to_vec();
        let wire = pk.to_bytes();

        env.client.write_all(&wire).unwrap();
        pump(&mut env, 5);

        env.client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut back = vec![0u8; wire.len()];
        env.client.read_exact(&mut back).unwrap();

        assert_eq!(back, wire);
        assert_eq!(env.packets.borrow().len(), 1);
    }

    #[test]
    fn test_oversized_body_expires_channel() {
        use std::io::Write;

        let mut env = loopback(false, None);

        env.client.write_all(b"CODE 0 000 9999999999\r\n").unwrap();
        pump(&mut env, 3);

        assert_eq!(env.errors.borrow()[0], ErrorKind::PacketTooLarge);
        assert!(env.reactor.is_empty());

        // The server side closed; the client sees EOF.
        use std::io::Read;
        env.client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(env.client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_remote_close_surfaces_read_closed() {
        let mut env = loopback(false, None);

        env.client.shutdown(std::net::Shutdown::Both).unwrap();

        pump(&mut env, 3);
        assert_eq!(env.errors.borrow()[0], ErrorKind::ReadClosed);
    }

    #[test]
    fn test_ping_timeout_reaps_idle_channel() {
        let mut env = loopback(false, Some(Duration::from_millis(50)));

        std::thread::sleep(Duration::from_millis(80));
        env.reactor.sweep(Instant::now());

        assert_eq!(env.errors.borrow()[0], ErrorKind::PingTimeout);
        assert!(env.reactor.is_empty());
        let _ = env.server_fd;
    }

    struct NullHandler;

    impl Handler for NullHandler {
        type Parser = RawParser;

        fn on_packet(
            &mut self,
            _ch: &mut ChannelCore,
            _turn: &mut Turn,
            _packet: crate::packet::RawPacket,
        ) {
        }
    }

    #[test]
    fn test_outbound_connect_fires_on_connected() {
        struct ConnectProbe {
            connected: Rc<RefCell<bool>>,
        }

        impl Handler for ConnectProbe {
            type Parser = RawParser;

            fn on_packet(
                &mut self,
                _ch: &mut ChannelCore,
                _turn: &mut Turn,
                _packet: crate::packet::RawPacket,
            ) {
            }

            fn on_connected(&mut self, _ch: &mut ChannelCore, _turn: &mut Turn) {
                *self.connected.borrow_mut() = true;
            }
        }

        let log = ballast::logging::null();
        let mut reactor = Reactor::new(None, log.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = SockAddr::from(listener.local_addr().unwrap());

        let connected = Rc::new(RefCell::new(false));
        let channel = Channel::connect(
            &addr,
            reactor.poller().clone(),
            None,
            log,
            ConnectProbe {
                connected: connected.clone(),
            },
        )
        .unwrap();

        let fd = channel.core().fd();
        reactor.register(fd, Box::new(channel)).unwrap();

        for _ in 0..10 {
            reactor.dispatch(100).unwrap();
            if *connected.borrow() {
                break;
            }
        }

        assert!(*connected.borrow());
        let _ = listener.accept().unwrap();
    }

    #[test]
    fn test_write_arms_and_drains() {
        use std::io::Read;
        use std::os::unix::io::IntoRawFd;

        let log = ballast::logging::null();
        let mut reactor = Reactor::new(None, log.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let raw = accepted.into_raw_fd();
        socket::set_nonblocking(raw, true).unwrap();

        let mut channel = Channel::new(
            Fd::new(raw),
            reactor.poller().clone(),
            None,
            None,
            None,
            log,
            NullHandler,
        );

        // Queued before registration: `interest()` must pick up writability.
        let mut pk = MsgPacket::new("PUSH");
        pk.body = b"queued".to_vec();
        channel.core_mut().write(&pk).unwrap();
        assert!(channel.core().pending_write() > 0);

        reactor.register(raw, Box::new(channel)).unwrap();

        for _ in 0..5 {
            reactor.dispatch(50).unwrap();
        }

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut back = vec![0u8; pk.to_bytes().len()];
        client.read_exact(&mut back).unwrap();
        assert_eq!(back, pk.to_bytes());
    }
}
