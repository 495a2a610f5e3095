//! Outbound peer pool: named peers, reconnect with exponential backoff, an
//! optional hello exchange before a peer counts as usable, and transaction-id
//! demultiplexing of responses back to the requesters.

use crate::channel::{Channel, ChannelCore, Handler};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::packet::msg::{MsgPacket, MsgParser};
use crate::poller::WRITABLE;
use crate::reactor::Turn;
use crate::sockaddr::SockAddr;
use ballast::logging::{self, Logger};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// User hooks for pool traffic and peer lifecycle.
pub trait PoolHandler {
    /// A response matched a pending transaction id.
    fn on_response(&mut self, peer: &str, packet: MsgPacket);

    /// A pending request outlived its deadline.
    fn on_timeout(&mut self, _peer: &str, _trid: u16) {}

    fn on_peer_up(&mut self, _peer: &str) {}

    fn on_peer_down(&mut self, _peer: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Down,
    Connecting,
    Hello,
    Ready,
}

struct Entry {
    addr: SockAddr,
    state: EntryState,
    retry_at: Instant,
    backoff: Duration,
    fd: Option<RawFd>,
    outbox: VecDeque<MsgPacket>,
}

struct Pending {
    peer: String,
    deadline: Instant,
}

struct PoolShared {
    peers: HashMap<String, Entry>,
    pending: HashMap<u16, Pending>,
    next_trid: u16,
    hello: Option<MsgPacket>,
    backoff_base: Duration,
    backoff_ceiling: Duration,
    request_timeout: Duration,
    log: Logger,
}

impl PoolShared {
    fn alloc_trid(&mut self) -> u16 {
        loop {
            let trid = self.next_trid;
            self.next_trid = self.next_trid.wrapping_add(1).max(1);
            if !self.pending.contains_key(&trid) {
                return trid;
            }
        }
    }
}

/// Per-peer channel handler wiring a channel back into the pool state.
struct PeerChannel {
    peer: String,
    shared: Rc<RefCell<PoolShared>>,
    handler: Rc<RefCell<dyn PoolHandler>>,
}

impl PeerChannel {
    /// Moves the peer to Ready and flushes whatever queued up while it was
    /// connecting. Returns true when the transition happened.
    fn go_ready(&self, ch: &mut ChannelCore) -> bool {
        let mut shared = self.shared.borrow_mut();
        let base = shared.backoff_base;

        let entry = match shared.peers.get_mut(&self.peer) {
            Some(entry) => entry,
            None => return false,
        };

        entry.state = EntryState::Ready;
        entry.backoff = base;
        entry.fd = Some(ch.fd());

        while let Some(packet) = entry.outbox.pop_front() {
            if ch.write(&packet).is_err() {
                ch.expire();
                return false;
            }
        }

        true
    }
}

impl Handler for PeerChannel {
    type Parser = MsgParser;

    fn on_connected(&mut self, ch: &mut ChannelCore, _turn: &mut Turn) {
        let hello = {
            let mut shared = self.shared.borrow_mut();
            let hello = shared.hello.clone();

            if let Some(entry) = shared.peers.get_mut(&self.peer) {
                entry.fd = Some(ch.fd());
                if hello.is_some() {
                    entry.state = EntryState::Hello;
                }
            }

            hello
        };

        match hello {
            Some(packet) => {
                logging::debug!(ch.log(), "hello sent"; "peer" => self.peer.as_str());
                if ch.write(&packet).is_err() {
                    ch.expire();
                }
            }
            None => {
                if self.go_ready(ch) {
                    self.handler.borrow_mut().on_peer_up(&self.peer);
                }
            }
        }
    }

    fn on_writable(&mut self, ch: &mut ChannelCore, _turn: &mut Turn) {
        let mut shared = self.shared.borrow_mut();

        if let Some(entry) = shared.peers.get_mut(&self.peer) {
            if entry.state == EntryState::Ready {
                while let Some(packet) = entry.outbox.pop_front() {
                    if ch.write(&packet).is_err() {
                        ch.expire();
                        break;
                    }
                }
            }
        }
    }

    fn on_packet(&mut self, ch: &mut ChannelCore, _turn: &mut Turn, packet: MsgPacket) {
        let state = {
            let shared = self.shared.borrow();
            shared.peers.get(&self.peer).map(|entry| entry.state)
        };

        match state {
            Some(EntryState::Hello) => {
                // The first packet on a fresh channel is the hello reply.
                logging::debug!(ch.log(), "hello acknowledged"; "peer" => self.peer.as_str());
                if self.go_ready(ch) {
                    self.handler.borrow_mut().on_peer_up(&self.peer);
                }
            }
            Some(_) => {
                let pending = self.shared.borrow_mut().pending.remove(&packet.trid);

                match pending {
                    Some(_) => self.handler.borrow_mut().on_response(&self.peer, packet),
                    None => {
                        logging::warn!(ch.log(), "response with unknown trid dropped";
                                       "peer" => self.peer.as_str(), "trid" => packet.trid);
                    }
                }
            }
            None => {}
        }
    }

    fn on_error(&mut self, ch: &mut ChannelCore, turn: &mut Turn, kind: ErrorKind) {
        logging::debug!(ch.log(), "peer channel error";
                        "peer" => self.peer.as_str(), "kind" => kind.as_str());
        ch.expire();

        let was_usable = {
            let mut shared = self.shared.borrow_mut();
            let ceiling = shared.backoff_ceiling;

            match shared.peers.get_mut(&self.peer) {
                Some(entry) => {
                    let was_usable = entry.state == EntryState::Ready;
                    entry.state = EntryState::Down;
                    entry.fd = None;
                    entry.retry_at = turn.now + entry.backoff;
                    entry.backoff = (entry.backoff * 2).min(ceiling);
                    was_usable
                }
                None => false,
            }
        };

        if was_usable {
            self.handler.borrow_mut().on_peer_down(&self.peer);
        }
    }
}

pub struct Pool {
    shared: Rc<RefCell<PoolShared>>,
    handler: Rc<RefCell<dyn PoolHandler>>,
}

impl Pool {
    pub fn new(
        handler: Rc<RefCell<dyn PoolHandler>>,
        hello: Option<MsgPacket>,
        backoff_ceiling: Duration,
        request_timeout: Duration,
        log: Logger,
    ) -> Pool {
        Pool {
            shared: Rc::new(RefCell::new(PoolShared {
                peers: HashMap::new(),
                pending: HashMap::new(),
                next_trid: 1,
                hello,
                backoff_base: Duration::from_millis(250),
                backoff_ceiling,
                request_timeout,
                log,
            })),
            handler,
        }
    }

    /// Registers a peer. The next `tick` starts connecting.
    pub fn add_peer(&self, name: &str, addr: SockAddr) {
        let mut shared = self.shared.borrow_mut();
        let base = shared.backoff_base;

        shared.peers.insert(
            name.to_string(),
            Entry {
                addr,
                state: EntryState::Down,
                retry_at: Instant::now(),
                backoff: base,
                fd: None,
                outbox: VecDeque::new(),
            },
        );
    }

    /// Current state of a peer, for diagnostics.
    pub fn peer_state(&self, name: &str) -> Option<&'static str> {
        self.shared
            .borrow()
            .peers
            .get(name)
            .map(|entry| match entry.state {
                EntryState::Down => "down",
                EntryState::Connecting => "connecting",
                EntryState::Hello => "hello",
                EntryState::Ready => "ready",
            })
    }

    /// Queues a request on a usable peer. Allocates and returns the
    /// transaction id the response will carry. A peer that is still
    /// connecting or backed off answers `Wait`.
    pub fn request(&self, turn: &mut Turn, peer: &str, mut packet: MsgPacket) -> NetResult<u16> {
        let mut shared = self.shared.borrow_mut();
        let deadline = turn.now + shared.request_timeout;
        let trid = shared.alloc_trid();

        let fd = {
            let entry = shared
                .peers
                .get_mut(peer)
                .ok_or(NetError::Fatal(ErrorKind::ConnectFailed))?;

            if entry.state != EntryState::Ready {
                return Err(NetError::Wait);
            }

            packet.trid = trid;
            entry.outbox.push_back(packet);
            entry.fd
        };

        shared.pending.insert(
            trid,
            Pending {
                peer: peer.to_string(),
                deadline,
            },
        );

        if let Some(fd) = fd {
            let _ = turn.poller.or_mask(fd, WRITABLE);
        }

        Ok(trid)
    }

    /// Drives reconnects and pending-request deadlines. Call once per
    /// main-loop tick.
    pub fn tick(&self, turn: &mut Turn) {
        self.connect_due(turn);
        self.expire_pending(turn);
    }

    fn connect_due(&self, turn: &mut Turn) {
        let due: Vec<(String, SockAddr)> = {
            let shared = self.shared.borrow();
            shared
                .peers
                .iter()
                .filter(|(_, entry)| entry.state == EntryState::Down && entry.retry_at <= turn.now)
                .map(|(name, entry)| (name.clone(), entry.addr.clone()))
                .collect()
        };

        for (name, addr) in due {
            let log = self.shared.borrow().log.clone();

            let channel = Channel::connect(
                &addr,
                turn.poller.clone(),
                None,
                log.clone(),
                PeerChannel {
                    peer: name.clone(),
                    shared: self.shared.clone(),
                    handler: self.handler.clone(),
                },
            );

            let mut shared = self.shared.borrow_mut();
            let ceiling = shared.backoff_ceiling;

            let entry = match shared.peers.get_mut(&name) {
                Some(entry) => entry,
                None => continue,
            };

            match channel {
                Ok(channel) => {
                    entry.state = EntryState::Connecting;
                    let fd = channel.core().fd();
                    turn.spawn(fd, Box::new(channel));
                    logging::debug!(log, "connecting"; "peer" => name.as_str(), "addr" => %addr);
                }
                Err(err) => {
                    entry.retry_at = turn.now + entry.backoff;
                    entry.backoff = (entry.backoff * 2).min(ceiling);
                    logging::warn!(log, "connect attempt failed";
                                   "peer" => name.as_str(), "addr" => %addr, "err" => %err);
                }
            }
        }
    }

    fn expire_pending(&self, turn: &mut Turn) {
        let expired: Vec<(u16, String)> = {
            let shared = self.shared.borrow();
            shared
                .pending
                .iter()
                .filter(|(_, pending)| pending.deadline <= turn.now)
                .map(|(&trid, pending)| (trid, pending.peer.clone()))
                .collect()
        };

        for (trid, peer) in expired {
            self.shared.borrow_mut().pending.remove(&trid);
            self.handler.borrow_mut().on_timeout(&peer, trid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::packet::{Packet, Parser};
    use crate::reactor::Reactor;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    struct RecordingHandler {
        responses: Rc<RefCell<Vec<(String, MsgPacket)>>>,
        ups: Rc<RefCell<Vec<String>>>,
        downs: Rc<RefCell<Vec<String>>>,
        timeouts: Rc<RefCell<Vec<u16>>>,
    }

    impl PoolHandler for RecordingHandler {
        fn on_response(&mut self, peer: &str, packet: MsgPacket) {
            self.responses.borrow_mut().push((peer.to_string(), packet));
        }

        fn on_timeout(&mut self, _peer: &str, trid: u16) {
            self.timeouts.borrow_mut().push(trid);
        }

        fn on_peer_up(&mut self, peer: &str) {
            self.ups.borrow_mut().push(peer.to_string());
        }

        fn on_peer_down(&mut self, peer: &str) {
            self.downs.borrow_mut().push(peer.to_string());
        }
    }

    struct Env {
        reactor: Reactor,
        pool: Pool,
        responses: Rc<RefCell<Vec<(String, MsgPacket)>>>,
        ups: Rc<RefCell<Vec<String>>>,
        downs: Rc<RefCell<Vec<String>>>,
        timeouts: Rc<RefCell<Vec<u16>>>,
    }

    fn env(hello: Option<MsgPacket>, request_timeout: Duration) -> Env {
        let log = ballast::logging::null();
        let reactor = Reactor::new(None, log.clone()).unwrap();

        let responses = Rc::new(RefCell::new(Vec::new()));
        let ups = Rc::new(RefCell::new(Vec::new()));
        let downs = Rc::new(RefCell::new(Vec::new()));
        let timeouts = Rc::new(RefCell::new(Vec::new()));

        let handler = Rc::new(RefCell::new(RecordingHandler {
            responses: responses.clone(),
            ups: ups.clone(),
            downs: downs.clone(),
            timeouts: timeouts.clone(),
        }));

        let pool = Pool::new(
            handler,
            hello,
            Duration::from_secs(2),
            request_timeout,
            log,
        );

        Env {
            reactor,
            pool,
            responses,
            ups,
            downs,
            timeouts,
        }
    }

    fn run_tick(env: &mut Env) {
        let mut turn = Turn::new(env.reactor.poller().clone(), ballast::logging::null());
        env.pool.tick(&mut turn);
        env.reactor.absorb(turn);
        env.reactor.dispatch(50).unwrap();
    }

    /// A peer that answers every request with the same trid and a fixed
    /// body. Serves exactly `count` packets.
    fn echo_peer(count: usize) -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut parser = MsgParser::default();
            let mut buf = Buffer::new(65536, 65536 * 16);

            let mut served = 0;
            while served < count {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    return;
                }

                let span = buf.grab_write(n).unwrap();
                span.copy_from_slice(&chunk[..n]);
                buf.commit_write(n);

                while let Some(request) = parser.parse(&mut buf).unwrap() {
                    let mut response = MsgPacket::new("OK");
                    response.trid = request.trid;
                    response.body = b"done".to_vec();
                    stream.write_all(&response.to_bytes()).unwrap();
                    served += 1;
                }
            }

            // Hold the socket open until the test is over.
            std::thread::sleep(Duration::from_millis(200));
        });

        (addr, handle)
    }

    #[test]
    fn test_request_response_roundtrip() {
        let (addr, handle) = echo_peer(1);
        let mut env = env(None, Duration::from_secs(5));

        env.pool.add_peer("upstream", SockAddr::from(addr));

        for _ in 0..20 {
            run_tick(&mut env);
            if !env.ups.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(env.ups.borrow().as_slice(), &["upstream".to_string()]);
        assert_eq!(env.pool.peer_state("upstream"), Some("ready"));

        let trid = {
            let mut turn = Turn::new(env.reactor.poller().clone(), ballast::logging::null());
            let mut packet = MsgPacket::new("WORK");
            packet.body = b"payload".to_vec();
            let trid = env.pool.request(&mut turn, "upstream", packet).unwrap();
            env.reactor.absorb(turn);
            trid
        };

        for _ in 0..20 {
            run_tick(&mut env);
            if !env.responses.borrow().is_empty() {
                break;
            }
        }

        let responses = env.responses.borrow();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "upstream");
        assert_eq!(responses[0].1.trid, trid);
        assert_eq!(responses[0].1.body, b"done");

        drop(responses);
        handle.join().unwrap();
    }

    #[test]
    fn test_hello_exchanged_before_ready() {
        let (addr, handle) = echo_peer(1);

        let mut hello = MsgPacket::new("HELO");
        hello.body = b"node-1".to_vec();
        let mut env = env(Some(hello), Duration::from_secs(5));

        env.pool.add_peer("upstream", SockAddr::from(addr));

        // The peer is not usable until the hello reply lands.
        run_tick(&mut env);
        assert_ne!(env.pool.peer_state("upstream"), Some("ready"));

        for _ in 0..20 {
            run_tick(&mut env);
            if env.pool.peer_state("upstream") == Some("ready") {
                break;
            }
        }

        assert_eq!(env.pool.peer_state("upstream"), Some("ready"));
        assert_eq!(env.ups.borrow().len(), 1);
        // The hello reply is consumed by the handshake, not routed.
        assert!(env.responses.borrow().is_empty());

        handle.join().unwrap();
    }

    #[test]
    fn test_request_on_down_peer_waits() {
        let mut env = env(None, Duration::from_secs(5));
        env.pool
            .add_peer("upstream", SockAddr::resolve("127.0.0.1", "9").unwrap()[0].clone());

        let mut turn = Turn::new(env.reactor.poller().clone(), ballast::logging::null());
        let result = env.pool.request(&mut turn, "upstream", MsgPacket::new("X"));
        assert_eq!(result.unwrap_err(), NetError::Wait);

        let unknown = env.pool.request(&mut turn, "nobody", MsgPacket::new("X"));
        assert_eq!(
            unknown.unwrap_err(),
            NetError::Fatal(ErrorKind::ConnectFailed)
        );
    }

    #[test]
    fn test_unreachable_peer_backs_off() {
        let mut env = env(None, Duration::from_secs(5));

        // A port with nothing listening; connects fail fast on loopback.
        env.pool
            .add_peer("upstream", SockAddr::resolve("127.0.0.1", "9").unwrap()[0].clone());

        for _ in 0..10 {
            run_tick(&mut env);
        }

        assert_eq!(env.pool.peer_state("upstream"), Some("down"));
        assert!(env.responses.borrow().is_empty());
    }

    #[test]
    fn test_pending_timeout_fires() {
        let (addr, handle) = echo_peer(0);
        let mut env = env(None, Duration::from_millis(10));

        env.pool.add_peer("upstream", SockAddr::from(addr));

        for _ in 0..20 {
            run_tick(&mut env);
            if env.pool.peer_state("upstream") == Some("ready") {
                break;
            }
        }

        // Insert a pending entry directly; the peer never answers.
        {
            let mut shared = env.pool.shared.borrow_mut();
            shared.pending.insert(
                42,
                Pending {
                    peer: "upstream".to_string(),
                    deadline: Instant::now(),
                },
            );
        }

        std::thread::sleep(Duration::from_millis(20));
        run_tick(&mut env);

        assert_eq!(env.timeouts.borrow().as_slice(), &[42]);
        assert!(env.downs.borrow().len() <= 1);

        handle.join().unwrap();
    }
}
