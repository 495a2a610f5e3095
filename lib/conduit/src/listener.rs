//! Accepting endpoints. The single-process listener hands accepted sockets
//! straight to the application; the parent/child pair ships them across
//! process boundaries through the control channel instead.

use crate::error::{errno_is_retry, ErrorKind, NetError, NetResult};
use crate::instance::ChildTable;
use crate::poller::READABLE;
use crate::reactor::{Client, Turn};
use crate::sockaddr::SockAddr;
use crate::socket::{self, Fd};
use crate::tls::{TlsHandshake, TlsSession};
use ballast::logging::{self, Logger};
use rustls::ServerConfig;
use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

const LISTEN_BACKLOG: libc::c_int = 1024;

/// What a listener is for. The tag travels with every descriptor passed to
/// a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Service,
    ServiceTls,
    ServiceHttp,
    ServiceHttps,
    Admin,
    AdminTls,
    Appended,
}

impl ListenerKind {
    pub fn tag(self) -> u32 {
        match self {
            ListenerKind::Service => 1,
            ListenerKind::ServiceTls => 2,
            ListenerKind::ServiceHttp => 3,
            ListenerKind::ServiceHttps => 4,
            ListenerKind::Admin => 5,
            ListenerKind::AdminTls => 6,
            ListenerKind::Appended => 7,
        }
    }

    pub fn from_tag(tag: u32) -> Option<ListenerKind> {
        Some(match tag {
            1 => ListenerKind::Service,
            2 => ListenerKind::ServiceTls,
            3 => ListenerKind::ServiceHttp,
            4 => ListenerKind::ServiceHttps,
            5 => ListenerKind::Admin,
            6 => ListenerKind::AdminTls,
            7 => ListenerKind::Appended,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ListenerKind::Service => "service",
            ListenerKind::ServiceTls => "service-tls",
            ListenerKind::ServiceHttp => "service-http",
            ListenerKind::ServiceHttps => "service-https",
            ListenerKind::Admin => "admin",
            ListenerKind::AdminTls => "admin-tls",
            ListenerKind::Appended => "appended",
        }
    }
}

/// Everything the application needs to turn an accepted socket into a
/// channel. Dropping it unconsumed closes the socket and frees the session.
pub struct Accepted {
    pub fd: Fd,
    pub peer: SockAddr,
    pub kind: ListenerKind,
    pub tls: Option<TlsSession>,
}

/// The user seam of every listener flavor. Returning false refuses the
/// connection; the framework closes it.
pub trait AcceptHandler {
    fn on_accept(&mut self, turn: &mut Turn, accepted: Accepted) -> bool;
}

fn accept_raw(listen_fd: RawFd) -> io::Result<(Fd, SockAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let raw = unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };

    if raw == -1 {
        return Err(io::Error::last_os_error());
    }

    let fd = Fd::new(raw);
    let peer = SockAddr::from_raw(&storage, len)
        .unwrap_or_else(|_| SockAddr::any_v4(0));

    Ok((fd, peer))
}

fn open_listen_fd(addr: &SockAddr) -> NetResult<Fd> {
    let raw = unsafe { libc::socket(addr.family(), libc::SOCK_STREAM, 0) };
    if raw == -1 {
        return Err(NetError::Fatal(ErrorKind::ListenerOpenFailed));
    }

    let fd = Fd::new(raw);

    socket::set_reuseaddr(raw, true)
        .map_err(|_| NetError::Fatal(ErrorKind::ListenerOpenFailed))?;

    let (storage, len) = addr.to_raw();
    let rc = unsafe {
        libc::bind(
            raw,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc == -1 {
        return Err(NetError::Fatal(ErrorKind::ListenerOpenFailed));
    }

    if unsafe { libc::listen(raw, LISTEN_BACKLOG) } == -1 {
        return Err(NetError::Fatal(ErrorKind::ListenerOpenFailed));
    }

    socket::set_nonblocking(raw, true)
        .map_err(|_| NetError::Fatal(ErrorKind::ListenerOpenFailed))?;

    Ok(fd)
}

/// Single-process listener: accept, optionally run the TLS handshake, hand
/// the connection to the application.
pub struct Listener {
    fd: Fd,
    kind: ListenerKind,
    auto_async: bool,
    tls: Option<Arc<ServerConfig>>,
    handler: Rc<RefCell<dyn AcceptHandler>>,
    log: Logger,
}

impl Listener {
    pub fn open(
        addr: &SockAddr,
        kind: ListenerKind,
        tls: Option<Arc<ServerConfig>>,
        handler: Rc<RefCell<dyn AcceptHandler>>,
        log: Logger,
    ) -> NetResult<Listener> {
        let fd = open_listen_fd(addr)?;

        logging::info!(log, "listener open";
                       "addr" => %addr, "kind" => kind.name(), "fd" => fd.raw(),
                       "tls" => tls.is_some());

        Ok(Listener {
            fd,
            kind,
            auto_async: true,
            tls,
            handler,
            log,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    #[inline]
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }
}

impl Client for Listener {
    fn interest(&self) -> u32 {
        READABLE
    }

    fn on_io(&mut self, turn: &mut Turn, _fd: RawFd, _mask: u32, _remove: &mut bool) {
        let (fd, peer) = match accept_raw(self.fd.raw()) {
            Ok(pair) => pair,
            Err(err) => {
                if !errno_is_retry(err.raw_os_error().unwrap_or(0)) {
                    // Accept failures log and continue; the listener stays.
                    logging::warn!(self.log, "accept failed";
                                   "fd" => self.fd.raw(), "err" => %err);
                }
                return;
            }
        };

        if self.auto_async {
            if let Err(err) = socket::set_nonblocking(fd.raw(), true) {
                logging::warn!(self.log, "failed to set accepted fd nonblocking"; "err" => %err);
                return;
            }
        }

        logging::debug!(self.log, "accepted";
                        "peer" => %peer, "kind" => self.kind.name(), "fd" => fd.raw());

        dispatch_accept(
            turn,
            fd,
            peer,
            self.kind,
            self.tls.as_ref(),
            &self.handler,
            &self.log,
        );
    }
}

/// Shared tail of every accept flow: launch the TLS handshake when a context
/// is present, otherwise call the accept handler directly.
fn dispatch_accept(
    turn: &mut Turn,
    fd: Fd,
    peer: SockAddr,
    kind: ListenerKind,
    tls: Option<&Arc<ServerConfig>>,
    handler: &Rc<RefCell<dyn AcceptHandler>>,
    log: &Logger,
) {
    if let Some(config) = tls {
        let session = match TlsSession::new(config) {
            Ok(session) => session,
            Err(err) => {
                logging::warn!(log, "failed to create tls session"; "err" => %err);
                return;
            }
        };

        let raw = fd.raw();
        let hs = TlsHandshake::start(fd, session, peer, kind, handler.clone(), log.clone());
        turn.spawn(raw, Box::new(hs));
        return;
    }

    let accepted = Accepted {
        fd,
        peer,
        kind,
        tls: None,
    };

    if !handler.borrow_mut().on_accept(turn, accepted) {
        logging::debug!(log, "accept refused by handler"; "kind" => kind.name());
    }
}

/// Parent-side listener in the multi-process model: accepts and forwards the
/// socket round-robin to a child over its control pair, then closes the
/// local copy.
pub struct ParentListener {
    fd: Fd,
    kind: ListenerKind,
    auto_async: bool,
    children: Rc<RefCell<ChildTable>>,
    log: Logger,
}

impl ParentListener {
    pub fn open(
        addr: &SockAddr,
        kind: ListenerKind,
        children: Rc<RefCell<ChildTable>>,
        log: Logger,
    ) -> NetResult<ParentListener> {
        let fd = open_listen_fd(addr)?;

        logging::info!(log, "parent listener open";
                       "addr" => %addr, "kind" => kind.name(), "fd" => fd.raw());

        Ok(ParentListener {
            fd,
            kind,
            auto_async: true,
            children,
            log,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }
}

impl Client for ParentListener {
    fn interest(&self) -> u32 {
        READABLE
    }

    fn on_io(&mut self, _turn: &mut Turn, _fd: RawFd, _mask: u32, _remove: &mut bool) {
        let (fd, peer) = match accept_raw(self.fd.raw()) {
            Ok(pair) => pair,
            Err(err) => {
                if !errno_is_retry(err.raw_os_error().unwrap_or(0)) {
                    logging::warn!(self.log, "accept failed";
                                   "fd" => self.fd.raw(), "err" => %err);
                }
                return;
            }
        };

        if self.auto_async {
            let _ = socket::set_nonblocking(fd.raw(), true);
        }

        let pipe_fd = match self.children.borrow_mut().next_parent_end() {
            Some(pipe_fd) => pipe_fd,
            None => {
                logging::warn!(self.log, "no live child to take the connection";
                               "peer" => %peer);
                return;
            }
        };

        match socket::send_fd(pipe_fd, fd.raw(), self.kind.tag()) {
            Ok(_) => {
                logging::debug!(self.log, "connection forwarded";
                                "peer" => %peer, "kind" => self.kind.name(), "pipe" => pipe_fd);
                // The child owns the descriptor now; `fd` drops and closes
                // the parent's copy.
            }
            Err(err) => {
                logging::warn!(self.log, "fd pass failed";
                               "peer" => %peer, "pipe" => pipe_fd,
                               "kind" => ErrorKind::FdPassFailed.as_str(), "err" => %err);
            }
        }
    }
}

/// Child-side receiver: reads forwarded descriptors off the inherited
/// control pair and runs the same accept tail as the single-process flow,
/// with the listener kind recovered from the tag.
pub struct ChildListener {
    pipe_fd: RawFd,
    auto_async: bool,
    tls: Vec<(ListenerKind, Arc<ServerConfig>)>,
    handler: Rc<RefCell<dyn AcceptHandler>>,
    log: Logger,
}

impl ChildListener {
    /// `pipe_fd` stays owned by the child record; the listener only reads
    /// from it.
    pub fn new(
        pipe_fd: RawFd,
        tls: Vec<(ListenerKind, Arc<ServerConfig>)>,
        handler: Rc<RefCell<dyn AcceptHandler>>,
        log: Logger,
    ) -> NetResult<ChildListener> {
        socket::set_nonblocking(pipe_fd, true)
            .map_err(|_| NetError::Fatal(ErrorKind::ListenerOpenFailed))?;

        Ok(ChildListener {
            pipe_fd,
            auto_async: true,
            tls,
            handler,
            log,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.pipe_fd
    }

    fn tls_for(&self, kind: ListenerKind) -> Option<&Arc<ServerConfig>> {
        self.tls
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, config)| config)
    }
}

impl Client for ChildListener {
    fn interest(&self) -> u32 {
        READABLE
    }

    fn on_io(&mut self, turn: &mut Turn, _fd: RawFd, _mask: u32, _remove: &mut bool) {
        let (fd, tag, _payload) = match socket::receive_fd(self.pipe_fd) {
            Ok(result) => result,
            Err(NetError::Wait) => return,
            Err(err) => {
                logging::warn!(self.log, "control channel receive failed";
                               "pipe" => self.pipe_fd, "err" => %err);
                return;
            }
        };

        // Each tag maps to exactly one channel construction; unknown tags
        // drop the descriptor.
        let kind = match ListenerKind::from_tag(tag) {
            Some(kind) => kind,
            None => {
                logging::warn!(self.log, "unknown listener tag"; "tag" => tag);
                return;
            }
        };

        if self.auto_async {
            let _ = socket::set_nonblocking(fd.raw(), true);
        }

        let peer = SockAddr::peer_of(fd.raw()).unwrap_or_else(|_| SockAddr::any_v4(0));

        logging::debug!(self.log, "received forwarded connection";
                        "peer" => %peer, "kind" => kind.name(), "fd" => fd.raw());

        dispatch_accept(turn, fd, peer, kind, self.tls_for(kind), &self.handler, &self.log);
    }
}
