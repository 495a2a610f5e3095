//! TLS support: rustls server sessions driven off nonblocking descriptors,
//! and the transient handshake client that brings an accepted socket up to
//! an established session before the application ever sees it.

use crate::buffer::Buffer;
use crate::error::{ErrorKind, NetError, NetResult};
use crate::listener::{Accepted, AcceptHandler, ListenerKind};
use crate::poller::{READABLE, WRITABLE};
use crate::reactor::{Client, Turn};
use crate::sockaddr::SockAddr;
use crate::socket::{Fd, FdIo};
use ballast::logging::{self, Logger};
use rustls::{Certificate, PrivateKey, ServerConnection};
pub use rustls::ServerConfig;
use std::cell::RefCell;
use std::fs;
use std::io::{self, BufReader, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// Builds a server config from PEM cert chain and private key files.
pub fn load_server_config<P: AsRef<Path>>(cert_path: P, key_path: P) -> NetResult<Arc<ServerConfig>> {
    let certs = read_certs(cert_path.as_ref())?;
    let key = read_key(key_path.as_ref())?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;

    Ok(Arc::new(config))
}

fn read_certs(path: &Path) -> NetResult<Vec<Certificate>> {
    let file = fs::File::open(path).map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;

    if certs.is_empty() {
        return Err(NetError::Fatal(ErrorKind::TlsFailed));
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> NetResult<PrivateKey> {
    let file = fs::File::open(path).map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;

    if keys.is_empty() {
        let file = fs::File::open(path).map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(file))
            .map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;
    }

    if keys.is_empty() {
        return Err(NetError::Fatal(ErrorKind::TlsFailed));
    }

    Ok(PrivateKey(keys.remove(0)))
}

/// Handshake progress: established, or waiting for the mask the TLS engine
/// asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsStatus {
    Done,
    Want(u32),
}

/// One server-side TLS session bound to a channel or a handshake helper.
pub struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub fn new(config: &Arc<ServerConfig>) -> NetResult<TlsSession> {
        let conn =
            ServerConnection::new(config.clone()).map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;
        Ok(TlsSession { conn })
    }

    /// Advances the handshake as far as the socket allows. Suspends by
    /// reporting the interest the engine wants next.
    pub fn handshake(&mut self, fd: RawFd) -> NetResult<HsStatus> {
        let mut io = FdIo(fd);

        loop {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut io) {
                    Ok(_) => continue,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HsStatus::Want(WRITABLE));
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Err(NetError::Fatal(ErrorKind::TlsFailed)),
                }
            }

            if !self.conn.is_handshaking() {
                return Ok(HsStatus::Done);
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(&mut io) {
                    Ok(0) => return Err(NetError::Fatal(ErrorKind::TlsFailed)),
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|_| NetError::Fatal(ErrorKind::TlsFailed))?;
                        continue;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HsStatus::Want(READABLE));
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return Err(NetError::Fatal(ErrorKind::TlsFailed)),
                }
            } else {
                return Err(NetError::Fatal(ErrorKind::TlsFailed));
            }
        }
    }

    /// Pumps ciphertext off the socket and decrypted plaintext into the read
    /// buffer, up to `high_water`.
    pub fn read_into(&mut self, fd: RawFd, buf: &mut Buffer, high_water: usize) -> io::Result<usize> {
        let mut io = FdIo(fd);
        let mut eof = false;

        loop {
            match self.conn.read_tls(&mut io) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        let drained = buf.ingress(self.conn.reader(), high_water);

        match drained {
            Ok(0) if eof => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(n),
            // A close_notify with no pending plaintext also reads as EOF.
            Err(err) => Err(err),
        }
    }

    /// Moves plaintext from the write buffer into the session and flushes
    /// ciphertext to the socket. Bytes the socket refuses stay buffered.
    pub fn write_from(&mut self, fd: RawFd, buf: &mut Buffer) -> io::Result<usize> {
        let mut total = 0;

        loop {
            let round_start = total;

            // Feed the session; a zero-length acceptance means its internal
            // plaintext buffer is full and needs a flush first.
            while !buf.is_empty() {
                let n = self.conn.writer().write(buf.grab_read())?;
                if n == 0 {
                    break;
                }
                buf.commit_read(n);
                total += n;
            }

            let mut io = FdIo(fd);
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut io) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(_) => continue,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }

            if buf.is_empty() || total == round_start {
                return Ok(total);
            }
        }
    }

    /// True while ciphertext is queued for the socket.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HsState {
    Pending,
    Finished(bool),
}

/// Transient reactor client that owns an accepted socket while its TLS
/// handshake runs. On success it hands the descriptor and the session to the
/// listener's accept handler and removes itself without closing anything; on
/// failure it closes the socket and releases the session.
pub struct TlsHandshake {
    fd: Option<Fd>,
    session: Option<TlsSession>,
    peer: SockAddr,
    kind: ListenerKind,
    handler: Rc<RefCell<dyn AcceptHandler>>,
    state: HsState,
    want: u32,
    log: Logger,
}

impl TlsHandshake {
    pub fn start(
        fd: Fd,
        session: TlsSession,
        peer: SockAddr,
        kind: ListenerKind,
        handler: Rc<RefCell<dyn AcceptHandler>>,
        log: Logger,
    ) -> TlsHandshake {
        let mut hs = TlsHandshake {
            fd: Some(fd),
            session: Some(session),
            peer,
            kind,
            handler,
            state: HsState::Pending,
            want: WRITABLE,
            log,
        };

        hs.step();
        hs
    }

    fn step(&mut self) {
        let fd = match &self.fd {
            Some(fd) => fd.raw(),
            None => return,
        };

        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        match session.handshake(fd) {
            Ok(HsStatus::Done) => {
                self.state = HsState::Finished(true);
                // A connected socket is immediately writable, so the
                // completion event fires on the very next tick.
                self.want = WRITABLE;
            }
            Ok(HsStatus::Want(mask)) => {
                self.state = HsState::Pending;
                self.want = mask;
            }
            Err(err) => {
                logging::debug!(self.log, "tls handshake failed";
                                "peer" => %self.peer, "err" => %err);
                self.state = HsState::Finished(false);
                self.want = WRITABLE;
            }
        }
    }
}

impl Client for TlsHandshake {
    fn interest(&self) -> u32 {
        self.want
    }

    fn on_io(&mut self, turn: &mut Turn, fd: RawFd, _mask: u32, remove: &mut bool) {
        if let HsState::Pending = self.state {
            self.step();

            if let HsState::Pending = self.state {
                if turn.poller.set_mask(fd, self.want).is_err() {
                    self.state = HsState::Finished(false);
                } else {
                    return;
                }
            }
        }

        *remove = true;

        match self.state {
            HsState::Finished(true) => {
                let accepted = Accepted {
                    fd: self.fd.take().expect("handshake owns the fd until handoff"),
                    peer: self.peer.clone(),
                    kind: self.kind,
                    tls: self.session.take(),
                };

                logging::debug!(self.log, "tls session established";
                                "peer" => %self.peer, "kind" => self.kind.name());

                if !self.handler.borrow_mut().on_accept(turn, accepted) {
                    logging::debug!(self.log, "accept refused after handshake";
                                    "peer" => %self.peer);
                }
            }
            // Failure: dropping self closes the fd and frees the session.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_files_fail() {
        let result = load_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorKind::TlsFailed));
    }

    #[test]
    fn test_garbage_pem_fails() {
        let dir = std::env::temp_dir();
        let cert = dir.join("conduit_test_garbage_cert.pem");
        let key = dir.join("conduit_test_garbage_key.pem");
        fs::write(&cert, "not a pem").unwrap();
        fs::write(&key, "not a pem").unwrap();

        let result = load_server_config(&cert, &key);
        assert!(result.is_err());

        let _ = fs::remove_file(cert);
        let _ = fs::remove_file(key);
    }
}
