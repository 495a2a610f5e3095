//! Raw socket plumbing: descriptor ownership, option setters, bounded
//! synchronous transfers and descriptor passing over UNIX socket pairs.
//! Everything here is a thin, checked layer over libc.

use crate::error::{errno_is_retry, ErrorKind, NetError, NetResult};
use crate::sockaddr::SockAddr;
use ballast::time;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Owned descriptor. Closes on drop; `into_raw` transfers ownership out.
#[derive(Debug, PartialEq, Eq)]
pub struct Fd(RawFd);

impl Fd {
    #[inline]
    pub fn new(raw: RawFd) -> Fd {
        Fd(raw)
    }

    #[inline]
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Releases ownership without closing.
    #[inline]
    pub fn into_raw(self) -> RawFd {
        let raw = self.0;
        mem::forget(self);
        raw
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { libc::close(self.0) };
            self.0 = -1;
        }
    }
}

/// Borrowed-descriptor adapter so buffers and TLS sessions can treat a raw
/// socket as `io::Read`/`io::Write`.
pub struct FdIo(pub RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[inline]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }

    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    flags != -1 && (flags & libc::O_NONBLOCK) != 0
}

fn set_opt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
}

pub fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
}

pub fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
}

pub fn set_send_buffer_size(fd: RawFd, size: usize) -> io::Result<()> {
    set_opt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
}

pub fn set_receive_buffer_size(fd: RawFd, size: usize) -> io::Result<()> {
    set_opt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
}

pub fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, how) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Checks the deferred result of a nonblocking connect. Returns
/// `(connected, errno)`.
pub fn is_connected(fd: RawFd) -> (bool, i32) {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };

    if rc == -1 {
        return (false, last_errno());
    }

    (err == 0, err)
}

/// Starts a nonblocking connect. The boolean is true when the kernel
/// answered `EINPROGRESS`; the caller must arm writability and settle the
/// outcome with `is_connected`.
pub fn connect_async(addr: &SockAddr) -> NetResult<(Fd, bool)> {
    let raw = unsafe { libc::socket(addr.family(), libc::SOCK_STREAM, 0) };
    if raw == -1 {
        return Err(NetError::Fatal(ErrorKind::ConnectFailed));
    }

    let fd = Fd::new(raw);
    set_nonblocking(raw, true).map_err(|err| NetError::from_io(&err, ErrorKind::ConnectFailed))?;

    let (storage, len) = addr.to_raw();
    let rc = unsafe {
        libc::connect(
            raw,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };

    if rc == 0 {
        return Ok((fd, false));
    }

    if last_errno() == libc::EINPROGRESS {
        return Ok((fd, true));
    }

    Err(NetError::Fatal(ErrorKind::ConnectFailed))
}

fn select_one(fd: RawFd, want_write: bool, timeout_ms: i64) -> NetResult<bool> {
    loop {
        let mut set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut set);
            libc::FD_SET(fd, &mut set);
        }

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };

        let (rset, wset): (*mut libc::fd_set, *mut libc::fd_set) = if want_write {
            (ptr::null_mut(), &mut set)
        } else {
            (&mut set, ptr::null_mut())
        };

        let rc = unsafe { libc::select(fd + 1, rset, wset, ptr::null_mut(), &mut tv) };

        if rc > 0 {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        if !errno_is_retry(last_errno()) {
            return Err(NetError::Fatal(ErrorKind::ConnectFailed));
        }
    }
}

/// Connects with a millisecond deadline. On success returns the descriptor
/// (still nonblocking) and the unspent part of the budget so callers can
/// stitch deadlines across calls.
pub fn connect_sync(addr: &SockAddr, timeout_ms: i64) -> NetResult<(Fd, i64)> {
    let start = time::now_ms();
    let (fd, in_progress) = connect_async(addr)?;

    if in_progress {
        let settled = select_one(fd.raw(), true, timeout_ms)?;
        if !settled {
            return Err(NetError::Fatal(ErrorKind::ConnectFailed));
        }

        let (connected, _errno) = is_connected(fd.raw());
        if !connected {
            return Err(NetError::Fatal(ErrorKind::ConnectFailed));
        }
    }

    Ok((fd, time::left_timeout(timeout_ms, time::now_ms() - start)))
}

/// Sends the whole buffer within the deadline. Returns bytes written and the
/// unspent budget.
pub fn send_sync(fd: RawFd, buf: &[u8], timeout_ms: i64) -> NetResult<(usize, i64)> {
    let start = time::now_ms();
    let mut sent = 0;

    while sent < buf.len() {
        let left = time::left_timeout(timeout_ms, time::now_ms() - start);
        if timeout_ms > 0 && left == 0 {
            return Err(NetError::Wait);
        }

        if !select_one(fd, true, if timeout_ms > 0 { left } else { 1000 })
            .map_err(|_| NetError::Fatal(ErrorKind::WriteFailed))?
        {
            return Err(NetError::Wait);
        }

        let n = unsafe {
            libc::send(
                fd,
                buf[sent..].as_ptr() as *const libc::c_void,
                buf.len() - sent,
                0,
            )
        };

        if n > 0 {
            sent += n as usize;
            continue;
        }

        if n == 0 || !errno_is_retry(last_errno()) {
            return Err(NetError::Fatal(ErrorKind::WriteFailed));
        }
    }

    Ok((sent, time::left_timeout(timeout_ms, time::now_ms() - start)))
}

/// Receives at least one byte within the deadline. Returns bytes read and the
/// unspent budget.
pub fn recv_sync(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> NetResult<(usize, i64)> {
    let start = time::now_ms();

    loop {
        let left = time::left_timeout(timeout_ms, time::now_ms() - start);
        if timeout_ms > 0 && left == 0 {
            return Err(NetError::Wait);
        }

        if !select_one(fd, false, if timeout_ms > 0 { left } else { 1000 })
            .map_err(|_| NetError::Fatal(ErrorKind::ReadFailed))?
        {
            return Err(NetError::Wait);
        }

        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };

        if n > 0 {
            return Ok((
                n as usize,
                time::left_timeout(timeout_ms, time::now_ms() - start),
            ));
        }

        if n == 0 {
            return Err(NetError::Fatal(ErrorKind::ReadClosed));
        }

        if !errno_is_retry(last_errno()) {
            return Err(NetError::Fatal(ErrorKind::ReadFailed));
        }
    }
}

/// Creates a connected UNIX socket pair, both ends owned.
pub fn socket_pair() -> NetResult<(Fd, Fd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc == -1 {
        return Err(NetError::Fatal(ErrorKind::ForkFailed));
    }

    Ok((Fd::new(fds[0]), Fd::new(fds[1])))
}

// Control-message buffer sized for a single descriptor. 64 bytes of u64
// keeps the cmsghdr alignment the kernel requires.
const CMSG_WORDS: usize = 8;

/// Ships `target_fd` plus a 32-bit tag over the control pair. Returns bytes
/// of payload sent. Retryable kernel results surface as `Wait`.
pub fn send_fd(pipe_fd: RawFd, target_fd: RawFd, tag: u32) -> NetResult<usize> {
    let payload = tag.to_ne_bytes();
    let mut space = [0u64; CMSG_WORDS];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let rc = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let cptr = libc::CMSG_FIRSTHDR(&msg);
        (*cptr).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        (*cptr).cmsg_level = libc::SOL_SOCKET;
        (*cptr).cmsg_type = libc::SCM_RIGHTS;
        ptr::copy_nonoverlapping(
            &target_fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cptr),
            mem::size_of::<RawFd>(),
        );

        libc::sendmsg(pipe_fd, &msg, 0)
    };

    if rc == -1 {
        if errno_is_retry(last_errno()) {
            return Err(NetError::Wait);
        }
        return Err(NetError::Fatal(ErrorKind::FdPassFailed));
    }

    Ok(rc as usize)
}

/// Receives one descriptor plus its 32-bit tag from the control pair.
/// Returns the new descriptor, the tag and the payload byte count.
pub fn receive_fd(pipe_fd: RawFd) -> NetResult<(Fd, u32, usize)> {
    let mut payload = [0u8; 4];
    let mut space = [0u64; CMSG_WORDS];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let (rc, received_fd) = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let rc = libc::recvmsg(pipe_fd, &mut msg, 0);
        if rc == -1 {
            if errno_is_retry(last_errno()) {
                return Err(NetError::Wait);
            }
            return Err(NetError::Fatal(ErrorKind::FdPassFailed));
        }

        let cptr = libc::CMSG_FIRSTHDR(&msg);
        if cptr.is_null() {
            return Err(NetError::Fatal(ErrorKind::FdPassFailed));
        }
        if (*cptr).cmsg_level != libc::SOL_SOCKET || (*cptr).cmsg_type != libc::SCM_RIGHTS {
            return Err(NetError::Fatal(ErrorKind::FdPassFailed));
        }

        let mut received_fd: RawFd = -1;
        ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cptr),
            &mut received_fd as *mut RawFd as *mut u8,
            mem::size_of::<RawFd>(),
        );

        (rc, received_fd)
    };

    if received_fd < 0 {
        return Err(NetError::Fatal(ErrorKind::FdPassFailed));
    }

    Ok((Fd::new(received_fd), u32::from_ne_bytes(payload), rc as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_fd_into_raw_does_not_close() {
        let (a, b) = socket_pair().unwrap();
        let raw = a.into_raw();

        // The descriptor survives the consumed owner and is still writable.
        assert!(unsafe { libc::write(raw, b"x".as_ptr() as *const libc::c_void, 1) } == 1);

        unsafe { libc::close(raw) };
        drop(b);
    }

    #[test]
    fn test_nonblocking_toggle() {
        let (a, _b) = socket_pair().unwrap();
        assert!(!is_nonblocking(a.raw()));
        set_nonblocking(a.raw(), true).unwrap();
        assert!(is_nonblocking(a.raw()));
        set_nonblocking(a.raw(), false).unwrap();
        assert!(!is_nonblocking(a.raw()));
    }

    #[test]
    fn test_connect_sync_and_timed_transfer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = SockAddr::from(listener.local_addr().unwrap());

        let (fd, left) = connect_sync(&addr, 2000).unwrap();
        assert!(left <= 2000);

        let (mut peer, _) = listener.accept().unwrap();

        let (sent, _) = send_sync(fd.raw(), b"ping", 2000).unwrap();
        assert_eq!(sent, 4);

        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        peer.write_all(b"pong").unwrap();
        let mut back = [0u8; 8];
        let (n, _) = recv_sync(fd.raw(), &mut back, 2000).unwrap();
        assert_eq!(&back[..n], b"pong");
    }

    #[test]
    fn test_connect_async_in_progress_settles() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = SockAddr::from(listener.local_addr().unwrap());

        let (fd, in_progress) = connect_async(&addr).unwrap();
        if in_progress {
            assert!(select_one(fd.raw(), true, 2000).unwrap());
        }
        let (connected, errno) = is_connected(fd.raw());
        assert!(connected, "connect errno {}", errno);

        let _ = listener.accept().unwrap();
    }

    #[test]
    fn test_fd_passing_duplicates_kernel_state() {
        let (parent, child) = socket_pair().unwrap();

        // A socket with a known peer is the descriptor under transfer.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        use std::os::unix::io::IntoRawFd;
        let accepted_fd = accepted.into_raw_fd();

        let sent = send_fd(parent.raw(), accepted_fd, 7).unwrap();
        assert_eq!(sent, 4);

        let (received, tag, n) = receive_fd(child.raw()).unwrap();
        assert_eq!(tag, 7);
        assert_eq!(n, 4);
        assert_ne!(received.raw(), accepted_fd);

        // Closing the original copy must not affect the received duplicate.
        unsafe { libc::close(accepted_fd) };

        let wrote =
            unsafe { libc::write(received.raw(), b"hi".as_ptr() as *const libc::c_void, 2) };
        assert_eq!(wrote, 2);

        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_receive_fd_would_block() {
        let (_parent, child) = socket_pair().unwrap();
        set_nonblocking(child.raw(), true).unwrap();

        assert_eq!(receive_fd(child.raw()).unwrap_err(), NetError::Wait);
    }
}
