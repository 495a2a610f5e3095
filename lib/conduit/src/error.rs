use std::fmt;
use std::io;

/// Failure categories surfaced to user hooks and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigInvalid,
    ListenerOpenFailed,
    AcceptFailed,
    FdPassFailed,
    ConnectFailed,
    ReadClosed,
    ReadFailed,
    WriteFailed,
    TlsFailed,
    InvalidPacket,
    PacketTooLarge,
    PingTimeout,
    ChildDied,
    ForkFailed,
    PollerFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::ListenerOpenFailed => "listener_open_failed",
            ErrorKind::AcceptFailed => "accept_failed",
            ErrorKind::FdPassFailed => "fd_pass_failed",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::ReadClosed => "read_closed",
            ErrorKind::ReadFailed => "read_failed",
            ErrorKind::WriteFailed => "write_failed",
            ErrorKind::TlsFailed => "tls_failed",
            ErrorKind::InvalidPacket => "invalid_packet",
            ErrorKind::PacketTooLarge => "packet_too_large",
            ErrorKind::PingTimeout => "ping_timeout",
            ErrorKind::ChildDied => "child_died",
            ErrorKind::ForkFailed => "fork_failed",
            ErrorKind::PollerFailed => "poller_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a nonblocking operation. `Wait` means the call made no
/// progress and must be retried on the next reactor tick; `Fatal` leaves the
/// endpoint unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

impl NetError {
    /// Folds an io error into the Wait/Fatal model. Retryable kernel results
    /// become `Wait`; anything else is fatal with the supplied category.
    #[inline]
    pub fn from_io(err: &io::Error, kind: ErrorKind) -> NetError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetError::Wait,
            _ => NetError::Fatal(kind),
        }
    }

    #[inline]
    pub fn is_wait(&self) -> bool {
        matches!(self, NetError::Wait)
    }

    #[inline]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            NetError::Wait => None,
            NetError::Fatal(kind) => Some(*kind),
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::Wait => f.write_str("wait"),
            NetError::Fatal(kind) => write!(f, "fatal: {}", kind),
        }
    }
}

impl std::error::Error for NetError {}

pub type NetResult<T> = Result<T, NetError>;

/// True when the raw errno should be retried rather than reported.
#[inline]
pub fn errno_is_retry(errno: i32) -> bool {
    errno == libc::EAGAIN
        || errno == libc::EWOULDBLOCK
        || errno == libc::EINTR
        || errno == libc::EINPROGRESS
}
