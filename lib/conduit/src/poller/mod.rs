//! Level-triggered readiness demultiplexer with interchangeable backends.
//! The backend is chosen by name or auto-detected, preferring epoll, then
//! kqueue, then select.

use crate::error::{ErrorKind, NetError, NetResult};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod select;

pub const READABLE: u32 = 0x001;
pub const PRIORITY_READABLE: u32 = 0x002;
pub const WRITABLE: u32 = 0x004;
pub const ERROR: u32 = 0x008;
pub const HANG_UP: u32 = 0x010;
pub const INVALID: u32 = 0x020;

/// Conditions reported whether or not they were asked for.
pub const ALWAYS: u32 = ERROR | HANG_UP | INVALID;

/// Upper bound on events pulled out of the kernel per tick.
pub const MAX_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub fd: RawFd,
    pub mask: u32,
}

enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(epoll::Epoll),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(kqueue::Kqueue),
    Select(select::Select),
}

impl Backend {
    fn add(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.add(fd, mask),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(b) => b.apply(fd, mask),
            Backend::Select(b) => b.check(fd),
        }
    }

    fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.modify(fd, mask),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(b) => b.apply(fd, mask),
            Backend::Select(b) => b.check(fd),
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.remove(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(b) => b.remove(fd),
            Backend::Select(_) => Ok(()),
        }
    }

    fn wait(
        &mut self,
        masks: &HashMap<RawFd, u32>,
        events: &mut Vec<IoEvent>,
        timeout_ms: i64,
    ) -> io::Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.wait(events, timeout_ms),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(b) => b.wait(events, timeout_ms),
            Backend::Select(b) => b.wait(masks, events, timeout_ms),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(_) => "epoll",
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(_) => "kqueue",
            Backend::Select(_) => "select",
        }
    }
}

/// The poller proper: one registration per descriptor, O(1) mask updates,
/// batched dispatch. Interior mutability keeps the handle shareable between
/// the reactor and the endpoints that re-arm their own interest.
pub struct Poller {
    backend: RefCell<Backend>,
    masks: RefCell<HashMap<RawFd, u32>>,
}

impl Poller {
    /// Creates a poller by explicit backend name, or by auto-detection when
    /// `kind` is `None` or `"auto"`.
    pub fn new(kind: Option<&str>) -> NetResult<Poller> {
        let backend = match kind.unwrap_or("auto") {
            #[cfg(target_os = "linux")]
            "epoll" | "auto" => Backend::Epoll(epoll::Epoll::new().map_err(fold_create)?),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            "kqueue" | "auto" => Backend::Kqueue(kqueue::Kqueue::new().map_err(fold_create)?),
            "select" => Backend::Select(select::Select::new()),
            #[cfg(not(any(
                target_os = "linux",
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            )))]
            "auto" => Backend::Select(select::Select::new()),
            _ => return Err(NetError::Fatal(ErrorKind::PollerFailed)),
        };

        Ok(Poller {
            backend: RefCell::new(backend),
            masks: RefCell::new(HashMap::new()),
        })
    }

    /// Adopts an existing kernel handle, taking ownership of it. Used when a
    /// poller descriptor is handed across processes.
    pub fn from_raw(kind: &str, raw: RawFd) -> NetResult<Poller> {
        let backend = match kind {
            #[cfg(target_os = "linux")]
            "epoll" => Backend::Epoll(epoll::Epoll::from_raw(raw)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            "kqueue" => Backend::Kqueue(kqueue::Kqueue::from_raw(raw)),
            _ => return Err(NetError::Fatal(ErrorKind::PollerFailed)),
        };

        Ok(Poller {
            backend: RefCell::new(backend),
            masks: RefCell::new(HashMap::new()),
        })
    }

    pub fn kind(&self) -> &'static str {
        self.backend.borrow().kind()
    }

    /// Registers a descriptor. Exactly one registration per fd.
    pub fn add(&self, fd: RawFd, mask: u32) -> NetResult<()> {
        let mut masks = self.masks.borrow_mut();
        if masks.contains_key(&fd) {
            return Err(NetError::Fatal(ErrorKind::PollerFailed));
        }

        self.backend
            .borrow_mut()
            .add(fd, mask)
            .map_err(|_| NetError::Fatal(ErrorKind::PollerFailed))?;

        masks.insert(fd, mask);
        Ok(())
    }

    /// Unregisters a descriptor. Unknown descriptors are ignored and
    /// reported as false so teardown paths can deregister unconditionally.
    pub fn remove(&self, fd: RawFd) -> bool {
        let mut masks = self.masks.borrow_mut();
        if masks.remove(&fd).is_none() {
            return false;
        }

        // The kernel may already have dropped a closed fd; that is fine.
        let _ = self.backend.borrow_mut().remove(fd);
        true
    }

    pub fn set_mask(&self, fd: RawFd, mask: u32) -> NetResult<()> {
        let mut masks = self.masks.borrow_mut();
        let entry = match masks.get_mut(&fd) {
            Some(entry) => entry,
            None => return Err(NetError::Fatal(ErrorKind::PollerFailed)),
        };

        self.backend
            .borrow_mut()
            .modify(fd, mask)
            .map_err(|_| NetError::Fatal(ErrorKind::PollerFailed))?;

        *entry = mask;
        Ok(())
    }

    pub fn or_mask(&self, fd: RawFd, mask: u32) -> NetResult<()> {
        let current = self.mask_of(fd).ok_or(NetError::Fatal(ErrorKind::PollerFailed))?;
        if current | mask == current {
            return Ok(());
        }
        self.set_mask(fd, current | mask)
    }

    pub fn and_mask(&self, fd: RawFd, mask: u32) -> NetResult<()> {
        let current = self.mask_of(fd).ok_or(NetError::Fatal(ErrorKind::PollerFailed))?;
        if current & mask == current {
            return Ok(());
        }
        self.set_mask(fd, current & mask)
    }

    pub fn mask_of(&self, fd: RawFd) -> Option<u32> {
        self.masks.borrow().get(&fd).copied()
    }

    pub fn registered(&self) -> usize {
        self.masks.borrow().len()
    }

    /// One dispatch tick. Fills `events` with at most `MAX_BATCH` entries.
    /// An interrupted wait delivers zero events silently.
    pub fn wait(&self, events: &mut Vec<IoEvent>, timeout_ms: i64) -> NetResult<usize> {
        events.clear();

        let result = {
            let masks = self.masks.borrow();
            self.backend.borrow_mut().wait(&masks, events, timeout_ms)
        };

        match result {
            Ok(n) => Ok(n),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(_) => Err(NetError::Fatal(ErrorKind::PollerFailed)),
        }
    }

    /// Human-readable mask, for logs.
    pub fn mask_string(mask: u32) -> String {
        let mut out = String::new();

        for (bit, name) in &[
            (READABLE, "IN"),
            (PRIORITY_READABLE, "PRI"),
            (WRITABLE, "OUT"),
            (ERROR, "ERR"),
            (HANG_UP, "HUP"),
            (INVALID, "NVAL"),
        ] {
            if mask & bit != 0 {
                if !out.is_empty() {
                    out.push('|');
                }
                out.push_str(name);
            }
        }

        if out.is_empty() {
            out.push_str("(null)");
        }

        out
    }
}

fn fold_create(_err: io::Error) -> NetError {
    NetError::Fatal(ErrorKind::PollerFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket;

    #[test]
    fn test_backend_kind_reported() {
        let poller = Poller::new(None).unwrap();
        assert!(matches!(poller.kind(), "epoll" | "kqueue" | "select"));

        let select = Poller::new(Some("select")).unwrap();
        assert_eq!(select.kind(), "select");

        assert!(Poller::new(Some("nonsense")).is_err());
    }

    #[test]
    fn test_single_registration_per_fd() {
        let poller = Poller::new(None).unwrap();
        let (a, _b) = socket::socket_pair().unwrap();

        poller.add(a.raw(), READABLE).unwrap();
        assert!(poller.add(a.raw(), READABLE).is_err());
        assert_eq!(poller.registered(), 1);

        assert!(poller.remove(a.raw()));
        assert!(!poller.remove(a.raw()));
        assert_eq!(poller.registered(), 0);
    }

    #[test]
    fn test_mask_composition() {
        let poller = Poller::new(None).unwrap();
        let (a, _b) = socket::socket_pair().unwrap();

        poller.add(a.raw(), READABLE).unwrap();
        poller.or_mask(a.raw(), WRITABLE).unwrap();
        assert_eq!(poller.mask_of(a.raw()), Some(READABLE | WRITABLE));

        poller.and_mask(a.raw(), !WRITABLE).unwrap();
        assert_eq!(poller.mask_of(a.raw()), Some(READABLE));

        poller.set_mask(a.raw(), WRITABLE).unwrap();
        assert_eq!(poller.mask_of(a.raw()), Some(WRITABLE));
    }

    fn readiness_roundtrip(kind: &str) {
        let poller = Poller::new(Some(kind)).unwrap();
        let (a, b) = socket::socket_pair().unwrap();
        socket::set_nonblocking(a.raw(), true).unwrap();

        poller.add(a.raw(), READABLE).unwrap();

        let mut events = Vec::new();

        // Nothing pending yet.
        poller.wait(&mut events, 0).unwrap();
        assert!(events.iter().all(|ev| ev.fd != a.raw()));

        // A write on the far end makes the registered fd readable.
        unsafe { libc::write(b.raw(), b"x".as_ptr() as *const libc::c_void, 1) };

        poller.wait(&mut events, 1000).unwrap();
        let ev = events.iter().find(|ev| ev.fd == a.raw()).unwrap();
        assert!(ev.mask & READABLE != 0);
    }

    #[test]
    fn test_readiness_default_backend() {
        readiness_roundtrip("auto");
    }

    #[test]
    fn test_readiness_select_backend() {
        readiness_roundtrip("select");
    }

    #[test]
    fn test_level_triggered_redelivery() {
        let poller = Poller::new(None).unwrap();
        let (a, b) = socket::socket_pair().unwrap();
        socket::set_nonblocking(a.raw(), true).unwrap();

        poller.add(a.raw(), READABLE).unwrap();
        unsafe { libc::write(b.raw(), b"x".as_ptr() as *const libc::c_void, 1) };

        let mut events = Vec::new();

        // Unconsumed data keeps being reported tick after tick.
        for _ in 0..3 {
            poller.wait(&mut events, 1000).unwrap();
            assert!(events.iter().any(|ev| ev.fd == a.raw() && ev.mask & READABLE != 0));
        }
    }

    #[test]
    fn test_mask_string() {
        assert_eq!(Poller::mask_string(READABLE | WRITABLE), "IN|OUT");
        assert_eq!(Poller::mask_string(0), "(null)");
    }
}
