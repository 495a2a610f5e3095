use super::{IoEvent, ERROR, HANG_UP, MAX_BATCH, READABLE, WRITABLE};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

pub struct Kqueue {
    kq: RawFd,
    buf: Vec<libc::kevent>,
}

impl Kqueue {
    pub fn new() -> io::Result<Kqueue> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Kqueue::from_raw(kq))
    }

    /// Adopts an existing kqueue descriptor.
    pub fn from_raw(kq: RawFd) -> Kqueue {
        Kqueue {
            kq,
            buf: Vec::with_capacity(MAX_BATCH),
        }
    }

    /// Brings the kernel filter set in line with `mask`. kqueue has one
    /// filter per direction, so the mask splits into add/delete per filter.
    pub fn apply(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.filter(fd, libc::EVFILT_READ, mask & READABLE != 0)?;
        self.filter(fd, libc::EVFILT_WRITE, mask & WRITABLE != 0)?;
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let _ = self.filter(fd, libc::EVFILT_READ, false);
        let _ = self.filter(fd, libc::EVFILT_WRITE, false);
        Ok(())
    }

    fn filter(&mut self, fd: RawFd, filter: i16, enable: bool) -> io::Result<()> {
        let mut change: libc::kevent = unsafe { mem::zeroed() };
        change.ident = fd as libc::uintptr_t;
        change.filter = filter;
        change.flags = if enable {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        };

        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // Deleting a filter that was never added is not a failure.
            if !enable && err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }

        Ok(())
    }

    pub fn wait(&mut self, events: &mut Vec<IoEvent>, timeout_ms: i64) -> io::Result<usize> {
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let pts: *const libc::timespec = if timeout_ms < 0 { ptr::null() } else { &ts };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                MAX_BATCH as libc::c_int,
                pts,
            )
        };

        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        let filled = unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), n as usize) };

        // The two filters report separately; fold them so a client sees one
        // combined mask per fd per tick.
        for kev in filled {
            let fd = kev.ident as RawFd;
            let mut mask = match kev.filter {
                libc::EVFILT_READ => READABLE,
                libc::EVFILT_WRITE => WRITABLE,
                _ => 0,
            };
            if kev.flags & libc::EV_EOF != 0 {
                mask |= HANG_UP;
            }
            if kev.flags & libc::EV_ERROR != 0 {
                mask |= ERROR;
            }

            match events.iter_mut().find(|ev| ev.fd == fd) {
                Some(existing) => existing.mask |= mask,
                None => events.push(IoEvent { fd, mask }),
            }
        }

        Ok(events.len())
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        if self.kq >= 0 {
            unsafe { libc::close(self.kq) };
            self.kq = -1;
        }
    }
}
