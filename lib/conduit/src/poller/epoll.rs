use super::{IoEvent, ERROR, HANG_UP, MAX_BATCH, PRIORITY_READABLE, READABLE, WRITABLE};
use std::io;
use std::os::unix::io::RawFd;

pub struct Epoll {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Epoll::from_raw(epfd))
    }

    /// Adopts an existing epoll descriptor.
    pub fn from_raw(epfd: RawFd) -> Epoll {
        Epoll {
            epfd,
            buf: Vec::with_capacity(MAX_BATCH),
        }
    }

    pub fn add(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    pub fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(mask),
            u64: fd as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&mut self, events: &mut Vec<IoEvent>, timeout_ms: i64) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                MAX_BATCH as libc::c_int,
                timeout_ms as libc::c_int,
            )
        };

        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        let filled = unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), n as usize) };
        for ev in filled {
            events.push(IoEvent {
                fd: ev.u64 as RawFd,
                mask: from_epoll(ev.events),
            });
        }

        Ok(n as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
            self.epfd = -1;
        }
    }
}

fn to_epoll(mask: u32) -> u32 {
    let mut ev = 0;
    if mask & READABLE != 0 {
        ev |= libc::EPOLLIN as u32;
    }
    if mask & PRIORITY_READABLE != 0 {
        ev |= libc::EPOLLPRI as u32;
    }
    if mask & WRITABLE != 0 {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

fn from_epoll(events: u32) -> u32 {
    let mut mask = 0;
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= READABLE;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        mask |= PRIORITY_READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= WRITABLE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        mask |= ERROR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        mask |= HANG_UP;
    }
    mask
}
