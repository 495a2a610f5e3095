use super::{IoEvent, PRIORITY_READABLE, READABLE, WRITABLE};
use hashbrown::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Portable fallback backend. The interest table lives in the owning poller;
/// the fd sets are rebuilt from it on every wait.
pub struct Select;

impl Select {
    pub fn new() -> Select {
        Select
    }

    /// select cannot watch descriptors past FD_SETSIZE.
    pub fn check(&mut self, fd: RawFd) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        Ok(())
    }

    pub fn wait(
        &mut self,
        masks: &HashMap<RawFd, u32>,
        events: &mut Vec<IoEvent>,
        timeout_ms: i64,
    ) -> io::Result<usize> {
        let mut rfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut wfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut efds: libc::fd_set = unsafe { mem::zeroed() };

        unsafe {
            libc::FD_ZERO(&mut rfds);
            libc::FD_ZERO(&mut wfds);
            libc::FD_ZERO(&mut efds);
        }

        let mut max_fd: RawFd = -1;

        for (&fd, &mask) in masks.iter() {
            if fd as usize >= libc::FD_SETSIZE {
                continue;
            }

            unsafe {
                if mask & READABLE != 0 {
                    libc::FD_SET(fd, &mut rfds);
                }
                if mask & WRITABLE != 0 {
                    libc::FD_SET(fd, &mut wfds);
                }
                libc::FD_SET(fd, &mut efds);
            }

            if fd > max_fd {
                max_fd = fd;
            }
        }

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        let ptv: *mut libc::timeval = if timeout_ms < 0 { ptr::null_mut() } else { &mut tv };

        let rc = unsafe { libc::select(max_fd + 1, &mut rfds, &mut wfds, &mut efds, ptv) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        if rc > 0 {
            for (&fd, _) in masks.iter() {
                if fd as usize >= libc::FD_SETSIZE {
                    continue;
                }

                let mut mask = 0;
                unsafe {
                    if libc::FD_ISSET(fd, &mut rfds) {
                        mask |= READABLE;
                    }
                    if libc::FD_ISSET(fd, &mut wfds) {
                        mask |= WRITABLE;
                    }
                    if libc::FD_ISSET(fd, &mut efds) {
                        mask |= PRIORITY_READABLE;
                    }
                }

                if mask != 0 {
                    events.push(IoEvent { fd, mask });
                }
            }
        }

        Ok(events.len())
    }
}
