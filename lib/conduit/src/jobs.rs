//! Deferred work. Jobs enqueue from any thread; the main loop drains a
//! bounded batch at the end of every tick. A self-pipe kicks the poller so a
//! sleeping dispatch notices cross-thread posts immediately.

use crate::error::{ErrorKind, NetError, NetResult};
use crate::reactor::{Client, Turn};
use crate::socket::{self, Fd};
use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver, Sender};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cheap clonable handle for worker threads.
#[derive(Clone)]
pub struct JobSender {
    tx: Sender<Job>,
    wake_fd: RawFd,
}

impl JobSender {
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        if self.tx.send(Box::new(job)).is_ok() {
            unsafe { libc::write(self.wake_fd, b"j".as_ptr() as *const libc::c_void, 1) };
        }
    }
}

pub struct JobManager {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    wake_read: Fd,
    wake_write: Fd,
}

impl JobManager {
    pub fn new() -> NetResult<JobManager> {
        let (tx, rx) = channel();

        let (wake_read, wake_write) = socket::socket_pair()?;
        socket::set_nonblocking(wake_read.raw(), true)
            .map_err(|_| NetError::Fatal(ErrorKind::PollerFailed))?;
        socket::set_nonblocking(wake_write.raw(), true)
            .map_err(|_| NetError::Fatal(ErrorKind::PollerFailed))?;

        Ok(JobManager {
            tx,
            rx,
            wake_read,
            wake_write,
        })
    }

    /// Descriptor to register with the reactor, paired with `Wakeup`.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_read.raw()
    }

    pub fn sender(&self) -> JobSender {
        JobSender {
            tx: self.tx.clone(),
            wake_fd: self.wake_write.raw(),
        }
    }

    /// Posts from the main thread.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.sender().post(job);
    }

    /// Runs up to `limit` queued jobs. Returns how many ran.
    pub fn drain(&mut self, limit: usize) -> usize {
        let mut ran = 0;

        while ran < limit {
            match self.rx.try_recv() {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(_) => break,
            }
        }

        ran
    }
}

/// Reactor client on the self-pipe read end: swallows wake bytes so the
/// level-triggered poller quiets down once the queue drains.
pub struct Wakeup {
    fd: RawFd,
}

impl Wakeup {
    pub fn new(fd: RawFd) -> Wakeup {
        Wakeup { fd }
    }
}

impl Client for Wakeup {
    fn on_io(&mut self, _turn: &mut Turn, _fd: RawFd, _mask: u32, _remove: &mut bool) {
        let mut sink = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_post_and_drain() {
        let mut jobs = JobManager::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            jobs.post(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(jobs.drain(3), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert_eq!(jobs.drain(16), 2);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(jobs.drain(16), 0);
    }

    #[test]
    fn test_cross_thread_post_wakes_pipe() {
        let mut jobs = JobManager::new().unwrap();
        let sender = jobs.sender();
        let count = Arc::new(AtomicUsize::new(0));

        let thread_count = count.clone();
        let handle = std::thread::spawn(move || {
            sender.post(move || {
                thread_count.fetch_add(1, Ordering::SeqCst);
            });
        });
        handle.join().unwrap();

        // The wake byte is readable on the pipe end.
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                jobs.wake_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert!(n >= 1);

        assert_eq!(jobs.drain(16), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
