//! Dispatch driver above the poller: an fd-keyed registry of boxed clients,
//! one tick at a time. Clients created mid-tick are queued on the turn and
//! folded into the registry when the tick ends.

use crate::error::NetResult;
use crate::poller::{IoEvent, Poller, READABLE};
use ballast::logging::{self, Logger};
use hashbrown::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

/// A reactor client: anything that owns a descriptor and reacts to its
/// readiness. Listeners, channels and the TLS handshake helper all plug in
/// through this one seam.
pub trait Client {
    /// Interest installed when the client is registered.
    fn interest(&self) -> u32 {
        READABLE
    }

    /// I/O readiness callback. Setting `remove` unregisters the client
    /// immediately after return; dropping the client closes its descriptor.
    fn on_io(&mut self, turn: &mut Turn, fd: RawFd, mask: u32, remove: &mut bool);

    /// Periodic housekeeping. Returning false reaps the client.
    fn on_sweep(&mut self, _turn: &mut Turn, _now: Instant) -> bool {
        true
    }
}

/// Per-tick context handed to every callback. Carries the poller handle for
/// interest changes and collects clients spawned during the tick.
pub struct Turn {
    pub poller: Rc<Poller>,
    pub now: Instant,
    pub log: Logger,
    spawned: Vec<(RawFd, Box<dyn Client>)>,
}

impl Turn {
    pub fn new(poller: Rc<Poller>, log: Logger) -> Turn {
        Turn {
            poller,
            now: Instant::now(),
            log,
            spawned: Vec::new(),
        }
    }

    /// Queues a freshly created client for registration at the end of the
    /// tick. The client's `interest()` decides its initial mask.
    pub fn spawn(&mut self, fd: RawFd, client: Box<dyn Client>) {
        self.spawned.push((fd, client));
    }
}

pub struct Reactor {
    poller: Rc<Poller>,
    clients: HashMap<RawFd, Box<dyn Client>>,
    events: Vec<IoEvent>,
    log: Logger,
}

impl Reactor {
    pub fn new(kind: Option<&str>, log: Logger) -> NetResult<Reactor> {
        Ok(Reactor {
            poller: Rc::new(Poller::new(kind)?),
            clients: HashMap::new(),
            events: Vec::new(),
            log,
        })
    }

    #[inline]
    pub fn poller(&self) -> &Rc<Poller> {
        &self.poller
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Registers a client under its descriptor. A registration that the
    /// poller refuses drops the client, closing the descriptor it owns.
    pub fn register(&mut self, fd: RawFd, client: Box<dyn Client>) -> NetResult<()> {
        self.poller.add(fd, client.interest())?;
        self.clients.insert(fd, client);
        Ok(())
    }

    /// Unregisters and drops the client owning `fd`. Returns false when the
    /// descriptor was not registered.
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        self.poller.remove(fd);
        self.clients.remove(&fd).is_some()
    }

    /// The client registered under `fd`, if any.
    pub fn client_mut(&mut self, fd: RawFd) -> Option<&mut Box<dyn Client>> {
        self.clients.get_mut(&fd)
    }

    /// One dispatch tick: wait, deliver, honor remove hints, fold in
    /// spawned clients. A removed client is never invoked again.
    pub fn dispatch(&mut self, timeout_ms: i64) -> NetResult<usize> {
        let mut events = std::mem::take(&mut self.events);
        let delivered = self.poller.wait(&mut events, timeout_ms)?;

        let mut turn = Turn::new(self.poller.clone(), self.log.clone());

        for ev in &events {
            let mut client = match self.clients.remove(&ev.fd) {
                Some(client) => client,
                // Removed earlier in this same tick; the event is stale.
                None => continue,
            };

            let mut remove = false;
            client.on_io(&mut turn, ev.fd, ev.mask, &mut remove);

            if remove {
                self.poller.remove(ev.fd);
            } else {
                self.clients.insert(ev.fd, client);
            }
        }

        events.clear();
        self.events = events;

        self.absorb(turn);
        Ok(delivered)
    }

    /// Runs housekeeping over every client, reaping the ones that refuse to
    /// stay.
    pub fn sweep(&mut self, now: Instant) {
        let mut turn = Turn::new(self.poller.clone(), self.log.clone());
        turn.now = now;

        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            if let Some(mut client) = self.clients.remove(&fd) {
                if client.on_sweep(&mut turn, now) {
                    self.clients.insert(fd, client);
                } else {
                    self.poller.remove(fd);
                }
            }
        }

        self.absorb(turn);
    }

    /// Folds clients spawned on a turn into the registry. Turns created
    /// outside `dispatch` (timer and pool ticks) are handed back here.
    pub fn absorb(&mut self, turn: Turn) {
        for (fd, client) in turn.spawned {
            if let Err(err) = self.register(fd, client) {
                logging::warn!(self.log, "failed to register spawned client";
                               "fd" => fd, "err" => %err);
            }
        }
    }

    /// Drops every client, deregistering first. Used at teardown and in
    /// fork cleanup.
    pub fn clear(&mut self) {
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.poller.remove(fd);
            self.clients.remove(&fd);
        }
    }
}
