//! The daemon shell: configuration, signals, listeners, children and the
//! main loop. One instance per process; the multi-process model forks
//! children that each run the same loop against their own reactor.

use crate::error::{ErrorKind, NetError, NetResult};
use crate::jobs::{JobManager, Wakeup};
use crate::listener::{AcceptHandler, ChildListener, Listener, ListenerKind, ParentListener};
use crate::reactor::{Reactor, Turn};
use crate::sockaddr::SockAddr;
use crate::socket::{self, Fd};
use crate::timer::{TimerId, TimerService};
use ballast::config::Ini;
use ballast::logging::{self, Logger};
use ballast::sysinfo::SysInfo;
use ballast::time;
use clap::{App, Arg};
use indexmap::IndexMap;
use rustls::ServerConfig;
use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const JOB_DRAIN_LIMIT: usize = 128;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// Signal handlers only flip flags; the main loop acts on them between
// ticks. This is the single process-global entry point in the crate.
static FLAG_RELOAD: AtomicBool = AtomicBool::new(false);
static FLAG_STOP: AtomicBool = AtomicBool::new(false);
static STOP_CODE: AtomicI32 = AtomicI32::new(0);
static FLAG_CHECK_CHILD: AtomicBool = AtomicBool::new(false);
static FLAG_USR1: AtomicBool = AtomicBool::new(false);
static FLAG_USR2: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(sig: libc::c_int) {
    match sig {
        libc::SIGHUP => FLAG_RELOAD.store(true, Ordering::SeqCst),
        libc::SIGINT | libc::SIGTERM => {
            STOP_CODE.store(0, Ordering::SeqCst);
            FLAG_STOP.store(true, Ordering::SeqCst);
        }
        libc::SIGCHLD => FLAG_CHECK_CHILD.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => FLAG_USR1.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => FLAG_USR2.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Asks the running instance to stop with `code` at the end of the current
/// tick. Callable from any hook, including channel handlers.
pub fn request_stop(code: i32) {
    STOP_CODE.store(code, Ordering::SeqCst);
    FLAG_STOP.store(true, Ordering::SeqCst);
}

/// Asks the running instance to re-read its configuration, as SIGHUP does.
pub fn request_reload() {
    FLAG_RELOAD.store(true, Ordering::SeqCst);
}

fn install_handler(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(sig, &sa, ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

pub fn init_signals() -> io::Result<()> {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;

    for &sig in &[
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGTERM,
        libc::SIGCHLD,
        libc::SIGUSR1,
        libc::SIGUSR2,
    ] {
        install_handler(sig, handler)?;
    }

    // Dead peers surface as write errors, not process death.
    install_handler(libc::SIGPIPE, libc::SIG_IGN)?;

    Ok(())
}

/// One forked child as the parent sees it, or as the child sees itself.
pub struct ChildRecord {
    pub index: usize,
    pub pid: libc::pid_t,
    pub parent_end: Option<Fd>,
    pub child_end: Option<Fd>,
}

/// Control-pair directory plus the round-robin cursor the parent listener
/// walks when distributing accepted sockets.
#[derive(Default)]
pub struct ChildTable {
    records: Vec<ChildRecord>,
    cursor: usize,
}

impl ChildTable {
    pub fn new() -> ChildTable {
        ChildTable::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: ChildRecord) {
        self.records.push(record);
    }

    pub fn by_index(&self, index: usize) -> Option<&ChildRecord> {
        self.records.iter().find(|rec| rec.index == index)
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut ChildRecord> {
        self.records.iter_mut().find(|rec| rec.index == index)
    }

    pub fn by_pid_mut(&mut self, pid: libc::pid_t) -> Option<&mut ChildRecord> {
        self.records.iter_mut().find(|rec| rec.pid == pid)
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut ChildRecord> {
        self.records.iter_mut()
    }

    /// Control end of the next live child, round-robin.
    pub fn next_parent_end(&mut self) -> Option<RawFd> {
        if self.records.is_empty() {
            return None;
        }

        let count = self.records.len();
        for _ in 0..count {
            self.cursor = (self.cursor + 1) % count;
            let record = &self.records[self.cursor];
            if record.pid > 0 {
                if let Some(fd) = record.parent_end.as_ref() {
                    return Some(fd.raw());
                }
            }
        }

        None
    }

    pub fn child_end_of(&self, index: usize) -> Option<RawFd> {
        self.by_index(index)
            .and_then(|rec| rec.child_end.as_ref())
            .map(|fd| fd.raw())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Single,
    Multi(usize),
}

struct ListenerSlot {
    port: String,
    kind: ListenerKind,
    handler: Option<Rc<RefCell<dyn AcceptHandler>>>,
    tls: Option<Arc<ServerConfig>>,
    fd: Option<RawFd>,
    parent: bool,
}

/// The application's side of the framework. Every hook has a default so a
/// daemon implements only what it needs; initialization hooks returning
/// false abort startup.
pub trait Service {
    fn on_config(&mut self, _inst: &mut Instance, _is_default: bool, _is_reload: bool) -> bool {
        true
    }

    fn on_init_log(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_init_channel(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_init_listener_single(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_init_listener_parent(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_init_listener_child(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_init_timer(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_init_extras(&mut self, _inst: &mut Instance) -> bool {
        true
    }

    fn on_timer(&mut self, _inst: &mut Instance, _id: TimerId) {}

    fn on_end_turn(&mut self, _inst: &mut Instance) {}

    fn on_exit(&mut self, _inst: &mut Instance) {}

    fn on_exit_child(
        &mut self,
        _inst: &mut Instance,
        _index: usize,
        _pid: libc::pid_t,
        _status: i32,
    ) {
    }

    fn on_signal_user(&mut self, _inst: &mut Instance, _sig: libc::c_int) {}

    fn on_fork_child(&mut self, _inst: &mut Instance, _index: usize) {}

    fn on_fork_cleanup_channel(&mut self, _inst: &mut Instance, _index: usize) {}

    fn on_fork_cleanup_listener(&mut self, inst: &mut Instance, _index: usize) {
        inst.close_listeners();
    }

    fn on_fork_cleanup_timer(&mut self, inst: &mut Instance, _index: usize) {
        inst.timers.clear();
    }

    fn on_fork_cleanup_extras(&mut self, _inst: &mut Instance, _index: usize) {}

    fn on_fork_cleanup_poller(&mut self, inst: &mut Instance, _index: usize) {
        if let Err(err) = inst.rebuild_poller() {
            logging::error!(inst.err_log, "failed to rebuild poller in child"; "err" => %err);
        }
    }
}

pub struct Instance {
    app_tag: String,
    app_name: String,
    pub config: Ini,
    pub reactor: Reactor,
    pub timers: TimerService,
    pub jobs: JobManager,
    pub log: Logger,
    pub err_log: Logger,
    listeners: IndexMap<String, ListenerSlot>,
    children: Rc<RefCell<ChildTable>>,
    mode: ProcessMode,
    child_index: Option<usize>,
    dead_children: usize,
    poller_kind: Option<String>,
    poller_timeout: i64,
    timeout_job: i64,
    timeout_ping: i64,
    run: bool,
    stage: bool,
    trace: bool,
    exit_code: i32,
    start_parent: u64,
    start_child: u64,
}

impl Instance {
    pub fn new(app_tag: &str, config: Ini, trace: bool, stage: bool, log: Logger) -> NetResult<Instance> {
        let info = SysInfo::gather();

        let poller_kind = config.get("poller", "type").map(str::to_string);
        let reactor = Reactor::new(poller_kind.as_deref(), log.clone())?;

        logging::info!(log, "instance booting";
                       "app" => app_tag, "host" => info.hostname.as_str(), "pid" => info.pid,
                       "cores" => info.cores, "poller" => reactor.poller().kind());

        let now = time::timestamp_secs();

        let mut inst = Instance {
            app_tag: app_tag.to_string(),
            app_name: format!("{}@{}", app_tag, info.hostname),
            config,
            reactor,
            timers: TimerService::new(),
            jobs: JobManager::new()?,
            log: log.clone(),
            err_log: log,
            listeners: IndexMap::new(),
            children: Rc::new(RefCell::new(ChildTable::new())),
            mode: ProcessMode::Single,
            child_index: None,
            dead_children: 0,
            poller_kind,
            poller_timeout: 100,
            timeout_job: 3000,
            timeout_ping: 0,
            run: true,
            stage,
            trace,
            exit_code: 0,
            start_parent: now,
            start_child: now,
        };

        inst.apply_config();
        Ok(inst)
    }

    fn apply_config(&mut self) {
        self.poller_timeout = self.config.get_i64("poller", "timeout", 100);
        self.timeout_job = self.config.get_i64("timeout", "job", 3000);
        self.timeout_ping = self.config.get_i64("timeout", "ping", 0);

        self.mode = match self.config.get("process", "type") {
            Some("multi") => ProcessMode::Multi(self.config.get_usize("process", "count", 1)),
            _ => ProcessMode::Single,
        };
    }

    fn init_logs(&mut self) {
        if let Some(path) = self.config.get("log.cmd", "path") {
            let rotate = self.config.get_i64("log.cmd", "rotate", 64) as u64;
            match logging::init_file(path, self.trace, rotate, 8) {
                Ok(log) => self.log = log,
                Err(err) => {
                    logging::warn!(self.log, "failed to open command log";
                                   "path" => path, "err" => %err);
                }
            }
        }

        if let Some(path) = self.config.get("log.err", "path") {
            let rotate = self.config.get_i64("log.err", "rotate", 64) as u64;
            match logging::init_file(path, self.trace, rotate, 8) {
                Ok(log) => self.err_log = log,
                Err(err) => {
                    logging::warn!(self.log, "failed to open error log";
                                   "path" => path, "err" => %err);
                }
            }
        }
    }

    #[inline]
    pub fn app_tag(&self) -> &str {
        &self.app_tag
    }

    #[inline]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    #[inline]
    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    #[inline]
    pub fn is_child(&self) -> bool {
        self.child_index.is_some()
    }

    #[inline]
    pub fn child_index(&self) -> Option<usize> {
        self.child_index
    }

    #[inline]
    pub fn is_single(&self) -> bool {
        !self.is_child() && matches!(self.mode, ProcessMode::Single)
    }

    #[inline]
    pub fn child_count(&self) -> usize {
        match self.mode {
            ProcessMode::Multi(count) => count,
            ProcessMode::Single => 0,
        }
    }

    #[inline]
    pub fn dead_children(&self) -> usize {
        self.dead_children
    }

    #[inline]
    pub fn reset_dead_children(&mut self) {
        self.dead_children = 0;
    }

    #[inline]
    pub fn children(&self) -> &Rc<RefCell<ChildTable>> {
        &self.children
    }

    #[inline]
    pub fn is_stage(&self) -> bool {
        self.stage
    }

    #[inline]
    pub fn timeout_ping(&self) -> i64 {
        self.timeout_ping
    }

    /// Ping timeout as the channel constructor wants it.
    pub fn ping_duration(&self) -> Option<Duration> {
        if self.timeout_ping > 0 {
            Some(Duration::from_millis(self.timeout_ping as u64))
        } else {
            None
        }
    }

    #[inline]
    pub fn timeout_job(&self) -> i64 {
        self.timeout_job
    }

    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    #[inline]
    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    /// Stops the loop at the end of the current tick.
    pub fn stop(&mut self, code: i32) {
        self.exit_code = code;
        self.run = false;
    }

    #[inline]
    pub fn start_parent(&self) -> u64 {
        self.start_parent
    }

    #[inline]
    pub fn start_child(&self) -> u64 {
        self.start_child
    }

    /// A fresh turn for timer and pool driving; hand it back through
    /// `reactor.absorb` when done.
    pub fn turn(&self) -> Turn {
        Turn::new(self.reactor.poller().clone(), self.log.clone())
    }

    fn listen_port(&self, name: &str) -> NetResult<(String, u16)> {
        let port = match self.config.get(name, "port") {
            Some(port) => port.to_string(),
            None => {
                logging::error!(self.err_log, "listener section without port";
                                "name" => name, "kind" => ErrorKind::ConfigInvalid.as_str());
                return Err(NetError::Fatal(ErrorKind::ConfigInvalid));
            }
        };

        let numeric = port
            .parse::<u16>()
            .map_err(|_| NetError::Fatal(ErrorKind::ConfigInvalid))?;

        Ok((port, numeric))
    }

    /// Opens a single-process listener named after its config section.
    pub fn open_listener(
        &mut self,
        name: &str,
        kind: ListenerKind,
        handler: Rc<RefCell<dyn AcceptHandler>>,
        tls: Option<Arc<ServerConfig>>,
    ) -> NetResult<()> {
        let (port, numeric) = self.listen_port(name)?;

        let listener = Listener::open(
            &SockAddr::any_v4(numeric),
            kind,
            tls.clone(),
            handler.clone(),
            self.log.clone(),
        )?;

        let fd = listener.fd();
        self.reactor.register(fd, Box::new(listener))?;

        self.listeners.insert(
            name.to_string(),
            ListenerSlot {
                port,
                kind,
                handler: Some(handler),
                tls,
                fd: Some(fd),
                parent: false,
            },
        );

        Ok(())
    }

    /// Opens a parent-distributor listener named after its config section.
    pub fn open_listener_parent(&mut self, name: &str, kind: ListenerKind) -> NetResult<()> {
        let (port, numeric) = self.listen_port(name)?;

        let listener = ParentListener::open(
            &SockAddr::any_v4(numeric),
            kind,
            self.children.clone(),
            self.log.clone(),
        )?;

        let fd = listener.fd();
        self.reactor.register(fd, Box::new(listener))?;

        self.listeners.insert(
            name.to_string(),
            ListenerSlot {
                port,
                kind,
                handler: None,
                tls: None,
                fd: Some(fd),
                parent: true,
            },
        );

        Ok(())
    }

    /// Opens the child-side receiver over this child's control pair.
    pub fn open_listener_child(
        &mut self,
        handler: Rc<RefCell<dyn AcceptHandler>>,
        tls: Vec<(ListenerKind, Arc<ServerConfig>)>,
    ) -> NetResult<()> {
        let index = self
            .child_index
            .ok_or(NetError::Fatal(ErrorKind::ListenerOpenFailed))?;

        let pipe = self
            .children
            .borrow()
            .child_end_of(index)
            .ok_or(NetError::Fatal(ErrorKind::ListenerOpenFailed))?;

        let listener = ChildListener::new(pipe, tls, handler, self.log.clone())?;
        self.reactor.register(pipe, Box::new(listener))?;

        Ok(())
    }

    pub fn listener_fd(&self, name: &str) -> Option<RawFd> {
        self.listeners.get(name).and_then(|slot| slot.fd)
    }

    /// Closes every listener this process owns. Child cleanup and teardown.
    pub fn close_listeners(&mut self) {
        for (_, slot) in self.listeners.iter_mut() {
            if let Some(fd) = slot.fd.take() {
                self.reactor.deregister(fd);
            }
        }
        self.listeners.clear();
    }

    /// Reconciles open listeners with the (re-)loaded config: a slot whose
    /// port changed is closed and reopened on the new port.
    pub fn refresh_listeners(&mut self) {
        let names: Vec<String> = self.listeners.keys().cloned().collect();

        for name in names {
            let new_port = match self.config.get(&name, "port") {
                Some(port) => port.to_string(),
                None => continue,
            };

            let slot = match self.listeners.get(&name) {
                Some(slot) if slot.port != new_port => slot,
                _ => continue,
            };

            let kind = slot.kind;
            let parent = slot.parent;
            let handler = slot.handler.clone();
            let tls = slot.tls.clone();

            logging::info!(self.log, "listener port changed";
                           "name" => name.as_str(), "port" => new_port.as_str());

            // Deregistering drops the old listener, closing its socket.
            if let Some(slot) = self.listeners.shift_remove(&name) {
                if let Some(fd) = slot.fd {
                    self.reactor.deregister(fd);
                }
            }

            let result = if parent {
                self.open_listener_parent(&name, kind)
            } else if let Some(handler) = handler {
                self.open_listener(&name, kind, handler, tls)
            } else {
                continue;
            };

            if let Err(err) = result {
                logging::error!(self.err_log, "failed to reopen listener";
                                "name" => name.as_str(), "err" => %err);
            }
        }
    }

    /// Drops everything registered with the reactor and rebuilds the poller
    /// of the same kind. The child side of fork runs this so it never shares
    /// the parent's interest list.
    pub fn rebuild_poller(&mut self) -> NetResult<()> {
        self.reactor.clear();
        self.reactor = Reactor::new(self.poller_kind.as_deref(), self.log.clone())?;
        Ok(())
    }

    /// Forks child `index`. Returns true in the child, false in the parent.
    pub fn fork<S: Service>(&mut self, service: &mut S, index: usize) -> NetResult<bool> {
        let (parent_end, child_end) = socket::socket_pair()?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            logging::error!(self.err_log, "fork failed";
                            "index" => index, "kind" => ErrorKind::ForkFailed.as_str());
            return Err(NetError::Fatal(ErrorKind::ForkFailed));
        }

        if pid == 0 {
            // Child: keep only its own control end.
            self.child_index = Some(index);
            self.start_child = time::timestamp_secs();

            {
                let mut table = self.children.borrow_mut();
                for record in table.records_mut() {
                    record.parent_end = None;
                    record.child_end = None;
                }
                table.push(ChildRecord {
                    index,
                    pid: unsafe { libc::getpid() },
                    parent_end: None,
                    child_end: Some(child_end),
                });
            }
            drop(parent_end);

            service.on_fork_cleanup_channel(self, index);
            service.on_fork_cleanup_listener(self, index);
            service.on_fork_cleanup_timer(self, index);
            service.on_fork_cleanup_extras(self, index);
            service.on_fork_cleanup_poller(self, index);

            // The parent's job pipe is shared across the fork; the child
            // gets its own.
            self.jobs = JobManager::new()?;

            logging::info!(self.log, "child started";
                           "index" => index, "pid" => unsafe { libc::getpid() });

            service.on_fork_child(self, index);
            return Ok(true);
        }

        drop(child_end);
        self.children.borrow_mut().push(ChildRecord {
            index,
            pid,
            parent_end: Some(parent_end),
            child_end: None,
        });

        logging::info!(self.log, "forked child"; "index" => index, "pid" => pid);
        Ok(false)
    }

    /// Nonblocking reap of dead children; fires the user hook per corpse.
    pub fn reap_children<S: Service>(&mut self, service: &mut S) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }

            let index = {
                let mut table = self.children.borrow_mut();
                match table.by_pid_mut(pid) {
                    Some(record) => {
                        record.pid = 0;
                        record.parent_end = None;
                        Some(record.index)
                    }
                    None => None,
                }
            };

            self.dead_children += 1;
            logging::warn!(self.err_log, "child died";
                           "pid" => pid, "status" => status,
                           "kind" => ErrorKind::ChildDied.as_str());

            if let Some(index) = index {
                service.on_exit_child(self, index, pid, status);
            }
        }
    }

    /// Signals one child by index. Parent only.
    pub fn signal_child(&self, index: usize, sig: libc::c_int) -> bool {
        if self.is_child() {
            return false;
        }

        let table = self.children.borrow();
        match table.by_index(index) {
            Some(record) if record.pid > 0 => unsafe { libc::kill(record.pid, sig) == 0 },
            _ => false,
        }
    }

    /// Signals every live child. Parent only.
    pub fn signal_children(&self, sig: libc::c_int) -> bool {
        if self.is_child() {
            return false;
        }

        let table = self.children.borrow();
        let mut all = true;
        for index in 0..table.len() {
            if let Some(record) = table.by_index(index) {
                if record.pid > 0 {
                    all &= unsafe { libc::kill(record.pid, sig) == 0 };
                }
            }
        }
        all
    }

    fn register_wakeup(&mut self) -> NetResult<()> {
        let fd = self.jobs.wake_fd();
        self.reactor.register(fd, Box::new(Wakeup::new(fd)))
    }

    fn main_loop<S: Service>(&mut self, service: &mut S) {
        let mut last_sweep = Instant::now();

        while self.run {
            if FLAG_RELOAD.swap(false, Ordering::SeqCst) {
                match self.config.reload() {
                    Ok(()) => {
                        logging::info!(self.log, "configuration reloaded");
                        self.apply_config();
                        if !service.on_config(self, false, true) {
                            logging::warn!(self.err_log, "reload rejected by service");
                        }
                        self.refresh_listeners();
                    }
                    Err(err) => {
                        logging::error!(self.err_log, "config reload failed";
                                        "kind" => ErrorKind::ConfigInvalid.as_str(),
                                        "err" => %err);
                    }
                }
            }

            if let Err(err) = self.reactor.dispatch(self.poller_timeout) {
                logging::error!(self.err_log, "dispatch failed"; "err" => %err);
                self.exit_code = 1;
                break;
            }

            let now = Instant::now();
            if now.duration_since(last_sweep) >= SWEEP_INTERVAL {
                self.reactor.sweep(now);
                last_sweep = now;
            }

            for id in self.timers.take_due(now) {
                service.on_timer(self, id);
            }

            self.jobs.drain(JOB_DRAIN_LIMIT);

            if FLAG_CHECK_CHILD.swap(false, Ordering::SeqCst) {
                self.reap_children(service);
            }

            if FLAG_USR1.swap(false, Ordering::SeqCst) {
                service.on_signal_user(self, libc::SIGUSR1);
            }
            if FLAG_USR2.swap(false, Ordering::SeqCst) {
                service.on_signal_user(self, libc::SIGUSR2);
            }

            service.on_end_turn(self);

            if FLAG_STOP.swap(false, Ordering::SeqCst) {
                self.exit_code = STOP_CODE.load(Ordering::SeqCst);
                self.run = false;
            }
        }
    }
}

/// Candidate config locations, most specific first.
fn config_candidates(app_tag: &str, stage: bool) -> Vec<PathBuf> {
    let file = if stage {
        format!("{}.stage.ini", app_tag)
    } else {
        format!("{}.ini", app_tag)
    };

    vec![
        PathBuf::from(&file),
        PathBuf::from("conf").join(&file),
        PathBuf::from("/etc").join(app_tag).join(&file),
    ]
}

/// Entry point for daemons: parses the command line, loads configuration,
/// runs the startup sequence and the main loop, and returns the exit code
/// for the process.
pub fn run<S: Service>(app_tag: &str, service: &mut S, args: Vec<String>) -> i32 {
    let matches = App::new(app_tag)
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .help("Enable trace logging"),
        )
        .arg(
            Arg::with_name("config")
                .short("f")
                .value_name("PATH")
                .takes_value(true)
                .help("Path to the config file"),
        )
        .arg(
            Arg::with_name("stage")
                .short("s")
                .help("Load the stage config variant"),
        )
        .get_matches_from_safe(args);

    let matches = match matches {
        Ok(matches) => matches,
        Err(err) => {
            // -h and -V land here; anything else is a usage error.
            let usage = matches!(
                err.kind,
                clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed
            );
            if usage {
                println!("{}", err.message);
                return 0;
            }
            eprintln!("{}", err.message);
            return 2;
        }
    };

    let trace = matches.is_present("verbose");
    let stage = matches.is_present("stage");

    let boot_log = match logging::init_terminal(trace) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("failed to initialize logging: {}", err);
            return 1;
        }
    };

    if let Err(err) = init_signals() {
        logging::error!(boot_log, "failed to install signal handlers"; "err" => %err);
        return 1;
    }

    let config = match matches.value_of("config") {
        Some(path) => match Ini::load(path) {
            Ok(config) => config,
            Err(err) => {
                logging::error!(boot_log, "failed to load config";
                                "path" => path, "kind" => ErrorKind::ConfigInvalid.as_str(),
                                "err" => %err);
                return 1;
            }
        },
        None => {
            let found = config_candidates(app_tag, stage)
                .into_iter()
                .find(|path| path.exists());

            match found {
                Some(path) => match Ini::load(&path) {
                    Ok(config) => config,
                    Err(err) => {
                        logging::error!(boot_log, "failed to load config";
                                        "path" => %path.display(),
                                        "kind" => ErrorKind::ConfigInvalid.as_str(),
                                        "err" => %err);
                        return 1;
                    }
                },
                None => {
                    logging::warn!(boot_log, "no config file found, running on defaults";
                                   "app" => app_tag);
                    Ini::default()
                }
            }
        }
    };

    let mut inst = match Instance::new(app_tag, config, trace, stage, boot_log.clone()) {
        Ok(inst) => inst,
        Err(err) => {
            logging::error!(boot_log, "failed to create instance"; "err" => %err);
            return 1;
        }
    };

    if !service.on_config(&mut inst, true, false) {
        logging::error!(inst.err_log, "initial configuration rejected");
        return 1;
    }

    inst.init_logs();
    if !service.on_init_log(&mut inst) {
        return 1;
    }

    if !service.on_init_channel(&mut inst) {
        return 1;
    }

    // Children fork before any listener exists; each child then opens its
    // own receiver while the parent opens the real listening sockets.
    if let ProcessMode::Multi(count) = inst.mode() {
        for index in 0..count {
            match inst.fork(service, index) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(err) => {
                    logging::error!(inst.err_log, "failed to fork"; "index" => index, "err" => %err);
                    return 1;
                }
            }
        }
    }

    let listeners_ok = if inst.is_child() {
        service.on_init_listener_child(&mut inst)
    } else if inst.is_single() {
        service.on_init_listener_single(&mut inst)
    } else {
        service.on_init_listener_parent(&mut inst)
    };

    if !listeners_ok {
        logging::error!(inst.err_log, "listener initialization failed";
                        "kind" => ErrorKind::ListenerOpenFailed.as_str());
        return 1;
    }

    if let Err(err) = inst.register_wakeup() {
        logging::error!(inst.err_log, "failed to register job wakeup"; "err" => %err);
        return 1;
    }

    if !service.on_init_timer(&mut inst) {
        return 1;
    }

    if !service.on_init_extras(&mut inst) {
        return 1;
    }

    logging::info!(inst.log, "entering main loop";
                   "app" => inst.app_name(), "child" => ?inst.child_index());

    inst.main_loop(service);

    service.on_exit(&mut inst);
    inst.close_listeners();
    inst.reactor.clear();

    logging::info!(inst.log, "instance stopped"; "code" => inst.exit_code());
    inst.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_table_round_robin() {
        let mut table = ChildTable::new();

        let (a, _ka) = socket::socket_pair().unwrap();
        let (b, _kb) = socket::socket_pair().unwrap();
        let (c, _kc) = socket::socket_pair().unwrap();

        let (fa, fb, fc) = (a.raw(), b.raw(), c.raw());

        table.push(ChildRecord {
            index: 0,
            pid: 100,
            parent_end: Some(a),
            child_end: None,
        });
        table.push(ChildRecord {
            index: 1,
            pid: 101,
            parent_end: Some(b),
            child_end: None,
        });
        table.push(ChildRecord {
            index: 2,
            pid: 102,
            parent_end: Some(c),
            child_end: None,
        });

        // Cursor advances before picking, so the rotation starts at 1.
        assert_eq!(table.next_parent_end(), Some(fb));
        assert_eq!(table.next_parent_end(), Some(fc));
        assert_eq!(table.next_parent_end(), Some(fa));
        assert_eq!(table.next_parent_end(), Some(fb));

        // A dead child is skipped.
        table.by_index_mut(2).unwrap().pid = 0;
        assert_eq!(table.next_parent_end(), Some(fa));
        assert_eq!(table.next_parent_end(), Some(fb));
        assert_eq!(table.next_parent_end(), Some(fa));
    }

    #[test]
    fn test_child_table_empty() {
        let mut table = ChildTable::new();
        assert_eq!(table.next_parent_end(), None);
    }

    fn test_instance(config: &str) -> Instance {
        Instance::new(
            "testapp",
            Ini::parse(config).unwrap(),
            false,
            false,
            ballast::logging::null(),
        )
        .unwrap()
    }

    #[test]
    fn test_mode_and_timeouts_from_config() {
        let inst = test_instance(
            "[process]\ntype = multi\ncount = 4\n[poller]\ntimeout = 250\n[timeout]\nping = 5000\njob = 100\n",
        );

        assert_eq!(inst.mode(), ProcessMode::Multi(4));
        assert_eq!(inst.child_count(), 4);
        assert!(!inst.is_single());
        assert!(!inst.is_child());
        assert_eq!(inst.timeout_ping(), 5000);
        assert_eq!(inst.timeout_job(), 100);
        assert_eq!(inst.ping_duration(), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_default_mode_is_single() {
        let inst = test_instance("");
        assert_eq!(inst.mode(), ProcessMode::Single);
        assert!(inst.is_single());
        assert_eq!(inst.ping_duration(), None);
    }

    #[test]
    fn test_open_listener_requires_port() {
        use crate::listener::{Accepted, ListenerKind};
        use crate::reactor::Turn;

        struct NopHandler;
        impl AcceptHandler for NopHandler {
            fn on_accept(&mut self, _turn: &mut Turn, _accepted: Accepted) -> bool {
                true
            }
        }

        let mut inst = test_instance("[svc]\nport = 0\n");

        let handler: Rc<RefCell<dyn AcceptHandler>> = Rc::new(RefCell::new(NopHandler));

        inst.open_listener("svc", ListenerKind::Service, handler.clone(), None)
            .unwrap();
        assert!(inst.listener_fd("svc").is_some());

        let missing = inst.open_listener("admin", ListenerKind::Admin, handler, None);
        assert_eq!(
            missing.unwrap_err(),
            NetError::Fatal(ErrorKind::ConfigInvalid)
        );

        inst.close_listeners();
        assert!(inst.listener_fd("svc").is_none());
    }

    #[test]
    fn test_config_candidates_stage_variant() {
        let plain = config_candidates("echo", false);
        assert_eq!(plain[0], PathBuf::from("echo.ini"));

        let stage = config_candidates("echo", true);
        assert_eq!(stage[0], PathBuf::from("echo.stage.ini"));
        assert_eq!(stage[2], PathBuf::from("/etc/echo/echo.stage.ini"));
    }
}
