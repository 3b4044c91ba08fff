//! The fleet supervisor.
//!
//! Owns the listening sockets and one control channel per worker. Every
//! accepted connection goes to the worker with the fewest pending
//! connections, and the supervisor's copy of the descriptor is closed once the
//! handoff succeeds. Dead workers are replaced in the same slot.

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;

use crate::config::{ServerConfig, WorkerMode};
use crate::error::{HandoffError, Result, ServerError, WorkerError};
use crate::handoff::{self, HandoffReceiver, HandoffSender};
use crate::net::PortContext;
use crate::pending::PendingTable;
use crate::router::Router;
use crate::worker::{self, WorkerContext};

const SIGNALS: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX);

/// How often thread workers are checked for having exited.
const THREAD_CHECK: Duration = Duration::from_secs(1);

enum Runner {
    Process(libc::pid_t),
    Thread(JoinHandle<std::result::Result<(), WorkerError>>),
}

struct WorkerSlot {
    sender: HandoffSender,
    runner: Runner,
}

/// The supervisor's event sources. A forked worker drops its copy.
struct Reactor {
    poll: Poll,
    signals: Signals,
    waker: Arc<Waker>,
}

/// Requests a graceful shutdown from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Weak<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Asks the supervisor to stop. Does nothing once it has already exited.
    ///
    /// # Errors
    /// - Returns the underlying I/O error if the supervisor cannot be woken
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        match self.waker.upgrade() {
            Some(waker) => waker.wake(),
            None => Ok(()),
        }
    }
}

/// Owns the listeners and the worker fleet.
pub struct Supervisor {
    mode: WorkerMode,
    pidfile: Option<PathBuf>,
    template: WorkerContext,
    listeners: Vec<TcpListener>,
    workers: Vec<WorkerSlot>,
    worker_count: usize,
    reactor: Option<Reactor>,
    requested: Arc<AtomicBool>,
}

impl Supervisor {
    /// Prepares a fleet for already-bound `listeners`. No worker runs until
    /// [`run`](Self::run).
    ///
    /// # Arguments
    /// - `config`: Worker count, worker mode, parser limits and pidfile
    /// - `router`: Shared by every worker
    /// - `contexts`: Transport setup per declared port
    /// - `listeners`: One per declared port, in the same order as `contexts`
    ///
    /// # Errors
    /// - Returns `ServerError::Io` if the counts of `listeners` and `contexts` differ
    /// - Returns `ServerError::Io` if the poller, signal handlers or pending table cannot be set up
    pub fn new(
        config: &ServerConfig,
        router: Arc<Router>,
        contexts: Vec<PortContext>,
        mut listeners: Vec<TcpListener>,
    ) -> Result<Self> {
        if listeners.len() != contexts.len() {
            return Err(ServerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} listeners for {} ports", listeners.len(), contexts.len()),
            )));
        }

        let worker_count = config.workers();
        let poll = Poll::new()?;
        for (index, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, Token(index), Interest::READABLE)?;
        }

        let mut signals = match config.worker_mode {
            WorkerMode::Process => Signals::new([SIGCHLD, SIGTERM, SIGINT])?,
            WorkerMode::Thread => Signals::new([SIGTERM, SIGINT])?,
        };
        poll.registry()
            .register(&mut signals, SIGNALS, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Supervisor {
            mode: config.worker_mode,
            pidfile: config.pidfile.clone(),
            template: WorkerContext {
                id: 0,
                router,
                contexts: contexts.into(),
                pending: Arc::new(PendingTable::new(worker_count)?),
                limits: config.limits(),
            },
            listeners,
            workers: Vec::with_capacity(worker_count),
            worker_count,
            reactor: Some(Reactor { poll, signals, waker }),
            requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: self
                .reactor
                .as_ref()
                .map_or_else(Weak::new, |r| Arc::downgrade(&r.waker)),
            requested: self.requested.clone(),
        }
    }

    /// The table of pending connection counts, one slot per worker.
    pub fn pending(&self) -> Arc<PendingTable> {
        self.template.pending.clone()
    }

    /// Writes the configured pidfile, if any.
    pub fn write_pidfile(&self) -> Result<()> {
        if let Some(path) = &self.pidfile {
            fs::write(path, format!("{}\n", std::process::id()))?;
        }
        Ok(())
    }

    /// Removes the configured pidfile, if any, logging a failure.
    pub fn remove_pidfile(&self) {
        if let Some(path) = &self.pidfile {
            if let Err(err) = fs::remove_file(path) {
                log::warn!("cannot remove pidfile {}: {}", path.display(), err);
            }
        }
    }

    /// Spawns the workers and dispatches connections until a termination
    /// signal or a [`ShutdownHandle`] request arrives. Workers that exit are
    /// replaced in the same slot with their pending count zeroed.
    ///
    /// On return every worker has been stopped, the listeners are closed and
    /// the pidfile is removed.
    ///
    /// # Errors
    /// - Returns `ServerError::Spawn` if a worker cannot be started or replaced
    /// - Returns `ServerError::Io` if polling fails
    pub fn run(mut self) -> Result<()> {
        for index in 0..self.worker_count {
            match self.spawn(index) {
                Ok(slot) => self.workers.push(slot),
                Err(err) => {
                    self.shutdown();
                    return Err(err);
                }
            }
        }
        log::info!(
            "supervising {} {} worker(s) on {} port(s)",
            self.worker_count,
            match self.mode {
                WorkerMode::Process => "process",
                WorkerMode::Thread => "thread",
            },
            self.listeners.len()
        );

        let tick = (self.mode == WorkerMode::Thread).then_some(THREAD_CHECK);
        let mut events = Events::with_capacity(128);
        let outcome = loop {
            let Some(reactor) = self.reactor.as_mut() else {
                break Ok(());
            };
            if let Err(err) = reactor.poll.poll(&mut events, tick) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("supervisor polling error: {}", err);
                break Err(err.into());
            }

            let mut stop = false;
            let mut failure = None;
            for event in events.iter() {
                match event.token() {
                    SIGNALS => {
                        let signals: Vec<_> = self
                            .reactor
                            .as_mut()
                            .map(|r| r.signals.pending().collect())
                            .unwrap_or_default();
                        for signal in signals {
                            if signal == SIGCHLD {
                                if let Err(err) = self.reap() {
                                    failure = Some(err);
                                }
                            } else {
                                log::info!("received signal {}", signal);
                                stop = true;
                            }
                        }
                    }
                    WAKER => stop |= self.requested.load(Ordering::Acquire),
                    Token(port) => self.accept(port),
                }
            }
            if let Some(err) = failure {
                break Err(err);
            }
            if stop {
                break Ok(());
            }
            if self.mode == WorkerMode::Thread {
                if let Err(err) = self.check_threads() {
                    break Err(err);
                }
            }
        };

        self.shutdown();
        outcome
    }

    /// Accepts until the listener would block.
    fn accept(&mut self, port: usize) {
        loop {
            let Some(listener) = self.listeners.get(port) else {
                return;
            };
            match listener.accept() {
                Ok((stream, addr)) => {
                    log::trace!("accepted {} on port index {}", addr, port);
                    // Our copy closes here; the worker holds its own.
                    self.hand_off(&stream, port);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("accept on port index {} failed: {}", port, e);
                    return;
                }
            }
        }
    }

    /// Sends `stream` to the least-loaded worker. A worker whose channel is
    /// full or gone is skipped and the next least-loaded one is tried, until
    /// every worker has refused. Returns whether a worker took it.
    fn hand_off(&self, stream: &impl AsRawFd, port: usize) -> bool {
        let pending = &self.template.pending;
        let mut tried = Vec::with_capacity(self.workers.len());
        while let Some(index) = pending.least_loaded(&tried) {
            tried.push(index);
            let Some(slot) = self.workers.get(index) else {
                log::warn!("no worker in slot {}", index);
                continue;
            };
            pending.increment(index);
            match slot.sender.send(stream, port as u32) {
                Ok(()) => return true,
                Err(HandoffError::Busy) => log::debug!("worker {} is busy", index),
                Err(err) => log::warn!("handoff to worker {} failed: {}", index, err),
            }
            pending.decrement(index);
        }
        log::warn!("dropping connection on port index {}: no worker took it", port);
        false
    }

    /// Reaps exited worker processes and replaces them.
    fn reap(&mut self) -> Result<()> {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                return Ok(());
            }
            let Some(index) = self
                .workers
                .iter()
                .position(|w| matches!(w.runner, Runner::Process(p) if p == pid))
            else {
                continue;
            };
            log::warn!("worker {} (pid {}) exited with status {}, respawning", index, pid, status);
            self.respawn(index)?;
        }
    }

    fn check_threads(&mut self) -> Result<()> {
        for index in 0..self.workers.len() {
            let finished = matches!(&self.workers[index].runner, Runner::Thread(h) if h.is_finished());
            if finished {
                log::warn!("worker thread {} exited, respawning", index);
                self.respawn(index)?;
            }
        }
        Ok(())
    }

    fn respawn(&mut self, index: usize) -> Result<()> {
        self.template.pending.reset(index);
        let slot = self.spawn(index)?;
        let old = std::mem::replace(&mut self.workers[index], slot);
        if let Runner::Thread(handle) = old.runner {
            match handle.join() {
                Ok(Err(err)) => log::error!("worker thread {} failed: {}", index, err),
                Err(_) => log::error!("worker thread {} panicked", index),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }

    fn spawn(&mut self, index: usize) -> Result<WorkerSlot> {
        let (sender, receiver) = handoff::channel().map_err(|source| ServerError::Spawn { index, source })?;
        let ctx = WorkerContext {
            id: index,
            ..self.template.clone()
        };

        let runner = match self.mode {
            WorkerMode::Thread => std::thread::Builder::new()
                .name(format!("hearth-worker-{}", index))
                .spawn(move || worker::run(ctx, receiver))
                .map(Runner::Thread)
                .map_err(|source| ServerError::Spawn { index, source })?,
            WorkerMode::Process => match unsafe { libc::fork() } {
                -1 => {
                    return Err(ServerError::Spawn {
                        index,
                        source: io::Error::last_os_error(),
                    })
                }
                0 => {
                    drop(sender);
                    self.become_worker(ctx, receiver)
                }
                pid => {
                    drop(receiver);
                    Runner::Process(pid)
                }
            },
        };
        log::debug!("spawned worker {}", index);
        Ok(WorkerSlot { sender, runner })
    }

    /// Runs in a freshly forked child and never returns.
    fn become_worker(&mut self, ctx: WorkerContext, receiver: HandoffReceiver) -> ! {
        // Dropping the reactor unregisters the signal-hook actions, so the
        // default dispositions are restored after it.
        self.reactor = None;
        unsafe {
            libc::signal(SIGTERM, libc::SIG_DFL);
            libc::signal(SIGINT, libc::SIG_DFL);
            libc::signal(SIGCHLD, libc::SIG_DFL);
        }
        // Other workers' senders would hold their channels open past EOF.
        self.listeners.clear();
        self.workers.clear();

        let code = match worker::run(ctx, receiver) {
            Ok(()) => 0,
            Err(err) => {
                log::error!("worker failed: {}", err);
                1
            }
        };
        std::process::exit(code)
    }

    fn shutdown(&mut self) {
        log::info!("shutting down");
        if let Some(reactor) = &self.reactor {
            for listener in self.listeners.iter_mut() {
                let _ = reactor.poll.registry().deregister(listener);
            }
        }
        self.listeners.clear();

        let mut pids = Vec::new();
        let mut threads = Vec::new();
        for (index, slot) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            drop(slot.sender);
            match slot.runner {
                Runner::Process(pid) => {
                    unsafe { libc::kill(pid, SIGTERM) };
                    pids.push(pid);
                }
                Runner::Thread(handle) => threads.push((index, handle)),
            }
        }
        for pid in pids {
            let mut status = 0;
            while unsafe { libc::waitpid(pid, &mut status, 0) } < 0
                && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
            {}
        }
        for (index, handle) in threads {
            match handle.join() {
                Ok(Err(err)) => log::error!("worker thread {} failed: {}", index, err),
                Err(_) => log::error!("worker thread {} panicked", index),
                Ok(Ok(())) => {}
            }
        }

        self.remove_pidfile();
        log::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net;
    use crate::sitefile::SiteFile;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    fn supervisor(workers: usize, mode: WorkerMode) -> Supervisor {
        let site = Arc::new(SiteFile::parse("define port 80\n").unwrap());
        let config = ServerConfig {
            processes: workers + 1,
            worker_mode: mode,
            ..ServerConfig::default()
        };
        let listener = net::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 16).unwrap();
        let contexts = net::contexts(&site).unwrap();
        Supervisor::new(&config, Arc::new(Router::new(site)), contexts, vec![listener]).unwrap()
    }

    /// A slot whose receiving end is held by the test instead of a worker.
    fn detached_slot() -> (WorkerSlot, HandoffReceiver) {
        let (sender, receiver) = handoff::channel().unwrap();
        let runner = Runner::Thread(std::thread::spawn(|| Ok(())));
        (WorkerSlot { sender, runner }, receiver)
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_hand_off_prefers_least_loaded() {
        let mut sup = supervisor(2, WorkerMode::Thread);
        let (first, _rx0) = detached_slot();
        let (second, rx1) = detached_slot();
        sup.workers.extend([first, second]);
        sup.pending().increment(0);

        let (_client, server) = connected_pair();
        assert!(sup.hand_off(&server, 0));
        assert_eq!(sup.pending().snapshot(), vec![1, 1]);
        assert_eq!(rx1.recv().unwrap().unwrap().port, 0);
    }

    /// A worker that stopped draining its channel does not cost the client
    /// its connection while another worker has room
    #[test]
    fn test_busy_worker_falls_through_to_next() {
        let mut sup = supervisor(2, WorkerMode::Thread);
        let (first, _rx0) = detached_slot();
        let (second, rx1) = detached_slot();
        sup.workers.extend([first, second]);

        let (_client, server) = connected_pair();
        let mut filled = false;
        for _ in 0..100_000 {
            if sup.workers[0].sender.send(&server, 0).is_err() {
                filled = true;
                break;
            }
        }
        assert!(filled);

        assert!(sup.hand_off(&server, 0));
        assert_eq!(sup.pending().snapshot(), vec![0, 1]);
        assert!(rx1.recv().unwrap().is_some());
    }

    #[test]
    fn test_connection_dropped_when_no_worker_takes_it() {
        let mut sup = supervisor(2, WorkerMode::Thread);
        let (first, rx0) = detached_slot();
        let (second, rx1) = detached_slot();
        sup.workers.extend([first, second]);
        drop(rx0);
        drop(rx1);

        let (_client, server) = connected_pair();
        assert!(!sup.hand_off(&server, 0));
        assert_eq!(sup.pending().snapshot(), vec![0, 0]);
    }

    const WAKER_DATA: &str = "ffffffffffffffff";

    fn link(pid: &str, fd: i32) -> Option<String> {
        fs::read_link(format!("/proc/{}/fd/{}", pid, fd))
            .ok()
            .map(|target| target.display().to_string())
    }

    fn fdinfo(pid: &str, fd: i32) -> String {
        fs::read_to_string(format!("/proc/{}/fdinfo/{}", pid, fd)).unwrap_or_default()
    }

    /// The descriptor an epoll instance watches with the given token data.
    fn watched_fd(info: &str, data: &str) -> Option<i32> {
        info.lines().find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.first() != Some(&"tfd:") {
                return None;
            }
            let at = fields.iter().position(|f| *f == "data:")?;
            if fields.get(at + 1) != Some(&data) {
                return None;
            }
            fields.get(1)?.parse().ok()
        })
    }

    /// A forked worker keeps none of the supervisor's poller, waker or
    /// listeners
    #[test]
    fn test_forked_worker_closes_supervisor_descriptors() {
        let mut sup = supervisor(1, WorkerMode::Process);
        let poll_fd = sup.reactor.as_ref().unwrap().poll.as_raw_fd();
        let listener_fd = sup.listeners[0].as_raw_fd();
        let waker_fd = watched_fd(&fdinfo("self", poll_fd), WAKER_DATA).unwrap();
        let listener = link("self", listener_fd);
        assert!(listener.is_some());

        let slot = sup.spawn(0).unwrap();
        let Runner::Process(pid) = slot.runner else {
            panic!("expected a worker process");
        };
        let child = pid.to_string();

        let mut settled = false;
        for _ in 0..400 {
            settled = !fdinfo(&child, poll_fd).contains(WAKER_DATA)
                && link(&child, waker_fd).map_or(true, |t| !t.contains("eventfd"))
                && link(&child, listener_fd) != listener;
            if settled {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        // Closing the channel ends the worker.
        drop(slot.sender);
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(settled);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }
}
