//! A worker's event loop.
//!
//! Each worker multiplexes its control channel and every connection it owns
//! on one mio `Poll`. The control channel uses [`CONTROL`]; the connection in
//! slot `i` of the table uses `Token(i + 1)`, so a token maps straight back to
//! its slot. Removing a connection moves the last slot into the hole, and the
//! moved connection is re-registered under its new token.

use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::connection::{Connection, State};
use crate::error::{HandoffError, WorkerError};
use crate::handoff::{Handoff, HandoffReceiver};
use crate::net::{PortContext, Transport};
use crate::pending::PendingTable;
use crate::request::Limits;
use crate::router::Router;
use crate::table::SlotTable;

const CONTROL: Token = Token(0);
const INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);

fn token(slot: usize) -> Token {
    Token(slot + 1)
}

/// Everything a worker shares with the rest of the fleet.
#[derive(Clone)]
pub struct WorkerContext {
    /// This worker's slot in the pending table.
    pub id: usize,
    pub router: Arc<Router>,
    /// Transport setup per declared port, indexed like the sitefile's ports.
    pub contexts: Arc<[PortContext]>,
    pub pending: Arc<PendingTable>,
    pub limits: Limits,
}

/// A single-threaded reactor serving the connections handed to it.
pub struct Worker {
    ctx: WorkerContext,
    poll: Poll,
    events: Events,
    control: HandoffReceiver,
    connections: SlotTable<Connection<Transport>>,
    /// Idle timeout per port index.
    timeouts: Vec<Option<Duration>>,
    tick: Option<Duration>,
}

/// Runs a worker until its control channel is closed.
pub fn run(ctx: WorkerContext, control: HandoffReceiver) -> Result<(), WorkerError> {
    Worker::new(ctx, control)?.run()
}

impl Worker {
    /// Creates the worker's poller and registers its control channel.
    ///
    /// # Arguments
    /// - `ctx`: The worker's slot, router, port contexts and pending table
    /// - `control`: Receiving end of the supervisor's handoff channel
    ///
    /// # Errors
    /// - Returns `WorkerError::Init` if the poller cannot be created
    /// - Returns `WorkerError::Registration` if the control channel cannot be registered
    pub fn new(ctx: WorkerContext, control: HandoffReceiver) -> Result<Self, WorkerError> {
        let poll = Poll::new().map_err(WorkerError::Init)?;
        poll.registry()
            .register(&mut SourceFd(&control.as_raw_fd()), CONTROL, Interest::READABLE)
            .map_err(WorkerError::Registration)?;

        let site = ctx.router.site();
        let timeouts = site
            .ports
            .iter()
            .map(|p| (p.timeout_ms > 0).then(|| Duration::from_millis(p.timeout_ms)))
            .collect();
        let tick = site.min_timeout_ms().map(Duration::from_millis);

        Ok(Worker {
            ctx,
            poll,
            events: Events::with_capacity(256),
            control,
            connections: SlotTable::with_capacity(64),
            timeouts,
            tick,
        })
    }

    /// Serves connections until the supervisor closes the control channel,
    /// then drops every remaining connection and releases its pending count.
    ///
    /// # Errors
    /// - Returns `WorkerError::Polling` if polling fails with anything but `EINTR`
    pub fn run(mut self) -> Result<(), WorkerError> {
        log::debug!("worker {} started", self.ctx.id);
        loop {
            if let Err(err) = self.poll.poll(&mut self.events, self.tick) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("worker {} polling error: {}", self.ctx.id, err);
                return Err(WorkerError::Polling(err));
            }

            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            let mut control_ready = false;
            let mut closing = Vec::new();

            for token in tokens {
                if token == CONTROL {
                    control_ready = true;
                } else if self.drive(token.0 - 1) == State::Closed {
                    closing.push(token.0 - 1);
                }
            }
            closing.extend(self.expired());
            self.close_all(closing);

            if control_ready && !self.accept_handoffs() {
                break;
            }
        }

        log::debug!("worker {} control channel closed, exiting", self.ctx.id);
        self.shutdown();
        Ok(())
    }

    fn drive(&mut self, slot: usize) -> State {
        let Some(conn) = self.connections.get_mut(slot) else {
            return State::Open;
        };
        match conn.drive(&self.ctx.router) {
            Ok(state) => state,
            Err(err) => {
                log::debug!("connection error: {}", err);
                State::Closed
            }
        }
    }

    /// Slots whose connection has been idle past its port's timeout.
    fn expired(&self) -> Vec<usize> {
        if self.tick.is_none() {
            return Vec::new();
        }
        let now = Instant::now();
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, conn)| {
                self.timeouts
                    .get(conn.port())
                    .copied()
                    .flatten()
                    .map_or(false, |timeout| conn.is_idle(now, timeout))
            })
            .map(|(slot, _)| {
                log::debug!("closing idle connection in slot {}", slot);
                slot
            })
            .collect()
    }

    /// Removes the given slots, highest first so earlier indices stay valid.
    fn close_all(&mut self, mut slots: Vec<usize>) {
        slots.sort_unstable();
        slots.dedup();
        for slot in slots.into_iter().rev() {
            self.close(slot);
        }
    }

    fn close(&mut self, slot: usize) {
        let Some(removed) = self.connections.remove(slot) else {
            return;
        };
        let mut conn = removed.value;
        let _ = self.poll.registry().deregister(conn.stream_mut());
        self.ctx.pending.decrement(self.ctx.id);
        drop(conn);

        if removed.moved_from.is_none() {
            return;
        }
        let Some(moved) = self.connections.get_mut(slot) else {
            return;
        };
        if let Err(err) = self
            .poll
            .registry()
            .reregister(moved.stream_mut(), token(slot), INTEREST)
        {
            log::warn!("failed to re-register moved connection: {}", err);
            self.close(slot);
        }
    }

    /// Adopts every queued handoff. Returns false once the supervisor has
    /// closed the channel.
    fn accept_handoffs(&mut self) -> bool {
        loop {
            match self.control.recv() {
                Ok(Some(handoff)) => self.adopt(handoff),
                Ok(None) => return true,
                Err(HandoffError::Closed) => return false,
                Err(HandoffError::Malformed(why)) => {
                    log::warn!("worker {} dropped control message: {}", self.ctx.id, why);
                    self.ctx.pending.decrement(self.ctx.id);
                }
                Err(err @ (HandoffError::Busy | HandoffError::Io(_))) => {
                    log::warn!("worker {} control channel error: {}", self.ctx.id, err);
                    return true;
                }
            }
        }
    }

    fn adopt(&mut self, handoff: Handoff) {
        let Some(context) = self.ctx.contexts.get(handoff.port) else {
            log::warn!("handoff names unknown port index {}", handoff.port);
            self.ctx.pending.decrement(self.ctx.id);
            return;
        };
        let transport = match context.wrap(handoff.stream) {
            Ok(transport) => transport,
            Err(err) => {
                log::warn!("failed to set up connection: {}", err);
                self.ctx.pending.decrement(self.ctx.id);
                return;
            }
        };

        let mut conn = Connection::new(transport, handoff.port, self.ctx.limits);
        let slot = self.connections.len();
        // Registration reports readiness that is already present, so bytes
        // sent before the handoff are not missed.
        if let Err(err) = self
            .poll
            .registry()
            .register(conn.stream_mut(), token(slot), INTEREST)
        {
            log::warn!("failed to register connection: {}", err);
            self.ctx.pending.decrement(self.ctx.id);
            return;
        }
        self.connections.push(conn);
    }

    fn shutdown(&mut self) {
        let registry = self.poll.registry();
        for mut conn in self.connections.drain() {
            let _ = registry.deregister(conn.stream_mut());
            self.ctx.pending.decrement(self.ctx.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::tests::Scratch;
    use crate::handoff;
    use crate::sitefile::SiteFile;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn context(scratch: &Scratch, extra: &str) -> WorkerContext {
        let file = scratch.write("hello.txt", "hi");
        let text = format!("{}read /hello \"{}\"\n", extra, file.display());
        let site = Arc::new(SiteFile::parse(&text).unwrap());
        let contexts: Vec<PortContext> = crate::net::contexts(&site).unwrap();
        WorkerContext {
            id: 0,
            router: Arc::new(Router::new(site)),
            contexts: contexts.into(),
            pending: Arc::new(PendingTable::new(1).unwrap()),
            limits: Limits::default(),
        }
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_serves_handed_off_connection() {
        let scratch = Scratch::new("worker");
        let ctx = context(&scratch, "");
        let pending = ctx.pending.clone();
        let (tx, rx) = handoff::channel().unwrap();
        let worker = std::thread::spawn(move || run(ctx, rx));

        let (mut client, server) = connected_pair();
        pending.increment(0);
        tx.send(&server, 0).unwrap();
        drop(server);

        client.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        while !response.ends_with(b"hi") {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed early");
            response.extend_from_slice(&buf[..n]);
        }
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));

        drop(client);
        assert!(wait_for(|| pending.get(0) == 0));

        drop(tx);
        worker.join().unwrap().unwrap();
    }

    /// A framing error closes the connection without a response
    #[test]
    fn test_malformed_request_is_dropped() {
        let scratch = Scratch::new("worker");
        let ctx = context(&scratch, "");
        let pending = ctx.pending.clone();
        let (tx, rx) = handoff::channel().unwrap();
        let worker = std::thread::spawn(move || run(ctx, rx));

        let (mut client, server) = connected_pair();
        pending.increment(0);
        tx.send(&server, 0).unwrap();
        drop(server);
        client.write_all(b"BREW /pot HTTP/1.1\r\n").unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert!(wait_for(|| pending.get(0) == 0));

        drop(tx);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_idle_connections_time_out() {
        let scratch = Scratch::new("worker");
        let ctx = context(&scratch, "define port 80\ndefine timeout 50\n");
        let pending = ctx.pending.clone();
        let (tx, rx) = handoff::channel().unwrap();
        let worker = std::thread::spawn(move || run(ctx, rx));

        let (mut client, server) = connected_pair();
        pending.increment(0);
        tx.send(&server, 0).unwrap();
        drop(server);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert!(wait_for(|| pending.get(0) == 0));

        drop(tx);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_unknown_port_index_is_dropped() {
        let scratch = Scratch::new("worker");
        let ctx = context(&scratch, "");
        let pending = ctx.pending.clone();
        let (tx, rx) = handoff::channel().unwrap();
        let worker = std::thread::spawn(move || run(ctx, rx));

        let (mut client, server) = connected_pair();
        pending.increment(0);
        tx.send(&server, 9).unwrap();
        drop(server);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert!(wait_for(|| pending.get(0) == 0));

        drop(tx);
        worker.join().unwrap().unwrap();
    }
}
