//! Single-threaded readiness loop.
//!
//! One `mio::Poll` owns the listener, a shutdown [`Waker`] and every client
//! socket. All session state is touched from this thread only.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use twiiiiiter_protocol::v1::{ClientMessage, Flush, Frame, KickReason, ServerMessage};
use twiiiiiter_storage::Storage;

use crate::connection::{Connection, ReadOutcome};
use crate::{ConnId, Outbox, Router, SessionTable, Verdict};

const LISTENER: Token = Token(0);
const SHUTDOWN: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// Longest the loop sleeps between idle sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with a frame whose tag or payload does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedFramePolicy {
    /// Log it and keep the connection.
    #[default]
    Drop,
    /// Send `Kick(ProtocolError)` and evict.
    Kick,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Outbound frames a connection may have queued before it is evicted as
    /// a slow reader.
    pub max_pending_frames: usize,
    /// Evict connections that send nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// How long a kicked connection may take to read its Kick.
    pub close_grace: Duration,
    pub malformed_frames: MalformedFramePolicy,
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_pending_frames: 1024,
            idle_timeout: None,
            close_grace: Duration::from_secs(5),
            malformed_frames: MalformedFramePolicy::Drop,
            events_capacity: 128,
        }
    }
}

impl ServerConfig {
    pub fn with_max_pending_frames(self, max_pending_frames: usize) -> Self {
        Self {
            max_pending_frames,
            ..self
        }
    }

    pub fn with_idle_timeout(self, idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    pub fn with_close_grace(self, close_grace: Duration) -> Self {
        Self {
            close_grace,
            ..self
        }
    }

    pub fn with_malformed_frames(self, malformed_frames: MalformedFramePolicy) -> Self {
        Self {
            malformed_frames,
            ..self
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Asks a running [`Server`] to stop. Cloneable and usable from any thread
/// or signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "failed to wake reactor for shutdown");
        }
    }
}

pub struct Server<S> {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    router: Router<S>,
    sessions: SessionTable,
    connections: HashMap<ConnId, Connection>,
    next_id: usize,
    config: ServerConfig,
    outbox: Outbox,
    frames: Vec<Frame>,
}

impl<S: Storage> Server<S> {
    pub fn bind(
        addr: SocketAddr,
        router: Router<S>,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), SHUTDOWN)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            poll,
            listener,
            local_addr,
            shutdown: ShutdownHandle {
                waker: Arc::new(waker),
            },
            router,
            sessions: SessionTable::new(),
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION,
            config,
            outbox: Outbox::new(),
            frames: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn router(&self) -> &Router<S> {
        &self.router
    }

    /// Serve until a [`ShutdownHandle`] fires.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.config.events_capacity);
        let sweep = self
            .config
            .idle_timeout
            .unwrap_or(MAX_SWEEP_INTERVAL)
            .min(self.config.close_grace)
            .min(MAX_SWEEP_INTERVAL);

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(sweep)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let mut stopping = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    SHUTDOWN => stopping = true,
                    Token(raw) => {
                        let id = ConnId(raw);
                        if event.is_writable() {
                            self.flush(id);
                        }
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.read_ready(id);
                        }
                    }
                }
            }

            if stopping {
                self.stop();
                return Ok(());
            }

            self.evict_stale();
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = ConnId(self.next_id);
                    self.next_id += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(id.0), Interest::READABLE)
                    {
                        tracing::warn!(conn = %id, %peer, error = %e, "failed to register connection");
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(conn = %id, error = %e, "set_nodelay failed");
                    }

                    self.sessions.insert(id);
                    self.connections.insert(id, Connection::new(id, stream, peer));
                    tracing::debug!(conn = %id, %peer, "accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn is_open(&self, id: ConnId) -> bool {
        self.connections.get(&id).is_some_and(|conn| !conn.is_closing())
    }

    fn read_ready(&mut self, id: ConnId) {
        let mut frames = std::mem::take(&mut self.frames);

        let outcome = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_closing() => conn.read_frames(&mut frames),
            _ => ReadOutcome::Open,
        };

        for frame in frames.drain(..) {
            if !self.is_open(id) {
                break;
            }
            self.on_frame(id, &frame);
        }
        self.frames = frames;

        if outcome == ReadOutcome::Closed {
            self.evict(id, "peer closed");
        }
    }

    fn on_frame(&mut self, id: ConnId, frame: &Frame) {
        let message = match ClientMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(conn = %id, error = %e, policy = ?self.config.malformed_frames, "malformed frame");
                if self.config.malformed_frames == MalformedFramePolicy::Kick {
                    self.kick(id, KickReason::ProtocolError);
                }
                return;
            }
        };

        let verdict = self
            .router
            .dispatch(&mut self.sessions, id, message, &mut self.outbox);
        self.deliver_outbox(id);

        match verdict {
            Ok(Verdict::Continue) => {}
            Ok(Verdict::Kick(reason)) => self.kick(id, reason),
            Err(e) => {
                tracing::error!(conn = %id, error = %e, "request failed");
                self.kick(id, KickReason::Closing);
            }
        }
    }

    /// Queue everything the router produced for a request from `from`, then
    /// write it out. Replies to `from` are never capped; other recipients
    /// that cannot keep up are evicted as slow readers.
    fn deliver_outbox(&mut self, from: ConnId) {
        let mut touched: Vec<ConnId> = Vec::new();
        let mut overflowing: Vec<ConnId> = Vec::new();
        let limit = self.config.max_pending_frames;

        for delivery in self.outbox.drain() {
            let Some(conn) = self.connections.get_mut(&delivery.to) else {
                continue;
            };
            if conn.is_closing() || overflowing.contains(&delivery.to) {
                continue;
            }

            conn.enqueue(&delivery.message);
            if !touched.contains(&delivery.to) {
                touched.push(delivery.to);
            }

            // Only frames the socket refused count toward the limit.
            if delivery.to != from && conn.over_limit(limit) {
                let refused = match conn.flush() {
                    Ok(_) => conn.over_limit(limit),
                    Err(_) => true,
                };
                if refused {
                    overflowing.push(delivery.to);
                }
            }
        }

        if let Some(conn) = self.connections.get_mut(&from) {
            conn.mark_replies_queued();
        }

        for id in overflowing {
            tracing::warn!(conn = %id, limit, "slow reader");
            self.evict(id, "outbound queue full");
        }
        for id in touched {
            self.flush(id);
        }
    }

    fn flush(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let closing = conn.is_closing();

        match conn.flush() {
            Ok(Flush::Drained) if closing => self.evict(id, "kicked"),
            Ok(_) => self.update_interest(id),
            Err(e) => {
                tracing::debug!(conn = %id, error = %e, "write failed");
                self.evict(id, "write failed");
            }
        }
    }

    fn update_interest(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let wanted = conn.wanted_interest();
        if wanted == conn.interest() {
            return;
        }

        let res = self
            .poll
            .registry()
            .reregister(&mut conn.stream, Token(id.0), wanted);
        match res {
            Ok(()) => conn.set_interest(wanted),
            Err(e) => {
                tracing::warn!(conn = %id, error = %e, "reregister failed");
                self.evict(id, "reregister failed");
            }
        }
    }

    /// Queue a Kick, release the session and stop reading. The socket is
    /// closed once the queue drains.
    fn kick(&mut self, id: ConnId, reason: KickReason) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_closing() {
            return;
        }

        conn.enqueue(&ServerMessage::Kick(reason));
        conn.begin_closing();
        tracing::info!(conn = %id, peer = %conn.peer, ?reason, "kicking");

        if let Err(e) = self.router.disconnect(&mut self.sessions, id) {
            tracing::error!(conn = %id, error = %e, "failed to record offline");
        }
        self.flush(id);
    }

    fn evict(&mut self, id: ConnId, why: &'static str) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            tracing::debug!(conn = %id, error = %e, "deregister failed");
        }
        if let Err(e) = self.router.disconnect(&mut self.sessions, id) {
            tracing::error!(conn = %id, error = %e, "failed to record offline");
        }
        tracing::debug!(conn = %id, peer = %conn.peer, why, "connection closed");
    }

    fn evict_stale(&mut self) {
        let now = Instant::now();
        let idle = self.config.idle_timeout;
        let grace = self.config.close_grace;
        let stale: Vec<(ConnId, bool)> = self
            .connections
            .values()
            .filter(|conn| conn.is_stale(now, idle, grace))
            .map(|conn| (conn.id, conn.is_closing()))
            .collect();

        for (id, closing) in stale {
            if closing {
                tracing::info!(conn = %id, "kicked peer did not drain");
                self.evict(id, "close grace expired");
            } else {
                tracing::info!(conn = %id, "idle timeout");
                self.evict(id, "idle");
            }
        }
    }

    fn stop(&mut self) {
        tracing::info!(connections = self.connections.len(), "shutting down");

        for conn in self.connections.values_mut() {
            if !conn.is_closing() {
                conn.enqueue(&ServerMessage::Kick(KickReason::Closing));
                conn.begin_closing();
            }
            // Best effort: whatever does not fit in the socket buffer is lost.
            if let Ok(Flush::Blocked) = conn.flush() {
                tracing::debug!(conn = %conn.id, pending = conn.pending(), "closing with unsent frames");
            }
        }

        let released = self.router.shutdown(&mut self.sessions);
        tracing::info!(released, "recorded users offline");

        for (_, mut conn) in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}
