use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::Interest;
use mio::net::TcpStream;
use twiiiiiter_protocol::v1::{Fill, Flush, Frame, FrameAccumulator, FrameQueue, ServerMessage};

use crate::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// The socket would block; keep the connection.
    Open,
    /// The peer closed its side or the read failed.
    Closed,
}

/// One accepted socket with its inbound and outbound frame state.
#[derive(Debug)]
pub(crate) struct Connection {
    pub id: ConnId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    inbound: FrameAccumulator,
    outbound: FrameQueue,
    interest: Interest,
    /// Queued frames that answer this connection's own requests. They do not
    /// count against the slow-reader limit.
    replies: usize,
    /// Set once a Kick is queued: nothing more is read, and the connection is
    /// evicted as soon as the queue drains or the close grace runs out.
    closing_since: Option<Instant>,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(id: ConnId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            inbound: FrameAccumulator::new(),
            outbound: FrameQueue::new(),
            interest: Interest::READABLE,
            replies: 0,
            closing_since: None,
            last_activity: Instant::now(),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing_since.is_some()
    }

    /// Stop reading; the connection only drains its queue from now on.
    pub fn begin_closing(&mut self) {
        if self.closing_since.is_none() {
            self.closing_since = Some(Instant::now());
        }
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    pub fn enqueue(&mut self, message: &ServerMessage) {
        self.outbound.push(message.encode());
    }

    /// Everything queued so far answers this connection's own request.
    pub fn mark_replies_queued(&mut self) {
        self.replies = self.outbound.len();
    }

    /// Whether frames pushed by other users exceed `limit`. Replies are
    /// written first, so whatever has drained is taken from them.
    pub fn over_limit(&mut self, limit: usize) -> bool {
        self.replies = self.replies.min(self.outbound.len());
        self.outbound.len() - self.replies > limit
    }

    /// Whether the sweep should drop this connection: a closing peer that
    /// has not drained within `close_grace`, or an open one silent for
    /// `idle`.
    pub fn is_stale(&self, now: Instant, idle: Option<Duration>, close_grace: Duration) -> bool {
        match (self.closing_since, idle) {
            (Some(since), _) => now.saturating_duration_since(since) >= close_grace,
            (None, Some(idle)) => now.saturating_duration_since(self.last_activity) >= idle,
            (None, None) => false,
        }
    }

    /// Read every frame currently available into `frames`, in arrival
    /// order. A trailing partial frame stays buffered for the next readiness
    /// event.
    pub fn read_frames(&mut self, frames: &mut Vec<Frame>) -> ReadOutcome {
        loop {
            match self.inbound.read_from(&mut self.stream) {
                Ok(Fill::Eof) => return ReadOutcome::Closed,
                Ok(Fill::Partial { .. }) => self.last_activity = Instant::now(),
                Ok(Fill::Complete(frame)) => {
                    self.last_activity = Instant::now();
                    frames.push(frame);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(conn = %self.id, peer = %self.peer, error = %e, "read failed");
                    return ReadOutcome::Closed;
                }
            }
        }
    }

    /// Write queued frames until drained or the socket blocks.
    pub fn flush(&mut self) -> io::Result<Flush> {
        self.outbound.write_to(&mut self.stream)
    }

    /// The interest this connection needs given its queue state.
    pub fn wanted_interest(&self) -> Interest {
        match (self.is_closing(), self.outbound.is_empty()) {
            (false, true) => Interest::READABLE,
            (false, false) => Interest::READABLE | Interest::WRITABLE,
            (true, _) => Interest::WRITABLE,
        }
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }
}
