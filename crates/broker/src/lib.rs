mod connection;
pub mod reactor;
pub mod sessions;

use twiiiiiter_protocol::v1::{
    ClientMessage, KickReason, LoginStatus, ReceivedMessage, ServerMessage, SubscribeResult, Text,
    Username,
};
use twiiiiiter_storage::{FollowOutcome, Storage, StorageError, Twiiiiit};

pub use reactor::{MalformedFramePolicy, Server, ServerConfig, ServerError, ShutdownHandle};
pub use sessions::{BindError, ConnId, SessionTable};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What happens to the sending connection once its message is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Kick(KickReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnId,
    pub message: ServerMessage,
}

/// Frames produced while handling one message, in emission order.
#[derive(Debug, Default)]
pub struct Outbox {
    deliveries: Vec<Delivery>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, to: ConnId, message: ServerMessage) {
        self.deliveries.push(Delivery { to, message });
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Delivery> {
        self.deliveries.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// Messages addressed to `conn`, in order.
    pub fn to(&self, conn: ConnId) -> impl Iterator<Item = &ServerMessage> + '_ {
        self.deliveries
            .iter()
            .filter(move |d| d.to == conn)
            .map(|d| &d.message)
    }
}

fn subscribe_result(outcome: FollowOutcome) -> SubscribeResult {
    match outcome {
        FollowOutcome::Ok => SubscribeResult::Ok,
        FollowOutcome::NotFound => SubscribeResult::NotFound,
        FollowOutcome::Unchanged => SubscribeResult::Unchanged,
    }
}

fn received(twiiiiit: Twiiiiit) -> ServerMessage {
    ServerMessage::ReceivedMessage(ReceivedMessage {
        date: twiiiiit.date,
        author: twiiiiit.author,
        text: twiiiiit.text,
    })
}

/// Interprets client messages against the session table and storage.
///
/// The router never touches sockets: it appends the frames to send to an
/// [`Outbox`] and tells the caller whether the sender must be kicked.
#[derive(Debug)]
pub struct Router<S> {
    storage: S,
}

impl<S: Storage> Router<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn dispatch(
        &self,
        sessions: &mut SessionTable,
        from: ConnId,
        message: ClientMessage,
        outbox: &mut Outbox,
    ) -> Result<Verdict, BrokerError> {
        match (message, sessions.username(from)) {
            (ClientMessage::JoinAs(name), _) => {
                return self.join_as(sessions, from, name, outbox);
            }
            (other, None) => {
                tracing::warn!(conn = %from, tag = ?other.tag(), "message before JoinAs");
                return Ok(Verdict::Kick(KickReason::ProtocolError));
            }
            (ClientMessage::SubscribeTo(target), Some(user)) => {
                let result = self.storage.follow(&user, &target)?;
                tracing::debug!(%user, %target, ?result, "subscribe");
                outbox.push(from, ServerMessage::SubscribeResult(subscribe_result(result)));
            }
            (ClientMessage::UnsubscribeTo(target), Some(user)) => {
                let result = self.storage.unfollow(&user, &target)?;
                tracing::debug!(%user, %target, ?result, "unsubscribe");
                outbox.push(from, ServerMessage::SubscribeResult(subscribe_result(result)));
            }
            (ClientMessage::ListSubscriptions, Some(user)) => {
                for followee in self.storage.list_followees(&user)? {
                    outbox.push(from, ServerMessage::SubscriptionEntry(followee));
                }
                outbox.push(from, ServerMessage::END_OF_SUBSCRIPTIONS);
            }
            (ClientMessage::Publish(text), Some(user)) => {
                self.publish(sessions, from, user, text, outbox)?
            }
        }

        Ok(Verdict::Continue)
    }

    fn join_as(
        &self,
        sessions: &mut SessionTable,
        from: ConnId,
        name: Username,
        outbox: &mut Outbox,
    ) -> Result<Verdict, BrokerError> {
        if let Some(current) = sessions.username(from) {
            tracing::warn!(conn = %from, %current, requested = %name, "rename attempt");
            return Ok(Verdict::Kick(KickReason::ProtocolError));
        }

        if name.is_empty() {
            outbox.push(from, ServerMessage::LoginStatus(LoginStatus::IllegalName));
            return Ok(Verdict::Continue);
        }

        match sessions.bind(from, name) {
            Ok(()) => {}
            Err(BindError::NameInUse(owner)) => {
                tracing::info!(conn = %from, %name, %owner, "username already in use");
                outbox.push(from, ServerMessage::LoginStatus(LoginStatus::AlreadyUsed));
                return Ok(Verdict::Continue);
            }
            Err(e) => {
                tracing::error!(conn = %from, %name, error = %e, "cannot bind session");
                return Ok(Verdict::Kick(KickReason::ProtocolError));
            }
        }

        tracing::info!(conn = %from, user = %name, "joined");
        outbox.push(from, ServerMessage::LoginStatus(LoginStatus::Ok));

        // Catch-up reads the previous presence stamp, so it must run before
        // the online stamp overwrites it.
        let missed = self.storage.list_missed_messages(&name)?;
        tracing::debug!(user = %name, missed = missed.len(), "catch-up");
        for twiiiiit in missed {
            outbox.push(from, received(twiiiiit));
        }

        self.storage.record_presence(&name, true)?;
        Ok(Verdict::Continue)
    }

    fn publish(
        &self,
        sessions: &SessionTable,
        from: ConnId,
        author: Username,
        text: Text,
        outbox: &mut Outbox,
    ) -> Result<(), BrokerError> {
        let twiiiiit = self.storage.save_message(&author, &text)?;
        let message = received(twiiiiit);

        outbox.push(from, message);

        let mut live = 0usize;
        for follower in self.storage.list_followers(&author)? {
            // Offline followers get it from catch-up on their next JoinAs.
            if let Some(conn) = sessions.lookup(&follower)
                && conn != from
            {
                outbox.push(conn, message);
                live += 1;
            }
        }

        tracing::debug!(%author, live, "published");
        Ok(())
    }

    /// Forget `conn` and, if it was authenticated, stamp its user offline.
    /// Returns the username that was released.
    pub fn disconnect(
        &self,
        sessions: &mut SessionTable,
        conn: ConnId,
    ) -> Result<Option<Username>, BrokerError> {
        let Some(user) = sessions.remove(conn) else {
            return Ok(None);
        };

        self.storage.record_presence(&user, false)?;
        tracing::info!(conn = %conn, %user, "left");
        Ok(Some(user))
    }

    /// Stamp every authenticated user offline and empty the table. Failures
    /// are logged and do not stop the remaining users from being released.
    pub fn shutdown(&self, sessions: &mut SessionTable) -> usize {
        let conns: Vec<ConnId> = sessions.authenticated().map(|(conn, _)| conn).collect();
        let mut released = 0;

        for conn in conns {
            match self.disconnect(sessions, conn) {
                Ok(Some(_)) => released += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(conn = %conn, error = %e, "failed to record offline"),
            }
        }

        *sessions = SessionTable::new();
        released
    }
}
