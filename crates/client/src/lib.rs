use std::collections::VecDeque;
use std::io;

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::Framed;

use twiiiiiter_protocol::v1::{
    ClientCodec, ClientMessage, DecodeError, KickReason, LoginStatus, ReceivedMessage,
    ServerMessage, ServerTag, SubscribeResult, Text, Username,
};
use twiiiiiter_util::FieldTooLong;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed server frame: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Field(#[from] FieldTooLong),

    #[error("kicked by server: {0:?}")]
    Kicked(KickReason),

    #[error("connection closed")]
    ChannelClosed,

    #[error("unexpected {0:?} reply")]
    UnexpectedReply(ServerTag),
}

/// Something the server pushed without being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Message(ReceivedMessage),
    Kicked(KickReason),
}

// ===== Public API ============================================================

/// A connection to a Twiiiiiter server.
///
/// Request methods wait for their reply. Twiiiiits (including the echo of
/// our own publishes) and kicks arrive through [`Client::next_event`].
pub struct Client {
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let framed = Framed::new(stream, ClientCodec);

        let (commands, events) = start_engine(framed);
        Ok(Client { commands, events })
    }

    pub async fn join_as(&self, name: &str) -> Result<LoginStatus, ClientError> {
        let name = Username::try_from(name)?;
        self.request(ClientMessage::JoinAs(name), Waiter::Login)
            .await
    }

    pub async fn subscribe_to(&self, name: &str) -> Result<SubscribeResult, ClientError> {
        let name = Username::try_from(name)?;
        self.request(ClientMessage::SubscribeTo(name), Waiter::Subscribe)
            .await
    }

    pub async fn unsubscribe_from(&self, name: &str) -> Result<SubscribeResult, ClientError> {
        let name = Username::try_from(name)?;
        self.request(ClientMessage::UnsubscribeTo(name), Waiter::Subscribe)
            .await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Username>, ClientError> {
        self.request(ClientMessage::ListSubscriptions, |reply| Waiter::Listing {
            entries: Vec::new(),
            reply,
        })
        .await
    }

    /// Send a twiiiiit. The server echoes it back as a [`ServerEvent::Message`].
    pub async fn publish(&self, text: &str) -> Result<(), ClientError> {
        let text = Text::try_from(text)?;
        self.commands
            .send(Command {
                message: ClientMessage::Publish(text),
                waiter: None,
            })
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Next pushed event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    async fn request<T>(
        &self,
        message: ClientMessage,
        waiter: impl FnOnce(oneshot::Sender<Result<T, ClientError>>) -> Waiter,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command {
                message,
                waiter: Some(waiter(tx)),
            })
            .await
            .map_err(|_| ClientError::ChannelClosed)?;

        rx.await.map_err(|_| ClientError::ChannelClosed)?
    }
}

// ===== Engine =================================================================

#[derive(Debug)]
struct Command {
    message: ClientMessage,
    waiter: Option<Waiter>,
}

/// A request waiting for its reply. The protocol has no request ids, so
/// replies are matched oldest first.
#[derive(Debug)]
enum Waiter {
    Login(oneshot::Sender<Result<LoginStatus, ClientError>>),
    Subscribe(oneshot::Sender<Result<SubscribeResult, ClientError>>),
    Listing {
        entries: Vec<Username>,
        reply: oneshot::Sender<Result<Vec<Username>, ClientError>>,
    },
}

/// Why the engine stopped.
#[derive(Debug, Clone)]
enum Ended {
    Closed,
    Kicked(KickReason),
    Malformed(DecodeError),
}

impl Ended {
    fn error(&self) -> ClientError {
        match self {
            Ended::Closed => ClientError::ChannelClosed,
            Ended::Kicked(reason) => ClientError::Kicked(*reason),
            Ended::Malformed(e) => ClientError::Decode(e.clone()),
        }
    }
}

fn fail_waiter(waiter: Waiter, err: ClientError) {
    match waiter {
        Waiter::Login(tx) => {
            let _ = tx.send(Err(err));
        }
        Waiter::Subscribe(tx) => {
            let _ = tx.send(Err(err));
        }
        Waiter::Listing { reply, .. } => {
            let _ = reply.send(Err(err));
        }
    }
}

fn start_engine(
    mut framed: Framed<TcpStream, ClientCodec>,
) -> (mpsc::Sender<Command>, mpsc::UnboundedReceiver<ServerEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut waiters: VecDeque<Waiter> = VecDeque::new();

        let ended = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    // Client dropped
                    let Some(Command { message, waiter }) = cmd else {
                        break Ended::Closed;
                    };
                    if let Some(waiter) = waiter {
                        waiters.push_back(waiter);
                    }
                    if let Err(e) = framed.send(message).await {
                        tracing::debug!(error = %e, "send failed");
                        break Ended::Closed;
                    }
                }
                frame = framed.next() => match frame {
                    Some(Ok(ServerMessage::ReceivedMessage(msg))) => {
                        let _ = event_tx.send(ServerEvent::Message(msg));
                    }
                    Some(Ok(ServerMessage::Kick(reason))) => {
                        tracing::info!(?reason, "kicked by server");
                        let _ = event_tx.send(ServerEvent::Kicked(reason));
                        break Ended::Kicked(reason);
                    }
                    Some(Ok(reply)) => on_reply(&mut waiters, reply),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "bad frame from server");
                        let decode = e
                            .get_ref()
                            .and_then(|inner| inner.downcast_ref::<DecodeError>())
                            .cloned();
                        break match decode {
                            Some(d) => Ended::Malformed(d),
                            None => Ended::Closed,
                        };
                    }
                    None => break Ended::Closed,
                },
            }
        };

        for waiter in waiters.drain(..) {
            fail_waiter(waiter, ended.error());
        }
    });

    (cmd_tx, event_rx)
}

fn on_reply(waiters: &mut VecDeque<Waiter>, reply: ServerMessage) {
    match (waiters.pop_front(), reply) {
        (Some(Waiter::Login(tx)), ServerMessage::LoginStatus(status)) => {
            let _ = tx.send(Ok(status));
        }
        (Some(Waiter::Subscribe(tx)), ServerMessage::SubscribeResult(result)) => {
            let _ = tx.send(Ok(result));
        }
        (Some(Waiter::Listing { entries, reply }), ServerMessage::SubscriptionEntry(name))
            if name.is_empty() =>
        {
            let _ = reply.send(Ok(entries));
        }
        (Some(Waiter::Listing { mut entries, reply }), ServerMessage::SubscriptionEntry(name)) => {
            entries.push(name);
            waiters.push_front(Waiter::Listing { entries, reply });
        }
        (Some(waiter), other) => {
            tracing::error!(tag = ?other.tag(), "reply does not match oldest request");
            fail_waiter(waiter, ClientError::UnexpectedReply(other.tag()));
        }
        (None, other) => {
            tracing::error!(tag = ?other.tag(), "reply without a pending request");
        }
    }
}
