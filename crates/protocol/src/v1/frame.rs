//! Fixed-width frame codec.
//!
//! Every frame, in either direction, is exactly [`FRAME_LEN`] bytes:
//!
//! ```text
//! +------------------+
//! | tag (4 bytes)    |  u32 big-endian
//! +------------------+
//! | payload          |  tag-specific fixed layout
//! +------------------+
//! | zero padding     |  up to FRAME_LEN
//! +------------------+
//! ```
//!
//! Payload layouts:
//! - JoinAs / SubscribeTo / UnsubscribeTo / SubscriptionEntry: username (6)
//! - Publish: text (20)
//! - ListSubscriptions: empty
//! - LoginStatus / SubscribeResult / Kick: u32 big-endian ordinal
//! - ReceivedMessage: i64 big-endian date (8), author (6), text (20)
//!
//! Decoding validates the outer tag and any inner ordinal, and never
//! constructs a message from an out-of-range value.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use twiiiiiter_util::FixedStr;

use super::{
    ClientMessage, ClientTag, DecodeError, KickReason, LoginStatus, ReceivedMessage,
    ServerMessage, ServerTag, SubscribeResult,
};

pub const FRAME_LEN: usize = 48;

pub type Frame = [u8; FRAME_LEN];

pub const EMPTY_FRAME: Frame = [0; FRAME_LEN];

fn get_fixed<const N: usize>(buf: &mut &[u8]) -> FixedStr<N> {
    let mut raw = [0u8; N];
    buf.copy_to_slice(&mut raw);
    FixedStr::from_padded(&raw)
}

fn get_ordinal<T: TryFrom<u32, Error = DecodeError>>(buf: &mut &[u8]) -> Result<T, DecodeError> {
    T::try_from(buf.get_u32())
}

impl ClientMessage {
    pub fn encode(&self) -> Frame {
        let mut frame = EMPTY_FRAME;
        let mut buf = &mut frame[..];
        buf.put_u32(self.tag().ordinal());

        match self {
            Self::JoinAs(name) | Self::SubscribeTo(name) | Self::UnsubscribeTo(name) => {
                buf.put_slice(name.padded())
            }
            Self::ListSubscriptions => {}
            Self::Publish(text) => buf.put_slice(text.padded()),
        }

        frame
    }

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = &frame[..];
        let tag = buf.get_u32();
        let tag = ClientTag::try_from(tag).map_err(|_| DecodeError::UnknownTag {
            direction: "client",
            tag,
        })?;

        Ok(match tag {
            ClientTag::JoinAs => Self::JoinAs(get_fixed(&mut buf)),
            ClientTag::SubscribeTo => Self::SubscribeTo(get_fixed(&mut buf)),
            ClientTag::UnsubscribeTo => Self::UnsubscribeTo(get_fixed(&mut buf)),
            ClientTag::ListSubscriptions => Self::ListSubscriptions,
            ClientTag::Publish => Self::Publish(get_fixed(&mut buf)),
        })
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Frame {
        let mut frame = EMPTY_FRAME;
        let mut buf = &mut frame[..];
        buf.put_u32(self.tag().ordinal());

        match self {
            Self::LoginStatus(status) => buf.put_u32(status.ordinal()),
            Self::ReceivedMessage(msg) => {
                buf.put_i64(msg.date);
                buf.put_slice(msg.author.padded());
                buf.put_slice(msg.text.padded());
            }
            Self::SubscribeResult(result) => buf.put_u32(result.ordinal()),
            Self::SubscriptionEntry(name) => buf.put_slice(name.padded()),
            Self::Kick(reason) => buf.put_u32(reason.ordinal()),
        }

        frame
    }

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = &frame[..];
        let tag = buf.get_u32();
        let tag = ServerTag::try_from(tag).map_err(|_| DecodeError::UnknownTag {
            direction: "server",
            tag,
        })?;

        Ok(match tag {
            ServerTag::LoginStatus => Self::LoginStatus(get_ordinal::<LoginStatus>(&mut buf)?),
            ServerTag::ReceivedMessage => Self::ReceivedMessage(ReceivedMessage {
                date: buf.get_i64(),
                author: get_fixed(&mut buf),
                text: get_fixed(&mut buf),
            }),
            ServerTag::SubscribeResult => {
                Self::SubscribeResult(get_ordinal::<SubscribeResult>(&mut buf)?)
            }
            ServerTag::SubscriptionEntry => Self::SubscriptionEntry(get_fixed(&mut buf)),
            ServerTag::Kick => Self::Kick(get_ordinal::<KickReason>(&mut buf)?),
        })
    }
}

/// Client side of the protocol for `tokio_util::codec::Framed`: encodes
/// [`ClientMessage`]s and decodes [`ServerMessage`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = ServerMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>, io::Error> {
        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }

        let mut frame = EMPTY_FRAME;
        src.copy_to_slice(&mut frame);

        ServerMessage::decode(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<ClientMessage> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(FRAME_LEN);
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}
