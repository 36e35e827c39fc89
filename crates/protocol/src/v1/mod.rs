pub mod accumulator;
pub mod frame;

use twiiiiiter_util::UnixMicros;

pub use twiiiiiter_util::{MESSAGE_LEN, Text, USERNAME_LEN, Username};

pub use accumulator::{Fill, Flush, FrameAccumulator, FrameQueue};
pub use frame::{ClientCodec, EMPTY_FRAME, FRAME_LEN, Frame};

pub const DEFAULT_PORT: u16 = 7878;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown {direction} tag {tag}")]
    UnknownTag { direction: &'static str, tag: u32 },

    #[error("unknown {field} value {value}")]
    UnknownVariant { field: &'static str, value: u32 },
}

/// Declares a wire enum encoded as a 4-byte big-endian ordinal.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident ($label:literal) { $($variant:ident = $value:literal,)* }) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub const LABEL: &'static str = $label;

            pub fn ordinal(self) -> u32 {
                self as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = DecodeError;

            fn try_from(value: u32) -> Result<Self, DecodeError> {
                match value {
                    $($value => Ok(Self::$variant),)*
                    _ => Err(DecodeError::UnknownVariant { field: $label, value }),
                }
            }
        }
    };
}

wire_enum! {
    /// Outer tag of a client-to-server frame.
    ClientTag ("client tag") {
        JoinAs = 0,
        SubscribeTo = 1,
        UnsubscribeTo = 2,
        ListSubscriptions = 3,
        Publish = 4,
    }
}

wire_enum! {
    /// Outer tag of a server-to-client frame.
    ServerTag ("server tag") {
        LoginStatus = 0,
        ReceivedMessage = 1,
        SubscribeResult = 2,
        SubscriptionEntry = 3,
        Kick = 4,
    }
}

wire_enum! {
    /// Reply to [`ClientMessage::JoinAs`].
    LoginStatus ("login status") {
        Ok = 0,
        AlreadyUsed = 1,
        IllegalName = 2,
    }
}

wire_enum! {
    /// Reply to [`ClientMessage::SubscribeTo`] and [`ClientMessage::UnsubscribeTo`].
    SubscribeResult ("subscribe result") {
        Ok = 0,
        NotFound = 1,
        Unchanged = 2,
    }
}

wire_enum! {
    KickReason ("kick reason") {
        Closing = 0,
        ProtocolError = 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMessage {
    JoinAs(Username),
    SubscribeTo(Username),
    UnsubscribeTo(Username),
    ListSubscriptions,
    Publish(Text),
}

impl ClientMessage {
    pub fn tag(&self) -> ClientTag {
        match self {
            Self::JoinAs(_) => ClientTag::JoinAs,
            Self::SubscribeTo(_) => ClientTag::SubscribeTo,
            Self::UnsubscribeTo(_) => ClientTag::UnsubscribeTo,
            Self::ListSubscriptions => ClientTag::ListSubscriptions,
            Self::Publish(_) => ClientTag::Publish,
        }
    }
}

/// A twiiiiit as delivered to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceivedMessage {
    pub date: UnixMicros,
    pub author: Username,
    pub text: Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMessage {
    LoginStatus(LoginStatus),
    ReceivedMessage(ReceivedMessage),
    SubscribeResult(SubscribeResult),
    /// One followee. The all-zero username terminates a listing.
    SubscriptionEntry(Username),
    Kick(KickReason),
}

impl ServerMessage {
    pub fn tag(&self) -> ServerTag {
        match self {
            Self::LoginStatus(_) => ServerTag::LoginStatus,
            Self::ReceivedMessage(_) => ServerTag::ReceivedMessage,
            Self::SubscribeResult(_) => ServerTag::SubscribeResult,
            Self::SubscriptionEntry(_) => ServerTag::SubscriptionEntry,
            Self::Kick(_) => ServerTag::Kick,
        }
    }

    /// The terminator of a subscription listing.
    pub const END_OF_SUBSCRIPTIONS: Self = Self::SubscriptionEntry(Username::EMPTY);
}
