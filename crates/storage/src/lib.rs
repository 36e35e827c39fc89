pub mod observable_storage;
pub mod sqlite_store;

use twiiiiiter_util::{FieldTooLong, Text, UnixMicros, Username};

pub use sqlite_store::SqliteStorage;

/// A published twiiiiit, as recorded in the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Twiiiiit {
    pub date: UnixMicros,
    pub author: Username,
    pub text: Text,
}

/// Result of a follow/unfollow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    /// The relation was created (follow) or removed (unfollow).
    Ok,
    /// The target does not exist, or is the requester themselves.
    NotFound,
    /// The relation already existed (follow) or was already absent (unfollow).
    Unchanged,
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<FieldTooLong> for StorageError {
    fn from(e: FieldTooLong) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

pub fn make_sqlite_store(location: &str) -> Result<SqliteStorage, StorageError> {
    SqliteStorage::open(location)
}

/// Durable record of users, follow relations and twiiiiits.
///
/// Calls are synchronous: the reactor invokes them on its own thread, so an
/// implementation must be local and fast.
pub trait Storage: Send + std::fmt::Debug {
    /// Stamp the user's presence with the current time, creating the user if
    /// needed. Returns the recorded timestamp.
    fn record_presence(&self, user: &Username, online: bool) -> Result<UnixMicros, StorageError>;

    /// Make `follower` follow `followee`.
    fn follow(&self, follower: &Username, followee: &Username)
    -> Result<FollowOutcome, StorageError>;

    /// Remove the `follower` -> `followee` relation.
    fn unfollow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError>;

    /// Users followed by `user`, in insertion order.
    fn list_followees(&self, user: &Username) -> Result<Vec<Username>, StorageError>;

    /// Users following `user`, in insertion order.
    fn list_followers(&self, user: &Username) -> Result<Vec<Username>, StorageError>;

    /// Append a twiiiiit to the log. The timestamp is assigned here.
    fn save_message(&self, author: &Username, text: &Text) -> Result<Twiiiiit, StorageError>;

    /// Twiiiiits from `user`'s followees published at or after `user`'s last
    /// recorded presence, oldest first.
    fn list_missed_messages(&self, user: &Username) -> Result<Vec<Twiiiiit>, StorageError>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn record_presence(&self, user: &Username, online: bool) -> Result<UnixMicros, StorageError> {
        (**self).record_presence(user, online)
    }

    fn follow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError> {
        (**self).follow(follower, followee)
    }

    fn unfollow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError> {
        (**self).unfollow(follower, followee)
    }

    fn list_followees(&self, user: &Username) -> Result<Vec<Username>, StorageError> {
        (**self).list_followees(user)
    }

    fn list_followers(&self, user: &Username) -> Result<Vec<Username>, StorageError> {
        (**self).list_followers(user)
    }

    fn save_message(&self, author: &Username, text: &Text) -> Result<Twiiiiit, StorageError> {
        (**self).save_message(author, text)
    }

    fn list_missed_messages(&self, user: &Username) -> Result<Vec<Twiiiiit>, StorageError> {
        (**self).list_missed_messages(user)
    }
}
