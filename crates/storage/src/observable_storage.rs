use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use twiiiiiter_util::{Text, UnixMicros, Username};

use crate::{FollowOutcome, Storage, StorageError, Twiiiiit};

/// Calls slower than this are reported, since every storage call stalls the
/// reactor thread for its whole duration.
pub const DEFAULT_SLOW_CALL: Duration = Duration::from_millis(20);

macro_rules! observe {
    ($self:ident, $field:ident, $call:expr) => {{
        let started = Instant::now();
        let res = $call;
        let elapsed = started.elapsed();
        $self.stats.$field.record(elapsed, res.is_err());
        if elapsed >= $self.slow_call {
            tracing::warn!(
                op = stringify!($field),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow storage call blocked the reactor"
            );
        }
        res
    }};
}

#[derive(Debug, Default)]
pub struct OpStats {
    pub calls: AtomicU64,
    pub errors: AtomicU64,
    pub total_micros: AtomicU64,
    pub max_micros: AtomicU64,
}

impl OpStats {
    fn record(&self, elapsed: Duration, failed: bool) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn mean_micros(&self) -> u64 {
        let calls = self.calls();
        if calls == 0 {
            0
        } else {
            self.total_micros.load(Ordering::Relaxed) / calls
        }
    }
}

#[derive(Debug, Default)]
pub struct StorageStats {
    pub presence: OpStats,
    pub follows: OpStats,
    pub listings: OpStats,
    pub writes: OpStats,
    pub catch_ups: OpStats,
}

impl StorageStats {
    pub fn log_summary(&self) {
        for (op, stats) in [
            ("presence", &self.presence),
            ("follows", &self.follows),
            ("listings", &self.listings),
            ("writes", &self.writes),
            ("catch_ups", &self.catch_ups),
        ] {
            tracing::info!(
                op,
                calls = stats.calls(),
                errors = stats.errors(),
                mean_us = stats.mean_micros(),
                max_us = stats.max_micros.load(Ordering::Relaxed),
                "storage stats"
            );
        }
    }
}

/// Wraps a [`Storage`] and records per-operation call counts, failures and
/// latency.
#[derive(Debug)]
pub struct ObservableStorage<S> {
    inner: S,
    stats: Arc<StorageStats>,
    slow_call: Duration,
}

impl<S> ObservableStorage<S> {
    pub fn new(inner: S, stats: Arc<StorageStats>) -> Self {
        Self {
            inner,
            stats,
            slow_call: DEFAULT_SLOW_CALL,
        }
    }

    pub fn with_slow_call(self, slow_call: Duration) -> Self {
        Self { slow_call, ..self }
    }

    #[inline(always)]
    fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stats(&self) -> Arc<StorageStats> {
        Arc::clone(&self.stats)
    }
}

impl<S: Storage> Storage for ObservableStorage<S> {
    fn record_presence(&self, user: &Username, online: bool) -> Result<UnixMicros, StorageError> {
        observe!(self, presence, self.inner().record_presence(user, online))
    }

    fn follow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError> {
        observe!(self, follows, self.inner().follow(follower, followee))
    }

    fn unfollow(
        &self,
        follower: &Username,
        followee: &Username,
    ) -> Result<FollowOutcome, StorageError> {
        observe!(self, follows, self.inner().unfollow(follower, followee))
    }

    fn list_followees(&self, user: &Username) -> Result<Vec<Username>, StorageError> {
        observe!(self, listings, self.inner().list_followees(user))
    }

    fn list_followers(&self, user: &Username) -> Result<Vec<Username>, StorageError> {
        observe!(self, listings, self.inner().list_followers(user))
    }

    fn save_message(&self, author: &Username, text: &Text) -> Result<Twiiiiit, StorageError> {
        observe!(self, writes, self.inner().save_message(author, text))
    }

    fn list_missed_messages(&self, user: &Username) -> Result<Vec<Twiiiiit>, StorageError> {
        observe!(self, catch_ups, self.inner().list_missed_messages(user))
    }
}
