pub mod fixed;

use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub use fixed::{FieldTooLong, FixedStr, MESSAGE_LEN, Text, USERNAME_LEN, Username};

/// Microseconds since UNIX epoch
pub type UnixMicros = i64;

pub fn unix_micros() -> UnixMicros {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros().min(i64::MAX as u128) as i64,
        Err(_) => 0, // clock went backwards; clamp
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true),
        )
        .init();
}
