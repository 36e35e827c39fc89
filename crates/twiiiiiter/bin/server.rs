use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use twiiiiiter_broker::{MalformedFramePolicy, Router, Server, ServerConfig};
use twiiiiiter_protocol::v1::DEFAULT_PORT;
use twiiiiiter_storage::{
    make_sqlite_store,
    observable_storage::{ObservableStorage, StorageStats},
};
use twiiiiiter_util::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Twiiiiiter broadcast server")]
struct Args {
    /// TCP port to listen on; 0 picks a free one.
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database file, or `:memory:`.
    #[arg(long, env = "TWIIIIITER_DATABASE_FILE", default_value = "twiiiiiter.sqlite")]
    database: String,

    /// Evict connections that stay silent this long.
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    #[arg(long, default_value_t = ServerConfig::default().max_pending_frames)]
    max_pending_frames: usize,

    /// Kick clients that send undecodable frames instead of ignoring them.
    #[arg(long)]
    kick_malformed: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let stats = Arc::new(StorageStats::default());
    let storage = make_sqlite_store(&args.database)
        .with_context(|| format!("opening database {}", args.database))?;
    let storage = ObservableStorage::new(storage, stats.clone());

    let config = ServerConfig::default()
        .with_max_pending_frames(args.max_pending_frames)
        .with_idle_timeout(args.idle_timeout_secs.map(Duration::from_secs))
        .with_malformed_frames(if args.kick_malformed {
            MalformedFramePolicy::Kick
        } else {
            MalformedFramePolicy::Drop
        });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let server = Server::bind(addr, Router::new(storage), config)
        .with_context(|| format!("binding port {}", args.port))?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("signal received");
        handle.shutdown();
    })
    .context("installing signal handler")?;

    tracing::info!("Listening on *:{}", server.local_addr().port());
    server.run()?;

    stats.log_summary();
    Ok(())
}
