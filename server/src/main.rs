//! `dnbd-server` — replica server for a distributed, read-only multicast
//! network block device. Serves a single backing file read-only to a
//! client pipeline reachable over the configured multicast group.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;
use dnbd_core::server::{ServerHandler, DEFAULT_MAX_QUERIES, MAX_BLOCK_SIZE};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    if cli.id == 0 || cli.id as usize > dnbd_core::server_table::SERVERS_MAX {
        anyhow::bail!("server id must be in 1..={}", dnbd_core::server_table::SERVERS_MAX);
    }

    let (group, port) = cli.group_and_port().context("invalid multicast address")?;
    tracing::info!(device = %cli.device.display(), id = cli.id, %group, port, threads = cli.threads, "starting dnbd-server");

    let mut handler = ServerHandler::new(&cli.device, cli.id, group, port, MAX_BLOCK_SIZE, DEFAULT_MAX_QUERIES)
        .context("failed to initialise server handler")?;
    handler.run(cli.threads).context("failed to start worker threads")?;

    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!("shutdown signal received, tearing down");
    handler.shutdown();
    handler.join();
    Ok(())
}
