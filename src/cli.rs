//! CLI definitions for `dnbd-client` (§6, SPEC_FULL §1.4).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "dnbd-client",
    version,
    about = "Client for a distributed, read-only multicast network block device"
)]
pub struct Cli {
    /// Path to an optional TOML config file supplying defaults
    #[clap(long, short, default_value = "dnbd-client.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bind a device to a multicast group and run the client pipeline
    /// until Ctrl-C. There is no kernel block-layer host in this
    /// standalone binary (§1 scopes that out); `--read` ranges drive the
    /// pipeline the way a real host's request queue would.
    Bind {
        /// Device identifier (informational; no kernel device is created)
        #[clap(short = 'd', long = "device")]
        device: String,

        /// Multicast group, optionally `addr:port` (default port 5001)
        #[clap(short = 'b', long = "mcast")]
        mcast: String,

        /// Optional cache file to activate at bind time
        #[clap(short = 'c', long = "cache")]
        cache: Option<PathBuf>,

        /// Demo read ranges as `sector:length_bytes`, repeatable
        #[clap(long = "read", value_name = "SECTOR:LEN")]
        reads: Vec<String>,

        /// Print the final cache/server-table snapshot as JSON instead of
        /// the plain-text dashboard.
        #[clap(long)]
        json: bool,
    },

    /// Unbind a device (§6). This standalone binary has no persistent
    /// daemon/control channel to address (§1 scopes the host's control
    /// surface out) — this is a best-effort no-op, documented in
    /// DESIGN.md.
    Unbind {
        #[clap(short = 'd', long = "device")]
        device: String,
    },

    /// Set or replace the cache file on a running device (§6). Same
    /// limitation as `unbind` — see DESIGN.md.
    SetCache {
        #[clap(short = 'd', long = "device")]
        device: String,
        #[clap(short = 'c', long = "cache")]
        cache: PathBuf,
    },

    /// Print an example dnbd-client.toml to stdout
    Init,

    /// Print cache/server-table counters for a device (SPEC_FULL §1.4,
    /// recovered from `cache.c`'s hit/miss/lru counters and `net.c`'s
    /// `dnbd_show_servers`). Same limitation as `unbind`/`set-cache`: no
    /// persistent daemon in this standalone binary to query across
    /// invocations — `bind` already prints this snapshot on disconnect.
    Stats {
        #[clap(short = 'd', long = "device")]
        device: String,
    },
}

/// Splits `addr[:port]`, defaulting to `dnbd_core::protocol::DEFAULT_PORT`.
pub fn parse_mcast(spec: &str) -> anyhow::Result<(std::net::Ipv4Addr, u16)> {
    if let Some((addr, port)) = spec.split_once(':') {
        Ok((addr.parse()?, port.parse()?))
    } else {
        Ok((spec.parse()?, dnbd_core::protocol::DEFAULT_PORT))
    }
}

/// Parses one `--read sector:len` demo range.
pub fn parse_read_range(spec: &str) -> anyhow::Result<(u64, u32)> {
    let (sector, len) = spec.split_once(':').ok_or_else(|| anyhow::anyhow!("expected SECTOR:LEN, got `{spec}`"))?;
    Ok((sector.parse()?, len.parse()?))
}
