//! CLI definitions for `dnbd-server` (§6): `-m <mcast> -d <backing path>
//! -i <id 1..8> -t <workers>`.

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "dnbd-server",
    version,
    about = "Replica server for a distributed, read-only multicast network block device"
)]
pub struct Cli {
    /// Multicast group address (and optional :port, default 5001)
    #[clap(short = 'm', long = "mcast")]
    pub mcast: String,

    /// Backing file served read-only as the device image
    #[clap(short = 'd', long = "device")]
    pub device: PathBuf,

    /// This server's id, 1..8
    #[clap(short = 'i', long = "id")]
    pub id: u16,

    /// Worker thread count
    #[clap(short = 't', long = "threads", default_value_t = dnbd_core::server::DEFAULT_WORKERS)]
    pub threads: usize,
}

impl Cli {
    /// Splits `-m` into group address and port, defaulting the port to
    /// `dnbd_core::protocol::DEFAULT_PORT`.
    pub fn group_and_port(&self) -> anyhow::Result<(Ipv4Addr, u16)> {
        if let Some((addr, port)) = self.mcast.split_once(':') {
            Ok((addr.parse()?, port.parse()?))
        } else {
            Ok((self.mcast.parse()?, dnbd_core::protocol::DEFAULT_PORT))
        }
    }
}
