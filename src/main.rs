//! `dnbd-client` — client for a distributed, read-only multicast network
//! block device. Binds a (notional) local device to a multicast group,
//! drives the client pipeline, and prints a final cache/server-table
//! snapshot on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod color;
mod config;

use cli::{Cli, Commands};
use config::ClientConfig;
use dnbd_core::{ClientPipeline, FixedRangeSource};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_sigint_handler() {
    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = ClientConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
            return Ok(());
        }
        Commands::Unbind { device } | Commands::SetCache { device, .. } => {
            println!(
                "{}",
                color::yellow(&format!(
                    "no persistent dnbd-client session to address for device `{device}` — \
                     the kernel/control-channel host integration this subcommand would reach \
                     is explicitly out of scope (see DESIGN.md). Pass `-c` to `bind` instead.",
                ))
            );
            return Ok(());
        }
        Commands::Stats { device } => {
            println!(
                "{}",
                color::yellow(&format!(
                    "no persistent dnbd-client session to address for device `{device}` — \
                     `bind` already prints this cache/server-table snapshot on disconnect \
                     (pass `--json` for a machine-readable report)."
                ))
            );
            return Ok(());
        }
        Commands::Bind { device, mcast, cache, reads, json } => {
            run_bind(&cli.config, &device, &mcast, cache, reads, json)
        }
    }
}

fn run_bind(
    config_path: &std::path::Path,
    device: &str,
    mcast: &str,
    cache: Option<std::path::PathBuf>,
    reads: Vec<String>,
    json: bool,
) -> Result<()> {
    let config = ClientConfig::load(config_path)?;
    let mcast_spec = if mcast.is_empty() { config.mcast.clone().unwrap_or_default() } else { mcast.to_string() };
    let (group, port) = cli::parse_mcast(&mcast_spec).context("invalid multicast address")?;

    let mut pipeline = ClientPipeline::new();
    let bind_options = dnbd_core::BindOptions {
        timeouts: dnbd_core::TimeoutBoundsMs {
            min: config.timeout_min_ms.unwrap_or(dnbd_core::pipeline::DEFAULT_TIMEOUT_MIN_MS),
            max: config.timeout_max_ms.unwrap_or(dnbd_core::pipeline::DEFAULT_TIMEOUT_MAX_MS),
            stalled: config.timeout_stalled_ms.unwrap_or(dnbd_core::pipeline::DEFAULT_TIMEOUT_STALLED_MS),
        },
        heartbeat_interval: std::time::Duration::from_secs(config.heartbeat_secs.unwrap_or(4)),
    };
    tracing::info!(device, %group, port, "binding");
    pipeline.bind_with_options(group, port, None, bind_options).context("bind failed")?;
    println!(
        "{}",
        color::bold_green(&format!(
            "bound: capacity={} blksize={} servers={}",
            pipeline.capacity(),
            pipeline.block_size(),
            pipeline.server_snapshot().len()
        ))
    );

    let cache_path = cache.or_else(|| config.cache.clone().map(std::path::PathBuf::from));
    if let Some(path) = &cache_path {
        pipeline.set_cache(path).with_context(|| format!("set-cache {}", path.display()))?;
        println!("{}", color::cyan(&format!("cache active: {}", path.display())));
    }

    pipeline.do_it().context("do_it failed")?;
    install_sigint_handler();

    let ranges: Vec<(u64, u32)> =
        reads.iter().map(|r| cli::parse_read_range(r)).collect::<Result<_>>().context("invalid --read range")?;

    if !ranges.is_empty() {
        let sink: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let clock = Arc::new(move || 0u64);
        let mut source = FixedRangeSource::new(ranges.clone(), sink.clone(), clock);
        let block_size = pipeline.block_size();
        while let Some(record) = source.next_request(block_size) {
            pipeline.submit(record)?;
        }
        while sink.lock().unwrap().len() < ranges.len() && RUNNING.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        for (sector, bytes) in sink.lock().unwrap().iter() {
            println!("read sector {sector}: {} bytes", bytes.len());
        }
    }

    println!("{}", color::dim("running — Ctrl-C to disconnect"));
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    print_final_stats(&pipeline, json)?;
    pipeline.disconnect().context("disconnect failed")?;
    Ok(())
}

/// Recovered from `cache.c`'s hit/miss/lru counters and `net.c`'s
/// `dnbd_show_servers` (SPEC_FULL §2) — surfaced here instead of a `/proc`
/// file, which spec.md explicitly excludes as formatting, not the counters
/// themselves.
#[derive(serde::Serialize)]
struct StatsReport {
    cache: Option<dnbd_core::CacheStats>,
    asrtt_ms: u64,
    servers: Vec<ServerSnapshot>,
}

#[derive(serde::Serialize)]
struct ServerSnapshot {
    id: u16,
    state: dnbd_core::ServerState,
    srtt_ms: u64,
    weight: u32,
}

fn print_final_stats(pipeline: &ClientPipeline, json: bool) -> Result<()> {
    let servers: Vec<ServerSnapshot> = pipeline
        .server_snapshot()
        .into_iter()
        .map(|(id, rec)| ServerSnapshot { id, state: rec.state, srtt_ms: rec.srtt >> 10, weight: rec.weight })
        .collect();
    let report = StatsReport { cache: pipeline.cache_stats(), asrtt_ms: pipeline.asrtt(), servers };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(stats) = &report.cache {
        println!(
            "{}",
            color::bold(&format!(
                "cache: hits={} miss={} lru_replacements={} used={}/{}",
                stats.hits, stats.miss, stats.lru_replacements, stats.used_blocks, stats.max_blocks
            ))
        );
    }
    println!("{}", color::bold(&format!("asrtt={}ms", report.asrtt_ms)));
    for s in &report.servers {
        println!("  server {}: state={:?} srtt={}ms weight={}", s.id, s.state, s.srtt_ms, s.weight);
    }
    Ok(())
}
