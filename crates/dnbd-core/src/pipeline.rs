//! Client pipeline (§4.5): tx-loop, rx-loop, heartbeat/weighting loop, and
//! retransmit timer, coordinated through the control state machine LOADED →
//! CONFIGURED → RUNNING → LOADED (§4.5, §5).
//!
//! Threads are spawned with `std::thread::Builder::new().name(..).spawn(..)`
//! following `source.rs`'s idiom in the teacher; shutdown replaces the
//! original's SIGKILL-based thread teardown with the atomic-flag-plus-
//! socket-timeout pattern from §9's design notes.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use socket2::Socket;

use crate::cache::CacheState;
use crate::host::RequestRecord;
use crate::protocol::{Op, ReplyHeader, ReplyInit, Request, REPLY_HEADER_SIZE};
use crate::queue::RequestQueue;
use crate::server_table::{ServerTable, TimeoutBounds, TIMEOUT_SHIFT};
use crate::socket::{bind_multicast, send_to, DEFAULT_TTL};

/// Default timeout bounds (§4.4, milliseconds — see SPEC_FULL §2 for the
/// HZ=100 jiffies this preserves: `TIMEOUT_MIN=1`, `TIMEOUT_MAX=HZ/4`,
/// `TIMEOUT_STALLED=5*HZ`).
pub const DEFAULT_TIMEOUT_MIN_MS: u64 = 10;
pub const DEFAULT_TIMEOUT_MAX_MS: u64 = 250;
pub const DEFAULT_TIMEOUT_STALLED_MS: u64 = 5000;

/// Handshake duration: INIT sent once per second for up to this many
/// seconds (§4.5).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_RETRY: Duration = Duration::from_secs(1);
/// Heartbeat/weighting cadence (§4.5: "every ~4 seconds").
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
const SOCKET_POLL: Duration = Duration::from_millis(200);
/// Largest frame we expect: header + a full READ payload.
const RECV_BUF_LEN: usize = 4096 + REPLY_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Loaded,
    Configured,
    Running,
}

/// Tunables `bind` accepts beyond the group/port/interface (SPEC_FULL §1.3):
/// retransmit timeout bounds and the heartbeat/weighting cadence, normally
/// sourced from `dnbd-client.toml` and overridden by CLI flags upstream of
/// this crate.
#[derive(Debug, Clone, Copy)]
pub struct BindOptions {
    pub timeouts: TimeoutBoundsMs,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutBoundsMs {
    pub min: u64,
    pub max: u64,
    pub stalled: u64,
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions {
            timeouts: TimeoutBoundsMs {
                min: DEFAULT_TIMEOUT_MIN_MS,
                max: DEFAULT_TIMEOUT_MAX_MS,
                stalled: DEFAULT_TIMEOUT_STALLED_MS,
            },
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Everything the tx/rx/heartbeat/retransmit loops share. Owned by a single
/// `Arc<Pipeline>` rather than module-global state (§9).
struct Pipeline {
    socket: Socket,
    group: Ipv4Addr,
    port: u16,
    block_size: AtomicU32,
    capacity: AtomicU64,
    cache: Mutex<CacheState>,
    server_table: ServerTable,
    tx_queue: RequestQueue,
    rx_queue: RequestQueue,
    shutdown: AtomicBool,
    start: Instant,
    last_heartbeat_ms: AtomicU64,
    heartbeat_interval_ms: AtomicU64,
}

impl Pipeline {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Relaxed)
    }
}

/// Client control surface (§6): bind, set-cache, disconnect, plus the
/// read-request submission point the host integration drives.
pub struct ClientPipeline {
    state: Mutex<PipelineState>,
    inner: Option<Arc<Pipeline>>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Default for ClientPipeline {
    fn default() -> Self {
        ClientPipeline { state: Mutex::new(PipelineState::Loaded), inner: None, threads: Vec::new() }
    }
}

impl ClientPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    /// `bind`: binds the multicast socket, joins the group, and runs the
    /// INIT handshake (§4.5). On success the pipeline is CONFIGURED with
    /// device geometry adopted from the first successful registration.
    pub fn bind(&mut self, group: Ipv4Addr, port: u16, interface: Option<Ipv4Addr>) -> Result<()> {
        self.bind_with_options(group, port, interface, BindOptions::default())
    }

    /// Same as [`ClientPipeline::bind`], but with caller-supplied retransmit
    /// timeout bounds and heartbeat cadence (SPEC_FULL §1.3: sourced from
    /// `dnbd-client.toml`, overridden by CLI flags).
    pub fn bind_with_options(
        &mut self,
        group: Ipv4Addr,
        port: u16,
        interface: Option<Ipv4Addr>,
        options: BindOptions,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != PipelineState::Loaded {
            bail!("bind requires LOADED state, currently {:?}", *state);
        }

        let socket = bind_multicast(group, port, interface, DEFAULT_TTL).context("bind client multicast socket")?;
        let pipeline = Arc::new(Pipeline {
            socket,
            group,
            port,
            block_size: AtomicU32::new(4096),
            capacity: AtomicU64::new(0),
            cache: Mutex::new(CacheState::Disabled),
            server_table: ServerTable::new(TimeoutBounds {
                min: options.timeouts.min,
                max: options.timeouts.max,
                stalled: options.timeouts.stalled,
            }),
            tx_queue: RequestQueue::new(),
            rx_queue: RequestQueue::new(),
            shutdown: AtomicBool::new(false),
            start: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            heartbeat_interval_ms: AtomicU64::new(options.heartbeat_interval.as_millis() as u64),
        });

        handshake(&pipeline)?;

        self.inner = Some(pipeline);
        *state = PipelineState::Configured;
        Ok(())
    }

    pub fn set_block_size(&self, n: u32) -> Result<()> {
        let pipeline = self.require_inner()?;
        pipeline.block_size.store(n, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_capacity(&self, bytes: u64) -> Result<()> {
        let pipeline = self.require_inner()?;
        let block_size = pipeline.block_size() as u64;
        pipeline.capacity.store((bytes / block_size) * block_size, Ordering::Relaxed);
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.inner.as_ref().map(|p| p.capacity.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn block_size(&self) -> u32 {
        self.inner.as_ref().map(|p| p.block_size()).unwrap_or(4096)
    }

    /// `set_cache`: opens `path` read-write, derives `max_blocks` from file
    /// size / block size, and activates the cache. Usable whether or not
    /// the pipeline is RUNNING (§6 client CLI: "set cache on a running
    /// device").
    pub fn set_cache(&self, path: &std::path::Path) -> Result<()> {
        let pipeline = self.require_inner()?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open cache file {}", path.display()))?;
        let cache = crate::cache::Cache::open(file, pipeline.block_size())
            .with_context(|| format!("initialise cache over {}", path.display()))?;
        *pipeline.cache.lock().unwrap() = CacheState::Enabled(cache);
        Ok(())
    }

    pub fn cache_stats(&self) -> Option<crate::cache::CacheStats> {
        self.inner.as_ref().and_then(|p| p.cache.lock().unwrap().stats())
    }

    pub fn server_snapshot(&self) -> Vec<(u16, crate::server_table::ServerRecord)> {
        self.inner.as_ref().map(|p| p.server_table.snapshot()).unwrap_or_default()
    }

    pub fn asrtt(&self) -> u64 {
        self.inner.as_ref().map(|p| p.server_table.asrtt()).unwrap_or(0)
    }

    /// Submits a host read request into the tx-queue.
    pub fn submit(&self, record: RequestRecord) -> Result<()> {
        let pipeline = self.require_inner()?;
        pipeline.tx_queue.enqueue(record);
        Ok(())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.as_ref().map(|p| p.tx_queue.len() + p.rx_queue.len()).unwrap_or(0)
    }

    /// `do_it`: CONFIGURED → RUNNING. Spawns the worker threads; does not
    /// block (the CLI's `bind` subcommand blocks separately waiting on a
    /// shutdown signal, matching the boundary the host integration owns).
    pub fn do_it(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != PipelineState::Configured {
            bail!("do_it requires CONFIGURED state, currently {:?}", *state);
        }
        let pipeline = self.inner.clone().expect("inner present when CONFIGURED");

        let tx = pipeline.clone();
        self.threads.push(
            std::thread::Builder::new().name("dnbd-tx".into()).spawn(move || tx_loop(tx)).context("spawn tx-loop")?,
        );
        let rx = pipeline.clone();
        self.threads.push(
            std::thread::Builder::new().name("dnbd-rx".into()).spawn(move || rx_loop(rx)).context("spawn rx-loop")?,
        );
        let hb = pipeline.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("dnbd-heartbeat".into())
                .spawn(move || heartbeat_loop(hb))
                .context("spawn heartbeat loop")?,
        );
        let timer = pipeline.clone();
        self.threads.push(
            std::thread::Builder::new()
                .name("dnbd-retransmit".into())
                .spawn(move || retransmit_loop(timer))
                .context("spawn retransmit timer")?,
        );

        *state = PipelineState::Running;
        Ok(())
    }

    /// `disconnect`: signals all workers, waits for them to exit, drains
    /// both queues with error completions, and clears the cache and server
    /// table (§4.7, §5).
    pub fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state == PipelineState::Loaded {
            return Ok(());
        }
        if let Some(pipeline) = &self.inner {
            pipeline.shutdown.store(true, Ordering::SeqCst);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(pipeline) = self.inner.take() {
            pipeline.tx_queue.close();
            pipeline.rx_queue.close();
            pipeline.tx_queue.drain_with_error();
            pipeline.rx_queue.drain_with_error();
        }
        *state = PipelineState::Loaded;
        Ok(())
    }

    fn require_inner(&self) -> Result<&Arc<Pipeline>> {
        self.inner.as_ref().context("pipeline is not configured (call bind first)")
    }
}

/// §4.5 handshake: broadcast INIT once per second for up to
/// `HANDSHAKE_TIMEOUT`; each INIT reply with SRV|INIT is offered to
/// `set_serverid`; adopt {capacity, blksize} from the first successful
/// registration. Fatal if zero servers register.
fn handshake(pipeline: &Arc<Pipeline>) -> Result<()> {
    pipeline.socket.set_read_timeout(Some(Duration::from_millis(100))).ok();
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut last_send = Instant::now() - HANDSHAKE_RETRY;
    let mut adopted = false;

    while Instant::now() < deadline {
        if last_send.elapsed() >= HANDSHAKE_RETRY {
            let now = pipeline.now_ms();
            let init = Request { id: 0, op: Op::Init, pos: 0, time: (now & 0xffff) as u16, len: 0 };
            let _ = send_to(&pipeline.socket, &init.encode(), pipeline.group, pipeline.port);
            last_send = Instant::now();
        }

        let mut raw = [std::mem::MaybeUninit::new(0u8); RECV_BUF_LEN];
        let (len, _from) = match pipeline.socket.recv_from(&mut raw) {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let buf: Vec<u8> = raw[..len].iter().map(|b| unsafe { b.assume_init() }).collect();
        let Some(header) = ReplyHeader::decode(&buf) else { continue };
        if header.op != Op::Init && header.op != Op::Hb {
            continue;
        }
        let Some(init) = ReplyInit::decode(&buf) else { continue };

        match pipeline.server_table.set_serverid(init.id, pipeline.now_ms()) {
            Ok(_) => {
                if !adopted {
                    pipeline.block_size.store(init.blksize as u32, Ordering::Relaxed);
                    pipeline.capacity.store(init.capacity, Ordering::Relaxed);
                    adopted = true;
                }
            }
            // AlreadyActive during handshake is benign (§4.5).
            Err(e) => tracing::debug!(error = %e, "set_serverid during handshake"),
        }
    }

    if pipeline.server_table.active_count() == 0 {
        bail!("no servers");
    }
    Ok(())
}

fn tx_loop(pipeline: Arc<Pipeline>) {
    loop {
        let Some(mut record) = pipeline.tx_queue.pop_timeout(SOCKET_POLL) else {
            if pipeline.shutdown.load(Ordering::SeqCst) {
                return;
            }
            continue;
        };

        let sectors_served = pipeline.cache.lock().unwrap().search(&record);
        if sectors_served > 0 {
            let bytes_served = sectors_served * 512;
            let has_more = record.advance(bytes_served);
            (record.on_complete)(true, sectors_served as u32);
            if has_more {
                pipeline.tx_queue.enqueue(record);
            }
            continue;
        }

        let now = pipeline.now_ms();
        let pos = record.pos();
        let len = record.len_bytes().min(u16::MAX as usize) as u16;
        let server_id = pipeline.server_table.next_server();
        record.start_time = now;
        pipeline.rx_queue.enqueue(record);

        let req = Request { id: server_id, op: Op::Read, pos, time: (now & 0xffff) as u16, len };
        if let Err(e) = send_to(&pipeline.socket, &req.encode(), pipeline.group, pipeline.port) {
            tracing::warn!(error = %e, "failed to send READ request");
        }
        pipeline.server_table.mark_sent(server_id, now);
    }
}

fn rx_loop(pipeline: Arc<Pipeline>) {
    pipeline.socket.set_read_timeout(Some(SOCKET_POLL)).ok();
    loop {
        if pipeline.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let mut raw = [std::mem::MaybeUninit::new(0u8); RECV_BUF_LEN];
        let len = match pipeline.socket.recv(&mut raw) {
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                tracing::warn!(error = %e, "client rx error");
                continue;
            }
        };
        let buf: Vec<u8> = raw[..len].iter().map(|b| unsafe { b.assume_init() }).collect();
        let Some(header) = ReplyHeader::decode(&buf) else { continue };
        let now = pipeline.now_ms();
        let rtt = (now as u16).wrapping_sub(header.time) as u64;

        match header.op {
            Op::Init | Op::Hb => {
                let Some(init) = ReplyInit::decode(&buf) else { continue };
                if pipeline.server_table.set_serverid(init.id, now).is_ok() {
                    pipeline.server_table.rtt_update(init.id, rtt, now);
                }
            }
            Op::Read => {
                pipeline.server_table.rtt_update(header.id, rtt, now);
                let payload = &buf[REPLY_HEADER_SIZE..];
                let block_size = pipeline.block_size();
                match pipeline.rx_queue.remove_by_pos(header.pos) {
                    Some(mut record) => {
                        let copied = record.fill(payload);
                        let has_more = record.advance(copied);
                        (record.on_complete)(true, (copied / 512) as u32);
                        if has_more {
                            pipeline.tx_queue.enqueue(record);
                        }
                        pipeline.cache.lock().unwrap().insert_chunks(header.pos / 512, payload, block_size);
                    }
                    None => {
                        // Opportunistic: no outstanding request for this
                        // sector. Insert only; do not complete anything
                        // (§9 open question).
                        pipeline.cache.lock().unwrap().insert_chunks(header.pos / 512, payload, block_size);
                    }
                }
            }
        }
    }
}

fn heartbeat_loop(pipeline: Arc<Pipeline>) {
    loop {
        std::thread::sleep(SOCKET_POLL);
        if pipeline.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = pipeline.now_ms();
        let interval_ms = pipeline.heartbeat_interval_ms.load(Ordering::Relaxed);
        if now.saturating_sub(pipeline.last_heartbeat_ms.load(Ordering::Relaxed)) < interval_ms {
            continue;
        }
        pipeline.last_heartbeat_ms.store(now, Ordering::Relaxed);

        pipeline.server_table.recompute_weights(now);
        let hb = Request { id: 0, op: Op::Hb, pos: 0, time: (now & 0xffff) as u16, len: 0 };
        if let Err(e) = send_to(&pipeline.socket, &hb.encode(), pipeline.group, pipeline.port) {
            tracing::warn!(error = %e, "failed to send heartbeat");
        }
    }
}

fn retransmit_loop(pipeline: Arc<Pipeline>) {
    loop {
        let diff = pipeline.server_table.retransmit_diff();
        std::thread::sleep(Duration::from_millis(diff.min(SOCKET_POLL.as_millis() as u64).max(1)));
        if pipeline.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = pipeline.now_ms();
        let threshold = now.saturating_sub(diff << TIMEOUT_SHIFT);
        let moved = pipeline.rx_queue.sweep_older_than(threshold, &pipeline.tx_queue);
        if moved > 0 {
            tracing::debug!(moved, "retransmit timer requeued stale requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_options_default_matches_spec_constants() {
        let opts = BindOptions::default();
        assert_eq!(opts.timeouts.min, DEFAULT_TIMEOUT_MIN_MS);
        assert_eq!(opts.timeouts.max, DEFAULT_TIMEOUT_MAX_MS);
        assert_eq!(opts.timeouts.stalled, DEFAULT_TIMEOUT_STALLED_MS);
        assert_eq!(opts.heartbeat_interval, HEARTBEAT_INTERVAL);
    }

    #[test]
    fn fresh_pipeline_starts_loaded() {
        let pipeline = ClientPipeline::new();
        assert_eq!(pipeline.state(), PipelineState::Loaded);
        assert_eq!(pipeline.capacity(), 0);
        assert_eq!(pipeline.block_size(), 4096);
    }
}
