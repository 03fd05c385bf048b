//! Server request handler (§4.6): a bounded circular buffer of received
//! frames, a receiver thread, a pool of worker threads, duplicate-request
//! suppression, and a mutex-serialised backing-file reader.
//!
//! Grounded in `source.rs`'s thread-spawning idiom from the teacher
//! (`std::thread::Builder::new().name(..).spawn(..)`) and in §9's
//! design note replacing the original's module-global circular buffer and
//! SIGKILL-based shutdown with a single owned `ServerState` and an atomic
//! shutdown flag.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::Socket;

use crate::protocol::{Op, ReplyHeader, ReplyInit, Request, REQUEST_SIZE};
use crate::socket::{bind_multicast, send_to};

/// Maximum READ length the server will honour (§4.6, §8).
pub const MAX_BLOCK_SIZE: u16 = 4096;
/// Default circular buffer capacity (`max_queries` in the source).
pub const DEFAULT_MAX_QUERIES: usize = 100;
/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 1;
/// Duplicate-suppression window (§4.6: "within 1 second").
const DUP_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct Slot {
    request: Request,
    source: SocketAddr,
    timestamp: Instant,
}

/// Fixed-capacity ring of received frames (§3). The producer (receiver
/// thread) advances `next` modulo capacity and refuses to advance into
/// `last` (drops the newest frame until the consumer catches up); the
/// consumer (a worker) advances `last`. Non-empty iff `next != last`.
///
/// `pop` only ever moves `last` — it does not clear the slot a worker just
/// consumed. Per `server/query.c`'s `query_get` (which only advances
/// `last_query` and never clears `queries[last_query]`) and `query_handle`'s
/// dup scan (which walks backward from `last_query` through that same
/// resident history), already-processed entries must stay readable by
/// `recent()` until the producer's next lap overwrites them — that's what
/// lets a duplicate arriving *after* the original was already answered still
/// find it.
struct RingBuffer {
    slots: Vec<Option<Slot>>,
    next: usize,
    last: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        RingBuffer { slots: vec![None; capacity + 1], next: 0, last: 0 }
    }

    fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    fn is_empty(&self) -> bool {
        self.next == self.last
    }

    fn is_full(&self) -> bool {
        (self.next + 1) % self.slots.len() == self.last
    }

    fn push(&mut self, slot: Slot) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.next] = Some(slot);
        self.next = (self.next + 1) % self.slots.len();
        true
    }

    fn pop(&mut self) -> Option<Slot> {
        if self.is_empty() {
            return None;
        }
        let slot = self.slots[self.last].clone();
        self.last = (self.last + 1) % self.slots.len();
        slot
    }

    /// Scans up to `max` most-recently-enqueued slots, pending or already
    /// processed, for a matching `pos` within the duplicate window. Stops
    /// early on an unwritten slot (the ring hasn't lapped that far yet) —
    /// beyond that point there is no history to find.
    fn recent(&self, max: usize) -> Vec<&Slot> {
        let mut out = Vec::new();
        let mut idx = if self.next == 0 { self.slots.len() - 1 } else { self.next - 1 };
        for _ in 0..max.min(self.slots.len()) {
            match &self.slots[idx] {
                Some(slot) => out.push(slot),
                None => break,
            }
            idx = if idx == 0 { self.slots.len() - 1 } else { idx - 1 };
        }
        out
    }
}

struct Shared {
    ring: Mutex<RingBuffer>,
    got_query: Condvar,
    shutdown: AtomicBool,
    file: Mutex<File>,
    id: u16,
    capacity: u64,
    blksize: u16,
    max_queries: usize,
    group: Ipv4Addr,
    port: u16,
    socket: Socket,
}

/// Owns everything a running server needs: the circular buffer, the backing
/// file, and the multicast socket. Passed by `Arc` to the receiver and
/// worker threads instead of the original's module-globals (§9).
pub struct ServerHandler {
    shared: Arc<Shared>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl ServerHandler {
    /// Opens `path` read-only, binds/joins `group:port`, and prepares (but
    /// does not yet start) the receiver and worker threads.
    pub fn new(
        path: &std::path::Path,
        id: u16,
        group: Ipv4Addr,
        port: u16,
        blksize: u16,
        max_queries: usize,
    ) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open backing file {}", path.display()))?;
        let capacity = file.metadata()?.len();
        let socket = bind_multicast(group, port, None, crate::socket::DEFAULT_TTL)
            .context("bind server multicast socket")?;

        let shared = Arc::new(Shared {
            ring: Mutex::new(RingBuffer::new(max_queries)),
            got_query: Condvar::new(),
            shutdown: AtomicBool::new(false),
            file: Mutex::new(file),
            id,
            capacity,
            blksize,
            max_queries,
            group,
            port,
            socket,
        });

        Ok(ServerHandler { shared, handles: Vec::new() })
    }

    /// Starts the receiver thread and `workers` worker threads. Blocks the
    /// caller not at all — returns once threads are spawned; call
    /// [`ServerHandler::shutdown`] to tear down.
    pub fn run(&mut self, workers: usize) -> Result<()> {
        let recv_shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("dnbd-recv".into())
            .spawn(move || receiver_loop(recv_shared))
            .context("spawn receiver thread")?;
        self.handles.push(handle);

        for i in 0..workers.max(1) {
            let worker_shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dnbd-worker-{i}"))
                .spawn(move || worker_loop(worker_shared))
                .context("spawn worker thread")?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Sets the shutdown flag and wakes blocked workers. The receiver
    /// thread is unblocked by closing the socket (shutdown of the raw fd);
    /// on most platforms that requires recreating the socket, so here we
    /// rely on a short recv timeout instead — see `receiver_loop`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.got_query.notify_all();
    }

    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}

fn receiver_loop(shared: Arc<Shared>) {
    shared.socket.set_read_timeout(Some(Duration::from_millis(200))).ok();
    let mut raw = [std::mem::MaybeUninit::new(0u8); 1500];
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let (len, from) = match shared.socket.recv_from(&mut raw) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::warn!(error = %e, "server recv error");
                continue;
            }
        };
        let buf: Vec<u8> = raw[..len].iter().map(|b| unsafe { b.assume_init() }).collect();
        if len < REQUEST_SIZE {
            tracing::debug!(len, "dropping short frame");
            continue;
        }
        let Some(request) = Request::decode(&buf) else {
            tracing::debug!("dropping frame with bad magic/direction");
            continue;
        };
        let Some(source) = from.as_socket() else { continue };
        enqueue(&shared, request, source);
    }
}

fn dummy_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn enqueue(shared: &Arc<Shared>, request: Request, source: SocketAddr) {
    let mut ring = shared.ring.lock().unwrap();
    let pushed = ring.push(Slot { request, source, timestamp: Instant::now() });
    drop(ring);
    if pushed {
        shared.got_query.notify_one();
    } else {
        tracing::debug!("circular buffer full, dropping frame");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let slot = {
            let mut ring = shared.ring.lock().unwrap();
            loop {
                if let Some(slot) = ring.pop() {
                    break Some(slot);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                let (guard, _) = shared.got_query.wait_timeout(ring, Duration::from_millis(200)).unwrap();
                ring = guard;
            }
        };
        let Some(slot) = slot else { return };
        process(&shared, slot);
    }
}

fn process(shared: &Arc<Shared>, slot: Slot) {
    let req = slot.request;
    if req.id != 0 && req.id != shared.id {
        return;
    }

    match req.op {
        Op::Init | Op::Hb => {
            let reply = ReplyInit { id: shared.id, capacity: shared.capacity, time: req.time, blksize: shared.blksize };
            let encoded = reply.encode();
            if let Err(e) = send_to(&shared.socket, &encoded, shared.group, shared.port) {
                tracing::warn!(error = %e, "failed to send INIT/HB reply");
            }
        }
        Op::Read => handle_read(shared, req, &slot),
    }
}

fn handle_read(shared: &Arc<Shared>, req: Request, slot: &Slot) {
    if req.len > MAX_BLOCK_SIZE {
        tracing::debug!(len = req.len, "dropping oversized READ");
        return;
    }

    if is_suppressed(shared, req.pos, slot.source, slot.timestamp) {
        tracing::debug!(pos = req.pos, "suppressing duplicate READ for another client");
        return;
    }

    let mut payload = vec![0u8; req.len as usize];
    {
        let mut file = shared.file.lock().unwrap();
        if let Err(e) = file.seek(SeekFrom::Start(req.pos)).and_then(|_| file.read_exact(&mut payload)) {
            tracing::warn!(pos = req.pos, len = req.len, error = %e, "backing file read failed");
            return;
        }
    }

    let header = ReplyHeader { id: shared.id, op: Op::Read, pos: req.pos, time: req.time };
    let frame = header.encode_with_payload(&payload);
    if let Err(e) = send_to(&shared.socket, &frame, shared.group, shared.port) {
        tracing::warn!(error = %e, "failed to send READ reply");
    }
}

/// §4.6 duplicate suppression: scan up to `max_queries` recent slots for one
/// with the same `pos` within `DUP_WINDOW`. Same source address ⇒ benign
/// retransmit, reply anyway. Different source address ⇒ another worker
/// already owns this reply, suppress ours.
fn is_suppressed(shared: &Arc<Shared>, pos: u64, source: SocketAddr, now: Instant) -> bool {
    let ring = shared.ring.lock().unwrap();
    for slot in ring.recent(shared.max_queries) {
        if slot.request.pos == pos && now.duration_since(slot.timestamp) < DUP_WINDOW {
            if slot.source != source {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(pos: u64, len: u16) -> Request {
        Request { id: 0, op: Op::Read, pos, time: 0, len }
    }

    #[test]
    fn ring_buffer_refuses_to_overrun() {
        let mut ring = RingBuffer::new(2);
        assert!(ring.push(Slot { request: req(0, 0), source: dummy_addr(), timestamp: Instant::now() }));
        assert!(ring.push(Slot { request: req(512, 0), source: dummy_addr(), timestamp: Instant::now() }));
        assert!(!ring.push(Slot { request: req(1024, 0), source: dummy_addr(), timestamp: Instant::now() }));
        assert!(ring.is_full());
    }

    #[test]
    fn ring_buffer_empty_iff_next_eq_last() {
        let mut ring = RingBuffer::new(4);
        assert!(ring.is_empty());
        ring.push(Slot { request: req(0, 0), source: dummy_addr(), timestamp: Instant::now() });
        assert!(!ring.is_empty());
        ring.pop().unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn recent_still_sees_popped_slots() {
        let mut ring = RingBuffer::new(4);
        ring.push(Slot { request: req(8192, 4096), source: dummy_addr(), timestamp: Instant::now() });
        ring.pop().unwrap();
        assert!(ring.is_empty());
        let found = ring.recent(4);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].request.pos, 8192);
    }

    #[test]
    fn dup_same_source_not_suppressed() {
        let shared = Arc::new(Shared {
            ring: Mutex::new(RingBuffer::new(10)),
            got_query: Condvar::new(),
            shutdown: AtomicBool::new(false),
            file: Mutex::new(tempfile::tempfile().unwrap()),
            id: 1,
            capacity: 0,
            blksize: 4096,
            max_queries: 10,
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 5001,
            socket: bind_multicast(Ipv4Addr::new(239, 0, 0, 1), 0, None, 1).unwrap(),
        });
        let addr_a: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        enqueue(&shared, req(8192, 4096), addr_a);
        assert!(!is_suppressed(&shared, 8192, addr_a, Instant::now()));
    }

    #[test]
    fn dup_other_source_is_suppressed() {
        let shared = Arc::new(Shared {
            ring: Mutex::new(RingBuffer::new(10)),
            got_query: Condvar::new(),
            shutdown: AtomicBool::new(false),
            file: Mutex::new(tempfile::tempfile().unwrap()),
            id: 1,
            capacity: 0,
            blksize: 4096,
            max_queries: 10,
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 5001,
            socket: bind_multicast(Ipv4Addr::new(239, 0, 0, 1), 0, None, 1).unwrap(),
        });
        let addr_a: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        enqueue(&shared, req(8192, 4096), addr_a);
        assert!(is_suppressed(&shared, 8192, addr_b, Instant::now()));
    }

    /// §8 scenario 3, the common case: B's request has already been popped
    /// and replied to by the time A's duplicate arrives, not merely still
    /// sitting in the ring unprocessed.
    #[test]
    fn dup_other_source_suppressed_after_original_already_consumed() {
        let shared = Arc::new(Shared {
            ring: Mutex::new(RingBuffer::new(10)),
            got_query: Condvar::new(),
            shutdown: AtomicBool::new(false),
            file: Mutex::new(tempfile::tempfile().unwrap()),
            id: 1,
            capacity: 0,
            blksize: 4096,
            max_queries: 10,
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 5001,
            socket: bind_multicast(Ipv4Addr::new(239, 0, 0, 1), 0, None, 1).unwrap(),
        });
        let addr_a: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        enqueue(&shared, req(8192, 4096), addr_b);
        shared.ring.lock().unwrap().pop().expect("B's request popped and answered");
        assert!(is_suppressed(&shared, 8192, addr_a, Instant::now()));
    }
}
