//! The interface boundary consumed from the host (§6): a source of read
//! requests exposing {starting sector, current sector count, scatter-gather
//! buffers, completion callback}. Binding this to an actual kernel block
//! device is explicitly out of scope (§1) — this module only defines the
//! shape of the boundary and a small in-process stand-in used by the
//! `dnbd-client` binary and by tests.

use std::sync::{Arc, Mutex};

/// One destination buffer of a scatter-gather read. The cache and network
/// paths fill these in place; the host reads the data back out afterward.
pub type Segment = Arc<Mutex<Vec<u8>>>;

pub fn segment(len: usize) -> Segment {
    Arc::new(Mutex::new(vec![0u8; len]))
}

/// An in-flight read, exclusively owned by whichever queue (tx or rx) it
/// currently resides in.
pub struct RequestRecord {
    /// Byte offset / 512.
    pub sector: u64,
    /// Sectors still outstanding for this record.
    pub sectors: u32,
    /// Destination segments, front-to-back; each is at most one cache
    /// block long. Consumed (filled) segments are popped off the front as
    /// they complete.
    pub segments: Vec<Segment>,
    /// Timer tick this record was last (re)submitted at.
    pub start_time: u64,
    /// Invoked once per completed chunk — possibly more than once per
    /// original host request if it completes across multiple partial
    /// chunks (cache hit then network, or network then retransmit).
    pub on_complete: Box<dyn FnMut(bool, u32) + Send>,
}

impl RequestRecord {
    /// Byte offset on the wire.
    pub fn pos(&self) -> u64 {
        self.sector * 512
    }

    /// Total outstanding length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// Drops the first `sectors_done` sectors' worth of segments off the
    /// front, advances `sector`, and decrements `sectors`. Returns `true`
    /// if any segments remain (the record should be re-enqueued).
    pub fn advance(&mut self, bytes_done: usize) -> bool {
        let mut remaining = bytes_done;
        while remaining > 0 {
            let Some(front) = self.segments.first() else { break };
            let front_len = front.lock().unwrap().len();
            if front_len <= remaining {
                remaining -= front_len;
                self.segments.remove(0);
            } else {
                break;
            }
        }
        self.sector += (bytes_done / 512) as u64;
        self.sectors = self.sectors.saturating_sub((bytes_done / 512) as u32);
        !self.segments.is_empty()
    }

    /// Copies `data` into the leading segments, stopping at the first
    /// segment `data` doesn't fill completely (a short network reply fills
    /// only part of the outstanding request). Returns the number of bytes
    /// copied; the caller follows up with [`RequestRecord::advance`].
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let mut copied = 0;
        let mut rest = data;
        for seg in &self.segments {
            if rest.is_empty() {
                break;
            }
            let mut buf = seg.lock().unwrap();
            let seg_len = buf.len();
            let take = rest.len().min(seg_len);
            buf[..take].copy_from_slice(&rest[..take]);
            copied += take;
            rest = &rest[take..];
            if take < seg_len {
                break;
            }
        }
        copied
    }
}

/// A pluggable source of read requests. `dnbd-client`'s demo CLI implements
/// this against a fixed list of sector ranges read from the command line;
/// a real host integration would implement it against a kernel block-layer
/// request queue.
pub trait BlockSource: Send {
    /// Pulls the next read request, or `None` if the source is exhausted.
    fn next_request(&mut self, block_size: u32) -> Option<RequestRecord>;
}

/// Reads a fixed list of `(sector, length_in_bytes)` ranges, splitting each
/// into `block_size`-sized segments. Used by `dnbd-client bind` as a
/// stand-in for a real block-device host.
pub struct FixedRangeSource {
    ranges: std::vec::IntoIter<(u64, u32)>,
    sink: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    clock: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl FixedRangeSource {
    pub fn new(
        ranges: Vec<(u64, u32)>,
        sink: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
        clock: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        Self { ranges: ranges.into_iter(), sink, clock }
    }
}

impl BlockSource for FixedRangeSource {
    fn next_request(&mut self, block_size: u32) -> Option<RequestRecord> {
        let (sector, len) = self.ranges.next()?;
        let mut segments = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let seg_len = remaining.min(block_size);
            segments.push(segment(seg_len as usize));
            remaining -= seg_len;
        }
        let sink = self.sink.clone();
        let segs_for_cb = segments.clone();
        let sectors = (len / 512).max(1);
        let start_time = (self.clock)();
        // `on_complete` fires once per completed chunk (cache hit, then a
        // network reply for the remainder, etc.) — accumulate sectors done
        // across calls and only flush to `sink` once the whole range has
        // landed, not on the first (possibly partial) chunk.
        let sectors_done = Arc::new(Mutex::new(0u32));
        Some(RequestRecord {
            sector,
            sectors,
            segments,
            start_time,
            on_complete: Box::new(move |success, chunk_sectors| {
                if !success {
                    return;
                }
                let mut done = sectors_done.lock().unwrap();
                *done += chunk_sectors;
                if *done < sectors {
                    return;
                }
                let mut bytes = Vec::new();
                for seg in &segs_for_cb {
                    bytes.extend_from_slice(&seg.lock().unwrap());
                }
                sink.lock().unwrap().push((sector, bytes));
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_pops_completed_segments() {
        let mut record = RequestRecord {
            sector: 0,
            sectors: 16,
            segments: vec![segment(4096), segment(4096)],
            start_time: 0,
            on_complete: Box::new(|_, _| {}),
        };
        assert!(record.advance(4096));
        assert_eq!(record.segments.len(), 1);
        assert_eq!(record.sector, 8);
        assert_eq!(record.sectors, 8);
        assert!(!record.advance(4096));
        assert!(record.segments.is_empty());
    }

    #[test]
    fn fixed_range_source_flushes_only_once_fully_complete() {
        let sink: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let clock = Arc::new(|| 0u64);
        let mut source = FixedRangeSource::new(vec![(0, 8192)], sink.clone(), clock);
        let record = source.next_request(4096).expect("one request");
        assert_eq!(record.segments.len(), 2);

        for seg in &record.segments {
            seg.lock().unwrap().fill(0xab);
        }
        let mut on_complete = record.on_complete;

        // First chunk (e.g. a cache hit on the first block) completes —
        // must not flush a partial/zeroed result yet.
        on_complete(true, 8);
        assert!(sink.lock().unwrap().is_empty(), "must not flush before the whole range completes");

        // Second chunk (e.g. the network reply for the remainder) completes
        // the range — now it flushes, with both segments' data present.
        on_complete(true, 8);
        let sink = sink.lock().unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].0, 0);
        assert_eq!(sink[0].1, vec![0xabu8; 8192]);
    }
}
