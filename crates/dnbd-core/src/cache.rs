//! Block cache (§4.3): on-disk, bounded, LRU-managed associative store keyed
//! by sector.
//!
//! The original (`kernel/cache.c`) keys a red-black tree of nodes that are
//! also spliced into an LRU doubly-linked list through pointers embedded in
//! the same node. Per §9's design note this is rebuilt as an arena of
//! `CacheSlot` indexed by plain integers: the ordered index maps
//! sector → slot index, and the LRU head/tail are themselves slot indices.
//! No cyclic ownership.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::host::RequestRecord;

struct CacheSlot {
    sector: u64,
    block_index: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub miss: u64,
    pub lru_replacements: u64,
    pub used_blocks: u32,
    pub max_blocks: u32,
}

/// An active, file-backed cache.
pub struct Cache {
    file: File,
    block_size: u32,
    max_blocks: u32,
    used_blocks: u32,
    index: BTreeMap<u64, usize>,
    slots: Vec<CacheSlot>,
    head: Option<usize>,
    tail: Option<usize>,
    hits: u64,
    miss: u64,
    lru_replacements: u64,
}

impl Cache {
    pub fn open(file: File, block_size: u32) -> std::io::Result<Cache> {
        let len = file.metadata()?.len();
        let max_blocks = (len / block_size as u64) as u32;
        Ok(Cache {
            file,
            block_size,
            max_blocks,
            used_blocks: 0,
            index: BTreeMap::new(),
            slots: Vec::new(),
            head: None,
            tail: None,
            hits: 0,
            miss: 0,
            lru_replacements: 0,
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            miss: self.miss,
            lru_replacements: self.lru_replacements,
            used_blocks: self.used_blocks,
            max_blocks: self.max_blocks,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = &self.slots[idx];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Looks up `record`'s first sector; on hit, copies up to one cache
    /// block's worth of bytes into `record`'s leading segments. Returns the
    /// number of *sectors* served (§4.3, confirmed by `cache.c`'s
    /// `return result >> 9`), stopping when one block's worth has been
    /// copied.
    pub fn search(&mut self, record: &RequestRecord) -> usize {
        let Some(&idx) = self.index.get(&record.sector) else {
            self.miss += 1;
            return 0;
        };
        self.hits += 1;
        let block_index = self.slots[idx].block_index;
        self.push_front_after_hit(idx);

        let base_offset = block_index as u64 * self.block_size as u64;
        let mut copied = 0usize;
        for seg in &record.segments {
            let mut buf = seg.lock().unwrap();
            if buf.len() > self.block_size as usize {
                tracing::error!(
                    sector = record.sector,
                    seg_len = buf.len(),
                    block_size = self.block_size,
                    "cache segment exceeds block size, aborting hit"
                );
                break;
            }
            let remaining_in_block = self.block_size as usize - copied;
            if remaining_in_block == 0 {
                break;
            }
            let want = buf.len().min(remaining_in_block);
            if self.file.seek(SeekFrom::Start(base_offset + copied as u64)).is_err() {
                break;
            }
            if self.file.read_exact(&mut buf[..want]).is_err() {
                tracing::warn!(sector = record.sector, "cache read error");
                break;
            }
            copied += want;
            if copied == self.block_size as usize {
                break;
            }
        }
        copied / 512
    }

    fn push_front_after_hit(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    /// Inserts `sector` → `buf` (exactly `block_size` bytes). If already
    /// present, moves it to the LRU head without writing. Otherwise evicts
    /// the LRU tail if full, or allocates a fresh block.
    pub fn insert(&mut self, sector: u64, buf: &[u8]) -> std::io::Result<()> {
        if let Some(&idx) = self.index.get(&sector) {
            self.push_front_after_hit(idx);
            return Ok(());
        }

        let (slot_idx, block_index, freshly_allocated) = if self.used_blocks == self.max_blocks {
            let tail_idx = self.tail.expect("full cache has a tail");
            let old_sector = self.slots[tail_idx].sector;
            self.unlink(tail_idx);
            self.index.remove(&old_sector);
            self.lru_replacements += 1;
            let block_index = self.slots[tail_idx].block_index;
            (tail_idx, block_index, false)
        } else {
            let block_index = self.used_blocks;
            self.slots.push(CacheSlot { sector, block_index, prev: None, next: None });
            (self.slots.len() - 1, block_index, true)
        };

        let offset = block_index as u64 * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let write_result = self.file.write_all(buf).and_then(|_| {
            if buf.len() != self.block_size as usize {
                Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "short cache write"))
            } else {
                Ok(())
            }
        });

        if let Err(e) = write_result {
            tracing::warn!(sector, error = %e, "cache write failed, rolling back allocation");
            if freshly_allocated {
                self.slots.pop();
            }
            return Err(e);
        }

        if freshly_allocated {
            self.used_blocks += 1;
        }
        self.slots[slot_idx].sector = sector;
        self.slots[slot_idx].block_index = block_index;
        self.index.insert(sector, slot_idx);
        self.push_front(slot_idx);
        Ok(())
    }
}

/// The cache is either absent (no-op reads/writes) or active; this replaces
/// the original's dummy-function-pointer polymorphism (§9) with a plain
/// enum matched at the call sites.
pub enum CacheState {
    Disabled,
    Enabled(Cache),
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState::Disabled
    }
}

impl CacheState {
    /// Returns the number of sectors served (0 on miss or when disabled).
    pub fn search(&mut self, record: &RequestRecord) -> usize {
        match self {
            CacheState::Disabled => 0,
            CacheState::Enabled(cache) => cache.search(record),
        }
    }

    pub fn insert(&mut self, sector: u64, buf: &[u8]) {
        if let CacheState::Enabled(cache) = self {
            if let Err(e) = cache.insert(sector, buf) {
                tracing::warn!(sector, error = %e, "cache insert failed");
            }
        }
    }

    /// Opportunistic/matched-reply insert (§4.5): chunks `payload` into
    /// `block_size`-sized pieces, one cache block per sector group, and
    /// inserts each full chunk starting at `sector`. A trailing partial
    /// chunk (shorter than `block_size`) is dropped rather than inserted.
    pub fn insert_chunks(&mut self, sector: u64, payload: &[u8], block_size: u32) {
        if !self.is_enabled() {
            return;
        }
        let sectors_per_block = (block_size / 512) as u64;
        for (i, chunk) in payload.chunks(block_size as usize).enumerate() {
            if chunk.len() == block_size as usize {
                self.insert(sector + i as u64 * sectors_per_block, chunk);
            }
        }
    }

    pub fn stats(&self) -> Option<CacheStats> {
        match self {
            CacheState::Disabled => None,
            CacheState::Enabled(cache) => Some(cache.stats()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, CacheState::Enabled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::segment;
    use std::io::Seek;

    fn record(sector: u64, block_size: u32) -> RequestRecord {
        RequestRecord {
            sector,
            sectors: block_size / 512,
            segments: vec![segment(block_size as usize)],
            start_time: 0,
            on_complete: Box::new(|_, _| {}),
        }
    }

    fn tempfile(len_blocks: u32, block_size: u32) -> File {
        let mut f = tempfile::tempfile().expect("tempfile");
        f.set_len((len_blocks as u64) * (block_size as u64)).unwrap();
        f.rewind().unwrap();
        f
    }

    #[test]
    fn miss_then_hit_round_trip() {
        let mut cache = Cache::open(tempfile(2, 4096), 4096).unwrap();
        let req = record(0, 4096);
        assert_eq!(cache.search(&req), 0);
        assert_eq!(cache.stats().miss, 1);

        let data = vec![0x42u8; 4096];
        cache.insert(0, &data).unwrap();

        let req2 = record(0, 4096);
        let n = cache.search(&req2);
        assert_eq!(n, 4096 / 512);
        assert_eq!(&*req2.segments[0].lock().unwrap(), &data[..]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn duplicate_insert_moves_to_head_without_rewrite() {
        let mut cache = Cache::open(tempfile(2, 4096), 4096).unwrap();
        cache.insert(0, &vec![1u8; 4096]).unwrap();
        let used_before = cache.stats().used_blocks;
        cache.insert(0, &vec![2u8; 4096]).unwrap(); // value ignored, no rewrite
        assert_eq!(cache.stats().used_blocks, used_before);
        assert_eq!(cache.head, Some(0));
    }

    #[test]
    fn eviction_order_matches_lru_tail() {
        let mut cache = Cache::open(tempfile(2, 4096), 4096).unwrap();
        cache.insert(0, &vec![0u8; 4096]).unwrap();
        cache.insert(8, &vec![1u8; 4096]).unwrap();
        cache.insert(16, &vec![2u8; 4096]).unwrap();

        assert_eq!(cache.stats().used_blocks, 2);
        assert!(!cache.index.contains_key(&0));
        assert!(cache.index.contains_key(&8));
        assert!(cache.index.contains_key(&16));
    }

    #[test]
    fn disabled_cache_is_a_no_op() {
        let mut state = CacheState::Disabled;
        let req = record(0, 4096);
        assert_eq!(state.search(&req), 0);
        state.insert(0, &[0u8; 4096]);
        assert!(state.stats().is_none());
    }
}
