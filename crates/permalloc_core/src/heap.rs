//! Bin manager: allocation and deallocation over the segment.
//!
//! Small requests are served from per-bin free lists threaded through the
//! free blocks themselves. When a list is empty, a batch of blocks is carved
//! from the bin's current chunk (its *frontier*); when that chunk is
//! exhausted, an unused chunk is claimed, growing the segment if needed.
//! Small chunks stay with their bin for the life of the datastore.
//!
//! Large requests take whole runs of chunks, first-fit. Freed runs merge
//! with adjacent unused runs and may have their disk blocks released.
//!
//! Deallocation needs no per-object header: the chunk table says which bin
//! a chunk belongs to, and the frontier says which of its slots were ever
//! handed out.
//!
//! # Locking
//!
//! Each bin has its own mutex; the chunk table has one read-write lock.
//! A bin lock may be held while taking the chunk table lock, never the
//! reverse. Operations that need the whole heap still take every bin lock
//! in index order first.

use crate::bin::{BinIndex, BinTable, BIN_TABLE_VERSION};
use crate::chunk_table::{ChunkKind, ChunkTable};
use crate::codec::{Decoder, Encoder};
use crate::error::{ManagerError, ManagerResult};
use crate::free_block::{FreeBlock, HEADER_LEN, NIL};
use crate::FORMAT_VERSION;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use permalloc_storage::SegmentStorage;
use tracing::{debug, trace};

const HEAP_MAGIC: [u8; 4] = *b"PAHP";

/// Carving position inside a bin's current chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frontier {
    pub(crate) chunk: u64,
    pub(crate) next_slot: u64,
}

/// Mutable state of one small bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BinState {
    pub(crate) head: u64,
    pub(crate) free_count: u64,
    pub(crate) frontier: Option<Frontier>,
}

impl Default for BinState {
    fn default() -> Self {
        Self {
            head: NIL,
            free_count: 0,
            frontier: None,
        }
    }
}

impl BinState {
    /// Number of slots of `chunk` that have been carved.
    fn carved(&self, chunk: u64, slots: u64) -> u64 {
        match self.frontier {
            Some(f) if f.chunk == chunk => f.next_slot,
            _ => slots,
        }
    }
}

/// The persisted allocator metadata (`<datastore>/heap`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeapImage {
    pub(crate) chunk_size: usize,
    pub(crate) max_segment_size: usize,
    pub(crate) kinds: Vec<ChunkKind>,
    pub(crate) bins: Vec<BinState>,
}

impl HeapImage {
    /// State of a freshly created heap.
    pub(crate) fn empty(chunk_size: usize, max_segment_size: usize) -> Self {
        let table = BinTable::new(chunk_size, max_segment_size);
        Self {
            chunk_size,
            max_segment_size,
            kinds: Vec::new(),
            bins: vec![BinState::default(); table.small_bin_count()],
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let table = BinTable::new(self.chunk_size, self.max_segment_size);
        let mut enc = Encoder::new();
        enc.bytes(&HEAP_MAGIC);
        enc.u32(FORMAT_VERSION);
        enc.u32(BIN_TABLE_VERSION);
        enc.u64(self.chunk_size as u64);
        enc.u64(self.max_segment_size as u64);
        enc.u64(table.bin_count() as u64);

        enc.u64(self.kinds.len() as u64);
        for kind in &self.kinds {
            let (tag, value) = kind.tag();
            enc.u8(tag);
            enc.u32(value);
        }

        enc.u64(self.bins.len() as u64);
        for bin in &self.bins {
            enc.u64(bin.head);
            enc.u64(bin.free_count);
            match bin.frontier {
                Some(f) => {
                    enc.u64(f.chunk);
                    enc.u64(f.next_slot);
                }
                None => {
                    enc.u64(NIL);
                    enc.u64(0);
                }
            }
        }
        enc.seal()
    }

    pub(crate) fn decode(data: &[u8]) -> ManagerResult<Self> {
        let mut dec = Decoder::unseal(data, "heap")?;
        dec.magic(&HEAP_MAGIC)?;

        let version = dec.u32()?;
        if version != FORMAT_VERSION {
            return Err(ManagerError::format(format!(
                "unsupported heap version {version}"
            )));
        }
        let bin_version = dec.u32()?;
        if bin_version != BIN_TABLE_VERSION {
            return Err(ManagerError::format(format!(
                "unsupported bin table version {bin_version}"
            )));
        }

        let chunk_size = read_usize(&mut dec)?;
        let max_segment_size = read_usize(&mut dec)?;
        if !chunk_size.is_power_of_two()
            || max_segment_size < chunk_size
            || max_segment_size % chunk_size != 0
        {
            return Err(ManagerError::format(format!(
                "invalid heap geometry: chunk size {chunk_size}, maximum {max_segment_size}"
            )));
        }
        let table = BinTable::new(chunk_size, max_segment_size);
        let bin_count = read_usize(&mut dec)?;
        if bin_count != table.bin_count() {
            return Err(ManagerError::format(format!(
                "heap records {bin_count} bins, expected {}",
                table.bin_count()
            )));
        }

        let chunk_count = dec.count(5)?;
        let mut kinds = Vec::with_capacity(chunk_count);
        for index in 0..chunk_count {
            let tag = dec.u8()?;
            let value = dec.u32()?;
            let kind = ChunkKind::from_tag(tag, value).ok_or_else(|| {
                ManagerError::format(format!("invalid kind {tag} for chunk {index}"))
            })?;
            kinds.push(kind);
        }
        validate_kinds(&kinds, &table)?;

        let small_count = dec.count(32)?;
        if small_count != table.small_bin_count() {
            return Err(ManagerError::format(format!(
                "heap records {small_count} small bins, expected {}",
                table.small_bin_count()
            )));
        }
        let mut bins = Vec::with_capacity(small_count);
        for bin in 0..small_count {
            let head = dec.u64()?;
            let free_count = dec.u64()?;
            let chunk = dec.u64()?;
            let next_slot = dec.u64()?;
            let frontier = if chunk == NIL {
                None
            } else {
                let owned = usize::try_from(chunk)
                    .ok()
                    .and_then(|c| kinds.get(c))
                    .is_some_and(|&k| k == ChunkKind::Small { bin: bin as u32 });
                if !owned || next_slot > table.slots_per_chunk(bin) as u64 {
                    return Err(ManagerError::format(format!(
                        "invalid carve position for bin {bin}"
                    )));
                }
                Some(Frontier { chunk, next_slot })
            };
            bins.push(BinState {
                head,
                free_count,
                frontier,
            });
        }
        dec.finish()?;

        Ok(Self {
            chunk_size,
            max_segment_size,
            kinds,
            bins,
        })
    }
}

fn read_usize(dec: &mut Decoder<'_>) -> ManagerResult<usize> {
    usize::try_from(dec.u64()?).map_err(|_| ManagerError::format("heap value overflows usize"))
}

fn validate_kinds(kinds: &[ChunkKind], table: &BinTable) -> ManagerResult<()> {
    let mut index = 0;
    while index < kinds.len() {
        match kinds[index] {
            ChunkKind::Unused => index += 1,
            ChunkKind::Small { bin } => {
                if !table.is_small(bin as usize) {
                    return Err(ManagerError::format(format!(
                        "chunk {index} belongs to unknown bin {bin}"
                    )));
                }
                index += 1;
            }
            ChunkKind::LargeHead { chunks } => {
                let end = index + chunks as usize;
                let body_ok = end <= kinds.len()
                    && kinds[index + 1..end]
                        .iter()
                        .all(|&k| k == ChunkKind::LargeBody);
                if !body_ok {
                    return Err(ManagerError::format(format!(
                        "large object at chunk {index} is truncated"
                    )));
                }
                index = end;
            }
            ChunkKind::LargeBody => {
                return Err(ManagerError::format(format!(
                    "chunk {index} continues no large object"
                )));
            }
        }
    }
    Ok(())
}

/// Result of a full heap walk.
///
/// Every byte of the segment is counted in exactly one of
/// `small_allocated_bytes`, `free_bytes`, `uncarved_bytes`, `slack_bytes`,
/// `large_bytes` or the unused chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// Bytes covered by the chunk table.
    pub segment_bytes: u64,
    /// Number of chunks in the segment.
    pub chunk_count: u64,
    /// Chunks not owned by any bin or large object.
    pub unused_chunks: u64,
    /// Chunks owned by small bins.
    pub small_chunks: u64,
    /// Live small blocks.
    pub small_allocated_blocks: u64,
    /// Bytes in live small blocks.
    pub small_allocated_bytes: u64,
    /// Blocks on free lists.
    pub free_blocks: u64,
    /// Bytes on free lists.
    pub free_bytes: u64,
    /// Bytes in small chunks not yet carved into blocks.
    pub uncarved_bytes: u64,
    /// Bytes at the end of small chunks too short for another block.
    pub slack_bytes: u64,
    /// Live large objects.
    pub large_objects: u64,
    /// Bytes in live large objects.
    pub large_bytes: u64,
}

impl HeapReport {
    /// Bytes handed out to clients, small and large.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.small_allocated_bytes + self.large_bytes
    }
}

/// All bin locks and a read lock on the chunk table.
pub(crate) struct HeapFreeze<'a> {
    heap: &'a Heap,
    bins: Vec<MutexGuard<'a, BinState>>,
    chunks: RwLockReadGuard<'a, ChunkTable>,
}

impl HeapFreeze<'_> {
    /// Captures the allocator metadata.
    pub(crate) fn image(&self) -> HeapImage {
        HeapImage {
            chunk_size: self.heap.bins.chunk_size(),
            max_segment_size: self.heap.segment.options().max_size,
            kinds: self.chunks.kinds().to_vec(),
            bins: self.bins.iter().map(|guard| **guard).collect(),
        }
    }
}

/// The allocator over one segment.
#[derive(Debug)]
pub(crate) struct Heap {
    segment: SegmentStorage,
    bins: BinTable,
    states: Vec<Mutex<BinState>>,
    chunks: RwLock<ChunkTable>,
    free_file_space: bool,
}

impl Heap {
    /// Builds the heap from persisted metadata over an opened segment.
    pub(crate) fn new(
        segment: SegmentStorage,
        image: HeapImage,
        free_file_space: bool,
    ) -> ManagerResult<Self> {
        if segment.chunk_count() != image.kinds.len() {
            return Err(ManagerError::format(format!(
                "segment has {} chunks but the heap records {}",
                segment.chunk_count(),
                image.kinds.len()
            )));
        }
        let bins = BinTable::new(image.chunk_size, image.max_segment_size);
        Ok(Self {
            segment,
            bins,
            states: image.bins.into_iter().map(Mutex::new).collect(),
            chunks: RwLock::new(ChunkTable::from_kinds(image.kinds)),
            free_file_space,
        })
    }

    pub(crate) fn segment(&self) -> &SegmentStorage {
        &self.segment
    }

    pub(crate) fn bin_table(&self) -> &BinTable {
        &self.bins
    }

    fn chunk_size(&self) -> u64 {
        self.bins.chunk_size() as u64
    }

    /// Allocates `size` bytes aligned to `align` and returns the offset.
    pub(crate) fn allocate(&self, size: usize, align: usize) -> ManagerResult<u64> {
        if self.segment.is_read_only() {
            return Err(ManagerError::ReadOnly);
        }
        if size == 0 {
            return Err(ManagerError::invalid_argument("cannot allocate zero bytes"));
        }
        if !align.is_power_of_two() || align > self.bins.chunk_size() {
            return Err(ManagerError::invalid_argument(format!(
                "alignment {align} must be a power of two no larger than the chunk size"
            )));
        }
        let bin = self
            .bins
            .bin_for(size, align)
            .ok_or(ManagerError::OutOfMemory {
                requested: size as u64,
            })?;

        let result = if self.bins.is_small(bin) {
            self.allocate_small(bin)
        } else {
            let count = self.bins.chunks_of(bin);
            self.claim_chunks(
                count,
                ChunkKind::LargeHead {
                    chunks: count as u32,
                },
            )
            .map(|chunk| chunk as u64 * self.chunk_size())
        };

        result.map_err(|e| match e {
            ManagerError::OutOfMemory { .. } => ManagerError::OutOfMemory {
                requested: size as u64,
            },
            other => other,
        })
    }

    fn allocate_small(&self, bin: BinIndex) -> ManagerResult<u64> {
        let mut state = self.states[bin].lock();

        if state.head != NIL {
            let offset = state.head;
            let block = self.block(offset)?;
            if !block.is_free() {
                return Err(ManagerError::format(format!(
                    "free list of bin {bin} is corrupted at offset {offset}"
                )));
            }
            state.head = block.next();
            state.free_count = state.free_count.saturating_sub(1);
            block.mark_allocated();
            return Ok(offset);
        }

        let size = self.bins.size_of(bin) as u64;
        let slots = self.bins.slots_per_chunk(bin) as u64;
        let frontier = match state.frontier {
            Some(f) if f.next_slot < slots => f,
            _ => {
                let chunk = self.claim_chunks(1, ChunkKind::Small { bin: bin as u32 })?;
                trace!(bin, chunk, "bin took a new chunk");
                Frontier {
                    chunk: chunk as u64,
                    next_slot: 0,
                }
            }
        };

        let batch = (self.bins.carve_batch(bin) as u64).min(slots - frontier.next_slot);
        let first = frontier.chunk * self.chunk_size() + frontier.next_slot * size;
        state.frontier = Some(Frontier {
            chunk: frontier.chunk,
            next_slot: frontier.next_slot + batch,
        });

        for i in (1..batch).rev() {
            let offset = first + i * size;
            self.block(offset)?.mark_free(state.head);
            state.head = offset;
            state.free_count += 1;
        }
        self.block(first)?.mark_allocated();
        Ok(first)
    }

    /// Claims `count` contiguous unused chunks, growing the segment if no
    /// run is long enough.
    ///
    /// The segment grows outside the chunk-table lock; the lock is only
    /// taken to publish new chunks and claim a run.
    fn claim_chunks(&self, count: usize, kind: ChunkKind) -> ManagerResult<usize> {
        loop {
            let needed = {
                let mut chunks = self.chunks.write();
                self.publish_grown_chunks(&mut chunks)?;
                if let Some(start) = chunks.claim(count, kind) {
                    return Ok(start);
                }
                count - chunks.trailing_unused()
            };
            self.segment.extend((needed * self.bins.chunk_size()) as u64)?;
        }
    }

    /// Appends chunks the segment gained since the table last looked.
    fn publish_grown_chunks(&self, chunks: &mut ChunkTable) -> ManagerResult<()> {
        let mapped = self.segment.chunk_count();
        if mapped < chunks.len() {
            return Err(ManagerError::format(
                "segment and chunk table disagree on the segment size",
            ));
        }
        let grown = mapped - chunks.len();
        if grown > 0 {
            chunks.grow(grown);
            debug!(chunks = grown, total = chunks.len(), "grew heap");
        }
        Ok(())
    }

    /// Frees the allocation at `offset`. Returns the size of the freed block.
    pub(crate) fn deallocate(&self, offset: u64) -> ManagerResult<u64> {
        if self.segment.is_read_only() {
            return Err(ManagerError::ReadOnly);
        }
        let index = usize::try_from(offset / self.chunk_size()).unwrap_or(usize::MAX);
        let kind = self
            .chunks
            .read()
            .kind(index)
            .ok_or_else(|| ManagerError::invalid_free(offset, "offset is beyond the segment"))?;

        match kind {
            ChunkKind::Unused => Err(ManagerError::invalid_free(
                offset,
                "chunk holds no allocation",
            )),
            ChunkKind::LargeBody => Err(ManagerError::invalid_free(
                offset,
                "offset points inside a large object",
            )),
            ChunkKind::LargeHead { .. } => self.deallocate_large(offset, index),
            ChunkKind::Small { bin } => self.deallocate_small(offset, bin as usize),
        }
    }

    fn deallocate_large(&self, offset: u64, index: usize) -> ManagerResult<u64> {
        if offset % self.chunk_size() != 0 {
            return Err(ManagerError::invalid_free(
                offset,
                "offset points inside a large object",
            ));
        }

        let mut chunks = self.chunks.write();
        let Some(ChunkKind::LargeHead { chunks: count }) = chunks.kind(index) else {
            return Err(ManagerError::invalid_free(offset, "large object already freed"));
        };
        let len = u64::from(count) * self.chunk_size();

        // The range must be punched before it becomes claimable again.
        if self.free_file_space && !self.segment.free_space(offset, len) {
            trace!(offset, len, "could not release file space");
        }
        chunks.release_large(index);
        Ok(len)
    }

    fn deallocate_small(&self, offset: u64, bin: BinIndex) -> ManagerResult<u64> {
        let size = self.bins.size_of(bin) as u64;
        let slots = self.bins.slots_per_chunk(bin) as u64;
        let chunk = offset / self.chunk_size();
        let in_chunk = offset % self.chunk_size();
        if in_chunk % size != 0 || in_chunk / size >= slots {
            return Err(ManagerError::invalid_free(
                offset,
                "offset is not at a block boundary",
            ));
        }

        let mut state = self.states[bin].lock();
        if in_chunk / size >= state.carved(chunk, slots) {
            return Err(ManagerError::invalid_free(
                offset,
                "block was never allocated",
            ));
        }
        let block = self.block(offset)?;
        if block.is_free() {
            return Err(ManagerError::invalid_free(offset, "double free"));
        }
        block.mark_free(state.head);
        state.head = offset;
        state.free_count += 1;
        Ok(size)
    }

    /// Returns true if `offset` is a small block whose header carries the
    /// free tag. Only reads the header, so it works on read-only mappings.
    pub(crate) fn is_free_small_block(&self, offset: u64) -> bool {
        let index = usize::try_from(offset / self.chunk_size()).unwrap_or(usize::MAX);
        let Some(ChunkKind::Small { bin }) = self.chunks.read().kind(index) else {
            return false;
        };
        let size = self.bins.size_of(bin as usize) as u64;
        if (offset % self.chunk_size()) % size != 0 {
            return false;
        }
        let _state = self.states[bin as usize].lock();
        self.block(offset).is_ok_and(|block| block.is_free())
    }

    fn block(&self, offset: u64) -> ManagerResult<FreeBlock> {
        let addr = self.segment.translate_range(offset, HEADER_LEN)?;
        // SAFETY: the range is mapped (checked by translate_range) and every
        // block offset is a multiple of 16 from a chunk-aligned base. Callers
        // hold the owning bin's lock.
        Ok(unsafe { FreeBlock::at(addr, offset) })
    }

    /// Takes every bin lock in index order, then the chunk table.
    pub(crate) fn freeze(&self) -> HeapFreeze<'_> {
        let bins = self.states.iter().map(Mutex::lock).collect();
        HeapFreeze {
            heap: self,
            bins,
            chunks: self.chunks.read(),
        }
    }

    /// Captures the allocator metadata.
    pub(crate) fn image(&self) -> HeapImage {
        self.freeze().image()
    }

    /// Walks the chunk table and every free list and verifies that they
    /// partition the segment.
    pub(crate) fn check(&self) -> ManagerResult<HeapReport> {
        let freeze = self.freeze();
        let chunk_size = self.chunk_size();
        let table = &freeze.chunks;

        // The segment may be ahead of the table while another thread grows it.
        if table.len() > self.segment.chunk_count() {
            return Err(ManagerError::format(format!(
                "chunk table has {} chunks, segment has {}",
                table.len(),
                self.segment.chunk_count()
            )));
        }
        validate_kinds(table.kinds(), &self.bins)?;

        let mut report = HeapReport {
            segment_bytes: table.len() as u64 * chunk_size,
            chunk_count: table.len() as u64,
            ..HeapReport::default()
        };
        let mut carved_blocks = 0u64;
        let mut carved_bytes = 0u64;

        let mut index = 0;
        while index < table.len() {
            match table.kinds()[index] {
                ChunkKind::Unused => {
                    report.unused_chunks += 1;
                    index += 1;
                }
                ChunkKind::Small { bin } => {
                    let bin = bin as usize;
                    let size = self.bins.size_of(bin) as u64;
                    let slots = self.bins.slots_per_chunk(bin) as u64;
                    let carved = freeze.bins[bin].carved(index as u64, slots);
                    report.small_chunks += 1;
                    report.slack_bytes += chunk_size - slots * size;
                    report.uncarved_bytes += (slots - carved) * size;
                    carved_blocks += carved;
                    carved_bytes += carved * size;
                    index += 1;
                }
                ChunkKind::LargeHead { chunks } => {
                    report.large_objects += 1;
                    report.large_bytes += u64::from(chunks) * chunk_size;
                    index += chunks as usize;
                }
                ChunkKind::LargeBody => {
                    return Err(ManagerError::format(format!(
                        "chunk {index} continues no large object"
                    )));
                }
            }
        }

        for (bin, state) in freeze.bins.iter().enumerate() {
            let size = self.bins.size_of(bin) as u64;
            let slots = self.bins.slots_per_chunk(bin) as u64;
            if let Some(f) = state.frontier {
                let owned = usize::try_from(f.chunk)
                    .ok()
                    .and_then(|c| table.kind(c))
                    .is_some_and(|k| k == ChunkKind::Small { bin: bin as u32 });
                if !owned || f.next_slot > slots {
                    return Err(ManagerError::format(format!(
                        "bin {bin} carves from a chunk it does not own"
                    )));
                }
            }

            let mut cursor = state.head;
            let mut count = 0u64;
            while cursor != NIL {
                if count >= state.free_count {
                    return Err(ManagerError::format(format!(
                        "free list of bin {bin} is longer than its count {}",
                        state.free_count
                    )));
                }
                let chunk = cursor / chunk_size;
                let in_chunk = cursor % chunk_size;
                let owned = usize::try_from(chunk)
                    .ok()
                    .and_then(|c| table.kind(c))
                    .is_some_and(|k| k == ChunkKind::Small { bin: bin as u32 });
                if !owned
                    || in_chunk % size != 0
                    || in_chunk / size >= state.carved(chunk, slots)
                {
                    return Err(ManagerError::format(format!(
                        "free list of bin {bin} links to foreign offset {cursor}"
                    )));
                }
                let block = self.block(cursor)?;
                if !block.is_free() {
                    return Err(ManagerError::format(format!(
                        "free list of bin {bin} links to unmarked block {cursor}"
                    )));
                }
                cursor = block.next();
                count += 1;
            }
            if count != state.free_count {
                return Err(ManagerError::format(format!(
                    "free list of bin {bin} has {count} blocks, expected {}",
                    state.free_count
                )));
            }
            report.free_blocks += count;
            report.free_bytes += count * size;
        }

        report.small_allocated_blocks = carved_blocks - report.free_blocks;
        report.small_allocated_bytes = carved_bytes - report.free_bytes;

        let accounted = report.small_allocated_bytes
            + report.free_bytes
            + report.uncarved_bytes
            + report.slack_bytes
            + report.large_bytes
            + report.unused_chunks * chunk_size;
        if accounted != report.segment_bytes {
            return Err(ManagerError::format(format!(
                "heap accounts for {accounted} of {} bytes",
                report.segment_bytes
            )));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permalloc_storage::SegmentOptions;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const CHUNK: usize = 1 << 16;
    const MAX: usize = 64 * CHUNK;

    fn options(read_only: bool) -> SegmentOptions {
        SegmentOptions {
            chunk_size: CHUNK,
            max_size: MAX,
            zero_fill: false,
            read_only,
        }
    }

    fn heap() -> (TempDir, Heap) {
        let dir = tempdir().unwrap();
        let segment = SegmentStorage::create(dir.path(), options(false), 0).unwrap();
        let heap = Heap::new(segment, HeapImage::empty(CHUNK, MAX), true).unwrap();
        (dir, heap)
    }

    #[test]
    fn small_allocations_are_distinct_and_aligned() {
        let (_dir, heap) = heap();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let offset = heap.allocate(24, 8).unwrap();
            assert_eq!(offset % 16, 0);
            assert!(seen.insert(offset));
        }
        let report = heap.check().unwrap();
        assert_eq!(report.small_allocated_blocks, 200);
        assert_eq!(report.small_chunks, 1);
    }

    #[test]
    fn freed_block_is_reused() {
        let (_dir, heap) = heap();
        let a = heap.allocate(100, 8).unwrap();
        heap.deallocate(a).unwrap();
        assert_eq!(heap.allocate(100, 8).unwrap(), a);
    }

    #[test]
    fn zero_size_rejected() {
        let (_dir, heap) = heap();
        assert!(matches!(
            heap.allocate(0, 8),
            Err(ManagerError::InvalidArgument { .. })
        ));
        assert!(matches!(
            heap.allocate(8, 3),
            Err(ManagerError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn large_allocations_take_chunk_runs() {
        let (_dir, heap) = heap();
        let small = heap.allocate(16, 8).unwrap();
        let large = heap.allocate(CHUNK + 1, 8).unwrap();
        assert_eq!(large % CHUNK as u64, 0);
        assert_ne!(large / CHUNK as u64, small / CHUNK as u64);

        let report = heap.check().unwrap();
        assert_eq!(report.large_objects, 1);
        assert_eq!(report.large_bytes, 2 * CHUNK as u64);

        assert_eq!(heap.deallocate(large).unwrap(), 2 * CHUNK as u64);
        let report = heap.check().unwrap();
        assert_eq!(report.large_objects, 0);
        assert_eq!(report.unused_chunks, 2);
    }

    #[test]
    fn freed_runs_are_reused_first_fit() {
        let (_dir, heap) = heap();
        let a = heap.allocate(2 * CHUNK, 8).unwrap();
        let _b = heap.allocate(CHUNK, 8).unwrap();
        heap.deallocate(a).unwrap();

        assert_eq!(heap.allocate(CHUNK, 8).unwrap(), a);
        assert_eq!(heap.allocate(CHUNK, 8).unwrap(), a + CHUNK as u64);
    }

    #[test]
    fn invalid_frees_detected() {
        let (_dir, heap) = heap();
        let small = heap.allocate(32, 8).unwrap();
        let large = heap.allocate(3 * CHUNK, 8).unwrap();

        let cases = [
            small + 8,
            small + 32 * 200,
            large + CHUNK as u64,
            large + 16,
            MAX as u64 * 2,
        ];
        for offset in cases {
            assert!(
                matches!(heap.deallocate(offset), Err(ManagerError::InvalidFree { .. })),
                "offset {offset} accepted"
            );
        }

        heap.deallocate(small).unwrap();
        assert!(matches!(
            heap.deallocate(small),
            Err(ManagerError::InvalidFree { .. })
        ));
        heap.deallocate(large).unwrap();
        assert!(matches!(
            heap.deallocate(large),
            Err(ManagerError::InvalidFree { .. })
        ));
        heap.check().unwrap();
    }

    #[test]
    fn out_of_memory_reports_request() {
        let (_dir, heap) = heap();
        assert!(matches!(
            heap.allocate(MAX + 1, 8),
            Err(ManagerError::OutOfMemory { requested }) if requested == MAX as u64 + 1
        ));

        heap.allocate(MAX - CHUNK, 8).unwrap();
        heap.allocate(16, 8).unwrap();
        assert!(matches!(
            heap.allocate(CHUNK, 8),
            Err(ManagerError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn alignment_respected() {
        let (_dir, heap) = heap();
        for align in [16, 64, 256, 4096] {
            let offset = heap.allocate(40, align).unwrap();
            assert_eq!(offset % align as u64, 0, "align {align}");
        }
    }

    #[test]
    fn image_round_trip_restores_state() {
        let dir = tempdir().unwrap();
        let (a, b, image) = {
            let segment = SegmentStorage::create(dir.path(), options(false), 0).unwrap();
            let heap = Heap::new(segment, HeapImage::empty(CHUNK, MAX), false).unwrap();
            let a = heap.allocate(48, 8).unwrap();
            let b = heap.allocate(5000, 8).unwrap();
            heap.deallocate(a).unwrap();
            heap.segment().flush_all().unwrap();
            (a, b, heap.image())
        };

        let decoded = HeapImage::decode(&image.encode()).unwrap();
        assert_eq!(decoded, image);

        let segment =
            SegmentStorage::open(dir.path(), options(false), decoded.kinds.len()).unwrap();
        let heap = Heap::new(segment, decoded, false).unwrap();
        heap.check().unwrap();
        assert_eq!(heap.allocate(48, 8).unwrap(), a);
        heap.deallocate(b).unwrap();
        heap.check().unwrap();
    }

    #[test]
    fn corrupt_image_rejected() {
        let (_dir, heap) = heap();
        heap.allocate(64, 8).unwrap();
        let mut bytes = heap.image().encode();
        bytes[12] ^= 1;
        assert!(matches!(
            HeapImage::decode(&bytes),
            Err(ManagerError::Format { .. })
        ));
    }

    #[test]
    fn inconsistent_kinds_rejected() {
        let mut image = HeapImage::empty(CHUNK, MAX);
        image.kinds = vec![ChunkKind::LargeHead { chunks: 3 }, ChunkKind::LargeBody];
        assert!(HeapImage::decode(&image.encode()).is_err());

        image.kinds = vec![ChunkKind::LargeBody];
        assert!(HeapImage::decode(&image.encode()).is_err());
    }

    #[test]
    fn read_only_heap_refuses_changes() {
        let dir = tempdir().unwrap();
        {
            let segment = SegmentStorage::create(dir.path(), options(false), 0).unwrap();
            let heap = Heap::new(segment, HeapImage::empty(CHUNK, MAX), false).unwrap();
            heap.allocate(16, 8).unwrap();
        }
        let mut image = HeapImage::empty(CHUNK, MAX);
        image.kinds = vec![ChunkKind::Small { bin: 0 }];
        image.bins[0].frontier = Some(Frontier {
            chunk: 0,
            next_slot: 1,
        });

        let segment = SegmentStorage::open(dir.path(), options(true), 1).unwrap();
        let heap = Heap::new(segment, image, false).unwrap();
        assert!(matches!(heap.allocate(16, 8), Err(ManagerError::ReadOnly)));
        assert!(matches!(heap.deallocate(0), Err(ManagerError::ReadOnly)));
        assert_eq!(heap.check().unwrap().small_allocated_blocks, 1);
    }

    #[test]
    fn concurrent_bins_do_not_interfere() {
        let (_dir, heap) = heap();
        let heap = Arc::new(heap);
        let sizes = [16usize, 48, 200, 1000];

        let handles: Vec<_> = sizes
            .iter()
            .map(|&size| {
                let heap = Arc::clone(&heap);
                std::thread::spawn(move || {
                    let mut live = Vec::new();
                    for round in 0..500 {
                        live.push(heap.allocate(size, 8).unwrap());
                        if round % 3 == 0 {
                            let offset = live.swap_remove(round % live.len());
                            heap.deallocate(offset).unwrap();
                        }
                    }
                    live
                })
            })
            .collect();

        let mut all = HashSet::new();
        let mut live_count = 0;
        for handle in handles {
            for offset in handle.join().unwrap() {
                assert!(all.insert(offset));
                live_count += 1;
            }
        }
        let report = heap.check().unwrap();
        assert_eq!(report.small_allocated_blocks, live_count);
    }

    #[test]
    fn growth_races_publish_every_chunk() {
        let (_dir, heap) = heap();
        let heap = Arc::new(heap);
        let small = heap.allocate(64, 8).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = Arc::clone(&heap);
                std::thread::spawn(move || {
                    (0..5)
                        .map(|_| heap.allocate(CHUNK + 1, 8).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for round in 0..200 {
            let offset = heap.allocate(64, 8).unwrap();
            if round % 2 == 0 {
                heap.deallocate(offset).unwrap();
            }
        }

        let mut starts: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        starts.sort_unstable();
        for pair in starts.windows(2) {
            assert!(pair[0] + 2 * CHUNK as u64 <= pair[1]);
        }
        heap.deallocate(small).unwrap();

        let report = heap.check().unwrap();
        assert_eq!(report.large_objects, 20);
        assert_eq!(report.chunk_count as usize, heap.segment().chunk_count());
    }
}
