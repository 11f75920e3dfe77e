//! Fence-synchronised ring allocator for streamed GPU data.
//!
//! Vertices, uniforms and VRAM write payloads are written into persistent
//! ring buffers. The ring is split into [`NUM_SYNC_POINTS`] blocks; once the
//! write position moves past a block a fence is inserted for it, and before
//! a block is written again on the next lap its fence is waited on. The GPU
//! therefore never reads data that the CPU is overwriting.
//!
//! [`StreamBuffer`] only does the bookkeeping. The storage and the fence
//! primitive belong to the backend, through [`FenceOps`].

use emu_core::logging::{log, LogCategory, LogLevel};

pub const NUM_SYNC_POINTS: usize = 16;

/// Fence primitive of a backend
pub trait FenceOps {
    type Fence;

    /// Insert a fence after all work submitted so far
    fn insert(&mut self) -> Self::Fence;

    /// Block until the fence has signalled, then release it
    fn wait(&mut self, fence: Self::Fence);
}

/// Contiguous space handed out by [`StreamBuffer::map`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Byte offset into the buffer
    pub offset: u32,
    /// Bytes available from `offset` to the end of the buffer
    pub space: u32,
    /// `offset / alignment`, for indexing elements of that size
    pub index_aligned: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub maps: u64,
    pub wraps: u64,
    pub fence_waits: u64,
}

pub struct StreamBuffer<F> {
    size: u32,
    position: u32,
    mapped_size: u32,
    bytes_per_block: u32,
    fences: Vec<Option<F>>,
    /// Blocks below this index were fenced in the current lap
    used_block: usize,
    /// Blocks below this index are safe to write in the current lap
    available_block: usize,
    stats: StreamStats,
}

impl<F> StreamBuffer<F> {
    pub fn new(size: u32) -> Self {
        let size = size.max(NUM_SYNC_POINTS as u32);
        Self {
            size,
            position: 0,
            mapped_size: 0,
            bytes_per_block: size.div_ceil(NUM_SYNC_POINTS as u32),
            fences: (0..NUM_SYNC_POINTS).map(|_| None).collect(),
            used_block: 0,
            available_block: 0,
            stats: StreamStats::default(),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    fn block_for_offset(&self, offset: u32) -> usize {
        (offset / self.bytes_per_block) as usize
    }

    /// Reserve at least `min_size` contiguous bytes aligned to `alignment`.
    /// Returns `None` when the request can never fit.
    pub fn map<O>(&mut self, ops: &mut O, alignment: u32, min_size: u32) -> Option<Mapping>
    where
        O: FenceOps<Fence = F>,
    {
        let alignment = alignment.max(1);
        if min_size > self.size {
            return None;
        }
        if self.position > 0 {
            self.position = self.position.div_ceil(alignment) * alignment;
        }

        self.fence_written_blocks(ops, self.position);
        if self.position + min_size > self.size {
            // Everything up to the end was written this lap
            self.fence_written_blocks(ops, self.size);
            self.position = 0;
            self.used_block = 0;
            self.available_block = 0;
            self.stats.wraps += 1;
            log(LogCategory::Sync, LogLevel::Trace, || {
                format!("stream buffer of {} bytes wrapped", self.size)
            });
        }
        self.wait_for_blocks(ops, self.position + min_size);

        self.stats.maps += 1;
        self.mapped_size = min_size;
        Some(Mapping {
            offset: self.position,
            space: self.size - self.position,
            index_aligned: self.position / alignment,
        })
    }

    /// Commit `used` bytes of the last mapping
    pub fn unmap(&mut self, used: u32) {
        debug_assert!(used <= self.size - self.position);
        self.position += used.min(self.size - self.position);
        self.mapped_size = 0;
    }

    /// Wait for every outstanding fence, e.g. before destroying the buffer
    pub fn wait_all<O>(&mut self, ops: &mut O)
    where
        O: FenceOps<Fence = F>,
    {
        for slot in self.fences.iter_mut() {
            if let Some(fence) = slot.take() {
                ops.wait(fence);
            }
        }
    }

    fn fence_written_blocks<O>(&mut self, ops: &mut O, offset: u32)
    where
        O: FenceOps<Fence = F>,
    {
        let end = self.block_for_offset(offset).min(NUM_SYNC_POINTS);
        while self.used_block < end {
            // A fence from the previous lap that was never waited on has
            // long signalled; release it before replacing it.
            if let Some(stale) = self.fences[self.used_block].take() {
                ops.wait(stale);
            }
            self.fences[self.used_block] = Some(ops.insert());
            self.used_block += 1;
        }
    }

    fn wait_for_blocks<O>(&mut self, ops: &mut O, offset: u32)
    where
        O: FenceOps<Fence = F>,
    {
        let end = (self.block_for_offset(offset.saturating_sub(1)) + 1).min(NUM_SYNC_POINTS);
        while self.available_block < end {
            if let Some(fence) = self.fences[self.available_block].take() {
                self.stats.fence_waits += 1;
                ops.wait(fence);
            }
            self.available_block += 1;
        }
    }
}

/// Fence ops for backends whose work completes synchronously
#[derive(Debug, Default)]
pub struct ImmediateFences {
    pub inserted: u64,
}

impl FenceOps for ImmediateFences {
    type Fence = u64;

    fn insert(&mut self) -> u64 {
        self.inserted += 1;
        self.inserted
    }

    fn wait(&mut self, _fence: u64) {}
}
