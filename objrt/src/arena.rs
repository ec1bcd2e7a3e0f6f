use std::ptr::NonNull;

use crate::{
    ALIGNMENT, Block, FreeBlock, NO_BLOCK, align_up, is_aligned, map_memory,
    system::page_align, unmap_memory,
};

/// Allocations up to this size carve their leftovers into the medium cache
/// instead of pushing them back into the bins.
pub const SMALL_SIZE_BIN: usize = 1024;

/// One bin per bit length, bin `i` holds blocks of `[2^i, 2^(i+1))` bytes.
pub const BIN_COUNT: usize = 32;

/// Largest arena the free block encoding can describe.
pub const MAX_ARENA_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

/// Memory backing the arena.
#[derive(Debug)]
pub enum MainBuffer {
    /// mapped by us, unmapped on drop
    Mapped { ptr: NonNull<u8>, size: usize },
    /// owned by the host, must outlive the arena
    External { ptr: NonNull<u8>, size: usize },
}

// SAFETY: the buffer is exclusively owned by whoever holds this value
unsafe impl Send for MainBuffer {}

impl MainBuffer {
    pub fn map(size: usize) -> Option<Self> {
        let ptr = map_memory(page_align(size))?;
        Some(Self::Mapped { ptr, size })
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes for as long
    /// as the arena using it lives, and nothing else may touch it meanwhile.
    pub unsafe fn external(ptr: NonNull<u8>, size: usize) -> Self {
        Self::External { ptr, size }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        match *self {
            Self::Mapped { ptr, .. } | Self::External { ptr, .. } => ptr,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            Self::Mapped { size, .. } | Self::External { size, .. } => size,
        }
    }
}

impl Drop for MainBuffer {
    fn drop(&mut self) {
        if let Self::Mapped { ptr, size } = *self {
            unmap_memory(ptr, page_align(size));
        }
    }
}

/// Leftover of a recycled block, consumed front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub size: usize,
}

/// Segregated-fit allocator over one contiguous buffer.
///
/// `[0, bump)` is fully tiled by object headers and free block headers,
/// `[bump, capacity)` has never been handed out (or was given back by the
/// sweep). Free blocks are kept in power-of-two bins; one leftover block may
/// sit in the medium cache, outside the bins and without a header.
pub struct Arena {
    buffer: MainBuffer,
    capacity: usize,
    bump: usize,
    bins: [u32; BIN_COUNT],
    medium: Option<Span>,
}

#[inline(always)]
fn floor_bin(size: usize) -> usize {
    ((usize::BITS - 1 - size.leading_zeros()) as usize).min(BIN_COUNT - 1)
}

#[inline(always)]
fn ceil_bin(size: usize) -> usize {
    let floor = floor_bin(size);
    if size.is_power_of_two() {
        floor
    } else {
        (floor + 1).min(BIN_COUNT - 1)
    }
}

impl Arena {
    /// Takes over `buffer`. The usable capacity is its length rounded down to
    /// the alignment and capped at [`MAX_ARENA_SIZE`].
    pub fn new(buffer: MainBuffer, debug_fill: Option<u8>) -> Self {
        debug_assert!(is_aligned(buffer.ptr().as_ptr() as usize));
        let capacity = buffer.len().min(MAX_ARENA_SIZE) & !(ALIGNMENT - 1);
        if let Some(pattern) = debug_fill {
            // SAFETY: the buffer is at least capacity bytes long
            unsafe { buffer.ptr().as_ptr().write_bytes(pattern, capacity) };
        }
        Self {
            buffer,
            capacity,
            bump: 0,
            bins: [NO_BLOCK; BIN_COUNT],
            medium: None,
        }
    }

    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.buffer.ptr()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset of the bump pointer, i.e. the size of the used range.
    #[inline(always)]
    pub fn bump(&self) -> usize {
        self.bump
    }

    pub fn medium_cache(&self) -> Option<Span> {
        self.medium
    }

    #[inline(always)]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset is inside the buffer
        unsafe { self.base().add(offset) }
    }

    #[inline(always)]
    pub fn offset_of(&self, ptr: *const u8) -> usize {
        ptr as usize - self.base().as_ptr() as usize
    }

    /// True if `addr` lies in the used range `[base, bump)`.
    #[inline(always)]
    pub fn contains_allocated(&self, addr: usize) -> bool {
        let base = self.base().as_ptr() as usize;
        addr >= base && addr < base + self.bump
    }

    /// True if `addr` lies anywhere inside the buffer.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base().as_ptr() as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Classifies the block starting at `offset`.
    ///
    /// # Safety
    /// `offset` must be a block boundary below the bump pointer.
    #[inline(always)]
    pub unsafe fn block_at(&self, offset: usize) -> Block {
        debug_assert!(offset < self.bump);
        unsafe { Block::classify(self.ptr_at(offset)) }
    }

    /// Finds a block of at least `size` bytes. Returns `None` when the
    /// medium cache, the bins and the untouched tail are all exhausted; the
    /// caller decides what recovery to attempt.
    pub fn try_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let aligned = align_up(size.max(ALIGNMENT));
        let offset = self
            .take_medium(aligned)
            .or_else(|| self.take_recycled(aligned))
            .or_else(|| self.take_bump(aligned))
            .or_else(|| self.take_from_bins(aligned))?;
        Some(self.ptr_at(offset))
    }

    /// Returns a block to the bins. `ptr` must have come from this arena and
    /// `size` must be the size it was requested with.
    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(is_aligned(ptr.as_ptr() as usize));
        debug_assert!(self.contains_allocated(ptr.as_ptr() as usize));
        let offset = self.offset_of(ptr.as_ptr());
        self.free_span(offset, align_up(size.max(ALIGNMENT)));
    }

    /// Writes a free header at `offset` and pushes it onto the bin of the
    /// floor of its bit length, so the bin's minimum size always fits.
    pub fn free_span(&mut self, offset: usize, size: usize) {
        let bin = floor_bin(size);
        self.write_free_header(offset, size, self.bins[bin]);
        self.bins[bin] = offset as u32;
    }

    /// Writes a free header that is not linked into any bin. The sweep uses
    /// this for dead objects inside a run it will link as a whole.
    pub fn write_free_header(&mut self, offset: usize, size: usize, next: u32) {
        debug_assert!(is_aligned(offset) && is_aligned(size));
        debug_assert!(offset + size <= self.capacity);
        // SAFETY: offset..offset+size is inside the buffer and not live
        unsafe {
            self.ptr_at(offset)
                .cast::<FreeBlock>()
                .write(FreeBlock::new(size, next))
        };
    }

    /// Flushes the medium cache into the bins.
    pub fn reconcile_medium(&mut self) {
        if let Some(span) = self.medium.take() {
            if span.size != 0 {
                self.free_span(span.offset, span.size);
            }
        }
    }

    /// Forgets every bin. Only valid right before a sweep rebuilds them.
    pub fn clear_bins(&mut self) {
        debug_assert!(self.medium.is_none(), "medium cache not reconciled");
        self.bins = [NO_BLOCK; BIN_COUNT];
    }

    /// Moves the bump pointer back to `offset`. Everything above it becomes
    /// untouched tail again.
    pub fn retract_bump(&mut self, offset: usize) {
        debug_assert!(is_aligned(offset) && offset <= self.bump);
        self.bump = offset;
    }

    /// Bytes currently linked in the bins.
    pub fn binned_bytes(&self) -> usize {
        self.bins
            .iter()
            .map(|&head| {
                let mut total = 0;
                let mut cursor = head;
                while cursor != NO_BLOCK {
                    let block = self.free_block(cursor);
                    total += block.size as usize;
                    cursor = block.next;
                }
                total
            })
            .sum()
    }

    #[inline(always)]
    fn free_block(&self, offset: u32) -> &FreeBlock {
        // SAFETY: bins only hold offsets of written free headers
        unsafe { self.ptr_at(offset as usize).cast::<FreeBlock>().as_ref() }
    }

    fn take_medium(&mut self, aligned: usize) -> Option<usize> {
        let span = self.medium?;
        if span.size < aligned {
            self.reconcile_medium();
            return None;
        }
        let rest = span.size - aligned;
        self.medium = (rest != 0).then_some(Span {
            offset: span.offset + aligned,
            size: rest,
        });
        Some(span.offset)
    }

    /// O(1) probe of the head of the request's own size class. A block freed
    /// with the same size is found here before the tail grows.
    fn take_recycled(&mut self, aligned: usize) -> Option<usize> {
        let bin = floor_bin(aligned);
        self.pop_if_fits(bin, aligned)
    }

    fn take_bump(&mut self, aligned: usize) -> Option<usize> {
        if self.capacity - self.bump < aligned {
            return None;
        }
        let offset = self.bump;
        self.bump += aligned;
        Some(offset)
    }

    /// First fit across size classes, scanning upward from the smallest
    /// class guaranteed to hold the request.
    fn take_from_bins(&mut self, aligned: usize) -> Option<usize> {
        (ceil_bin(aligned)..BIN_COUNT).find_map(|bin| self.pop_if_fits(bin, aligned))
    }

    fn pop_if_fits(&mut self, bin: usize, aligned: usize) -> Option<usize> {
        let head = self.bins[bin];
        if head == NO_BLOCK {
            return None;
        }
        let block = self.free_block(head);
        let (size, next) = (block.size as usize, block.next);
        if size < aligned {
            return None;
        }
        self.bins[bin] = next;

        let offset = head as usize;
        let rest = size - aligned;
        if rest != 0 {
            if aligned <= SMALL_SIZE_BIN {
                self.reconcile_medium();
                self.medium = Some(Span {
                    offset: offset + aligned,
                    size: rest,
                });
            } else {
                self.free_span(offset + aligned, rest);
            }
        }
        Some(offset)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base())
            .field("capacity", &self.capacity)
            .field("bump", &self.bump)
            .field("medium", &self.medium)
            .finish()
    }
}
