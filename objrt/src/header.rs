use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use bitflags::bitflags;

/// Every block handed out by the arena is aligned to this, and every size is
/// rounded up to it. The low four bits of any managed pointer are zero.
pub const ALIGNMENT: usize = 16;

/// Mark byte written into freshly allocated objects. The collector never
/// uses it as a generation marker.
pub const MARKER_AT_CREATION: u8 = 0;

/// First word of a free block. It is odd, so it can never be confused with a
/// map pointer (those are word aligned and non null).
pub const FREE_MARKER: usize = 0xF4EE_B10C_u32 as usize | 1;

const MARK_MASK: u32 = 0xFF;

#[inline(always)]
pub const fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

#[inline(always)]
pub const fn is_aligned(value: usize) -> bool {
    value & (ALIGNMENT - 1) == 0
}

bitflags! {
    /// Kind and bookkeeping bits stored above the mark byte.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// finalizer already ran
        const COLLECTED = 1 << 8;
        /// object must never be collected
        const FIXED = 1 << 9;
        const ARRAY = 1 << 10;
        const STRING = 1 << 11;
        /// size is computed by the type, not read from the window
        const DYNAMIC = Self::ARRAY.bits() | Self::STRING.bits();
    }
}

/// The 16-byte header at the start of every managed object.
///
/// ```text
/// word 0:      map pointer (anchor slot of the type's window)
/// bytes 0..1:  mark byte (generation that last reached the object)
/// bytes 1..4:  ObjectFlags
/// bytes 4..8:  reserved
/// ```
#[repr(C, align(16))]
pub struct ObjectHeader {
    map: *const usize,
    flags: AtomicU32,
    _reserved: u32,
}

const _: () = assert!(size_of::<ObjectHeader>() == ALIGNMENT);

pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();

impl ObjectHeader {
    pub fn new(map: *const usize, flags: ObjectFlags) -> Self {
        Self {
            map,
            flags: AtomicU32::new(flags.bits() | MARKER_AT_CREATION as u32),
            _reserved: 0,
        }
    }

    #[inline(always)]
    pub fn map(&self) -> *const usize {
        self.map
    }

    #[inline(always)]
    pub fn mark(&self) -> u8 {
        (self.flags.load(Ordering::Relaxed) & MARK_MASK) as u8
    }

    #[inline(always)]
    pub fn set_mark(&self, mark: u8) {
        let word = self.flags.load(Ordering::Relaxed);
        self.flags
            .store((word & !MARK_MASK) | mark as u32, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn add_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn has_dynamic_size(&self) -> bool {
        self.flags().intersects(ObjectFlags::DYNAMIC)
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("map", &self.map)
            .field("mark", &self.mark())
            .field("flags", &self.flags())
            .finish()
    }
}

pub const NO_BLOCK: u32 = u32::MAX;

/// Header written in place at the start of every free block. Links are
/// offsets from the arena base.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct FreeBlock {
    pub marker: usize,
    pub next: u32,
    pub size: u32,
}

const _: () = assert!(size_of::<FreeBlock>() == ALIGNMENT);

impl FreeBlock {
    pub fn new(size: usize, next: u32) -> Self {
        debug_assert!(is_aligned(size) && size >= ALIGNMENT);
        debug_assert!(size <= u32::MAX as usize);
        Self {
            marker: FREE_MARKER,
            next,
            size: size as u32,
        }
    }
}

/// What the first word of an arena block says it is.
#[derive(Debug, Clone, Copy)]
pub enum Block {
    Free(NonNull<FreeBlock>),
    Object(ObjectRef),
}

impl Block {
    /// # Safety
    /// `ptr` must be the start of a block inside the used part of the arena.
    #[inline]
    pub unsafe fn classify(ptr: NonNull<u8>) -> Block {
        debug_assert!(is_aligned(ptr.as_ptr() as usize));
        // SAFETY: every used block starts with at least one readable word
        let word = unsafe { ptr.cast::<usize>().read() };
        if word == FREE_MARKER {
            let block = ptr.cast::<FreeBlock>();
            debug_assert!(
                // SAFETY: marker matched, the rest of the header is ours
                unsafe { is_aligned(block.as_ref().size as usize) },
                "free block with misaligned size"
            );
            Block::Free(block)
        } else {
            debug_assert!(
                word != 0 && word % align_of::<usize>() == 0,
                "object header with invalid map pointer {word:#x}"
            );
            // SAFETY: not free, so it is an object header
            Block::Object(unsafe { ObjectRef::from_raw(ptr) })
        }
    }
}

/// Reference to a managed object. Copyable, does not keep anything alive on
/// its own; only roots and tracing do.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

// SAFETY: a plain address; all access goes through unsafe methods or the
// atomic header word
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// # Safety
    /// `ptr` must point at a written object header.
    #[inline(always)]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    /// # Safety
    /// `addr` must be zero or the address of a written object header.
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut ObjectHeader).map(Self)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline(always)]
    pub fn as_non_null(self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline(always)]
    pub fn header(&self) -> &ObjectHeader {
        // SAFETY: construction guarantees a header lives here
        unsafe { self.0.as_ref() }
    }

    /// Start of the bytes following the header.
    #[inline(always)]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: every object is at least one header long
        unsafe { self.as_non_null().add(HEADER_SIZE) }
    }

    /// # Safety
    /// `offset` (relative to the payload) must be in bounds and hold a `T`.
    #[inline(always)]
    pub unsafe fn read<T: Copy>(self, offset: usize) -> T {
        unsafe { self.payload().add(offset).cast::<T>().read_unaligned() }
    }

    /// # Safety
    /// `offset` (relative to the payload) must be in bounds for a `T`.
    #[inline(always)]
    pub unsafe fn write<T>(self, offset: usize, value: T) {
        unsafe { self.payload().add(offset).cast::<T>().write_unaligned(value) }
    }

    /// # Safety
    /// `offset` must hold a reference field of this object.
    #[inline(always)]
    pub unsafe fn read_ref(self, offset: usize) -> Option<ObjectRef> {
        let addr = unsafe { self.read::<usize>(offset) };
        // SAFETY: reference fields only ever hold object addresses or zero
        unsafe { ObjectRef::from_addr(addr) }
    }

    /// # Safety
    /// `offset` must be a reference field of this object.
    #[inline(always)]
    pub unsafe fn write_ref(self, offset: usize, value: Option<ObjectRef>) {
        unsafe { self.write::<usize>(offset, value.map_or(0, ObjectRef::addr)) }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Slab([u8; 64]);

    #[test]
    fn mark_byte_is_independent_of_flags() {
        let slot = 0usize;
        let header = ObjectHeader::new(&slot, ObjectFlags::ARRAY);
        assert_eq!(header.mark(), MARKER_AT_CREATION);

        header.set_mark(200);
        assert_eq!(header.mark(), 200);
        assert_eq!(header.flags(), ObjectFlags::ARRAY);
        assert!(header.has_dynamic_size());

        header.add_flags(ObjectFlags::COLLECTED);
        assert_eq!(header.mark(), 200);
        assert!(header.flags().contains(ObjectFlags::COLLECTED));
    }

    #[test]
    fn free_marker_never_looks_like_a_map_pointer() {
        assert_eq!(FREE_MARKER & 1, 1);
    }

    #[test]
    fn classify_distinguishes_free_and_object() {
        let mut slab = Slab([0; 64]);
        let base = NonNull::new(slab.0.as_mut_ptr()).unwrap();
        let slot = 7usize;

        unsafe {
            base.cast::<FreeBlock>().write(FreeBlock::new(32, NO_BLOCK));
            base.add(32)
                .cast::<ObjectHeader>()
                .write(ObjectHeader::new(&slot, ObjectFlags::empty()));

            match Block::classify(base) {
                Block::Free(block) => assert_eq!(block.as_ref().size, 32),
                Block::Object(_) => panic!("expected a free block"),
            }
            match Block::classify(base.add(32)) {
                Block::Object(obj) => {
                    assert_eq!(obj.header().map(), &slot as *const usize)
                }
                Block::Free(_) => panic!("expected an object"),
            }
        }
    }

    #[test]
    fn payload_fields_round_trip() {
        let mut slab = Slab([0; 64]);
        let base = NonNull::new(slab.0.as_mut_ptr()).unwrap();
        let slot = 7usize;
        unsafe {
            base.cast::<ObjectHeader>()
                .write(ObjectHeader::new(&slot, ObjectFlags::empty()));
            let obj = ObjectRef::from_raw(base);
            obj.write::<u64>(0, 0xdead_beef);
            obj.write_ref(8, Some(obj));
            assert_eq!(obj.read::<u64>(0), 0xdead_beef);
            assert_eq!(obj.read_ref(8), Some(obj));
            obj.write_ref(8, None);
            assert_eq!(obj.read_ref(8), None);
        }
    }
}
