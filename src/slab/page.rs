//! Per-page descriptor records.
//!
//! One [`PageDesc`] per physical page lives in the descriptor table at the
//! front of the region. The record is shared state: `#[repr(C)]` throughout,
//! links are page *indices* rather than pointers, so a process may map the
//! region at any base address.
//!
//! List conventions:
//! - A class page (`Exact`/`Big`/`Small`) is linked into its size class's
//!   slot list iff it has at least one free chunk. Membership is never read
//!   back from the links; it is derived from occupancy.
//! - A free run's head is linked into the pool's free-run list and carries
//!   the run length in its tag. Interior pages carry `run == 0`, and the
//!   *last* page of a multi-page run stores the head's index in `prev` so
//!   backward coalescing can locate the head in O(1).

/// Sentinel page index marking the end of a list (or an unlinked page).
pub(crate) const NIL_PAGE: u32 = u32::MAX;

/// What a page currently holds. Exactly one tag at all times; transitions
/// happen only inside `alloc`/`free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, u8)]
pub(crate) enum PageTag {
    /// Part of an unallocated run. `run > 0` only at the run head.
    Free { run: u32 },
    /// First page of an in-use multi-page allocation; only the head records
    /// the length.
    RunHead { len: u32 },
    /// Interior page of an in-use multi-page allocation.
    RunBody,
    /// Chunk count is exactly one word of bits; the occupancy bitmap is the
    /// descriptor word itself.
    Exact { bitmap: u64 },
    /// Chunk count fits in fewer bits than a word; bitmap and size shift
    /// co-reside in the descriptor.
    Big { shift: u32, bitmap: u32 },
    /// Chunk count exceeds one word of bits; the occupancy bitmap lives in
    /// the page's own leading chunks, which are permanently reserved.
    Small { shift: u32 },
}

/// Descriptor for one physical page: tag plus doubly-linked list position.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct PageDesc {
    pub tag: PageTag,
    pub prev: u32,
    pub next: u32,
}

// The descriptor table layout is shared between processes; keep the record
// at a fixed, predictable size.
const _: () = assert!(size_of::<PageDesc>() == 24);
const _: () = assert!(align_of::<PageDesc>() == 8);

impl PageDesc {
    /// A detached descriptor with the given tag.
    #[inline]
    pub const fn detached(tag: PageTag) -> Self {
        Self { tag, prev: NIL_PAGE, next: NIL_PAGE }
    }

    /// Interior page of a free run (length lives at the head).
    #[inline]
    pub const fn free_interior() -> Self {
        Self::detached(PageTag::Free { run: 0 })
    }

    /// Length of the free run headed here, or `None` if this page is not a
    /// free-run head.
    #[inline]
    pub fn free_run_len(&self) -> Option<u32> {
        match self.tag {
            PageTag::Free { run } if run > 0 => Some(run),
            _ => None,
        }
    }
}
