//! The slab pool: size-class chunk allocation and page-run management over
//! a caller-supplied region.
//!
//! Region layout, produced once by [`SlabPool::init`] and adopted by
//! [`SlabPool::attach`]:
//!
//! ```text
//! [PoolHeader][slot heads: u32 × n_slots][ClassStats × n_slots]
//! [PageDesc × n_pages][pad to page_size][arena: page_size × n_pages]
//! ```
//!
//! Everything before the arena is bookkeeping; everything in it is handed
//! out. All of it lives in the region and is expressed in offsets and page
//! indices, so any process may attach at any base address.
//!
//! # Locking
//!
//! The pool is not internally synchronized. Mutating methods take
//! `&mut self`: exclusive access *is* the caller's lock. Contexts sharing a
//! region serialize every mutating call under one external mutual-exclusion
//! lock; within a single process [`SharedSlabPool`] provides that lock as a
//! plain mutex.

use std::ptr::NonNull;
use std::sync::Mutex;

use fixedbitset::FixedBitSet;

use super::classify::{Geometry, Regime, WORD_BITS};
use super::diag::{DiagnosticSink, Severity, SlabError};
use super::page::{NIL_PAGE, PageDesc, PageTag};
use super::region;
use super::stats::{ClassStats, PoolUsage};

/// Value of `PoolHeader::ready` once `init` has finished layout. Written
/// last, so a half-initialized region never attaches.
const READY: u32 = 0x51ab;

/// Pool-wide state at the very front of the region.
#[repr(C)]
struct PoolHeader {
    ready: u32,
    min_shift: u32,
    page_shift: u32,
    n_slots: u32,
    n_pages: u32,
    /// Report exhaustion through the diagnostic sink while non-zero.
    /// Shared by every attached context, like the rest of the header.
    log_nomem: u32,
    region_len: u64,
    /// Arena start, as a byte offset from the region base.
    start: u64,
    /// Head of the free-run list.
    free: u32,
    _pad: u32,
    /// Pages currently in free runs.
    pfree: u64,
}

const _: () = assert!(size_of::<PoolHeader>() == 56);

/// Pool construction parameters. Both sizes must be powers of two.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Smallest chunk ever handed out; requests round up to it. At least 8.
    pub min_chunk_size: usize,
    /// Bookkeeping granule of the arena.
    pub page_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { min_chunk_size: 8, page_size: region::os_page_size() }
    }
}

/// Byte offsets of the pool tables, derived deterministically from the
/// geometry and region length so `attach` can reproduce them.
struct RegionLayout {
    slots_off: usize,
    stats_off: usize,
    pages_off: usize,
    start_off: usize,
    n_pages: usize,
}

fn compute_layout(region_len: usize, geo: &Geometry) -> Result<RegionLayout, SlabError> {
    let page_size = geo.page_size();
    let slots_off = size_of::<PoolHeader>();
    let slots_end = slots_off + geo.n_slots * size_of::<u32>();
    let stats_off = slots_end.next_multiple_of(align_of::<ClassStats>());
    let pages_off = stats_off + geo.n_slots * size_of::<ClassStats>();

    let needed = pages_off + size_of::<PageDesc>() + 2 * page_size;
    if region_len < pages_off + size_of::<PageDesc>() + page_size {
        return Err(SlabError::RegionTooSmall { len: region_len, needed });
    }

    // Each page costs its own bytes plus one descriptor.
    let avail = region_len - pages_off;
    let n = avail / (page_size + size_of::<PageDesc>());
    let start_off = (pages_off + n * size_of::<PageDesc>()).next_multiple_of(page_size);

    // Alignment may have eaten into the tail; trim unusable pages.
    let usable = region_len.saturating_sub(start_off) / page_size;
    let n_pages = n.min(usable);
    if n_pages == 0 {
        return Err(SlabError::RegionTooSmall { len: region_len, needed });
    }

    Ok(RegionLayout { slots_off, stats_off, pages_off, start_off, n_pages })
}

/// Debug-build poison over freed memory.
fn junk(ptr: *mut u8, len: usize) {
    #[cfg(debug_assertions)]
    // Safety: callers pass a range inside the arena they just invalidated.
    unsafe {
        ptr.write_bytes(0xA5, len);
    }
    #[cfg(not(debug_assertions))]
    let _ = (ptr, len);
}

/// Per-process handle to a pool living in a shared region.
///
/// The handle carries only the region bounds, cached geometry, and the
/// diagnostic sink; every piece of mutable allocator state is inside the
/// region. Handles are cheap and any number may exist across attached
/// contexts, provided all mutation is serialized by the external lock.
///
/// The handle does not own the region; dropping it releases nothing.
pub struct SlabPool {
    base: NonNull<u8>,
    region_len: usize,
    geo: Geometry,
    hdr: NonNull<PoolHeader>,
    slots: NonNull<u32>,
    stats: NonNull<ClassStats>,
    pages: NonNull<PageDesc>,
    start: NonNull<u8>,
    n_pages: usize,
    diag: Option<DiagnosticSink>,
}

// Safety: the handle holds raw addresses into a region the caller keeps
// mapped; no thread-affine state.
unsafe impl Send for SlabPool {}

impl SlabPool {
    /// Lay out a pool over a freshly created region.
    ///
    /// Called exactly once per region. Reopening an already initialized
    /// region goes through [`attach`](Self::attach) instead; use
    /// [`is_initialized`](Self::is_initialized) to tell the two apart.
    ///
    /// # Errors
    ///
    /// `BadGeometry` for unusable sizes or a misaligned base,
    /// `RegionTooSmall` if the tables plus one page do not fit.
    ///
    /// # Safety
    ///
    /// - `base..base + len` must be a valid, writable, 8-byte-aligned
    ///   extent that outlives the handle and every pointer allocated from
    ///   it.
    /// - No other context may touch the region until `init` returns.
    pub unsafe fn init(
        base: NonNull<u8>,
        len: usize,
        config: &PoolConfig,
    ) -> Result<Self, SlabError> {
        let geo = Geometry::new(config.min_chunk_size, config.page_size)?;
        if base.as_ptr() as usize % align_of::<PoolHeader>() != 0 {
            return Err(SlabError::BadGeometry(
                "region base must be 8-byte aligned".to_string(),
            ));
        }
        let layout = compute_layout(len, &geo)?;
        // Safety: extent validity per this function's contract.
        let mut pool = unsafe { Self::assemble(base, len, geo, &layout) };

        junk(
            // Safety: in bounds; everything past the header is ours to stamp.
            unsafe { base.as_ptr().add(size_of::<PoolHeader>()) },
            len - size_of::<PoolHeader>(),
        );

        for slot in 0..geo.n_slots {
            pool.set_slot_head(slot, NIL_PAGE);
            // Safety: stats table lies inside the region per compute_layout.
            unsafe { pool.stats.as_ptr().add(slot).write(ClassStats::default()) };
        }

        // The whole arena starts as one free run. Zeroed descriptors read
        // as interior free pages; the head and the head back-pointer on the
        // last page are set explicitly.
        // Safety: descriptor table lies inside the region per compute_layout.
        unsafe {
            pool.pages
                .as_ptr()
                .write_bytes(0, layout.n_pages * size_of::<PageDesc>());
        }
        pool.set_page(
            0,
            PageDesc::detached(PageTag::Free { run: layout.n_pages as u32 }),
        );
        if layout.n_pages > 1 {
            pool.set_prev(layout.n_pages - 1, 0);
        }

        let n_pages = layout.n_pages;
        let start_off = layout.start_off;
        let hdr = pool.hdr_mut();
        hdr.min_shift = geo.min_shift;
        hdr.page_shift = geo.page_shift;
        hdr.n_slots = geo.n_slots as u32;
        hdr.n_pages = n_pages as u32;
        hdr.log_nomem = 1;
        hdr.region_len = len as u64;
        hdr.start = start_off as u64;
        hdr.free = 0;
        hdr.pfree = n_pages as u64;
        hdr.ready = READY;

        Ok(pool)
    }

    /// Open a handle onto an already initialized region without re-running
    /// layout.
    ///
    /// Validation is deliberately minimal: the ready marker, the recorded
    /// region length, and agreement between the header's geometry and the
    /// deterministic layout. There is no magic or version word.
    ///
    /// # Errors
    ///
    /// `NotInitialized` if the ready marker is absent, `SizeMismatch` if
    /// the region length disagrees with the header, `BadGeometry` if the
    /// header is internally inconsistent.
    ///
    /// # Safety
    ///
    /// Same extent requirements as [`init`](Self::init); additionally the
    /// region must hold a pool previously produced by `init` (in this or
    /// any other process), and the caller's lock discipline must cover this
    /// call if other contexts are mutating.
    pub unsafe fn attach(base: NonNull<u8>, len: usize) -> Result<Self, SlabError> {
        if base.as_ptr() as usize % align_of::<PoolHeader>() != 0 {
            return Err(SlabError::BadGeometry(
                "region base must be 8-byte aligned".to_string(),
            ));
        }
        if len < size_of::<PoolHeader>() {
            return Err(SlabError::NotInitialized);
        }
        // Safety: header is at offset zero and every field type tolerates
        // arbitrary bit patterns; a fresh zeroed region simply fails the
        // ready check.
        let hdr = unsafe { base.cast::<PoolHeader>().as_ref() };
        if hdr.ready != READY {
            return Err(SlabError::NotInitialized);
        }
        if hdr.region_len != len as u64 {
            return Err(SlabError::SizeMismatch {
                header: hdr.region_len as usize,
                region: len,
            });
        }
        let (min_shift, page_shift) = (hdr.min_shift, hdr.page_shift);
        let (h_slots, h_pages, h_start) =
            (hdr.n_slots as usize, hdr.n_pages as usize, hdr.start as usize);

        let geo = Geometry::from_shifts(min_shift, page_shift)?;
        let layout = compute_layout(len, &geo)?;
        if geo.n_slots != h_slots || layout.n_pages != h_pages || layout.start_off != h_start {
            return Err(SlabError::BadGeometry(
                "pool header disagrees with computed layout".to_string(),
            ));
        }

        // Safety: extent validity per this function's contract.
        Ok(unsafe { Self::assemble(base, len, geo, &layout) })
    }

    /// Whether the region already carries an initialized pool — the
    /// fresh-vs-reattach distinction callers make before choosing
    /// [`init`](Self::init) or [`attach`](Self::attach).
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid readable memory.
    #[must_use]
    pub unsafe fn is_initialized(base: NonNull<u8>, len: usize) -> bool {
        // Safety: length checked; any bit pattern is a valid header.
        len >= size_of::<PoolHeader>()
            && unsafe { base.cast::<PoolHeader>().as_ref() }.ready == READY
    }

    unsafe fn assemble(
        base: NonNull<u8>,
        region_len: usize,
        geo: Geometry,
        layout: &RegionLayout,
    ) -> Self {
        let p = base.as_ptr();
        // Safety: all offsets lie inside the region and carry the alignment
        // compute_layout established.
        unsafe {
            Self {
                base,
                region_len,
                geo,
                hdr: NonNull::new_unchecked(p.cast::<PoolHeader>()),
                slots: NonNull::new_unchecked(p.add(layout.slots_off).cast::<u32>()),
                stats: NonNull::new_unchecked(p.add(layout.stats_off).cast::<ClassStats>()),
                pages: NonNull::new_unchecked(p.add(layout.pages_off).cast::<PageDesc>()),
                start: NonNull::new_unchecked(p.add(layout.start_off)),
                n_pages: layout.n_pages,
                diag: None,
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes. Requests up to a quarter page round up to a
    /// size class; anything larger is served as a whole page run.
    ///
    /// Caller-holds-the-lock shape; [`SharedSlabPool::alloc`] is the
    /// self-locking one.
    ///
    /// # Errors
    ///
    /// `NoMemory` when no page run long enough remains. The failure is
    /// reported through the diagnostic sink unless suppressed via
    /// [`log_no_memory`](Self::log_no_memory).
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, SlabError> {
        match self.geo.class_of(size) {
            None => {
                let pages = self.geo.pages_for(size);
                match self.alloc_pages(pages) {
                    Some(idx) => {
                        // Safety: idx is a valid page the run now owns.
                        Ok(unsafe { NonNull::new_unchecked(self.page_base(idx)) })
                    }
                    None => Err(SlabError::NoMemory { requested: size }),
                }
            }
            Some((shift, slot)) => self.alloc_chunk(shift, slot, size),
        }
    }

    /// [`alloc`](Self::alloc) plus zero-fill of the requested length.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn alloc_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, SlabError> {
        let ptr = self.alloc(size)?;
        // Safety: the chunk or run we just allocated covers `size` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    fn alloc_chunk(
        &mut self,
        shift: u32,
        slot: usize,
        size: usize,
    ) -> Result<NonNull<u8>, SlabError> {
        self.stat_mut(slot).reqs += 1;

        let head = self.slot_head(slot);
        if head != NIL_PAGE {
            // The directory invariant guarantees the head has a free chunk.
            if let Some(ptr) = self.take_chunk(head as usize, shift, slot) {
                self.stat_mut(slot).used += 1;
                return Ok(ptr);
            }
            self.report(Severity::Alert, "slab alloc: page is busy");
            debug_assert!(false, "slot {slot} head page had no free chunk");
        }

        let Some(idx) = self.alloc_pages(1) else {
            self.stat_mut(slot).fails += 1;
            return Err(SlabError::NoMemory { requested: size });
        };
        let ptr = self.format_class_page(idx, shift, slot);
        self.stat_mut(slot).used += 1;
        Ok(ptr)
    }

    /// Take the first free chunk of the partial page `idx`.
    fn take_chunk(&mut self, idx: usize, shift: u32, slot: usize) -> Option<NonNull<u8>> {
        match (self.geo.regime(shift), self.page(idx).tag) {
            (Regime::Small, PageTag::Small { shift: s }) if s == shift => {
                self.take_small(idx, shift, slot)
            }
            (Regime::Exact, PageTag::Exact { bitmap }) => {
                if bitmap == u64::MAX {
                    return None;
                }
                let bit = (!bitmap).trailing_zeros();
                let new = bitmap | (1u64 << bit);
                self.set_tag(idx, PageTag::Exact { bitmap: new });
                if new == u64::MAX {
                    self.slot_unlink(slot, idx);
                }
                // Safety: bit < 64 chunks of this page.
                Some(unsafe {
                    NonNull::new_unchecked(self.page_base(idx).add((bit as usize) << shift))
                })
            }
            (Regime::Big, PageTag::Big { shift: s, bitmap }) if s == shift => {
                let mask = self.geo.big_mask(shift);
                let avail = !bitmap & mask;
                if avail == 0 {
                    return None;
                }
                let bit = avail.trailing_zeros();
                let new = bitmap | (1u32 << bit);
                self.set_tag(idx, PageTag::Big { shift, bitmap: new });
                if new & mask == mask {
                    self.slot_unlink(slot, idx);
                }
                // Safety: bit < chunk count of this page.
                Some(unsafe {
                    NonNull::new_unchecked(self.page_base(idx).add((bit as usize) << shift))
                })
            }
            _ => {
                debug_assert!(false, "slot {slot} page {idx} tag does not match its class");
                None
            }
        }
    }

    fn take_small(&mut self, idx: usize, shift: u32, slot: usize) -> Option<NonNull<u8>> {
        let words = self.geo.small_map_words(shift);
        let bm = self.page_base(idx).cast::<u64>();
        for w in 0..words {
            // Safety: the bitmap words occupy the page's reserved leading
            // chunks.
            let v = unsafe { bm.add(w).read() };
            if v == u64::MAX {
                continue;
            }
            let bit = (!v).trailing_zeros() as usize;
            // Safety: same word we just read.
            unsafe { bm.add(w).write(v | (1u64 << bit)) };

            if v | (1u64 << bit) == u64::MAX {
                // Words behind us were full or the scan would have stopped
                // there; only the tail can still hold a free chunk.
                // Safety: words of the same bitmap.
                let full =
                    (w + 1..words).all(|rest| unsafe { bm.add(rest).read() } == u64::MAX);
                if full {
                    self.slot_unlink(slot, idx);
                }
            }

            let chunk = w * WORD_BITS + bit;
            // Safety: chunk index is within this page.
            return Some(unsafe {
                NonNull::new_unchecked(self.page_base(idx).add(chunk << shift))
            });
        }
        None
    }

    /// Format a fresh page for a class and hand out its first chunk.
    fn format_class_page(&mut self, idx: usize, shift: u32, slot: usize) -> NonNull<u8> {
        let base = self.page_base(idx);
        let chunks = self.geo.chunks(shift);
        match self.geo.regime(shift) {
            Regime::Small => {
                let holders = self.geo.small_holder_chunks(shift);
                let words = self.geo.small_map_words(shift);
                // Holder chunks plus the chunk being returned start busy.
                let busy = holders + 1;
                let bm = base.cast::<u64>();
                let full_words = busy / WORD_BITS;
                // Safety: bitmap words lie in this page.
                unsafe {
                    for w in 0..full_words {
                        bm.add(w).write(u64::MAX);
                    }
                    if full_words < words {
                        bm.add(full_words).write((1u64 << (busy % WORD_BITS)) - 1);
                    }
                    for w in full_words + 1..words {
                        bm.add(w).write(0);
                    }
                }
                self.set_page(idx, PageDesc::detached(PageTag::Small { shift }));
                self.slot_push(slot, idx);
                self.stat_mut(slot).total += (chunks - holders) as u64;
                // Safety: chunk `holders` is within this page.
                unsafe { NonNull::new_unchecked(base.add(holders << shift)) }
            }
            Regime::Exact => {
                self.set_page(idx, PageDesc::detached(PageTag::Exact { bitmap: 1 }));
                self.slot_push(slot, idx);
                self.stat_mut(slot).total += WORD_BITS as u64;
                // Safety: base is non-null (arena pointer).
                unsafe { NonNull::new_unchecked(base) }
            }
            Regime::Big => {
                self.set_page(idx, PageDesc::detached(PageTag::Big { shift, bitmap: 1 }));
                self.slot_push(slot, idx);
                self.stat_mut(slot).total += chunks as u64;
                // Safety: base is non-null (arena pointer).
                unsafe { NonNull::new_unchecked(base) }
            }
        }
    }

    // ------------------------------------------------------------------
    // Free
    // ------------------------------------------------------------------

    /// Release a chunk or page run previously returned by
    /// [`alloc`](Self::alloc).
    ///
    /// Caller-holds-the-lock shape. Every failure leaves the pool
    /// untouched and is also reported through the diagnostic sink.
    ///
    /// # Errors
    ///
    /// `OutOfRange`, `Misaligned`, `DoubleFree`, `WrongPage`, or
    /// `Reserved`, per the pointer's defect.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), SlabError> {
        let addr = ptr.as_ptr() as usize;
        let start = self.start.as_ptr() as usize;
        let end = self.base.as_ptr() as usize + self.region_len;
        if addr < start || addr >= end {
            self.report(Severity::Alert, "slab free: pointer outside of pool");
            return Err(SlabError::OutOfRange { ptr: addr });
        }
        let idx = (addr - start) >> self.geo.page_shift;
        if idx >= self.n_pages {
            // Bytes of a trimmed tail page have no descriptor.
            self.report(Severity::Alert, "slab free: pointer outside of pool");
            return Err(SlabError::OutOfRange { ptr: addr });
        }

        // Offset within the page, relative to the arena: the region base is
        // only guaranteed 8-byte aligned, so absolute addresses prove
        // nothing about the page grid.
        let in_page = (addr - start) & (self.geo.page_size() - 1);
        match self.page(idx).tag {
            PageTag::Small { shift } => self.free_small(idx, shift, addr, in_page),
            PageTag::Exact { bitmap } => self.free_exact(idx, bitmap, addr, in_page),
            PageTag::Big { shift, bitmap } => self.free_big(idx, shift, bitmap, addr, in_page),
            PageTag::RunHead { len } => {
                if in_page != 0 {
                    self.report(Severity::Alert, "slab free: pointer to wrong chunk");
                    return Err(SlabError::Misaligned {
                        ptr: addr,
                        chunk_size: self.geo.page_size(),
                    });
                }
                let len = len as usize;
                self.free_pages(idx, len);
                junk(ptr.as_ptr(), len << self.geo.page_shift);
                Ok(())
            }
            PageTag::RunBody => {
                self.report(Severity::Alert, "slab free: pointer to wrong page");
                Err(SlabError::WrongPage { ptr: addr })
            }
            PageTag::Free { .. } => {
                self.report(Severity::Alert, "slab free: page is already free");
                Err(SlabError::DoubleFree { ptr: addr })
            }
        }
    }

    fn free_small(
        &mut self,
        idx: usize,
        shift: u32,
        addr: usize,
        in_page: usize,
    ) -> Result<(), SlabError> {
        let Some(slot) = self.class_slot(shift) else {
            self.report(Severity::Alert, "slab free: pointer to wrong page");
            return Err(SlabError::WrongPage { ptr: addr });
        };
        let size = 1usize << shift;
        if in_page & (size - 1) != 0 {
            self.report(Severity::Alert, "slab free: pointer to wrong chunk");
            return Err(SlabError::Misaligned { ptr: addr, chunk_size: size });
        }
        let chunk = in_page >> shift;
        let holders = self.geo.small_holder_chunks(shift);
        if chunk < holders {
            self.report(Severity::Alert, "slab free: pointer to reserved chunk");
            return Err(SlabError::Reserved { ptr: addr });
        }

        let words = self.geo.small_map_words(shift);
        let bm = self.page_base(idx).cast::<u64>();
        let w = chunk / WORD_BITS;
        let m = 1u64 << (chunk % WORD_BITS);
        // Safety: bitmap words occupy the page's reserved leading chunks.
        let v = unsafe { bm.add(w).read() };
        if v & m == 0 {
            self.report(Severity::Alert, "slab free: chunk is already free");
            return Err(SlabError::DoubleFree { ptr: addr });
        }

        // A fully busy page is not in the slot list; this free gives it its
        // first free chunk back.
        // Safety: same bitmap.
        let was_full = (0..words).all(|i| unsafe { bm.add(i).read() } == u64::MAX);
        // Safety: same word read above.
        unsafe { bm.add(w).write(v & !m) };
        if was_full {
            self.slot_push(slot, idx);
        }
        let s = self.stat_mut(slot);
        s.used = s.used.saturating_sub(1);
        junk(addr as *mut u8, size);

        // Empty once nothing beyond the permanently set holder bits remains.
        let hw = holders / WORD_BITS;
        let hm = (1u64 << (holders % WORD_BITS)) - 1;
        // Safety: same bitmap.
        if unsafe { bm.add(hw).read() } & !hm != 0 {
            return Ok(());
        }
        for rest in hw + 1..words {
            // Safety: same bitmap.
            if unsafe { bm.add(rest).read() } != 0 {
                return Ok(());
            }
        }

        self.slot_unlink(slot, idx);
        self.free_pages(idx, 1);
        let capacity = (self.geo.chunks(shift) - holders) as u64;
        let s = self.stat_mut(slot);
        s.total = s.total.saturating_sub(capacity);
        Ok(())
    }

    fn free_exact(
        &mut self,
        idx: usize,
        bitmap: u64,
        addr: usize,
        in_page: usize,
    ) -> Result<(), SlabError> {
        let shift = self.geo.exact_shift;
        let Some(slot) = self.class_slot(shift) else {
            self.report(Severity::Alert, "slab free: pointer to wrong page");
            return Err(SlabError::WrongPage { ptr: addr });
        };
        let size = 1usize << shift;
        if in_page & (size - 1) != 0 {
            self.report(Severity::Alert, "slab free: pointer to wrong chunk");
            return Err(SlabError::Misaligned { ptr: addr, chunk_size: size });
        }
        let m = 1u64 << (in_page >> shift);
        if bitmap & m == 0 {
            self.report(Severity::Alert, "slab free: chunk is already free");
            return Err(SlabError::DoubleFree { ptr: addr });
        }

        if bitmap == u64::MAX {
            self.slot_push(slot, idx);
        }
        let new = bitmap & !m;
        self.set_tag(idx, PageTag::Exact { bitmap: new });
        let s = self.stat_mut(slot);
        s.used = s.used.saturating_sub(1);
        junk(addr as *mut u8, size);

        if new == 0 {
            self.slot_unlink(slot, idx);
            self.free_pages(idx, 1);
            let s = self.stat_mut(slot);
            s.total = s.total.saturating_sub(WORD_BITS as u64);
        }
        Ok(())
    }

    fn free_big(
        &mut self,
        idx: usize,
        shift: u32,
        bitmap: u32,
        addr: usize,
        in_page: usize,
    ) -> Result<(), SlabError> {
        let Some(slot) = self.class_slot(shift) else {
            self.report(Severity::Alert, "slab free: pointer to wrong page");
            return Err(SlabError::WrongPage { ptr: addr });
        };
        let size = 1usize << shift;
        if in_page & (size - 1) != 0 {
            self.report(Severity::Alert, "slab free: pointer to wrong chunk");
            return Err(SlabError::Misaligned { ptr: addr, chunk_size: size });
        }
        let mask = self.geo.big_mask(shift);
        let m = 1u32 << (in_page >> shift);
        if bitmap & m == 0 {
            self.report(Severity::Alert, "slab free: chunk is already free");
            return Err(SlabError::DoubleFree { ptr: addr });
        }

        if bitmap & mask == mask {
            self.slot_push(slot, idx);
        }
        let new = bitmap & !m;
        self.set_tag(idx, PageTag::Big { shift, bitmap: new });
        let s = self.stat_mut(slot);
        s.used = s.used.saturating_sub(1);
        junk(addr as *mut u8, size);

        if new & mask == 0 {
            self.slot_unlink(slot, idx);
            self.free_pages(idx, 1);
            let capacity = self.geo.chunks(shift) as u64;
            let s = self.stat_mut(slot);
            s.total = s.total.saturating_sub(capacity);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page allocator
    // ------------------------------------------------------------------

    /// First-fit scan of the unordered free-run list. Splitting leaves the
    /// remainder in the list; an exact fit unlinks the run.
    fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        debug_assert!(n >= 1);
        let mut cur = self.hdr().free;
        while cur != NIL_PAGE {
            let idx = cur as usize;
            let d = self.page(idx);
            let Some(run) = d.free_run_len() else {
                debug_assert!(false, "free list entry {idx} is not a free-run head");
                break;
            };
            let run = run as usize;
            if run >= n {
                if run > n {
                    let rest = idx + n;
                    // The run's last page backs onto the new, shorter head.
                    self.set_prev(idx + run - 1, rest as u32);
                    self.set_page(
                        rest,
                        PageDesc {
                            tag: PageTag::Free { run: (run - n) as u32 },
                            prev: d.prev,
                            next: d.next,
                        },
                    );
                    if d.prev == NIL_PAGE {
                        self.hdr_mut().free = rest as u32;
                    } else {
                        self.set_next(d.prev as usize, rest as u32);
                    }
                    if d.next != NIL_PAGE {
                        self.set_prev(d.next as usize, rest as u32);
                    }
                } else {
                    self.free_unlink(idx);
                }

                self.set_page(idx, PageDesc::detached(PageTag::RunHead { len: n as u32 }));
                for body in idx + 1..idx + n {
                    self.set_page(body, PageDesc::detached(PageTag::RunBody));
                }
                let hdr = self.hdr_mut();
                hdr.pfree = hdr.pfree.saturating_sub(n as u64);
                return Some(idx);
            }
            cur = d.next;
        }

        if self.hdr().log_nomem != 0 {
            self.report(Severity::Crit, "slab alloc failed: no memory");
        }
        None
    }

    /// Return `idx..idx + n` to the free list, coalescing with adjacent
    /// runs. The span must already be detached from any slot list.
    fn free_pages(&mut self, idx: usize, n: usize) {
        debug_assert!(n >= 1 && idx + n <= self.n_pages);
        let hdr = self.hdr_mut();
        hdr.pfree += n as u64;

        self.set_page(idx, PageDesc::detached(PageTag::Free { run: n as u32 }));
        for body in idx + 1..idx + n {
            self.set_page(body, PageDesc::free_interior());
        }

        let mut head = idx;
        let mut total = n;

        // Merge with the run starting right behind the span.
        let next_idx = idx + n;
        if next_idx < self.n_pages {
            if let Some(jrun) = self.page(next_idx).free_run_len() {
                self.free_unlink(next_idx);
                self.set_page(next_idx, PageDesc::free_interior());
                total += jrun as usize;
            } else {
                debug_assert!(
                    !matches!(self.page(next_idx).tag, PageTag::Free { .. }),
                    "free-run interior cannot start at a span boundary"
                );
            }
        }

        // Merge with the run ending right before the span; its last page
        // records where the head is.
        if head > 0 {
            if let PageTag::Free { run } = self.page(head - 1).tag {
                let phead = if run > 0 { head - 1 } else { self.page(head - 1).prev as usize };
                let merged = phead < self.n_pages
                    && self
                        .page(phead)
                        .free_run_len()
                        .is_some_and(|prun| phead + prun as usize == head);
                debug_assert!(merged, "stale head back-pointer on page {}", head - 1);
                if merged {
                    let prun = self.page(phead).free_run_len().unwrap() as usize;
                    self.free_unlink(phead);
                    self.set_page(head, PageDesc::free_interior());
                    total += prun;
                    head = phead;
                }
            }
        }

        self.set_tag(head, PageTag::Free { run: total as u32 });
        if total > 1 {
            self.set_prev(head + total - 1, head as u32);
        }
        self.free_push(head);
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Install the callback invoked on protocol violations and exhaustion.
    /// Per handle, never shared through the region.
    pub fn set_diagnostic_sink(&mut self, sink: DiagnosticSink) {
        self.diag = Some(sink);
    }

    /// Enable or suppress the exhaustion report. The flag lives in the
    /// region header and is shared by every attached context; suppression
    /// avoids report storms under sustained pressure. Errors are still
    /// returned either way.
    pub fn log_no_memory(&mut self, enabled: bool) {
        self.hdr_mut().log_nomem = u32::from(enabled);
    }

    /// Snapshot of page and per-class counters.
    #[must_use]
    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            pages: self.n_pages,
            free_pages: self.hdr().pfree as usize,
            classes: (0..self.geo.n_slots).map(|s| self.stat(s)).collect(),
        }
    }

    /// Counters for one size class (slot 0 is the minimum chunk size).
    #[must_use]
    pub fn class_stats(&self, slot: usize) -> ClassStats {
        assert!(slot < self.geo.n_slots);
        self.stat(slot)
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.geo.n_slots
    }

    /// Pages backed by descriptors — the arena's total capacity.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.n_pages
    }

    /// Pages currently sitting in free runs.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.hdr().pfree as usize
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.geo.page_size()
    }

    #[must_use]
    pub fn min_chunk_size(&self) -> usize {
        self.geo.min_size()
    }

    /// Walk every descriptor and check the pool's structural invariants:
    /// directory coherence (listed ⇔ has a free chunk), run integrity,
    /// complete coalescing, and agreement between occupancy bits and the
    /// per-class counters. Intended for tests and embedder debugging; cost
    /// is linear in pages.
    ///
    /// # Errors
    ///
    /// A description of the first violation found.
    pub fn verify_coherence(&self) -> Result<(), String> {
        let n = self.n_pages;
        let mut listed = FixedBitSet::with_capacity(n);

        // Slot lists: every member is a partial page of the right class.
        for slot in 0..self.geo.n_slots {
            let mut cur = self.slot_head(slot);
            let mut prev = NIL_PAGE;
            let mut steps = 0usize;
            while cur != NIL_PAGE {
                let idx = cur as usize;
                if idx >= n {
                    return Err(format!("slot {slot}: link to page {idx} out of bounds"));
                }
                if listed.contains(idx) {
                    return Err(format!("page {idx} linked into two lists"));
                }
                listed.insert(idx);
                let d = self.page(idx);
                if d.prev != prev {
                    return Err(format!("page {idx}: prev link mismatch in slot {slot}"));
                }
                let (shift, has_free) = match d.tag {
                    PageTag::Exact { bitmap } => (self.geo.exact_shift, bitmap != u64::MAX),
                    PageTag::Big { shift, bitmap } => {
                        let mask = self.geo.big_mask(shift);
                        (shift, bitmap & mask != mask)
                    }
                    PageTag::Small { shift } => (shift, !self.small_full(idx, shift)),
                    other => {
                        return Err(format!("page {idx} in slot {slot} has tag {other:?}"));
                    }
                };
                if self.class_slot(shift) != Some(slot) {
                    return Err(format!("page {idx}: class shift {shift} in slot {slot}"));
                }
                if !has_free {
                    return Err(format!("page {idx} in slot {slot} has no free chunk"));
                }
                steps += 1;
                if steps > n {
                    return Err(format!("slot {slot}: list cycle"));
                }
                prev = cur;
                cur = d.next;
            }
        }

        // Free-run list: heads only, each reachable exactly once.
        let mut free_heads = FixedBitSet::with_capacity(n);
        let mut pfree_sum = 0u64;
        {
            let mut cur = self.hdr().free;
            let mut steps = 0usize;
            while cur != NIL_PAGE {
                let idx = cur as usize;
                if idx >= n {
                    return Err(format!("free list: link to page {idx} out of bounds"));
                }
                if free_heads.contains(idx) || listed.contains(idx) {
                    return Err(format!("page {idx} linked into two lists"));
                }
                free_heads.insert(idx);
                let d = self.page(idx);
                let Some(run) = d.free_run_len() else {
                    return Err(format!("free list entry {idx} is not a free-run head"));
                };
                if idx + run as usize > n {
                    return Err(format!("free run at {idx} overruns the arena"));
                }
                if run > 1 && self.page(idx + run as usize - 1).prev != cur {
                    return Err(format!("free run at {idx}: stale head back-pointer"));
                }
                pfree_sum += u64::from(run);
                steps += 1;
                if steps > n {
                    return Err("free list cycle".to_string());
                }
                cur = d.next;
            }
        }
        if pfree_sum != self.hdr().pfree {
            return Err(format!(
                "pfree {} disagrees with free-list total {pfree_sum}",
                self.hdr().pfree
            ));
        }

        // Whole-table walk: run integrity, coalescing, per-class counters.
        let mut used = vec![0u64; self.geo.n_slots];
        let mut total = vec![0u64; self.geo.n_slots];
        let mut idx = 0usize;
        let mut prev_was_free_run = false;
        while idx < n {
            let d = self.page(idx);
            let was_free = matches!(d.tag, PageTag::Free { .. });
            match d.tag {
                PageTag::Free { run } => {
                    if run == 0 {
                        return Err(format!("page {idx}: orphan free-run interior"));
                    }
                    if !free_heads.contains(idx) {
                        return Err(format!("free run at {idx} not reachable from free list"));
                    }
                    if prev_was_free_run {
                        return Err(format!("adjacent free runs not coalesced at {idx}"));
                    }
                    let run = run as usize;
                    for body in idx + 1..idx + run {
                        if !matches!(self.page(body).tag, PageTag::Free { run: 0 }) {
                            return Err(format!("free run at {idx}: page {body} is not interior"));
                        }
                    }
                    idx += run;
                }
                PageTag::RunHead { len } => {
                    let len = len as usize;
                    if len == 0 || idx + len > n {
                        return Err(format!("run head at {idx} has bad length {len}"));
                    }
                    for body in idx + 1..idx + len {
                        if !matches!(self.page(body).tag, PageTag::RunBody) {
                            return Err(format!("run at {idx}: page {body} is not a run body"));
                        }
                    }
                    idx += len;
                }
                PageTag::RunBody => {
                    return Err(format!("page {idx}: orphan run body"));
                }
                PageTag::Exact { bitmap } => {
                    let Some(slot) = self.class_slot(self.geo.exact_shift) else {
                        return Err(format!("page {idx}: exact page without exact class"));
                    };
                    used[slot] += u64::from(bitmap.count_ones());
                    total[slot] += WORD_BITS as u64;
                    let partial = bitmap != u64::MAX;
                    if partial != listed.contains(idx) {
                        return Err(format!("page {idx}: slot membership mismatch"));
                    }
                    idx += 1;
                }
                PageTag::Big { shift, bitmap } => {
                    let Some(slot) = self.class_slot(shift) else {
                        return Err(format!("page {idx}: big page with shift {shift}"));
                    };
                    let mask = self.geo.big_mask(shift);
                    used[slot] += u64::from((bitmap & mask).count_ones());
                    total[slot] += self.geo.chunks(shift) as u64;
                    let partial = bitmap & mask != mask;
                    if partial != listed.contains(idx) {
                        return Err(format!("page {idx}: slot membership mismatch"));
                    }
                    idx += 1;
                }
                PageTag::Small { shift } => {
                    let Some(slot) = self.class_slot(shift) else {
                        return Err(format!("page {idx}: small page with shift {shift}"));
                    };
                    let holders = self.geo.small_holder_chunks(shift) as u64;
                    used[slot] += self.small_popcount(idx, shift).saturating_sub(holders);
                    total[slot] += self.geo.chunks(shift) as u64 - holders;
                    let partial = !self.small_full(idx, shift);
                    if partial != listed.contains(idx) {
                        return Err(format!("page {idx}: slot membership mismatch"));
                    }
                    idx += 1;
                }
            }
            prev_was_free_run = was_free;
        }

        for slot in 0..self.geo.n_slots {
            let s = self.stat(slot);
            if s.used != used[slot] || s.total != total[slot] {
                return Err(format!(
                    "slot {slot}: stats used/total {}/{} but occupancy says {}/{}",
                    s.used, s.total, used[slot], total[slot]
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn hdr(&self) -> &PoolHeader {
        // Safety: the header lives at the region base for the handle's
        // lifetime.
        unsafe { self.hdr.as_ref() }
    }

    fn hdr_mut(&mut self) -> &mut PoolHeader {
        // Safety: as above; &mut self is the caller's lock.
        unsafe { self.hdr.as_mut() }
    }

    fn slot_head(&self, slot: usize) -> u32 {
        debug_assert!(slot < self.geo.n_slots);
        // Safety: slot table bounds established at assembly.
        unsafe { self.slots.as_ptr().add(slot).read() }
    }

    fn set_slot_head(&mut self, slot: usize, v: u32) {
        debug_assert!(slot < self.geo.n_slots);
        // Safety: as above.
        unsafe { self.slots.as_ptr().add(slot).write(v) };
    }

    fn stat(&self, slot: usize) -> ClassStats {
        debug_assert!(slot < self.geo.n_slots);
        // Safety: stats table bounds established at assembly.
        unsafe { self.stats.as_ptr().add(slot).read() }
    }

    fn stat_mut(&mut self, slot: usize) -> &mut ClassStats {
        debug_assert!(slot < self.geo.n_slots);
        // Safety: as above; &mut self serializes access.
        unsafe { &mut *self.stats.as_ptr().add(slot) }
    }

    fn page(&self, idx: usize) -> PageDesc {
        debug_assert!(idx < self.n_pages);
        // Safety: descriptor table bounds established at assembly.
        unsafe { self.pages.as_ptr().add(idx).read() }
    }

    fn set_page(&mut self, idx: usize, d: PageDesc) {
        debug_assert!(idx < self.n_pages);
        // Safety: as above.
        unsafe { self.pages.as_ptr().add(idx).write(d) };
    }

    fn set_tag(&mut self, idx: usize, tag: PageTag) {
        let mut d = self.page(idx);
        d.tag = tag;
        self.set_page(idx, d);
    }

    fn set_prev(&mut self, idx: usize, v: u32) {
        let mut d = self.page(idx);
        d.prev = v;
        self.set_page(idx, d);
    }

    fn set_next(&mut self, idx: usize, v: u32) {
        let mut d = self.page(idx);
        d.next = v;
        self.set_page(idx, d);
    }

    /// Base address of page `idx` in the arena.
    fn page_base(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.n_pages);
        // Safety: idx is a descriptor-backed page.
        unsafe { self.start.as_ptr().add(idx << self.geo.page_shift) }
    }

    /// Slot for a class shift, bounds-checked against the geometry. `None`
    /// means the descriptor is corrupt.
    fn class_slot(&self, shift: u32) -> Option<usize> {
        if shift < self.geo.min_shift {
            return None;
        }
        let slot = (shift - self.geo.min_shift) as usize;
        (slot < self.geo.n_slots).then_some(slot)
    }

    fn small_full(&self, idx: usize, shift: u32) -> bool {
        let words = self.geo.small_map_words(shift);
        let bm = self.page_base(idx).cast::<u64>();
        // Safety: bitmap words occupy the page's reserved leading chunks.
        (0..words).all(|w| unsafe { bm.add(w).read() } == u64::MAX)
    }

    fn small_popcount(&self, idx: usize, shift: u32) -> u64 {
        let words = self.geo.small_map_words(shift);
        let bm = self.page_base(idx).cast::<u64>();
        // Safety: as above.
        (0..words)
            .map(|w| u64::from(unsafe { bm.add(w).read() }.count_ones()))
            .sum()
    }

    fn slot_push(&mut self, slot: usize, idx: usize) {
        let head = self.slot_head(slot);
        self.set_prev(idx, NIL_PAGE);
        self.set_next(idx, head);
        if head != NIL_PAGE {
            self.set_prev(head as usize, idx as u32);
        }
        self.set_slot_head(slot, idx as u32);
    }

    fn slot_unlink(&mut self, slot: usize, idx: usize) {
        let d = self.page(idx);
        if d.prev == NIL_PAGE {
            self.set_slot_head(slot, d.next);
        } else {
            self.set_next(d.prev as usize, d.next);
        }
        if d.next != NIL_PAGE {
            self.set_prev(d.next as usize, d.prev);
        }
        self.set_prev(idx, NIL_PAGE);
        self.set_next(idx, NIL_PAGE);
    }

    fn free_push(&mut self, idx: usize) {
        let head = self.hdr().free;
        self.set_prev(idx, NIL_PAGE);
        self.set_next(idx, head);
        if head != NIL_PAGE {
            self.set_prev(head as usize, idx as u32);
        }
        self.hdr_mut().free = idx as u32;
    }

    fn free_unlink(&mut self, idx: usize) {
        let d = self.page(idx);
        if d.prev == NIL_PAGE {
            self.hdr_mut().free = d.next;
        } else {
            self.set_next(d.prev as usize, d.next);
        }
        if d.next != NIL_PAGE {
            self.set_prev(d.next as usize, d.prev);
        }
        self.set_prev(idx, NIL_PAGE);
        self.set_next(idx, NIL_PAGE);
    }

    /// (head index, run length) of every free-list entry, list order.
    #[cfg(test)]
    fn free_list_runs(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cur = self.hdr().free;
        let mut steps = 0usize;
        while cur != NIL_PAGE && steps <= self.n_pages {
            let idx = cur as usize;
            out.push((idx, self.page(idx).free_run_len().unwrap_or(0) as usize));
            cur = self.page(idx).next;
            steps += 1;
        }
        out
    }

    fn report(&self, severity: Severity, msg: &str) {
        if let Some(sink) = &self.diag {
            sink(severity, msg);
        }
    }
}

/// Self-locking wrapper: a [`SlabPool`] behind a process-local mutex.
///
/// This is the second call shape the pool exposes — `alloc`/`free` here
/// acquire and release the lock themselves, while the `&mut` methods on
/// [`SlabPool`] are the already-locked variants. The mutex serializes
/// threads of one process only; contexts in other processes attached to
/// the same region must share a cross-process lock instead and use the
/// `&mut` shape under it.
pub struct SharedSlabPool {
    inner: Mutex<SlabPool>,
}

impl SharedSlabPool {
    #[must_use]
    pub fn new(pool: SlabPool) -> Self {
        Self { inner: Mutex::new(pool) }
    }

    /// Allocate under the wrapper's lock.
    ///
    /// # Errors
    ///
    /// Same as [`SlabPool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, SlabError> {
        self.inner.lock().unwrap().alloc(size)
    }

    /// Allocate and zero-fill under the wrapper's lock.
    ///
    /// # Errors
    ///
    /// Same as [`SlabPool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, SlabError> {
        self.inner.lock().unwrap().alloc_zeroed(size)
    }

    /// Free under the wrapper's lock.
    ///
    /// # Errors
    ///
    /// Same as [`SlabPool::free`].
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), SlabError> {
        self.inner.lock().unwrap().free(ptr)
    }

    /// Run several operations under one critical section.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut SlabPool) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    /// Recover the pool, dropping the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn into_inner(self) -> SlabPool {
        self.inner.into_inner().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::region::MappedRegion;
    use std::collections::HashSet;
    use std::sync::Arc;

    const PAGE: usize = 4096;

    fn test_config() -> PoolConfig {
        PoolConfig { min_chunk_size: 8, page_size: PAGE }
    }

    /// Region sized to yield at least `pages_hint` pages; keep the region
    /// alive for as long as the pool handle.
    fn test_pool(pages_hint: usize) -> (MappedRegion, SlabPool) {
        let region = MappedRegion::new((pages_hint + 3) * PAGE).unwrap();
        // Safety: the region outlives the pool in every test.
        let pool =
            unsafe { SlabPool::init(region.base(), region.len(), &test_config()) }.unwrap();
        (region, pool)
    }

    #[test]
    fn test_pool_init_geometry() {
        let (_region, pool) = test_pool(8);
        // 4096-byte pages with 8-byte minimum chunks: 8 classes, 8..1024.
        assert_eq!(pool.class_count(), 8);
        assert!(pool.page_count() >= 8);
        assert_eq!(pool.free_page_count(), pool.page_count());
        assert_eq!(pool.page_size(), PAGE);
        assert_eq!(pool.min_chunk_size(), 8);

        let usage = pool.usage();
        assert_eq!(usage.pages, pool.page_count());
        assert_eq!(usage.free_pages, pool.page_count());
        assert!(usage.classes.iter().all(|c| *c == ClassStats::default()));

        // The whole arena is one free run.
        assert_eq!(pool.free_list_runs(), vec![(0, pool.page_count())]);
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_init_rejects_misaligned_base() {
        let region = MappedRegion::new(8 * PAGE).unwrap();
        // Safety: still inside the mapping.
        let skewed = unsafe { NonNull::new_unchecked(region.base().as_ptr().add(4)) };
        let r = unsafe { SlabPool::init(skewed, region.len() - 4, &test_config()) };
        assert!(matches!(r, Err(SlabError::BadGeometry(_))));
    }

    #[test]
    fn test_pool_region_too_small() {
        let region = MappedRegion::new(PAGE).unwrap();
        let r = unsafe { SlabPool::init(region.base(), region.len(), &test_config()) };
        assert!(matches!(r, Err(SlabError::RegionTooSmall { .. })));
    }

    #[test]
    fn test_pool_default_config_uses_os_pages() {
        let region = MappedRegion::new(1 << 20).unwrap();
        let mut pool = unsafe {
            SlabPool::init(region.base(), region.len(), &PoolConfig::default())
        }
        .unwrap();
        assert_eq!(pool.page_size(), crate::os_page_size());
        let p = pool.alloc(100).unwrap();
        pool.free(p).unwrap();
        pool.verify_coherence().unwrap();
    }

    // --- Small regime (in-page bitmap) ---

    #[test]
    fn test_pool_small_class_two_allocs_one_page() {
        let (_region, mut pool) = test_pool(8);
        let before = pool.free_page_count();

        // 24 rounds to the 32-byte class: 128 chunks, chunk 0 permanently
        // holds the page's own bitmap.
        let p1 = pool.alloc(24).unwrap();
        let p2 = pool.alloc(24).unwrap();
        assert_eq!(p1.as_ptr() as usize % PAGE, 32);
        assert_eq!(p2.as_ptr() as usize, p1.as_ptr() as usize + 32);
        assert_eq!(pool.free_page_count(), before - 1);

        let s = pool.class_stats(2);
        assert_eq!(s.reqs, 2);
        assert_eq!(s.used, 2);
        assert_eq!(s.total, 127);
        assert_eq!(s.free(), 125);
        pool.verify_coherence().unwrap();

        pool.free(p1).unwrap();
        pool.free(p2).unwrap();
        assert_eq!(pool.free_page_count(), before);
        assert_eq!(pool.class_stats(2).total, 0);
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_small_class_fill_page() {
        let (_region, mut pool) = test_pool(8);
        // 8-byte class: 512 chunks, 8 of them bitmap holders.
        let mut ptrs = Vec::new();
        for _ in 0..504 {
            ptrs.push(pool.alloc(8).unwrap());
        }
        let s = pool.class_stats(0);
        assert_eq!((s.used, s.total), (504, 504));
        pool.verify_coherence().unwrap();

        // Page is full; the next alloc formats a second page.
        let before = pool.free_page_count();
        let extra = pool.alloc(8).unwrap();
        assert_eq!(pool.free_page_count(), before - 1);
        pool.verify_coherence().unwrap();

        pool.free(extra).unwrap();
        for p in ptrs {
            pool.free(p).unwrap();
        }
        assert_eq!(pool.class_stats(0).used, 0);
        assert_eq!(pool.free_page_count(), pool.page_count());
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_free_reserved_holder_chunk() {
        let (_region, mut pool) = test_pool(8);
        let p = pool.alloc(24).unwrap();
        // Chunk 0 of the page is the bitmap holder; it was never handed out.
        // Safety: 32 bytes before the first user chunk, same page.
        let holder = unsafe { NonNull::new_unchecked(p.as_ptr().sub(32)) };
        let before = pool.usage();
        assert!(matches!(pool.free(holder), Err(SlabError::Reserved { .. })));
        assert_eq!(pool.usage(), before);
        pool.free(p).unwrap();
    }

    // --- Exact regime (descriptor-word bitmap) ---

    #[test]
    fn test_pool_exact_class_fill_and_relink() {
        let (_region, mut pool) = test_pool(8);
        let mut ptrs = HashSet::new();
        // 64-byte chunks: exactly 64 per page, no reserved chunks.
        let first = pool.alloc(64).unwrap();
        assert_eq!(first.as_ptr() as usize % PAGE, 0);
        ptrs.insert(first.as_ptr() as usize);
        for _ in 1..64 {
            assert!(ptrs.insert(pool.alloc(64).unwrap().as_ptr() as usize));
        }
        let s = pool.class_stats(3);
        assert_eq!((s.used, s.total), (64, 64));

        // Full page left the directory; the next alloc takes a fresh page.
        let before = pool.free_page_count();
        let extra = pool.alloc(64).unwrap();
        assert!(ptrs.insert(extra.as_ptr() as usize));
        assert_eq!(pool.free_page_count(), before - 1);
        pool.verify_coherence().unwrap();

        // Freeing a chunk of the full page puts it back at the directory
        // head, so the next alloc reuses exactly that chunk.
        pool.free(first).unwrap();
        let again = pool.alloc(64).unwrap();
        assert_eq!(again, first);
        pool.verify_coherence().unwrap();
    }

    // --- Big regime (bitmap beside the shift) ---

    #[test]
    fn test_pool_big_class_layout() {
        let (_region, mut pool) = test_pool(8);
        // 513 rounds to the 1024-byte class: 4 chunks per page.
        let base = pool.alloc(513).unwrap().as_ptr() as usize;
        assert_eq!(base % PAGE, 0);
        for i in 1..4 {
            let p = pool.alloc(600 + i).unwrap().as_ptr() as usize;
            assert_eq!(p, base + i * 1024);
        }
        let before = pool.free_page_count();
        let fifth = pool.alloc(1024).unwrap().as_ptr() as usize;
        assert_eq!(pool.free_page_count(), before - 1);
        assert_ne!(fifth & !(PAGE - 1), base & !(PAGE - 1));

        let s = pool.class_stats(7);
        assert_eq!((s.used, s.total), (5, 8));
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_partial_page_reused_before_new_page() {
        let (_region, mut pool) = test_pool(8);
        let mut ptrs = vec![pool.alloc(200).unwrap()];
        let before = pool.free_page_count();
        // The 256-byte class holds 16 chunks; the rest come from the same
        // partial page without touching the page allocator.
        for _ in 0..15 {
            ptrs.push(pool.alloc(256).unwrap());
        }
        assert_eq!(pool.free_page_count(), before);
        assert_eq!(pool.class_stats(5).used, 16);
        pool.verify_coherence().unwrap();

        for p in ptrs {
            pool.free(p).unwrap();
        }
        assert_eq!(pool.class_stats(5).used, 0);
        pool.verify_coherence().unwrap();
    }

    // --- Oversized page runs ---

    #[test]
    fn test_pool_oversized_runs() {
        let (_region, mut pool) = test_pool(12);
        let start_free = pool.free_page_count();

        // 3000 exceeds the largest class and becomes a one-page run.
        let one = pool.alloc(3000).unwrap();
        assert_eq!(one.as_ptr() as usize % PAGE, 0);
        assert_eq!(pool.free_page_count(), start_free - 1);

        let two = pool.alloc(5000).unwrap();
        assert_eq!(pool.free_page_count(), start_free - 3);

        let exact = pool.alloc(PAGE).unwrap();
        assert_eq!(pool.free_page_count(), start_free - 4);

        // Runs have no size class; the class counters never moved.
        assert!(pool.usage().classes.iter().all(|c| c.reqs == 0));

        pool.free(two).unwrap();
        pool.free(one).unwrap();
        pool.free(exact).unwrap();
        assert_eq!(pool.free_page_count(), start_free);
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_whole_arena_run() {
        let (_region, mut pool) = test_pool(8);
        let n = pool.page_count();
        let big = pool.alloc(n * PAGE).unwrap();
        assert_eq!(pool.free_page_count(), 0);
        pool.free(big).unwrap();
        assert_eq!(pool.free_list_runs(), vec![(0, n)]);
        pool.verify_coherence().unwrap();
    }

    // --- Round-trip and coalescing properties ---

    #[test]
    fn test_pool_round_trip_restores_state() {
        let (_region, mut pool) = test_pool(16);
        // Prime one class so a partially used page round-trips too.
        let keep = pool.alloc(100).unwrap();

        for size in [1usize, 8, 24, 64, 100, 500, 1024, 2000, 3000, 9000] {
            let free_before = pool.free_page_count();
            let stats_before: Vec<_> = (0..pool.class_count())
                .map(|s| {
                    let c = pool.class_stats(s);
                    (c.used, c.total)
                })
                .collect();

            let p = pool.alloc(size).unwrap();
            pool.free(p).unwrap();

            assert_eq!(pool.free_page_count(), free_before, "size {size}");
            let stats_after: Vec<_> = (0..pool.class_count())
                .map(|s| {
                    let c = pool.class_stats(s);
                    (c.used, c.total)
                })
                .collect();
            assert_eq!(stats_before, stats_after, "size {size}");
            pool.verify_coherence().unwrap();
        }

        pool.free(keep).unwrap();
        assert_eq!(pool.free_page_count(), pool.page_count());
    }

    #[test]
    fn test_pool_coalescing_completeness() {
        let (_region, mut pool) = test_pool(16);
        let n = pool.page_count();
        let pages: Vec<NonNull<u8>> = (0..n).map(|_| pool.alloc(PAGE).unwrap()).collect();
        assert_eq!(pool.free_page_count(), 0);

        // Free in a scattered order: every third page first, so merges run
        // forward, backward, and through the middle.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (i % 3, i));
        for &i in &order {
            pool.free(pages[i]).unwrap();
        }

        assert_eq!(pool.free_page_count(), n);
        assert_eq!(pool.free_list_runs(), vec![(0, n)]);
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_mixed_workload_coalesces_fully() {
        let (_region, mut pool) = test_pool(16);
        let mut live = Vec::new();
        for &size in &[24usize, 3000, 64, 9000, 8, 1024, 500, 4096, 100, 256] {
            live.push(pool.alloc(size).unwrap());
        }
        pool.verify_coherence().unwrap();

        // Interleaved free order.
        for i in [1usize, 7, 3, 9, 5, 0, 8, 2, 6, 4] {
            pool.free(live[i]).unwrap();
        }
        assert_eq!(pool.free_page_count(), pool.page_count());
        assert_eq!(pool.free_list_runs().len(), 1);
        assert!(pool.usage().classes.iter().all(|c| c.used == 0 && c.total == 0));
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() {
        let (_region, mut pool) = test_pool(8);
        let n = pool.page_count();
        let mut runs = Vec::new();
        for _ in 0..n {
            runs.push(pool.alloc(PAGE).unwrap());
        }
        assert_eq!(pool.free_page_count(), 0);
        assert!(matches!(pool.alloc(PAGE), Err(SlabError::NoMemory { .. })));

        // Chunk requests fail the same way and count against their class.
        assert!(matches!(pool.alloc(8), Err(SlabError::NoMemory { .. })));
        assert_eq!(pool.class_stats(0).fails, 1);

        // One page back permits exactly one more page allocation.
        pool.free(runs.pop().unwrap()).unwrap();
        runs.push(pool.alloc(PAGE).unwrap());
        assert!(matches!(pool.alloc(PAGE), Err(SlabError::NoMemory { .. })));

        for p in runs {
            pool.free(p).unwrap();
        }
        assert_eq!(pool.free_page_count(), n);
        pool.verify_coherence().unwrap();
    }

    // --- Protocol violations ---

    #[test]
    fn test_pool_double_free_chunk_detected() {
        let (_region, mut pool) = test_pool(8);
        let p = pool.alloc(24).unwrap();
        let q = pool.alloc(24).unwrap(); // keeps the page formatted
        pool.free(p).unwrap();

        let before = pool.usage();
        assert!(matches!(pool.free(p), Err(SlabError::DoubleFree { .. })));
        assert_eq!(pool.usage(), before);

        pool.free(q).unwrap();
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_double_free_page_run_detected() {
        let (_region, mut pool) = test_pool(8);
        let p = pool.alloc(3000).unwrap();
        pool.free(p).unwrap();
        let before = pool.usage();
        assert!(matches!(pool.free(p), Err(SlabError::DoubleFree { .. })));
        assert_eq!(pool.usage(), before);
    }

    #[test]
    fn test_pool_free_out_of_range() {
        let (_region, mut pool) = test_pool(8);
        let before = pool.usage();

        // The pool's own tables sit below the arena.
        let tables = pool.base;
        assert!(matches!(pool.free(tables), Err(SlabError::OutOfRange { .. })));

        // Safety: one past the mapping is never dereferenced.
        let past = unsafe { NonNull::new_unchecked(pool.base.as_ptr().add(pool.region_len)) };
        assert!(matches!(pool.free(past), Err(SlabError::OutOfRange { .. })));

        assert!(matches!(
            pool.free(NonNull::dangling()),
            Err(SlabError::OutOfRange { .. })
        ));
        assert_eq!(pool.usage(), before);
    }

    #[test]
    fn test_pool_free_misaligned() {
        let (_region, mut pool) = test_pool(8);
        let p = pool.alloc(64).unwrap();
        // Safety: stays inside the chunk.
        let bad = unsafe { NonNull::new_unchecked(p.as_ptr().add(1)) };
        assert!(matches!(pool.free(bad), Err(SlabError::Misaligned { .. })));

        let run = pool.alloc(3000).unwrap();
        // Safety: stays inside the run page.
        let bad_run = unsafe { NonNull::new_unchecked(run.as_ptr().add(8)) };
        assert!(matches!(pool.free(bad_run), Err(SlabError::Misaligned { .. })));

        pool.free(p).unwrap();
        pool.free(run).unwrap();
        pool.verify_coherence().unwrap();
    }

    #[test]
    fn test_pool_free_run_body_detected() {
        let (_region, mut pool) = test_pool(8);
        let run = pool.alloc(2 * PAGE).unwrap();
        // Safety: second page of the run.
        let body = unsafe { NonNull::new_unchecked(run.as_ptr().add(PAGE)) };
        assert!(matches!(pool.free(body), Err(SlabError::WrongPage { .. })));
        pool.free(run).unwrap();
        pool.verify_coherence().unwrap();
    }

    // --- alloc_zeroed ---

    #[test]
    fn test_pool_alloc_zeroed_clears_recycled_chunk() {
        let (_region, mut pool) = test_pool(8);
        let p = pool.alloc(256).unwrap();
        // Safety: 256 bytes we own.
        unsafe { p.as_ptr().write_bytes(0xCD, 256) };
        pool.free(p).unwrap();

        let q = pool.alloc_zeroed(256).unwrap();
        assert_eq!(q, p);
        // Safety: 256 bytes we own.
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        pool.free(q).unwrap();
    }

    // --- Reattachment ---

    #[test]
    fn test_pool_attach_adopts_existing_state() {
        let region = MappedRegion::new(11 * PAGE).unwrap();

        // Safety: fresh region, valid extent.
        unsafe {
            assert!(!SlabPool::is_initialized(region.base(), region.len()));
            assert!(matches!(
                SlabPool::attach(region.base(), region.len()),
                Err(SlabError::NotInitialized)
            ));
        }

        let mut pool =
            unsafe { SlabPool::init(region.base(), region.len(), &test_config()) }.unwrap();
        // Safety: initialized above.
        assert!(unsafe { SlabPool::is_initialized(region.base(), region.len()) });

        let p = pool.alloc(100).unwrap();

        // A second handle adopts the layout without re-running init.
        let mut other = unsafe { SlabPool::attach(region.base(), region.len()) }.unwrap();
        assert_eq!(other.page_count(), pool.page_count());
        assert_eq!(other.class_count(), pool.class_count());
        assert_eq!(other.usage(), pool.usage());

        other.free(p).unwrap();
        assert_eq!(other.class_stats(4).used, 0);
        other.verify_coherence().unwrap();

        // Length disagreement is refused.
        assert!(matches!(
            unsafe { SlabPool::attach(region.base(), region.len() - PAGE) },
            Err(SlabError::SizeMismatch { .. })
        ));
    }

    // --- Diagnostics ---

    #[test]
    fn test_pool_diagnostic_sink_and_nomem_suppression() {
        let (_region, mut pool) = test_pool(8);
        let log: Arc<std::sync::Mutex<Vec<(Severity, String)>>> = Arc::default();
        let sink_log = Arc::clone(&log);
        pool.set_diagnostic_sink(Box::new(move |sev, msg| {
            sink_log.lock().unwrap().push((sev, msg.to_string()));
        }));

        let p = pool.alloc(24).unwrap();
        pool.free(p).unwrap();
        let _ = pool.free(p);
        {
            let entries = log.lock().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0, Severity::Alert);
            assert!(entries[0].1.contains("already free"));
        }

        // Exhaust: one Crit report per failed request, until suppressed.
        let n = pool.free_page_count();
        let mut runs = Vec::new();
        for _ in 0..n {
            runs.push(pool.alloc(PAGE).unwrap());
        }
        assert!(pool.alloc(PAGE).is_err());
        let crits = || {
            log.lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == Severity::Crit)
                .count()
        };
        assert_eq!(crits(), 1);

        pool.log_no_memory(false);
        assert!(pool.alloc(PAGE).is_err());
        assert_eq!(crits(), 1);

        pool.log_no_memory(true);
        assert!(pool.alloc(PAGE).is_err());
        assert_eq!(crits(), 2);
    }

    // --- Disjointness ---

    #[test]
    fn test_pool_live_allocations_disjoint() {
        let (_region, mut pool) = test_pool(16);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        let sizes = [8usize, 24, 64, 100, 256, 513, 1024, 2000, 4096, 9000];
        for (i, &size) in sizes.iter().cycle().take(60).enumerate() {
            if let Ok(p) = pool.alloc(size) {
                live.push((p, size));
            }
            if i % 5 == 4 && !live.is_empty() {
                let (p, _) = live.swap_remove((i * 3) % live.len());
                pool.free(p).unwrap();
            }
        }
        pool.verify_coherence().unwrap();

        let base = pool.base.as_ptr() as usize;
        let mut taken = FixedBitSet::with_capacity(pool.region_len);
        for &(p, size) in &live {
            let off = p.as_ptr() as usize - base;
            for b in off..off + size {
                assert!(!taken.contains(b), "live allocations overlap at offset {b:#x}");
                taken.insert(b);
            }
        }

        for (p, _) in live {
            pool.free(p).unwrap();
        }
        assert_eq!(pool.free_page_count(), pool.page_count());
        assert_eq!(pool.free_list_runs().len(), 1);
        pool.verify_coherence().unwrap();
    }

    // --- Locked wrapper ---

    #[test]
    fn test_shared_pool_serializes_threads() {
        let region = MappedRegion::new(19 * PAGE).unwrap();
        let pool =
            unsafe { SlabPool::init(region.base(), region.len(), &test_config()) }.unwrap();
        let shared = Arc::new(SharedSlabPool::new(pool));

        let mut workers = Vec::new();
        for t in 0..4usize {
            let shared = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let size = 8usize << ((t + i) % 4);
                    let p = shared.alloc(size).unwrap();
                    // Safety: our chunk until freed.
                    unsafe { p.as_ptr().write_bytes(t as u8, size) };
                    shared.free(p).unwrap();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }

        shared.with_locked(|pool| {
            pool.verify_coherence().unwrap();
            assert!(pool.usage().classes.iter().all(|c| c.used == 0));
            assert_eq!(pool.free_page_count(), pool.page_count());
        });
    }

    #[test]
    fn test_shared_pool_batch_under_one_lock() {
        let (_region, pool) = test_pool(8);
        let shared = SharedSlabPool::new(pool);
        let (a, b) = shared.with_locked(|pool| {
            let a = pool.alloc(64).unwrap();
            let b = pool.alloc(64).unwrap();
            (a, b)
        });
        assert_ne!(a, b);
        shared.with_locked(|pool| {
            pool.free(a).unwrap();
            pool.free(b).unwrap();
            pool.verify_coherence().unwrap();
        });
        let pool = shared.into_inner();
        assert_eq!(pool.free_page_count(), pool.page_count());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            /// Arbitrary alloc/free interleavings keep every structural
            /// invariant, and draining the survivors restores the arena to
            /// one free run.
            #[test]
            fn prop_pool_random_mix_stays_coherent(
                ops in proptest::collection::vec((any::<bool>(), 1usize..9000), 1..60)
            ) {
                let (_region, mut pool) = test_pool(16);
                let mut live: Vec<NonNull<u8>> = Vec::new();

                for (do_alloc, size) in ops {
                    if do_alloc || live.is_empty() {
                        if let Ok(p) = pool.alloc(size) {
                            live.push(p);
                        }
                    } else {
                        let p = live.swap_remove(size % live.len());
                        prop_assert!(pool.free(p).is_ok());
                    }
                }

                let check = pool.verify_coherence();
                prop_assert!(check.is_ok(), "coherence: {:?}", check);

                for p in live.drain(..) {
                    prop_assert!(pool.free(p).is_ok());
                }
                prop_assert_eq!(pool.free_page_count(), pool.page_count());
                prop_assert_eq!(pool.free_list_runs().len(), 1);
                let check = pool.verify_coherence();
                prop_assert!(check.is_ok(), "coherence after drain: {:?}", check);
            }

            /// Double frees never slip through, whatever the class.
            #[test]
            fn prop_pool_double_free_always_detected(size in 1usize..9000) {
                let (_region, mut pool) = test_pool(8);
                let p = pool.alloc(size).unwrap();
                pool.free(p).unwrap();
                prop_assert!(matches!(pool.free(p), Err(SlabError::DoubleFree { .. })), "expected DoubleFree error");
            }
        }
    }
}
