use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, UnsafeCell};
use core::cmp::Ordering;
use core::mem::size_of;
use core::ops::Range;

use intrusive_collections::{
    intrusive_adapter, KeyAdapter, LinkedList, LinkedListLink, RBTree, RBTreeLink, UnsafeRef,
};

use crate::util::{
    align_down, align_up, bit_vector_clear, bit_vector_fill, bit_vector_get_bit,
    bit_vector_index_of, bit_vector_set_bit, normalize_alignment,
};
use crate::virtual_memory::{self, flush_instruction_cache, MemoryFlags};
use crate::Error;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub const DEFAULT_POISON_PATTERN: u32 = 0xCCCCCCCC; // int3
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_POISON_PATTERN: u32 = 0x0000CDCD; // udf #0xcdcd
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub const DEFAULT_POISON_PATTERN: u32 = 0xCDCDCDCD;

/// Number of pools to use when [`SlabOptions::use_multiple_pools`] is set.
///
/// Each pool doubles the granularity of the previous one.
const MULTI_POOL_COUNT: usize = 3;

/// Minimum granularity (and the default granularity for pool #0).
const MIN_GRANULARITY: usize = 64;

/// Maximum granularity accepted from options.
const MAX_GRANULARITY: usize = 256;

/// Maximum slab size reached by doubling (32MB). Larger slabs only exist for larger requests.
pub const MAX_SLAB_SIZE: usize = 32 * 1024 * 1024;

/// Largest single request; area indices are kept in `u32`.
pub const MAX_ALLOCATION_SIZE: usize = u32::MAX as usize / 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabOptions {
    /// Initial slab size; `0` (or anything that is not a power of two in `64KB..=256MB`) selects the
    /// page allocation granularity of the host.
    pub slab_size: usize,
    /// Allocation granularity in bytes; `0` (or anything that is not a power of two in `64..=256`)
    /// selects 64 bytes.
    pub granularity: usize,
    /// Enables 3 pools having 1x, 2x and 4x granularity, each request going to the coarsest pool
    /// its size is a multiple of.
    pub use_multiple_pools: bool,
    /// Unmap a slab as soon as it becomes empty instead of keeping one empty slab per pool.
    pub immediate_release: bool,
    /// Map slabs read+write+execute. Protection changes become bookkeeping only.
    pub write_execute: bool,
    /// Overwrite memory with `poison_pattern` when it is mapped and when it is released.
    pub poison_memory: bool,
    pub poison_pattern: u32,
}

impl Default for SlabOptions {
    fn default() -> Self {
        Self {
            slab_size: 0,
            granularity: 0,
            use_multiple_pools: false,
            immediate_release: false,
            write_execute: false,
            poison_memory: false,
            poison_pattern: DEFAULT_POISON_PATTERN,
        }
    }
}

/// Usage counters of a [`SlabAllocator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Number of mapped slabs.
    pub slab_count: usize,
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Bytes mapped for all slabs.
    pub reserved_size: usize,
    /// Bytes handed out, rounded to granularity.
    pub used_size: usize,
    /// Bytes of bookkeeping kept outside of the slabs.
    pub overhead_size: usize,
}

/// Iterates ranges of clear bits of a bit-vector.
struct FreeRangeIterator<'a> {
    slice: &'a [u32],
    idx: usize,
    end: usize,
    bit_word: u32,
}

const BIT_WORD_SIZE: usize = core::mem::size_of::<u32>() * 8;

impl<'a> FreeRangeIterator<'a> {
    const XOR_MASK: u32 = u32::MAX;

    fn new(data: &'a [u32], start: usize, end: usize) -> Self {
        let idx = align_down(start, BIT_WORD_SIZE);
        let slice = &data[idx / BIT_WORD_SIZE..];

        let mut bit_word = 0;

        if idx < end {
            bit_word =
                (slice[0] ^ Self::XOR_MASK) & (u32::MAX << (start as u32 % BIT_WORD_SIZE as u32));
        }

        Self {
            slice,
            idx,
            end,
            bit_word,
        }
    }

    /// Returns the next free range. A range that ends on a word boundary is extended into the
    /// following words until it is at least `range_hint` long or a used bit is found.
    fn next_range(&mut self, range_hint: u32) -> Option<Range<u32>> {
        while self.bit_word == 0 {
            self.idx += BIT_WORD_SIZE;

            if self.idx >= self.end {
                return None;
            }

            self.slice = &self.slice[1..];
            self.bit_word = self.slice[0] ^ Self::XOR_MASK;
        }

        let i = self.bit_word.trailing_zeros();
        let start = self.idx as u32 + i;
        self.bit_word = !(self.bit_word ^ !(u32::MAX << i));
        let mut end;
        if self.bit_word == 0 {
            end = (self.idx as u32 + BIT_WORD_SIZE as u32).min(self.end as _);

            while end.wrapping_sub(start) < range_hint {
                self.idx += BIT_WORD_SIZE;

                if self.idx >= self.end {
                    break;
                }

                self.slice = &self.slice[1..];
                self.bit_word = self.slice[0] ^ Self::XOR_MASK;

                if self.bit_word != u32::MAX {
                    // The run continues up to the first used area of this word; the free areas
                    // after it stay in `bit_word` for the next call.
                    let j = (!self.bit_word).trailing_zeros();
                    end = (self.idx as u32 + j).min(self.end as _);
                    self.bit_word ^= !(u32::MAX << j);
                    break;
                }

                end = (self.idx as u32 + BIT_WORD_SIZE as u32).min(self.end as _);
                self.bit_word = 0;
            }

            Some(start..end)
        } else {
            let j = self.bit_word.trailing_zeros();
            end = (self.idx as u32 + j).min(self.end as _);

            self.bit_word = !(self.bit_word ^ !(u32::MAX << j));

            Some(start..end)
        }
    }
}

/// A contiguous mapping carved into `granularity` sized areas.
///
/// Nothing is stored inside the mapping itself. The `used` bit-vector marks allocated areas and
/// the `stop` bit-vector marks the last area of every allocation.
struct Slab {
    tree_link: RBTreeLink,
    list_link: LinkedListLink,

    /// Pool that owns this slab.
    pool: *mut SlabPool,
    ptr: *mut u8,
    size: usize,

    flags: Cell<u32>,
    area_size: Cell<u32>,
    area_used: Cell<u32>,
    largest_unused_area: Cell<u32>,
    search_start: Cell<u32>,
    search_end: Cell<u32>,

    used_bitvector: UnsafeCell<Vec<u32>>,
    stop_bitvector: UnsafeCell<Vec<u32>>,
}

impl Slab {
    const FLAG_EMPTY: u32 = 0x00000001;
    const FLAG_DIRTY: u32 = 0x00000002;

    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn add_flags(&self, flags: u32) {
        self.flags.set(self.flags() | flags);
    }

    fn clear_flags(&self, flags: u32) {
        self.flags.set(self.flags() & !flags);
    }

    fn is_dirty(&self) -> bool {
        (self.flags() & Self::FLAG_DIRTY) != 0
    }

    fn is_empty(&self) -> bool {
        (self.flags() & Self::FLAG_EMPTY) != 0
    }

    fn area_used(&self) -> u32 {
        self.area_used.get()
    }

    fn area_size(&self) -> u32 {
        self.area_size.get()
    }

    fn area_available(&self) -> u32 {
        self.area_size() - self.area_used()
    }

    fn used_bitvector(&self) -> &Vec<u32> {
        // SAFETY: bit-vectors are only touched by the allocator that owns the slab.
        unsafe { &*self.used_bitvector.get() }
    }

    fn stop_bitvector(&self) -> &Vec<u32> {
        unsafe { &*self.stop_bitvector.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn used_bitvector_mut(&self) -> &mut Vec<u32> {
        unsafe { &mut *self.used_bitvector.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn stop_bitvector_mut(&self) -> &mut Vec<u32> {
        unsafe { &mut *self.stop_bitvector.get() }
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.ptr as usize && addr < self.ptr as usize + self.size
    }

    #[allow(clippy::mut_from_ref)]
    fn pool(&self) -> &mut SlabPool {
        // SAFETY: pools outlive their slabs and are only accessed by the owning allocator.
        unsafe { &mut *self.pool }
    }

    /// First-fit search for `area_size` free areas starting at a multiple of `area_alignment`.
    fn find_free_area(&self, area_size: u32, area_alignment: u32) -> Option<u32> {
        if self.area_available() < area_size {
            return None;
        }

        if !self.is_dirty() && self.largest_unused_area.get() < area_size {
            return None;
        }

        let mut it = FreeRangeIterator::new(
            self.used_bitvector(),
            self.search_start.get() as _,
            self.search_end.get() as _,
        );

        let mut search_start = u32::MAX;
        let mut search_end = 0;
        let mut largest_area = 0;

        while let Some(range) = it.next_range(area_size + area_alignment - 1) {
            if range.start >= range.end {
                continue;
            }

            let aligned_start = align_up(range.start as usize, area_alignment as usize) as u32;

            if aligned_start < range.end && range.end - aligned_start >= area_size {
                return Some(aligned_start);
            }

            search_start = search_start.min(range.start);
            search_end = search_end.max(range.end);
            largest_area = largest_area.max(range.end - range.start);
        }

        if search_start != u32::MAX {
            self.search_start.set(search_start);
            self.search_end.set(search_end);
            self.largest_unused_area.set(largest_area);
            self.clear_flags(Self::FLAG_DIRTY);
        }

        None
    }

    /// Returns `[start, end)` areas of the allocation starting exactly at `ptr`.
    fn allocated_area(&self, ptr: *const u8) -> Result<(u32, u32), Error> {
        let pool = self.pool();
        let offset = ptr as usize - self.ptr as usize;

        if offset & (pool.granularity - 1) != 0 {
            return Err(Error::InvalidArgument);
        }

        let area_start = (offset >> pool.granularity_log2) as u32;

        if !bit_vector_get_bit(self.used_bitvector(), area_start as _) {
            return Err(Error::InvalidArgument);
        }

        // `ptr` must not point into the middle of an allocation.
        if area_start != 0
            && bit_vector_get_bit(self.used_bitvector(), area_start as usize - 1)
            && !bit_vector_get_bit(self.stop_bitvector(), area_start as usize - 1)
        {
            return Err(Error::InvalidArgument);
        }

        let area_end =
            bit_vector_index_of(self.stop_bitvector(), area_start as _, true) as u32 + 1;

        Ok((area_start, area_end))
    }

    fn mark_allocated_area(&self, allocated_area_start: u32, allocated_area_end: u32) {
        let allocated_area_size = allocated_area_end - allocated_area_start;

        bit_vector_fill(
            self.used_bitvector_mut(),
            allocated_area_start as _,
            allocated_area_size as _,
        );
        bit_vector_set_bit(
            self.stop_bitvector_mut(),
            allocated_area_end as usize - 1,
            true,
        );

        self.pool().total_area_used += allocated_area_size as usize;
        self.area_used.set(self.area_used() + allocated_area_size);

        if self.area_available() == 0 {
            self.search_start.set(self.area_size());
            self.search_end.set(0);
            self.largest_unused_area.set(0);
            self.clear_flags(Self::FLAG_DIRTY);
        } else {
            if self.search_start.get() == allocated_area_start {
                self.search_start.set(allocated_area_end);
            }

            if self.search_end.get() == allocated_area_end {
                self.search_end.set(allocated_area_start);
            }

            self.add_flags(Self::FLAG_DIRTY);
        }
    }

    fn mark_released_area(&self, released_area_start: u32, released_area_end: u32) {
        let released_area_size = released_area_end - released_area_start;

        self.pool().total_area_used -= released_area_size as usize;
        self.area_used.set(self.area_used() - released_area_size);
        self.search_start
            .set(self.search_start.get().min(released_area_start));
        self.search_end
            .set(self.search_end.get().max(released_area_end));

        bit_vector_clear(
            self.used_bitvector_mut(),
            released_area_start as _,
            released_area_size as _,
        );
        bit_vector_set_bit(
            self.stop_bitvector_mut(),
            released_area_end as usize - 1,
            false,
        );

        if self.area_used() == 0 {
            self.search_start.set(0);
            self.search_end.set(self.area_size());
            self.largest_unused_area.set(self.area_size());
            self.add_flags(Self::FLAG_EMPTY);
            self.clear_flags(Self::FLAG_DIRTY);
        } else {
            self.add_flags(Self::FLAG_DIRTY);
        }
    }

    fn mark_shrunk_area(&self, shrunk_area_start: u32, shrunk_area_end: u32) {
        let shrunk_area_size = shrunk_area_end - shrunk_area_start;

        // Shrinking to zero areas is a release.
        debug_assert!(shrunk_area_start != 0);

        self.pool().total_area_used -= shrunk_area_size as usize;
        self.area_used.set(self.area_used() - shrunk_area_size);
        self.search_start
            .set(self.search_start.get().min(shrunk_area_start));
        self.search_end
            .set(self.search_end.get().max(shrunk_area_end));

        bit_vector_clear(
            self.used_bitvector_mut(),
            shrunk_area_start as _,
            shrunk_area_size as _,
        );
        bit_vector_set_bit(
            self.stop_bitvector_mut(),
            shrunk_area_end as usize - 1,
            false,
        );
        bit_vector_set_bit(
            self.stop_bitvector_mut(),
            shrunk_area_start as usize - 1,
            true,
        );

        self.add_flags(Self::FLAG_DIRTY);
    }
}

intrusive_adapter!(SlabTreeAdapter = UnsafeRef<Slab> : Slab { tree_link: RBTreeLink });
intrusive_adapter!(SlabListAdapter = UnsafeRef<Slab> : Slab { list_link: LinkedListLink });

/// Address range key of a slab. Slabs never overlap, so overlapping keys compare equal, which lets a
/// one byte probe find the slab containing it.
struct SlabKey {
    start: usize,
    end: usize,
}

impl SlabKey {
    fn probe(ptr: *const u8) -> Self {
        Self {
            start: ptr as usize,
            end: ptr as usize + 1,
        }
    }
}

impl PartialEq for SlabKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SlabKey {}

impl PartialOrd for SlabKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlabKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.end <= other.start {
            Ordering::Less
        } else if self.start >= other.end {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl<'a> KeyAdapter<'a> for SlabTreeAdapter {
    type Key = SlabKey;

    fn get_key(
        &self,
        value: &'a <Self::PointerOps as intrusive_collections::PointerOps>::Value,
    ) -> Self::Key {
        SlabKey {
            start: value.ptr as usize,
            end: value.ptr as usize + value.size,
        }
    }
}

struct SlabPool {
    slabs: LinkedList<SlabListAdapter>,

    slab_count: usize,
    granularity: usize,
    granularity_log2: u32,
    empty_slab_count: usize,
    total_area_size: usize,
    total_area_used: usize,
    total_overhead_bytes: usize,
}

impl SlabPool {
    fn new(granularity: usize) -> Self {
        Self {
            slabs: LinkedList::new(SlabListAdapter::new()),
            slab_count: 0,
            granularity,
            granularity_log2: granularity.trailing_zeros(),
            empty_slab_count: 0,
            total_area_size: 0,
            total_area_used: 0,
            total_overhead_bytes: 0,
        }
    }

    fn byte_size_from_area_size(&self, area_size: u32) -> usize {
        area_size as usize * self.granularity
    }

    fn area_size_from_byte_size(&self, byte_size: usize) -> u32 {
        ((byte_size + self.granularity - 1) >> self.granularity_log2) as u32
    }

    fn area_alignment(&self, alignment: usize) -> u32 {
        (alignment >> self.granularity_log2).max(1) as u32
    }

    fn bit_word_count_from_area_size(&self, area_size: u32) -> usize {
        align_up(area_size as _, 32) / 32
    }
}

/// Region allocator backing a memory manager.
///
/// Implementation notes:
///
/// - Memory is mapped in slabs. Each slab is split into areas of the pool granularity and tracked
///   by two bit-vectors kept outside of the mapping, so executable pages never hold allocator
///   metadata. The 'used' bit-vector tracks allocated areas and the 'stop' bit-vector marks where
///   every allocation ends.
///
/// - All slabs of all pools sit in an RB tree keyed by address range, which is how `release()`,
///   `shrink()`, `query()` and `alloc_near()` find the slab owning a pointer.
///
/// - Every slab carries the protection of the whole allocator. [`protect_all`](Self::protect_all)
///   switches every slab at once and new slabs are mapped with the current protection.
pub struct SlabAllocator {
    options: SlabOptions,
    slab_size: usize,
    granularity: usize,
    protection: MemoryFlags,

    allocation_count: usize,
    tree: RBTree<SlabTreeAdapter>,
    pools: Box<[*mut SlabPool]>,
}

// SAFETY: slabs and pools are exclusively owned by the allocator and every mutation goes through
// `&mut self`, so moving the allocator to another thread moves all of its state with it.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    /// Creates an allocator. No memory is mapped until the first allocation.
    pub fn new(options: SlabOptions) -> Self {
        let vm_info = virtual_memory::info();

        let mut slab_size = options.slab_size;
        let mut granularity = options.granularity;

        let pool_count = if options.use_multiple_pools {
            MULTI_POOL_COUNT
        } else {
            1
        };

        if !(64 * 1024..=256 * 1024 * 1024).contains(&slab_size) || !slab_size.is_power_of_two() {
            slab_size = vm_info.page_granularity as _;
        }

        if !(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&granularity)
            || !granularity.is_power_of_two()
        {
            granularity = MIN_GRANULARITY;
        }

        let pools = (0..pool_count)
            .map(|pool_id| Box::into_raw(Box::new(SlabPool::new(granularity << pool_id))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            options,
            slab_size,
            granularity,
            protection: MemoryFlags::ACCESS_RW,
            allocation_count: 0,
            tree: RBTree::new(SlabTreeAdapter::new()),
            pools,
        }
    }

    /// Base allocation granularity; every allocation is a multiple of it.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Protection currently applied to every slab.
    pub fn protection(&self) -> MemoryFlags {
        self.protection
    }

    pub fn set_poison_memory(&mut self, poison: bool) {
        self.options.poison_memory = poison;
    }

    fn mapping_access(&self) -> MemoryFlags {
        if self.options.write_execute {
            MemoryFlags::ACCESS_RWX
        } else {
            MemoryFlags::ACCESS_RW
        }
    }

    fn size_to_pool_id(&self, size: usize) -> usize {
        let mut pool_id = self.pools.len() - 1;
        let mut granularity = self.granularity << pool_id;

        while pool_id != 0 {
            if align_up(size, granularity) == size {
                break;
            }

            pool_id -= 1;
            granularity >>= 1;
        }

        pool_id
    }

    fn checked_alignment(alignment: usize) -> Result<usize, Error> {
        let alignment = normalize_alignment(alignment).ok_or(Error::InvalidArgument)?;

        // Slabs are only guaranteed to be page aligned.
        if alignment > virtual_memory::info().page_size as usize {
            return Err(Error::InvalidArgument);
        }

        Ok(alignment)
    }

    fn checked_size(&self, size: usize) -> Result<usize, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        if size > MAX_ALLOCATION_SIZE {
            return Err(Error::TooLarge);
        }

        Ok(align_up(size, self.granularity))
    }

    fn bitvector_size_to_byte_size(area_size: u32) -> usize {
        ((area_size as usize + 32 - 1) / 32) * size_of::<u32>()
    }

    fn calculate_ideal_slab_size(&self, pool: &SlabPool, allocation_size: usize) -> usize {
        let mut slab_size = pool
            .slabs
            .back()
            .get()
            .map(|slab| slab.size)
            .unwrap_or(self.slab_size);

        if slab_size < MAX_SLAB_SIZE {
            slab_size *= 2;
        }

        if allocation_size > slab_size {
            slab_size = align_up(allocation_size, slab_size);

            // overflow
            if slab_size < allocation_size {
                return 0;
            }
        }

        slab_size
    }

    fn find_slab(&self, ptr: *const u8) -> Option<&Slab> {
        self.tree.find(&SlabKey::probe(ptr)).get()
    }

    unsafe fn new_slab(&self, pool: *mut SlabPool, slab_size: usize) -> Result<Box<Slab>, Error> {
        let area_size = (*pool).area_size_from_byte_size(slab_size);
        let num_bit_words = (*pool).bit_word_count_from_area_size(area_size);

        let ptr = virtual_memory::alloc(slab_size, self.mapping_access())?;

        if self.options.poison_memory {
            fill_pattern(ptr, self.options.poison_pattern, slab_size);
        }

        if !self.options.write_execute && self.protection != MemoryFlags::ACCESS_RW {
            if let Err(err) = virtual_memory::protect(ptr, slab_size, self.protection) {
                let _ = virtual_memory::release(ptr, slab_size);
                return Err(err);
            }
        }

        if self.protection.contains(MemoryFlags::ACCESS_EXECUTE) {
            flush_instruction_cache(ptr, slab_size);
        }

        tracing::debug!(
            ptr = ?ptr,
            size = slab_size,
            granularity = (*pool).granularity,
            "mapped slab"
        );

        Ok(Box::new(Slab {
            tree_link: RBTreeLink::new(),
            list_link: LinkedListLink::new(),
            pool,
            ptr,
            size: slab_size,
            flags: Cell::new(0),
            area_size: Cell::new(area_size),
            area_used: Cell::new(0),
            largest_unused_area: Cell::new(area_size),
            search_start: Cell::new(0),
            search_end: Cell::new(area_size),
            used_bitvector: UnsafeCell::new(vec![0; num_bit_words]),
            stop_bitvector: UnsafeCell::new(vec![0; num_bit_words]),
        }))
    }

    unsafe fn delete_slab(&mut self, slab: *mut Slab) -> Result<(), Error> {
        let slab = Box::from_raw(slab);

        tracing::debug!(ptr = ?slab.ptr, size = slab.size, "unmapped slab");

        virtual_memory::release(slab.ptr, slab.size)
    }

    unsafe fn insert_slab(&mut self, slab: *mut Slab) {
        let s = &*slab;
        let pool = &mut *s.pool;

        self.tree.insert(UnsafeRef::from_raw(slab));
        pool.slabs.push_front(UnsafeRef::from_raw(slab));

        pool.slab_count += 1;
        pool.total_area_size += s.area_size() as usize;
        pool.total_overhead_bytes +=
            size_of::<Slab>() + Self::bitvector_size_to_byte_size(s.area_size()) * 2;
    }

    unsafe fn remove_slab(&mut self, slab: *const Slab) -> *mut Slab {
        let s = &*slab;
        let pool = &mut *s.pool;

        self.tree.cursor_mut_from_ptr(slab).remove();
        let removed = pool.slabs.cursor_mut_from_ptr(slab).remove();
        debug_assert!(removed.is_some(), "slab is not linked into its pool");

        let area_size = s.area_size();

        pool.slab_count -= 1;
        pool.total_area_size -= area_size as usize;
        pool.total_overhead_bytes -=
            size_of::<Slab>() + Self::bitvector_size_to_byte_size(area_size) * 2;

        slab as *mut Slab
    }

    unsafe fn commit_area(&mut self, slab: &Slab, area_index: u32, area_size: u32) -> *mut u8 {
        let pool = slab.pool();

        if slab.is_empty() {
            pool.empty_slab_count -= 1;
            slab.clear_flags(Slab::FLAG_EMPTY);
        }

        self.allocation_count += 1;
        slab.mark_allocated_area(area_index, area_index + area_size);

        slab.ptr.add(pool.byte_size_from_area_size(area_index))
    }

    /// Overwrites `[span, span + size)` with the poison pattern, lifting write protection around the
    /// write when the slabs are currently executable.
    ///
    /// The protection change covers whole pages, so live code sharing a page with the span is not
    /// executable until the write is done.
    unsafe fn fill_span(&self, span: *mut u8, size: usize) -> Result<(), Error> {
        if self.options.write_execute || self.protection.contains(MemoryFlags::ACCESS_WRITE) {
            fill_pattern(span, self.options.poison_pattern, size);
        } else {
            let page_size = virtual_memory::info().page_size as usize;
            let start = align_down(span as usize, page_size);
            let end = align_up(span as usize + size, page_size);

            virtual_memory::protect(start as *mut u8, end - start, MemoryFlags::ACCESS_RW)?;
            fill_pattern(span, self.options.poison_pattern, size);
            virtual_memory::protect(start as *mut u8, end - start, self.protection)?;
        }

        if self.protection.contains(MemoryFlags::ACCESS_EXECUTE) {
            flush_instruction_cache(span, size);
        }

        Ok(())
    }

    /// Allocates `size` bytes aligned to `alignment`, mapping a new slab if no existing slab has a
    /// large enough free range.
    ///
    /// The returned memory is a multiple of the granularity; `alignment` must be a power of two not
    /// larger than the page size (`0` means no requirement).
    pub fn alloc(&mut self, size: usize, alignment: usize) -> Result<*mut u8, Error> {
        let alignment = Self::checked_alignment(alignment)?;
        let size = self.checked_size(size)?;

        unsafe {
            let pool = self.pools[self.size_to_pool_id(size)];
            let area_size = (*pool).area_size_from_byte_size(size);
            let area_alignment = (*pool).area_alignment(alignment);

            let found = (*pool)
                .slabs
                .iter()
                .find_map(|slab| {
                    slab.find_free_area(area_size, area_alignment)
                        .map(|area_index| (slab as *const Slab, area_index))
                });

            let (slab, area_index) = match found {
                Some(found) => found,
                None => {
                    let slab_size = self.calculate_ideal_slab_size(&*pool, size);

                    if slab_size == 0 {
                        return Err(Error::TooLarge);
                    }

                    let slab = Box::into_raw(self.new_slab(pool, slab_size)?);
                    self.insert_slab(slab);

                    (slab as *const Slab, 0)
                }
            };

            Ok(self.commit_area(&*slab, area_index, area_size))
        }
    }

    /// Allocates `size` bytes aligned to `alignment` in the slab that contains `anchor`.
    ///
    /// Fails with [`Error::OutOfMemory`] when that slab has no suitable free range; no new memory is
    /// mapped.
    pub fn alloc_near(
        &mut self,
        anchor: *const u8,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8, Error> {
        let alignment = Self::checked_alignment(alignment)?;
        let size = self.checked_size(size)?;

        let slab = self.find_slab(anchor).ok_or(Error::InvalidArgument)? as *const Slab;

        unsafe {
            let slab = &*slab;
            let pool = slab.pool();

            let area_size = pool.area_size_from_byte_size(size);
            let area_index = slab
                .find_free_area(area_size, pool.area_alignment(alignment))
                .ok_or(Error::OutOfMemory)?;

            Ok(self.commit_area(slab, area_index, area_size))
        }
    }

    /// Releases the memory allocated by `alloc` or `alloc_near`.
    pub fn release(&mut self, ptr: *const u8) -> Result<(), Error> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument);
        }

        let slab = self.find_slab(ptr).ok_or(Error::InvalidArgument)? as *const Slab;

        unsafe {
            let slab = &*slab;
            let pool = slab.pool();

            let (area_start, area_end) = slab.allocated_area(ptr)?;

            if self.options.poison_memory {
                let span_ptr = slab.ptr.add(pool.byte_size_from_area_size(area_start));
                let span_size = pool.byte_size_from_area_size(area_end - area_start);

                self.fill_span(span_ptr, span_size)?;
            }

            self.allocation_count -= 1;
            slab.mark_released_area(area_start, area_end);

            if slab.area_used() == 0 {
                if pool.empty_slab_count != 0 || self.options.immediate_release {
                    let slab = self.remove_slab(slab);
                    self.delete_slab(slab)?;
                } else {
                    pool.empty_slab_count += 1;
                }
            }
        }

        Ok(())
    }

    /// Shrinks the memory allocated by `alloc` to `new_size`, returning the tail to free space.
    pub fn shrink(&mut self, ptr: *const u8, new_size: usize) -> Result<(), Error> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument);
        }

        if new_size == 0 {
            return self.release(ptr);
        }

        let slab = self.find_slab(ptr).ok_or(Error::InvalidArgument)? as *const Slab;

        unsafe {
            let slab = &*slab;
            let pool = slab.pool();

            let (area_start, area_end) = slab.allocated_area(ptr)?;

            let area_prev_size = area_end - area_start;
            let area_shrunk_size = pool.area_size_from_byte_size(new_size);

            if area_shrunk_size > area_prev_size {
                return Err(Error::InvalidState);
            }

            let area_diff = area_prev_size - area_shrunk_size;

            if area_diff != 0 {
                let tail_start = area_start + area_shrunk_size;

                if self.options.poison_memory {
                    let span_ptr = slab.ptr.add(pool.byte_size_from_area_size(tail_start));
                    let span_size = pool.byte_size_from_area_size(area_diff);

                    self.fill_span(span_ptr, span_size)?;
                }

                slab.mark_shrunk_area(tail_start, area_end);
            }
        }

        Ok(())
    }

    /// Returns the start and the size of the allocation starting at `ptr`.
    pub fn query(&self, ptr: *const u8) -> Result<(*mut u8, usize), Error> {
        let slab = self.find_slab(ptr).ok_or(Error::InvalidArgument)?;
        let pool = slab.pool();

        let (area_start, area_end) = slab.allocated_area(ptr)?;
        let byte_offset = pool.byte_size_from_area_size(area_start);
        let byte_size = pool.byte_size_from_area_size(area_end - area_start);

        Ok((unsafe { slab.ptr.add(byte_offset) }, byte_size))
    }

    /// Returns `true` if `a` and `b` both point into the same slab.
    pub fn same_slab(&self, a: *const u8, b: *const u8) -> bool {
        self.find_slab(a).map_or(false, |slab| slab.contains(b))
    }

    /// Size of the slab containing `ptr`, which bounds the distance between any two allocations in
    /// it.
    pub fn slab_size_of(&self, ptr: *const u8) -> Option<usize> {
        self.find_slab(ptr).map(|slab| slab.size)
    }

    /// Applies `access` to every slab and remembers it for slabs mapped later.
    ///
    /// Slabs switched to an executable protection have their instruction cache flushed. If the
    /// operating system refuses the change for one slab the error is returned and the recorded
    /// protection is left unchanged; calling again retries every slab.
    pub fn protect_all(&mut self, access: MemoryFlags) -> Result<(), Error> {
        if !self.options.write_execute {
            for slab in self.tree.iter() {
                virtual_memory::protect(slab.ptr, slab.size, access)?;
            }
        }

        self.protection = access;

        if access.contains(MemoryFlags::ACCESS_EXECUTE) {
            for slab in self.tree.iter() {
                flush_instruction_cache(slab.ptr, slab.size);
            }
        }

        Ok(())
    }

    pub fn statistics(&self) -> Statistics {
        let mut statistics = Statistics {
            allocation_count: self.allocation_count,
            ..Default::default()
        };

        for &pool in self.pools.iter() {
            let pool = unsafe { &*pool };

            statistics.slab_count += pool.slab_count;
            statistics.reserved_size += pool.byte_size_from_area_size(pool.total_area_size as u32);
            statistics.used_size += pool.byte_size_from_area_size(pool.total_area_used as u32);
            statistics.overhead_size += pool.total_overhead_bytes;
        }

        statistics
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        self.tree.clear();

        for &pool in self.pools.iter() {
            unsafe {
                let mut pool = Box::from_raw(pool);

                while let Some(slab) = pool.slabs.pop_front() {
                    let slab = Box::from_raw(UnsafeRef::into_raw(slab));
                    let _ = virtual_memory::release(slab.ptr, slab.size);
                }
            }
        }
    }
}

#[inline]
unsafe fn fill_pattern(mem: *mut u8, pattern: u32, size_in_bytes: usize) {
    let n = size_in_bytes / 4;

    let p = mem as *mut u32;

    for i in 0..n {
        p.add(i).write(pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> SlabAllocator {
        SlabAllocator::new(SlabOptions::default())
    }

    #[test]
    fn allocations_are_granular_and_disjoint() {
        let mut slabs = allocator();

        let a = slabs.alloc(100, 0).unwrap();
        let b = slabs.alloc(1, 0).unwrap();
        let c = slabs.alloc(64, 0).unwrap();

        assert_eq!(a as usize % 64, 0);
        assert_eq!(slabs.query(a).unwrap(), (a, 128));
        assert_eq!(slabs.query(b).unwrap(), (b, 64));
        assert_eq!(b as usize, a as usize + 128);
        assert_eq!(c as usize, b as usize + 64);
        assert_eq!(slabs.statistics().allocation_count, 3);
    }

    #[test]
    fn free_range_stops_at_used_areas_of_next_word() {
        let mut used = [0u32; 4];
        bit_vector_fill(&mut used, 0, 30);
        bit_vector_fill(&mut used, 32, 4);

        let mut it = FreeRangeIterator::new(&used, 30, 128);
        let mut ranges = Vec::new();
        while let Some(range) = it.next_range(4) {
            ranges.push(range);
        }

        assert_eq!(ranges, vec![30..32, 36..64, 64..96, 96..128]);
    }

    #[test]
    fn reused_hole_does_not_overlap_following_allocation() {
        let mut slabs = allocator();

        let _a = slabs.alloc(1920, 0).unwrap();
        let b = slabs.alloc(128, 0).unwrap();
        let c = slabs.alloc(256, 0).unwrap();

        slabs.release(b).unwrap();
        let d = slabs.alloc(256, 0).unwrap();

        let (c, d) = (c as usize, d as usize);
        assert!(d + 256 <= c || c + 256 <= d);

        slabs.release(c as *const u8).unwrap();
        slabs.release(d as *const u8).unwrap();
    }

    #[test]
    fn alignment_is_honored() {
        let mut slabs = allocator();

        let _ = slabs.alloc(64, 0).unwrap();
        let p = slabs.alloc(64, 512).unwrap();
        assert_eq!(p as usize % 512, 0);

        let page = virtual_memory::info().page_size as usize;
        let q = slabs.alloc(64, page).unwrap();
        assert_eq!(q as usize % page, 0);
    }

    #[test]
    fn bad_requests_are_rejected() {
        let mut slabs = allocator();

        assert_eq!(slabs.alloc(0, 0), Err(Error::InvalidArgument));
        assert_eq!(slabs.alloc(64, 3), Err(Error::InvalidArgument));
        assert_eq!(slabs.alloc(usize::MAX / 2, 0), Err(Error::TooLarge));

        let page = virtual_memory::info().page_size as usize;
        assert_eq!(slabs.alloc(64, page * 2), Err(Error::InvalidArgument));
    }

    #[test]
    fn released_memory_is_reused() {
        let mut slabs = allocator();

        let a = slabs.alloc(256, 0).unwrap();
        let _b = slabs.alloc(256, 0).unwrap();

        slabs.release(a).unwrap();
        let c = slabs.alloc(200, 0).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn interior_pointers_are_rejected() {
        let mut slabs = allocator();

        let a = slabs.alloc(256, 0).unwrap();
        let inside = unsafe { a.add(64) };

        assert_eq!(slabs.release(inside), Err(Error::InvalidArgument));
        assert_eq!(slabs.shrink(inside, 64), Err(Error::InvalidArgument));
        assert_eq!(slabs.release(unsafe { a.add(3) }), Err(Error::InvalidArgument));
        assert_eq!(
            slabs.release(core::ptr::null()),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn shrink_returns_tail() {
        let mut slabs = allocator();

        let a = slabs.alloc(4096, 0).unwrap();
        let _b = slabs.alloc(64, 0).unwrap();

        slabs.shrink(a, 37).unwrap();
        assert_eq!(slabs.query(a).unwrap(), (a, 64));

        let c = slabs.alloc(4000, 16).unwrap();
        assert_eq!(c as usize, a as usize + 64);

        assert_eq!(slabs.shrink(a, 128), Err(Error::InvalidState));
    }

    #[test]
    fn alloc_near_stays_in_slab() {
        let mut slabs = allocator();

        let a = slabs.alloc(1024, 0).unwrap();
        let stub = slabs.alloc_near(a, 16, 16).unwrap();

        assert!(slabs.same_slab(a, stub));
        assert_eq!(stub as usize % 16, 0);

        let slab_size = slabs.slab_size_of(a).unwrap();
        assert_eq!(
            slabs.alloc_near(a, slab_size, 0),
            Err(Error::OutOfMemory)
        );
        assert_eq!(
            slabs.alloc_near(core::ptr::null(), 16, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn large_allocation_maps_large_slab() {
        let mut slabs = allocator();

        let big = slabs.alloc(3 * 1024 * 1024, 0).unwrap();
        assert!(slabs.slab_size_of(big).unwrap() >= 3 * 1024 * 1024);

        slabs.release(big).unwrap();
    }

    #[test]
    fn released_memory_is_poisoned() {
        let mut slabs = allocator();
        slabs.set_poison_memory(true);

        let keep = slabs.alloc(64, 0).unwrap();
        let a = slabs.alloc(128, 0).unwrap();

        unsafe {
            core::ptr::write_bytes(a, 0x90, 128);
            core::ptr::write_bytes(keep, 0x90, 64);
        }

        slabs.release(a).unwrap();

        let pattern = DEFAULT_POISON_PATTERN.to_ne_bytes();
        let bytes = unsafe { core::slice::from_raw_parts(a, 128) };
        for chunk in bytes.chunks(4) {
            assert_eq!(chunk, &pattern[..]);
        }

        let kept = unsafe { core::slice::from_raw_parts(keep, 64) };
        assert!(kept.iter().all(|&b| b == 0x90));
    }

    #[test]
    fn poisoning_works_while_executable() {
        let mut slabs = allocator();
        slabs.set_poison_memory(true);

        let keep = slabs.alloc(64, 0).unwrap();
        let a = slabs.alloc(64, 0).unwrap();
        unsafe { core::ptr::write_bytes(a, 0x90, 64) };

        slabs.protect_all(MemoryFlags::ACCESS_RX).unwrap();
        slabs.release(a).unwrap();

        assert_eq!(
            unsafe { a.cast::<u32>().read() },
            DEFAULT_POISON_PATTERN
        );
        assert_eq!(slabs.protection(), MemoryFlags::ACCESS_RX);

        slabs.protect_all(MemoryFlags::ACCESS_RW).unwrap();
        unsafe { keep.write(1) };
    }

    #[test]
    fn new_slabs_adopt_current_protection() {
        let mut slabs = allocator();

        slabs.protect_all(MemoryFlags::ACCESS_RX).unwrap();
        let a = slabs.alloc(64, 0).unwrap();
        assert_eq!(slabs.statistics().slab_count, 1);

        slabs.protect_all(MemoryFlags::ACCESS_RW).unwrap();
        unsafe { a.write(7) };
        assert_eq!(unsafe { a.read() }, 7);
    }

    #[test]
    fn empty_slab_is_cached_once() {
        let mut slabs = allocator();

        for _ in 0..100 {
            let a = slabs.alloc(2048, 0).unwrap();
            slabs.release(a).unwrap();
        }

        let stats = slabs.statistics();
        assert_eq!(stats.slab_count, 1);
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.used_size, 0);
        assert!(stats.reserved_size > 0);
    }

    #[test]
    fn immediate_release_unmaps_empty_slabs() {
        let mut slabs = SlabAllocator::new(SlabOptions {
            immediate_release: true,
            ..Default::default()
        });

        let a = slabs.alloc(64, 0).unwrap();
        assert_eq!(slabs.statistics().slab_count, 1);

        slabs.release(a).unwrap();
        assert_eq!(slabs.statistics().slab_count, 0);
    }

    #[test]
    fn multiple_pools_use_coarser_granularity() {
        let mut slabs = SlabAllocator::new(SlabOptions {
            use_multiple_pools: true,
            ..Default::default()
        });

        let a = slabs.alloc(64, 0).unwrap();
        let b = slabs.alloc(256, 0).unwrap();

        assert!(!slabs.same_slab(a, b));
        assert_eq!(slabs.query(b).unwrap().1, 256);
        assert_eq!(slabs.statistics().slab_count, 2);
    }
}
