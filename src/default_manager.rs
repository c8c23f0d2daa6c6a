use core::ffi::c_void;
use core::hash::Hash;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::manager::{
    ExceptionTable, FrameRegister, FunctionBody, JitMemoryManager, Permission, StubAllocation,
};
use crate::slab::{
    SlabAllocator, SlabOptions, Statistics, DEFAULT_POISON_PATTERN, MAX_ALLOCATION_SIZE,
};
use crate::util::{align_up, normalize_alignment};
use crate::virtual_memory::{self, MemoryFlags};
use crate::Error;

/// Configuration of a [`DefaultMemoryManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryManagerOptions {
    /// Require callers to pass exact sizes to `start_function_body` and `start_exception_table`.
    pub exact_size: bool,
    /// Overwrite freed memory with a trap pattern. Enabled by default in debug builds.
    pub poison_memory: bool,
    pub custom_poison_pattern: Option<u32>,
    /// Capacity handed out by `start_function_body` when the caller passes no size.
    pub function_body_size: usize,
    /// Capacity handed out by `start_exception_table` when the caller passes no size.
    pub exception_table_size: usize,
    /// Stub space reserved next to every function body. Stubs that do not fit get another area in
    /// the same slab if there is room.
    pub stub_area_size: usize,
    /// Number of pointer sized slots in the global offset table.
    pub got_entries: usize,
    /// See [`SlabOptions::slab_size`].
    pub slab_size: usize,
    /// See [`SlabOptions::granularity`].
    pub granularity: usize,
    /// See [`SlabOptions::use_multiple_pools`].
    pub use_multiple_pools: bool,
    /// See [`SlabOptions::immediate_release`].
    pub immediate_release: bool,
    /// Map code read+write+execute when the host is not hardened. Permission changes are then
    /// only tracked, never applied.
    pub allow_write_execute: bool,
}

impl Default for MemoryManagerOptions {
    fn default() -> Self {
        Self {
            exact_size: false,
            poison_memory: cfg!(debug_assertions),
            custom_poison_pattern: None,
            function_body_size: 16 * 1024,
            exception_table_size: 4 * 1024,
            stub_area_size: 1024,
            got_entries: 1024,
            slab_size: 0,
            granularity: 0,
            use_multiple_pools: false,
            immediate_release: false,
            allow_write_execute: false,
        }
    }
}

impl MemoryManagerOptions {
    fn slab_options(&self, write_execute: bool) -> SlabOptions {
        SlabOptions {
            slab_size: self.slab_size,
            granularity: self.granularity,
            use_multiple_pools: self.use_multiple_pools,
            immediate_release: self.immediate_release,
            write_execute,
            poison_memory: self.poison_memory,
            poison_pattern: self.custom_poison_pattern.unwrap_or(DEFAULT_POISON_PATTERN),
        }
    }
}

/// Bump region for the stubs of one function.
struct StubArea {
    start: *mut u8,
    capacity: usize,
    used: usize,
}

impl StubArea {
    fn bump(&mut self, size: usize, alignment: usize) -> Option<*mut u8> {
        let base = self.start as usize;
        let aligned = (base + self.used).checked_add(alignment - 1)? & !(alignment - 1);
        let offset = aligned - base;
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.capacity)?;

        self.used = end;
        Some(unsafe { self.start.add(offset) })
    }
}

struct FunctionRecord<G> {
    start: *mut u8,
    actual_size: usize,
    final_size: Option<usize>,
    stub_areas: Vec<StubArea>,
    stubs: Vec<StubAllocation<G>>,
}

struct TableRecord {
    start: *mut u8,
    actual_size: usize,
    final_size: Option<usize>,
    frame_register: Option<FrameRegister>,
}

struct ManagerState<F, G> {
    /// Function bodies, stubs and spaces. Switched between RW and RX as a whole.
    code: SlabAllocator,
    /// Exception tables, globals and the GOT. Never executable.
    data: SlabAllocator,
    permission: Permission,
    functions: HashMap<F, FunctionRecord<G>>,
    tables: HashMap<F, TableRecord>,
    open_function: Option<F>,
    open_table: Option<F>,
    spaces: HashSet<usize>,
    globals: HashSet<usize>,
    got: Option<NonNull<u8>>,
    dlsym_table: Option<NonNull<c_void>>,
}

// SAFETY: the raw pointers refer to memory owned by the allocators stored alongside them and are
// only dereferenced while the state is locked.
unsafe impl<F: Send, G: Send> Send for ManagerState<F, G> {}

/// The memory manager used when the client does not supply one.
///
/// Code lives in one [`SlabAllocator`] and data (exception tables, globals, the GOT) in another.
/// Function bodies are handed out optimistically: `start_function_body` reserves the capacity
/// plus a stub area, and `end_function_body` shrinks both to what was really used. Stubs are
/// always placed in the slab of their function, so the distance between a stub and any byte of
/// its function is below the slab size (32MB unless a single function is larger).
///
/// Only one function body and one exception table may be open at a time; stubs always belong to
/// the open body.
pub struct DefaultMemoryManager<F, G = F> {
    options: MemoryManagerOptions,
    state: Mutex<ManagerState<F, G>>,
}

impl<F: Hash + Eq + Clone, G: Clone> Default for DefaultMemoryManager<F, G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Hash + Eq + Clone, G: Clone> DefaultMemoryManager<F, G> {
    pub fn new() -> Self {
        Self::with_options(MemoryManagerOptions::default())
    }

    pub fn with_options(options: MemoryManagerOptions) -> Self {
        let write_execute =
            options.allow_write_execute && !virtual_memory::has_hardened_runtime();

        Self {
            options,
            state: Mutex::new(ManagerState {
                code: SlabAllocator::new(options.slab_options(write_execute)),
                data: SlabAllocator::new(options.slab_options(false)),
                permission: Permission::Writable,
                functions: HashMap::new(),
                tables: HashMap::new(),
                open_function: None,
                open_table: None,
                spaces: HashSet::new(),
                globals: HashSet::new(),
                got: None,
                dlsym_table: None,
            }),
        }
    }

    pub fn options(&self) -> &MemoryManagerOptions {
        &self.options
    }

    pub fn permission(&self) -> Permission {
        self.state.lock().permission
    }

    pub fn code_statistics(&self) -> Statistics {
        self.state.lock().code.statistics()
    }

    pub fn data_statistics(&self) -> Statistics {
        self.state.lock().data.statistics()
    }

    pub fn function_body(&self, function: &F) -> Option<FunctionBody> {
        let state = self.state.lock();
        let record = state.functions.get(function)?;

        Some(FunctionBody {
            start: record.start,
            actual_end: unsafe { record.start.add(record.actual_size) },
            final_end: record
                .final_size
                .map(|size| unsafe { record.start.add(size) }),
        })
    }

    pub fn exception_table(&self, function: &F) -> Option<ExceptionTable> {
        let state = self.state.lock();
        let record = state.tables.get(function)?;

        Some(ExceptionTable {
            start: record.start,
            actual_end: unsafe { record.start.add(record.actual_size) },
            final_end: record
                .final_size
                .map(|size| unsafe { record.start.add(size) }),
            frame_register: record.frame_register,
        })
    }

    /// Stubs allocated while `function` was open, in allocation order.
    pub fn stubs(&self, function: &F) -> Vec<StubAllocation<G>> {
        self.state
            .lock()
            .functions
            .get(function)
            .map(|record| record.stubs.clone())
            .unwrap_or_default()
    }

    /// Returns memory obtained from `allocate_space`.
    pub fn deallocate_space(&self, ptr: *mut u8) -> Result<(), Error> {
        let mut state = self.state.lock();

        if !state.spaces.remove(&(ptr as usize)) {
            return Err(Error::InvalidArgument);
        }

        state.code.release(ptr)
    }

    /// Returns memory obtained from `allocate_global`.
    pub fn deallocate_global(&self, ptr: *mut u8) -> Result<(), Error> {
        let mut state = self.state.lock();

        if !state.globals.remove(&(ptr as usize)) {
            return Err(Error::InvalidArgument);
        }

        state.data.release(ptr)
    }

    /// Capacity for a `start_*` call: the exact size, the caller's hint, or `default_size`.
    fn requested_capacity(&self, actual_size: usize, default_size: usize) -> Result<usize, Error> {
        if self.options.exact_size {
            if actual_size == 0 {
                return Err(Error::InvalidArgument);
            }

            return checked_capacity(actual_size, 1);
        }

        let requested = if actual_size != 0 {
            actual_size
        } else {
            default_size.max(1)
        };

        checked_capacity(requested, 1)
    }

    fn set_permission(&self, permission: Permission) -> Result<(), Error> {
        let mut state = self.state.lock();

        let access = match permission {
            Permission::Writable => MemoryFlags::ACCESS_RW,
            Permission::Executable => MemoryFlags::ACCESS_RX,
        };

        state.code.protect_all(access)?;
        state.permission = permission;

        tracing::debug!(?permission, "changed code memory permission");

        Ok(())
    }
}

/// Rounds `size` up to `granularity`, rejecting sizes no slab can hold.
fn checked_capacity(size: usize, granularity: usize) -> Result<usize, Error> {
    if size > MAX_ALLOCATION_SIZE {
        return Err(Error::TooLarge);
    }

    Ok(align_up(size, granularity))
}

/// Checks that `[start, end)` lies at the start of a block of `capacity` bytes starting at
/// `expected_start` and returns its size.
fn checked_extent(
    expected_start: *mut u8,
    capacity: usize,
    start: *mut u8,
    end: *mut u8,
) -> Result<usize, Error> {
    if start != expected_start || (end as usize) < (start as usize) {
        return Err(Error::InvalidArgument);
    }

    let size = end as usize - start as usize;

    if size > capacity {
        return Err(Error::InvalidArgument);
    }

    Ok(size)
}

impl<F: Hash + Eq + Clone, G: Clone> JitMemoryManager<F, G> for DefaultMemoryManager<F, G> {
    fn set_memory_writable(&self) -> Result<(), Error> {
        self.set_permission(Permission::Writable)
    }

    fn set_memory_executable(&self) -> Result<(), Error> {
        self.set_permission(Permission::Executable)
    }

    fn set_poison_memory(&self, poison: bool) {
        let mut state = self.state.lock();

        state.code.set_poison_memory(poison);
        state.data.set_poison_memory(poison);
    }

    fn allocate_got(&self) -> Result<(), Error> {
        let mut state = self.state.lock();

        if state.got.is_some() {
            return Err(Error::GotAlreadyAllocated);
        }

        let size = self.options.got_entries.max(1) * size_of::<usize>();
        let ptr = state.data.alloc(size, align_of::<usize>())?;

        // Recycled memory may hold poison.
        unsafe { core::ptr::write_bytes(ptr, 0, size) };

        state.got = NonNull::new(ptr);

        tracing::debug!(ptr = ?ptr, entries = self.options.got_entries, "allocated GOT");

        Ok(())
    }

    fn is_managing_got(&self) -> bool {
        self.state.lock().got.is_some()
    }

    fn got_base(&self) -> Option<NonNull<u8>> {
        self.state.lock().got
    }

    fn set_dlsym_table(&self, table: Option<NonNull<c_void>>) {
        self.state.lock().dlsym_table = table;
    }

    fn dlsym_table(&self) -> Option<NonNull<c_void>> {
        self.state.lock().dlsym_table
    }

    fn needs_exact_size(&self) -> bool {
        self.options.exact_size
    }

    fn start_function_body(
        &self,
        function: &F,
        actual_size: &mut usize,
    ) -> Result<*mut u8, Error> {
        let capacity = self.requested_capacity(*actual_size, self.options.function_body_size)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.open_function.is_some() {
            return Err(Error::GenerationInProgress);
        }

        if state.functions.contains_key(function) {
            return Err(Error::FunctionAlreadyAllocated);
        }

        let granularity = state.code.granularity();
        let capacity = if self.options.exact_size {
            capacity
        } else {
            checked_capacity(capacity, granularity)?
        };
        let stub_area_size = checked_capacity(self.options.stub_area_size, granularity)?;

        let start = state
            .code
            .alloc(capacity.checked_add(stub_area_size).ok_or(Error::TooLarge)?, 0)?;

        // Reserve body and stub area together, then split them so the stub area is guaranteed to
        // land in the same slab.
        let mut stub_areas = Vec::new();

        if stub_area_size != 0 {
            let split = state
                .code
                .shrink(start, capacity)
                .and_then(|_| state.code.alloc_near(start, stub_area_size, 0));

            match split {
                Ok(area) => stub_areas.push(StubArea {
                    start: area,
                    capacity: stub_area_size,
                    used: 0,
                }),
                Err(err) => {
                    let _ = state.code.release(start);
                    return Err(err);
                }
            }
        }

        state.functions.insert(
            function.clone(),
            FunctionRecord {
                start,
                actual_size: capacity,
                final_size: None,
                stub_areas,
                stubs: Vec::new(),
            },
        );
        state.open_function = Some(function.clone());

        *actual_size = capacity;

        tracing::debug!(start = ?start, capacity, "started function body");

        Ok(start)
    }

    fn allocate_stub(
        &self,
        target: &G,
        stub_size: usize,
        alignment: usize,
    ) -> Result<*mut u8, Error> {
        let alignment = normalize_alignment(alignment).ok_or(Error::InvalidArgument)?;

        if stub_size == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let open = state.open_function.as_ref().ok_or(Error::NoOpenFunction)?;
        let record = state
            .functions
            .get_mut(open)
            .ok_or(Error::InvalidState)?;

        let reused = record
            .stub_areas
            .iter_mut()
            .rev()
            .find_map(|area| area.bump(stub_size, alignment));

        let ptr = match reused {
            Some(ptr) => ptr,
            None => {
                let area_size = stub_size.max(self.options.stub_area_size);
                let area = state
                    .code
                    .alloc_near(record.start, area_size, alignment)
                    .map_err(|err| match err {
                        Error::OutOfMemory => Error::StubOutOfRange,
                        err => err,
                    })?;
                let (_, capacity) = state.code.query(area)?;

                let mut area = StubArea {
                    start: area,
                    capacity,
                    used: 0,
                };
                let ptr = area.bump(stub_size, alignment).ok_or(Error::InvalidState)?;
                record.stub_areas.push(area);
                ptr
            }
        };

        record.stubs.push(StubAllocation {
            target: target.clone(),
            ptr,
            size: stub_size,
        });

        tracing::trace!(ptr = ?ptr, size = stub_size, alignment, "allocated stub");

        Ok(ptr)
    }

    fn end_function_body(&self, function: &F, start: *mut u8, end: *mut u8) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.open_function.as_ref() != Some(function) {
            return Err(Error::FunctionNotOpen);
        }

        let record = state
            .functions
            .get_mut(function)
            .ok_or(Error::FunctionNotOpen)?;

        let size = checked_extent(record.start, record.actual_size, start, end)?;

        // A finalized body keeps at least one granule so its start stays owned.
        state.code.shrink(record.start, size.max(1))?;

        for area in record.stub_areas.iter_mut() {
            if area.used != 0 {
                state.code.shrink(area.start, area.used)?;
                area.capacity = area.used;
            }
        }

        for area in record.stub_areas.iter().filter(|area| area.used == 0) {
            state.code.release(area.start)?;
        }
        record.stub_areas.retain(|area| area.used != 0);

        record.final_size = Some(size);
        state.open_function = None;

        tracing::debug!(
            start = ?start,
            size,
            capacity = record.actual_size,
            stubs = record.stubs.len(),
            "finalized function body"
        );

        Ok(())
    }

    fn allocate_space(&self, size: usize, alignment: usize) -> Result<*mut u8, Error> {
        let mut state = self.state.lock();

        let ptr = state.code.alloc(size, alignment)?;
        state.spaces.insert(ptr as usize);

        tracing::trace!(ptr = ?ptr, size, alignment, "allocated space");

        Ok(ptr)
    }

    fn allocate_global(&self, size: usize, alignment: usize) -> Result<*mut u8, Error> {
        let mut state = self.state.lock();

        let ptr = state.data.alloc(size, alignment)?;
        state.globals.insert(ptr as usize);

        tracing::trace!(ptr = ?ptr, size, alignment, "allocated global");

        Ok(ptr)
    }

    fn deallocate_mem_for_function(&self, function: &F) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.open_function.as_ref() == Some(function)
            || state.open_table.as_ref() == Some(function)
        {
            return Err(Error::GenerationInProgress);
        }

        if !state.functions.contains_key(function) && !state.tables.contains_key(function) {
            return Err(Error::UnknownFunction);
        }

        // A record is removed only after all of its memory is released.
        if let Some(record) = state.functions.get_mut(function) {
            while let Some(area) = record.stub_areas.last() {
                state.code.release(area.start)?;
                record.stub_areas.pop();
            }

            state.code.release(record.start)?;

            tracing::debug!(
                start = ?record.start,
                size = record.final_size.unwrap_or(record.actual_size),
                "deallocated function body"
            );

            state.functions.remove(function);
        }

        if let Some(table) = state.tables.get(function) {
            state.data.release(table.start)?;
            state.tables.remove(function);
        }

        Ok(())
    }

    fn start_exception_table(
        &self,
        function: &F,
        actual_size: &mut usize,
    ) -> Result<*mut u8, Error> {
        let capacity =
            self.requested_capacity(*actual_size, self.options.exception_table_size)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.open_table.is_some() {
            return Err(Error::GenerationInProgress);
        }

        if state.tables.contains_key(function) {
            return Err(Error::ExceptionTableExists);
        }

        let capacity = if self.options.exact_size {
            capacity
        } else {
            checked_capacity(capacity, state.data.granularity())?
        };

        let start = state.data.alloc(capacity, align_of::<usize>())?;

        state.tables.insert(
            function.clone(),
            TableRecord {
                start,
                actual_size: capacity,
                final_size: None,
                frame_register: None,
            },
        );
        state.open_table = Some(function.clone());

        *actual_size = capacity;

        tracing::debug!(start = ?start, capacity, "started exception table");

        Ok(start)
    }

    fn end_exception_table(
        &self,
        function: &F,
        start: *mut u8,
        end: *mut u8,
        frame_register: FrameRegister,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.open_table.as_ref() != Some(function) {
            return Err(Error::ExceptionTableNotOpen);
        }

        let record = state
            .tables
            .get_mut(function)
            .ok_or(Error::ExceptionTableNotOpen)?;

        let size = checked_extent(record.start, record.actual_size, start, end)?;

        state.data.shrink(record.start, size.max(1))?;

        record.final_size = Some(size);
        record.frame_register = Some(frame_register);
        state.open_table = None;

        tracing::debug!(
            start = ?start,
            size,
            frame_register = frame_register.0,
            "finalized exception table"
        );

        Ok(())
    }

    fn frame_register(&self, function: &F) -> Option<FrameRegister> {
        self.state
            .lock()
            .tables
            .get(function)
            .and_then(|table| table.frame_register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Manager = DefaultMemoryManager<u32, &'static str>;

    fn manager() -> Manager {
        Manager::with_options(MemoryManagerOptions {
            poison_memory: false,
            ..Default::default()
        })
    }

    fn emit(start: *mut u8, len: usize) -> *mut u8 {
        unsafe {
            core::ptr::write_bytes(start, 0x90, len);
            start.add(len)
        }
    }

    #[test]
    fn body_is_finalized_to_emitted_size() {
        let mm = manager();
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        assert_eq!(size, 16 * 1024);
        assert!(!mm.function_body(&1).unwrap().is_finalized());

        let end = emit(start, 100);
        mm.end_function_body(&1, start, end).unwrap();

        let body = mm.function_body(&1).unwrap();
        assert_eq!(body.start, start);
        assert_eq!(body.size(), Some(100));
        assert_eq!(body.actual_end as usize, start as usize + 16 * 1024);
    }

    #[test]
    fn size_hint_sets_capacity() {
        let mm = manager();
        let mut size = 100;

        mm.start_function_body(&1, &mut size).unwrap();
        assert_eq!(size, 128);
    }

    #[test]
    fn exact_size_is_required_and_kept() {
        let mm = Manager::with_options(MemoryManagerOptions {
            exact_size: true,
            ..Default::default()
        });
        assert!(mm.needs_exact_size());

        let mut size = 0;
        assert_eq!(
            mm.start_function_body(&1, &mut size),
            Err(Error::InvalidArgument)
        );

        let mut size = 37;
        let start = mm.start_function_body(&1, &mut size).unwrap();
        assert_eq!(size, 37);

        assert_eq!(
            mm.end_function_body(&1, start, unsafe { start.add(38) }),
            Err(Error::InvalidArgument)
        );
        mm.end_function_body(&1, start, unsafe { start.add(37) })
            .unwrap();
    }

    #[test]
    fn protocol_violations_are_errors() {
        let mm = manager();
        let mut size = 0;

        let p = core::ptr::null_mut();
        assert_eq!(mm.end_function_body(&1, p, p), Err(Error::FunctionNotOpen));
        assert_eq!(
            mm.deallocate_mem_for_function(&1),
            Err(Error::UnknownFunction)
        );
        assert_eq!(mm.allocate_stub(&"f", 8, 8), Err(Error::NoOpenFunction));

        let start = mm.start_function_body(&1, &mut size).unwrap();
        assert_eq!(
            mm.start_function_body(&2, &mut size),
            Err(Error::GenerationInProgress)
        );
        assert_eq!(
            mm.deallocate_mem_for_function(&1),
            Err(Error::GenerationInProgress)
        );
        assert_eq!(
            mm.end_function_body(&1, unsafe { start.add(64) }, unsafe { start.add(64) }),
            Err(Error::InvalidArgument)
        );

        mm.end_function_body(&1, start, start).unwrap();
        assert_eq!(
            mm.end_function_body(&1, start, start),
            Err(Error::FunctionNotOpen)
        );
        assert_eq!(
            mm.start_function_body(&1, &mut size),
            Err(Error::FunctionAlreadyAllocated)
        );

        mm.deallocate_mem_for_function(&1).unwrap();
        assert_eq!(
            mm.deallocate_mem_for_function(&1),
            Err(Error::UnknownFunction)
        );
    }

    #[test]
    fn stubs_are_placed_in_function_slab() {
        let mm = manager();
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        let a = mm.allocate_stub(&"a", 12, 16).unwrap();
        let b = mm.allocate_stub(&"b", 12, 16).unwrap();

        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize, a as usize + 16);
        assert!(a as usize >= start as usize + size);

        {
            let state = mm.state.lock();
            assert!(state.code.same_slab(start, a));
            assert!(state.code.same_slab(start, b));
        }

        let end = emit(start, 10);
        mm.end_function_body(&1, start, end).unwrap();

        let stubs = mm.stubs(&1);
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].target, "a");
        assert_eq!(stubs[1].ptr, b);
        assert_eq!(stubs[1].size, 12);
    }

    #[test]
    fn stubs_overflowing_reserved_area_get_another_area() {
        let mm = Manager::with_options(MemoryManagerOptions {
            stub_area_size: 64,
            poison_memory: false,
            ..Default::default()
        });
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        let stubs = (0..10)
            .map(|_| mm.allocate_stub(&"x", 24, 8).unwrap())
            .collect::<Vec<_>>();

        let state = mm.state.lock();
        for (i, stub) in stubs.iter().enumerate() {
            assert!(state.code.same_slab(start, *stub));

            for other in &stubs[i + 1..] {
                let distance = (*stub as usize).abs_diff(*other as usize);
                assert!(distance >= 24);
            }
        }
        assert!(state.functions[&1].stub_areas.len() > 1);
    }

    #[test]
    fn unused_stub_area_is_released_at_end() {
        let mm = manager();
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        let used_while_open = mm.code_statistics().used_size;
        mm.end_function_body(&1, start, emit(start, 64)).unwrap();

        assert_eq!(mm.code_statistics().used_size, 64);
        assert!(used_while_open > 64);
        assert_eq!(mm.code_statistics().allocation_count, 1);
    }

    #[test]
    fn deallocation_releases_body_stubs_and_table() {
        let mm = manager();
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        mm.allocate_stub(&"a", 8, 8).unwrap();
        mm.end_function_body(&1, start, emit(start, 10)).unwrap();

        let mut table_size = 0;
        let table = mm.start_exception_table(&1, &mut table_size).unwrap();
        mm.end_exception_table(&1, table, unsafe { table.add(8) }, FrameRegister(6))
            .unwrap();

        assert_eq!(mm.code_statistics().allocation_count, 2);
        assert_eq!(mm.data_statistics().allocation_count, 1);

        mm.deallocate_mem_for_function(&1).unwrap();

        assert_eq!(mm.code_statistics().allocation_count, 0);
        assert_eq!(mm.data_statistics().allocation_count, 0);
        assert!(mm.function_body(&1).is_none());
        assert!(mm.exception_table(&1).is_none());
        assert!(mm.stubs(&1).is_empty());
    }

    #[test]
    fn exception_table_protocol() {
        let mm = manager();
        let mut size = 256;

        let table = mm.start_exception_table(&1, &mut size).unwrap();
        assert_eq!(size, 256);
        assert_eq!(
            mm.start_exception_table(&2, &mut size),
            Err(Error::GenerationInProgress)
        );
        assert_eq!(
            mm.end_exception_table(&2, table, table, FrameRegister(6)),
            Err(Error::ExceptionTableNotOpen)
        );
        assert_eq!(
            mm.deallocate_mem_for_function(&1),
            Err(Error::GenerationInProgress)
        );

        mm.end_exception_table(&1, table, unsafe { table.add(40) }, FrameRegister(6))
            .unwrap();

        assert_eq!(mm.frame_register(&1), Some(FrameRegister(6)));
        let info = mm.exception_table(&1).unwrap();
        assert_eq!(info.size(), Some(40));
        assert_eq!(info.actual_end as usize, table as usize + 256);

        let mut size = 0;
        assert_eq!(
            mm.start_exception_table(&1, &mut size),
            Err(Error::ExceptionTableExists)
        );
    }

    #[test]
    fn got_contract() {
        let mm = manager();

        assert!(!mm.is_managing_got());
        assert!(mm.got_base().is_none());

        mm.allocate_got().unwrap();
        assert!(mm.is_managing_got());

        let base = mm.got_base().unwrap();
        assert_eq!(base.as_ptr() as usize % align_of::<usize>(), 0);

        let slots = unsafe { core::slice::from_raw_parts(base.as_ptr().cast::<usize>(), 1024) };
        assert!(slots.iter().all(|&slot| slot == 0));

        assert_eq!(mm.allocate_got(), Err(Error::GotAlreadyAllocated));
        mm.allocate_global(4096, 8).unwrap();
        assert_eq!(mm.got_base(), Some(base));
    }

    #[test]
    fn dlsym_table_is_returned_verbatim() {
        let mm = manager();
        let mut table = 5u64;
        let ptr = NonNull::from(&mut table).cast::<c_void>();

        assert!(mm.dlsym_table().is_none());
        mm.set_dlsym_table(Some(ptr));
        assert_eq!(mm.dlsym_table(), Some(ptr));
        mm.set_dlsym_table(None);
        assert!(mm.dlsym_table().is_none());
    }

    #[test]
    fn spaces_and_globals_can_be_returned() {
        let mm = manager();

        let space = mm.allocate_space(100, 32).unwrap();
        let global = mm.allocate_global(100, 32).unwrap();
        assert_eq!(space as usize % 32, 0);
        assert_eq!(global as usize % 32, 0);

        assert_eq!(mm.deallocate_global(space), Err(Error::InvalidArgument));
        mm.deallocate_space(space).unwrap();
        mm.deallocate_global(global).unwrap();
        assert_eq!(mm.deallocate_space(space), Err(Error::InvalidArgument));
    }

    #[test]
    fn permission_state_machine() {
        let mm = manager();
        assert_eq!(mm.permission(), Permission::Writable);

        mm.set_memory_executable().unwrap();
        mm.set_memory_executable().unwrap();
        assert_eq!(mm.permission(), Permission::Executable);

        mm.set_memory_writable().unwrap();
        assert_eq!(mm.permission(), Permission::Writable);
    }

    #[test]
    fn stub_area_bump_rejects_oversized_requests() {
        let mut backing = [0u64; 8];
        let mut area = StubArea {
            start: backing.as_mut_ptr().cast(),
            capacity: 64,
            used: 0,
        };

        let first = area.bump(16, 8).unwrap();
        assert_eq!(area.bump(usize::MAX - 8, 8), None);
        assert_eq!(area.bump(8, usize::MAX / 2 + 1), None);
        assert_eq!(area.used, 16);

        let second = area.bump(16, 8).unwrap();
        assert_eq!(second as usize, first as usize + 16);
        assert_eq!(area.bump(64, 8), None);
    }

    #[test]
    fn huge_size_hints_are_too_large() {
        let mm = manager();

        let mut size = usize::MAX;
        assert_eq!(mm.start_function_body(&1, &mut size), Err(Error::TooLarge));
        assert_eq!(size, usize::MAX);

        let mut size = usize::MAX - 10;
        assert_eq!(mm.start_exception_table(&1, &mut size), Err(Error::TooLarge));

        assert!(mm.function_body(&1).is_none());
        assert_eq!(mm.code_statistics().allocation_count, 0);

        let exact = Manager::with_options(MemoryManagerOptions {
            exact_size: true,
            ..Default::default()
        });
        let mut size = usize::MAX;
        assert_eq!(exact.start_function_body(&1, &mut size), Err(Error::TooLarge));
    }

    #[test]
    fn huge_stub_leaves_existing_stubs_intact() {
        let mm = manager();
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        let first = mm.allocate_stub(&"a", 16, 8).unwrap();

        assert_eq!(
            mm.allocate_stub(&"b", usize::MAX - 8, 8),
            Err(Error::TooLarge)
        );

        let second = mm.allocate_stub(&"c", 16, 8).unwrap();
        assert!(second as usize >= first as usize + 16);
        assert_eq!(mm.stubs(&1).len(), 2);

        mm.end_function_body(&1, start, emit(start, 8)).unwrap();
        mm.deallocate_mem_for_function(&1).unwrap();
    }

    #[test]
    fn failed_deallocation_keeps_records() {
        let mm = manager();
        let mut size = 0;

        let start = mm.start_function_body(&1, &mut size).unwrap();
        mm.allocate_stub(&"a", 8, 8).unwrap();
        mm.end_function_body(&1, start, emit(start, 10)).unwrap();

        let mut table_size = 0;
        let table = mm.start_exception_table(&1, &mut table_size).unwrap();
        mm.end_exception_table(&1, table, table, FrameRegister(6))
            .unwrap();

        // Pull the body out from under the manager so releasing it fails.
        mm.state.lock().code.release(start).unwrap();

        assert_eq!(
            mm.deallocate_mem_for_function(&1),
            Err(Error::InvalidArgument)
        );
        assert!(mm.function_body(&1).is_some());
        assert!(mm.exception_table(&1).is_some());
        assert!(mm.state.lock().functions[&1].stub_areas.is_empty());
        assert_eq!(mm.code_statistics().allocation_count, 0);

        assert_eq!(
            mm.deallocate_mem_for_function(&1),
            Err(Error::InvalidArgument)
        );
    }
}
