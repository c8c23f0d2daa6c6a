//! The contract between a code generator and the memory it emits into.
use core::ffi::c_void;
use core::hash::Hash;
use core::ptr::NonNull;

use crate::default_manager::DefaultMemoryManager;
use crate::Error;

/// Register the unwinder treats as the frame pointer of a function, as a target register number
/// (for example a DWARF register number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameRegister(pub u16);

/// Access currently granted on code memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Code pages can be patched but not executed.
    Writable,
    /// Code pages can be executed but not written.
    Executable,
}

/// Extent of a function body.
///
/// `start <= final_end <= actual_end` holds once the body is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionBody {
    pub start: *mut u8,
    /// One past the last byte the generator was allowed to write.
    pub actual_end: *mut u8,
    /// One past the last emitted byte, set by `end_function_body`.
    pub final_end: Option<*mut u8>,
}

impl FunctionBody {
    pub fn is_finalized(&self) -> bool {
        self.final_end.is_some()
    }

    /// Size of the finalized body.
    pub fn size(&self) -> Option<usize> {
        self.final_end.map(|end| end as usize - self.start as usize)
    }
}

/// Extent of an exception table, see [`FunctionBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTable {
    pub start: *mut u8,
    pub actual_end: *mut u8,
    pub final_end: Option<*mut u8>,
    pub frame_register: Option<FrameRegister>,
}

impl ExceptionTable {
    pub fn is_finalized(&self) -> bool {
        self.final_end.is_some()
    }

    pub fn size(&self) -> Option<usize> {
        self.final_end.map(|end| end as usize - self.start as usize)
    }
}

/// A branch thunk placed next to the body of the function that was open when it was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubAllocation<G> {
    /// The value the stub branches to.
    pub target: G,
    pub ptr: *mut u8,
    pub size: usize,
}

/// Memory manager used by a JIT to allocate and manage the memory of the code it generates.
///
/// `F` identifies functions and `G` identifies the values stubs branch to; both are opaque
/// handles compared by identity. All methods take `&self` so one manager can be shared by several
/// generator threads; implementations serialize access internally.
///
/// A function goes through `start_function_body`, any number of `allocate_stub` calls,
/// `end_function_body`, optionally `start_exception_table`/`end_exception_table`, and finally
/// `deallocate_mem_for_function`. Breaking that order is reported as an error instead of
/// corrupting state.
pub trait JitMemoryManager<F, G = F> {
    /// Makes code memory writable and not executable, for code emission and patching.
    fn set_memory_writable(&self) -> Result<(), Error>;

    /// Makes code memory executable and not writable, once emission is done.
    fn set_memory_executable(&self) -> Result<(), Error>;

    /// Setting this flag to true makes the memory manager overwrite freed memory with a trap
    /// pattern. Live allocations are never touched.
    ///
    /// While code memory is executable the pages holding the freed bytes are made writable for
    /// the duration of the write, so other functions on those pages must not run concurrently
    /// with a deallocation.
    fn set_poison_memory(&self, poison: bool);

    /// Allocates the global offset table. Afterwards [`is_managing_got`](Self::is_managing_got)
    /// returns `true`.
    fn allocate_got(&self) -> Result<(), Error>;

    /// Returns `true` once [`allocate_got`](Self::allocate_got) succeeded.
    fn is_managing_got(&self) -> bool;

    /// Base of the global offset table, `None` before [`allocate_got`](Self::allocate_got).
    fn got_base(&self) -> Option<NonNull<u8>>;

    /// Stores an opaque table used to relocate stubs after the code is moved into another address
    /// space. `None` clears it.
    fn set_dlsym_table(&self, table: Option<NonNull<c_void>>);

    /// The table stored by [`set_dlsym_table`](Self::set_dlsym_table), verbatim.
    fn dlsym_table(&self) -> Option<NonNull<c_void>>;

    /// If `true`, callers must pass the exact size of a function body or exception table as the
    /// input of `actual_size`.
    fn needs_exact_size(&self) -> bool;

    /// Allocates memory for the body of `function` and returns its start.
    ///
    /// The generator does not know the size of the code ahead of time, so `actual_size` is set to
    /// the number of bytes it may write. A non-zero input is taken as the requested capacity. When
    /// [`needs_exact_size`](Self::needs_exact_size) is `true` the input is the exact size and is
    /// left unchanged.
    fn start_function_body(&self, function: &F, actual_size: &mut usize)
        -> Result<*mut u8, Error>;

    /// Allocates a stub of exactly `stub_size` bytes aligned to `alignment` that branches to
    /// `target`, close enough to the open function body to be reached by a short branch. The stub
    /// does not count toward the body's size and lives as long as the function.
    fn allocate_stub(&self, target: &G, stub_size: usize, alignment: usize)
        -> Result<*mut u8, Error>;

    /// Finalizes the body of `function` to `[start, end)` and returns the unused tail to free
    /// space.
    fn end_function_body(&self, function: &F, start: *mut u8, end: *mut u8) -> Result<(), Error>;

    /// Allocates a block of code memory that is not tied to a function.
    fn allocate_space(&self, size: usize, alignment: usize) -> Result<*mut u8, Error>;

    /// Allocates memory for a global.
    fn allocate_global(&self, size: usize, alignment: usize) -> Result<*mut u8, Error>;

    /// Frees the body, stubs and exception table of `function`. Fails while any of them is still
    /// being emitted.
    fn deallocate_mem_for_function(&self, function: &F) -> Result<(), Error>;

    /// Allocates memory for the exception table of `function`, sized like
    /// [`start_function_body`](Self::start_function_body).
    fn start_exception_table(&self, function: &F, actual_size: &mut usize)
        -> Result<*mut u8, Error>;

    /// Finalizes the exception table of `function` to `[start, end)` and records the register the
    /// unwinder treats as its frame pointer.
    fn end_exception_table(
        &self,
        function: &F,
        start: *mut u8,
        end: *mut u8,
        frame_register: FrameRegister,
    ) -> Result<(), Error>;

    /// Frame register recorded by [`end_exception_table`](Self::end_exception_table).
    fn frame_register(&self, function: &F) -> Option<FrameRegister>;
}

/// Creates the memory manager used when the client does not provide one.
pub fn create_default_manager<F, G>() -> Box<dyn JitMemoryManager<F, G> + Send + Sync>
where
    F: Hash + Eq + Clone + Send + 'static,
    G: Clone + Send + 'static,
{
    Box::new(DefaultMemoryManager::<F, G>::new())
}
