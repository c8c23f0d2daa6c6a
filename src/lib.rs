//! Executable memory management for JIT code generators.
//!
//! A code generator drives a [`JitMemoryManager`] through the lifecycle of every function it
//! compiles: [`start_function_body`](JitMemoryManager::start_function_body) hands out an
//! optimistically sized buffer, [`allocate_stub`](JitMemoryManager::allocate_stub) carves branch
//! thunks next to it, [`end_function_body`](JitMemoryManager::end_function_body) trims it down to
//! the emitted size and [`deallocate_mem_for_function`](JitMemoryManager::deallocate_mem_for_function)
//! gives everything back. Code pages are toggled between writable and executable as a whole, so
//! no page is ever both at once unless the options explicitly allow it on a non-hardened host.
extern crate alloc;

pub mod default_manager;
pub mod manager;
pub mod slab;
pub mod util;
pub mod virtual_memory;

/// Errors reported by the slab allocator and the memory managers built on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum Error {
    #[error("operation is not valid in the current state")]
    InvalidState,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("requested size is too large")]
    TooLarge,
    /// The stub area of the open function is exhausted and its slab has no room left.
    #[error("no room for a stub within branch range of the open function")]
    StubOutOfRange,
    /// A function body or exception table is still open.
    #[error("code generation is in progress")]
    GenerationInProgress,
    #[error("function body was not started")]
    FunctionNotOpen,
    #[error("function already owns a body")]
    FunctionAlreadyAllocated,
    #[error("function is not known to the memory manager")]
    UnknownFunction,
    /// Stubs can only be placed while a function body is open.
    #[error("no function body is open")]
    NoOpenFunction,
    #[error("exception table was not started")]
    ExceptionTableNotOpen,
    #[error("function already owns an exception table")]
    ExceptionTableExists,
    #[error("global offset table is already allocated")]
    GotAlreadyAllocated,
    /// The operating system refused a page protection change.
    #[error("failed to change page protection (os error {errno})")]
    ProtectionFailed { errno: i32 },
}

pub use {
    default_manager::{DefaultMemoryManager, MemoryManagerOptions},
    manager::{
        create_default_manager, ExceptionTable, FrameRegister, FunctionBody, JitMemoryManager,
        Permission, StubAllocation,
    },
    slab::{SlabAllocator, SlabOptions, Statistics},
    virtual_memory::flush_instruction_cache,
};
