//! Thin platform layer over page mapping, page protection and instruction cache maintenance.
use core::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::Error;

/// Virtual memory information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Info {
    /// The size of a page of virtual memory.
    pub page_size: u32,
    /// The granularity of a page of virtual memory.
    pub page_granularity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MemoryFlags(pub u32);

impl MemoryFlags {
    /// No access.
    pub const NONE: Self = Self(0);
    /// Memory is readable.
    pub const ACCESS_READ: Self = Self(0x00000001);
    /// Memory is writable.
    pub const ACCESS_WRITE: Self = Self(0x00000002);
    /// Memory is executable.
    pub const ACCESS_EXECUTE: Self = Self(0x00000004);
    /// Memory is readable and writable.
    pub const ACCESS_RW: Self = Self(Self::ACCESS_READ.0 | Self::ACCESS_WRITE.0);
    /// Memory is readable and executable.
    pub const ACCESS_RX: Self = Self(Self::ACCESS_READ.0 | Self::ACCESS_EXECUTE.0);
    /// Memory is readable, writable and executable.
    pub const ACCESS_RWX: Self =
        Self(Self::ACCESS_READ.0 | Self::ACCESS_WRITE.0 | Self::ACCESS_EXECUTE.0);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0 && other.0 != 0
    }
}

impl BitOr for MemoryFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MemoryFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl BitAnd for MemoryFlags {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

cfgenius::cond! {
    if cfg(not(windows)) {
        use errno::errno;

        fn error_from_errno() -> Error {
            match errno().0 {
                libc::EFBIG | libc::ENOMEM | libc::EOVERFLOW => Error::OutOfMemory,
                libc::EACCES | libc::EAGAIN | libc::ENODEV | libc::EPERM => Error::InvalidState,
                _ => Error::InvalidArgument,
            }
        }

        fn get_vm_info() -> Info {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let page_size = if page_size <= 0 { 4096 } else { page_size as usize };

            Info {
                page_size: page_size as _,
                page_granularity: 65536.max(page_size) as _,
            }
        }

        fn mm_prot_from_memory_flags(memory_flags: MemoryFlags) -> i32 {
            let mut prot = libc::PROT_NONE;

            if memory_flags.contains(MemoryFlags::ACCESS_READ) { prot |= libc::PROT_READ }
            if memory_flags.contains(MemoryFlags::ACCESS_WRITE) { prot |= libc::PROT_WRITE }
            if memory_flags.contains(MemoryFlags::ACCESS_EXECUTE) { prot |= libc::PROT_EXEC }

            prot
        }

        fn map_memory(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
            let protection = mm_prot_from_memory_flags(memory_flags);

            unsafe {
                let ptr = libc::mmap(
                    core::ptr::null_mut(),
                    size,
                    protection,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );

                if ptr == libc::MAP_FAILED {
                    return Err(error_from_errno());
                }

                Ok(ptr.cast())
            }
        }

        fn unmap_memory(ptr: *mut u8, size: usize) -> Result<(), Error> {
            unsafe {
                if libc::munmap(ptr.cast(), size) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        }

        fn protect_memory(p: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
            let protection = mm_prot_from_memory_flags(memory_flags);

            unsafe {
                if libc::mprotect(p.cast(), size, protection) == 0 {
                    Ok(())
                } else {
                    Err(Error::ProtectionFailed { errno: errno().0 })
                }
            }
        }

        fn probe_write_execute() -> bool {
            let page_size = info().page_size as usize;

            unsafe {
                let ptr = libc::mmap(
                    core::ptr::null_mut(),
                    page_size,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );

                if ptr == libc::MAP_FAILED {
                    false
                } else {
                    libc::munmap(ptr, page_size);
                    true
                }
            }
        }
    } else {
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
        use winapi::um::winnt::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
            PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
        };

        fn get_vm_info() -> Info {
            unsafe {
                let mut system_info: SYSTEM_INFO = core::mem::zeroed();
                GetSystemInfo(&mut system_info);

                Info {
                    page_size: system_info.dwPageSize,
                    page_granularity: system_info.dwAllocationGranularity,
                }
            }
        }

        fn protect_flags_from_memory_flags(memory_flags: MemoryFlags) -> u32 {
            let execute = memory_flags.contains(MemoryFlags::ACCESS_EXECUTE);
            let write = memory_flags.contains(MemoryFlags::ACCESS_WRITE);
            let read = memory_flags.contains(MemoryFlags::ACCESS_READ);

            match (execute, write, read) {
                (true, true, _) => PAGE_EXECUTE_READWRITE,
                (true, false, _) => PAGE_EXECUTE_READ,
                (false, true, _) => PAGE_READWRITE,
                (false, false, true) => PAGE_READONLY,
                (false, false, false) => PAGE_NOACCESS,
            }
        }

        fn map_memory(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
            let protection = protect_flags_from_memory_flags(memory_flags);

            let ptr = unsafe {
                VirtualAlloc(core::ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, protection)
            };

            if ptr.is_null() {
                return Err(Error::OutOfMemory);
            }

            Ok(ptr.cast())
        }

        fn unmap_memory(ptr: *mut u8, _size: usize) -> Result<(), Error> {
            if unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) } == 0 {
                return Err(Error::InvalidArgument);
            }

            Ok(())
        }

        fn protect_memory(p: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
            let protection = protect_flags_from_memory_flags(memory_flags);
            let mut old_protection = 0;

            unsafe {
                if VirtualProtect(p.cast(), size, protection, &mut old_protection) == 0 {
                    return Err(Error::ProtectionFailed { errno: GetLastError() as i32 });
                }
            }

            Ok(())
        }

        fn probe_write_execute() -> bool {
            let page_size = info().page_size as usize;

            unsafe {
                let ptr = VirtualAlloc(
                    core::ptr::null_mut(),
                    page_size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                );

                if ptr.is_null() {
                    false
                } else {
                    VirtualFree(ptr, 0, MEM_RELEASE);
                    true
                }
            }
        }
    }
}

/// Returns page size and allocation granularity of the host, queried once.
pub fn info() -> Info {
    static INFO: once_cell::sync::Lazy<Info> = once_cell::sync::Lazy::new(get_vm_info);

    *INFO
}

/// Maps `size` bytes of fresh, zeroed memory with the given access.
pub fn alloc(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
    if size == 0 {
        return Err(Error::InvalidArgument);
    }

    map_memory(size, memory_flags)
}

/// Unmaps memory returned by [`alloc`].
pub fn release(ptr: *mut u8, size: usize) -> Result<(), Error> {
    if ptr.is_null() || size == 0 {
        return Err(Error::InvalidArgument);
    }

    unmap_memory(ptr, size)
}

/// Changes the access of the pages covering `[p, p + size)`.
///
/// A refusal by the operating system is reported as [`Error::ProtectionFailed`].
pub fn protect(p: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
    if size == 0 {
        return Ok(());
    }

    protect_memory(p, size, memory_flags)
}

/// Detects whether the current process is hardened, which means that pages that have WRITE and EXECUTABLE flags
/// cannot be allocated at all. On macOS + AArch64 this is always the case for memory mapped without `MAP_JIT`.
pub fn has_hardened_runtime() -> bool {
    cfgenius::cond! {
        if cfg(all(target_os="macos", target_arch="aarch64")) {
            return true;
        } else {
            static GLOBAL_HARDENED_FLAG: AtomicU32 = AtomicU32::new(0);

            let mut flag = GLOBAL_HARDENED_FLAG.load(Ordering::Acquire);

            if flag == 0 {
                flag = if probe_write_execute() { 1 } else { 2 };
                GLOBAL_HARDENED_FLAG.store(flag, Ordering::Release);
            }

            return flag == 2;
        }
    }
}

/// Flushes instruction cache in the given region.
///
/// A no-op on x86, where instruction fetch is coherent with data writes.
pub fn flush_instruction_cache(p: *const u8, size: usize) {
    cfgenius::cond! {
        if cfg(any(target_arch="x86", target_arch="x86_64")) {
            let _ = p;
            let _ = size;
        } else if cfg(target_vendor="apple") {
            extern "C" {
                fn sys_icache_invalidate(p: *const u8, size: usize);
            }

            unsafe {
                sys_icache_invalidate(p, size);
            }
        } else if cfg(windows) {
            use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};

            unsafe {
                FlushInstructionCache(GetCurrentProcess(), p.cast(), size);
            }
        } else if cfg(target_arch="aarch64") {
            use core::arch::asm;

            let start = p as usize;
            let end = start + size;

            let ctr: u64;
            unsafe {
                asm!("mrs {}, ctr_el0", out(reg) ctr);
            }

            let dcache_line_size = 4usize << ((ctr >> 16) & 0xF);
            let icache_line_size = 4usize << (ctr & 0xF);

            let mut addr = start & !(dcache_line_size - 1);
            while addr < end {
                unsafe {
                    asm!("dc cvau, {}", in(reg) addr);
                }
                addr += dcache_line_size;
            }

            unsafe {
                asm!("dsb ish");
            }

            addr = start & !(icache_line_size - 1);
            while addr < end {
                unsafe {
                    asm!("ic ivau, {}", in(reg) addr);
                }
                addr += icache_line_size;
            }

            unsafe {
                asm!("dsb ish");
                asm!("isb");
            }
        } else if cfg(target_arch="riscv64") {
            unsafe {
                let _ = wasmtime_jit_icache_coherence::clear_cache(p.cast(), size);
                let _ = wasmtime_jit_icache_coherence::pipeline_flush_mt();
            }
        } else {
            let _ = p;
            let _ = size;
        }
    }
}
