//! Raw stack memory regions.
//!
//! Two backings: plain heap allocations for interpreted stacks, and
//! page-granular mappings with an inaccessible guard page for compiled
//! stacks. The guard sequence reserves the whole region inaccessible,
//! commits it read-write, then re-protects the lowest page, so an
//! overflowing store faults instead of corrupting adjacent memory.
//! Translating that fault into a stack-overflow condition is the signal
//! handler's job, not this module's.

use std::ptr::NonNull;

/// Page size assumed for guard-page layout.
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Platform-specific mapping primitives
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    /// Reserve `size` bytes of inaccessible address space.
    pub unsafe fn reserve(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Commit a reserved range read-write.
    pub unsafe fn commit_rw(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    /// Make a committed range inaccessible (the guard page).
    pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_NONE) == 0 }
    }

    /// Release a mapped region.
    pub unsafe fn release(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };

    /// Reserve `size` bytes of inaccessible address space.
    pub unsafe fn reserve(size: usize) -> *mut u8 {
        unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) as *mut u8 }
    }

    /// Commit a reserved range read-write.
    pub unsafe fn commit_rw(ptr: *mut u8, size: usize) -> bool {
        unsafe { !VirtualAlloc(ptr as *mut _, size, MEM_COMMIT, PAGE_READWRITE).is_null() }
    }

    /// Make a committed range inaccessible (the guard page).
    pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_NOACCESS, &mut old) != 0 }
    }

    /// Release a mapped region.
    pub unsafe fn release(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

// =============================================================================
// Stack regions
// =============================================================================

/// How a region's memory was obtained, and so how it must be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// `std::alloc` allocation, 16-byte aligned.
    Heap,
    /// Page mapping with a guard page at the lowest address.
    Mapped,
}

/// An owned raw memory region backing one stack segment.
///
/// The usable range excludes the guard page (mapped backing only).
/// Dropping the region releases the memory.
pub struct StackRegion {
    ptr: NonNull<u8>,
    total: usize,
    backing: Backing,
}

impl StackRegion {
    /// Allocate a heap-backed region of at least `bytes` usable bytes.
    pub fn heap(bytes: usize) -> Option<Self> {
        let layout = std::alloc::Layout::from_size_align(bytes, 16).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        Some(Self {
            ptr: NonNull::new(ptr)?,
            total: bytes,
            backing: Backing::Heap,
        })
    }

    /// Map a region of at least `bytes` usable bytes with an
    /// inaccessible guard page at its lowest address.
    pub fn mapped_with_guard(bytes: usize) -> Option<Self> {
        let usable = align_to_page(bytes);
        let total = usable + PAGE_SIZE;

        unsafe {
            let ptr = platform::reserve(total);
            let ptr = NonNull::new(ptr)?;
            if !platform::commit_rw(ptr.as_ptr(), total) {
                platform::release(ptr.as_ptr(), total);
                return None;
            }
            if !platform::protect_none(ptr.as_ptr(), PAGE_SIZE) {
                platform::release(ptr.as_ptr(), total);
                return None;
            }
            Some(Self {
                ptr,
                total,
                backing: Backing::Mapped,
            })
        }
    }

    /// Start of the usable (accessible) range.
    #[inline]
    pub fn usable_base(&self) -> *mut u8 {
        match self.backing {
            Backing::Heap => self.ptr.as_ptr(),
            Backing::Mapped => unsafe { self.ptr.as_ptr().add(PAGE_SIZE) },
        }
    }

    /// Length of the usable range in bytes.
    #[inline]
    pub fn usable_len(&self) -> usize {
        match self.backing {
            Backing::Heap => self.total,
            Backing::Mapped => self.total - PAGE_SIZE,
        }
    }

    /// Whether this region carries a guard page.
    #[inline]
    pub fn has_guard(&self) -> bool {
        self.backing == Backing::Mapped
    }

    /// Check if an address falls inside the usable range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.usable_base() as usize;
        addr >= start && addr < start + self.usable_len()
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap => {
                if let Ok(layout) = std::alloc::Layout::from_size_align(self.total, 16) {
                    unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
                }
            }
            Backing::Mapped => unsafe {
                // Restore access before unmap; some platforms refuse to
                // unmap PROT_NONE sub-ranges piecemeal otherwise.
                platform::commit_rw(self.ptr.as_ptr(), PAGE_SIZE);
                platform::release(self.ptr.as_ptr(), self.total);
            },
        }
    }
}

// Safety: a region is exclusively owned raw memory; ownership may move
// between threads along with its segment.
unsafe impl Send for StackRegion {}

/// Align a size up to the nearest page boundary.
#[inline]
pub const fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
