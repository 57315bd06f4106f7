use std::ptr::NonNull;

use crate::error::PageError;

/// This trait provides an abstraction over the low level memory syscalls.
/// The allocator has nothing to do with the concrete implementations / APIs
/// offered by each kernel, it only needs whole pages in and out.
///
/// # Safety
///
/// The allocator writes its headers straight into the returned memory, so
/// implementors must guarantee that a successful [`PageSource::map_pages`]
/// returns `count * page_size` bytes which are readable, writable, aligned
/// to the page size and valid until they are handed back to
/// [`PageSource::unmap_pages`]. The page size must be a multiple of the
/// machine word size and must not change once it has been reported.
pub unsafe trait PageSource {
    /// Returns the virtual memory page size in bytes.
    fn page_size(&self) -> Result<usize, PageError>;

    /// Requests `count` contiguous pages.
    fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, PageError>;

    /// Returns `count` pages starting at `base` back to the kernel.
    ///
    /// # Safety
    ///
    /// `base` and `count` must describe exactly one earlier mapping of this
    /// source, and nothing may access that memory afterwards.
    unsafe fn unmap_pages(&mut self, base: NonNull<u8>, count: usize) -> Result<(), PageError>;
}

/// Pages straight from the operating system: `mmap` on unix and
/// `VirtualAlloc` on windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

impl OsPages {
    pub const fn new() -> Self {
        Self
    }

    fn bytes(&self, count: usize) -> Result<usize, PageError> {
        count
            .checked_mul(self.page_size()?)
            .ok_or_else(|| PageError::MapFailed {
                pages: count,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            })
    }
}

#[cfg(unix)]
mod unix {
    use super::{OsPages, PageSource};
    use crate::error::PageError;

    use libc::{mmap, munmap, off_t, size_t};

    use std::{io, os::raw::{c_int, c_void}, ptr::NonNull};

    unsafe impl PageSource for OsPages {
        fn page_size(&self) -> Result<usize, PageError> {
            match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                size if size > 0 => Ok(size as usize),
                _ => Err(PageError::PageSizeUnavailable),
            }
        }

        fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, PageError> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let len = self.bytes(count)?;

            let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

            match addr {
                libc::MAP_FAILED => Err(PageError::MapFailed {
                    pages: count,
                    source: io::Error::last_os_error(),
                }),
                addr => NonNull::new(addr.cast::<u8>()).ok_or_else(|| PageError::MapFailed {
                    pages: count,
                    source: io::Error::from(io::ErrorKind::AddrNotAvailable),
                }),
            }
        }

        unsafe fn unmap_pages(&mut self, base: NonNull<u8>, count: usize) -> Result<(), PageError> {
            let len = self.bytes(count)?;

            match unsafe { munmap(base.as_ptr().cast::<c_void>(), len as size_t) } {
                0 => Ok(()),
                _ => Err(PageError::UnmapFailed {
                    base: base.as_ptr() as usize,
                    pages: count,
                    source: io::Error::last_os_error(),
                }),
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{io, mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{OsPages, PageSource};
    use crate::error::PageError;

    use windows::Win32::System::{Memory, SystemInformation};

    unsafe impl PageSource for OsPages {
        fn page_size(&self) -> Result<usize, PageError> {
            let page_size = unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            };

            match page_size {
                0 => Err(PageError::PageSizeUnavailable),
                size => Ok(size),
            }
        }

        fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, PageError> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let len = self.bytes(count)?;

            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, protection) };

            NonNull::new(addr.cast::<u8>()).ok_or_else(|| PageError::MapFailed {
                pages: count,
                source: io::Error::last_os_error(),
            })
        }

        unsafe fn unmap_pages(&mut self, base: NonNull<u8>, count: usize) -> Result<(), PageError> {
            unsafe { Memory::VirtualFree(base.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE) }
                .map_err(|_| PageError::UnmapFailed {
                    base: base.as_ptr() as usize,
                    pages: count,
                    source: io::Error::last_os_error(),
                })
        }
    }
}
