//! Bounds- and alignment-checked access to a mapped register window.

use std::ffi::c_void;
use std::fmt;
use std::fs::File;
use std::io;
use std::ptr::NonNull;

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{trace, warn};

use crate::error::PciError;

/// A shared read/write mapping of a device resource.
///
/// Every access is checked against the window before any memory is
/// touched, and goes through volatile loads and stores so the compiler can
/// neither drop nor merge hardware-visible accesses.
pub struct MmioWindow {
    base: NonNull<u8>,
    len: usize,
}

impl MmioWindow {
    /// Maps the first `len` bytes of `file`.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty resource",
            ));
        }
        // SAFETY: a fresh mapping chosen by the kernel, not aliasing any Rust
        // object; the fd only needs to live for the duration of the call.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file,
                0,
            )
        }
        .map_err(io::Error::from)?;
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned NULL"))?;
        trace!("Mapped {len:#x} bytes at {:p}", base);
        Ok(Self { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn checked(&self, offset: usize, width: usize) -> Result<NonNull<u8>, PciError> {
        if offset >= self.len || self.len - offset < width {
            return Err(PciError::OutOfBounds {
                offset,
                size: self.len,
            });
        }
        if offset % width != 0 {
            return Err(PciError::Misaligned {
                offset,
                align: width,
            });
        }
        // SAFETY: offset + width <= len, so the pointer stays inside the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, PciError> {
        let ptr = self.checked(offset, 1)?;
        // SAFETY: in bounds of a live mapping.
        Ok(unsafe { ptr.as_ptr().read_volatile() })
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<(), PciError> {
        let ptr = self.checked(offset, 1)?;
        // SAFETY: in bounds of a live, writable mapping.
        unsafe { ptr.as_ptr().write_volatile(value) };
        Ok(())
    }

    /// Replaces the bits selected by `mask` with those of `value`.
    pub fn mask_u8(&mut self, offset: usize, value: u8, mask: u8) -> Result<(), PciError> {
        let ptr = self.checked(offset, 1)?;
        // SAFETY: in bounds of a live, writable mapping.
        unsafe {
            let current = ptr.as_ptr().read_volatile();
            ptr.as_ptr().write_volatile((current & !mask) | (value & mask));
        }
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, PciError> {
        let ptr = self.checked(offset, 4)?.cast::<u32>();
        // SAFETY: in bounds and 4-byte aligned (page-aligned base, offset % 4 == 0).
        Ok(unsafe { ptr.as_ptr().read_volatile() })
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), PciError> {
        let ptr = self.checked(offset, 4)?.cast::<u32>();
        // SAFETY: in bounds and 4-byte aligned.
        unsafe { ptr.as_ptr().write_volatile(value) };
        Ok(())
    }

    /// Replaces the bits selected by `mask` with those of `value`.
    pub fn mask_u32(&mut self, offset: usize, value: u32, mask: u32) -> Result<(), PciError> {
        let ptr = self.checked(offset, 4)?.cast::<u32>();
        // SAFETY: in bounds and 4-byte aligned.
        unsafe {
            let current = ptr.as_ptr().read_volatile();
            ptr.as_ptr().write_volatile((current & !mask) | (value & mask));
        }
        Ok(())
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping created in `map` and never
        // handed out beyond the lifetime of self.
        if let Err(e) = unsafe { munmap(self.base.as_ptr().cast::<c_void>(), self.len) } {
            warn!("munmap of {:#x} bytes at {:p} failed: {e}", self.len, self.base);
        }
    }
}

impl fmt::Debug for MmioWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioWindow")
            .field("base", &self.base)
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}
