//! Shared-memory segment management using `/dev/shm`.
//!
//! The host creates the segment and initializes both transfer queues in
//! place; the remote opens it by name. The segment name travels to the
//! remote through the bootstrap environment (see [`crate::proc`]). Once the
//! host has observed the remote's attachment it unlinks the name, so the
//! segment disappears with the last unmap even if a peer dies.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;

/// A mapped shared-memory segment.
///
/// The creating side owns the name and unlinks it, either explicitly once
/// the peer has attached ([`SharedMemory::unlink`]) or on drop. Unlinking
/// is idempotent; the mapping itself lives until drop.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    owns_name: bool,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Creates a new shared-memory segment of `size` bytes.
    ///
    /// The caller becomes the owner and is responsible for unlinking the
    /// name once the peer has attached (or on drop).
    ///
    /// # Safety
    /// The caller must ensure no other process is using `name` and that
    /// `size` matches the layout it will impose on the mapping.
    pub unsafe fn create(name: &str, size: usize) -> io::Result<Self> {
        let name = segment_cstring(name)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        let ptr = match unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero")
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            owns_name: true,
        })
    }

    /// Opens an existing shared-memory segment.
    ///
    /// # Safety
    /// The caller must ensure that the segment was created with the layout
    /// it expects at `size` bytes.
    pub unsafe fn open(name: &str, size: usize) -> io::Result<Self> {
        let name = segment_cstring(name)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        let ptr = match unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero")
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            owns_name: false,
        })
    }

    /// Returns a pointer to the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the size of the mapping.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the segment name, including the leading slash.
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("")
    }

    /// Removes the segment name so the segment is destroyed with the last
    /// unmap. No-op when this side does not own the name or the name was
    /// already removed.
    pub fn unlink(&mut self) {
        if self.owns_name {
            let _ = shm_unlink(self.name.as_c_str());
            self.owns_name = false;
        }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
        }
        let _ = close(self.fd);
        self.unlink();
    }
}

fn segment_cstring(name: &str) -> io::Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };

    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains null byte"))
}
