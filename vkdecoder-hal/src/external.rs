//! OS-polymorphic external object handles.
//!
//! Vulkan objects cross process boundaries as OS-specific tokens: POSIX
//! file descriptors, Win32 handles, QNX screen buffers, or Metal heap ids
//! under MoltenVK. The decoder treats them uniformly as an
//! [`ExternalHandle`] and lets the variant pick the duplication and close
//! primitives.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExternalHandleError {
    #[error("handle duplication failed with OS error {0}")]
    DupFailed(i32),
    #[error("operation is not supported for {0} handles on this platform")]
    Unsupported(&'static str),
}

/// A host OS token standing in for an exportable Vulkan object.
///
/// `HostPointer` is not a kernel object; `dup` on it is an identity
/// operation and `close` a no-op, which is what the host-pointer import
/// path expects.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ExternalHandle {
    Fd(i32),
    Win32(isize),
    ScreenBuffer(u64),
    MetalHeap(u64),
    HostPointer(usize),
}

impl fmt::Debug for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Fd(fd) => write!(f, "fd:{fd}"),
            Self::Win32(h) => write!(f, "win32:{h:#x}"),
            Self::ScreenBuffer(h) => write!(f, "screen-buffer:{h:#x}"),
            Self::MetalHeap(h) => write!(f, "metal-heap:{h:#x}"),
            Self::HostPointer(p) => write!(f, "host-ptr:{p:#x}"),
        }
    }
}

impl ExternalHandle {
    /// Duplicates the underlying OS object so the caller owns an
    /// independent reference.
    pub fn dup(self) -> Result<ExternalHandle, ExternalHandleError> {
        match self {
            Self::Fd(fd) => dup_fd(fd).map(Self::Fd),
            Self::Win32(handle) => dup_win32(handle).map(Self::Win32),
            // Screen buffers and Metal heaps are refcounted by their
            // owning subsystem; the token itself is copyable.
            Self::ScreenBuffer(h) => Ok(Self::ScreenBuffer(h)),
            Self::MetalHeap(h) => Ok(Self::MetalHeap(h)),
            Self::HostPointer(p) => Ok(Self::HostPointer(p)),
        }
    }

    /// Releases this reference. Safe to call on already-copied tokens.
    pub fn close(self) {
        match self {
            Self::Fd(fd) => close_fd(fd),
            Self::Win32(handle) => close_win32(handle),
            Self::ScreenBuffer(_) | Self::MetalHeap(_) | Self::HostPointer(_) => {}
        }
    }

    pub fn as_fd(self) -> Option<i32> {
        match self {
            Self::Fd(fd) => Some(fd),
            _ => None,
        }
    }
}

#[cfg(unix)]
fn dup_fd(fd: i32) -> Result<i32, ExternalHandleError> {
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        Err(ExternalHandleError::DupFailed(last_os_error()))
    } else {
        Ok(new_fd)
    }
}

#[cfg(unix)]
fn last_os_error() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

#[cfg(unix)]
fn close_fd(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(not(unix))]
fn dup_fd(_fd: i32) -> Result<i32, ExternalHandleError> {
    Err(ExternalHandleError::Unsupported("fd"))
}

#[cfg(not(unix))]
fn close_fd(_fd: i32) {}

#[cfg(windows)]
fn dup_win32(handle: isize) -> Result<isize, ExternalHandleError> {
    // DuplicateHandle with same-access flags; declared locally so the
    // crate does not pull the full windows-rs surface for one call.
    extern "system" {
        fn GetCurrentProcess() -> isize;
        fn DuplicateHandle(
            source_process: isize,
            source_handle: isize,
            target_process: isize,
            target_handle: *mut isize,
            desired_access: u32,
            inherit_handle: i32,
            options: u32,
        ) -> i32;
        fn GetLastError() -> u32;
    }
    const DUPLICATE_SAME_ACCESS: u32 = 0x2;
    let mut out = 0isize;
    let ok = unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            handle,
            GetCurrentProcess(),
            &mut out,
            0,
            0,
            DUPLICATE_SAME_ACCESS,
        )
    };
    if ok == 0 {
        Err(ExternalHandleError::DupFailed(unsafe {
            GetLastError() as i32
        }))
    } else {
        Ok(out)
    }
}

#[cfg(windows)]
fn close_win32(handle: isize) {
    extern "system" {
        fn CloseHandle(handle: isize) -> i32;
    }
    unsafe {
        CloseHandle(handle);
    }
}

#[cfg(not(windows))]
fn dup_win32(_handle: isize) -> Result<isize, ExternalHandleError> {
    Err(ExternalHandleError::Unsupported("win32"))
}

#[cfg(not(windows))]
fn close_win32(_handle: isize) {}

/// A process-shared anonymous memory segment, used to back system blobs
/// that other processes map by descriptor.
pub struct SharedMemory {
    fd: i32,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Allocates and maps a segment of `size` bytes. `size` should already
    /// be rounded to the platform page size by the caller.
    #[cfg(target_os = "linux")]
    pub fn new(size: usize) -> Result<Self, ExternalHandleError> {
        let fd = unsafe {
            libc::memfd_create(b"vkdecoder-blob\0".as_ptr().cast(), libc::MFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(ExternalHandleError::DupFailed(last_os_error()));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = last_os_error();
            unsafe { libc::close(fd) };
            return Err(ExternalHandleError::DupFailed(err));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = last_os_error();
            unsafe { libc::close(fd) };
            return Err(ExternalHandleError::DupFailed(err));
        }
        Ok(Self {
            fd,
            ptr: ptr.cast(),
            size,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new(_size: usize) -> Result<Self, ExternalHandleError> {
        Err(ExternalHandleError::Unsupported("shared-memory"))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The segment's descriptor, still owned by this object. Use
    /// [`ExternalHandle::dup`] to hand out references.
    pub fn handle(&self) -> ExternalHandle {
        ExternalHandle::Fd(self.fd)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            if !self.ptr.is_null() {
                libc::munmap(self.ptr.cast(), self.size);
            }
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn fd_dup_is_independent() {
        let shm = SharedMemory::new(4096).unwrap();
        let dup = shm.handle().dup().unwrap();
        assert_ne!(dup.as_fd().unwrap(), shm.handle().as_fd().unwrap());
        dup.close();
    }

    #[test]
    fn host_pointer_round_trips() {
        let h = ExternalHandle::HostPointer(0xdead_0000);
        assert_eq!(h.dup().unwrap(), h);
        h.close();
    }
}
