//! Explicit synchronization fences
//!
//! A [`Fence`] owns a sync-file file descriptor handed out by the kernel or the
//! GPU driver. The descriptor is closed exactly once, when the owner is
//! dropped; independent owned copies are created with [`Fence::dup`]. This
//! keeps the dup/close pairing of the display path linear by construction.

use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;

/// Owned sync-file fence.
///
/// Becomes signaled once the producer (GPU or display controller) is done with
/// the buffer the fence was attached to.
pub struct Fence(OwnedFd);

impl Fence {
    /// Take ownership of an already open sync-file descriptor
    pub fn from_fd(fd: OwnedFd) -> Fence {
        Fence(fd)
    }

    /// Create an independent owned copy of this fence
    pub fn dup(&self) -> io::Result<Fence> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.0, 0)?;
        Ok(Fence(fd))
    }

    /// Block until the fence signals.
    ///
    /// A negative `timeout_ms` blocks indefinitely. Interrupted waits are
    /// retried.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<()> {
        loop {
            let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
            match poll(&mut fds, timeout_ms) {
                Ok(_) => return Ok(()),
                Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Whether the fence has already signaled
    pub fn is_signaled(&self) -> bool {
        let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
        matches!(poll(&mut fds, 0), Ok(n) if n > 0)
    }

    /// Give up ownership of the underlying descriptor
    pub fn into_fd(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for Fence {
    fn from(fd: OwnedFd) -> Fence {
        Fence(fd)
    }
}

impl AsFd for Fence {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for Fence {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fence").field(&self.0.as_raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signaled_fence() -> Fence {
        let fd = rustix::event::eventfd(1, rustix::event::EventfdFlags::CLOEXEC).unwrap();
        Fence::from_fd(fd)
    }

    #[test]
    fn signaled_fence_does_not_block() {
        let fence = signaled_fence();
        assert!(fence.is_signaled());
        fence.wait(-1).unwrap();
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let (read, _write) = rustix::pipe::pipe().unwrap();
        let fence = Fence::from_fd(read);
        assert!(!fence.is_signaled());
        // poll returns 0 fds on timeout, which still counts as a completed wait
        fence.wait(0).unwrap();
    }

    #[test]
    fn dup_creates_independent_owner() {
        let fence = signaled_fence();
        let copy = fence.dup().unwrap();
        assert_ne!(fence.as_raw_fd(), copy.as_raw_fd());
        drop(fence);
        // the copy stays valid after the original is closed
        assert!(copy.is_signaled());
    }

    #[test]
    fn pipe_fence_signals_on_write() {
        let (read, write) = rustix::pipe::pipe().unwrap();
        let fence = Fence::from_fd(read);
        assert!(!fence.is_signaled());
        rustix::io::write(&write, &[1u8]).unwrap();
        assert!(fence.is_signaled());
        fence.wait(-1).unwrap();
    }
}
