//! Imported pixel buffer descriptors
//!
//! Client buffers reach the engine as prime file descriptors that were already
//! imported by the embedder. The engine only needs the buffer geometry, the
//! format and a kms framebuffer handle for direct scan-out; creating that
//! framebuffer is delegated to the [`FramebufferExporter`] so the engine stays
//! independent of the actual import path (gbm, dumb buffers, ...).

use std::num::NonZeroU32;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use drm::control::{framebuffer, RawResourceHandle};
use drm_fourcc::DrmFourcc;

/// Maximum number of memory planes a buffer can be made of
pub const MAX_BUFFER_PLANES: usize = 4;

/// Immutable descriptor of an imported dma-buf backed pixel buffer.
///
/// The kms framebuffer object is created lazily the first time the buffer is
/// assigned to a plane for direct scan-out.
#[derive(Debug)]
pub struct DrmBuffer {
    width: u32,
    height: u32,
    format: DrmFourcc,
    pitches: [u32; MAX_BUFFER_PLANES],
    offsets: [u32; MAX_BUFFER_PLANES],
    total_planes: u32,
    prime_fd: Option<OwnedFd>,
    // 0 encodes "no framebuffer yet"
    fb_id: AtomicU32,
}

impl DrmBuffer {
    /// Describe an imported buffer.
    ///
    /// `prime_fd` may be `None` for buffers that only ever feed the GPU
    /// composition path through a texture upload.
    pub fn new(
        width: u32,
        height: u32,
        format: DrmFourcc,
        pitches: [u32; MAX_BUFFER_PLANES],
        offsets: [u32; MAX_BUFFER_PLANES],
        total_planes: u32,
        prime_fd: Option<OwnedFd>,
    ) -> DrmBuffer {
        DrmBuffer {
            width,
            height,
            format,
            pitches,
            offsets,
            total_planes,
            prime_fd,
            fb_id: AtomicU32::new(0),
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Per-plane row pitches in bytes
    pub fn pitches(&self) -> &[u32; MAX_BUFFER_PLANES] {
        &self.pitches
    }

    /// Per-plane starting offsets in bytes
    pub fn offsets(&self) -> &[u32; MAX_BUFFER_PLANES] {
        &self.offsets
    }

    /// Number of memory planes in use
    pub fn total_planes(&self) -> u32 {
        self.total_planes
    }

    /// The prime fd backing this buffer, if any
    pub fn prime_fd(&self) -> Option<BorrowedFd<'_>> {
        self.prime_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// The kms framebuffer for this buffer, if one was created already
    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        NonZeroU32::new(self.fb_id.load(Ordering::Acquire)).map(framebuffer::Handle::from)
    }

    pub(crate) fn set_framebuffer(&self, fb: framebuffer::Handle) {
        self.fb_id
            .store(RawResourceHandle::from(fb).get(), Ordering::Release);
    }
}

/// The buffer backings understood by the engine.
///
/// Direct scan-out only needs the descriptor, the format and a framebuffer
/// handle, so the variants stay closed instead of hiding behind a trait
/// object.
#[derive(Debug)]
pub enum GraphicsBuffer {
    /// Dma-buf backed buffer imported through drm prime
    Drm(DrmBuffer),
}

impl GraphicsBuffer {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        match self {
            GraphicsBuffer::Drm(buffer) => buffer.width(),
        }
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        match self {
            GraphicsBuffer::Drm(buffer) => buffer.height(),
        }
    }

    /// Pixel format
    pub fn format(&self) -> DrmFourcc {
        match self {
            GraphicsBuffer::Drm(buffer) => buffer.format(),
        }
    }

    /// The kms framebuffer for this buffer, if one was created already
    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        match self {
            GraphicsBuffer::Drm(buffer) => buffer.framebuffer(),
        }
    }

    /// Get or create the kms framebuffer for this buffer
    pub fn ensure_framebuffer<E: FramebufferExporter>(
        &self,
        exporter: &E,
    ) -> Result<framebuffer::Handle, E::Error> {
        if let Some(fb) = self.framebuffer() {
            return Ok(fb);
        }
        match self {
            GraphicsBuffer::Drm(buffer) => {
                let fb = exporter.create_framebuffer(buffer)?;
                buffer.set_framebuffer(fb);
                Ok(fb)
            }
        }
    }
}

/// Turns imported buffers into kms framebuffer objects on the scan-out device.
pub trait FramebufferExporter {
    /// Error type returned when the framebuffer cannot be created
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a framebuffer object for `buffer` on the scan-out device
    fn create_framebuffer(&self, buffer: &DrmBuffer) -> Result<framebuffer::Handle, Self::Error>;

    /// Drop any cached per-buffer state (queue reset path)
    fn purge_buffers(&mut self);
}
