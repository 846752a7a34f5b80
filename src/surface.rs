//! Off-screen render targets
//!
//! A composed plane scans out one of up to three [`NativeSurface`]s owned by
//! the plane manager. Surfaces are aged 0..=2 for triple buffering; age -1
//! quarantines a surface for release on the following frame.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::GraphicsBuffer;
use crate::utils::{Fence, Physical, Rectangle};

/// How much of a surface must be repainted when it is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceClear {
    /// Repaint the whole surface
    Full,
    /// Repaint only the accumulated damage
    Partial,
}

#[derive(Debug, Default)]
struct SurfaceInner {
    damage: Rectangle<i32, Physical>,
    full_clear: bool,
    acquire_fence: Option<Fence>,
}

/// An off-screen render target loaned to a composed plane.
///
/// The plane manager owns the surface; plane states and the recycling lists
/// hold shared references to it.
#[derive(Debug)]
pub struct NativeSurface {
    buffer: Arc<GraphicsBuffer>,
    age: AtomicI32,
    in_use: AtomicBool,
    inner: Mutex<SurfaceInner>,
}

impl NativeSurface {
    /// Wrap an allocated buffer as a composition target
    pub fn new(buffer: Arc<GraphicsBuffer>) -> NativeSurface {
        NativeSurface {
            buffer,
            age: AtomicI32::new(0),
            in_use: AtomicBool::new(false),
            inner: Mutex::new(SurfaceInner {
                full_clear: true,
                ..Default::default()
            }),
        }
    }

    /// The buffer rendered into and scanned out
    pub fn buffer(&self) -> &Arc<GraphicsBuffer> {
        &self.buffer
    }

    /// Current age of the surface contents
    pub fn age(&self) -> i32 {
        self.age.load(Ordering::Acquire)
    }

    /// Set the age of the surface contents. -1 quarantines the surface for
    /// release on the next frame.
    pub fn set_age(&self, age: i32) {
        self.age.store(age, Ordering::Release);
    }

    /// Whether the surface is attached to a plane
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Mark the surface as (not) attached to a plane
    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    /// Grow the pending repaint region
    pub fn update_damage(&self, damage: Rectangle<i32, Physical>) {
        let mut inner = self.inner.lock().unwrap();
        inner.damage = inner.damage.merge(damage);
    }

    /// Reset the pending repaint region, optionally forcing a full repaint
    pub fn refresh(&self, clear: SurfaceClear, region: Rectangle<i32, Physical>) {
        let mut inner = self.inner.lock().unwrap();
        inner.damage = region;
        inner.full_clear = clear == SurfaceClear::Full;
    }

    /// The region that must be repainted before the next scan-out
    pub fn damage(&self) -> Rectangle<i32, Physical> {
        self.inner.lock().unwrap().damage
    }

    /// Whether the whole surface must be repainted
    pub fn needs_full_clear(&self) -> bool {
        self.inner.lock().unwrap().full_clear
    }

    /// Consume the pending repaint state after a draw
    pub fn mark_painted(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.damage = Rectangle::zero();
        inner.full_clear = false;
    }

    /// Attach the fence the GPU signals once rendering into this surface is
    /// done. Set by the composition backend after a draw.
    pub fn set_acquire_fence(&self, fence: Fence) {
        self.inner.lock().unwrap().acquire_fence = Some(fence);
    }

    /// Move the GPU completion fence out of the surface
    pub fn take_acquire_fence(&self) -> Option<Fence> {
        self.inner.lock().unwrap().acquire_fence.take()
    }
}
