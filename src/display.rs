//! Physical display contract
//!
//! The queue assembles a plane configuration per frame and hands it to the
//! [`DisplaySink`], which submits it to the kernel atomically and returns the
//! retire fence. Color correction is programmed through the same sink right
//! before the commit that makes it visible.

use crate::layer::OverlayLayer;
use crate::plane::DisplayPlaneState;
use crate::utils::Fence;

/// Per-channel gamma curve exponents
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gamma {
    /// Red channel exponent
    pub red: f32,
    /// Green channel exponent
    pub green: f32,
    /// Blue channel exponent
    pub blue: f32,
}

impl Default for Gamma {
    fn default() -> Self {
        Gamma {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        }
    }
}

/// Hint accompanying a color transform matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTransformHint {
    /// The matrix is the identity and may be skipped
    Identity,
    /// The matrix must be applied as given
    ArbitraryMatrix,
}

/// The physical display the queue commits to.
pub trait DisplaySink {
    /// Error type returned when a commit is rejected
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically apply `current` to the display pipe.
    ///
    /// `previous` is the configuration currently on screen, `layers` the frame
    /// snapshots referenced by the plane states. Returns the retire fence when
    /// the kernel provides one.
    fn commit(
        &mut self,
        current: &[DisplayPlaneState],
        previous: &[DisplayPlaneState],
        layers: &[OverlayLayer],
        disable_overlays: bool,
    ) -> Result<Option<Fence>, Self::Error>;

    /// Turn off every plane of the pipe
    fn disable(&mut self, previous: &[DisplayPlaneState]);

    /// Program gamma, contrast and brightness.
    ///
    /// Contrast and brightness are packed 0xRRGGBB values.
    fn set_color_correction(&mut self, gamma: Gamma, contrast: u32, brightness: u32);

    /// Program the 4x4 color transform matrix
    fn set_color_transform(&mut self, matrix: &[f32; 16], hint: ColorTransformHint);

    /// Hook for deferred bring-up work after the first successful commit
    fn handle_lazy_initialization(&mut self);
}
