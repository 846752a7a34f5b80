//! GPU composition backend contract
//!
//! Planes that cannot scan a buffer out directly are rendered by a GPU
//! backend into their off-screen surfaces. The queue drives the backend
//! through [`CompositionBackend`]; the video post-processing controls are
//! forwarded to it as well.

use crate::plane::DisplayPlaneState;
use crate::layer::OverlayLayer;
use crate::utils::{Physical, Rectangle};

/// Color channel adjusted by the video post-processing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoColorControl {
    /// Overall lightness
    Brightness,
    /// Difference between light and dark areas
    Contrast,
    /// Color shift around the color wheel
    Hue,
    /// Color intensity
    Saturation,
}

/// A video color property with its valid range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoColorRange {
    /// Current value
    pub value: f32,
    /// Smallest accepted value
    pub min: f32,
    /// Largest accepted value
    pub max: f32,
}

/// When deinterlacing is applied to video layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterlaceFlag {
    /// Never deinterlace
    None,
    /// Deinterlace whenever the source is interlaced
    Auto,
    /// Always run the deinterlacer
    Force,
}

/// Deinterlacing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeinterlaceMode {
    /// Weave both fields together
    Weave,
    /// Interpolate each field to a full frame
    Bob,
    /// Motion adaptive deinterlacing
    MotionAdaptive,
    /// Motion compensated deinterlacing
    MotionCompensated,
}

/// GPU composition backend.
///
/// [`draw`](CompositionBackend::draw) renders every plane that needs
/// off-screen composition into its current surface and attaches the GPU
/// completion fence to that surface.
pub trait CompositionBackend {
    /// Error type returned by the rendering entry points
    type Error: std::error::Error + Send + Sync + 'static;

    /// (Re-)create the rendering context. Called when the display powers on.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Tear down per-frame state. Called when the queue resets.
    fn reset(&mut self);

    /// Start a composition pass
    fn begin_frame(&mut self, disable_overlays: bool) -> Result<(), Self::Error>;

    /// Render all planes marked for off-screen composition.
    ///
    /// `layer_rects` carries the display frame of every layer of the frame,
    /// indexed like `layers`.
    fn draw(
        &mut self,
        planes: &mut [DisplayPlaneState],
        layers: &[OverlayLayer],
        layer_rects: &[Rectangle<i32, Physical>],
    ) -> Result<(), Self::Error>;

    /// Upload changed raw pixel backing stores into their textures
    fn update_layer_pixel_data(&mut self, layers: &[OverlayLayer]);

    /// Finish pending pixel uploads for a frame without a composition pass
    fn ensure_pixel_data_updated(&mut self);

    /// Select how video layers are scaled
    fn set_video_scaling_mode(&mut self, mode: u32);

    /// Adjust a video color property
    fn set_video_color(&mut self, control: VideoColorControl, value: f32);

    /// Read back a video color property and its range
    fn video_color(&self, control: VideoColorControl) -> VideoColorRange;

    /// Reset a video color property to its default
    fn restore_video_default_color(&mut self, control: VideoColorControl);

    /// Configure the deinterlacer for video layers
    fn set_video_deinterlace(&mut self, flag: DeinterlaceFlag, mode: DeinterlaceMode);

    /// Disable deinterlacing again
    fn restore_video_default_deinterlace(&mut self);
}
