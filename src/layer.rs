//! Client layers and their per-frame snapshots
//!
//! The caller hands the queue a z-ordered list of [`HwcLayer`]s every frame.
//! For each visible one an [`OverlayLayer`] snapshot is built and diffed
//! against its z-matched counterpart from the previous frame; the resulting
//! dirty bits drive the cached-plane reuse path.

use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::GraphicsBuffer;
use crate::utils::{BufferCoords, Fence, Physical, Rectangle};

bitflags! {
    /// Transform applied to a layer or to the whole display pipe
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HwcTransform: u32 {
        /// Mirror horizontally
        const FLIP_H = 1 << 0;
        /// Mirror vertically
        const FLIP_V = 1 << 1;
        /// Rotate by 90 degrees clockwise
        const ROTATE_90 = 1 << 2;
        /// Rotate by 180 degrees
        const ROTATE_180 = 1 << 3;
        /// Rotate by 270 degrees clockwise
        const ROTATE_270 = 1 << 4;
    }
}

/// Requested rotation of the whole display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwcRotation {
    /// No rotation
    None,
    /// Rotate by 90 degrees clockwise
    Rotate90,
    /// Rotate by 180 degrees
    Rotate180,
    /// Rotate by 270 degrees clockwise
    Rotate270,
}

/// Per-pixel blending applied when the layer is composited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blending {
    /// Source pixels replace the destination
    #[default]
    None,
    /// Source color channels are premultiplied by alpha
    Premultiplied,
    /// Source alpha describes per-pixel coverage
    Coverage,
}

/// Usage hint carried by the client layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerUsage {
    /// Regular application content
    #[default]
    Normal,
    /// Mouse cursor image
    Cursor,
    /// Video frames, eligible for the media post-processing path
    Video,
}

/// How a layer ended up on screen for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    /// The layer was scanned out directly by a hardware plane
    Display,
    /// The layer was rendered into an off-screen surface by the GPU
    Gpu,
}

/// A client layer as handed to the queue each frame.
///
/// The acquire fence is consumed by the first snapshot built from the layer;
/// the release fence is written back after the frame committed.
#[derive(Debug)]
pub struct HwcLayer {
    buffer: Arc<GraphicsBuffer>,
    source_crop: Rectangle<f32, BufferCoords>,
    display_frame: Rectangle<i32, Physical>,
    surface_damage: Option<Rectangle<i32, Physical>>,
    transform: HwcTransform,
    blending: Blending,
    alpha: u8,
    usage: LayerUsage,
    visible: bool,
    raw_pixel_generation: Option<u64>,
    acquire_fence: Option<Fence>,
    release_fence: Option<Fence>,
}

impl HwcLayer {
    /// Create a layer covering the whole buffer at (0, 0)
    pub fn new(buffer: Arc<GraphicsBuffer>) -> HwcLayer {
        let width = buffer.width();
        let height = buffer.height();
        HwcLayer {
            source_crop: Rectangle::from_loc_and_size((0.0, 0.0), (width as f32, height as f32)),
            display_frame: Rectangle::from_loc_and_size((0, 0), (width as i32, height as i32)),
            buffer,
            surface_damage: None,
            transform: HwcTransform::empty(),
            blending: Blending::None,
            alpha: 0xff,
            usage: LayerUsage::Normal,
            visible: true,
            raw_pixel_generation: None,
            acquire_fence: None,
            release_fence: None,
        }
    }

    /// Replace the layer's buffer
    pub fn set_buffer(&mut self, buffer: Arc<GraphicsBuffer>) {
        self.buffer = buffer;
    }

    /// The buffer currently attached to the layer
    pub fn buffer(&self) -> &Arc<GraphicsBuffer> {
        &self.buffer
    }

    /// Set the region of the buffer sampled by this layer
    pub fn set_source_crop(&mut self, crop: Rectangle<f32, BufferCoords>) {
        self.source_crop = crop;
    }

    /// Set the on-screen destination rectangle
    pub fn set_display_frame(&mut self, frame: Rectangle<i32, Physical>) {
        self.display_frame = frame;
    }

    /// The on-screen destination rectangle
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Restrict the changed region of the current buffer.
    ///
    /// Without a damage rectangle a buffer change counts as full damage.
    pub fn set_surface_damage(&mut self, damage: Rectangle<i32, Physical>) {
        self.surface_damage = Some(damage);
    }

    /// Set the per-layer transform
    pub fn set_transform(&mut self, transform: HwcTransform) {
        self.transform = transform;
    }

    /// Set the blending mode
    pub fn set_blending(&mut self, blending: Blending) {
        self.blending = blending;
    }

    /// Set the whole-plane alpha (255 is opaque)
    pub fn set_alpha(&mut self, alpha: u8) {
        self.alpha = alpha;
    }

    /// Set the usage hint
    pub fn set_usage(&mut self, usage: LayerUsage) {
        self.usage = usage;
    }

    /// Mark the layer (in)visible for this frame
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Whether the layer takes part in composition this frame
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Mark the layer as backed by raw pixel data that must be uploaded by the
    /// GPU backend. Bump `generation` whenever the backing store changed.
    pub fn set_raw_pixel_generation(&mut self, generation: u64) {
        self.raw_pixel_generation = Some(generation);
    }

    /// Attach the producer's acquire fence for the current buffer
    pub fn set_acquire_fence(&mut self, fence: Fence) {
        self.acquire_fence = Some(fence);
    }

    /// Take the release fence written by the last committed frame, if any
    pub fn take_release_fence(&mut self) -> Option<Fence> {
        self.release_fence.take()
    }

    pub(crate) fn set_release_fence(&mut self, fence: Option<Fence>) {
        self.release_fence = fence;
    }

    pub(crate) fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct LayerDirty: u32 {
        const DIMENSIONS_CHANGED = 1 << 0;
        const SOURCE_RECT_CHANGED = 1 << 1;
        const CONTENT_CHANGED = 1 << 2;
        const NEEDS_FULL_DRAW = 1 << 3;
        const NEEDS_REVALIDATION = 1 << 4;
        const RAW_PIXEL_CHANGED = 1 << 5;
    }
}

/// Immutable per-frame snapshot of one [`HwcLayer`].
///
/// Built once per frame from the raw layer and its z-matched previous-frame
/// counterpart; only the composition tag and the acquire fence are written
/// afterwards.
#[derive(Debug)]
pub struct OverlayLayer {
    z_order: usize,
    layer_index: usize,
    buffer: Arc<GraphicsBuffer>,
    source_crop: Rectangle<f32, BufferCoords>,
    display_frame: Rectangle<i32, Physical>,
    surface_damage: Rectangle<i32, Physical>,
    transform: HwcTransform,
    blending: Blending,
    alpha: u8,
    usage: LayerUsage,
    visible: bool,
    can_scan_out: bool,
    raw_pixel_generation: Option<u64>,
    dirty: LayerDirty,
    acquire_fence: Option<Fence>,
    composition: Option<Composition>,
}

impl OverlayLayer {
    /// Build a snapshot from a raw layer, consuming its acquire fence.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_hwc_layer(
        layer: &mut HwcLayer,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        display_height: u32,
        plane_transform: HwcTransform,
        handle_constraints: bool,
    ) -> OverlayLayer {
        let display_frame = layer.display_frame;
        Self::init(
            layer,
            previous,
            z_order,
            layer_index,
            display_frame,
            display_height,
            plane_transform,
            handle_constraints,
        )
    }

    /// Build a snapshot with a display frame pre-scaled for a cloned pipe.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_scaled_hwc_layer(
        layer: &mut HwcLayer,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        display_frame: Rectangle<i32, Physical>,
        display_height: u32,
        plane_transform: HwcTransform,
        handle_constraints: bool,
    ) -> OverlayLayer {
        Self::init(
            layer,
            previous,
            z_order,
            layer_index,
            display_frame,
            display_height,
            plane_transform,
            handle_constraints,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn init(
        layer: &mut HwcLayer,
        previous: Option<&OverlayLayer>,
        z_order: usize,
        layer_index: usize,
        mut display_frame: Rectangle<i32, Physical>,
        display_height: u32,
        plane_transform: HwcTransform,
        handle_constraints: bool,
    ) -> OverlayLayer {
        let transform = layer.transform | plane_transform;

        if plane_transform.contains(HwcTransform::FLIP_V) {
            let bottom = display_frame.loc.y + display_frame.size.h;
            display_frame.loc.y = display_height as i32 - bottom;
        }

        let mut visible = layer.visible && layer.alpha != 0;
        if handle_constraints {
            let bounds: Rectangle<i32, Physical> =
                Rectangle::from_loc_and_size((i32::MIN / 2, 0), (i32::MAX, display_height as i32));
            match display_frame.intersection(bounds) {
                Some(clipped) => display_frame = clipped,
                None => visible = false,
            }
        }
        if display_frame.is_empty() {
            visible = false;
        }

        let raw_pixel = layer.raw_pixel_generation.is_some();
        let mut snapshot = OverlayLayer {
            z_order,
            layer_index,
            buffer: layer.buffer.clone(),
            source_crop: layer.source_crop,
            display_frame,
            surface_damage: Rectangle::zero(),
            transform,
            blending: layer.blending,
            alpha: layer.alpha,
            usage: layer.usage,
            visible,
            can_scan_out: !raw_pixel,
            raw_pixel_generation: layer.raw_pixel_generation,
            dirty: LayerDirty::empty(),
            acquire_fence: layer.take_acquire_fence(),
            composition: None,
        };

        match previous {
            Some(previous) => snapshot.diff_against(previous, layer),
            None => {
                // Brand new layer at this z: everything it covers needs drawing.
                snapshot.dirty = LayerDirty::CONTENT_CHANGED | LayerDirty::NEEDS_FULL_DRAW;
                snapshot.surface_damage = snapshot.display_frame;
            }
        }

        snapshot
    }

    fn diff_against(&mut self, previous: &OverlayLayer, layer: &HwcLayer) {
        let mut dirty = LayerDirty::empty();

        let same_buffer = Arc::ptr_eq(&self.buffer, &previous.buffer);
        if !same_buffer {
            dirty |= LayerDirty::CONTENT_CHANGED;
            self.surface_damage = layer
                .surface_damage
                .map(|damage| damage.intersection(self.display_frame).unwrap_or_default())
                .unwrap_or(self.display_frame);
        }

        if let (Some(current), Some(old)) = (self.raw_pixel_generation, previous.raw_pixel_generation) {
            if current != old {
                dirty |= LayerDirty::RAW_PIXEL_CHANGED | LayerDirty::CONTENT_CHANGED;
                self.surface_damage = self.display_frame;
            }
        }

        if self.display_frame != previous.display_frame {
            dirty |= LayerDirty::DIMENSIONS_CHANGED;
        }

        if self.source_crop != previous.source_crop {
            dirty |= LayerDirty::SOURCE_RECT_CHANGED | LayerDirty::NEEDS_FULL_DRAW;
        }

        if self.buffer.format() != previous.buffer.format() {
            dirty |= LayerDirty::NEEDS_REVALIDATION | LayerDirty::CONTENT_CHANGED | LayerDirty::NEEDS_FULL_DRAW;
            self.surface_damage = self.display_frame;
        }

        if self.transform != previous.transform
            || self.blending != previous.blending
            || self.alpha != previous.alpha
        {
            dirty |= LayerDirty::NEEDS_REVALIDATION | LayerDirty::NEEDS_FULL_DRAW;
        }

        if self.usage != previous.usage {
            dirty |= LayerDirty::NEEDS_REVALIDATION;
        }

        self.dirty = dirty;
    }

    /// Dense z-order of the layer within the frame
    pub fn z_order(&self) -> usize {
        self.z_order
    }

    /// Index of the originating layer in the caller's input list
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// The pixel buffer backing this layer
    pub fn buffer(&self) -> &Arc<GraphicsBuffer> {
        &self.buffer
    }

    /// Region of the buffer sampled by the layer
    pub fn source_crop(&self) -> Rectangle<f32, BufferCoords> {
        self.source_crop
    }

    /// On-screen destination rectangle
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Changed region of the layer's content this frame
    pub fn surface_damage(&self) -> Rectangle<i32, Physical> {
        self.surface_damage
    }

    /// Combined layer and pipe transform
    pub fn transform(&self) -> HwcTransform {
        self.transform
    }

    /// Blending mode
    pub fn blending(&self) -> Blending {
        self.blending
    }

    /// Whole-plane alpha
    pub fn alpha(&self) -> u8 {
        self.alpha
    }

    /// Whether the layer survived the visibility constraints
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether the layer is a cursor image
    pub fn is_cursor_layer(&self) -> bool {
        self.usage == LayerUsage::Cursor
    }

    /// Whether the layer carries video content
    pub fn is_video_layer(&self) -> bool {
        self.usage == LayerUsage::Video
    }

    /// Whether the layer's buffer can be put on a plane without GPU help
    pub fn can_scan_out(&self) -> bool {
        self.can_scan_out
    }

    /// Whether the on-screen rectangle moved or resized since last frame
    pub fn has_dimensions_changed(&self) -> bool {
        self.dirty.contains(LayerDirty::DIMENSIONS_CHANGED)
    }

    /// Whether the sampled buffer region changed since last frame
    pub fn has_source_rect_changed(&self) -> bool {
        self.dirty.contains(LayerDirty::SOURCE_RECT_CHANGED)
    }

    /// Whether the layer's pixels changed since last frame
    pub fn has_content_changed(&self) -> bool {
        self.dirty.contains(LayerDirty::CONTENT_CHANGED)
    }

    /// Whether any composed surface showing this layer must be fully redrawn
    pub fn needs_full_draw(&self) -> bool {
        self.dirty.contains(LayerDirty::NEEDS_FULL_DRAW)
    }

    /// Whether the plane assignment for this layer must be re-checked
    pub fn needs_revalidation(&self) -> bool {
        self.dirty.contains(LayerDirty::NEEDS_REVALIDATION)
    }

    /// Whether the raw pixel backing store changed since last frame
    pub fn raw_pixel_data_changed(&self) -> bool {
        self.dirty.contains(LayerDirty::RAW_PIXEL_CHANGED)
    }

    /// How the layer was realized in the last committed frame
    pub fn composition(&self) -> Option<Composition> {
        self.composition
    }

    pub(crate) fn set_composition(&mut self, composition: Composition) {
        self.composition = Some(composition);
    }

    /// Move the acquire fence out of the snapshot. Yields a value at most once.
    pub(crate) fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }
}
