//! Hardware planes and their per-frame assignment state
//!
//! A [`DisplayPlaneState`] describes what one hardware plane will show after
//! the next atomic commit: either a single layer scanned out directly, or a
//! stack of layers composited by the GPU into an off-screen surface ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use drm::control::{plane, PlaneType};
use drm_fourcc::DrmFourcc;

use crate::layer::OverlayLayer;
use crate::surface::{NativeSurface, SurfaceClear};
use crate::utils::{BufferCoords, Physical, Rectangle};

/// One hardware plane of the display controller.
///
/// Owned by the plane manager; plane states reference it while the plane is
/// assigned.
#[derive(Debug)]
pub struct DisplayPlane {
    handle: plane::Handle,
    plane_type: PlaneType,
    in_use: AtomicBool,
}

impl DisplayPlane {
    /// Describe a plane of the display controller
    pub fn new(handle: plane::Handle, plane_type: PlaneType) -> DisplayPlane {
        DisplayPlane {
            handle,
            plane_type,
            in_use: AtomicBool::new(false),
        }
    }

    /// The kms handle of the plane
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// The kind of plane as reported by the kernel
    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    /// Whether the plane is currently part of a composition
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Mark the plane as (not) part of a composition
    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct PlaneStateFlags: u32 {
        const OFFSCREEN_COMPOSITION = 1 << 0;
        const SURFACE_RECYCLED = 1 << 1;
        const CURSOR = 1 << 2;
        const VIDEO = 1 << 3;
        const APPLY_EFFECTS = 1 << 4;
    }
}

bitflags! {
    /// Constraint checks a cached plane assignment still has to pass
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Revalidation: u32 {
        /// The plane composes a single layer that may be scan-out capable
        const SCANOUT = 1 << 0;
        /// The plane downscales and may exceed the scaler limits
        const DOWNSCALING = 1 << 1;
    }
}

/// One hardware plane's intended contents for the next atomic commit.
#[derive(Debug, Clone)]
pub struct DisplayPlaneState {
    plane: Arc<DisplayPlane>,
    source_layers: Vec<usize>,
    surfaces: Vec<Arc<NativeSurface>>,
    display_frame: Rectangle<i32, Physical>,
    source_crop: Rectangle<f32, BufferCoords>,
    surface_damage: Rectangle<i32, Physical>,
    scanout_layer: Option<usize>,
    flags: PlaneStateFlags,
    revalidation: Revalidation,
}

impl DisplayPlaneState {
    /// Assign a plane to a single layer, scanning it out directly
    pub fn new_scanout(plane: Arc<DisplayPlane>, layer: &OverlayLayer) -> DisplayPlaneState {
        let mut flags = PlaneStateFlags::empty();
        if layer.is_cursor_layer() {
            flags |= PlaneStateFlags::CURSOR;
        }
        if layer.is_video_layer() {
            flags |= PlaneStateFlags::VIDEO;
        }
        plane.set_in_use(true);
        DisplayPlaneState {
            plane,
            source_layers: vec![layer.z_order()],
            surfaces: Vec::new(),
            display_frame: layer.display_frame(),
            source_crop: layer.source_crop(),
            surface_damage: layer.display_frame(),
            scanout_layer: Some(layer.z_order()),
            flags,
            revalidation: Revalidation::empty(),
        }
    }

    /// Copy a previous frame's state as the starting point for the next one.
    ///
    /// Existing surface contents count as recycled until damage invalidates
    /// them.
    pub fn clone_for_frame(&self) -> DisplayPlaneState {
        let mut state = self.clone();
        state.surface_damage = Rectangle::zero();
        state.revalidation = Revalidation::empty();
        state.flags.set(
            PlaneStateFlags::SURFACE_RECYCLED,
            !state.surfaces.is_empty() && state.needs_offscreen_composition(),
        );
        state
    }

    /// The hardware plane this state drives
    pub fn plane(&self) -> &Arc<DisplayPlane> {
        &self.plane
    }

    /// Z-orders of the frame layers shown by this plane, bottom first
    pub fn source_layers(&self) -> &[usize] {
        &self.source_layers
    }

    /// Append a layer to this plane, turning it into a composed plane when it
    /// now shows more than one layer.
    pub fn add_layer(&mut self, layer: &OverlayLayer) {
        self.source_layers.push(layer.z_order());
        self.display_frame = self.display_frame.merge(layer.display_frame());
        self.surface_damage = self.display_frame;
        if layer.is_cursor_layer() {
            self.flags |= PlaneStateFlags::CURSOR;
        }
        if layer.is_video_layer() {
            self.flags |= PlaneStateFlags::VIDEO;
        }
        if self.source_layers.len() > 1 {
            self.mark_offscreen();
        }
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
    }

    /// Drop all source layers with a z-order at or above `threshold` and
    /// recompute the plane rectangles from the survivors.
    pub fn reset_layers(&mut self, layers: &[OverlayLayer], threshold: usize) {
        self.source_layers.retain(|&z| z < threshold);
        self.display_frame = Rectangle::zero();
        self.source_crop = Rectangle::zero();
        self.flags
            .remove(PlaneStateFlags::CURSOR | PlaneStateFlags::VIDEO | PlaneStateFlags::SURFACE_RECYCLED);
        for &z in &self.source_layers {
            let layer = &layers[z];
            self.display_frame = self.display_frame.merge(layer.display_frame());
            self.source_crop = self.source_crop.merge(layer.source_crop());
            if layer.is_cursor_layer() {
                self.flags |= PlaneStateFlags::CURSOR;
            }
            if layer.is_video_layer() {
                self.flags |= PlaneStateFlags::VIDEO;
            }
        }
        self.surface_damage = self.display_frame;
    }

    /// Switch the plane to GPU composition
    pub fn mark_offscreen(&mut self) {
        self.flags |= PlaneStateFlags::OFFSCREEN_COMPOSITION;
        self.scanout_layer = None;
    }

    /// Bind a single layer for direct scan-out, leaving GPU composition
    pub fn set_scanout_layer(&mut self, z_order: usize) {
        self.flags.remove(PlaneStateFlags::OFFSCREEN_COMPOSITION);
        self.scanout_layer = Some(z_order);
    }

    /// The layer scanned out directly, if the plane does not compose
    pub fn scanout_layer(&self) -> Option<usize> {
        self.scanout_layer
    }

    /// Whether the plane shows its layers through an off-screen surface
    pub fn needs_offscreen_composition(&self) -> bool {
        self.flags.contains(PlaneStateFlags::OFFSCREEN_COMPOSITION)
    }

    /// Whether the plane scans a buffer out directly
    pub fn scanout(&self) -> bool {
        !self.needs_offscreen_composition()
    }

    /// Whether the current surface contents are still valid from last frame
    pub fn surface_recycled(&self) -> bool {
        self.flags.contains(PlaneStateFlags::SURFACE_RECYCLED)
    }

    /// Whether the plane shows a cursor
    pub fn is_cursor_plane(&self) -> bool {
        self.flags.contains(PlaneStateFlags::CURSOR)
    }

    /// Whether the plane shows video content
    pub fn is_video_plane(&self) -> bool {
        self.flags.contains(PlaneStateFlags::VIDEO)
    }

    /// Whether video post-processing effects are applied to this plane
    pub fn apply_effects(&self) -> bool {
        self.flags.contains(PlaneStateFlags::APPLY_EFFECTS)
    }

    /// Toggle video post-processing for this plane
    pub fn set_apply_effects(&mut self, apply: bool) {
        self.flags.set(PlaneStateFlags::APPLY_EFFECTS, apply);
    }

    /// Whether this plane may be merged with an adjacent one.
    ///
    /// Cursor and video planes never participate in a squash.
    pub fn can_squash(&self) -> bool {
        !self
            .flags
            .intersects(PlaneStateFlags::CURSOR | PlaneStateFlags::VIDEO | PlaneStateFlags::APPLY_EFFECTS)
    }

    /// On-screen region covered by the plane
    pub fn display_frame(&self) -> Rectangle<i32, Physical> {
        self.display_frame
    }

    /// Source region sampled by the plane
    pub fn source_crop(&self) -> Rectangle<f32, BufferCoords> {
        self.source_crop
    }

    /// Update the on-screen region after a layer moved or resized
    pub fn update_display_frame(&mut self, frame: Rectangle<i32, Physical>, full_draw: bool) {
        self.display_frame = self.display_frame.merge(frame);
        if full_draw {
            self.surface_damage = self.display_frame;
        }
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
    }

    /// Update the sampled region after a layer's crop changed
    pub fn update_source_crop(&mut self, crop: Rectangle<f32, BufferCoords>, full_draw: bool) {
        self.source_crop = self.source_crop.merge(crop);
        if full_draw {
            self.surface_damage = self.display_frame;
        }
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
    }

    /// Grow the repaint region of the plane and its surfaces
    pub fn update_damage(&mut self, damage: Rectangle<i32, Physical>) {
        self.surface_damage = self.surface_damage.merge(damage);
        for surface in &self.surfaces {
            surface.update_damage(damage);
        }
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
    }

    /// Schedule every surface of the ring for a repaint
    pub fn refresh_surfaces(&mut self, clear: SurfaceClear, _refresh: bool) {
        for surface in &self.surfaces {
            surface.refresh(clear, self.display_frame);
        }
        self.surface_damage = self.display_frame;
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
    }

    /// The accumulated repaint region for this frame
    pub fn surface_damage(&self) -> Rectangle<i32, Physical> {
        self.surface_damage
    }

    /// The off-screen surface ring backing this plane
    pub fn surfaces(&self) -> &[Arc<NativeSurface>] {
        &self.surfaces
    }

    /// Whether a composed plane still has to be given a surface
    pub fn needs_surface_allocation(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Attach an off-screen surface to the ring. Called by the plane manager.
    pub fn add_surface(&mut self, surface: Arc<NativeSurface>) {
        surface.set_in_use(true);
        self.surfaces.push(surface);
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
    }

    /// Detach all surfaces from the ring, e.g. for recycling
    pub fn take_surfaces(&mut self) -> Vec<Arc<NativeSurface>> {
        self.flags.remove(PlaneStateFlags::SURFACE_RECYCLED);
        std::mem::take(&mut self.surfaces)
    }

    /// The surface the GPU renders into this frame
    pub fn offscreen_target(&self) -> Option<&Arc<NativeSurface>> {
        self.surfaces.last()
    }

    /// Re-derive which constraint checks this assignment still has to pass
    pub fn validate_revalidation(&mut self) {
        let mut revalidation = Revalidation::empty();
        if self.source_layers.len() == 1 && self.needs_offscreen_composition() && !self.apply_effects() {
            revalidation |= Revalidation::SCANOUT;
        }
        if (self.source_crop.size.w as i32 > self.display_frame.size.w)
            || (self.source_crop.size.h as i32 > self.display_frame.size.h)
        {
            revalidation |= Revalidation::DOWNSCALING;
        }
        self.revalidation = revalidation;
    }

    /// The pending constraint checks
    pub fn revalidation_type(&self) -> Revalidation {
        self.revalidation
    }

    /// Mark a constraint check as done
    pub fn revalidation_done(&mut self, done: Revalidation) {
        self.revalidation.remove(done);
    }

    /// Rotate the surface ages after the frame was committed.
    ///
    /// With a full ring of three the ages are permuted 0 -> 2, 1 -> 0, 2 -> 1;
    /// shorter rings age down from the freshly presented surface.
    pub fn update_surface_ages(&self) {
        if self.surfaces.len() == 3 {
            self.surfaces[1].set_age(0);
            self.surfaces[0].set_age(2);
            self.surfaces[2].set_age(1);
        } else {
            for (i, surface) in self.surfaces.iter().enumerate() {
                surface.set_age(2 - i as i32);
            }
        }
    }
}

/// Result of a full or incremental plane validation pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOutcome {
    /// At least one plane needs a GPU composition pass
    pub needs_render: bool,
    /// The commit was test-checked as part of validation
    pub commit_checked: bool,
    /// Constraints across the final plane list still have to be re-checked
    pub needs_plane_validation: bool,
}

/// Result of re-checking constraints across an assigned plane list
#[derive(Debug, Clone, Copy, Default)]
pub struct RevalidationOutcome {
    /// At least one plane needs a GPU composition pass
    pub needs_render: bool,
    /// The cached assignment cannot be patched; run a full validation
    pub request_full_validation: bool,
}

/// Capability oracle and allocator for the display controller's planes.
///
/// Implementations own the plane inventory and the off-screen surface pool and
/// answer whether a given layer stack can be realized on planes.
pub trait PlaneManager {
    /// Error type returned when the manager cannot be initialized
    type Error: std::error::Error + Send + Sync + 'static;

    /// Discover planes and size the surface pool for the given mode
    fn initialize(&mut self, width: u32, height: u32) -> Result<(), Self::Error>;

    /// Apply a whole-pipe transform to all subsequent validations
    fn set_display_transform(&mut self, transform: crate::layer::HwcTransform);

    /// Assign `layers[add_index..]` to planes.
    ///
    /// With `add_index` 0 the composition is rebuilt from scratch (the queue
    /// hands in an empty `composition`); a non-zero `add_index` appends to the
    /// cached prefix already present in `composition`. `force_gpu` collapses
    /// everything onto the primary plane through GPU composition.
    #[allow(clippy::too_many_arguments)]
    fn validate_layers(
        &mut self,
        layers: &[OverlayLayer],
        add_index: usize,
        force_gpu: bool,
        composition: &mut Vec<DisplayPlaneState>,
        previous: &[DisplayPlaneState],
        surfaces_not_inuse: &mut Vec<Arc<NativeSurface>>,
    ) -> ValidationOutcome;

    /// Re-check constraints across an already assigned plane list
    fn revalidate_planes(
        &mut self,
        composition: &mut Vec<DisplayPlaneState>,
        layers: &[OverlayLayer],
        surfaces_not_inuse: &mut Vec<Arc<NativeSurface>>,
        needs_plane_validation: bool,
        revalidate_commit: bool,
    ) -> RevalidationOutcome;

    /// Give a composed plane an off-screen surface from the pool.
    ///
    /// Implementations attach at least one surface and mark the plane for
    /// off-screen composition.
    fn set_offscreen_plane_target(&mut self, plane: &mut DisplayPlaneState);

    /// Detach a plane's surfaces and queue them for reuse.
    ///
    /// With `release_immediately` the surfaces go back to the pool right away
    /// instead of aging out through `surfaces_not_inuse`.
    fn mark_surfaces_for_recycling(
        &mut self,
        plane: &mut DisplayPlaneState,
        surfaces_not_inuse: &mut Vec<Arc<NativeSurface>>,
        release_immediately: bool,
    );

    /// Free pooled surfaces that no plane references anymore
    fn release_free_offscreen_targets(&mut self);

    /// Free the whole surface pool (queue reset path)
    fn release_all_offscreen_targets(&mut self);

    /// Whether any off-screen surfaces are currently allocated
    fn has_surfaces(&self) -> bool;

    /// Height of the display mode in pixels
    fn height(&self) -> u32;

    /// Whether any plane of the pipe can scan out the given format
    fn check_plane_format(&self, format: DrmFourcc) -> bool;
}
