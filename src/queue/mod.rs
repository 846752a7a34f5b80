//! Per-display composition queue
//!
//! [`DisplayQueue`] owns one display pipe and decides, frame by frame, how a
//! z-ordered stack of client layers is realized on it: layers are diffed
//! against the previous frame, the cached plane assignment is patched where
//! possible, a full validation through the plane manager rebuilds it where
//! not, GPU composition fills the off-screen surfaces of planes that cannot
//! scan out directly, and the final configuration is committed atomically with
//! the fences threaded back to the client layers.
//!
//! The queue is driven by a single frame producer calling
//! [`queue_update`](DisplayQueue::queue_update); the vblank thread observes
//! idleness through an [`IdleStateHandle`] and the remaining control surface
//! (power, color, video effects) may be called from arbitrary threads.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, info_span, trace, warn};

use crate::buffer::FramebufferExporter;
use crate::compositor::{
    CompositionBackend, DeinterlaceFlag, DeinterlaceMode, VideoColorControl, VideoColorRange,
};
use crate::display::{ColorTransformHint, DisplaySink, Gamma};
use crate::layer::{Composition, HwcLayer, HwcRotation, HwcTransform, OverlayLayer};
use crate::plane::{DisplayPlaneState, PlaneManager, Revalidation};
use crate::surface::{NativeSurface, SurfaceClear};
use crate::utils::{Fence, Physical, Rectangle};
use crate::vblank::{PowerMode, RefreshCallback, VblankSource, VsyncCallback};

mod tracker;

use tracker::{FrameStateTracker, ScalingTracker, ScopedIdleStateTracker, TrackerFlags, IDLE_FRAME_THRESHOLD};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct QueueFlags: u32 {
        const POWERED_ON = 1 << 0;
        const CONFIGURATION_CHANGED = 1 << 1;
        const DISABLE_OVERLAY_USAGE = 1 << 2;
        const NEEDS_COLOR_CORRECTION = 1 << 3;
        const CLONED_MODE = 1 << 4;
        const IGNORE_IDLE_REFRESH = 1 << 5;
        const LAST_FRAME_IDLE_UPDATE = 1 << 6;
        const MARK_SURFACES_FOR_RELEASE = 1 << 7;
        const RELEASE_SURFACES = 1 << 8;
    }
}

/// Queue state bits, readable from the vblank thread
#[derive(Debug, Default)]
struct AtomicQueueFlags(AtomicU32);

impl AtomicQueueFlags {
    fn new(flags: QueueFlags) -> Self {
        AtomicQueueFlags(AtomicU32::new(flags.bits()))
    }

    fn snapshot(&self) -> QueueFlags {
        QueueFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    fn contains(&self, flags: QueueFlags) -> bool {
        self.snapshot().contains(flags)
    }

    fn set(&self, flags: QueueFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear(&self, flags: QueueFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn store(&self, flags: QueueFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }
}

/// State shared with the vblank thread.
#[derive(Debug)]
struct SharedState {
    flags: AtomicQueueFlags,
    idle: Arc<Mutex<FrameStateTracker>>,
    power_mode_lock: Mutex<()>,
}

impl SharedState {
    fn handle_idle_case(&self) {
        let mut tracker = self.idle.lock().unwrap();
        if tracker.state.contains(TrackerFlags::PREPARE_COMPOSITION) {
            return;
        }

        if tracker.total_planes <= 1
            || tracker
                .state
                .intersects(TrackerFlags::TRACKING_FRAMES | TrackerFlags::REVALIDATE_LAYERS)
            || tracker.has_cursor_layer
        {
            return;
        }

        if tracker.idle_frames > IDLE_FRAME_THRESHOLD {
            return;
        }

        if tracker.idle_frames < IDLE_FRAME_THRESHOLD {
            tracker.idle_frames += 1;
            return;
        }

        tracker.idle_frames += 1;
        let _power = self.power_mode_lock.lock().unwrap();
        let flags = self.flags.snapshot();
        if !flags.contains(QueueFlags::IGNORE_IDLE_REFRESH) && flags.contains(QueueFlags::POWERED_ON) {
            if let Some(callback) = tracker.refresh_callback.as_ref() {
                trace!("display idle, requesting refresh frame");
                callback(tracker.refresh_display_id);
                tracker.state.insert(TrackerFlags::PREPARE_IDLE_COMPOSITION);
            }
        }
    }

    fn force_refresh(&self) {
        let mut tracker = self.idle.lock().unwrap();
        tracker.state.remove(TrackerFlags::IGNORE_UPDATES);
        tracker.state.insert(TrackerFlags::REVALIDATE_LAYERS);

        let _power = self.power_mode_lock.lock().unwrap();
        let flags = self.flags.snapshot();
        if !flags.contains(QueueFlags::IGNORE_IDLE_REFRESH) && flags.contains(QueueFlags::POWERED_ON) {
            if let Some(callback) = tracker.refresh_callback.as_ref() {
                callback(tracker.refresh_display_id);
            }
        }
    }
}

/// Cloneable handle for the vblank thread.
///
/// Replaces a back pointer from the vblank machinery into the queue: the
/// embedder clones the handle into its event thread and ticks it on every
/// vblank.
#[derive(Debug, Clone)]
pub struct IdleStateHandle {
    shared: Arc<SharedState>,
}

impl IdleStateHandle {
    /// Advance idle detection by one vblank tick
    pub fn handle_idle_case(&self) {
        self.shared.handle_idle_case();
    }

    /// Ask the frame producer for a refresh frame and force a full validation
    pub fn force_refresh(&self) {
        self.shared.force_refresh();
    }
}

#[derive(Debug)]
struct ColorState {
    gamma: Gamma,
    contrast: u32,
    brightness: u32,
    matrix: [f32; 16],
    hint: ColorTransformHint,
}

impl Default for ColorState {
    fn default() -> Self {
        ColorState {
            gamma: Gamma::default(),
            // mid-scale default for all channels
            contrast: 0x808080,
            brightness: 0x808080,
            matrix: [0.0; 16],
            hint: ColorTransformHint::Identity,
        }
    }
}

#[derive(Debug, Default)]
struct VideoState {
    requested_effect: bool,
    applied_effect: bool,
}

/// Errors thrown by [`DisplayQueue::initialize`]
#[derive(Debug, thiserror::Error)]
pub enum InitError<P, V>
where
    P: std::error::Error + Send + Sync + 'static,
    V: std::error::Error + Send + Sync + 'static,
{
    /// The plane manager could not be initialized
    #[error("failed to initialize the display plane manager: {0}")]
    PlaneManager(#[source] P),
    /// The vblank source could not be initialized
    #[error("failed to initialize the vblank source: {0}")]
    Vblank(#[source] V),
}

/// Errors thrown by [`DisplayQueue::queue_update`]
#[derive(Debug, thiserror::Error)]
pub enum FrameError<C, D>
where
    C: std::error::Error + Send + Sync + 'static,
    D: std::error::Error + Send + Sync + 'static,
{
    /// The GPU composition pass failed
    #[error("GPU composition pass failed: {0}")]
    Composition(#[source] C),
    /// The kernel rejected the atomic commit
    #[error("atomic commit was rejected: {0}")]
    Commit(#[source] D),
}

struct CachedFrame {
    render_layers: bool,
    can_ignore_commit: bool,
    needs_plane_validation: bool,
    force_full_validation: bool,
}

/// The per-display composition state machine.
///
/// Generic over the display sink `D`, the plane manager `P`, the GPU
/// composition backend `C`, the vblank source `V` and the framebuffer
/// exporter `R`.
#[derive(Debug)]
pub struct DisplayQueue<D, P, C, V, R>
where
    D: DisplaySink,
    P: PlaneManager,
    C: CompositionBackend,
    V: VblankSource,
    R: FramebufferExporter,
{
    display: D,
    plane_manager: P,
    compositor: Mutex<C>,
    vblank: Mutex<V>,
    exporter: R,
    shared: Arc<SharedState>,
    video: Mutex<VideoState>,
    color: Mutex<ColorState>,
    scaling: ScalingTracker,
    plane_transform: HwcTransform,
    in_flight_layers: Vec<OverlayLayer>,
    previous_plane_state: Vec<DisplayPlaneState>,
    surfaces_not_inuse: Vec<Arc<NativeSurface>>,
    mark_not_inuse: Vec<Arc<NativeSurface>>,
    kms_fence: Option<Fence>,
    last_commit_failed_update: bool,
    handle_display_initializations: bool,
    span: tracing::Span,
}

impl<D, P, C, V, R> DisplayQueue<D, P, C, V, R>
where
    D: DisplaySink,
    P: PlaneManager,
    C: CompositionBackend,
    V: VblankSource,
    R: FramebufferExporter,
{
    /// Create the queue for one display pipe.
    ///
    /// `disable_overlay` restricts the pipe to GPU composition on the primary
    /// plane from the start.
    pub fn new(
        display: D,
        plane_manager: P,
        compositor: C,
        vblank: V,
        exporter: R,
        disable_overlay: bool,
    ) -> DisplayQueue<D, P, C, V, R> {
        let mut flags = QueueFlags::NEEDS_COLOR_CORRECTION;
        if disable_overlay {
            flags |= QueueFlags::DISABLE_OVERLAY_USAGE;
        }

        DisplayQueue {
            display,
            plane_manager,
            compositor: Mutex::new(compositor),
            vblank: Mutex::new(vblank),
            exporter,
            shared: Arc::new(SharedState {
                flags: AtomicQueueFlags::new(flags),
                idle: Arc::new(Mutex::new(FrameStateTracker::default())),
                power_mode_lock: Mutex::new(()),
            }),
            video: Mutex::new(VideoState::default()),
            color: Mutex::new(ColorState::default()),
            scaling: ScalingTracker::default(),
            plane_transform: HwcTransform::empty(),
            in_flight_layers: Vec::new(),
            previous_plane_state: Vec::new(),
            surfaces_not_inuse: Vec::new(),
            mark_not_inuse: Vec::new(),
            kms_fence: None,
            last_commit_failed_update: false,
            handle_display_initializations: true,
            span: info_span!("display_queue"),
        }
    }

    /// Bind the queue to a pipe and bring up its collaborators
    pub fn initialize(
        &mut self,
        pipe: u32,
        width: u32,
        height: u32,
    ) -> Result<(), InitError<P::Error, V::Error>> {
        let _span = self.span.clone();
        let _guard = _span.enter();
        self.plane_manager
            .initialize(width, height)
            .map_err(InitError::PlaneManager)?;
        self.plane_manager.set_display_transform(self.plane_transform);
        self.reset_queue();
        let mut vblank = self.vblank.lock().unwrap();
        vblank.set_power_mode(PowerMode::Off);
        vblank.init(pipe).map_err(InitError::Vblank)?;
        Ok(())
    }

    /// Handle for the vblank thread to drive idle detection
    pub fn idle_state_handle(&self) -> IdleStateHandle {
        IdleStateHandle {
            shared: self.shared.clone(),
        }
    }

    /// Switch the display power state
    pub fn set_power_mode(&mut self, mode: PowerMode) {
        let _span = self.span.clone();
        let _guard = _span.enter();
        match mode {
            PowerMode::Off | PowerMode::Doze => self.handle_exit(),
            PowerMode::DozeSuspend => {
                self.vblank.lock().unwrap().set_power_mode(PowerMode::DozeSuspend);
                self.shared.flags.set(QueueFlags::POWERED_ON);
            }
            PowerMode::On => {
                self.shared.flags.set(
                    QueueFlags::POWERED_ON
                        | QueueFlags::CONFIGURATION_CHANGED
                        | QueueFlags::NEEDS_COLOR_CORRECTION,
                );
                self.vblank.lock().unwrap().set_power_mode(PowerMode::On);
                let _power = self.shared.power_mode_lock.lock().unwrap();
                self.shared.flags.clear(QueueFlags::IGNORE_IDLE_REFRESH);
                if let Err(err) = self.compositor.lock().unwrap().init() {
                    warn!("failed to initialize the composition backend: {err}");
                }
            }
        }
    }

    /// Rotate the whole display output
    pub fn rotate_display(&mut self, rotation: HwcRotation) {
        match rotation {
            HwcRotation::Rotate90 => self.plane_transform |= HwcTransform::ROTATE_90,
            HwcRotation::Rotate180 => self.plane_transform |= HwcTransform::ROTATE_180,
            HwcRotation::Rotate270 => self.plane_transform |= HwcTransform::ROTATE_270,
            HwcRotation::None => {}
        }

        self.plane_manager.set_display_transform(self.plane_transform);
    }

    /// Mirror or un-mirror this pipe from the primary display.
    ///
    /// A cloned pipe stops delivering vblanks and retire fences.
    pub fn set_clone_mode(&self, cloned: bool) {
        if cloned {
            if !self.shared.flags.contains(QueueFlags::CLONED_MODE) {
                self.shared.flags.set(QueueFlags::CLONED_MODE);
                self.vblank.lock().unwrap().set_power_mode(PowerMode::Off);
            }
        } else if self.shared.flags.contains(QueueFlags::CLONED_MODE) {
            self.shared.flags.clear(QueueFlags::CLONED_MODE);
            self.shared.flags.set(QueueFlags::CONFIGURATION_CHANGED);
            self.vblank.lock().unwrap().set_power_mode(PowerMode::On);
        }
    }

    /// Drop all incoming frames until [`force_refresh`](Self::force_refresh)
    pub fn ignore_updates(&self) {
        let mut tracker = self.shared.idle.lock().unwrap();
        tracker.idle_frames = 0;
        tracker.state = TrackerFlags::IGNORE_UPDATES;
        tracker.revalidate_frames_counter = 0;
    }

    /// Ask the frame producer for a refresh frame and force a full validation
    pub fn force_refresh(&self) {
        self.shared.force_refresh();
    }

    /// Advance idle detection by one vblank tick
    pub fn handle_idle_case(&self) {
        self.shared.handle_idle_case();
    }

    /// Request a modeset with the next frame
    pub fn display_configuration_changed(&self) {
        self.shared.flags.set(QueueFlags::CONFIGURATION_CHANGED);
    }

    /// Track the scaling between the primary mode and this display's mode
    pub fn update_scaling_ratio(
        &mut self,
        primary_width: u32,
        primary_height: u32,
        display_width: u32,
        display_height: u32,
    ) {
        self.scaling.active = false;
        let primary_area = primary_width * primary_height;
        let display_area = display_width * display_height;
        if primary_area != display_area {
            self.scaling.active = true;
            self.scaling.width_ratio =
                (display_width as f32 - primary_width as f32) / primary_width as f32;
            self.scaling.height_ratio =
                (display_height as f32 - primary_height as f32) / primary_height as f32;
        }

        self.shared.flags.set(QueueFlags::CONFIGURATION_CHANGED);
    }

    /// Whether any plane of this pipe supports the format
    pub fn check_plane_format(&self, format: drm_fourcc::DrmFourcc) -> bool {
        self.plane_manager.check_plane_format(format)
    }

    /// Disabling explicit sync also disables overlay usage
    pub fn set_explicit_sync_support(&self, disable_explicit_sync: bool) {
        if disable_explicit_sync {
            self.shared.flags.set(QueueFlags::DISABLE_OVERLAY_USAGE);
        } else {
            self.shared.flags.clear(QueueFlags::DISABLE_OVERLAY_USAGE);
        }
    }

    /// Set per-channel gamma exponents
    pub fn set_gamma(&self, red: f32, green: f32, blue: f32) {
        self.color.lock().unwrap().gamma = Gamma { red, green, blue };
        self.shared.flags.set(QueueFlags::NEEDS_COLOR_CORRECTION);
    }

    /// Set per-channel contrast; only the low byte of each channel is used
    pub fn set_contrast(&self, red: u32, green: u32, blue: u32) {
        self.color.lock().unwrap().contrast = pack_rgb(red, green, blue);
        self.shared.flags.set(QueueFlags::NEEDS_COLOR_CORRECTION);
    }

    /// Set per-channel brightness; only the low byte of each channel is used
    pub fn set_brightness(&self, red: u32, green: u32, blue: u32) {
        self.color.lock().unwrap().brightness = pack_rgb(red, green, blue);
        self.shared.flags.set(QueueFlags::NEEDS_COLOR_CORRECTION);
    }

    /// Set the color transform matrix applied by the pipe
    pub fn set_color_transform(&self, matrix: &[f32; 16], hint: ColorTransformHint) {
        let mut color = self.color.lock().unwrap();
        color.hint = hint;
        if hint == ColorTransformHint::ArbitraryMatrix {
            color.matrix = *matrix;
        }
        drop(color);
        self.shared.flags.set(QueueFlags::NEEDS_COLOR_CORRECTION);
    }

    /// Select how video layers are scaled.
    ///
    /// Scaling is consumed by the composition backend internally and does not
    /// force a media recomposition on its own.
    pub fn set_video_scaling_mode(&self, mode: u32) {
        let _video = self.video.lock().unwrap();
        self.compositor.lock().unwrap().set_video_scaling_mode(mode);
    }

    /// Adjust a video color property
    pub fn set_video_color(&self, control: VideoColorControl, value: f32) {
        let mut video = self.video.lock().unwrap();
        video.requested_effect = true;
        self.compositor.lock().unwrap().set_video_color(control, value);
    }

    /// Read back a video color property and its range
    pub fn video_color(&self, control: VideoColorControl) -> VideoColorRange {
        self.compositor.lock().unwrap().video_color(control)
    }

    /// Reset a video color property to its default
    pub fn restore_video_default_color(&self, control: VideoColorControl) {
        let mut video = self.video.lock().unwrap();
        video.requested_effect = false;
        self.compositor.lock().unwrap().restore_video_default_color(control);
    }

    /// Configure the deinterlacer for video layers
    pub fn set_video_deinterlace(&self, flag: DeinterlaceFlag, mode: DeinterlaceMode) {
        let mut video = self.video.lock().unwrap();
        video.requested_effect = true;
        self.compositor.lock().unwrap().set_video_deinterlace(flag, mode);
    }

    /// Disable deinterlacing again
    pub fn restore_video_default_deinterlace(&self) {
        let mut video = self.video.lock().unwrap();
        video.requested_effect = false;
        self.compositor.lock().unwrap().restore_video_default_deinterlace();
    }

    /// Register the callback invoked on every vblank
    pub fn register_vsync_callback(&self, callback: VsyncCallback, display_id: u32) -> i32 {
        self.vblank.lock().unwrap().register_callback(callback, display_id)
    }

    /// Register the callback asking the frame producer for a refresh frame
    pub fn register_refresh_callback(&self, callback: RefreshCallback, display_id: u32) {
        let mut tracker = self.shared.idle.lock().unwrap();
        tracker.refresh_callback = Some(callback);
        tracker.refresh_display_id = display_id;
    }

    /// Enable or disable vsync callback delivery
    pub fn vsync_control(&self, enabled: bool) {
        self.vblank.lock().unwrap().vsync_control(enabled);
    }

    /// Realize one frame on the display.
    ///
    /// `source_layers` is the z-ordered layer list for this frame; release
    /// fences are written back into it. Returns the retire fence of the commit,
    /// or `None` when the commit was skipped (unchanged frame, cloned pipe or
    /// ignored updates).
    #[profiling::function]
    pub fn queue_update(
        &mut self,
        source_layers: &mut [HwcLayer],
        idle_update: bool,
        handle_constraints: bool,
    ) -> Result<Option<Fence>, FrameError<C::Error, D::Error>> {
        let _span = self.span.clone();
        let _guard = _span.enter();
        let tracker = ScopedIdleStateTracker::new(self.shared.idle.clone());
        if tracker.ignore_update() {
            return Ok(None);
        }

        let previous_size = self.in_flight_layers.len();
        let mut layers: Vec<OverlayLayer> = Vec::with_capacity(source_layers.len());
        let mut remove_index: Option<usize> = None;
        let mut add_index: Option<usize> = None;
        // If the last commit failed our cached state may be arbitrarily wrong.
        let mut idle_frame = tracker.render_idle_mode() || idle_update;
        let mut validate_layers = self.last_commit_failed_update || self.previous_plane_state.is_empty();
        let mut z_order = 0usize;
        let mut has_video_layer = false;
        let mut re_validate_commit = false;
        let mut handle_raw_pixel_update = false;
        let mut content_changed = false;
        let display_height = self.plane_manager.height();

        for layer_index in 0..source_layers.len() {
            source_layers[layer_index].set_release_fence(None);
            if !source_layers[layer_index].is_visible() {
                continue;
            }

            let previous_layer = if previous_size > z_order {
                Some(&self.in_flight_layers[z_order])
            } else {
                if add_index.is_none() {
                    add_index = Some(z_order);
                }
                None
            };

            let overlay_layer = if self.scaling.active {
                let display_frame = scale_display_frame(
                    source_layers[layer_index].display_frame(),
                    self.scaling.width_ratio,
                    self.scaling.height_ratio,
                );
                OverlayLayer::from_scaled_hwc_layer(
                    &mut source_layers[layer_index],
                    previous_layer,
                    z_order,
                    layer_index,
                    display_frame,
                    display_height,
                    self.plane_transform,
                    handle_constraints,
                )
            } else {
                OverlayLayer::from_hwc_layer(
                    &mut source_layers[layer_index],
                    previous_layer,
                    z_order,
                    layer_index,
                    display_height,
                    self.plane_transform,
                    handle_constraints,
                )
            };

            if !overlay_layer.is_visible() {
                continue;
            }

            if overlay_layer.raw_pixel_data_changed() {
                handle_raw_pixel_update = true;
            }

            if overlay_layer.is_video_layer() {
                has_video_layer = true;
            }

            if overlay_layer.needs_revalidation() {
                re_validate_commit = true;
            } else if overlay_layer.has_content_changed() {
                idle_frame = false;
                content_changed = true;
            }

            if overlay_layer.is_cursor_layer() {
                tracker.frame_has_cursor();
            }

            let z = z_order;
            z_order += 1;

            if add_index == Some(0)
                || validate_layers
                || (add_index.is_some() && remove_index.is_some())
            {
                layers.push(overlay_layer);
                continue;
            }

            // A cursor or video layer appearing, disappearing or changing its
            // z-order invalidates the cached suffix from that z on.
            if let Some(previous) = previous_layer {
                if previous.is_cursor_layer() != overlay_layer.is_cursor_layer()
                    || previous.is_video_layer() != overlay_layer.is_video_layer()
                {
                    if remove_index.is_none() {
                        remove_index = Some(previous.z_order());
                    }
                    if add_index.is_none() {
                        add_index = Some(z);
                    }
                }
            }

            layers.push(overlay_layer);
        }

        if handle_raw_pixel_update {
            self.compositor.lock().unwrap().update_layer_pixel_data(&layers);
        }

        // Invisible layers were skipped above.
        let size = layers.len();
        if add_index == Some(0) || validate_layers {
            // The whole stack is new; incremental validation has nothing to
            // build on.
            validate_layers = true;
        } else if previous_size > size {
            match (remove_index, add_index) {
                (None, _) => remove_index = Some(size),
                (Some(remove), Some(add)) => remove_index = Some(remove.min(add)),
                (Some(_), None) => {}
            }
        }

        if idle_frame && (add_index.is_some() || remove_index.is_some() || re_validate_commit) {
            idle_frame = false;
        }

        if !validate_layers {
            validate_layers = idle_frame;
        }

        if add_index.is_some() || remove_index.is_some() || re_validate_commit || content_changed {
            tracker.mark_content_changed();
        }

        let mut current_composition_planes: Vec<DisplayPlaneState> = Vec::new();
        let mut render_layers = false;
        let mut force_media_composition = false;
        let mut requested_video_effect = false;
        if has_video_layer {
            let mut video = self.video.lock().unwrap();
            if video.requested_effect != video.applied_effect {
                // Media planes must pick up the new effect state.
                force_media_composition = true;
                video.applied_effect = video.requested_effect;
                requested_video_effect = video.requested_effect;
                idle_frame = false;
                validate_layers = true;
            }
        }

        let disable_overlays = self.shared.flags.contains(QueueFlags::DISABLE_OVERLAY_USAGE);
        if !validate_layers && tracker.revalidate_layers() {
            validate_layers = true;
        }

        tracker.set_frame_idle(idle_frame);

        if !validate_layers {
            let mut needs_plane_validation = false;
            let cached =
                self.get_cached_layers(&layers, remove_index, &mut current_composition_planes);
            render_layers = cached.render_layers;
            let mut can_ignore_commit = cached.can_ignore_commit;
            needs_plane_validation |= cached.needs_plane_validation;
            if cached.force_full_validation {
                validate_layers = true;
                current_composition_planes.clear();
            }

            if !validate_layers {
                if let Some(add) = add_index.filter(|&add| add > 0) {
                    let outcome = self.plane_manager.validate_layers(
                        &layers,
                        add,
                        disable_overlays,
                        &mut current_composition_planes,
                        &self.previous_plane_state,
                        &mut self.surfaces_not_inuse,
                    );
                    if !render_layers {
                        render_layers = outcome.needs_render;
                    }
                    can_ignore_commit = false;
                    if outcome.commit_checked {
                        re_validate_commit = false;
                    }
                    needs_plane_validation |= outcome.needs_plane_validation;
                }
            }

            if !validate_layers && (re_validate_commit || needs_plane_validation) {
                let outcome = self.plane_manager.revalidate_planes(
                    &mut current_composition_planes,
                    &layers,
                    &mut self.surfaces_not_inuse,
                    needs_plane_validation,
                    re_validate_commit,
                );
                can_ignore_commit = false;
                if outcome.request_full_validation {
                    validate_layers = true;
                    current_composition_planes.clear();
                }
                if !render_layers {
                    render_layers = outcome.needs_render;
                }
            }

            if !validate_layers {
                if force_media_composition {
                    self.set_media_effects_state(
                        requested_video_effect,
                        &layers,
                        &mut current_composition_planes,
                    );
                    render_layers = true;
                    can_ignore_commit = false;
                }

                if can_ignore_commit {
                    trace!("frame unchanged, skipping commit");
                    self.in_flight_layers = layers;
                    tracker.set_plane_count(self.previous_plane_state.len());
                    return Ok(None);
                }
            }
        }

        self.last_commit_failed_update = false;

        if validate_layers {
            if !idle_frame {
                tracker.reset_tracker_state();
            }

            // Full re-validation of the whole stack.
            current_composition_planes.clear();
            let force_gpu = disable_overlays
                || idle_frame
                || (self.shared.flags.contains(QueueFlags::CONFIGURATION_CHANGED) && layers.len() > 1);
            let outcome = self.plane_manager.validate_layers(
                &layers,
                0,
                force_gpu,
                &mut current_composition_planes,
                &self.previous_plane_state,
                &mut self.surfaces_not_inuse,
            );
            render_layers = outcome.needs_render;
            // Media effects still have to reach the video planes of the
            // rebuilt composition.
            if force_media_composition && requested_video_effect {
                self.set_media_effects_state(
                    requested_video_effect,
                    &layers,
                    &mut current_composition_planes,
                );
                render_layers = true;
            }
            self.shared.flags.clear(QueueFlags::CONFIGURATION_CHANGED);
        }

        if render_layers {
            let mut compositor = self.compositor.lock().unwrap();
            if let Err(err) = compositor.begin_frame(disable_overlays) {
                drop(compositor);
                self.last_commit_failed_update = true;
                return Err(FrameError::Composition(err));
            }

            let layer_rects: Vec<Rectangle<i32, Physical>> =
                layers.iter().map(|layer| layer.display_frame()).collect();
            if let Err(err) = compositor.draw(&mut current_composition_planes, &layers, &layer_rects) {
                drop(compositor);
                self.last_commit_failed_update = true;
                return Err(FrameError::Composition(err));
            }
        } else if handle_raw_pixel_update {
            self.compositor.lock().unwrap().ensure_pixel_data_updated();
        }

        #[cfg(not(feature = "double-buffering"))]
        if let Some(fence) = self.kms_fence.take() {
            if let Err(err) = fence.wait(-1) {
                warn!("wait on the previous commit fence failed: {err}");
            }
        }

        if self.shared.flags.contains(QueueFlags::NEEDS_COLOR_CORRECTION) {
            let color = self.color.lock().unwrap();
            self.display
                .set_color_correction(color.gamma, color.contrast, color.brightness);
            self.display.set_color_transform(&color.matrix, color.hint);
            drop(color);
            self.shared.flags.clear(QueueFlags::NEEDS_COLOR_CORRECTION);
        }

        let commit_fence = match self.display.commit(
            &current_composition_planes,
            &self.previous_plane_state,
            &layers,
            disable_overlays,
        ) {
            Ok(fence) => fence,
            Err(err) => {
                debug!("commit rejected, forcing full validation next frame");
                self.last_commit_failed_update = true;
                return Err(FrameError::Commit(err));
            }
        };

        // Surfaces queued last frame were still on screen until this commit.
        for surface in self.mark_not_inuse.drain(..) {
            surface.set_age(-1);
        }

        self.in_flight_layers = layers;
        std::mem::swap(&mut self.previous_plane_state, &mut current_composition_planes);
        drop(current_composition_planes);

        self.update_on_screen_surfaces();

        // Age out surfaces detached from their planes; an expired age queues
        // the surface for release right after the next commit.
        let mut still_aging = Vec::new();
        for surface in self.surfaces_not_inuse.drain(..) {
            let age = surface.age();
            if age > 0 {
                surface.set_age(age - 1);
                still_aging.push(surface);
            } else {
                self.mark_not_inuse.push(surface);
            }
        }
        self.surfaces_not_inuse = still_aging;

        if idle_frame {
            self.release_surfaces();
            self.shared.flags.set(QueueFlags::LAST_FRAME_IDLE_UPDATE);
            if self.shared.flags.contains(QueueFlags::CLONED_MODE) {
                self.shared
                    .idle
                    .lock()
                    .unwrap()
                    .state
                    .insert(TrackerFlags::RENDER_IDLE_DISPLAY);
            }
        } else {
            self.shared.flags.clear(QueueFlags::LAST_FRAME_IDLE_UPDATE);
            self.release_surfaces_as_needed(validate_layers);
        }

        let mut retire_fence = None;
        if let Some(fence) = commit_fence {
            if !self.shared.flags.contains(QueueFlags::CLONED_MODE) {
                match fence.dup() {
                    Ok(dup) => retire_fence = Some(dup),
                    Err(err) => warn!("failed to duplicate the retire fence: {err}"),
                }
            }

            self.set_release_fence_to_layers(&fence, source_layers);
            self.kms_fence = Some(fence);
        }

        #[cfg(feature = "double-buffering")]
        if let Some(fence) = self.kms_fence.take() {
            if let Err(err) = fence.wait(-1) {
                warn!("wait on the commit fence failed: {err}");
            }
        }

        if self.handle_display_initializations {
            self.handle_display_initializations = false;
            self.display.handle_lazy_initialization();
        }

        tracker.set_plane_count(self.previous_plane_state.len());
        Ok(retire_fence)
    }

    /// Patch the previous frame's plane assignment for the new layer stack.
    fn get_cached_layers(
        &mut self,
        layers: &[OverlayLayer],
        remove_index: Option<usize>,
        composition: &mut Vec<DisplayPlaneState>,
    ) -> CachedFrame {
        let mut needs_gpu_composition = false;
        let mut ignore_commit = true;
        let mut check_to_squash = false;
        let mut plane_validation = false;
        // A scan-out plane whose buffer or geometry changed invalidates the
        // composition regions cached for the planes after it.
        let mut reset_composition_regions = false;

        for previous_plane in &self.previous_plane_state {
            let mut clear_surface = false;
            let mut last_plane = previous_plane.clone_for_frame();

            if let Some(threshold) = remove_index {
                let last_layer = last_plane.source_layers().last().copied().unwrap_or(0);
                if last_layer >= threshold {
                    let has_one_layer = last_plane.source_layers().len() == 1;
                    if !has_one_layer {
                        last_plane.reset_layers(layers, threshold);
                        clear_surface = true;
                    }

                    // The new layer combination may use the scalers
                    // differently; never skip this commit.
                    ignore_commit = false;

                    if last_plane.source_layers().is_empty() || has_one_layer {
                        self.plane_manager.mark_surfaces_for_recycling(
                            &mut last_plane,
                            &mut self.surfaces_not_inuse,
                            false,
                        );

                        // On some platforms disabling the primary plane
                        // disables the whole pipe; re-validate so it keeps a
                        // buffer.
                        let primary = self
                            .previous_plane_state
                            .first()
                            .map(|state| Arc::ptr_eq(state.plane(), last_plane.plane()))
                            .unwrap_or(false);
                        if primary {
                            trace!("primary plane left empty, forcing full validation");
                            return CachedFrame {
                                render_layers: false,
                                can_ignore_commit: false,
                                needs_plane_validation: false,
                                force_full_validation: true,
                            };
                        }

                        last_plane.plane().set_in_use(false);
                        continue;
                    }

                    last_plane.validate_revalidation();
                    if last_plane.revalidation_type().contains(Revalidation::SCANOUT) {
                        let layer = &layers[last_plane.source_layers()[0]];
                        // Supported and actual composition differ for this
                        // layer; let the plane manager take another look.
                        if layer.can_scan_out() && last_plane.needs_offscreen_composition() {
                            plane_validation = true;
                        } else if last_plane.source_layers().len() == 1 {
                            check_to_squash = true;
                            last_plane.revalidation_done(Revalidation::SCANOUT);
                        }
                    }
                }
            }

            if last_plane.needs_offscreen_composition() {
                let mut surface_damage: Rectangle<i32, Physical> = Rectangle::zero();
                let mut update_rect = false;
                let mut update_source_rect = false;
                let full_reset = clear_surface || reset_composition_regions;
                let mut damage_initialized = false;
                let mut refresh_surfaces = reset_composition_regions;

                if !clear_surface {
                    for i in 0..last_plane.source_layers().len() {
                        let source_index = last_plane.source_layers()[i];
                        let layer = &layers[source_index];
                        if layer.has_dimensions_changed() {
                            last_plane
                                .update_display_frame(layer.display_frame(), layer.needs_full_draw());
                            update_rect = true;
                        }

                        if layer.has_source_rect_changed() {
                            last_plane.update_source_crop(layer.source_crop(), layer.needs_full_draw());
                            update_source_rect = true;
                        }

                        if full_reset || refresh_surfaces {
                            continue;
                        }

                        refresh_surfaces = layer.needs_full_draw();
                        if layer.has_content_changed() {
                            if damage_initialized {
                                surface_damage = surface_damage.merge(layer.surface_damage());
                            } else {
                                surface_damage = layer.surface_damage();
                                damage_initialized = true;
                            }
                        }
                    }
                }

                if update_rect || update_source_rect || clear_surface {
                    last_plane.validate_revalidation();
                    if !last_plane.revalidation_type().is_empty() {
                        plane_validation = true;
                    }
                }

                if full_reset || !surface_damage.is_empty() || update_rect || update_source_rect
                    || refresh_surfaces
                {
                    if last_plane.needs_surface_allocation() {
                        self.plane_manager.set_offscreen_plane_target(&mut last_plane);
                    } else if full_reset || refresh_surfaces {
                        last_plane.refresh_surfaces(SurfaceClear::Full, refresh_surfaces);
                    } else if update_rect || update_source_rect {
                        last_plane.update_damage(surface_damage);
                    } else if !surface_damage.is_empty() {
                        last_plane.update_damage(surface_damage);
                    }
                }

                if !needs_gpu_composition {
                    needs_gpu_composition = !last_plane.surface_recycled();
                }

                reset_composition_regions = false;
            } else {
                reset_composition_regions = false;
                let source_index = last_plane.source_layers()[0];
                let layer = &layers[source_index];
                if layer.buffer().framebuffer().is_none() {
                    match layer.buffer().ensure_framebuffer(&self.exporter) {
                        Ok(_) => reset_composition_regions = true,
                        Err(err) => {
                            // Without a framebuffer the plane cannot scan out;
                            // the whole commit has to be re-validated.
                            warn!("framebuffer creation failed: {err}");
                            return CachedFrame {
                                render_layers: false,
                                can_ignore_commit: false,
                                needs_plane_validation: false,
                                force_full_validation: true,
                            };
                        }
                    }
                }

                last_plane.set_scanout_layer(source_index);
                if layer.has_content_changed() {
                    ignore_commit = false;
                }

                if layer.has_dimensions_changed() || layer.needs_revalidation() || layer.needs_full_draw()
                {
                    ignore_commit = false;
                    reset_composition_regions = true;
                }
            }

            composition.push(last_plane);
        }

        if needs_gpu_composition {
            ignore_commit = false;
        }

        // Merge a scan-out capable tail overlay down into the plane before it
        // to free a plane slot.
        if check_to_squash {
            let mut size = composition.len();
            if composition.last().map(|p| p.is_cursor_plane()).unwrap_or(false) {
                // The cursor plane never squashes.
                size -= 1;
            }

            if size > 2 {
                let source_layers = composition[size - 1].source_layers().to_vec();
                if composition[size - 2].can_squash()
                    && composition[size - 1].can_squash()
                    && source_layers.len() == 1
                {
                    trace!(
                        layer = source_layers[0],
                        "squashing tail overlay into the plane below"
                    );
                    let mut last_overlay = composition.remove(size - 1);
                    let target = &mut composition[size - 2];
                    target.add_layer(&layers[source_layers[0]]);
                    self.plane_manager.set_offscreen_plane_target(target);

                    if !last_overlay.surfaces().is_empty() {
                        self.plane_manager.mark_surfaces_for_recycling(
                            &mut last_overlay,
                            &mut self.surfaces_not_inuse,
                            false,
                        );
                    }

                    last_overlay.plane().set_in_use(false);
                    needs_gpu_composition = true;
                    ignore_commit = false;
                }
            }
        }

        CachedFrame {
            render_layers: needs_gpu_composition,
            can_ignore_commit: ignore_commit,
            needs_plane_validation: plane_validation,
            force_full_validation: false,
        }
    }

    /// Toggle video post-processing on every video plane of the composition.
    fn set_media_effects_state(
        &mut self,
        apply_effects: bool,
        layers: &[OverlayLayer],
        composition: &mut Vec<DisplayPlaneState>,
    ) {
        for plane in composition.iter_mut() {
            if !plane.is_video_plane() {
                continue;
            }

            plane.set_apply_effects(apply_effects);
            if apply_effects {
                // The plane may have been scanning out directly; effects need
                // an off-screen target to render into.
                if plane.surfaces().is_empty() {
                    plane.mark_offscreen();
                    self.plane_manager.set_offscreen_plane_target(plane);
                }
            } else if !plane.surfaces().is_empty() {
                let source_index = plane.source_layers()[0];
                if layers[source_index].can_scan_out() {
                    // Effects are off and the video buffer can go back onto
                    // the plane directly.
                    self.plane_manager.mark_surfaces_for_recycling(
                        plane,
                        &mut self.surfaces_not_inuse,
                        false,
                    );
                    plane.set_scanout_layer(source_index);
                }
            }
        }
    }

    /// Rotate the surface ages of every composed plane after a commit.
    fn update_on_screen_surfaces(&mut self) {
        for plane_state in &self.previous_plane_state {
            if plane_state.surfaces().is_empty() {
                continue;
            }
            plane_state.update_surface_ages();
        }
    }

    /// Hand release fences back to the client layers of the committed frame.
    fn set_release_fence_to_layers(&mut self, fence: &Fence, source_layers: &mut [HwcLayer]) {
        for plane in &self.previous_plane_state {
            let indices = plane.source_layers();
            if plane.scanout() && !plane.surface_recycled() {
                for &index in indices {
                    let overlay_layer = &mut self.in_flight_layers[index];
                    overlay_layer.set_composition(Composition::Display);
                    let layer = &mut source_layers[overlay_layer.layer_index()];
                    match fence.dup() {
                        Ok(dup) => layer.set_release_fence(Some(dup)),
                        Err(err) => warn!("failed to duplicate a release fence: {err}"),
                    }
                }
            } else {
                // The plane was composed; its layers are released once the GPU
                // is done reading them, which the surface's acquire fence
                // signals.
                let release_fence = plane
                    .offscreen_target()
                    .and_then(|surface| surface.take_acquire_fence());

                for &index in indices {
                    let overlay_layer = &mut self.in_flight_layers[index];
                    overlay_layer.set_composition(Composition::Gpu);
                    let layer_index = overlay_layer.layer_index();
                    if let Some(release) = release_fence.as_ref() {
                        match release.dup() {
                            Ok(dup) => source_layers[layer_index].set_release_fence(Some(dup)),
                            Err(err) => warn!("failed to duplicate a release fence: {err}"),
                        }
                    } else if let Some(own) = overlay_layer.take_acquire_fence() {
                        source_layers[layer_index].set_release_fence(Some(own));
                    }
                }
                // release_fence drops here, closing the source descriptor
            }
        }
    }

    fn release_surfaces(&mut self) {
        self.plane_manager.release_free_offscreen_targets();
        self.shared
            .flags
            .clear(QueueFlags::MARK_SURFACES_FOR_RELEASE | QueueFlags::RELEASE_SURFACES);
    }

    /// Two-phase surface release: a full validation marks surfaces, the
    /// following stable frame frees the ones that stayed unused.
    fn release_surfaces_as_needed(&mut self, layers_validated: bool) {
        let flags = self.shared.flags.snapshot();
        if !layers_validated && flags.contains(QueueFlags::RELEASE_SURFACES) {
            self.release_surfaces();
        }

        if self.shared.flags.contains(QueueFlags::MARK_SURFACES_FOR_RELEASE) {
            self.shared.flags.set(QueueFlags::RELEASE_SURFACES);
            self.shared.flags.clear(QueueFlags::MARK_SURFACES_FOR_RELEASE);
        }

        if layers_validated {
            self.shared.flags.set(QueueFlags::MARK_SURFACES_FOR_RELEASE);
            self.shared.flags.clear(QueueFlags::RELEASE_SURFACES);
        }
    }

    /// Tear the pipe down, keeping only the sticky configuration bits.
    pub fn handle_exit(&mut self) {
        let _span = self.span.clone();
        let _guard = _span.enter();
        debug!("tearing down display queue");
        {
            let _power = self.shared.power_mode_lock.lock().unwrap();
            self.shared.flags.set(QueueFlags::IGNORE_IDLE_REFRESH);
        }
        self.vblank.lock().unwrap().set_power_mode(PowerMode::Off);
        if !self.previous_plane_state.is_empty() {
            self.display.disable(&self.previous_plane_state);
        }

        self.kms_fence = None;

        let sticky = self.shared.flags.snapshot()
            & (QueueFlags::DISABLE_OVERLAY_USAGE | QueueFlags::CLONED_MODE);
        self.shared.flags.store(QueueFlags::CONFIGURATION_CHANGED | sticky);

        self.reset_queue();
    }

    fn reset_queue(&mut self) {
        self.video.lock().unwrap().applied_effect = false;
        self.last_commit_failed_update = false;
        self.in_flight_layers = Vec::new();
        self.previous_plane_state = Vec::new();
        self.mark_not_inuse = Vec::new();
        self.surfaces_not_inuse = Vec::new();
        if self.plane_manager.has_surfaces() {
            self.plane_manager.release_all_offscreen_targets();
        }

        self.exporter.purge_buffers();

        let mut tracker = self.shared.idle.lock().unwrap();
        let ignore_updates = tracker.state.contains(TrackerFlags::IGNORE_UPDATES);
        tracker.state = TrackerFlags::empty();
        tracker.idle_frames = 0;
        if ignore_updates {
            tracker.state |= TrackerFlags::IGNORE_UPDATES;
        }
        drop(tracker);

        self.compositor.lock().unwrap().reset();
    }
}

fn pack_rgb(red: u32, green: u32, blue: u32) -> u32 {
    ((red & 0xff) << 16) | ((green & 0xff) << 8) | (blue & 0xff)
}

fn scale_display_frame(
    frame: Rectangle<i32, Physical>,
    width_ratio: f32,
    height_ratio: f32,
) -> Rectangle<i32, Physical> {
    let left = frame.loc.x;
    let top = frame.loc.y;
    let right = frame.loc.x + frame.size.w;
    let bottom = frame.loc.y + frame.size.h;
    Rectangle::from_extents(
        (
            left + (left as f32 * width_ratio) as i32,
            top + (top as f32 * height_ratio) as i32,
        ),
        (
            right + (right as f32 * width_ratio) as i32,
            bottom + (bottom as f32 * height_ratio) as i32,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DrmBuffer, GraphicsBuffer};
    use crate::layer::LayerUsage;
    use crate::plane::{DisplayPlane, RevalidationOutcome, ValidationOutcome};
    use drm::control::{framebuffer, plane as kms_plane, PlaneType};
    use drm_fourcc::DrmFourcc;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[derive(Debug, thiserror::Error)]
    #[error("injected test failure")]
    struct TestError;

    fn test_fence() -> Fence {
        Fence::from_fd(rustix::event::eventfd(1, rustix::event::EventfdFlags::CLOEXEC).unwrap())
    }

    fn test_buffer() -> Arc<GraphicsBuffer> {
        Arc::new(GraphicsBuffer::Drm(DrmBuffer::new(
            1920,
            1080,
            DrmFourcc::Xrgb8888,
            [1920 * 4, 0, 0, 0],
            [0; 4],
            1,
            None,
        )))
    }

    fn layer_list(count: usize) -> Vec<HwcLayer> {
        (0..count).map(|_| HwcLayer::new(test_buffer())).collect()
    }

    #[derive(Debug, Default)]
    struct SinkCalls {
        commits: usize,
        fail_next_commit: bool,
        color_corrections: usize,
        disables: usize,
        lazy_inits: usize,
    }

    #[derive(Debug)]
    struct TestSink {
        calls: Arc<Mutex<SinkCalls>>,
    }

    impl DisplaySink for TestSink {
        type Error = TestError;

        fn commit(
            &mut self,
            _current: &[DisplayPlaneState],
            _previous: &[DisplayPlaneState],
            _layers: &[OverlayLayer],
            _disable_overlays: bool,
        ) -> Result<Option<Fence>, TestError> {
            let mut calls = self.calls.lock().unwrap();
            if calls.fail_next_commit {
                calls.fail_next_commit = false;
                return Err(TestError);
            }
            calls.commits += 1;
            Ok(Some(test_fence()))
        }

        fn disable(&mut self, _previous: &[DisplayPlaneState]) {
            self.calls.lock().unwrap().disables += 1;
        }

        fn set_color_correction(&mut self, _gamma: Gamma, _contrast: u32, _brightness: u32) {
            self.calls.lock().unwrap().color_corrections += 1;
        }

        fn set_color_transform(&mut self, _matrix: &[f32; 16], _hint: ColorTransformHint) {}

        fn handle_lazy_initialization(&mut self) {
            self.calls.lock().unwrap().lazy_inits += 1;
        }
    }

    #[derive(Debug, Default)]
    struct ManagerCalls {
        // (add_index, force_gpu) per validate_layers call
        validations: Vec<(usize, bool)>,
        revalidations: usize,
        recycled: usize,
        released_free: usize,
        released_all: usize,
    }

    #[derive(Debug)]
    struct TestPlaneManager {
        planes: Vec<Arc<DisplayPlane>>,
        available_planes: usize,
        pool: Vec<Arc<NativeSurface>>,
        next_fb: AtomicU32,
        calls: Arc<Mutex<ManagerCalls>>,
    }

    impl TestPlaneManager {
        fn new(available_planes: usize, calls: Arc<Mutex<ManagerCalls>>) -> TestPlaneManager {
            TestPlaneManager {
                planes: Vec::new(),
                available_planes,
                pool: Vec::new(),
                next_fb: AtomicU32::new(100),
                calls,
            }
        }

        // the real plane manager creates framebuffers while validating
        fn ensure_fb(&self, layer: &OverlayLayer) {
            if layer.buffer().framebuffer().is_none() {
                let id = self.next_fb.fetch_add(1, AtomicOrdering::SeqCst);
                match &**layer.buffer() {
                    GraphicsBuffer::Drm(buffer) => buffer
                        .set_framebuffer(framebuffer::Handle::from(NonZeroU32::new(id).unwrap())),
                }
            }
        }

        fn alloc_surfaces(&mut self, plane: &mut DisplayPlaneState) {
            plane.mark_offscreen();
            while plane.surfaces().len() < 3 {
                let surface = Arc::new(NativeSurface::new(test_buffer()));
                self.pool.push(surface.clone());
                plane.add_surface(surface);
            }
        }

        fn cursor_plane(&self) -> Option<Arc<DisplayPlane>> {
            self.planes
                .iter()
                .find(|plane| plane.plane_type() == PlaneType::Cursor)
                .cloned()
        }
    }

    impl PlaneManager for TestPlaneManager {
        type Error = TestError;

        fn initialize(&mut self, _width: u32, _height: u32) -> Result<(), TestError> {
            let mut id = 1u32;
            let mut planes = Vec::new();
            planes.push(Arc::new(DisplayPlane::new(
                kms_plane::Handle::from(NonZeroU32::new(id).unwrap()),
                PlaneType::Primary,
            )));
            for _ in 1..self.available_planes {
                id += 1;
                planes.push(Arc::new(DisplayPlane::new(
                    kms_plane::Handle::from(NonZeroU32::new(id).unwrap()),
                    PlaneType::Overlay,
                )));
            }
            id += 1;
            planes.push(Arc::new(DisplayPlane::new(
                kms_plane::Handle::from(NonZeroU32::new(id).unwrap()),
                PlaneType::Cursor,
            )));
            self.planes = planes;
            Ok(())
        }

        fn set_display_transform(&mut self, _transform: HwcTransform) {}

        fn validate_layers(
            &mut self,
            layers: &[OverlayLayer],
            add_index: usize,
            force_gpu: bool,
            composition: &mut Vec<DisplayPlaneState>,
            _previous: &[DisplayPlaneState],
            _surfaces_not_inuse: &mut Vec<Arc<NativeSurface>>,
        ) -> ValidationOutcome {
            self.calls.lock().unwrap().validations.push((add_index, force_gpu));
            let mut outcome = ValidationOutcome {
                commit_checked: true,
                ..Default::default()
            };

            if add_index == 0 {
                composition.clear();
            }
            if layers.is_empty() {
                return outcome;
            }

            if force_gpu {
                composition.clear();
                let mut state = DisplayPlaneState::new_scanout(self.planes[0].clone(), &layers[0]);
                for layer in &layers[1..] {
                    state.add_layer(layer);
                }
                self.alloc_surfaces(&mut state);
                composition.push(state);
                outcome.needs_render = true;
                return outcome;
            }

            for layer in &layers[add_index..] {
                if layer.is_cursor_layer() {
                    if let Some(cursor) = self.cursor_plane() {
                        self.ensure_fb(layer);
                        composition.push(DisplayPlaneState::new_scanout(cursor, layer));
                        continue;
                    }
                }

                let non_cursor_used = composition
                    .iter()
                    .filter(|state| !state.is_cursor_plane())
                    .count();
                let composed_tail = composition
                    .iter()
                    .rposition(|state| !state.is_cursor_plane())
                    .filter(|&index| composition[index].needs_offscreen_composition());

                if !layer.can_scan_out() {
                    if let Some(index) = composed_tail {
                        composition[index].add_layer(layer);
                        self.alloc_surfaces(&mut composition[index]);
                    } else if non_cursor_used < self.available_planes {
                        let mut state =
                            DisplayPlaneState::new_scanout(self.planes[non_cursor_used].clone(), layer);
                        self.alloc_surfaces(&mut state);
                        composition.push(state);
                    }
                    outcome.needs_render = true;
                } else if non_cursor_used < self.available_planes {
                    self.ensure_fb(layer);
                    composition.push(DisplayPlaneState::new_scanout(
                        self.planes[non_cursor_used].clone(),
                        layer,
                    ));
                } else if let Some(index) =
                    composition.iter().rposition(|state| !state.is_cursor_plane())
                {
                    composition[index].add_layer(layer);
                    self.alloc_surfaces(&mut composition[index]);
                    outcome.needs_render = true;
                }
            }

            outcome
        }

        fn revalidate_planes(
            &mut self,
            _composition: &mut Vec<DisplayPlaneState>,
            _layers: &[OverlayLayer],
            _surfaces_not_inuse: &mut Vec<Arc<NativeSurface>>,
            _needs_plane_validation: bool,
            _revalidate_commit: bool,
        ) -> RevalidationOutcome {
            self.calls.lock().unwrap().revalidations += 1;
            RevalidationOutcome::default()
        }

        fn set_offscreen_plane_target(&mut self, plane: &mut DisplayPlaneState) {
            self.alloc_surfaces(plane);
        }

        fn mark_surfaces_for_recycling(
            &mut self,
            plane: &mut DisplayPlaneState,
            surfaces_not_inuse: &mut Vec<Arc<NativeSurface>>,
            release_immediately: bool,
        ) {
            self.calls.lock().unwrap().recycled += 1;
            for surface in plane.take_surfaces() {
                surface.set_in_use(false);
                if !release_immediately {
                    surfaces_not_inuse.push(surface);
                }
            }
        }

        fn release_free_offscreen_targets(&mut self) {
            self.calls.lock().unwrap().released_free += 1;
            self.pool.retain(|surface| surface.in_use() || surface.age() >= 0);
        }

        fn release_all_offscreen_targets(&mut self) {
            self.calls.lock().unwrap().released_all += 1;
            self.pool.clear();
        }

        fn has_surfaces(&self) -> bool {
            !self.pool.is_empty()
        }

        fn height(&self) -> u32 {
            1080
        }

        fn check_plane_format(&self, format: DrmFourcc) -> bool {
            matches!(format, DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888)
        }
    }

    #[derive(Debug, Default)]
    struct CompositorCalls {
        inits: usize,
        resets: usize,
        begins: usize,
        draws: usize,
        fail_begin: bool,
        fail_draw: bool,
        pixel_updates: usize,
        video_color_sets: usize,
    }

    #[derive(Debug)]
    struct TestCompositor {
        calls: Arc<Mutex<CompositorCalls>>,
    }

    impl CompositionBackend for TestCompositor {
        type Error = TestError;

        fn init(&mut self) -> Result<(), TestError> {
            self.calls.lock().unwrap().inits += 1;
            Ok(())
        }

        fn reset(&mut self) {
            self.calls.lock().unwrap().resets += 1;
        }

        fn begin_frame(&mut self, _disable_overlays: bool) -> Result<(), TestError> {
            let mut calls = self.calls.lock().unwrap();
            if calls.fail_begin {
                calls.fail_begin = false;
                return Err(TestError);
            }
            calls.begins += 1;
            Ok(())
        }

        fn draw(
            &mut self,
            planes: &mut [DisplayPlaneState],
            _layers: &[OverlayLayer],
            _layer_rects: &[Rectangle<i32, Physical>],
        ) -> Result<(), TestError> {
            let mut calls = self.calls.lock().unwrap();
            if calls.fail_draw {
                calls.fail_draw = false;
                return Err(TestError);
            }
            calls.draws += 1;
            drop(calls);

            for plane in planes.iter_mut() {
                if plane.needs_offscreen_composition() && !plane.surface_recycled() {
                    if let Some(target) = plane.offscreen_target() {
                        target.set_acquire_fence(test_fence());
                        target.mark_painted();
                    }
                }
            }
            Ok(())
        }

        fn update_layer_pixel_data(&mut self, _layers: &[OverlayLayer]) {
            self.calls.lock().unwrap().pixel_updates += 1;
        }

        fn ensure_pixel_data_updated(&mut self) {}

        fn set_video_scaling_mode(&mut self, _mode: u32) {}

        fn set_video_color(&mut self, _control: VideoColorControl, _value: f32) {
            self.calls.lock().unwrap().video_color_sets += 1;
        }

        fn video_color(&self, _control: VideoColorControl) -> VideoColorRange {
            VideoColorRange {
                value: 0.5,
                min: 0.0,
                max: 1.0,
            }
        }

        fn restore_video_default_color(&mut self, _control: VideoColorControl) {}

        fn set_video_deinterlace(&mut self, _flag: DeinterlaceFlag, _mode: DeinterlaceMode) {}

        fn restore_video_default_deinterlace(&mut self) {}
    }

    #[derive(Debug, Default)]
    struct VblankCalls {
        power_modes: Vec<PowerMode>,
        inits: usize,
    }

    #[derive(Debug)]
    struct TestVblank {
        calls: Arc<Mutex<VblankCalls>>,
    }

    impl VblankSource for TestVblank {
        type Error = TestError;

        fn init(&mut self, _pipe: u32) -> Result<(), TestError> {
            self.calls.lock().unwrap().inits += 1;
            Ok(())
        }

        fn set_power_mode(&mut self, mode: PowerMode) {
            self.calls.lock().unwrap().power_modes.push(mode);
        }

        fn vsync_control(&mut self, _enabled: bool) {}

        fn register_callback(&mut self, _callback: VsyncCallback, _display_id: u32) -> i32 {
            0
        }
    }

    #[derive(Debug)]
    struct TestExporter {
        next_fb: AtomicU32,
        fail: Arc<Mutex<bool>>,
        purges: Arc<Mutex<usize>>,
    }

    impl FramebufferExporter for TestExporter {
        type Error = TestError;

        fn create_framebuffer(&self, _buffer: &DrmBuffer) -> Result<framebuffer::Handle, TestError> {
            if *self.fail.lock().unwrap() {
                return Err(TestError);
            }
            let id = self.next_fb.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(framebuffer::Handle::from(NonZeroU32::new(id).unwrap()))
        }

        fn purge_buffers(&mut self) {
            *self.purges.lock().unwrap() += 1;
        }
    }

    struct Harness {
        queue: DisplayQueue<TestSink, TestPlaneManager, TestCompositor, TestVblank, TestExporter>,
        sink: Arc<Mutex<SinkCalls>>,
        manager: Arc<Mutex<ManagerCalls>>,
        compositor: Arc<Mutex<CompositorCalls>>,
        vblank: Arc<Mutex<VblankCalls>>,
        exporter_fail: Arc<Mutex<bool>>,
    }

    fn harness_with(available_planes: usize, disable_overlay: bool) -> Harness {
        let sink = Arc::new(Mutex::new(SinkCalls::default()));
        let manager = Arc::new(Mutex::new(ManagerCalls::default()));
        let compositor = Arc::new(Mutex::new(CompositorCalls::default()));
        let vblank = Arc::new(Mutex::new(VblankCalls::default()));
        let exporter_fail = Arc::new(Mutex::new(false));

        let mut queue = DisplayQueue::new(
            TestSink { calls: sink.clone() },
            TestPlaneManager::new(available_planes, manager.clone()),
            TestCompositor {
                calls: compositor.clone(),
            },
            TestVblank {
                calls: vblank.clone(),
            },
            TestExporter {
                next_fb: AtomicU32::new(1),
                fail: exporter_fail.clone(),
                purges: Arc::new(Mutex::new(0)),
            },
            disable_overlay,
        );
        queue.initialize(0, 1920, 1080).unwrap();
        queue.set_power_mode(PowerMode::On);
        // power-on marks the configuration changed, which forces the first
        // multi-layer frame onto the GPU; clear it so tests start from a
        // settled pipe
        queue.shared.flags.clear(QueueFlags::CONFIGURATION_CHANGED);

        Harness {
            queue,
            sink,
            manager,
            compositor,
            vblank,
            exporter_fail,
        }
    }

    fn harness(available_planes: usize) -> Harness {
        harness_with(available_planes, false)
    }

    #[test]
    fn cold_start_single_layer_scans_out() {
        let mut h = harness(3);
        let mut layers = layer_list(1);

        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());

        assert_eq!(h.queue.previous_plane_state.len(), 1);
        assert!(h.queue.previous_plane_state[0].scanout());
        assert_eq!(h.queue.in_flight_layers.len(), 1);
        assert_eq!(h.sink.lock().unwrap().commits, 1);
        assert_eq!(h.sink.lock().unwrap().lazy_inits, 1);
        assert_eq!(h.compositor.lock().unwrap().draws, 0);
        assert_eq!(h.manager.lock().unwrap().validations, vec![(0, false)]);

        // the layer was scanned out and released against the commit fence
        assert!(layers[0].take_release_fence().is_some());
        assert_eq!(
            h.queue.in_flight_layers[0].composition(),
            Some(Composition::Display)
        );
    }

    #[test]
    fn unchanged_frame_skips_commit() {
        let mut h = harness(3);
        let mut layers = layer_list(1);

        h.queue.queue_update(&mut layers, false, false).unwrap();
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();

        assert!(retire.is_none());
        assert_eq!(h.sink.lock().unwrap().commits, 1);
        assert_eq!(h.queue.in_flight_layers.len(), 1);
        // no full validation happened for the unchanged frame
        assert_eq!(h.manager.lock().unwrap().validations.len(), 1);
    }

    #[test]
    fn added_cursor_appends_to_cached_planes() {
        let mut h = harness(3);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        let mut cursor = HwcLayer::new(test_buffer());
        cursor.set_usage(LayerUsage::Cursor);
        let mut layers = vec![layers.remove(0), cursor];
        h.queue.queue_update(&mut layers, false, false).unwrap();

        assert_eq!(h.queue.previous_plane_state.len(), 2);
        assert!(h.queue.previous_plane_state[1].is_cursor_plane());
        assert_eq!(h.compositor.lock().unwrap().draws, 0);
        // incremental validation of the added suffix only
        assert_eq!(
            h.manager.lock().unwrap().validations,
            vec![(0, false), (1, false)]
        );
        assert_eq!(h.sink.lock().unwrap().commits, 2);
    }

    #[test]
    fn removed_cursor_truncates_cached_planes() {
        let mut h = harness(3);
        let mut cursor = HwcLayer::new(test_buffer());
        cursor.set_usage(LayerUsage::Cursor);
        let mut layers = vec![HwcLayer::new(test_buffer()), cursor];
        h.queue.queue_update(&mut layers, false, false).unwrap();
        assert_eq!(h.queue.previous_plane_state.len(), 2);
        let cursor_plane = h.queue.previous_plane_state[1].plane().clone();

        let mut layers = vec![layers.remove(0)];
        h.queue.queue_update(&mut layers, false, false).unwrap();

        assert_eq!(h.queue.previous_plane_state.len(), 1);
        assert!(!h.queue.previous_plane_state[0].is_cursor_plane());
        assert!(!cursor_plane.in_use());
        assert_eq!(h.manager.lock().unwrap().recycled, 1);
        // dropping a plane can never skip the commit
        assert_eq!(h.sink.lock().unwrap().commits, 2);
    }

    #[test]
    fn damage_only_update_redraws_composed_plane() {
        let mut h = harness(2);
        let mut layers = layer_list(3);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        // three layers on two planes: the overlay composes layers 1 and 2
        assert_eq!(h.queue.previous_plane_state.len(), 2);
        assert!(h.queue.previous_plane_state[1].needs_offscreen_composition());
        assert_eq!(h.compositor.lock().unwrap().draws, 1);

        let damage = Rectangle::from_loc_and_size((100, 100), (100, 100));
        layers[1].set_buffer(test_buffer());
        layers[1].set_surface_damage(damage);
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());

        assert_eq!(h.compositor.lock().unwrap().draws, 2);
        assert_eq!(h.sink.lock().unwrap().commits, 2);
        assert_eq!(h.queue.previous_plane_state[1].surface_damage(), damage);
        // no re-validation was necessary
        assert_eq!(h.manager.lock().unwrap().validations.len(), 1);

        // the ring rotated; all three ages are present
        let mut ages: Vec<i32> = h.queue.previous_plane_state[1]
            .surfaces()
            .iter()
            .map(|s| s.age())
            .collect();
        ages.sort_unstable();
        assert_eq!(ages, vec![0, 1, 2]);
    }

    #[test]
    fn unchanged_composed_frame_skips_commit() {
        let mut h = harness(2);
        let mut layers = layer_list(3);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_none());
        assert_eq!(h.sink.lock().unwrap().commits, 1);
        assert_eq!(h.compositor.lock().unwrap().draws, 1);
    }

    #[test]
    fn commit_failure_forces_full_validation() {
        let mut h = harness(3);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        h.sink.lock().unwrap().fail_next_commit = true;
        layers[0].set_buffer(test_buffer());
        let result = h.queue.queue_update(&mut layers, false, false);
        assert!(matches!(result, Err(FrameError::Commit(_))));
        assert!(h.queue.last_commit_failed_update);
        // the cached state survived the failure
        assert_eq!(h.queue.previous_plane_state.len(), 1);

        // an unchanged follow-up frame still re-validates everything
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());
        assert_eq!(h.manager.lock().unwrap().validations.last(), Some(&(0, false)));
        assert!(!h.queue.last_commit_failed_update);
    }

    #[test]
    fn composition_failure_forces_full_validation() {
        let mut h = harness(1);
        let mut layers = layer_list(2);
        h.compositor.lock().unwrap().fail_begin = true;

        let result = h.queue.queue_update(&mut layers, false, false);
        assert!(matches!(result, Err(FrameError::Composition(_))));
        assert!(h.queue.last_commit_failed_update);
        assert_eq!(h.sink.lock().unwrap().commits, 0);

        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());
        assert_eq!(h.sink.lock().unwrap().commits, 1);
    }

    #[test]
    fn idle_refresh_fires_exactly_once() {
        let mut h = harness(3);
        let refreshes = Arc::new(Mutex::new(Vec::new()));
        let sink = refreshes.clone();
        h.queue.register_refresh_callback(
            Box::new(move |display_id| sink.lock().unwrap().push(display_id)),
            7,
        );

        let mut layers = layer_list(2);
        h.queue.queue_update(&mut layers, false, false).unwrap();
        assert_eq!(h.queue.previous_plane_state.len(), 2);

        let idle = h.queue.idle_state_handle();
        for _ in 0..IDLE_FRAME_THRESHOLD + 3 {
            idle.handle_idle_case();
        }

        assert_eq!(*refreshes.lock().unwrap(), vec![7]);
    }

    #[test]
    fn idle_frame_collapses_to_single_gpu_plane() {
        let mut h = harness(3);
        h.queue
            .register_refresh_callback(Box::new(|_display_id| {}), 0);
        let mut layers = layer_list(2);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        for _ in 0..IDLE_FRAME_THRESHOLD + 1 {
            h.queue.handle_idle_case();
        }

        // the refresh frame after the idle trigger composes everything on the
        // primary plane
        h.queue.queue_update(&mut layers, false, false).unwrap();
        assert_eq!(h.manager.lock().unwrap().validations.last(), Some(&(0, true)));
        assert_eq!(h.queue.previous_plane_state.len(), 1);
        assert!(h.queue.previous_plane_state[0].needs_offscreen_composition());
        assert!(h
            .queue
            .shared
            .flags
            .contains(QueueFlags::LAST_FRAME_IDLE_UPDATE));
        assert!(h.manager.lock().unwrap().released_free >= 1);
    }

    #[test]
    fn power_on_twice_is_idempotent() {
        let mut h = harness(3);
        h.queue.set_power_mode(PowerMode::On);
        let first = h.queue.shared.flags.snapshot();
        h.queue.set_power_mode(PowerMode::On);
        assert_eq!(h.queue.shared.flags.snapshot(), first);

        let power_modes = &h.vblank.lock().unwrap().power_modes;
        assert_eq!(
            power_modes.as_slice(),
            &[PowerMode::Off, PowerMode::On, PowerMode::On, PowerMode::On]
        );
    }

    #[test]
    fn force_refresh_triggers_full_validation() {
        let mut h = harness(3);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        h.queue.force_refresh();
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());
        assert_eq!(h.manager.lock().unwrap().validations.len(), 2);
        assert_eq!(h.manager.lock().unwrap().validations.last(), Some(&(0, false)));
    }

    #[test]
    fn handle_exit_preserves_sticky_bits() {
        let mut h = harness_with(3, true);
        h.queue.set_clone_mode(true);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        h.queue.set_power_mode(PowerMode::Off);

        let flags = h.queue.shared.flags.snapshot();
        assert!(flags.contains(QueueFlags::DISABLE_OVERLAY_USAGE));
        assert!(flags.contains(QueueFlags::CLONED_MODE));
        assert!(flags.contains(QueueFlags::CONFIGURATION_CHANGED));
        assert!(!flags.contains(QueueFlags::POWERED_ON));
        assert!(h.queue.previous_plane_state.is_empty());
        assert!(h.queue.kms_fence.is_none());
        assert_eq!(h.sink.lock().unwrap().disables, 1);
        assert!(h.compositor.lock().unwrap().resets >= 1);
    }

    #[test]
    fn gpu_composed_layers_get_surface_release_fences() {
        let mut h = harness(1);
        let mut layers = layer_list(2);
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());

        assert_eq!(h.compositor.lock().unwrap().draws, 1);
        for layer in &mut layers {
            assert!(layer.take_release_fence().is_some());
        }
        for overlay in &h.queue.in_flight_layers {
            assert_eq!(overlay.composition(), Some(Composition::Gpu));
        }
    }

    #[test]
    fn cloned_pipe_returns_no_retire_fence() {
        let mut h = harness(3);
        h.queue.set_clone_mode(true);
        let mut layers = layer_list(1);

        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_none());
        assert_eq!(h.sink.lock().unwrap().commits, 1);
        // the release fences are still threaded back
        assert!(layers[0].take_release_fence().is_some());
    }

    #[test]
    fn video_effect_toggle_forces_media_composition() {
        let mut h = harness(3);
        let mut video = HwcLayer::new(test_buffer());
        video.set_usage(LayerUsage::Video);
        let mut layers = vec![HwcLayer::new(test_buffer()), video];
        h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(h.queue.previous_plane_state[1].scanout());

        h.queue.set_video_color(VideoColorControl::Saturation, 0.8);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        let video_plane = &h.queue.previous_plane_state[1];
        assert!(video_plane.is_video_plane());
        assert!(video_plane.apply_effects());
        assert!(video_plane.needs_offscreen_composition());
        assert!(!video_plane.surfaces().is_empty());
        assert!(h.compositor.lock().unwrap().draws >= 1);

        // disabling the effect brings the plane back to direct scan-out
        h.queue.restore_video_default_color(VideoColorControl::Saturation);
        h.queue.queue_update(&mut layers, false, false).unwrap();
        let video_plane = &h.queue.previous_plane_state[1];
        assert!(video_plane.scanout());
        assert!(!video_plane.apply_effects());
    }

    #[test]
    fn scaling_ratio_scales_display_frames() {
        let mut h = harness(3);
        h.queue.update_scaling_ratio(1920, 1080, 3840, 2160);

        let mut layer = HwcLayer::new(test_buffer());
        layer.set_display_frame(Rectangle::from_loc_and_size((100, 50), (200, 100)));
        let mut layers = vec![layer];
        h.queue.queue_update(&mut layers, false, false).unwrap();

        assert_eq!(
            h.queue.in_flight_layers[0].display_frame(),
            Rectangle::from_extents((200, 100), (600, 300))
        );
    }

    #[test]
    fn ignored_updates_drop_frames_until_refresh() {
        let mut h = harness(3);
        h.queue.ignore_updates();
        let mut layers = layer_list(1);

        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_none());
        assert_eq!(h.sink.lock().unwrap().commits, 0);

        h.queue.force_refresh();
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());
        assert_eq!(h.sink.lock().unwrap().commits, 1);
    }

    #[test]
    fn empty_primary_plane_forces_full_validation() {
        let mut h = harness(3);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        // all layers gone: the primary plane would be left without a buffer
        let mut layers: Vec<HwcLayer> = Vec::new();
        h.queue.queue_update(&mut layers, false, false).unwrap();

        assert_eq!(h.manager.lock().unwrap().validations.last(), Some(&(0, false)));
        assert!(h.queue.previous_plane_state.is_empty());
    }

    #[test]
    fn framebuffer_creation_failure_forces_full_validation() {
        let mut h = harness(3);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        // a fresh buffer without a framebuffer, and an exporter that cannot
        // create one: the cached path has to bail out into a full validation
        *h.exporter_fail.lock().unwrap() = true;
        layers[0].set_buffer(test_buffer());
        let retire = h.queue.queue_update(&mut layers, false, false).unwrap();
        assert!(retire.is_some());
        assert_eq!(h.manager.lock().unwrap().validations.len(), 2);
        assert_eq!(h.manager.lock().unwrap().validations.last(), Some(&(0, false)));
    }

    #[test]
    fn tail_overlay_squashes_into_plane_below() {
        let mut h = harness(3);
        let mut layers = layer_list(2);
        let mut composed = HwcLayer::new(test_buffer());
        composed.set_raw_pixel_generation(1);
        layers.push(composed);
        let mut trailing = HwcLayer::new(test_buffer());
        trailing.set_raw_pixel_generation(1);
        layers.push(trailing);

        h.queue.queue_update(&mut layers, false, false).unwrap();
        // layers 2 and 3 were composed together on the third plane
        assert_eq!(h.queue.previous_plane_state.len(), 3);
        assert_eq!(h.queue.previous_plane_state[2].source_layers(), &[2, 3]);
        let tail_plane = h.queue.previous_plane_state[2].plane().clone();

        // dropping the trailing layer leaves a single composed layer on the
        // tail plane, which gets squashed into the overlay below
        layers.pop();
        h.queue.queue_update(&mut layers, false, false).unwrap();

        assert_eq!(h.queue.previous_plane_state.len(), 2);
        assert_eq!(h.queue.previous_plane_state[1].source_layers(), &[1, 2]);
        assert!(h.queue.previous_plane_state[1].needs_offscreen_composition());
        assert!(!tail_plane.in_use());
        assert!(!h.queue.surfaces_not_inuse.is_empty());
    }

    #[test]
    fn color_correction_is_programmed_with_the_next_commit() {
        let mut h = harness(3);
        let mut layers = layer_list(1);
        h.queue.queue_update(&mut layers, false, false).unwrap();
        assert_eq!(h.sink.lock().unwrap().color_corrections, 1);

        h.queue.set_gamma(2.2, 2.2, 2.2);
        layers[0].set_buffer(test_buffer());
        h.queue.queue_update(&mut layers, false, false).unwrap();
        assert_eq!(h.sink.lock().unwrap().color_corrections, 2);
    }

    #[test]
    fn release_fences_are_assigned_exactly_once_per_layer() {
        let mut h = harness(2);
        let mut layers = layer_list(3);
        h.queue.queue_update(&mut layers, false, false).unwrap();

        for layer in &mut layers {
            assert!(layer.take_release_fence().is_some());
            assert!(layer.take_release_fence().is_none());
        }
        assert_eq!(
            h.queue.in_flight_layers.len(),
            layers.iter().filter(|l| l.is_visible()).count()
        );
    }
}
