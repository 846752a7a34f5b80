//! Idle detection and frame tracking
//!
//! The tracker is shared between the frame producer and the vblank thread.
//! [`ScopedIdleStateTracker`] scopes one `queue_update` call: it raises the
//! composition-in-progress flag on entry and folds the frame's outcome back
//! into the tracker on every exit path, including failures.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::vblank::RefreshCallback;

/// Consecutive idle vblank ticks before the refresh callback fires
pub(crate) const IDLE_FRAME_THRESHOLD: u32 = 3;

/// Frames of returning content to observe before forcing layers back onto
/// overlay planes after an idle composition
const REVALIDATE_AFTER_FRAMES: u32 = 10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TrackerFlags: u32 {
        /// A queue_update call is running
        const PREPARE_COMPOSITION = 1 << 0;
        /// The refresh callback fired; compose the next frame as idle
        const PREPARE_IDLE_COMPOSITION = 1 << 1;
        /// The display currently shows an idle (single plane) composition
        const RENDER_IDLE_DISPLAY = 1 << 2;
        /// Force a full validation on the next frame
        const REVALIDATE_LAYERS = 1 << 3;
        /// Content returned after idle; counting frames until revalidation
        const TRACKING_FRAMES = 1 << 4;
        /// Drop incoming frames entirely
        const IGNORE_UPDATES = 1 << 5;
    }
}

pub(crate) struct FrameStateTracker {
    pub(crate) state: TrackerFlags,
    pub(crate) idle_frames: u32,
    pub(crate) revalidate_frames_counter: u32,
    pub(crate) total_planes: usize,
    pub(crate) has_cursor_layer: bool,
    pub(crate) refresh_callback: Option<RefreshCallback>,
    pub(crate) refresh_display_id: u32,
}

impl Default for FrameStateTracker {
    fn default() -> Self {
        FrameStateTracker {
            state: TrackerFlags::empty(),
            idle_frames: 0,
            revalidate_frames_counter: 0,
            total_planes: 1,
            has_cursor_layer: false,
            refresh_callback: None,
            refresh_display_id: 0,
        }
    }
}

impl fmt::Debug for FrameStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStateTracker")
            .field("state", &self.state)
            .field("idle_frames", &self.idle_frames)
            .field("revalidate_frames_counter", &self.revalidate_frames_counter)
            .field("total_planes", &self.total_planes)
            .field("has_cursor_layer", &self.has_cursor_layer)
            .field("refresh_callback", &self.refresh_callback.is_some())
            .field("refresh_display_id", &self.refresh_display_id)
            .finish()
    }
}

/// Scopes one frame of the queue.
///
/// Construction promotes a pending idle composition request into the active
/// idle-render state and clears the per-frame cursor mark; dropping the guard
/// lowers the composition-in-progress flag and advances the idle counters.
pub(crate) struct ScopedIdleStateTracker {
    tracker: Arc<Mutex<FrameStateTracker>>,
    render_idle: bool,
    ignore: bool,
    frame_idle: Cell<bool>,
    content_changed: Cell<bool>,
    plane_count: Cell<Option<usize>>,
}

impl ScopedIdleStateTracker {
    pub(crate) fn new(tracker: Arc<Mutex<FrameStateTracker>>) -> ScopedIdleStateTracker {
        let (render_idle, ignore) = {
            let mut guard = tracker.lock().unwrap();
            guard.state |= TrackerFlags::PREPARE_COMPOSITION;
            if guard.state.contains(TrackerFlags::PREPARE_IDLE_COMPOSITION) {
                guard.state.remove(TrackerFlags::PREPARE_IDLE_COMPOSITION);
                guard.state.insert(TrackerFlags::RENDER_IDLE_DISPLAY);
            }
            guard.has_cursor_layer = false;
            (
                guard.state.contains(TrackerFlags::RENDER_IDLE_DISPLAY),
                guard.state.contains(TrackerFlags::IGNORE_UPDATES),
            )
        };
        ScopedIdleStateTracker {
            tracker,
            render_idle,
            ignore,
            frame_idle: Cell::new(false),
            content_changed: Cell::new(false),
            plane_count: Cell::new(None),
        }
    }

    /// Whether the queue should drop this frame entirely
    pub(crate) fn ignore_update(&self) -> bool {
        self.ignore
    }

    /// Whether this frame is composed as an idle frame
    pub(crate) fn render_idle_mode(&self) -> bool {
        self.render_idle
    }

    /// Whether the tracker requests a full validation
    pub(crate) fn revalidate_layers(&self) -> bool {
        self.tracker
            .lock()
            .unwrap()
            .state
            .contains(TrackerFlags::REVALIDATE_LAYERS)
    }

    /// Note that the frame contains a cursor layer
    pub(crate) fn frame_has_cursor(&self) {
        self.tracker.lock().unwrap().has_cursor_layer = true;
    }

    /// Reset tracking after a full validation of a non-idle frame
    pub(crate) fn reset_tracker_state(&self) {
        let mut guard = self.tracker.lock().unwrap();
        let ignore = guard.state.contains(TrackerFlags::IGNORE_UPDATES);
        guard.state = TrackerFlags::PREPARE_COMPOSITION;
        if ignore {
            guard.state |= TrackerFlags::IGNORE_UPDATES;
        }
        guard.idle_frames = 0;
        guard.revalidate_frames_counter = 0;
    }

    /// Record whether the frame ended up composed as idle
    pub(crate) fn set_frame_idle(&self, idle: bool) {
        self.frame_idle.set(idle);
    }

    /// Record that layer content changed this frame
    pub(crate) fn mark_content_changed(&self) {
        self.content_changed.set(true);
    }

    /// Publish the committed plane count for the idle heuristics
    pub(crate) fn set_plane_count(&self, count: usize) {
        self.plane_count.set(Some(count));
    }
}

impl Drop for ScopedIdleStateTracker {
    fn drop(&mut self) {
        let mut guard = self.tracker.lock().unwrap();
        guard.state.remove(TrackerFlags::PREPARE_COMPOSITION);

        if self.frame_idle.get() {
            guard.state.insert(TrackerFlags::RENDER_IDLE_DISPLAY);
        } else if guard.state.contains(TrackerFlags::RENDER_IDLE_DISPLAY) {
            // Content came back; watch it for a while before forcing layers
            // back onto overlay planes.
            guard.state.remove(TrackerFlags::RENDER_IDLE_DISPLAY);
            guard.state.insert(TrackerFlags::TRACKING_FRAMES);
            guard.revalidate_frames_counter = 0;
        } else if guard.state.contains(TrackerFlags::TRACKING_FRAMES) {
            guard.revalidate_frames_counter += 1;
            if guard.revalidate_frames_counter >= REVALIDATE_AFTER_FRAMES {
                guard.state.remove(TrackerFlags::TRACKING_FRAMES);
                guard.state.insert(TrackerFlags::REVALIDATE_LAYERS);
                guard.revalidate_frames_counter = 0;
            }
        }

        if self.content_changed.get() {
            guard.idle_frames = 0;
        }

        if let Some(count) = self.plane_count.get() {
            guard.total_planes = count;
        }
    }
}

/// Linear scaling applied when a cloned pipe differs from the primary mode
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScalingTracker {
    pub(crate) active: bool,
    pub(crate) width_ratio: f32,
    pub(crate) height_ratio: f32,
}
