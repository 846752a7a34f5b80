//! Vblank event delivery contract

/// Display power states the queue distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Pipe fully off
    Off,
    /// Low-power mode showing a static image
    Doze,
    /// Low-power mode with updates suspended
    DozeSuspend,
    /// Pipe running
    On,
}

/// Callback invoked on every vertical blank with the registered display id and
/// the event timestamp in nanoseconds
pub type VsyncCallback = Box<dyn FnMut(u32, i64) + Send>;

/// Callback asking the frame producer to push a refresh frame for the given
/// display id
pub type RefreshCallback = Box<dyn Fn(u32) + Send>;

/// Source of vertical blank events for one pipe.
///
/// The embedder implements this on top of the kernel event machinery and is
/// expected to drive [`IdleStateHandle`](crate::queue::IdleStateHandle) from
/// its event thread on every vblank.
pub trait VblankSource {
    /// Error type returned when the source cannot be initialized
    type Error: std::error::Error + Send + Sync + 'static;

    /// Bind the source to a pipe
    fn init(&mut self, pipe: u32) -> Result<(), Self::Error>;

    /// Gate event delivery on the display power state
    fn set_power_mode(&mut self, mode: PowerMode);

    /// Enable or disable vsync callback delivery
    fn vsync_control(&mut self, enabled: bool);

    /// Register the callback invoked on every vblank. Returns 0 on success,
    /// a negative errno otherwise.
    fn register_callback(&mut self, callback: VsyncCallback, display_id: u32) -> i32;
}
