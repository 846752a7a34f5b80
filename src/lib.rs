#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! **kms-compositor: per-display hardware plane composition**
//!
//! This crate implements the frame-by-frame heart of a hardware-accelerated
//! window compositor: given a z-ordered list of client layers, a
//! [`DisplayQueue`] decides which layers a display controller plane can scan
//! out directly, falls back to GPU composition into off-screen surfaces where
//! the hardware cannot, and commits the resulting plane configuration
//! atomically with acquire and release fences threaded correctly.
//!
//! The kernel mode-setting device, the plane capability database, the GPU
//! renderer, buffer import and vblank delivery all stay outside this crate,
//! behind the [`DisplaySink`](display::DisplaySink),
//! [`PlaneManager`](plane::PlaneManager),
//! [`CompositionBackend`](compositor::CompositionBackend),
//! [`FramebufferExporter`](buffer::FramebufferExporter) and
//! [`VblankSource`](vblank::VblankSource) contracts. What the crate owns is
//! the caching state machine in between: layer diffing across frames, reuse
//! and patching of the previous plane assignment, the off-screen surface
//! lifecycle with triple-buffered aging, plane squashing, idle detection and
//! fence bookkeeping.

pub mod buffer;
pub mod compositor;
pub mod display;
pub mod layer;
pub mod plane;
pub mod queue;
pub mod surface;
pub mod utils;
pub mod vblank;

pub use crate::queue::{DisplayQueue, FrameError, IdleStateHandle, InitError};
