//! Engine drivers
//!
//! The engine can be driven two ways: the blocking loop in
//! [`crate::engine::Engine::exec`] (the engine thread owns the cadence,
//! endpoints block on their own I/O), or a callback driver where an
//! external audio server owns the realtime thread and calls us once per
//! block.

#[cfg(feature = "jack-backend")]
pub mod jack;
