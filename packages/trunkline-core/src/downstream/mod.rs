//! Downstream dispatch-console integration.

pub mod streamer;

pub use streamer::{DispatchStreamer, StreamerHandle, StreamerStats};
