//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{create_shared_ring, ByteRing, SharedByteRing};
pub use capture::AudioCapture;
pub use playback::AudioPlayback;
