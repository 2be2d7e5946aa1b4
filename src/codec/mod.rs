//! Uplink/downlink audio codecs
//!
//! Base64 envelope framing for uplink PCM frames and progressive MP3
//! decoding for the downlink TTS stream.

pub mod decoder;
pub mod encoder;

pub use decoder::{DeltaDecoder, Mp3Stream, PcmChunk, RingReader};
pub use encoder::FrameEncoder;
