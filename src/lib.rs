//! # Realtime Voice Client
//!
//! Low-latency voice chat and text-to-speech over a persistent WebSocket
//! connection to a realtime speech gateway.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            CHAT SESSION                              │
//! │  ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌───────────┐  │
//! │  │Microphone│───▶│ ByteRing │───▶│ FrameEncoder │───▶│ WebSocket │  │
//! │  │ (cpal)   │    │  (mic)   │    │  (base64)    │    │  writer   │  │
//! │  └──────────┘    └──────────┘    └──────────────┘    └─────┬─────┘  │
//! │                                                            │        │
//! │  ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌─────▼─────┐  │
//! │  │ Speaker  │◀───│ ByteRing │◀───│ DeltaDecoder │◀───│ WebSocket │  │
//! │  │ (cpal)   │    │(playback)│    │  (base64)    │    │  reader   │  │
//! │  └──────────┘    └──────────┘    └──────────────┘    └───────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             TTS SESSION                              │
//! │   submit_text ──▶ input_text.append / input_text.done ──▶ gateway    │
//! │                                                                      │
//! │  ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌───────────┐  │
//! │  │ Speaker  │◀───│ ByteRing │◀───│  Mp3Stream   │◀───│ ByteRing  │  │
//! │  │ (cpal)   │    │(playback)│    │  (minimp3)   │    │  (mp3)    │  │
//! │  └──────────┘    └──────────┘    └──────────────┘    └───────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session state machine (`session::state`) gates which envelopes may
//! be sent at any time; in particular no audio may be appended while a
//! response is in flight without cancelling it first (barge-in).

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate the gateway expects for pcm16 audio
    pub const SAMPLE_RATE: u32 = 16000;

    /// Channel count (mono)
    pub const CHANNELS: u16 = 1;

    /// Bits per sample for pcm16
    pub const BITS_PER_SAMPLE: u16 = 16;

    /// Uplink PCM frame length in bytes (10 ms at 16 kHz mono, 16-bit)
    pub const MIC_FRAME_LEN: usize = 320;

    /// Mic ring buffer capacity in bytes (two frames)
    pub const MIC_RING_CAPACITY: usize = MIC_FRAME_LEN * 2;

    /// Compressed-audio ring buffer capacity for downlink MP3
    pub const MP3_RING_CAPACITY: usize = 10 * 1024;

    /// Playback ring buffer capacity in bytes (chat downlink PCM)
    pub const PLAYBACK_RING_CAPACITY: usize = 30000;

    /// Playback ring buffer capacity in bytes (decoded TTS PCM)
    pub const TTS_PLAYBACK_RING_CAPACITY: usize = 4096;

    /// Maximum size of one outbound protocol envelope
    pub const MAX_ENVELOPE_LEN: usize = 2048;

    /// Maximum decoded size of one chat `response.audio.delta` payload
    pub const CHAT_DELTA_MAX: usize = 4096;

    /// Maximum decoded size of one TTS `response.audio.delta` payload
    pub const TTS_DELTA_MAX: usize = 4096 * 2;

    /// Poll interval for backpressure retry loops in milliseconds
    pub const BACKPRESSURE_POLL_MS: u64 = 5;
}
