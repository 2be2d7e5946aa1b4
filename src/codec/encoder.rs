//! Uplink frame encoder
//!
//! Turns one fixed-size PCM16 frame into an `input_audio_buffer.append`
//! envelope: base64 payload spliced between the protocol template prefix
//! and suffix. The worst-case envelope length is a construction-time
//! invariant, so `encode` can never produce an oversized message.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::CodecError;
use crate::protocol::{BUFFER_APPEND_PREFIX, BUFFER_APPEND_SUFFIX};

/// PCM frame to envelope encoder with a reused output buffer
pub struct FrameEncoder {
    /// Expected frame length in bytes
    frame_len: usize,
    /// Envelope buffer (reused to avoid allocations)
    out: String,
    /// Frames encoded
    frames_encoded: u64,
    /// Total envelope bytes produced
    bytes_produced: u64,
}

impl FrameEncoder {
    /// Create an encoder for `frame_len`-byte frames.
    ///
    /// Fails if the worst-case envelope would exceed `max_envelope_len`;
    /// buffer sizing is derived from the fixed frame size, so this can
    /// only trip on misconfiguration.
    pub fn new(frame_len: usize, max_envelope_len: usize) -> Result<Self, CodecError> {
        let required = Self::envelope_len(frame_len);
        if required > max_envelope_len {
            return Err(CodecError::EnvelopeTooLarge {
                required,
                max: max_envelope_len,
            });
        }
        Ok(Self {
            frame_len,
            out: String::with_capacity(required),
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Exact envelope length for a frame of `frame_len` bytes
    pub fn envelope_len(frame_len: usize) -> usize {
        BUFFER_APPEND_PREFIX.len() + frame_len.div_ceil(3) * 4 + BUFFER_APPEND_SUFFIX.len()
    }

    /// Encode one PCM frame into a complete uplink envelope.
    ///
    /// The frame must be exactly the configured length; nothing is emitted
    /// on error.
    pub fn encode(&mut self, frame: &[u8]) -> Result<String, CodecError> {
        if frame.len() != self.frame_len {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        self.out.clear();
        self.out.push_str(BUFFER_APPEND_PREFIX);
        BASE64.encode_string(frame, &mut self.out);
        self.out.push_str(BUFFER_APPEND_SUFFIX);

        self.frames_encoded += 1;
        self.bytes_produced += self.out.len() as u64;

        Ok(self.out.clone())
    }

    /// Expected frame length in bytes
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
}
