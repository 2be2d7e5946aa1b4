//! Downlink audio decoding
//!
//! Two stages, matching the two downlink shapes the gateway produces:
//!
//! 1. [`DeltaDecoder`] base64-decodes the `delta` field of a
//!    `response.audio.delta` envelope with a hard output cap. Failures are
//!    recoverable: the chunk is dropped and the session continues.
//! 2. [`Mp3Stream`] (TTS only) progressively decodes an MP3 byte stream.
//!    It pulls from the compressed-audio ring through [`RingReader`],
//!    which re-fills the decoder's window with a bounded-retry poll, and
//!    yields one PCM chunk per MP3 frame. A missing sync marker once
//!    end-of-stream is flagged terminates the stream normally.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::SharedByteRing;
use crate::constants::BACKPRESSURE_POLL_MS;
use crate::error::CodecError;

/// Base64 delta field decoder with a bounded output size
pub struct DeltaDecoder {
    /// Maximum decoded payload size in bytes
    max_len: usize,
    /// Chunks decoded
    chunks_decoded: u64,
    /// Chunks dropped on decode failure
    chunks_dropped: u64,
    /// Total payload bytes produced
    bytes_produced: u64,
}

impl DeltaDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            chunks_decoded: 0,
            chunks_dropped: 0,
            bytes_produced: 0,
        }
    }

    /// Decode one base64 delta field into raw bytes.
    ///
    /// Malformed input or an oversized payload is an error the caller
    /// should log and drop; it must not tear down the session.
    pub fn decode(&mut self, delta: &str) -> Result<Bytes, CodecError> {
        // The text length bounds the decoded size below: a padded quantum
        // yields at least len/4*3 - 2 bytes. Reject early only when that
        // floor already exceeds the cap, so a payload of exactly max_len
        // bytes still decodes; the exact check below guards the real limit.
        if delta.len() / 4 * 3 > self.max_len + 2 {
            self.chunks_dropped += 1;
            return Err(CodecError::PayloadTooLarge {
                size: delta.len() / 4 * 3,
                max: self.max_len,
            });
        }

        let raw = BASE64.decode(delta).map_err(|e| {
            self.chunks_dropped += 1;
            CodecError::Base64(e.to_string())
        })?;

        if raw.len() > self.max_len {
            self.chunks_dropped += 1;
            return Err(CodecError::PayloadTooLarge {
                size: raw.len(),
                max: self.max_len,
            });
        }

        self.chunks_decoded += 1;
        self.bytes_produced += raw.len() as u64;
        Ok(Bytes::from(raw))
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            chunks_decoded: self.chunks_decoded,
            chunks_dropped: self.chunks_dropped,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub chunks_decoded: u64,
    pub chunks_dropped: u64,
    pub bytes_produced: u64,
}

/// Blocking reader over the compressed-audio ring.
///
/// `read` polls the ring with a short sleep until bytes arrive, returning
/// 0 (EOF) only once end-of-stream is flagged and the ring is drained, or
/// when the exit flag is raised.
pub struct RingReader {
    ring: SharedByteRing,
    eos: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
    poll: Duration,
}

impl RingReader {
    pub fn new(ring: SharedByteRing, eos: Arc<AtomicBool>, exit: Arc<AtomicBool>) -> Self {
        Self {
            ring,
            eos,
            exit,
            poll: Duration::from_millis(BACKPRESSURE_POLL_MS),
        }
    }
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let n = self.ring.get(buf);
            if n > 0 {
                return Ok(n);
            }
            // Check eos after the read: bytes put before the flag was set
            // must still be drained.
            if self.eos.load(Ordering::Acquire) || self.exit.load(Ordering::Relaxed) {
                return Ok(0);
            }
            std::thread::sleep(self.poll);
        }
    }
}

/// One decoded PCM chunk
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// PCM16 little-endian interleaved bytes
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Progressive MP3 stream decoder over the compressed-audio ring
pub struct Mp3Stream {
    decoder: minimp3::Decoder<RingReader>,
    /// Frames decoded
    frames_decoded: u64,
    /// Total PCM bytes produced
    bytes_produced: u64,
}

impl Mp3Stream {
    pub fn new(ring: SharedByteRing, eos: Arc<AtomicBool>, exit: Arc<AtomicBool>) -> Self {
        Self {
            decoder: minimp3::Decoder::new(RingReader::new(ring, eos, exit)),
            frames_decoded: 0,
            bytes_produced: 0,
        }
    }

    /// Decode the next MP3 frame into PCM.
    ///
    /// Returns `Ok(None)` on normal end of stream. Decode errors are
    /// recoverable; the decoder resynchronizes on the next frame sync
    /// marker, so callers should log and call again.
    pub fn next_chunk(&mut self) -> Result<Option<PcmChunk>, CodecError> {
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    let mut pcm = Vec::with_capacity(frame.data.len() * 2);
                    for sample in &frame.data {
                        pcm.extend_from_slice(&sample.to_le_bytes());
                    }
                    self.frames_decoded += 1;
                    self.bytes_produced += pcm.len() as u64;
                    return Ok(Some(PcmChunk {
                        pcm: Bytes::from(pcm),
                        sample_rate: frame.sample_rate as u32,
                        channels: frame.channels as u16,
                    }));
                }
                // Garbage before the next sync marker was skipped; retry.
                Err(minimp3::Error::SkippedData) => continue,
                Err(minimp3::Error::Eof) => return Ok(None),
                Err(e) => return Err(CodecError::Mp3(e.to_string())),
            }
        }
    }

    /// Frames decoded so far
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// PCM bytes produced so far
    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced
    }
}
