//! Speaker playback
//!
//! Plays PCM16 audio pulled from a bounded byte ring. The cpal output
//! callback reads whatever is buffered and zero-fills on underrun; writers
//! use [`AudioPlayback::write`] (partial, non-blocking) or
//! [`AudioPlayback::write_all_blocking`] which retries with a short sleep
//! instead of dropping samples, checking the exit flag on every retry so
//! shutdown stays responsive.
//!
//! `start` blocks until the stream thread reports that the stream is
//! built and playing, so a device-open failure surfaces to the caller.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{create_shared_ring, SharedByteRing};
use crate::audio::device::{default_output_device, device_name};
use crate::constants::{BACKPRESSURE_POLL_MS, CHANNELS};
use crate::error::AudioError;

/// How long `start` waits for the stream thread's acknowledgment
const STREAM_READY_WAIT: Duration = Duration::from_secs(5);

/// Speaker output fed from a bounded PCM16 ring
pub struct AudioPlayback {
    /// Whether playback is running
    running: Arc<AtomicBool>,

    /// Ring holding PCM16 bytes awaiting output
    ring: SharedByteRing,

    /// Output sample rate
    sample_rate: u32,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Create playback with its own ring of `cache_size` bytes
    pub fn new(sample_rate: u32, cache_size: usize) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            ring: create_shared_ring(cache_size),
            sample_rate,
            thread_handle: None,
        }
    }

    /// Start the output stream. Returns once the stream is live; any
    /// device or stream failure is the caller's error, not a log line.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = default_output_device()?;
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let running_on_error = self.running.clone();
        let ring = self.ring.clone();

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        running.store(true, Ordering::SeqCst);

        tracing::debug!("Opening playback device: {}", device_name(&device));

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let mut chunk = [0u8; 512];

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for out in data.chunks_mut(chunk.len() / 2) {
                            let wanted = out.len() * 2;
                            let n = ring.get(&mut chunk[..wanted]);
                            for (i, sample) in out.iter_mut().enumerate() {
                                if i * 2 + 1 < n {
                                    let v =
                                        i16::from_le_bytes([chunk[i * 2], chunk[i * 2 + 1]]);
                                    *sample = v as f32 / i16::MAX as f32;
                                } else {
                                    // Underrun: play silence
                                    *sample = 0.0;
                                }
                            }
                        }
                    },
                    move |err| {
                        // Fatal stream errors take playback down; blocked
                        // writers see running drop and give up.
                        tracing::error!("Playback stream failed: {err}");
                        running_on_error.store(false, Ordering::SeqCst);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(STREAM_READY_WAIT) {
            Ok(Ok(())) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(AudioError::StreamError(
                    "playback stream did not start in time".to_string(),
                ))
            }
        }
    }

    /// Queue PCM16 bytes, returning how many were accepted
    pub fn write(&self, data: &[u8]) -> usize {
        self.ring.put(data)
    }

    /// Queue all bytes, retrying with a short sleep while the ring is full.
    /// Returns false if the exit flag was raised before everything fit.
    pub fn write_all_blocking(&self, data: &[u8], exit: &AtomicBool) -> bool {
        let mut written = 0;
        while written < data.len() {
            if exit.load(Ordering::Relaxed) || !self.running.load(Ordering::Relaxed) {
                return false;
            }
            written += self.ring.put(&data[written..]);
            if written < data.len() {
                thread::sleep(Duration::from_millis(BACKPRESSURE_POLL_MS));
            }
        }
        true
    }

    /// Bytes queued but not yet played
    pub fn buffered(&self) -> usize {
        self.ring.available_data()
    }

    /// Check if playback is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the output stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_without_stream() {
        let playback = AudioPlayback::new(16000, 8);
        assert_eq!(playback.write(&[0u8; 4]), 4);
        assert_eq!(playback.write(&[0u8; 8]), 4);
        assert_eq!(playback.buffered(), 8);
    }

    #[test]
    fn test_write_all_blocking_observes_exit() {
        let playback = AudioPlayback::new(16000, 4);
        let exit = AtomicBool::new(true);
        // Ring holds 4 of 8 bytes; exit is set so the retry loop gives up.
        assert!(!playback.write_all_blocking(&[0u8; 8], &exit));
    }

    #[test]
    fn test_start_result_matches_running_state() {
        let mut playback = AudioPlayback::new(16000, 64);

        // start() blocks until the stream thread acknowledges, so its
        // result and is_running() always agree; a failed open must not
        // leave a phantom running stream.
        match playback.start() {
            Ok(()) => {
                assert!(playback.is_running());
                playback.stop();
                assert!(!playback.is_running());
            }
            Err(_) => assert!(!playback.is_running()),
        }
    }
}
