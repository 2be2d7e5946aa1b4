//! Microphone capture
//!
//! Captures 16 kHz mono audio on a dedicated thread. The cpal data
//! callback only converts samples to PCM16 bytes, appends them to the mic
//! ring and raises the mic-data event flag once a full protocol frame has
//! accumulated; it never blocks and never touches the network.
//!
//! `start` blocks until the stream thread reports that the stream is
//! built and playing, so a device-open failure surfaces to the caller
//! instead of leaving a silently dead microphone.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SharedByteRing;
use crate::audio::device::{default_input_device, device_name};
use crate::constants::{CHANNELS, MIC_FRAME_LEN, SAMPLE_RATE};
use crate::error::AudioError;
use crate::session::events::{EventFlags, MIC_RX};

/// How long `start` waits for the stream thread's acknowledgment
const STREAM_READY_WAIT: Duration = Duration::from_secs(5);

/// Microphone capture bound to the mic ring and the worker event flags
pub struct AudioCapture {
    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Ring receiving PCM16 bytes from the callback
    ring: SharedByteRing,

    /// Worker event flags; MIC_RX is raised per complete frame
    flags: Arc<EventFlags>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Total samples captured
    samples_captured: Arc<AtomicU64>,
}

impl AudioCapture {
    pub fn new(ring: SharedByteRing, flags: Arc<EventFlags>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            ring,
            flags,
            thread_handle: None,
            samples_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start capturing audio. Returns once the stream is live; any
    /// device or stream failure is the caller's error, not a log line.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = default_input_device()?;
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let running_on_error = self.running.clone();
        let ring = self.ring.clone();
        let flags = self.flags.clone();
        let samples_captured = self.samples_captured.clone();

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        self.samples_captured.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        tracing::debug!("Opening capture device: {}", device_name(&device));

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                // Bytes buffered since the last MIC_RX signal
                let mut pending: usize = 0;
                let mut chunk = [0u8; 512];

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }

                        samples_captured.fetch_add(data.len() as u64, Ordering::Relaxed);

                        // Convert to PCM16 little-endian in fixed-size chunks
                        for samples in data.chunks(chunk.len() / 2) {
                            for (i, &s) in samples.iter().enumerate() {
                                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                                chunk[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
                            }
                            // On overflow the remainder is dropped and counted
                            // by the ring; the callback must not wait.
                            pending += ring.put(&chunk[..samples.len() * 2]);
                        }

                        if pending >= MIC_FRAME_LEN {
                            pending = 0;
                            flags.raise(MIC_RX);
                        }
                    },
                    move |err| {
                        // Fatal stream errors take capture down.
                        tracing::error!("Capture stream failed: {err}");
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

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping capture
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
                    "capture stream did not start in time".to_string(),
                ))
            }
        }
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get total samples captured
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_ring;
    use crate::constants::MIC_RING_CAPACITY;

    #[test]
    fn test_capture_creation() {
        let ring = create_shared_ring(MIC_RING_CAPACITY);
        let flags = Arc::new(EventFlags::new());
        let capture = AudioCapture::new(ring, flags);
        assert!(!capture.is_running());
        assert_eq!(capture.samples_captured(), 0);
    }

    #[test]
    fn test_start_result_matches_running_state() {
        let ring = create_shared_ring(MIC_RING_CAPACITY);
        let flags = Arc::new(EventFlags::new());
        let mut capture = AudioCapture::new(ring, flags);

        // start() blocks until the stream thread acknowledges, so its
        // result and is_running() always agree; a failed open must not
        // leave a phantom running capture.
        match capture.start() {
            Ok(()) => {
                assert!(capture.is_running());
                capture.stop();
                assert!(!capture.is_running());
            }
            Err(_) => assert!(!capture.is_running()),
        }
    }
}
