//! Text-to-speech session
//!
//! Streams text up as `input_text.append` deltas and plays the MP3 audio
//! the gateway streams back. Compressed bytes land in a bounded ring; a
//! dedicated thread runs the MP3 decoder against that ring and feeds the
//! speaker, so decode stalls never block the network handler and network
//! stalls only ever starve the decoder, which waits.
//!
//! End of stream is signalled by `response.audio.done`; the decoder then
//! drains what is buffered, lets the tail play out and releases the
//! device, after which the session reports [`TtsPhase::Ended`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::buffer::{create_shared_ring, SharedByteRing};
use crate::audio::playback::AudioPlayback;
use crate::codec::{DeltaDecoder, Mp3Stream};
use crate::config::TtsConfig;
use crate::constants::{
    BACKPRESSURE_POLL_MS, MP3_RING_CAPACITY, TTS_DELTA_MAX, TTS_PLAYBACK_RING_CAPACITY,
};
use crate::error::{Error, Result, SessionError, TransportError};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::state::{TtsPhase, TtsState};
use crate::transport::{TransportEvent, WsTransport};

/// Let the playback tail ring out before the device is released.
/// Returns immediately if the stream is gone or exit is raised.
fn drain_playback(playback: &AudioPlayback, exit: &AtomicBool) {
    let poll = Duration::from_millis(BACKPRESSURE_POLL_MS);
    while playback.is_running() && playback.buffered() > 0 && !exit.load(Ordering::Relaxed) {
        std::thread::sleep(poll);
    }
}

/// An established text-to-speech session
pub struct TtsSession {
    transport: WsTransport,
    state: Arc<TtsState>,
    phase_rx: watch::Receiver<TtsPhase>,
    eos: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
    next_event_id: u32,
    handler_handle: Option<JoinHandle<()>>,
}

impl TtsSession {
    /// Connect to the gateway, verify the WebSocket upgrade and complete
    /// the `tts_session.update` / `tts_session.updated` handshake.
    pub async fn connect(config: &TtsConfig) -> Result<Self> {
        let (transport, mut events) = WsTransport::connect(&config.url(), &config.token).await?;

        match tokio::time::timeout(config.connect_timeout(), events.recv()).await {
            Ok(Some(TransportEvent::Connected { status: 101 })) => {}
            Ok(Some(TransportEvent::Connected { status })) => {
                transport.close().await;
                return Err(Error::Transport(TransportError::UpgradeStatus(status)));
            }
            _ => {
                transport.close().await;
                return Err(Error::Session(SessionError::HandshakeTimeout(
                    "websocket upgrade",
                )));
            }
        }

        let (state, mut phase_rx) = TtsState::new();
        let state = Arc::new(state);
        let eos = Arc::new(AtomicBool::new(false));
        let exit = Arc::new(AtomicBool::new(false));
        let mp3_ring = create_shared_ring(MP3_RING_CAPACITY);

        let handler_handle = tokio::spawn(handle_events(
            events,
            state.clone(),
            mp3_ring,
            eos.clone(),
            exit.clone(),
            config.output_sample_rate,
        ));

        transport
            .send_text(
                ClientEvent::tts_session_update(
                    &config.voice,
                    &config.model,
                    config.output_sample_rate,
                )
                .to_json(),
            )
            .await?;

        let updated = tokio::time::timeout(
            config.updated_timeout(),
            phase_rx.wait_for(|p| *p != TtsPhase::Connecting),
        )
        .await
        .map(|r| r.map(|_| ()));
        if !matches!(updated, Ok(Ok(_))) {
            exit.store(true, Ordering::SeqCst);
            transport.close().await;
            return Err(Error::Session(SessionError::HandshakeTimeout(
                "tts_session.updated",
            )));
        }

        tracing::info!("TTS session established with voice {}", config.voice);

        Ok(Self {
            transport,
            state,
            phase_rx,
            eos,
            exit,
            next_event_id: 0,
            handler_handle: Some(handler_handle),
        })
    }

    /// Send one text segment as an `input_text.append` delta
    pub async fn append_text(&mut self, text: &str) -> Result<()> {
        self.transport
            .send_text(ClientEvent::input_text_append(self.next_event_id, text).to_json())
            .await?;
        self.next_event_id += 1;
        Ok(())
    }

    /// Close the text input; the gateway synthesizes what was appended
    pub async fn finish(&mut self) -> Result<()> {
        self.transport
            .send_text(ClientEvent::InputTextDone.to_json())
            .await?;
        Ok(())
    }

    /// Convenience: append one segment and close the input
    pub async fn submit_text(&mut self, text: &str) -> Result<()> {
        self.append_text(text).await?;
        self.finish().await
    }

    /// Current session phase
    pub fn phase(&self) -> TtsPhase {
        self.state.phase()
    }

    /// Wait until synthesis has played out and the speaker was released
    pub async fn wait_ended(&mut self) {
        let _ = self.phase_rx.wait_for(|p| *p == TtsPhase::Ended).await;
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.exit.swap(true, Ordering::SeqCst) {
            return;
        }
        self.eos.store(true, Ordering::Release);
        self.transport.close().await;
        if let Some(handle) = self.handler_handle.take() {
            let _ = handle.await;
        }
        tracing::info!("TTS session closed");
    }
}

/// Network handler: routes gateway events into the compressed-audio ring
/// and owns the decode thread's lifecycle.
async fn handle_events(
    mut events: mpsc::Receiver<TransportEvent>,
    state: Arc<TtsState>,
    mp3_ring: SharedByteRing,
    eos: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
    default_rate: u32,
) {
    let mut decoder = DeltaDecoder::new(TTS_DELTA_MAX);
    let mut decode_thread: Option<ThreadHandle<()>> = None;
    let poll = Duration::from_millis(BACKPRESSURE_POLL_MS);

    while let Some(event) = events.recv().await {
        let text = match event {
            TransportEvent::Connected { .. } => continue,
            TransportEvent::Closed => break,
            TransportEvent::Text(text) => text,
        };

        let event = match ServerEvent::parse(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping unparseable gateway event: {e}");
                continue;
            }
        };

        match event {
            ServerEvent::TtsSessionUpdated { session } => {
                if !state.on_updated() {
                    continue;
                }
                let rate = session.output_audio_rate().unwrap_or(default_rate);
                tracing::debug!("TTS output negotiated at {rate} Hz");
                match spawn_decode_thread(
                    mp3_ring.clone(),
                    eos.clone(),
                    exit.clone(),
                    state.clone(),
                    rate,
                ) {
                    Ok(handle) => decode_thread = Some(handle),
                    Err(e) => {
                        tracing::error!("Cannot start MP3 decode thread: {e}");
                        state.on_ended();
                    }
                }
            }
            ServerEvent::AudioDelta { delta } => {
                state.on_streaming();
                let chunk = match decoder.decode(&delta) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("Dropping downlink chunk: {e}");
                        continue;
                    }
                };

                // Compressed bytes must not be dropped: a hole in the MP3
                // stream corrupts every frame after it. Retry until the
                // decoder frees space.
                let mut written = 0;
                while written < chunk.len() {
                    if exit.load(Ordering::Relaxed) {
                        break;
                    }
                    written += mp3_ring.put(&chunk[written..]);
                    if written < chunk.len() {
                        tokio::time::sleep(poll).await;
                    }
                }
            }
            ServerEvent::AudioDone => {
                eos.store(true, Ordering::Release);
            }
            _ => {}
        }
    }

    // Transport is gone; unblock and collect the decoder.
    eos.store(true, Ordering::Release);
    match decode_thread.take() {
        Some(handle) => {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        // Handshake never completed; nothing will ever play.
        None => state.on_ended(),
    }
    tracing::debug!(
        "TTS event handler stopped ({} downlink chunks)",
        decoder.stats().chunks_decoded
    );
}

/// Run the MP3 decoder on its own thread: pull compressed bytes from the
/// ring, push PCM at the speaker, and release everything once the stream
/// drains.
fn spawn_decode_thread(
    ring: SharedByteRing,
    eos: Arc<AtomicBool>,
    exit: Arc<AtomicBool>,
    state: Arc<TtsState>,
    sample_rate: u32,
) -> std::io::Result<ThreadHandle<()>> {
    std::thread::Builder::new()
        .name("mp3-decode".to_string())
        .spawn(move || {
            let mut playback = AudioPlayback::new(sample_rate, TTS_PLAYBACK_RING_CAPACITY);
            if let Err(e) = playback.start() {
                tracing::error!("Cannot open speaker: {e}");
                state.on_ended();
                return;
            }

            let mut stream = Mp3Stream::new(ring, eos, exit.clone());
            loop {
                match stream.next_chunk() {
                    Ok(Some(chunk)) => {
                        if !playback.write_all_blocking(&chunk.pcm, &exit) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => tracing::warn!("MP3 frame dropped: {e}"),
                }
            }

            drain_playback(&playback, &exit);
            playback.stop();
            tracing::debug!("MP3 decode finished ({} frames)", stream.frames_decoded());
            state.on_ended();
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_playback_returns_when_stream_is_gone() {
        let playback = AudioPlayback::new(16000, 64);
        playback.write(&[0u8; 32]);
        // Never started: nothing will consume the ring, so the drain must
        // bail out instead of spinning on buffered().
        drain_playback(&playback, &AtomicBool::new(false));
        assert!(playback.buffered() > 0);
    }

    #[tokio::test]
    async fn test_handler_reaches_ended_without_audio() {
        let (state, mut phase_rx) = TtsState::new();
        let state = Arc::new(state);
        let eos = Arc::new(AtomicBool::new(false));
        let exit = Arc::new(AtomicBool::new(false));
        let ring = create_shared_ring(MP3_RING_CAPACITY);
        let (tx, rx) = mpsc::channel(8);

        let handler = tokio::spawn(handle_events(
            rx,
            state.clone(),
            ring,
            eos.clone(),
            exit,
            16000,
        ));

        tx.send(TransportEvent::Text(
            r#"{"type":"tts_session.updated","sesson":{"output_audio_rate":"16000"}}"#.into(),
        ))
        .await
        .unwrap();
        tx.send(TransportEvent::Text(r#"{"type":"response.audio.done"}"#.into()))
            .await
            .unwrap();
        drop(tx);

        handler.await.unwrap();
        assert!(eos.load(Ordering::Acquire));
        // The decode thread ends the session whether or not a speaker
        // could be opened.
        phase_rx.wait_for(|p| *p == TtsPhase::Ended).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_ends_session_when_transport_drops_early() {
        let (state, mut phase_rx) = TtsState::new();
        let state = Arc::new(state);
        let (tx, rx) = mpsc::channel::<TransportEvent>(1);

        let handler = tokio::spawn(handle_events(
            rx,
            state,
            create_shared_ring(MP3_RING_CAPACITY),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            16000,
        ));

        drop(tx);
        handler.await.unwrap();
        phase_rx.wait_for(|p| *p == TtsPhase::Ended).await.unwrap();
    }
}
