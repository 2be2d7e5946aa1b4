//! Voice chat session
//!
//! Ties the pieces together for the speech-to-speech flow: a push-to-talk
//! microphone feeding the uplink worker, and a network handler that plays
//! downlink PCM and tracks the session state machine.
//!
//! The worker is the only task that reads the mic ring and the only
//! producer of uplink audio envelopes. It blocks on the event flags the
//! capture callback raises, so the hot path is wake - drain - encode -
//! queue with no polling.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::buffer::{create_shared_ring, SharedByteRing};
use crate::audio::capture::AudioCapture;
use crate::audio::playback::AudioPlayback;
use crate::codec::{DeltaDecoder, FrameEncoder};
use crate::config::ChatConfig;
use crate::constants::{
    BACKPRESSURE_POLL_MS, CHAT_DELTA_MAX, MAX_ENVELOPE_LEN, MIC_FRAME_LEN, MIC_RING_CAPACITY,
    PLAYBACK_RING_CAPACITY, SAMPLE_RATE,
};
use crate::error::{Error, Result, SessionError};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::events::{EventFlags, EXIT, MIC_CLOSE, MIC_RX};
use crate::session::state::{ChatPhase, ChatState};
use crate::transport::{Outbound, TransportEvent, WsTransport};

/// Delay between `input_audio_buffer.commit` and `response.create`
const COMMIT_SETTLE: Duration = Duration::from_millis(10);

/// An established voice chat session
pub struct ChatSession {
    transport: WsTransport,
    state: Arc<ChatState>,
    flags: Arc<EventFlags>,
    exit: Arc<AtomicBool>,
    capture: Mutex<AudioCapture>,
    transcript_rx: Option<mpsc::UnboundedReceiver<String>>,
    worker_handle: Option<JoinHandle<()>>,
    handler_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession").finish_non_exhaustive()
    }
}

impl ChatSession {
    /// Connect to the gateway and run the session handshake:
    /// wait for `session.created`, send `session.update`, wait for
    /// `session.updated`. Returns with the session in steady state,
    /// ready for [`ChatSession::press`].
    pub async fn connect(config: &ChatConfig) -> Result<Self> {
        Self::connect_url(&config.url(), config).await
    }

    // Connection target split from the config so the handshake can be
    // exercised against a plain-ws listener.
    async fn connect_url(url: &str, config: &ChatConfig) -> Result<Self> {
        let (transport, events) = WsTransport::connect(url, &config.token).await?;

        let (state, mut phase_rx) = ChatState::new();
        let state = Arc::new(state);
        let flags = Arc::new(EventFlags::new());
        let exit = Arc::new(AtomicBool::new(false));
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();

        let handler_handle = tokio::spawn(handle_events(
            events,
            state.clone(),
            flags.clone(),
            exit.clone(),
            transcript_tx,
        ));

        if let Err(e) =
            await_phase(&mut phase_rx, ChatPhase::SessionCreated, config.created_timeout(), "session.created").await
        {
            abort(&transport, &exit, &flags).await;
            return Err(e);
        }

        transport
            .send_text(ClientEvent::session_update(&config.voice).to_json())
            .await?;

        if let Err(e) =
            await_phase(&mut phase_rx, ChatPhase::SessionUpdated, config.updated_timeout(), "session.updated").await
        {
            abort(&transport, &exit, &flags).await;
            return Err(e);
        }

        tracing::info!("Chat session established with voice {}", config.voice);

        let mic_ring = create_shared_ring(MIC_RING_CAPACITY);
        let capture = AudioCapture::new(mic_ring.clone(), flags.clone());

        let worker = ChatWorker::new(
            mic_ring,
            state.clone(),
            transport.sender(),
            flags.clone(),
            exit.clone(),
        )?;
        let worker_handle = tokio::spawn(worker.run());

        Ok(Self {
            transport,
            state,
            flags,
            exit,
            capture: Mutex::new(capture),
            transcript_rx: Some(transcript_rx),
            worker_handle: Some(worker_handle),
            handler_handle: Some(handler_handle),
        })
    }

    /// Open the microphone (push-to-talk pressed)
    pub fn press(&self) -> Result<()> {
        self.capture.lock().start()?;
        Ok(())
    }

    /// Close the microphone and request a response (push-to-talk released)
    pub fn release(&self) {
        self.capture.lock().stop();
        self.flags.raise(MIC_CLOSE);
    }

    /// Current session phase
    pub fn phase(&self) -> ChatPhase {
        self.state.phase()
    }

    /// Take the transcript stream. Yields one
    /// `response.audio_transcript.delta` fragment per item.
    pub fn take_transcript(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.transcript_rx.take()
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.exit.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flags.raise(EXIT);
        self.capture.lock().stop();
        self.transport.close().await;

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.handler_handle.take() {
            let _ = handle.await;
        }
        tracing::info!("Chat session closed");
    }
}

async fn await_phase(
    rx: &mut watch::Receiver<ChatPhase>,
    want: ChatPhase,
    timeout: Duration,
    what: &'static str,
) -> Result<()> {
    match tokio::time::timeout(timeout, rx.wait_for(|p| *p == want)).await {
        Ok(Ok(_)) => Ok(()),
        _ => Err(Error::Session(SessionError::HandshakeTimeout(what))),
    }
}

async fn abort(transport: &WsTransport, exit: &AtomicBool, flags: &EventFlags) {
    exit.store(true, Ordering::SeqCst);
    flags.raise(EXIT);
    transport.close().await;
}

/// Let buffered downlink audio play out before the speaker is released.
/// Returns immediately if the stream is gone or exit is raised, so a dead
/// device can never wedge the handler.
async fn drain_speaker(speaker: &AudioPlayback, exit: &AtomicBool) {
    let poll = Duration::from_millis(BACKPRESSURE_POLL_MS);
    while speaker.is_running() && speaker.buffered() > 0 && !exit.load(Ordering::Relaxed) {
        tokio::time::sleep(poll).await;
    }
}

/// Uplink worker: drains the mic ring into `input_audio_buffer.append`
/// envelopes and drives the commit / response.create sequence when the
/// mic closes.
struct ChatWorker {
    mic: SharedByteRing,
    encoder: FrameEncoder,
    state: Arc<ChatState>,
    outbound: mpsc::Sender<Outbound>,
    flags: Arc<EventFlags>,
    exit: Arc<AtomicBool>,
}

impl ChatWorker {
    fn new(
        mic: SharedByteRing,
        state: Arc<ChatState>,
        outbound: mpsc::Sender<Outbound>,
        flags: Arc<EventFlags>,
        exit: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Self {
            mic,
            encoder: FrameEncoder::new(MIC_FRAME_LEN, MAX_ENVELOPE_LEN).map_err(Error::Codec)?,
            state,
            outbound,
            flags,
            exit,
        })
    }

    async fn run(mut self) {
        loop {
            let bits = self.flags.wait().await;
            if !self.handle(bits).await {
                break;
            }
        }
        let stats = self.encoder.stats();
        tracing::debug!(
            "Chat worker stopped after {} uplink frames",
            stats.frames_encoded
        );
    }

    /// Process one taken flag word. Returns false when the worker should
    /// stop.
    async fn handle(&mut self, bits: u32) -> bool {
        if bits & EXIT != 0 || self.exit.load(Ordering::Relaxed) {
            return false;
        }

        if bits & MIC_CLOSE != 0 {
            // Flush whatever full frames the callback left behind, then
            // commit and request the response. A trailing partial frame
            // is discarded with the ring.
            if !self.pump_frames().await {
                return false;
            }
            self.mic.clear();

            if !self.send(ClientEvent::BufferCommit.to_json()).await {
                return false;
            }
            tokio::time::sleep(COMMIT_SETTLE).await;
            if !self.send(ClientEvent::response_create().to_json()).await {
                return false;
            }
            self.state.begin_response();
            return true;
        }

        if bits & MIC_RX != 0 {
            return self.pump_frames().await;
        }

        true
    }

    /// Drain every complete frame from the mic ring onto the wire.
    ///
    /// If a response is still in flight this is a barge-in:
    /// `response.cancel` goes out before the first append.
    async fn pump_frames(&mut self) -> bool {
        let mut frame = [0u8; MIC_FRAME_LEN];

        while self.mic.available_data() >= MIC_FRAME_LEN {
            if self.state.preempt() {
                if !self.send(ClientEvent::ResponseCancel.to_json()).await {
                    return false;
                }
            }
            self.state.begin_append();

            let n = self.mic.get(&mut frame);
            match self.encoder.encode(&frame[..n]) {
                Ok(envelope) => {
                    if !self.send(envelope).await {
                        return false;
                    }
                }
                Err(e) => tracing::warn!("Dropping mic frame: {e}"),
            }
        }
        true
    }

    async fn send(&self, text: String) -> bool {
        if self.outbound.send(Outbound::Text(text)).await.is_err() {
            tracing::warn!("Outbound queue closed; stopping chat worker");
            return false;
        }
        true
    }
}

/// Network handler: applies gateway events to the state machine and plays
/// downlink PCM.
///
/// The speaker is opened lazily on the first `response.audio.delta` and
/// released once the response is done and its tail has drained, so the
/// device is not held between turns.
async fn handle_events(
    mut events: mpsc::Receiver<TransportEvent>,
    state: Arc<ChatState>,
    flags: Arc<EventFlags>,
    exit: Arc<AtomicBool>,
    transcript: mpsc::UnboundedSender<String>,
) {
    let mut decoder = DeltaDecoder::new(CHAT_DELTA_MAX);
    let mut playback: Option<AudioPlayback> = None;
    let poll = Duration::from_millis(BACKPRESSURE_POLL_MS);

    while let Some(event) = events.recv().await {
        let text = match event {
            TransportEvent::Connected { status } => {
                tracing::debug!("Chat transport connected ({status})");
                continue;
            }
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
            ServerEvent::SessionCreated => {
                state.on_created();
            }
            ServerEvent::SessionUpdated => {
                state.on_updated();
            }
            ServerEvent::TranscriptDelta { delta } => {
                let _ = transcript.send(delta);
            }
            ServerEvent::AudioDelta { delta } => {
                let pcm = match decoder.decode(&delta) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        tracing::warn!("Dropping downlink chunk: {e}");
                        continue;
                    }
                };

                if playback.is_none() {
                    let mut speaker = AudioPlayback::new(SAMPLE_RATE, PLAYBACK_RING_CAPACITY);
                    match speaker.start() {
                        Ok(()) => playback = Some(speaker),
                        Err(e) => {
                            tracing::error!("Cannot open speaker: {e}");
                            continue;
                        }
                    }
                }
                let Some(speaker) = playback.as_ref() else {
                    continue;
                };

                // Backpressure: the ring caps buffered audio, so retry
                // until the speaker catches up instead of dropping.
                let mut written = 0;
                while written < pcm.len() {
                    if exit.load(Ordering::Relaxed) || !speaker.is_running() {
                        break;
                    }
                    written += speaker.write(&pcm[written..]);
                    if written < pcm.len() {
                        tokio::time::sleep(poll).await;
                    }
                }
            }
            ServerEvent::ResponseDone => {
                state.on_response_done();
                if let Some(mut speaker) = playback.take() {
                    drain_speaker(&speaker, &exit).await;
                    speaker.stop();
                }
            }
            // tts_session.updated does not occur on this connection;
            // response.created and audio.done carry no state here.
            _ => {}
        }
    }

    if let Some(mut speaker) = playback.take() {
        drain_speaker(&speaker, &exit).await;
        speaker.stop();
    }
    // Transport is gone; stop the uplink worker too.
    flags.raise(EXIT);
    tracing::debug!(
        "Chat event handler stopped ({} downlink chunks)",
        decoder.stats().chunks_decoded
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BUFFER_APPEND_PREFIX;

    fn worker_fixture() -> (ChatWorker, mpsc::Receiver<Outbound>, Arc<ChatState>) {
        let mic = create_shared_ring(MIC_RING_CAPACITY);
        let (state, _rx) = ChatState::new();
        let state = Arc::new(state);
        state.on_created();
        state.on_updated();

        let (tx, rx) = mpsc::channel(32);
        let worker = ChatWorker::new(
            mic,
            state.clone(),
            tx,
            Arc::new(EventFlags::new()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        (worker, rx, state)
    }

    fn recv_text(rx: &mut mpsc::Receiver<Outbound>) -> String {
        match rx.try_recv().expect("expected an outbound envelope") {
            Outbound::Text(text) => text,
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mic_data_becomes_append_envelopes() {
        let (mut worker, mut rx, state) = worker_fixture();
        assert_eq!(worker.mic.put(&[0u8; MIC_FRAME_LEN * 2]), MIC_FRAME_LEN * 2);

        assert!(worker.handle(MIC_RX).await);

        for _ in 0..2 {
            let envelope = recv_text(&mut rx);
            assert!(envelope.starts_with(BUFFER_APPEND_PREFIX));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(state.phase(), ChatPhase::BufferAppend);
    }

    #[tokio::test]
    async fn test_partial_frame_is_not_sent() {
        let (mut worker, mut rx, _state) = worker_fixture();
        worker.mic.put(&[0u8; MIC_FRAME_LEN / 2]);

        assert!(worker.handle(MIC_RX).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_barge_in_cancels_before_appending() {
        let (mut worker, mut rx, state) = worker_fixture();
        state.begin_response();
        worker.mic.put(&[0u8; MIC_FRAME_LEN]);

        assert!(worker.handle(MIC_RX).await);

        // Cancellation strictly precedes the first append.
        assert_eq!(recv_text(&mut rx), r#"{"type":"response.cancel"}"#);
        assert!(recv_text(&mut rx).starts_with(BUFFER_APPEND_PREFIX));
        assert_eq!(state.phase(), ChatPhase::BufferAppend);
    }

    #[tokio::test]
    async fn test_mic_close_flushes_commits_and_requests_response() {
        let (mut worker, mut rx, state) = worker_fixture();
        state.begin_append();
        worker.mic.put(&[0u8; MIC_FRAME_LEN]);

        assert!(worker.handle(MIC_RX | MIC_CLOSE).await);

        assert!(recv_text(&mut rx).starts_with(BUFFER_APPEND_PREFIX));
        assert_eq!(
            recv_text(&mut rx),
            r#"{"type":"input_audio_buffer.commit"}"#
        );
        let response: serde_json::Value =
            serde_json::from_str(&recv_text(&mut rx)).unwrap();
        assert_eq!(response["type"], "response.create");
        assert_eq!(state.phase(), ChatPhase::ResponseCreate);
        assert!(worker.mic.is_empty());
    }

    #[tokio::test]
    async fn test_exit_flag_stops_worker() {
        let (mut worker, mut rx, _state) = worker_fixture();
        worker.mic.put(&[0u8; MIC_FRAME_LEN]);

        assert!(!worker.handle(MIC_RX | EXIT).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_session_created() {
        use futures_util::StreamExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts the upgrade but never sends session.created.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let config = ChatConfig {
            created_timeout_secs: 0,
            ..ChatConfig::default()
        };
        let err = ChatSession::connect_url(&format!("ws://{addr}"), &config)
            .await
            .expect_err("handshake must time out");
        assert!(matches!(
            err,
            Error::Session(SessionError::HandshakeTimeout("session.created"))
        ));
        server.abort();
    }

    #[tokio::test]
    async fn test_drain_speaker_returns_when_stream_is_gone() {
        let speaker = AudioPlayback::new(SAMPLE_RATE, 64);
        speaker.write(&[0u8; 32]);
        let exit = AtomicBool::new(false);
        // Never started: nothing will consume the ring, so the drain must
        // bail out instead of spinning on buffered().
        drain_speaker(&speaker, &exit).await;
        assert!(speaker.buffered() > 0);
    }

    #[tokio::test]
    async fn test_handler_drives_handshake_and_transcript() {
        let (state, _phase_rx) = ChatState::new();
        let state = Arc::new(state);
        let flags = Arc::new(EventFlags::new());
        let exit = Arc::new(AtomicBool::new(false));
        let (transcript_tx, mut transcript_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(8);

        let handler = tokio::spawn(handle_events(
            rx,
            state.clone(),
            flags.clone(),
            exit,
            transcript_tx,
        ));

        tx.send(TransportEvent::Connected { status: 101 }).await.unwrap();
        tx.send(TransportEvent::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        tx.send(TransportEvent::Text(r#"{"type":"session.updated"}"#.into()))
            .await
            .unwrap();
        tx.send(TransportEvent::Text(
            r#"{"type":"response.audio_transcript.delta","delta":"你好"}"#.into(),
        ))
        .await
        .unwrap();
        tx.send(TransportEvent::Text("garbage".into())).await.unwrap();
        drop(tx);

        handler.await.unwrap();
        assert_eq!(state.phase(), ChatPhase::SessionUpdated);
        assert_eq!(transcript_rx.recv().await.unwrap(), "你好");
        // Transport loss stops the worker.
        assert_eq!(flags.take() & EXIT, EXIT);
    }
}
