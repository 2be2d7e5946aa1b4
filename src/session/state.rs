//! Session and response lifecycle state machines
//!
//! Phases gate which envelopes may be sent. Transitions come from two
//! places: inbound gateway events (applied by the network handler) and
//! local triggers (applied by the worker when the mic opens or closes).
//! Phase changes are published through a `tokio::sync::watch` channel so
//! the connect path can await a transition with a timeout instead of
//! polling.
//!
//! The one rule that must never be violated: while a response is in
//! flight (`ResponseCreate`), no audio may be appended until a
//! `response.cancel` has been sent — [`ChatState::preempt`] is the gate.
//! Cancellation is best-effort: a `response.done` arriving after a cancel
//! is still accepted.

use tokio::sync::watch;

/// Voice chat session phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    /// Transport connecting / waiting for `session.created`
    Connecting,
    /// Gateway acknowledged the session
    SessionCreated,
    /// Gateway acknowledged our configuration; steady state
    SessionUpdated,
    /// Uplink audio frames are being appended
    BufferAppend,
    /// A response was requested and is in flight
    ResponseCreate,
    /// The response finished; ready for the next utterance
    ResponseDone,
}

impl ChatPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::SessionCreated => "SessionCreated",
            Self::SessionUpdated => "SessionUpdated",
            Self::BufferAppend => "BufferAppend",
            Self::ResponseCreate => "ResponseCreate",
            Self::ResponseDone => "ResponseDone",
        }
    }
}

/// Chat session state machine
pub struct ChatState {
    phase: watch::Sender<ChatPhase>,
}

impl ChatState {
    pub fn new() -> (Self, watch::Receiver<ChatPhase>) {
        let (tx, rx) = watch::channel(ChatPhase::Connecting);
        (Self { phase: tx }, rx)
    }

    pub fn phase(&self) -> ChatPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatPhase> {
        self.phase.subscribe()
    }

    fn set(&self, next: ChatPhase) {
        self.phase.send_replace(next);
    }

    /// `session.created` received. Legal only while connecting.
    pub fn on_created(&self) -> bool {
        if self.phase() != ChatPhase::Connecting {
            tracing::warn!(
                "Ignoring out-of-order session.created in phase {}",
                self.phase().name()
            );
            return false;
        }
        self.set(ChatPhase::SessionCreated);
        true
    }

    /// `session.updated` received. Must follow `session.created`.
    pub fn on_updated(&self) -> bool {
        if self.phase() != ChatPhase::SessionCreated {
            tracing::warn!(
                "Ignoring out-of-order session.updated in phase {}",
                self.phase().name()
            );
            return false;
        }
        self.set(ChatPhase::SessionUpdated);
        true
    }

    /// `response.done` received. Accepted even after a cancel was sent —
    /// the in-flight response may complete before the cancel lands.
    pub fn on_response_done(&self) -> bool {
        match self.phase() {
            ChatPhase::Connecting | ChatPhase::SessionCreated => {
                tracing::warn!(
                    "Ignoring response.done in phase {}",
                    self.phase().name()
                );
                false
            }
            _ => {
                self.set(ChatPhase::ResponseDone);
                true
            }
        }
    }

    /// Local trigger: mic closed, commit sent, response requested
    pub fn begin_response(&self) {
        self.set(ChatPhase::ResponseCreate);
    }

    /// Local trigger: mic data while a response is in flight (barge-in).
    ///
    /// Returns true when the caller must send `response.cancel` before
    /// any further `input_audio_buffer.append`.
    pub fn preempt(&self) -> bool {
        if self.phase() == ChatPhase::ResponseCreate {
            self.set(ChatPhase::BufferAppend);
            true
        } else {
            false
        }
    }

    /// Local trigger: uplink frames are flowing
    pub fn begin_append(&self) {
        match self.phase() {
            ChatPhase::SessionUpdated | ChatPhase::ResponseDone => {
                self.set(ChatPhase::BufferAppend);
            }
            _ => {}
        }
    }
}

/// Text-to-speech session phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsPhase {
    /// Transport connecting / waiting for `tts_session.updated`
    Connecting,
    /// Gateway acknowledged our configuration
    SessionUpdated,
    /// Downlink audio is streaming
    Streaming,
    /// Stream drained and playback released; terminal
    Ended,
}

impl TtsPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::SessionUpdated => "SessionUpdated",
            Self::Streaming => "Streaming",
            Self::Ended => "Ended",
        }
    }
}

/// TTS session state machine
pub struct TtsState {
    phase: watch::Sender<TtsPhase>,
}

impl TtsState {
    pub fn new() -> (Self, watch::Receiver<TtsPhase>) {
        let (tx, rx) = watch::channel(TtsPhase::Connecting);
        (Self { phase: tx }, rx)
    }

    pub fn phase(&self) -> TtsPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TtsPhase> {
        self.phase.subscribe()
    }

    /// `tts_session.updated` received
    pub fn on_updated(&self) -> bool {
        if self.phase() != TtsPhase::Connecting {
            tracing::warn!(
                "Ignoring out-of-order tts_session.updated in phase {}",
                self.phase().name()
            );
            return false;
        }
        self.phase.send_replace(TtsPhase::SessionUpdated);
        true
    }

    /// First downlink audio arrived
    pub fn on_streaming(&self) {
        if self.phase() == TtsPhase::SessionUpdated {
            self.phase.send_replace(TtsPhase::Streaming);
        }
    }

    /// Decode loop drained the stream and released playback; terminal
    pub fn on_ended(&self) {
        self.phase.send_replace(TtsPhase::Ended);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_lifecycle_happy_path() {
        let (state, _rx) = ChatState::new();
        assert_eq!(state.phase(), ChatPhase::Connecting);
        assert!(state.on_created());
        assert!(state.on_updated());
        assert_eq!(state.phase(), ChatPhase::SessionUpdated);

        state.begin_append();
        assert_eq!(state.phase(), ChatPhase::BufferAppend);
        state.begin_response();
        assert!(state.on_response_done());
        assert_eq!(state.phase(), ChatPhase::ResponseDone);

        // Loops back for the next utterance.
        state.begin_append();
        assert_eq!(state.phase(), ChatPhase::BufferAppend);
    }

    #[test]
    fn test_updated_before_created_is_ignored() {
        let (state, _rx) = ChatState::new();
        assert!(!state.on_updated());
        assert_eq!(state.phase(), ChatPhase::Connecting);
    }

    #[test]
    fn test_duplicate_created_is_ignored() {
        let (state, _rx) = ChatState::new();
        assert!(state.on_created());
        assert!(!state.on_created());
        assert_eq!(state.phase(), ChatPhase::SessionCreated);
    }

    #[test]
    fn test_preempt_only_during_in_flight_response() {
        let (state, _rx) = ChatState::new();
        state.on_created();
        state.on_updated();

        assert!(!state.preempt());

        state.begin_response();
        assert!(state.preempt());
        assert_eq!(state.phase(), ChatPhase::BufferAppend);

        // Only one cancel per in-flight response.
        assert!(!state.preempt());
    }

    #[test]
    fn test_done_after_cancel_race_is_accepted() {
        let (state, _rx) = ChatState::new();
        state.on_created();
        state.on_updated();
        state.begin_response();

        // Barge-in sent a cancel, then the response completed anyway.
        assert!(state.preempt());
        assert!(state.on_response_done());
        assert_eq!(state.phase(), ChatPhase::ResponseDone);
    }

    #[test]
    fn test_early_response_done_is_ignored() {
        let (state, _rx) = ChatState::new();
        assert!(!state.on_response_done());
        state.on_created();
        assert!(!state.on_response_done());
    }

    #[test]
    fn test_watch_observes_transitions() {
        let (state, rx) = ChatState::new();
        state.on_created();
        assert_eq!(*rx.borrow(), ChatPhase::SessionCreated);
    }

    #[test]
    fn test_tts_lifecycle() {
        let (state, _rx) = TtsState::new();
        assert!(state.on_updated());
        assert!(!state.on_updated());
        state.on_streaming();
        assert_eq!(state.phase(), TtsPhase::Streaming);
        state.on_ended();
        assert_eq!(state.phase(), TtsPhase::Ended);
    }
}
