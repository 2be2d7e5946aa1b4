//! Session orchestration: lifecycle state machines, worker event flags
//! and the two session types built on them.

pub mod chat;
pub mod events;
pub mod state;
pub mod tts;

pub use chat::ChatSession;
pub use state::{ChatPhase, ChatState, TtsPhase, TtsState};
pub use tts::TtsSession;
