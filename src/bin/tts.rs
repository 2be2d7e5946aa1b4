//! Text-to-Speech Application
//!
//! Speaks the text given on the command line through the realtime
//! gateway's TTS model.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_voice::config::AppConfig;
use realtime_voice::session::TtsSession;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let text: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        eprintln!("usage: tts <text to speak>");
        std::process::exit(2);
    }

    let config = AppConfig::load_or_default("realtime-voice.toml")?;

    tracing::info!("Connecting to {}", config.tts.url());
    let mut session = TtsSession::connect(&config.tts).await?;

    session.submit_text(&text).await?;
    tracing::info!("Text submitted, playing synthesis");

    session.wait_ended().await;
    session.shutdown().await;
    Ok(())
}
