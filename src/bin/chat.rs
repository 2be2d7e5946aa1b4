//! Voice Chat Application
//!
//! Push-to-talk speech-to-speech chat against the realtime gateway.
//! Press Enter to open the mic, Enter again to close it and hear the
//! reply; `q` quits.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_voice::config::AppConfig;
use realtime_voice::session::ChatSession;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "realtime-voice.toml".to_string());
    let config = AppConfig::load_or_default(&config_path)?;

    tracing::info!("Connecting to {}", config.chat.url());
    let mut session = ChatSession::connect(&config.chat).await?;

    // Print transcript fragments as they stream in.
    if let Some(mut transcript) = session.take_transcript() {
        tokio::spawn(async move {
            while let Some(delta) = transcript.recv().await {
                print!("{delta}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            println!();
        });
    }

    println!("Enter: toggle mic, q: quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut talking = false;

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "q" | "quit" => break,
            "" => {
                if talking {
                    session.release();
                    println!("[mic closed, waiting for reply]");
                } else {
                    session.press()?;
                    println!("[mic open, Enter to send]");
                }
                talking = !talking;
            }
            other => println!("Unknown command: {other}"),
        }
    }

    session.shutdown().await;
    Ok(())
}
