//! Voice Assistant Session CLI
//!
//! Starts one streaming session against the configured endpoint and runs
//! until Ctrl+C. Useful for exercising the capture → transport → playback
//! path outside the web application.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_session::audio::list_devices;
use voice_session::config::SessionConfig;
use voice_session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice assistant session");

    let config = SessionConfig::load()?;

    // List available audio devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();

    let manager = SessionManager::new(config);

    let mut messages = manager.watch_message();
    if let Err(e) = manager.start().await {
        if let Some(message) = messages.borrow_and_update().clone() {
            eprintln!("{message}");
        }
        return Err(e.into());
    }

    tracing::info!("Session open - speak into the microphone, Ctrl+C to stop");

    let mut state = manager.watch_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping session");
            manager.stop().await;
        }
        _ = async {
            // Exit if the session ends on its own (endpoint close or error)
            while state.changed().await.is_ok() {
                if !state.borrow().is_active() {
                    break;
                }
            }
        } => {
            if let Some(message) = messages.borrow_and_update().clone() {
                eprintln!("{message}");
            }
        }
    }

    Ok(())
}
