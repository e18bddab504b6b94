//! Interactive scanning loop
//!
//! Starts a session on a headless surface, then reads decoded codes from
//! stdin (one per line, as a keyboard-wedge scanner or a decoder pipe would
//! write them) and validates each one. A few words are commands instead:
//! `switch`, `start`, `stop` and `status`. EOF, Ctrl+C or SIGTERM end the
//! session.

use anyhow::{Context, Result};
use std::sync::Arc;
use ticketscan_core::capture::platform_backend;
use ticketscan_core::{
    config, HttpValidationClient, ScanAttempt, ScanSession, SessionEvent, SessionState,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::surface::{HeadlessProvider, HeadlessSurface};
use crate::OutputFormat;

/// Run the scanning loop until stdin closes or a shutdown signal arrives
pub async fn run_scan(format: OutputFormat, device: Option<String>) -> Result<()> {
    let config = config::load_scan_config();
    let surface = HeadlessSurface::new();

    let session = ScanSession::new(
        platform_backend(),
        Arc::new(HeadlessProvider(surface.clone())),
        Arc::new(HttpValidationClient::new(&config.validation)),
        config.constraints.clone(),
        config.session,
    );

    let _events = session.subscribe(|event| match event {
        SessionEvent::StateChanged { from, to } => tracing::info!("Session {} -> {}", from, to),
        SessionEvent::DevicesChanged { devices } => tracing::debug!("{} camera(s) available", devices.len()),
        SessionEvent::PermissionChanged { state } => tracing::info!("Camera permission: {}", state),
        SessionEvent::CodeScanned { .. } => {}
    });

    tracing::info!("Validating codes against {} (from {})", config.validation.api_url, config.validation.source);

    start(&session, format, device.as_deref()).await?;
    if let Some(stream) = surface.playing() {
        tracing::debug!("Surface playing stream {}", stream.id);
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::info!("Input closed, stopping");
                    break;
                };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                handle_input(&session, format, input).await?;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping session");
                break;
            }
        }
    }

    session.teardown();
    tracing::info!("Session stopped");
    Ok(())
}

async fn handle_input(session: &ScanSession, format: OutputFormat, input: &str) -> Result<()> {
    match input {
        "switch" => match session.switch_camera().await {
            Ok(state) => report_state(session, format, state),
            Err(e) => report_failure(format, "switch", &e.to_string()),
        },
        "start" => start(session, format, None).await?,
        "stop" => {
            session.stop();
            report_state(session, format, session.state());
        }
        "status" => match format {
            OutputFormat::Text => {
                let snapshot = session.snapshot();
                println!("State:   {}", snapshot.state);
                println!("Camera:  {}", snapshot.active_device_id.as_deref().unwrap_or("-"));
                if let Some(err) = snapshot.last_error {
                    println!("Error:   {}", err);
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string(&session.snapshot())?),
        },
        code => match session.submit_code(code).await {
            Ok(attempt) => report_attempt(format, &attempt)?,
            Err(e) => match format {
                OutputFormat::Text => eprintln!("{}: {}", code, e),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "code": code,
                        "error": e,
                    })
                ),
            },
        },
    }
    Ok(())
}

async fn start(session: &ScanSession, format: OutputFormat, device: Option<&str>) -> Result<()> {
    match session.start(device).await {
        Ok(state) => report_state(session, format, state),
        Err(e) => report_failure(format, "start", &e.to_string()),
    }
    Ok(())
}

fn report_state(session: &ScanSession, format: OutputFormat, state: SessionState) {
    let snapshot = session.snapshot();
    match format {
        OutputFormat::Text => match (state, snapshot.last_error) {
            (SessionState::Streaming, _) => println!(
                "Scanning with {}. Enter codes, 'switch' to change camera, Ctrl+D to quit.",
                snapshot.active_device_id.as_deref().unwrap_or("camera")
            ),
            (SessionState::Error, Some(err)) => {
                eprintln!("Camera unavailable: {}", err);
                if err.is_recoverable() {
                    eprintln!("Type 'start' to try again.");
                }
            }
            (state, _) => println!("Session {}", state),
        },
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "state": state,
                "active_device_id": snapshot.active_device_id,
                "last_error": snapshot.last_error,
            })
        ),
    }
}

fn report_failure(format: OutputFormat, action: &str, message: &str) {
    match format {
        OutputFormat::Text => eprintln!("Cannot {}: {}", action, message),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "action": action,
                "error": message,
            })
        ),
    }
}

fn report_attempt(format: OutputFormat, attempt: &ScanAttempt) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let mark = if attempt.outcome.is_valid { "VALID" } else { "INVALID" };
            let at = attempt.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
            if attempt.outcome.message.is_empty() {
                println!("{} {:8} {}", at, mark, attempt.decoded_code);
            } else {
                println!("{} {:8} {}  {}", at, mark, attempt.decoded_code, attempt.outcome.message);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(attempt)?),
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
