use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use droidlink_bridge::AdbBridge;
use droidlink_core::{DroidLinkError, InputEvent, MouseButton, RetryPolicy, SessionConfig, SessionEvent};
use droidlink_decoder::GStreamerDecoderFactory;
use droidlink_input::{keycode, InputTranslator};
use droidlink_renderer::SharedFrame;
use droidlink_session::SessionEngine;
use droidlink_transport::ControlMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// Server log lines shown when the initial connect fails.
const LOG_TAIL_LINES: usize = 20;

/// Headless host loop.
///
/// # Flow
/// 1. Load `SessionConfig` (JSON file from `DROIDLINK_CONFIG`, then env overrides)
/// 2. Detect the best GStreamer H.264 decoder
/// 3. Connect the session engine to the first (or configured) device
/// 4. Mirror frames into an in-memory buffer while stdin drives navigation
pub async fn run() -> Result<()> {
    let config = load_config(|name| std::env::var(name).ok())?;
    if !config.server_path.exists() {
        warn!(
            "Server payload {} not found, the push step will fail",
            config.server_path.display()
        );
    }

    let policy = RetryPolicy::default();
    let bridge = AdbBridge::new(&config.adb_path).with_timeout(policy.command_timeout);

    let decoders = tokio::task::spawn_blocking(GStreamerDecoderFactory::detect)
        .await
        .context("decoder detection panicked")?
        .context("No H.264 decoder available")?;
    info!("Decoder: {}", decoders.element());

    let frame = SharedFrame::new();
    let (engine, events) = SessionEngine::new(
        config,
        policy,
        Arc::new(bridge),
        Arc::new(decoders),
        Arc::new(frame.clone()),
    );
    let translator = Arc::new(Mutex::new(InputTranslator::new()));

    let event_task = tokio::spawn(log_events(events, Arc::clone(&translator), frame));

    match engine.connect().await {
        Ok(()) => {}
        Err(e) if fallback_in_progress(&e) => {
            info!("{}, restarting in compatibility mode", e);
        }
        Err(e) => {
            report_connect_failure(&e);
            event_task.abort();
            return Err(e).context("Initial connect failed");
        }
    }

    info!("Commands: back | home | recents | rotate | tap <x> <y> | text <s> | connect | disconnect | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("stdin read failed")? else {
                    info!("stdin closed");
                    break;
                };
                match parse_command(&line) {
                    Some(Command::Quit) => break,
                    Some(cmd) => {
                        if let Err(e) = execute(&engine, &translator, cmd).await {
                            warn!("Command failed: {}", e);
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => warn!("Unknown command: {}", line.trim()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    engine.disconnect().await;
    event_task.abort();
    Ok(())
}

// ── Configuration ──────────────────────────────────────────────────────────────

/// Config file (if any) with environment overrides applied on top.
fn load_config(env: impl Fn(&str) -> Option<String>) -> Result<SessionConfig> {
    let mut config = match env("DROIDLINK_CONFIG") {
        Some(path) => {
            info!("Loading config from {}", path);
            SessionConfig::load(Path::new(&path))?
        }
        None => SessionConfig::default(),
    };

    if let Some(serial) = env("DROIDLINK_SERIAL") {
        config.serial = Some(serial);
    }
    if let Some(v) = env("DROIDLINK_MAX_SIZE") {
        config.max_size = parse_number("DROIDLINK_MAX_SIZE", &v)?;
    }
    if let Some(v) = env("DROIDLINK_BITRATE") {
        config.bitrate = parse_number("DROIDLINK_BITRATE", &v)?;
    }
    if let Some(v) = env("DROIDLINK_MAX_FPS") {
        config.max_fps = parse_number("DROIDLINK_MAX_FPS", &v)?;
    }
    if let Some(encoder) = env("DROIDLINK_ENCODER") {
        config.video_encoder = Some(encoder);
    }
    if let Some(server) = env("DROIDLINK_SERVER") {
        config.server_path = server.into();
    }
    if let Some(adb) = env("ADB") {
        config.adb_path = adb;
    }

    if config.max_fps == 0 {
        bail!("max_fps must be at least 1");
    }
    debug!("Config: {:?}", config);
    Ok(config)
}

fn parse_number(name: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a non-negative integer, got {value:?}"))
}

/// The engine reports these while it relaunches the server with safe
/// encoder settings; the outcome arrives later as a session event.
fn fallback_in_progress(e: &DroidLinkError) -> bool {
    matches!(e, DroidLinkError::EncoderFailure | DroidLinkError::Superseded)
}

fn report_connect_failure(e: &DroidLinkError) {
    if e.is_preflight() {
        error!("{}", e);
        return;
    }
    match e {
        DroidLinkError::ServerCrashed { log, .. } | DroidLinkError::HandshakeFailed { log, .. } => {
            let lines: Vec<&str> = log.lines().collect();
            let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];
            for line in tail {
                error!("[server] {}", line);
            }
        }
        _ => {}
    }
}

// ── Events ─────────────────────────────────────────────────────────────────────

async fn log_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    translator: Arc<Mutex<InputTranslator>>,
    frame: SharedFrame,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::FrameReady { width, height, .. } => {
                // Commands address the video in its own pixel space.
                let mut t = translator.lock().unwrap_or_else(|e| e.into_inner());
                t.update_video_size(width, height);
                t.set_viewport(width as f64, height as f64);
                drop(t);

                let n = frame.frame_count();
                if n == 1 || n % 300 == 0 {
                    info!("Frames: {} ({}x{})", n, width, height);
                }
            }
            SessionEvent::RotationDetected { width, height } => {
                info!("Device rotated: {}x{}", width, height);
            }
            SessionEvent::ConnectionChanged { connected: true, device_label } => {
                info!("Connected: {}", device_label.as_deref().unwrap_or("device"));
            }
            SessionEvent::ConnectionChanged { connected: false, .. } => info!("Disconnected"),
            SessionEvent::StateChanged(state) => debug!("State: {}", state.label()),
            SessionEvent::PermanentDisconnect { reason } => {
                warn!("Session ended: {}. Type `connect` to retry", reason);
            }
            SessionEvent::Log(_) => {}
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Back,
    Home,
    Recents,
    Rotate,
    Tap(f64, f64),
    Text(String),
    Connect,
    Disconnect,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (line, ""),
    };
    match word.to_ascii_lowercase().as_str() {
        "back" => Some(Command::Back),
        "home" => Some(Command::Home),
        "recents" => Some(Command::Recents),
        "rotate" => Some(Command::Rotate),
        "tap" => {
            let mut parts = rest.split_whitespace();
            let x = parts.next()?.parse().ok()?;
            let y = parts.next()?.parse().ok()?;
            Some(Command::Tap(x, y))
        }
        "text" if !rest.is_empty() => Some(Command::Text(rest.to_string())),
        "connect" => Some(Command::Connect),
        "disconnect" => Some(Command::Disconnect),
        "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

async fn execute(
    engine: &SessionEngine,
    translator: &Mutex<InputTranslator>,
    cmd: Command,
) -> Result<(), DroidLinkError> {
    match cmd {
        Command::Back => engine.press_key(keycode::BACK).await,
        Command::Home => engine.press_key(keycode::HOME).await,
        Command::Recents => engine.press_key(keycode::APP_SWITCH).await,
        Command::Rotate => engine.rotate().await,
        Command::Tap(x, y) => {
            let messages = {
                let mut t = translator.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let mut m = t.translate(&InputEvent::MouseDown { x, y, button: MouseButton::Left }, now);
                m.extend(t.translate(&InputEvent::MouseUp { x, y, button: MouseButton::Left }, now));
                m
            };
            if messages.is_empty() {
                warn!("Tap at ({}, {}) is outside the video", x, y);
            }
            for msg in &messages {
                engine.send_control(msg).await?;
            }
            Ok(())
        }
        Command::Text(text) => engine.send_control(&ControlMessage::SetClipboard { text, paste: true }).await,
        Command::Connect => engine.connect().await,
        Command::Disconnect => {
            engine.disconnect().await;
            Ok(())
        }
        Command::Quit => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = load_config(env_of(&[
            ("DROIDLINK_SERIAL", "R58M123"),
            ("DROIDLINK_MAX_SIZE", "1024"),
            ("DROIDLINK_BITRATE", "4000000"),
            ("DROIDLINK_MAX_FPS", "30"),
            ("DROIDLINK_ENCODER", "c2.android.avc.encoder"),
            ("DROIDLINK_SERVER", "/opt/droidlink/server.jar"),
            ("ADB", "/usr/bin/adb"),
        ]))
        .unwrap();

        assert_eq!(config.serial.as_deref(), Some("R58M123"));
        assert_eq!(config.max_size, 1024);
        assert_eq!(config.bitrate, 4_000_000);
        assert_eq!(config.max_fps, 30);
        assert_eq!(config.video_encoder.as_deref(), Some("c2.android.avc.encoder"));
        assert_eq!(config.server_path, Path::new("/opt/droidlink/server.jar"));
        assert_eq!(config.adb_path, "/usr/bin/adb");
    }

    #[test]
    fn no_env_gives_defaults() {
        assert_eq!(load_config(env_of(&[])).unwrap(), SessionConfig::default());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = load_config(env_of(&[("DROIDLINK_BITRATE", "fast")])).unwrap_err();
        assert!(format!("{err:#}").contains("DROIDLINK_BITRATE"));
        assert!(load_config(env_of(&[("DROIDLINK_MAX_FPS", "0")])).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(env_of(&[("DROIDLINK_CONFIG", "/nonexistent/droidlink.json")])).is_err());
    }

    #[test]
    fn encoder_fallback_does_not_end_the_run() {
        assert!(fallback_in_progress(&DroidLinkError::EncoderFailure));
        assert!(fallback_in_progress(&DroidLinkError::Superseded));
        assert!(!fallback_in_progress(&DroidLinkError::NoDevice));
        assert!(!fallback_in_progress(&DroidLinkError::ServerCrashed { exit_code: Some(1), log: String::new() }));
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("back"), Some(Command::Back));
        assert_eq!(parse_command("  HOME "), Some(Command::Home));
        assert_eq!(parse_command("recents"), Some(Command::Recents));
        assert_eq!(parse_command("tap 10 20.5"), Some(Command::Tap(10.0, 20.5)));
        assert_eq!(parse_command("text héllo wörld"), Some(Command::Text("héllo wörld".into())));
        assert_eq!(parse_command("exit"), Some(Command::Quit));
        assert_eq!(parse_command("tap 10"), None);
        assert_eq!(parse_command("text"), None);
        assert_eq!(parse_command("fly"), None);
    }
}
