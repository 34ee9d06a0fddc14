//! Session engine: connect sequence, decode thread, reconnect and
//! compatibility fallback.
//!
//! # States
//! ```text
//! Idle → Connecting → Running ─(socket error)→ Reconnecting ⇄ Connecting
//!                        │                          └─(3 failures)→ Idle
//!                        └─(encoder failure)→ CompatFallback → Connecting
//! ```
//!
//! All structural changes (connect, reconnect, fallback, disconnect) run
//! under one async mutex holding the current [`Session`]. A generation
//! counter is bumped by every new operation; older reconnect or fallback
//! loops see the change and stop.

use std::io::BufReader;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use droidlink_bridge::{BridgeRunner, RemoteProcess};
use droidlink_core::{
    BridgeError, ConnectionState, DroidLinkError, Resolution, RetryPolicy, ServerParams, SessionConfig,
    SessionEvent, TransportError, VideoCodec,
};
use droidlink_decoder::{DecoderFactory, FrameDecoder};
use droidlink_renderer::{Renderer, RendererFactory};
use droidlink_transport::{ControlChannel, ControlMessage, KeyAction, PacketRead, PacketReader, VideoChannel};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launcher::ServerLauncher;
use crate::server_log::{drain_lines, is_encoder_failure, ServerLog};

const DECODE_THREAD_NAME: &str = "droidlink-decode";
const VIDEO_READ_BUFFER: usize = 256 * 1024;

// MARK: - Session

/// Flags shared between a session, its decode thread and its drain tasks.
#[derive(Debug, Default)]
struct SessionFlags {
    running: AtomicBool,
    encoder_failed: AtomicBool,
}

/// Everything owned by one server launch. Torn down by
/// [`Inner::cleanup`] only.
struct Session {
    serial: String,
    port: u16,
    compat: bool,
    flags: Arc<SessionFlags>,
    log: ServerLog,
    process: Option<Box<dyn RemoteProcess>>,
    drains: Vec<JoinHandle<()>>,
    forwarded: bool,
    control: Option<Arc<ControlChannel>>,
    /// Clone of the decode thread's socket, kept to unblock its read.
    video: Option<std::net::TcpStream>,
    decode_thread: Option<std::thread::JoinHandle<()>>,
}

impl Session {
    /// Fails with `ServerCrashed` once the server process has exited.
    fn ensure_alive(&mut self) -> Result<(), DroidLinkError> {
        match self.process.as_mut().and_then(|p| p.try_exit()) {
            Some(exit) => Err(DroidLinkError::ServerCrashed { exit_code: exit.code, log: self.log.snapshot() }),
            None => Ok(()),
        }
    }

    fn is_alive(&mut self) -> bool {
        self.process.as_mut().map(|p| p.try_exit().is_none()).unwrap_or(false)
    }
}

/// Control channel published to input callers, with the flags of the
/// session it belongs to.
#[derive(Clone)]
struct ControlHandle {
    channel: Arc<ControlChannel>,
    flags: Arc<SessionFlags>,
}

// MARK: - SessionEngine

/// Drives at most one mirroring session. Cheap to clone.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    policy: RetryPolicy,
    bridge: Arc<dyn BridgeRunner>,
    decoders: Arc<dyn DecoderFactory>,
    renderers: Arc<dyn RendererFactory>,
    events: UnboundedSender<SessionEvent>,
    slot: tokio::sync::Mutex<Option<Session>>,
    control: RwLock<Option<ControlHandle>>,
    state: Mutex<ConnectionState>,
    serial: Mutex<Option<String>>,
    compat_mode: AtomicBool,
    fallback_pending: AtomicBool,
    generation: AtomicU64,
}

impl SessionEngine {
    pub fn new(
        config: SessionConfig,
        policy: RetryPolicy,
        bridge: Arc<dyn BridgeRunner>,
        decoders: Arc<dyn DecoderFactory>,
        renderers: Arc<dyn RendererFactory>,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            policy,
            bridge,
            decoders,
            renderers,
            events,
            slot: tokio::sync::Mutex::new(None),
            control: RwLock::new(None),
            state: Mutex::new(ConnectionState::Idle),
            serial: Mutex::new(None),
            compat_mode: AtomicBool::new(false),
            fallback_pending: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Establish a session, replacing any current one.
    ///
    /// Pre-flight and handshake failures are returned as-is; only sessions
    /// that reached `Running` are reconnected automatically.
    pub async fn connect(&self) -> Result<(), DroidLinkError> {
        let inner = &self.inner;
        let gen = inner.bump_generation();
        let mut slot = inner.slot.lock().await;
        inner.check_current(gen)?;
        inner.cleanup(&mut slot).await;
        inner.set_state(ConnectionState::Connecting);

        match inner.establish(&mut slot, gen).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !matches!(e, DroidLinkError::EncoderFailure | DroidLinkError::Superseded) {
                    inner.log(format!("Connection failed: {e}"));
                    inner.set_state(ConnectionState::Idle);
                }
                Err(e)
            }
        }
    }

    /// Tear down the current session and stop any reconnect or fallback in
    /// flight. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.bump_generation();
        let mut slot = inner.slot.lock().await;
        let had_session = slot.is_some();
        inner.cleanup(&mut slot).await;
        inner.set_state(ConnectionState::Idle);
        if had_session {
            inner.emit(SessionEvent::ConnectionChanged { connected: false, device_label: None });
            inner.log("Disconnected".to_string());
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Serial of the device of the running session.
    pub fn device_serial(&self) -> Option<String> {
        self.inner.serial.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the next connect uses the reduced compatibility profile.
    pub fn is_compat_mode(&self) -> bool {
        self.inner.compat_mode.load(Ordering::SeqCst)
    }

    /// Send one control message. A failed write is treated as a lost
    /// connection.
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), DroidLinkError> {
        let handle = self
            .inner
            .control
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)?;

        match handle.channel.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, TransportError::SendFailed { .. }) {
                    self.inner.connection_lost(&handle.flags, &format!("control write failed: {e}"), &Handle::current());
                }
                Err(e.into())
            }
        }
    }

    /// Key down followed by key up, for navigation buttons.
    pub async fn press_key(&self, keycode: i32) -> Result<(), DroidLinkError> {
        self.send_control(&ControlMessage::InjectKeycode { action: KeyAction::Down, keycode, meta_state: 0 })
            .await?;
        self.send_control(&ControlMessage::InjectKeycode { action: KeyAction::Up, keycode, meta_state: 0 })
            .await
    }

    pub async fn rotate(&self) -> Result<(), DroidLinkError> {
        self.send_control(&ControlMessage::RotateDevice).await
    }
}

// MARK: - Inner

impl Inner {
    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, gen: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == gen
    }

    fn check_current(&self, gen: u64) -> Result<(), DroidLinkError> {
        if self.is_current(gen) {
            Ok(())
        } else {
            Err(DroidLinkError::Superseded)
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn log(&self, msg: String) {
        info!("{}", msg);
        self.emit(SessionEvent::Log(msg));
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!("State: {} → {}", current.label(), state.label());
            *current = state.clone();
            drop(current);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// Run the connect sequence into `slot`, cleaning up whatever was built
    /// when it fails.
    async fn establish(self: &Arc<Self>, slot: &mut Option<Session>, gen: u64) -> Result<(), DroidLinkError> {
        match self.open_session(slot, gen).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cleanup(slot).await;
                Err(e)
            }
        }
    }

    async fn open_session(self: &Arc<Self>, slot: &mut Option<Session>, gen: u64) -> Result<(), DroidLinkError> {
        let policy = self.policy.clone();

        // 1. Ephemeral local port.
        let port = reserve_port().await?;

        // 2. Device selection.
        let devices = self.bridge.list_devices().await?;
        let serial = pick_device(&devices, self.config.serial.as_deref()).ok_or(DroidLinkError::NoDevice)?;
        self.log(format!("Device: {serial}"));
        self.check_current(gen)?;

        // 3. Server.
        let compat = self.compat_mode.load(Ordering::SeqCst);
        let params = if compat { ServerParams::compat(self.config.control) } else { self.config.server_params() };
        let launcher = ServerLauncher::new(Arc::clone(&self.bridge), policy.orphan_kill_settle);
        launcher.push(&serial, &self.config.server_path).await?;
        self.log("Server pushed".to_string());

        let launched = launcher.start(&serial, &params).await?;
        self.log(format!(
            "Server started (scid={}, {}{})",
            launched.scid,
            params,
            if compat { ", compat" } else { "" }
        ));

        let session = slot.insert(Session {
            serial: serial.clone(),
            port,
            compat,
            flags: Arc::new(SessionFlags::default()),
            log: ServerLog::default(),
            process: Some(launched.process),
            drains: Vec::new(),
            forwarded: false,
            control: None,
            video: None,
            decode_thread: None,
        });
        self.spawn_drains(session)?;

        // 4. Port forward.
        if let Err(e) = self.bridge.remove_forward(&serial, port).await {
            debug!("No stale forward on port {}: {}", port, e);
        }
        self.bridge.forward(&serial, port, &launched.socket_name).await?;
        session.forwarded = true;
        debug!("Forwarded tcp:{} → localabstract:{}", port, launched.socket_name);

        // 5. Video socket.
        tokio::time::sleep(policy.settle_delay).await;
        let mut video = None;
        let mut last_error = None;
        for attempt in 1..=policy.video_connect_attempts {
            self.check_current(gen)?;
            session.ensure_alive()?;
            if session.flags.encoder_failed.load(Ordering::SeqCst) {
                return Err(DroidLinkError::EncoderFailure);
            }
            tokio::time::sleep(policy.video_retry_interval).await;
            match VideoChannel::connect(port, policy.handshake_timeout).await {
                Ok(channel) => {
                    info!("Video socket connected on attempt {}", attempt);
                    video = Some(channel);
                    break;
                }
                Err(e) => {
                    debug!("Video connect attempt {}/{} failed: {}", attempt, policy.video_connect_attempts, e);
                    last_error = Some(e);
                }
            }
        }
        let Some(mut video) = video else {
            if let Some(e) = last_error {
                warn!("Video handshake gave up: {}", e);
            }
            return Err(DroidLinkError::HandshakeFailed {
                attempts: policy.video_connect_attempts,
                server_alive: session.is_alive(),
                log: session.log.snapshot(),
            });
        };

        // 6. Control socket, optional.
        self.handshake_step(session, gen, &policy).await?;
        let control = if params.control {
            match ControlChannel::connect(port).await {
                Ok(channel) => Some(Arc::new(channel)),
                Err(e) => {
                    self.log(format!("Control channel unavailable, continuing video only: {e}"));
                    None
                }
            }
        } else {
            None
        };
        session.control = control.clone();

        // 7. Device metadata, decoder, decode thread.
        self.handshake_step(session, gen, &policy).await?;
        let ms = policy.handshake_timeout.as_millis() as u64;
        let device_name = tokio::time::timeout(policy.handshake_timeout, video.read_device_name())
            .await
            .map_err(|_| TransportError::Timeout { ms })??;

        let decoder = self.decoders.create()?;
        let renderer = self.renderers.create();
        let stream = video.into_std()?;
        session.video = Some(stream.try_clone()?);

        session.flags.running.store(true, Ordering::SeqCst);
        let ctx = DecodeContext {
            engine: Arc::downgrade(self),
            flags: Arc::clone(&session.flags),
            events: self.events.clone(),
            runtime: Handle::current(),
            decoder,
            renderer,
        };
        let thread = std::thread::Builder::new()
            .name(DECODE_THREAD_NAME.to_string())
            .spawn(move || ctx.run(stream))?;
        session.decode_thread = Some(thread);

        *self.control.write().unwrap_or_else(|e| e.into_inner()) =
            control.map(|channel| ControlHandle { channel, flags: Arc::clone(&session.flags) });
        *self.serial.lock().unwrap_or_else(|e| e.into_inner()) = Some(serial.clone());

        self.set_state(ConnectionState::Running { serial: serial.clone(), device_name: device_name.clone() });
        self.emit(SessionEvent::ConnectionChanged {
            connected: true,
            device_label: Some(format!("{device_name} ({serial})")),
        });
        self.log(format!("Connected to {device_name}"));
        Ok(())
    }

    /// Pause between handshake steps, then re-check that the attempt is
    /// still wanted and the server still alive.
    async fn handshake_step(&self, session: &mut Session, gen: u64, policy: &RetryPolicy) -> Result<(), DroidLinkError> {
        tokio::time::sleep(policy.handshake_step_delay).await;
        self.check_current(gen)?;
        session.ensure_alive()?;
        if session.flags.encoder_failed.load(Ordering::SeqCst) {
            return Err(DroidLinkError::EncoderFailure);
        }
        Ok(())
    }

    fn spawn_drains(self: &Arc<Self>, session: &mut Session) -> Result<(), DroidLinkError> {
        let Some(process) = session.process.as_mut() else {
            return Ok(());
        };
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        if let Some(stdout) = stdout {
            let log = session.log.clone();
            let events = self.events.clone();
            session.drains.push(tokio::spawn(async move {
                drain_lines(stdout, |line| {
                    log.append(line);
                    debug!("[server] {}", line);
                    let _ = events.send(SessionEvent::Log(format!("[server] {line}")));
                })
                .await;
            }));
        }

        let Some(stderr) = stderr else {
            return Err(BridgeError::MissingPipe { command: "server".into(), stream: "stderr" }.into());
        };
        let log = session.log.clone();
        let events = self.events.clone();
        let flags = Arc::clone(&session.flags);
        let watch_encoder = !session.compat;
        let engine = Arc::downgrade(self);
        session.drains.push(tokio::spawn(async move {
            drain_lines(stderr, |line| {
                log.append(line);
                debug!("[server] {}", line);
                let _ = events.send(SessionEvent::Log(format!("[server] {line}")));
                if watch_encoder && is_encoder_failure(line) {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_encoder_failure(&flags);
                    }
                }
            })
            .await;
        }));
        Ok(())
    }

    /// First encoder-failure line of a session: stop it and schedule the
    /// compatibility restart once.
    fn on_encoder_failure(self: &Arc<Self>, flags: &SessionFlags) {
        if flags.encoder_failed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.fallback_pending.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        flags.running.store(false, Ordering::SeqCst);
        let gen = self.bump_generation();
        self.log("Encoder failure detected, switching to compatibility mode".to_string());
        tokio::spawn(Arc::clone(self).compat_fallback(gen));
    }

    /// Called from the decode thread or a failed control write. Only the
    /// first report for a running session starts a reconnect.
    fn connection_lost(self: &Arc<Self>, flags: &SessionFlags, reason: &str, runtime: &Handle) {
        if !flags.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let gen = self.bump_generation();
        self.log(format!("Connection lost: {reason}"));
        runtime.spawn(Arc::clone(self).reconnect(gen));
    }

    async fn reconnect(self: Arc<Self>, gen: u64) {
        let max = self.policy.reconnect_attempts;
        for attempt in 1..=max {
            if !self.is_current(gen) {
                return;
            }
            self.set_state(ConnectionState::Reconnecting { attempt, max_attempts: max });
            self.log(format!("Reconnecting ({attempt}/{max})..."));
            {
                let mut slot = self.slot.lock().await;
                if !self.is_current(gen) {
                    return;
                }
                self.cleanup(&mut slot).await;
            }

            tokio::time::sleep(self.policy.reconnect_delay).await;

            let mut slot = self.slot.lock().await;
            if !self.is_current(gen) {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            match self.establish(&mut slot, gen).await {
                Ok(()) => {
                    self.log("Reconnected successfully".to_string());
                    return;
                }
                Err(DroidLinkError::EncoderFailure | DroidLinkError::Superseded) => return,
                Err(e) => warn!("Reconnect attempt {}/{} failed: {}", attempt, max, e),
            }
        }

        let mut slot = self.slot.lock().await;
        if self.is_current(gen) {
            self.give_up(&mut slot, format!("Reconnect failed after {max} attempts")).await;
        }
    }

    async fn compat_fallback(self: Arc<Self>, gen: u64) {
        self.set_state(ConnectionState::CompatFallback);
        {
            let mut slot = self.slot.lock().await;
            if self.is_current(gen) {
                self.cleanup(&mut slot).await;
            }
        }

        tokio::time::sleep(self.policy.compat_release_delay).await;

        let mut slot = self.slot.lock().await;
        if self.is_current(gen) {
            self.compat_mode.store(true, Ordering::SeqCst);
            self.log(format!("Restarting in compatibility mode ({})", ServerParams::compat(self.config.control)));
            self.set_state(ConnectionState::Connecting);
            match self.establish(&mut slot, gen).await {
                Ok(()) => self.log("Compatibility mode active".to_string()),
                Err(DroidLinkError::Superseded) => {}
                Err(e) => {
                    self.compat_mode.store(false, Ordering::SeqCst);
                    self.give_up(&mut slot, format!("Compatibility mode failed: {e}")).await;
                }
            }
        }
        self.fallback_pending.store(false, Ordering::SeqCst);
    }

    async fn give_up(&self, slot: &mut Option<Session>, reason: String) {
        self.cleanup(slot).await;
        self.set_state(ConnectionState::Idle);
        self.emit(SessionEvent::ConnectionChanged { connected: false, device_label: None });
        self.log(reason.clone());
        self.emit(SessionEvent::PermanentDisconnect { reason });
    }

    /// Release every resource of the current session. Each step is best
    /// effort and the whole call is a no-op without a session.
    ///
    /// The decoder and renderer belong to the decode thread. They are dropped
    /// when that thread is joined, which happens after both sockets are shut
    /// down so the thread's blocking read returns.
    async fn cleanup(&self, slot: &mut Option<Session>) {
        let Some(mut session) = slot.take() else {
            return;
        };
        session.flags.running.store(false, Ordering::SeqCst);

        {
            let mut published = self.control.write().unwrap_or_else(|e| e.into_inner());
            if published.as_ref().is_some_and(|h| Arc::ptr_eq(&h.flags, &session.flags)) {
                *published = None;
            }
        }
        *self.serial.lock().unwrap_or_else(|e| e.into_inner()) = None;

        if let Some(control) = session.control.take() {
            control.shutdown();
        }
        if let Some(video) = session.video.take() {
            let _ = video.shutdown(Shutdown::Both);
        }
        if let Some(thread) = session.decode_thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("Decode thread panicked"),
                Err(e) => warn!("Decode thread join failed: {}", e),
            }
        }
        for drain in session.drains.drain(..) {
            drain.abort();
        }
        if let Some(mut process) = session.process.take() {
            if let Err(e) = process.kill() {
                debug!("Server kill failed: {}", e);
            }
        }
        if session.forwarded {
            let removal = self.bridge.remove_forward(&session.serial, session.port);
            match tokio::time::timeout(self.policy.command_timeout, removal).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Forward removal failed: {}", e),
                Err(_) => debug!("Forward removal timed out"),
            }
        }
        debug!("Session on port {} cleaned up", session.port);
    }
}

async fn reserve_port() -> std::io::Result<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

fn pick_device(devices: &[String], preferred: Option<&str>) -> Option<String> {
    if let Some(wanted) = preferred {
        if devices.iter().any(|d| d == wanted) {
            return Some(wanted.to_string());
        }
        if !devices.is_empty() {
            warn!("Device {} not attached, using {}", wanted, devices[0]);
        }
    }
    devices.first().cloned()
}

// MARK: - Decode thread

struct DecodeContext {
    engine: Weak<Inner>,
    flags: Arc<SessionFlags>,
    events: UnboundedSender<SessionEvent>,
    runtime: Handle,
    decoder: Box<dyn FrameDecoder>,
    renderer: Box<dyn Renderer>,
}

impl DecodeContext {
    fn run(mut self, stream: std::net::TcpStream) {
        let mut packets = PacketReader::new(BufReader::with_capacity(VIDEO_READ_BUFFER, stream));
        match self.pump(&mut packets) {
            Ok(()) => debug!("Decode loop stopped after {} packets", packets.packets_read()),
            Err(e) if self.flags.running.load(Ordering::SeqCst) => {
                if let Some(engine) = self.engine.upgrade() {
                    engine.connection_lost(&self.flags, &e.to_string(), &self.runtime);
                }
            }
            Err(e) => debug!("Decode loop exited after shutdown: {}", e),
        }
    }

    fn pump<R: std::io::Read>(&mut self, packets: &mut PacketReader<R>) -> Result<(), TransportError> {
        let meta = packets.read_codec_meta()?;
        match meta.codec() {
            Some(VideoCodec::H264) => info!("Video stream: H.264 {}", meta.resolution()),
            None => warn!("Unexpected codec id 0x{:08X}, decoding as H.264", meta.codec_id),
        }

        let mut last: Option<Resolution> = None;
        let mut frames: u64 = 0;
        let mut decode_errors: u64 = 0;
        let mut render_errors: u64 = 0;

        while self.flags.running.load(Ordering::SeqCst) {
            let packet = match packets.next_packet()? {
                PacketRead::Packet(packet) => packet,
                PacketRead::Skipped { size } => {
                    warn!("Skipping packet header with invalid size {}", size);
                    continue;
                }
            };

            let n = packets.packets_read();
            if n <= 5 {
                debug!(
                    "Packet #{}: {} bytes config={} keyframe={}",
                    n,
                    packet.data.len(),
                    packet.is_config,
                    packet.is_keyframe
                );
            }
            if n % 300 == 0 {
                info!("Stats: packets={} frames={} decode_errors={}", n, frames, decode_errors);
            }

            let frame = match self.decoder.decode(&packet) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    decode_errors += 1;
                    if decode_errors <= 10 || decode_errors % 100 == 0 {
                        warn!("Decode error #{} ({} bytes): {}", decode_errors, packet.data.len(), e);
                    }
                    continue;
                }
            };

            if let Err(e) = self.renderer.present(&frame) {
                render_errors += 1;
                if render_errors <= 10 || render_errors % 100 == 0 {
                    warn!("Render error #{}: {}", render_errors, e);
                }
            }

            frames += 1;
            if frames == 1 {
                info!("First frame decoded: {}x{}", frame.width, frame.height);
            }
            let res = frame.resolution();
            if last.is_some_and(|prev| prev.is_landscape() != res.is_landscape()) {
                info!("Rotation detected: {}", res);
                let _ = self.events.send(SessionEvent::RotationDetected { width: res.width, height: res.height });
            }
            last = Some(res);
            let _ = self.events.send(SessionEvent::FrameReady {
                width: frame.width,
                height: frame.height,
                pts_us: frame.timestamp_us,
            });
        }
        Ok(())
    }
}
