//! Engine scenarios against a scripted bridge and an in-process device stub.
//!
//! `forward()` binds a TCP listener on the engine's chosen port that plays
//! the device server: dummy byte, device name, codec header, then packets
//! whose 8-byte payload is the frame size the scripted decoder reports.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use droidlink_bridge::{BridgeRunner, ExitInfo, ProcessPipe, RemoteProcess};
use droidlink_core::{
    BridgeError, ConnectionState, DecodedFrame, DecoderError, DroidLinkError, EncodedPacket, RetryPolicy,
    SessionConfig, SessionEvent, TransportError, VideoCodec,
};
use droidlink_decoder::{DecoderFactory, FrameDecoder};
use droidlink_renderer::{Renderer, RendererError, RendererFactory};
use droidlink_transport::{ControlMessage, KeyAction};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::SessionEngine;

// ── Device stub ───────────────────────────────────────────────────────────────

/// What the stub does with connections after the video socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPeer {
    /// Read and record control bytes.
    Record,
    /// Stop listening, so the control connect is refused.
    Refuse,
    /// Accept, then close at once.
    HangUp,
}

#[derive(Debug, Clone)]
enum Stub {
    /// Nothing listens on the forwarded port.
    Refuse,
    /// Drop the first `drop_first` connections, then serve the video
    /// socket; later connections are control sockets.
    Serve { drop_first: usize, name: &'static str, frames: Vec<(u32, u32)>, hang_up: bool, control: ControlPeer },
}

impl Stub {
    fn serving(frames: &[(u32, u32)]) -> Self {
        Self::with_control(frames, ControlPeer::Record)
    }

    fn hanging_up(frames: &[(u32, u32)]) -> Self {
        Stub::Serve {
            drop_first: 0,
            name: "Mock Phone",
            frames: frames.to_vec(),
            hang_up: true,
            control: ControlPeer::Record,
        }
    }

    fn with_control(frames: &[(u32, u32)], control: ControlPeer) -> Self {
        Stub::Serve { drop_first: 0, name: "Mock Phone", frames: frames.to_vec(), hang_up: false, control }
    }
}

#[derive(Default)]
struct StubStats {
    video_attempts: AtomicUsize,
    control: Mutex<Vec<u8>>,
}

/// Frame entry that is sent as a short SPS/PPS-style packet instead.
const CONFIG: (u32, u32) = (0, 0);

fn video_wire(name: &str, frames: &[(u32, u32)]) -> Vec<u8> {
    let mut out = vec![0u8];
    let mut field = [0u8; 64];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);

    let (w0, h0) = frames.iter().copied().find(|&f| f != CONFIG).unwrap_or((1080, 1920));
    out.extend_from_slice(&VideoCodec::H264_ID.to_be_bytes());
    out.extend_from_slice(&w0.to_be_bytes());
    out.extend_from_slice(&h0.to_be_bytes());

    for (i, &(w, h)) in frames.iter().enumerate() {
        let pts = i as u64 * 16_666;
        if (w, h) == CONFIG {
            out.extend_from_slice(&(pts | EncodedPacket::FLAG_CONFIG).to_be_bytes());
            out.extend_from_slice(&4i32.to_be_bytes());
            out.extend_from_slice(&[0, 0, 0, 1]);
            continue;
        }
        out.extend_from_slice(&(pts | EncodedPacket::FLAG_KEY_FRAME).to_be_bytes());
        out.extend_from_slice(&8i32.to_be_bytes());
        out.extend_from_slice(&w.to_be_bytes());
        out.extend_from_slice(&h.to_be_bytes());
    }
    out
}

async fn serve(listener: TcpListener, stub: Stub, stats: Arc<StubStats>) {
    let Stub::Serve { drop_first, name, frames, hang_up, control } = stub else {
        return;
    };
    let mut dropped = 0;
    let mut video_served = false;
    loop {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        if !video_served {
            stats.video_attempts.fetch_add(1, Ordering::SeqCst);
            if dropped < drop_first {
                dropped += 1;
                drop(sock);
                continue;
            }
            video_served = true;
            let wire = video_wire(name, &frames);
            tokio::spawn(async move {
                if sock.write_all(&wire).await.is_err() || hang_up {
                    return;
                }
                let mut buf = [0u8; 256];
                while matches!(sock.read(&mut buf).await, Ok(n) if n > 0) {}
            });
            if control == ControlPeer::Refuse {
                return;
            }
        } else if control == ControlPeer::HangUp {
            drop(sock);
        } else {
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => stats.control.lock().unwrap().extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    }
}

// ── Scripted bridge ───────────────────────────────────────────────────────────

struct MockProcess {
    stdout: Option<ProcessPipe>,
    stderr: Option<ProcessPipe>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
    killed: Arc<AtomicBool>,
}

impl RemoteProcess for MockProcess {
    fn take_stdout(&mut self) -> Option<ProcessPipe> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ProcessPipe> {
        self.stderr.take()
    }

    fn try_exit(&mut self) -> Option<ExitInfo> {
        *self.exit.lock().unwrap()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit.lock().unwrap().get_or_insert(ExitInfo { code: None });
        Ok(())
    }
}

struct ProcessHandle {
    stderr: Option<DuplexStream>,
    killed: Arc<AtomicBool>,
}

struct MockBridge {
    devices: Vec<String>,
    stubs: Mutex<VecDeque<Stub>>,
    stderr_seed: Vec<String>,
    exit_on_start: Option<i32>,
    stats: Arc<StubStats>,
    started: Mutex<Vec<Vec<String>>>,
    processes: Mutex<Vec<ProcessHandle>>,
    forwards: Mutex<Vec<(u16, String)>>,
    removed: Mutex<Vec<u16>>,
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl MockBridge {
    fn new(devices: &[&str], stubs: Vec<Stub>) -> Self {
        Self {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            stubs: Mutex::new(stubs.into()),
            stderr_seed: Vec::new(),
            exit_on_start: None,
            stats: Arc::new(StubStats::default()),
            started: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            forwards: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn started(&self) -> Vec<Vec<String>> {
        self.started.lock().unwrap().clone()
    }

    fn killed(&self, index: usize) -> bool {
        self.processes.lock().unwrap()[index].killed.load(Ordering::SeqCst)
    }

    fn stderr_writer(&self, index: usize) -> DuplexStream {
        self.processes.lock().unwrap()[index].stderr.take().expect("stderr writer already taken")
    }

    fn next_stub(&self) -> Stub {
        let mut stubs = self.stubs.lock().unwrap();
        if stubs.len() > 1 {
            stubs.pop_front().unwrap()
        } else {
            stubs.front().cloned().unwrap_or(Stub::Refuse)
        }
    }
}

#[async_trait]
impl BridgeRunner for MockBridge {
    async fn list_devices(&self) -> Result<Vec<String>, BridgeError> {
        Ok(self.devices.clone())
    }

    async fn push(&self, _serial: &str, _local: &Path, _remote: &str) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn forward(&self, _serial: &str, local_port: u16, socket_name: &str) -> Result<(), BridgeError> {
        self.forwards.lock().unwrap().push((local_port, socket_name.to_string()));
        let stub = self.next_stub();
        if let Stub::Serve { .. } = stub {
            let listener = TcpListener::bind(("127.0.0.1", local_port)).await.map_err(|e| {
                BridgeError::CommandFailed { command: "forward".into(), code: None, stderr: e.to_string() }
            })?;
            let handle = tokio::spawn(serve(listener, stub, Arc::clone(&self.stats)));
            self.listeners.lock().unwrap().insert(local_port, handle);
        }
        Ok(())
    }

    async fn remove_forward(&self, _serial: &str, local_port: u16) -> Result<(), BridgeError> {
        self.removed.lock().unwrap().push(local_port);
        if let Some(listener) = self.listeners.lock().unwrap().remove(&local_port) {
            listener.abort();
        }
        Ok(())
    }

    async fn shell(&self, _serial: &str, _command: &str) -> Result<String, BridgeError> {
        Ok(String::new())
    }

    async fn start_process(&self, _serial: &str, args: &[String]) -> Result<Box<dyn RemoteProcess>, BridgeError> {
        let (stdout_tx, stdout_rx) = tokio::io::duplex(1024);
        drop(stdout_tx);
        let (mut stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
        for line in &self.stderr_seed {
            let _ = stderr_tx.write_all(format!("{line}\n").as_bytes()).await;
        }

        let killed = Arc::new(AtomicBool::new(false));
        self.started.lock().unwrap().push(args.to_vec());
        self.processes.lock().unwrap().push(ProcessHandle { stderr: Some(stderr_tx), killed: Arc::clone(&killed) });

        Ok(Box::new(MockProcess {
            stdout: Some(Box::new(stdout_rx)),
            stderr: Some(Box::new(stderr_rx)),
            exit: Arc::new(Mutex::new(self.exit_on_start.map(|code| ExitInfo { code: Some(code) }))),
            killed,
        }))
    }
}

// ── Scripted decoder and renderer ─────────────────────────────────────────────

/// Payload `[w BE][h BE]` decodes to a flat frame of that size.
struct ScriptedDecoder;

impl FrameDecoder for ScriptedDecoder {
    fn decode(&mut self, packet: &EncodedPacket) -> Result<Option<DecodedFrame>, DecoderError> {
        if packet.data.len() < 8 {
            return Ok(None);
        }
        let d = &packet.data;
        let w = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
        let h = u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
        let mut frame = DecodedFrame::solid_i420(w, h, 16, 128, 128);
        frame.timestamp_us = packet.pts_us;
        Ok(Some(frame))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedDecoders;

impl DecoderFactory for ScriptedDecoders {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecoderError> {
        Ok(Box::new(ScriptedDecoder))
    }
}

#[derive(Default, Clone)]
struct RecordingRenderers {
    presented: Arc<Mutex<Vec<(u32, u32)>>>,
}

struct RecordingRenderer {
    presented: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl Renderer for RecordingRenderer {
    fn present(&mut self, frame: &DecodedFrame) -> Result<(), RendererError> {
        self.presented.lock().unwrap().push((frame.width, frame.height));
        Ok(())
    }

    fn reset(&mut self) {}
}

impl RendererFactory for RecordingRenderers {
    fn create(&self) -> Box<dyn Renderer> {
        Box::new(RecordingRenderer { presented: Arc::clone(&self.presented) })
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        settle_delay: Duration::from_millis(10),
        video_connect_attempts: 10,
        video_retry_interval: Duration::from_millis(10),
        handshake_timeout: Duration::from_secs(1),
        handshake_step_delay: Duration::from_millis(10),
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(20),
        compat_release_delay: Duration::from_millis(20),
        orphan_kill_settle: Duration::from_millis(1),
        command_timeout: Duration::from_secs(1),
    }
}

struct Harness {
    engine: SessionEngine,
    events: UnboundedReceiver<SessionEvent>,
    bridge: Arc<MockBridge>,
    renderers: RecordingRenderers,
}

fn harness(bridge: MockBridge) -> Harness {
    let bridge = Arc::new(bridge);
    let renderers = RecordingRenderers::default();
    let (engine, events) = SessionEngine::new(
        SessionConfig::default(),
        fast_policy(),
        bridge.clone(),
        Arc::new(ScriptedDecoders),
        Arc::new(renderers.clone()),
    );
    Harness { engine, events, bridge, renderers }
}

/// Collect events until `pred` matches one; returns everything seen.
async fn wait_for(
    events: &mut UnboundedReceiver<SessionEvent>,
    what: &str,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                let hit = pred(&event);
                seen.push(event);
                if hit {
                    return seen;
                }
            }
            Ok(None) => panic!("event channel closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}; saw {seen:?}"),
        }
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain_now(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn is_connected_event(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::ConnectionChanged { connected: true, .. })
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connects_after_nine_failed_handshakes() {
    let stub =
        Stub::Serve { drop_first: 9, name: "Pixel", frames: vec![], hang_up: false, control: ControlPeer::Record };
    let mut h = harness(MockBridge::new(&["ABC123"], vec![stub]));

    h.engine.connect().await.expect("tenth attempt succeeds");

    assert_eq!(h.bridge.stats.video_attempts.load(Ordering::SeqCst), 10);
    assert_eq!(
        h.engine.state(),
        ConnectionState::Running { serial: "ABC123".into(), device_name: "Pixel".into() }
    );
    assert!(h.engine.is_running());
    assert_eq!(h.bridge.started().len(), 1);

    h.engine.disconnect().await;
    assert_eq!(h.engine.state(), ConnectionState::Idle);
    assert!(h.bridge.killed(0));
    let _ = drain_now(&mut h.events);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_handshake_carries_server_log() {
    let mut bridge = MockBridge::new(&["ABC123"], vec![Stub::Refuse]);
    bridge.stderr_seed = vec!["INFO: Device: [mock] Mock Phone (Android 14)".into()];
    let h = harness(bridge);

    let err = h.engine.connect().await.expect_err("no listener, every attempt fails");
    match err {
        DroidLinkError::HandshakeFailed { attempts, server_alive, log } => {
            assert_eq!(attempts, 10);
            assert!(server_alive);
            assert!(log.contains("Mock Phone (Android 14)"), "log was {log:?}");
        }
        other => panic!("expected HandshakeFailed, got {other}"),
    }

    assert_eq!(h.engine.state(), ConnectionState::Idle);
    assert!(h.bridge.killed(0));
    let port = h.bridge.forwards.lock().unwrap()[0].0;
    assert!(h.bridge.removed.lock().unwrap().contains(&port));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exited_server_is_reported_as_crash() {
    let mut bridge = MockBridge::new(&["ABC123"], vec![Stub::Refuse]);
    bridge.exit_on_start = Some(1);
    let h = harness(bridge);

    let err = h.engine.connect().await.expect_err("server is dead");
    assert!(matches!(err, DroidLinkError::ServerCrashed { exit_code: Some(1), .. }), "got {err}");
    assert_eq!(h.engine.state(), ConnectionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_device_fails_before_launch() {
    let h = harness(MockBridge::new(&[], vec![Stub::Refuse]));

    let err = h.engine.connect().await.expect_err("no device attached");
    assert!(matches!(err, DroidLinkError::NoDevice));
    assert!(err.is_preflight());
    assert!(h.bridge.started().is_empty());
    assert!(h.bridge.forwards.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_rotation_and_control_end_to_end() {
    let frames = [CONFIG, (1280, 720), (720, 1280)];
    let stub = Stub::Serve {
        drop_first: 0,
        name: "ABC Phone",
        frames: frames.to_vec(),
        hang_up: false,
        control: ControlPeer::Record,
    };
    let mut h = harness(MockBridge::new(&["ABC123"], vec![stub]));

    h.engine.connect().await.expect("connects");
    assert_eq!(h.engine.device_serial().as_deref(), Some("ABC123"));

    let mut ready = 0;
    let mut seen = wait_for(&mut h.events, "two frames", |e| {
        if matches!(e, SessionEvent::FrameReady { .. }) {
            ready += 1;
        }
        ready == 2
    })
    .await;
    seen.extend(drain_now(&mut h.events));

    let sizes: Vec<(u32, u32)> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::FrameReady { width, height, .. } => Some((*width, *height)),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, [(1280, 720), (720, 1280)]);

    let rotations: Vec<&SessionEvent> =
        seen.iter().filter(|e| matches!(e, SessionEvent::RotationDetected { .. })).collect();
    assert_eq!(rotations, vec![&SessionEvent::RotationDetected { width: 720, height: 1280 }]);

    assert!(seen.contains(&SessionEvent::ConnectionChanged {
        connected: true,
        device_label: Some("ABC Phone (ABC123)".into()),
    }));
    assert_eq!(*h.renderers.presented.lock().unwrap(), [(1280, 720), (720, 1280)]);

    let args = &h.bridge.started()[0];
    let scid = args.iter().find_map(|a| a.strip_prefix("scid=")).expect("scid argument");
    assert!(args.contains(&"control=true".to_string()));
    assert_eq!(h.bridge.forwards.lock().unwrap()[0].1, format!("scrcpy_{scid:0>8}"));

    h.engine.press_key(3).await.expect("home key");
    h.engine.rotate().await.expect("rotate");
    wait_until("control bytes", || h.bridge.stats.control.lock().unwrap().len() >= 29).await;

    let wire = h.bridge.stats.control.lock().unwrap().clone();
    let mut offset = 0;
    let mut messages = Vec::new();
    while let Some((msg, used)) = ControlMessage::decode(&wire[offset..]) {
        messages.push(msg);
        offset += used;
    }
    assert_eq!(
        messages,
        vec![
            ControlMessage::InjectKeycode { action: KeyAction::Down, keycode: 3, meta_state: 0 },
            ControlMessage::InjectKeycode { action: KeyAction::Up, keycode: 3, meta_state: 0 },
            ControlMessage::RotateDevice,
        ]
    );

    h.engine.disconnect().await;
    let after = drain_now(&mut h.events);
    assert!(after.contains(&SessionEvent::ConnectionChanged { connected: false, device_label: None }));
    assert!(h.engine.device_serial().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encoder_failure_restarts_once_in_compat_mode() {
    let mut h = harness(MockBridge::new(&["ABC123"], vec![Stub::serving(&[(1080, 2340)])]));
    h.engine.connect().await.expect("connects");
    assert!(!h.engine.is_compat_mode());

    let mut stderr = h.bridge.stderr_writer(0);
    stderr.write_all(b"ERROR: Video encoding error\n").await.unwrap();
    stderr.write_all(b"ERROR: Video encoding error\n").await.unwrap();

    wait_for(&mut h.events, "compat fallback", |e| {
        *e == SessionEvent::StateChanged(ConnectionState::CompatFallback)
    })
    .await;
    wait_for(&mut h.events, "compat reconnect", is_connected_event).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = h.bridge.started();
    assert_eq!(started.len(), 2, "exactly one compat restart");
    assert!(!started[0].iter().any(|a| a.starts_with("video_encoder=")));
    for expected in ["max_size=800", "video_bit_rate=2000000", "max_fps=30", "video_encoder=OMX.google.h264.encoder"] {
        assert!(started[1].iter().any(|a| a == expected), "missing {expected} in {:?}", started[1]);
    }
    assert!(h.bridge.killed(0));
    assert!(h.engine.is_compat_mode());
    assert!(h.engine.is_running());

    h.engine.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encoder_failure_during_handshake_falls_back() {
    let mut bridge = MockBridge::new(&["ABC123"], vec![Stub::Refuse, Stub::serving(&[(800, 480)])]);
    bridge.stderr_seed = vec!["ERROR: Video encoding error".into()];
    let mut h = harness(bridge);

    let err = h.engine.connect().await.expect_err("first launch reports the encoder error");
    assert!(matches!(err, DroidLinkError::EncoderFailure | DroidLinkError::Superseded), "got {err}");

    wait_for(&mut h.events, "compat session", is_connected_event).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = h.bridge.started();
    assert_eq!(started.len(), 2, "exactly one compat launch");
    assert!(!started[0].iter().any(|a| a.starts_with("video_encoder=")));
    assert!(started[1].iter().any(|a| a == "video_encoder=OMX.google.h264.encoder"));
    assert!(h.bridge.killed(0));
    assert!(h.engine.is_compat_mode());
    assert!(h.engine.is_running());

    h.engine.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_control_socket_leaves_video_running() {
    let stub = Stub::with_control(&[(640, 480)], ControlPeer::Refuse);
    let mut h = harness(MockBridge::new(&["ABC123"], vec![stub]));
    h.engine.connect().await.expect("video alone is enough");

    let seen = wait_for(&mut h.events, "first frame", |e| matches!(e, SessionEvent::FrameReady { .. })).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::Log(msg) if msg.starts_with("Control channel unavailable"))));
    assert!(matches!(h.engine.state(), ConnectionState::Running { .. }));

    let err = h.engine.rotate().await.expect_err("no control socket");
    assert!(matches!(err, DroidLinkError::Transport(TransportError::NotConnected)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.engine.is_running(), "a missing control socket must not end the session");
    assert_eq!(h.bridge.started().len(), 1);

    h.engine.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_write_failure_reconnects() {
    let stubs = vec![Stub::with_control(&[(640, 480)], ControlPeer::HangUp), Stub::serving(&[(640, 480)])];
    let mut h = harness(MockBridge::new(&["ABC123"], stubs));
    h.engine.connect().await.expect("connects");

    let mut failure = None;
    for _ in 0..50 {
        match h.engine.rotate().await {
            Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let err = failure.expect("writes to a closed control peer must fail");
    assert!(matches!(err, DroidLinkError::Transport(TransportError::SendFailed { .. })), "got {err}");

    wait_for(&mut h.events, "connection lost", |e| {
        matches!(e, SessionEvent::Log(msg) if msg.starts_with("Connection lost: control write failed"))
    })
    .await;
    wait_for(&mut h.events, "reconnected", |e| {
        matches!(e, SessionEvent::Log(msg) if msg == "Reconnected successfully")
    })
    .await;

    assert_eq!(h.bridge.started().len(), 2);
    assert!(h.bridge.killed(0));
    assert!(h.engine.is_running());
    h.engine.rotate().await.expect("the new session has a working control socket");

    h.engine.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_connection_reconnects() {
    let stubs = vec![Stub::hanging_up(&[(640, 480)]), Stub::serving(&[(640, 480)])];
    let mut h = harness(MockBridge::new(&["ABC123"], stubs));
    h.engine.connect().await.expect("connects");

    wait_for(&mut h.events, "first reconnect attempt", |e| {
        *e == SessionEvent::StateChanged(ConnectionState::Reconnecting { attempt: 1, max_attempts: 3 })
    })
    .await;
    wait_for(&mut h.events, "reconnected", |e| {
        matches!(e, SessionEvent::Log(msg) if msg == "Reconnected successfully")
    })
    .await;

    assert_eq!(h.bridge.started().len(), 2);
    assert!(h.bridge.killed(0));
    assert!(h.engine.is_running());

    h.engine.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_gives_up_after_three_attempts() {
    let stubs = vec![Stub::hanging_up(&[(640, 480)]), Stub::Refuse];
    let mut h = harness(MockBridge::new(&["ABC123"], stubs));
    h.engine.connect().await.expect("connects");

    let seen = wait_for(&mut h.events, "permanent disconnect", |e| {
        matches!(e, SessionEvent::PermanentDisconnect { .. })
    })
    .await;

    assert_eq!(h.bridge.started().len(), 4, "initial launch plus three reconnects");
    assert_eq!(h.engine.state(), ConnectionState::Idle);
    assert!(seen.contains(&SessionEvent::ConnectionChanged { connected: false, device_label: None }));
    for i in 0..4 {
        assert!(h.bridge.killed(i), "process {i} left running");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_is_idempotent() {
    let mut h = harness(MockBridge::new(&["ABC123"], vec![Stub::serving(&[])]));
    h.engine.disconnect().await;
    assert!(drain_now(&mut h.events).is_empty());

    h.engine.connect().await.expect("connects");
    h.engine.disconnect().await;
    h.engine.disconnect().await;

    let disconnects = drain_now(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::ConnectionChanged { connected: false, .. }))
        .count();
    assert_eq!(disconnects, 1);
    assert_eq!(h.engine.state(), ConnectionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_without_session_is_rejected() {
    let h = harness(MockBridge::new(&["ABC123"], vec![Stub::Refuse]));
    let err = h.engine.rotate().await.expect_err("no session");
    assert!(matches!(err, DroidLinkError::Transport(TransportError::NotConnected)));
}
