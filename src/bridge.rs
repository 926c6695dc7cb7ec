// AI WebSocket bridge: one authenticated session per call, with bounded
// queues, keepalive and reconnection

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::{CallDirection, CallId, Error, Result};

type HmacSha256 = Hmac<Sha256>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEEPALIVE_POLL: Duration = Duration::from_secs(5);
const MAX_MISSED_PONGS: u32 = 3;
const CLOSE_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Authenticated,
    Streaming,
    Reconnecting,
    Closed,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Connecting => "connecting",
            BridgeState::Authenticated => "authenticated",
            BridgeState::Streaming => "streaming",
            BridgeState::Reconnecting => "reconnecting",
            BridgeState::Closed => "closed",
        }
    }
}

/// Events the bridge raises to its owning call.
#[derive(Debug)]
pub enum BridgeOut {
    /// auth_ok received; audio may flow.
    Streaming,
    Reconnecting,
    /// Decoded PCM16@16k from the AI.
    EgressAudio(Vec<i16>),
    Hangup,
    Transfer(String),
    DtmfRequest(char),
    Control(serde_json::Value),
    AuthFailed,
    Unrecoverable(String),
    Closed,
}

/// Call identity carried in the auth frame.
#[derive(Debug, Clone)]
pub struct BridgeCallInfo {
    pub call_id: CallId,
    pub from_number: String,
    pub to_number: String,
    pub direction: CallDirection,
    pub codec: String,
}

// Outbound JSON frames

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutbound {
    Auth {
        auth: AuthPayload,
        call: CallDescriptor,
    },
    AudioData {
        data: AudioData,
    },
    Dtmf {
        data: DtmfData,
    },
    CallState {
        data: CallStateData,
    },
    Ping,
}

#[derive(Debug, Serialize)]
struct AuthPayload {
    token: String,
    signature: String,
    timestamp: String,
    call_id: String,
}

#[derive(Debug, Serialize)]
struct CallDescriptor {
    conversation_id: String,
    from_number: String,
    to_number: String,
    direction: String,
    codec: String,
    sample_rate: u32,
}

#[derive(Debug, Serialize)]
struct AudioData {
    call_id: String,
    audio: String,
    timestamp: f64,
    sequence: u64,
}

#[derive(Debug, Serialize)]
struct DtmfData {
    call_id: String,
    digit: String,
    duration_ms: u32,
    method: String,
}

#[derive(Debug, Serialize)]
struct CallStateData {
    call_id: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// HMAC-SHA256 over `call_id || "." || timestamp`.
pub fn sign_auth(secret: &str, call_id: &str, timestamp: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(call_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// Control-lane messages never drop; audio rides a bounded deque.
#[derive(Debug)]
enum Command {
    Control(WsOutbound),
    Close,
}

struct AudioQueue {
    frames: StdMutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl AudioQueue {
    fn push(&self, frame: Vec<u8>) {
        {
            let mut frames = self.frames.lock().unwrap();
            if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.frames.lock().unwrap().pop_front()
    }
}

pub struct BridgeSession {
    call_id: CallId,
    command_tx: mpsc::UnboundedSender<Command>,
    audio: Arc<AudioQueue>,
    unknown_frames: Arc<AtomicU64>,
}

impl BridgeSession {
    /// Open the bridge for one call. Events arrive on `out_tx`; the session
    /// runs until closed or unrecoverable.
    pub fn spawn(
        config: BridgeConfig,
        info: BridgeCallInfo,
        out_tx: mpsc::Sender<BridgeOut>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let audio = Arc::new(AudioQueue {
            frames: StdMutex::new(VecDeque::new()),
            capacity: config.queue_depth.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        let unknown_frames = Arc::new(AtomicU64::new(0));

        let session = Arc::new(BridgeSession {
            call_id: info.call_id.clone(),
            command_tx,
            audio: audio.clone(),
            unknown_frames: unknown_frames.clone(),
        });

        let supervisor = Supervisor {
            config,
            info,
            out_tx,
            audio,
            unknown_frames,
            sequence: 0,
            pending_controls: Vec::new(),
        };
        tokio::spawn(supervisor.run(command_rx));

        session
    }

    /// Queue one PCM16@16k frame toward the AI. Never blocks; the oldest
    /// frame gives way when the queue is full.
    pub fn send_audio(&self, pcm: &[i16]) {
        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.audio.push(bytes);
    }

    pub fn send_dtmf(&self, digit: char, duration_ms: u32, method: &str) {
        let frame = WsOutbound::Dtmf {
            data: DtmfData {
                call_id: self.call_id.0.clone(),
                digit: digit.to_string(),
                duration_ms,
                method: method.to_string(),
            },
        };
        let _ = self.command_tx.send(Command::Control(frame));
    }

    pub fn send_call_state(&self, state: &str, reason: Option<String>) {
        let frame = WsOutbound::CallState {
            data: CallStateData {
                call_id: self.call_id.0.clone(),
                state: state.to_string(),
                reason,
            },
        };
        let _ = self.command_tx.send(Command::Control(frame));
    }

    /// Graceful close: WS close 1000, bounded drain, reconnects cancelled.
    pub fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
    }

    pub fn dropped_audio_frames(&self) -> u64 {
        self.audio.dropped.load(Ordering::Relaxed)
    }

    pub fn unknown_frame_count(&self) -> u64 {
        self.unknown_frames.load(Ordering::Relaxed)
    }
}

enum SessionExit {
    /// Commanded close completed.
    Closed,
    /// The backend rejected or ignored our auth frame.
    AuthFailed,
    /// Transport-level failure; candidate for reconnection. `streamed`
    /// means auth_ok had been reached, which resets the attempt budget.
    Transport { reason: String, streamed: bool },
}

struct Supervisor {
    config: BridgeConfig,
    info: BridgeCallInfo,
    out_tx: mpsc::Sender<BridgeOut>,
    audio: Arc<AudioQueue>,
    unknown_frames: Arc<AtomicU64>,
    sequence: u64,
    /// Control frames received while disconnected; flushed after re-auth.
    pending_controls: Vec<WsOutbound>,
}

impl Supervisor {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;

        loop {
            let (reason, streamed) = match self.connect_and_stream(&mut command_rx).await {
                Ok(SessionExit::Closed) => {
                    let _ = self.out_tx.send(BridgeOut::Closed).await;
                    return;
                }
                Ok(SessionExit::AuthFailed) => {
                    let _ = self.out_tx.send(BridgeOut::AuthFailed).await;
                    return;
                }
                Ok(SessionExit::Transport { reason, streamed }) => (reason, streamed),
                Err(e) => (e.to_string(), false),
            };

            // A fresh outage after a healthy stream starts its own budget
            attempt = if streamed { 1 } else { attempt + 1 };
            if attempt > self.config.reconnect_max_attempts {
                warn!(call_id = %self.info.call_id, reason, "bridge out of reconnect attempts");
                let _ = self.out_tx.send(BridgeOut::Unrecoverable(reason)).await;
                return;
            }
            debug!(call_id = %self.info.call_id, attempt, reason, "bridge reconnecting");
            let _ = self.out_tx.send(BridgeOut::Reconnecting).await;

            // Exponential backoff with +/-20% jitter; a close cancels it
            let base = self
                .config
                .reconnect_initial_ms
                .saturating_mul(1u64 << (attempt - 1).min(16))
                .min(self.config.reconnect_cap_ms);
            let jitter = rand::thread_rng().gen_range(0.8..=1.2);
            let deadline = Instant::now() + Duration::from_millis((base as f64 * jitter) as u64);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    command = command_rx.recv() => match command {
                        Some(Command::Close) | None => {
                            let _ = self.out_tx.send(BridgeOut::Closed).await;
                            return;
                        }
                        Some(Command::Control(frame)) => {
                            // Held for delivery once the stream is back
                            self.pending_controls.push(frame);
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<SessionExit> {
        let (mut ws, _) = connect_async(self.config.endpoint_url.as_str())
            .await
            .map_err(|e| Error::Bridge(format!("connect: {}", e)))?;

        // First frame is always auth
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let auth = WsOutbound::Auth {
            auth: AuthPayload {
                token: self.config.bearer_token.clone(),
                signature: sign_auth(&self.config.shared_secret, &self.info.call_id.0, &timestamp),
                timestamp,
                call_id: self.info.call_id.0.clone(),
            },
            call: CallDescriptor {
                conversation_id: self.info.call_id.0.clone(),
                from_number: self.info.from_number.clone(),
                to_number: self.info.to_number.clone(),
                direction: self.info.direction.as_str().to_string(),
                codec: self.info.codec.clone(),
                sample_rate: 16_000,
            },
        };
        self.send_frame(&mut ws, &auth).await?;

        // The backend must answer auth_ok within the handshake window
        let handshake = Duration::from_secs(self.config.handshake_timeout_secs);
        match timeout(handshake, self.await_auth_ok(&mut ws)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) | Err(_) => {
                let _ = ws.close(None).await;
                return Ok(SessionExit::AuthFailed);
            }
            Ok(Err(e)) => return Err(e),
        }

        info!(call_id = %self.info.call_id, "bridge streaming");
        let _ = self.out_tx.send(BridgeOut::Streaming).await;

        self.stream(&mut ws, command_rx).await
    }

    async fn await_auth_ok(&self, ws: &mut WsStream) -> Result<bool> {
        while let Some(message) = ws.next().await {
            let message = message.map_err(|e| Error::Bridge(format!("handshake: {}", e)))?;
            if let Message::Text(text) = message {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => return Ok(false),
                };
                match value.get("type").and_then(|t| t.as_str()) {
                    Some("auth_ok") => return Ok(true),
                    Some("error") => return Ok(false),
                    _ => {
                        self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn stream(
        &mut self,
        ws: &mut WsStream,
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<SessionExit> {
        let lost = |reason: String| -> Result<SessionExit> {
            Ok(SessionExit::Transport {
                reason,
                streamed: true,
            })
        };

        // Control frames held across the outage go out first
        while !self.pending_controls.is_empty() {
            let frame = self.pending_controls.remove(0);
            if let Err(e) = self.send_frame(ws, &frame).await {
                self.pending_controls.insert(0, frame);
                return lost(e.to_string());
            }
        }

        let audio = self.audio.clone();
        let mut keepalive = interval(KEEPALIVE_POLL);
        let idle_window = Duration::from_secs(self.config.idle_timeout_secs);
        let mut last_traffic = Instant::now();
        let mut pending_pings: u32 = 0;

        loop {
            tokio::select! {
                biased;

                command = command_rx.recv() => {
                    match command {
                        Some(Command::Control(frame)) => {
                            if let Err(e) = self.send_frame(ws, &frame).await {
                                self.pending_controls.push(frame);
                                return lost(e.to_string());
                            }
                            last_traffic = Instant::now();
                        }
                        Some(Command::Close) | None => {
                            self.graceful_close(ws).await;
                            return Ok(SessionExit::Closed);
                        }
                    }
                }

                _ = audio.notify.notified() => {
                    while let Some(frame) = audio.pop() {
                        let out = WsOutbound::AudioData {
                            data: AudioData {
                                call_id: self.info.call_id.0.clone(),
                                audio: BASE64.encode(&frame),
                                timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                                sequence: self.sequence,
                            },
                        };
                        self.sequence += 1;
                        if let Err(e) = self.send_frame(ws, &out).await {
                            return lost(e.to_string());
                        }
                    }
                    last_traffic = Instant::now();
                }

                message = ws.next() => {
                    let message = match message {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return lost(e.to_string()),
                        None => return lost("connection closed".to_string()),
                    };
                    last_traffic = Instant::now();
                    pending_pings = 0;

                    match message {
                        Message::Text(text) => {
                            match self.handle_inbound(&text).await {
                                InboundAction::Continue => {}
                                InboundAction::Malformed => {
                                    // Protocol violation: close 1007 and retry
                                    let _ = ws.close(Some(CloseFrame {
                                        code: CloseCode::Invalid,
                                        reason: "malformed JSON".into(),
                                    })).await;
                                    return lost("malformed frame from backend".to_string());
                                }
                            }
                        }
                        Message::Close(_) => {
                            return lost("peer closed".to_string());
                        }
                        Message::Ping(payload) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        _ => {}
                    }
                }

                _ = keepalive.tick() => {
                    if pending_pings >= MAX_MISSED_PONGS {
                        return lost("keepalive lost".to_string());
                    }
                    if last_traffic.elapsed() >= idle_window {
                        if let Err(e) = self.send_frame(ws, &WsOutbound::Ping).await {
                            return lost(e.to_string());
                        }
                        pending_pings += 1;
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, text: &str) -> InboundAction {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return InboundAction::Malformed,
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("audio_data") => {
                let decoded = value
                    .pointer("/data/audio")
                    .and_then(|a| a.as_str())
                    .and_then(|b64| BASE64.decode(b64).ok());
                match decoded {
                    Some(bytes) if bytes.len() % 2 == 0 => {
                        let pcm: Vec<i16> = bytes
                            .chunks_exact(2)
                            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                            .collect();
                        let _ = self.out_tx.send(BridgeOut::EgressAudio(pcm)).await;
                    }
                    _ => {
                        self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Some("hangup") => {
                let _ = self.out_tx.send(BridgeOut::Hangup).await;
            }
            Some("transfer") => {
                let target = value
                    .pointer("/data/target")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string();
                let _ = self.out_tx.send(BridgeOut::Transfer(target)).await;
            }
            Some("dtmf") => {
                if let Some(digit) = value
                    .pointer("/data/digit")
                    .and_then(|d| d.as_str())
                    .and_then(|s| s.chars().next())
                {
                    let _ = self.out_tx.send(BridgeOut::DtmfRequest(digit)).await;
                }
            }
            Some("control") => {
                let _ = self.out_tx.send(BridgeOut::Control(value)).await;
            }
            Some("pong") | Some("auth_ok") => {}
            _ => {
                self.unknown_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
        InboundAction::Continue
    }

    async fn send_frame(&self, ws: &mut WsStream, frame: &WsOutbound) -> Result<()> {
        let text = serde_json::to_string(frame)
            .map_err(|e| Error::Bridge(format!("serialize: {}", e)))?;
        ws.send(Message::Text(text))
            .await
            .map_err(|e| Error::Bridge(format!("send: {}", e)))
    }

    async fn graceful_close(&self, ws: &mut WsStream) {
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "call ended".into(),
            })))
            .await;
        // Drain whatever the backend still has in flight, bounded
        let _ = timeout(CLOSE_DRAIN, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    }
}

enum InboundAction {
    Continue,
    Malformed,
}
