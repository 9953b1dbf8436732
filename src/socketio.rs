//! Socket.IO client over Engine.IO v4 HTTP long-polling.
//!
//! Only what the vendor's realtime endpoint needs:
//! - polling transport (no websocket upgrade), bearer token on every request
//! - several namespaces multiplexed over one engine session
//! - events, with optional acknowledgements in both directions
//!
//! There is no reconnection. A failed poll ends the session; handlers see a disconnect for
//! every namespace and then `on_transport_closed`.

use log::{debug, warn};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::client::read_response;

const RECORD_SEPARATOR: char = '\u{1e}';
const ENGINE_PROTOCOL: &str = "4";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel for '{0}' is not connected")]
    NotConnected(String),
    #[error("channel closed")]
    Closed,
}

impl From<ureq::Error> for ChannelError {
    fn from(value: ureq::Error) -> Self {
        ChannelError::Transport(value.to_string())
    }
}

// =====================
// Engine.IO framing
// =====================

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(String),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
    Binary(String),
}

impl EnginePacket {
    fn encode(&self) -> String {
        match self {
            EnginePacket::Open(s) => format!("0{}", s),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(s) => format!("2{}", s),
            EnginePacket::Pong(s) => format!("3{}", s),
            EnginePacket::Message(s) => format!("4{}", s),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
            EnginePacket::Binary(s) => format!("b{}", s),
        }
    }
}

/// Split a polling payload into engine packets.
pub fn parse_engine_payload(body: &str) -> Result<Vec<EnginePacket>, ChannelError> {
    body.split(RECORD_SEPARATOR)
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            let mut chars = raw.chars();
            let kind = chars.next().unwrap_or_default();
            let rest = chars.as_str().to_string();
            match kind {
                '0' => Ok(EnginePacket::Open(rest)),
                '1' => Ok(EnginePacket::Close),
                '2' => Ok(EnginePacket::Ping(rest)),
                '3' => Ok(EnginePacket::Pong(rest)),
                '4' => Ok(EnginePacket::Message(rest)),
                '5' => Ok(EnginePacket::Upgrade),
                '6' => Ok(EnginePacket::Noop),
                'b' => Ok(EnginePacket::Binary(rest)),
                other => Err(ChannelError::Protocol(format!("unknown engine packet type '{}'", other))),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    sid: String,
    #[serde(default)]
    ping_interval: Option<u64>,
    #[serde(default)]
    ping_timeout: Option<u64>,
}

// =====================
// Socket.IO framing
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(PacketKind::Connect),
            '1' => Some(PacketKind::Disconnect),
            '2' => Some(PacketKind::Event),
            '3' => Some(PacketKind::Ack),
            '4' => Some(PacketKind::ConnectError),
            '5' => Some(PacketKind::BinaryEvent),
            '6' => Some(PacketKind::BinaryAck),
            _ => None,
        }
    }

    fn digit(self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::ConnectError => '4',
            PacketKind::BinaryEvent => '5',
            PacketKind::BinaryAck => '6',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: PacketKind,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    pub fn connect(namespace: &str) -> Self {
        SocketPacket {
            kind: PacketKind::Connect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: None,
        }
    }

    pub fn event(namespace: &str, event: &str, payload: Value, ack_id: Option<u64>) -> Self {
        SocketPacket {
            kind: PacketKind::Event,
            namespace: namespace.to_string(),
            ack_id,
            data: Some(Value::Array(vec![Value::String(event.to_string()), payload])),
        }
    }

    fn ack(namespace: &str, ack_id: u64) -> Self {
        SocketPacket {
            kind: PacketKind::Ack,
            namespace: namespace.to_string(),
            ack_id: Some(ack_id),
            data: Some(Value::Array(Vec::new())),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .and_then(PacketKind::from_digit)
            .ok_or_else(|| ChannelError::Protocol(format!("invalid socket packet: {}", raw)))?;
        let mut rest = chars.as_str();

        if matches!(kind, PacketKind::BinaryEvent | PacketKind::BinaryAck)
            && let Some(pos) = rest.find('-')
            && rest[..pos].bytes().all(|b| b.is_ascii_digit())
        {
            rest = &rest[pos + 1..];
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(i) => {
                    let ns = &rest[..i];
                    rest = &rest[i + 1..];
                    ns
                }
                None => {
                    let ns = rest;
                    rest = "";
                    ns
                }
            }
        } else {
            "/"
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| ChannelError::Protocol(format!("invalid ack id: {}", e)))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest).map_err(|e| ChannelError::Protocol(format!("invalid packet data: {}", e)))?)
        };

        Ok(SocketPacket {
            kind,
            namespace: namespace.to_string(),
            ack_id,
            data,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }
}

// =====================
// Client
// =====================

/// Receives everything that arrives on a channel. Called on the channel's reader thread.
pub trait ChannelHandler: Send + Sync {
    fn on_connect(&self, namespace: &str) {
        let _ = namespace;
    }

    fn on_connect_error(&self, namespace: &str, data: Option<&Value>) {
        let _ = (namespace, data);
    }

    fn on_disconnect(&self, namespace: &str) {
        let _ = namespace;
    }

    /// The engine session is gone; nothing else will be delivered.
    fn on_transport_closed(&self) {}

    fn on_event(&self, namespace: &str, event: &str, payload: &Value);
}

pub type AckCallback = Box<dyn FnOnce(Option<&Value>) + Send>;

struct Session {
    agent: ureq::Agent,
    endpoint: String,
    token: String,
    sid: String,
    namespaces: Vec<String>,
    handler: Arc<dyn ChannelHandler>,
    closed: AtomicBool,
    finished: AtomicBool,
    next_ack: AtomicU64,
    acks: Mutex<HashMap<u64, AckCallback>>,
    /// The server accepts one POST per sid at a time; overlapping ones close the session.
    post_lock: Mutex<()>,
}

fn cache_buster() -> String {
    format!("{:x}", rand::rng().random::<u64>())
}

fn handshake(agent: &ureq::Agent, endpoint: &str, token: &str) -> Result<(Handshake, Vec<EnginePacket>), ChannelError> {
    let resp = agent
        .get(endpoint)
        .query("EIO", ENGINE_PROTOCOL)
        .query("transport", "polling")
        .query("t", cache_buster())
        .header("Authorization", &format!("Bearer {}", token))
        .call();
    let (status, body) = read_response(resp)?;
    if !status.is_success() {
        return Err(ChannelError::Http {
            status: status.as_u16(),
            message: body,
        });
    }
    let mut open = None;
    let mut leftover = Vec::new();
    for packet in parse_engine_payload(&body)? {
        match packet {
            EnginePacket::Open(raw) if open.is_none() => open = Some(raw),
            other => leftover.push(other),
        }
    }
    let raw = open.ok_or_else(|| ChannelError::Protocol("handshake did not carry an open packet".to_string()))?;
    let handshake: Handshake =
        serde_json::from_str(&raw).map_err(|e| ChannelError::Protocol(format!("invalid open packet: {}", e)))?;
    Ok((handshake, leftover))
}

impl Session {
    fn post(&self, packets: &[EnginePacket]) -> Result<(), ChannelError> {
        let _serial = self.post_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let body = packets
            .iter()
            .map(EnginePacket::encode)
            .collect::<Vec<_>>()
            .join(&RECORD_SEPARATOR.to_string());
        let resp = self
            .agent
            .post(&self.endpoint)
            .query("EIO", ENGINE_PROTOCOL)
            .query("transport", "polling")
            .query("t", cache_buster())
            .query("sid", &self.sid)
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Content-Type", "text/plain;charset=UTF-8")
            .send(body.as_str());
        let (status, reply) = read_response(resp)?;
        if !status.is_success() {
            return Err(ChannelError::Http {
                status: status.as_u16(),
                message: reply,
            });
        }
        Ok(())
    }

    fn poll(&self) -> Result<Vec<EnginePacket>, ChannelError> {
        let resp = self
            .agent
            .get(&self.endpoint)
            .query("EIO", ENGINE_PROTOCOL)
            .query("transport", "polling")
            .query("t", cache_buster())
            .query("sid", &self.sid)
            .header("Authorization", &format!("Bearer {}", self.token))
            .call();
        let (status, body) = read_response(resp)?;
        if !status.is_success() {
            return Err(ChannelError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        parse_engine_payload(&body)
    }

    /// Handle a batch of engine packets; returns `false` once the server closed the session.
    fn handle_packets(&self, packets: Vec<EnginePacket>) -> bool {
        let mut replies = Vec::new();
        let mut open = true;
        for packet in packets {
            match packet {
                EnginePacket::Ping(payload) => replies.push(EnginePacket::Pong(payload)),
                EnginePacket::Close => {
                    debug!("Engine session {} closed by server", self.sid);
                    open = false;
                }
                EnginePacket::Message(raw) => match SocketPacket::parse(&raw) {
                    Ok(packet) => {
                        if let Some(reply) = self.route(packet) {
                            replies.push(EnginePacket::Message(reply.encode()));
                        }
                    }
                    Err(e) => warn!("Dropping realtime message on session {}: {}", self.sid, e),
                },
                EnginePacket::Binary(_) => debug!("Ignoring binary payload on session {}", self.sid),
                EnginePacket::Open(_) | EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
            }
        }
        if !replies.is_empty()
            && let Err(e) = self.post(&replies)
        {
            warn!("Failed to answer server on session {}: {}", self.sid, e);
        }
        open
    }

    /// Deliver one socket packet to the handler; returns the packet to send back, if any.
    fn route(&self, packet: SocketPacket) -> Option<SocketPacket> {
        let ns = packet.namespace.as_str();
        match packet.kind {
            PacketKind::Connect => {
                self.handler.on_connect(ns);
                None
            }
            PacketKind::ConnectError => {
                self.handler.on_connect_error(ns, packet.data.as_ref());
                None
            }
            PacketKind::Disconnect => {
                self.handler.on_disconnect(ns);
                None
            }
            PacketKind::Event | PacketKind::BinaryEvent => {
                let args = match packet.data {
                    Some(Value::Array(args)) => args,
                    other => {
                        warn!("Event without argument list on '{}': {:?}", ns, other);
                        return None;
                    }
                };
                let mut args = args.into_iter();
                let Some(Value::String(event)) = args.next() else {
                    warn!("Event without a name on '{}'", ns);
                    return None;
                };
                let payload = args.next().unwrap_or(Value::Null);
                self.handler.on_event(ns, &event, &payload);
                packet.ack_id.map(|id| SocketPacket::ack(ns, id))
            }
            PacketKind::Ack | PacketKind::BinaryAck => {
                let Some(id) = packet.ack_id else {
                    warn!("Acknowledgement without id on '{}'", ns);
                    return None;
                };
                let callback = self.acks.lock().ok().and_then(|mut acks| acks.remove(&id));
                match callback {
                    Some(callback) => {
                        let first = match &packet.data {
                            Some(Value::Array(args)) => args.first(),
                            other => other.as_ref(),
                        };
                        callback(first);
                    }
                    None => debug!("Acknowledgement {} on '{}' has no pending callback", id, ns),
                }
                None
            }
        }
    }

    /// Report the end of the session exactly once.
    fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut acks) = self.acks.lock() {
            acks.clear();
        }
        for ns in &self.namespaces {
            self.handler.on_disconnect(ns);
        }
        self.handler.on_transport_closed();
    }
}

fn reader_loop(session: Arc<Session>) {
    while !session.closed.load(Ordering::SeqCst) {
        match session.poll() {
            Ok(packets) => {
                if !session.handle_packets(packets) {
                    break;
                }
            }
            Err(e) => {
                if !session.closed.load(Ordering::SeqCst) {
                    warn!("Realtime poll on session {} failed: {}", session.sid, e);
                }
                break;
            }
        }
    }
    session.finish();
}

/// One engine session carrying one or more namespaces, with a background reader thread.
pub struct SocketIoClient {
    session: Arc<Session>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketIoClient {
    pub fn connect(
        agent: &ureq::Agent,
        endpoint: &str,
        token: &str,
        namespaces: &[String],
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Self, ChannelError> {
        let (hs, leftover) = handshake(agent, endpoint, token)?;
        debug!(
            "Engine session {} opened (ping_interval={}ms, ping_timeout={}ms)",
            hs.sid,
            hs.ping_interval.unwrap_or_default(),
            hs.ping_timeout.unwrap_or_default()
        );

        let session = Arc::new(Session {
            agent: agent.clone(),
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            sid: hs.sid,
            namespaces: namespaces.to_vec(),
            handler,
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            next_ack: AtomicU64::new(0),
            acks: Mutex::new(HashMap::new()),
            post_lock: Mutex::new(()),
        });

        let joins = namespaces
            .iter()
            .map(|ns| EnginePacket::Message(SocketPacket::connect(ns).encode()))
            .collect::<Vec<_>>();
        if !joins.is_empty() {
            session.post(&joins)?;
        }
        session.handle_packets(leftover);

        let reader_session = Arc::clone(&session);
        let reader = thread::Builder::new()
            .name(format!("socketio-{}", session.sid))
            .spawn(move || reader_loop(reader_session))
            .map_err(|e| ChannelError::Transport(format!("spawning reader thread failed: {}", e)))?;

        Ok(SocketIoClient {
            session,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn sid(&self) -> &str {
        &self.session.sid
    }

    pub fn is_connected(&self) -> bool {
        !self.session.closed.load(Ordering::SeqCst)
    }

    /// Emit `event` on `namespace`; `ack` runs on the reader thread when the server answers.
    pub fn emit(&self, namespace: &str, event: &str, payload: Value, ack: Option<AckCallback>) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }
        let ack_id = match ack {
            Some(callback) => {
                let id = self.session.next_ack.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut acks) = self.session.acks.lock() {
                    acks.insert(id, callback);
                }
                Some(id)
            }
            None => None,
        };
        let packet = SocketPacket::event(namespace, event, payload, ack_id);
        let result = self.session.post(&[EnginePacket::Message(packet.encode())]);
        if result.is_err()
            && let Some(id) = ack_id
            && let Ok(mut acks) = self.session.acks.lock()
        {
            acks.remove(&id);
        }
        result
    }

    /// Close the engine session. The reader thread is detached: it may still be parked in a
    /// long poll and exits when that returns.
    pub fn close(&self) {
        if !self.is_connected() {
            return;
        }
        self.session.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.session.post(&[EnginePacket::Close]) {
            debug!("Closing engine session {} failed: {}", self.session.sid, e);
        }
        self.session.finish();
        if let Ok(mut reader) = self.reader.lock() {
            let _detached = reader.take();
        }
    }
}

impl Drop for SocketIoClient {
    fn drop(&mut self) {
        self.close();
    }
}
