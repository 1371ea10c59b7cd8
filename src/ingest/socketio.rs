//! Socket.IO (engine.io v4) stream client over a plain WebSocket.
//!
//! Camera nodes broadcast every captured frame as an `image` event. This
//! client speaks just enough of the protocol to receive those events:
//!
//! - `0{..}` engine open, answered with `40` (namespace connect)
//! - `40{..}` namespace connected, reported as `StreamEvent::Connected`
//! - `44{..}` namespace connect error
//! - `2` / `3` engine ping / pong
//! - `42["image", <payload>]` frame, payload is a base64 string or `{"data": ..}`
//! - `451-["image", {"_placeholder":true,"num":0}]` frame sent as a binary attachment
//! - `41` or a WebSocket close, reported as `StreamEvent::Finished`
//!
//! Disconnect emits `42["finished"]` so the camera releases the client, then
//! `41` and a WebSocket close.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::Value;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::stream::{StreamConnection, StreamEvent, StreamTransport};

const DEFAULT_SOCKETIO_PATH: &str = "/socket.io/";
const FRAME_EVENT: &str = "image";
const FINISHED_EVENT: &str = "finished";

/// Connection tunables.
#[derive(Clone, Debug)]
pub struct SocketIoConfig {
    /// TCP connect and WebSocket handshake budget.
    pub connect_timeout: Duration,
    /// Socket read timeout; bounds how long a disconnect request can wait
    /// while the link is idle.
    pub poll_interval: Duration,
}

impl Default for SocketIoConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// `StreamTransport` for Socket.IO camera streams.
#[derive(Clone, Debug, Default)]
pub struct SocketIoTransport {
    config: SocketIoConfig,
}

impl SocketIoTransport {
    pub fn new(config: SocketIoConfig) -> Self {
        Self { config }
    }
}

impl StreamTransport for SocketIoTransport {
    fn name(&self) -> &'static str {
        "socketio"
    }

    fn open(
        &mut self,
        source: &str,
        events: Sender<StreamEvent>,
    ) -> Result<Box<dyn StreamConnection>> {
        let url = socketio_url(source)?;
        let (control_tx, control_rx) = crossbeam_channel::bounded(1);
        let config = self.config.clone();
        thread::Builder::new()
            .name("socketio-reader".to_string())
            .spawn(move || reader_loop(url, config, events, control_rx))
            .context("spawn socketio reader thread")?;
        Ok(Box::new(SocketIoConnection {
            control: control_tx,
        }))
    }
}

struct SocketIoConnection {
    control: Sender<()>,
}

impl StreamConnection for SocketIoConnection {
    fn disconnect(&mut self) -> Result<()> {
        // Full means a request is already queued; disconnected means the
        // reader already exited. Neither needs another request.
        let _ = self.control.try_send(());
        Ok(())
    }
}

/// Build the engine.io WebSocket endpoint for a stream source.
///
/// `http` maps to `ws`. An empty or `/` path uses the default `/socket.io/`
/// endpoint; any other path is taken as a custom Socket.IO path.
pub fn socketio_url(source: &str) -> Result<Url> {
    let mut url = Url::parse(source).with_context(|| format!("parse stream source {}", source))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => {
            return Err(anyhow!(
                "stream source {} requires TLS, which this transport does not support",
                source
            ))
        }
        other => return Err(anyhow!("unsupported stream scheme '{}'", other)),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot rewrite scheme of {}", source))?;

    let path = match url.path() {
        "" | "/" => DEFAULT_SOCKETIO_PATH.to_string(),
        p if p.ends_with('/') => p.to_string(),
        p => format!("{}/", p),
    };
    url.set_path(&path);
    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// Parsed engine.io / Socket.IO text packet.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Open,
    Close,
    Ping,
    Pong,
    Connect,
    Disconnect,
    ConnectError(String),
    Event { name: String, args: Vec<Value> },
    BinaryEvent { name: String, args: Vec<Value>, attachments: usize },
    Other,
}

/// Parse one text frame.
pub fn parse_packet(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let engine = chars.next().ok_or_else(|| anyhow!("empty engine.io packet"))?;
    let rest = chars.as_str();
    match engine {
        '0' => Ok(Packet::Open),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => parse_socket_packet(rest),
        '5' | '6' => Ok(Packet::Other),
        other => Err(anyhow!("unknown engine.io packet type '{}'", other)),
    }
}

fn parse_socket_packet(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or_else(|| anyhow!("empty socket.io packet"))?;
    let mut rest = chars.as_str();

    let mut attachments = 0usize;
    if kind == '5' || kind == '6' {
        let (count, tail) = rest
            .split_once('-')
            .ok_or_else(|| anyhow!("binary packet missing attachment count"))?;
        attachments = count
            .parse()
            .with_context(|| format!("invalid attachment count '{}'", count))?;
        rest = tail;
    }
    // Optional namespace, terminated by ','.
    if rest.starts_with('/') {
        rest = rest.split_once(',').map(|(_, tail)| tail).unwrap_or("");
    }
    // Optional ack id.
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '4' => Ok(Packet::ConnectError(connect_error_message(rest))),
        '2' | '5' => {
            let value: Value =
                serde_json::from_str(rest).context("invalid socket.io event payload")?;
            let mut items = match value {
                Value::Array(items) => items,
                _ => return Err(anyhow!("socket.io event payload is not an array")),
            };
            if items.is_empty() {
                return Err(anyhow!("socket.io event without a name"));
            }
            let name = match items.remove(0) {
                Value::String(name) => name,
                _ => return Err(anyhow!("socket.io event name is not a string")),
            };
            if kind == '2' {
                Ok(Packet::Event { name, args: items })
            } else {
                Ok(Packet::BinaryEvent {
                    name,
                    args: items,
                    attachments,
                })
            }
        }
        _ => Ok(Packet::Other),
    }
}

fn connect_error_message(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| raw.to_string()),
        _ if raw.is_empty() => "namespace connect refused".to_string(),
        _ => raw.to_string(),
    }
}

/// Frame bytes carried inline in an `image` event argument.
///
/// Accepts a bare string or an object with a string `data` field.
pub fn inline_frame(args: &[Value]) -> Option<Vec<u8>> {
    match args.first()? {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_str)
            .map(|s| s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Tracks a binary event while its attachments arrive.
#[derive(Default)]
struct PendingBinary {
    remaining: usize,
    first: Option<Vec<u8>>,
    is_frame: bool,
}

type Socket = WebSocket<TcpStream>;

fn dial(url: &Url, config: &SocketIoConfig) -> Result<Socket> {
    let addrs: Vec<SocketAddr> = url
        .socket_addrs(|| Some(80))
        .with_context(|| format!("resolve {}", url))?;
    let mut last_err = None;
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let stream = match (stream, last_err) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(anyhow!("connect {}: {}", url, e)),
        (None, None) => return Err(anyhow!("{} resolved to no addresses", url)),
    };
    stream
        .set_read_timeout(Some(config.connect_timeout))
        .context("set handshake timeout")?;
    let (socket, _response) = tungstenite::client(url.as_str(), stream)
        .map_err(|e| anyhow!("websocket handshake with {} failed: {}", url, e))?;
    socket
        .get_ref()
        .set_read_timeout(Some(config.poll_interval))
        .context("set poll timeout")?;
    Ok(socket)
}

fn send_text(socket: &mut Socket, text: &str) -> Result<()> {
    socket
        .send(Message::Text(text.to_string()))
        .with_context(|| format!("send '{}'", text))
}

fn close(socket: &mut Socket) {
    let _ = send_text(socket, &format!("42[\"{}\"]", FINISHED_EVENT));
    let _ = send_text(socket, "41");
    let _ = socket.close(None);
    let _ = socket.flush();
}

fn reader_loop(
    url: Url,
    config: SocketIoConfig,
    events: Sender<StreamEvent>,
    control: Receiver<()>,
) {
    log::debug!("connecting to {}", url);
    let mut socket = match dial(&url, &config) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = events.send(StreamEvent::ConnectError(format!("{:#}", e)));
            return;
        }
    };

    let mut connected = false;
    let mut pending: Option<PendingBinary> = None;
    loop {
        match control.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                log::debug!("disconnecting from {}", url);
                close(&mut socket);
                return;
            }
            Err(TryRecvError::Empty) => {}
        }

        let event = match socket.read() {
            Ok(Message::Text(text)) => match parse_packet(&text) {
                Ok(packet) => on_packet(&mut socket, packet, &mut connected, &mut pending),
                Err(e) => {
                    log::warn!("ignoring unparseable packet from {}: {:#}", url, e);
                    None
                }
            },
            Ok(Message::Binary(bytes)) => on_attachment(bytes, &mut pending),
            Ok(Message::Close(_)) => Some(StreamEvent::Finished),
            Ok(_) => None,
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                None
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Some(StreamEvent::Finished)
            }
            Err(e) if connected => Some(StreamEvent::Error(e.to_string())),
            Err(e) => Some(StreamEvent::ConnectError(e.to_string())),
        };

        if let Some(event) = event {
            let terminal = matches!(
                event,
                StreamEvent::Finished | StreamEvent::Error(_) | StreamEvent::ConnectError(_)
            );
            if events.send(event).is_err() {
                // Session is gone; nobody is listening any more.
                close(&mut socket);
                return;
            }
            if terminal {
                let _ = control.recv_timeout(config.poll_interval);
                close(&mut socket);
                return;
            }
        }
    }
}

fn on_packet(
    socket: &mut Socket,
    packet: Packet,
    connected: &mut bool,
    pending: &mut Option<PendingBinary>,
) -> Option<StreamEvent> {
    match packet {
        Packet::Open => {
            if let Err(e) = send_text(socket, "40") {
                return Some(StreamEvent::ConnectError(format!("{:#}", e)));
            }
            None
        }
        Packet::Ping => {
            if let Err(e) = send_text(socket, "3") {
                log::warn!("failed to answer ping: {:#}", e);
            }
            None
        }
        Packet::Connect if !*connected => {
            *connected = true;
            Some(StreamEvent::Connected)
        }
        Packet::ConnectError(reason) => Some(StreamEvent::ConnectError(reason)),
        Packet::Close | Packet::Disconnect => Some(StreamEvent::Finished),
        Packet::Event { name, args } if name == FRAME_EVENT => match inline_frame(&args) {
            Some(frame) => Some(StreamEvent::Frame(frame)),
            None => Some(StreamEvent::Frame(Vec::new())),
        },
        Packet::BinaryEvent {
            name, attachments, ..
        } if attachments > 0 => {
            *pending = Some(PendingBinary {
                remaining: attachments,
                first: None,
                is_frame: name == FRAME_EVENT,
            });
            None
        }
        Packet::BinaryEvent { name, args, .. } if name == FRAME_EVENT => {
            inline_frame(&args).map(StreamEvent::Frame)
        }
        _ => None,
    }
}

fn on_attachment(bytes: Vec<u8>, pending: &mut Option<PendingBinary>) -> Option<StreamEvent> {
    let state = pending.as_mut()?;
    if state.first.is_none() {
        state.first = Some(bytes);
    }
    state.remaining = state.remaining.saturating_sub(1);
    if state.remaining > 0 {
        return None;
    }
    let done = pending.take()?;
    if done.is_frame {
        done.first.map(StreamEvent::Frame)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_default_socketio_endpoint() {
        let url = socketio_url("http://192.168.1.20:8000").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://192.168.1.20:8000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn keeps_custom_path() {
        let url = socketio_url("ws://cam1/stream").unwrap();
        assert_eq!(url.as_str(), "ws://cam1/stream/?EIO=4&transport=websocket");
    }

    #[test]
    fn rejects_tls_and_unknown_schemes() {
        assert!(socketio_url("wss://cam1/stream").is_err());
        assert!(socketio_url("rtsp://cam1/stream").is_err());
    }

    #[test]
    fn parses_engine_packets() {
        assert_eq!(
            parse_packet(r#"0{"sid":"abc","pingInterval":25000}"#).unwrap(),
            Packet::Open
        );
        assert_eq!(parse_packet("2").unwrap(), Packet::Ping);
        assert_eq!(parse_packet("40").unwrap(), Packet::Connect);
        assert_eq!(
            parse_packet(r#"40{"sid":"xyz"}"#).unwrap(),
            Packet::Connect
        );
        assert_eq!(parse_packet("41").unwrap(), Packet::Disconnect);
        assert!(parse_packet("").is_err());
    }

    #[test]
    fn parses_connect_error_message() {
        assert_eq!(
            parse_packet(r#"44{"message":"Not authorized"}"#).unwrap(),
            Packet::ConnectError("Not authorized".to_string())
        );
    }

    #[test]
    fn parses_image_event_with_bare_string() {
        let packet = parse_packet(r#"42["image","/9j/4AAQ"]"#).unwrap();
        match packet {
            Packet::Event { name, args } => {
                assert_eq!(name, "image");
                assert_eq!(inline_frame(&args).unwrap(), b"/9j/4AAQ".to_vec());
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn parses_image_event_with_data_object_namespace_and_ack_id() {
        let packet = parse_packet(r#"42/cams,7["image",{"data":"QUJD"}]"#).unwrap();
        match packet {
            Packet::Event { name, args } => {
                assert_eq!(name, "image");
                assert_eq!(inline_frame(&args).unwrap(), b"QUJD".to_vec());
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn parses_binary_event_header() {
        let packet =
            parse_packet(r#"451-["image",{"_placeholder":true,"num":0}]"#).unwrap();
        assert_eq!(
            packet,
            Packet::BinaryEvent {
                name: "image".to_string(),
                args: vec![json!({"_placeholder": true, "num": 0})],
                attachments: 1,
            }
        );
    }

    #[test]
    fn binary_attachment_completes_frame() {
        let mut pending = Some(PendingBinary {
            remaining: 1,
            first: None,
            is_frame: true,
        });
        let event = on_attachment(vec![0xFF, 0xD8, 0xFF], &mut pending);
        assert_eq!(event, Some(StreamEvent::Frame(vec![0xFF, 0xD8, 0xFF])));
        assert!(pending.is_none());
        assert_eq!(on_attachment(vec![1], &mut pending), None);
    }

    #[test]
    fn rejects_malformed_event_payloads() {
        assert!(parse_packet("42not json").is_err());
        assert!(parse_packet("42[]").is_err());
        assert!(parse_packet("42[1,2]").is_err());
        assert!(parse_packet("451[\"image\"]").is_err());
    }

    #[test]
    fn inline_frame_ignores_non_string_payloads() {
        assert!(inline_frame(&[json!(42)]).is_none());
        assert!(inline_frame(&[json!({"other": "x"})]).is_none());
        assert!(inline_frame(&[]).is_none());
    }
}
