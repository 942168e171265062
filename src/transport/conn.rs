//! One established STOMP session over a WebSocket.
//!
//! `Conn::establish()` completes the CONNECT/CONNECTED handshake before
//! returning; holding a `Conn` means frames can flow. The read loop and
//! the heartbeat writer run as tasks owned by the `Conn` and are aborted
//! when it drops. A `Conn` never reconnects itself; when the connection
//! dies the read loop posts a death notice and the link decides what
//! happens next.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, warn};

use crate::error::{ClientError, Result};
use crate::types::ChatMessage;

use super::frame::{parse_heart_beat, Command, Frame};
use super::socket::{next_text, Socket, WsSink, WsStream};
use super::{LinkEvent, LivePayload, Registry};

pub(crate) struct ConnParams {
    pub url: String,
    pub host: String,
    pub bearer: String,
    /// Client heart-beat offer in ms: (we send every, we want every)
    pub heartbeat_ms: (u64, u64),
    pub connect_timeout: Duration,
    pub seq: u64,
    pub registry: Registry,
    pub events: broadcast::Sender<LinkEvent>,
    pub down: mpsc::UnboundedSender<ConnDown>,
}

/// Death notice posted by the read loop when the connection ends
#[derive(Debug)]
pub(crate) struct ConnDown {
    pub seq: u64,
    pub reason: String,
}

pub(crate) struct Conn {
    sink: Arc<Mutex<WsSink>>,
    bearer: String,
    seq: u64,
    read_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl Conn {
    /// Connect, authenticate, and start the session tasks.
    ///
    /// The bearer token rides the CONNECT frame once; individual frames
    /// carry no credentials. Any failure returns an error and leaves no
    /// session behind.
    pub(crate) async fn establish(params: ConnParams) -> Result<Self> {
        // Step 1: open the socket
        let connect = Socket::connect(&params.url, &params.host);
        let mut socket = match timeout(params.connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Connection(format!(
                    "connect to {} timed out",
                    params.url
                )))
            }
        };

        // Step 2: STOMP handshake
        let offer = format!("{},{}", params.heartbeat_ms.0, params.heartbeat_ms.1);
        let connect_frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", &params.host)
            .header("heart-beat", &offer)
            .header("Authorization", &format!("Bearer {}", params.bearer));
        socket.send_text(connect_frame.encode()).await?;

        let reply = match timeout(params.connect_timeout, first_frame(&mut socket)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Connection(
                    "STOMP handshake timed out".to_string(),
                ))
            }
        };
        let heartbeat = match reply.command {
            Command::Connected => {
                let server = reply.header_value("heart-beat").and_then(parse_heart_beat);
                negotiate_heartbeat(params.heartbeat_ms, server)
            }
            Command::Error => {
                return Err(ClientError::Connection(format!(
                    "broker rejected connection: {}",
                    error_text(&reply)
                )))
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    other.as_str()
                )))
            }
        };
        debug!(
            seq = params.seq,
            send_every = ?heartbeat.send_every,
            expect_within = ?heartbeat.expect_within,
            "STOMP session established"
        );

        // Step 3: split for concurrent send/receive
        let (sink, stream) = socket.split();
        let sink = Arc::new(Mutex::new(sink));

        // Step 4: read loop
        let read_task = tokio::spawn(read_loop(
            stream,
            params.registry,
            params.events,
            params.down,
            params.seq,
            heartbeat.expect_within,
        ));

        // Step 5: heartbeat writer, if negotiated
        let heartbeat_task = heartbeat
            .send_every
            .map(|every| tokio::spawn(heartbeat_loop(Arc::clone(&sink), every)));

        Ok(Self {
            sink,
            bearer: params.bearer,
            seq: params.seq,
            read_task,
            heartbeat_task,
        })
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.encode()))
            .await
            .map_err(|e| ClientError::Connection(format!("failed to send frame: {}", e)))
    }

    /// Token this session authenticated with
    pub(crate) fn bearer(&self) -> &str {
        &self.bearer
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// The read loop still running. Does not guarantee the next send will
    /// succeed.
    pub(crate) fn is_alive(&self) -> bool {
        !self.read_task.is_finished()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.read_task.abort();
        if let Some(task) = &self.heartbeat_task {
            task.abort();
        }
        debug!(seq = self.seq, "connection dropped, session tasks aborted");
    }
}

/// First real frame during the handshake; heartbeats are skipped
async fn first_frame(socket: &mut Socket) -> Result<Frame> {
    loop {
        match socket.recv_text().await? {
            Some(text) => {
                if let Some(frame) = Frame::parse(&text)? {
                    return Ok(frame);
                }
            }
            None => {
                return Err(ClientError::Connection(
                    "connection closed during STOMP handshake".to_string(),
                ))
            }
        }
    }
}

/// Read loop: dispatch MESSAGE frames through the registry, surface ERROR
/// frames, and watch the inbound heartbeat deadline. Ends with a death
/// notice carrying the reason.
async fn read_loop(
    mut stream: WsStream,
    registry: Registry,
    events: broadcast::Sender<LinkEvent>,
    down: mpsc::UnboundedSender<ConnDown>,
    seq: u64,
    expect_within: Option<Duration>,
) {
    debug!(seq = seq, "read loop started");
    let reason = loop {
        let next = match expect_within {
            Some(deadline) => match timeout(deadline, next_text(&mut stream)).await {
                Ok(result) => result,
                Err(_) => break "heartbeat timeout".to_string(),
            },
            None => next_text(&mut stream).await,
        };
        match next {
            Ok(Some(text)) => match Frame::parse(&text) {
                // Peer heartbeat; any traffic refreshes the deadline.
                Ok(None) => continue,
                Ok(Some(frame)) => match frame.command {
                    Command::Message => dispatch_message(&registry, &frame).await,
                    Command::Error => {
                        let message = error_text(&frame);
                        error!(seq = seq, message = %message, "broker sent ERROR");
                        let _ = events.send(LinkEvent::BrokerError {
                            message: message.clone(),
                        });
                        break format!("broker error: {}", message);
                    }
                    Command::Receipt => debug!(seq = seq, "receipt frame"),
                    other => {
                        debug!(seq = seq, command = other.as_str(), "ignoring unexpected frame")
                    }
                },
                Err(e) => {
                    error!(seq = seq, error = %e, "unparseable frame");
                    break format!("protocol error: {}", e);
                }
            },
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    debug!(seq = seq, reason = %reason, "read loop ended");
    let _ = down.send(ConnDown { seq, reason });
}

/// Route a MESSAGE frame to the handler registered for its subscription.
/// A body that does not parse as a chat message is delivered raw.
async fn dispatch_message(registry: &Registry, frame: &Frame) {
    let Some(sub_id) = frame.header_value("subscription") else {
        warn!("MESSAGE frame without subscription header");
        return;
    };
    let handler = {
        let registry = registry.read().await;
        registry.get(sub_id).map(|entry| Arc::clone(&entry.handler))
    };
    match handler {
        Some(handler) => {
            let payload = match serde_json::from_str::<ChatMessage>(&frame.body) {
                Ok(message) => LivePayload::Message(message),
                Err(e) => {
                    warn!(error = %e, "live payload is not a chat message, delivering raw");
                    LivePayload::Raw(frame.body.clone())
                }
            };
            handler(payload);
        }
        None => debug!(subscription = %sub_id, "message for unknown subscription"),
    }
}

/// Single LF every negotiated interval, until the sink rejects it
async fn heartbeat_loop(sink: Arc<Mutex<WsSink>>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut sink = sink.lock().await;
        if sink.send(Message::Text("\n".to_string())).await.is_err() {
            debug!("heartbeat send failed, stopping writer");
            break;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Heartbeat {
    /// Interval for our LF writer; `None` disables it
    pub send_every: Option<Duration>,
    /// Inbound traffic deadline (twice the negotiated interval); `None`
    /// means no deadline
    pub expect_within: Option<Duration>,
}

/// STOMP 1.2 negotiation: client offers `(cx, cy)`, server answers
/// `(sx, sy)`; each direction runs at the max of the two sides, and a
/// zero on either side disables it. An absent server header disables both.
pub(crate) fn negotiate_heartbeat(client: (u64, u64), server: Option<(u64, u64)>) -> Heartbeat {
    let (cx, cy) = client;
    let (sx, sy) = server.unwrap_or((0, 0));
    let send_every = if cx == 0 || sy == 0 {
        None
    } else {
        Some(Duration::from_millis(cx.max(sy)))
    };
    let expect_within = if sx == 0 || cy == 0 {
        None
    } else {
        Some(Duration::from_millis(2 * sx.max(cy)))
    };
    Heartbeat {
        send_every,
        expect_within,
    }
}

fn error_text(frame: &Frame) -> String {
    match frame.header_value("message") {
        Some(message) if !message.is_empty() => message.to_string(),
        _ if !frame.body.is_empty() => frame.body.clone(),
        _ => "no detail".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_negotiation_takes_the_max() {
        let hb = negotiate_heartbeat((20000, 30000), Some((10000, 10000)));
        assert_eq!(hb.send_every, Some(Duration::from_millis(20000)));
        assert_eq!(hb.expect_within, Some(Duration::from_millis(60000)));

        let hb = negotiate_heartbeat((20000, 30000), Some((45000, 25000)));
        assert_eq!(hb.send_every, Some(Duration::from_millis(25000)));
        assert_eq!(hb.expect_within, Some(Duration::from_millis(90000)));
    }

    #[test]
    fn test_heartbeat_zero_disables_direction() {
        let hb = negotiate_heartbeat((20000, 30000), Some((0, 20000)));
        assert_eq!(hb.send_every, Some(Duration::from_millis(20000)));
        assert_eq!(hb.expect_within, None);

        let hb = negotiate_heartbeat((0, 0), Some((10000, 10000)));
        assert_eq!(hb, Heartbeat { send_every: None, expect_within: None });
    }

    #[test]
    fn test_heartbeat_absent_header_disables_both() {
        let hb = negotiate_heartbeat((20000, 30000), None);
        assert_eq!(hb.send_every, None);
        assert_eq!(hb.expect_within, None);
    }

    #[test]
    fn test_error_text_prefers_message_header() {
        let frame = Frame::new(Command::Error)
            .header("message", "bad credentials")
            .with_body("long description");
        assert_eq!(error_text(&frame), "bad credentials");

        let frame = Frame::new(Command::Error).with_body("body only");
        assert_eq!(error_text(&frame), "body only");

        let frame = Frame::new(Command::Error);
        assert_eq!(error_text(&frame), "no detail");
    }
}
