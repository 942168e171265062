//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages: a command line, `name:value`
//! header lines, a blank line, the body, and a NUL terminator. A message
//! that is only an EOL is a heartbeat, not a frame.

use crate::error::{ClientError, Result};

/// STOMP commands this client speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client frames
    Connect,
    Subscribe,
    Unsubscribe,
    Send,
    Disconnect,
    // Server frames
    Connected,
    Message,
    Error,
    Receipt,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Error => "ERROR",
            Command::Receipt => "RECEIPT",
        }
    }

    fn from_line(line: &str) -> Option<Command> {
        Some(match line {
            "CONNECT" => Command::Connect,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "ERROR" => Command::Error,
            "RECEIPT" => Command::Receipt,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers travel unescaped; every other frame
    /// escapes per the 1.2 rules.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for a header name, per the repeated-header rule
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Render to the wire text, appending `content-length` when a body is
    /// present.
    pub fn encode(&self) -> String {
        let escaped = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escaped {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one wire message. `Ok(None)` means the message was a heartbeat.
    pub fn parse(input: &str) -> Result<Option<Frame>> {
        if input.is_empty() || input == "\n" || input == "\r\n" {
            return Ok(None);
        }

        let (command_line, mut rest) = split_line(input)
            .ok_or_else(|| ClientError::Protocol("frame has no command line".to_string()))?;
        let command = Command::from_line(command_line).ok_or_else(|| {
            ClientError::Protocol(format!("unknown STOMP command: {command_line}"))
        })?;
        let escaped = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, next) = split_line(rest).ok_or_else(|| {
                ClientError::Protocol("frame truncated in headers".to_string())
            })?;
            rest = next;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ClientError::Protocol(format!("malformed header: {line}")))?;
            if escaped {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let declared_len = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok());
        let body = match declared_len {
            Some(len) => {
                if rest.len() < len || !rest.is_char_boundary(len) {
                    return Err(ClientError::Protocol(
                        "frame body shorter than content-length".to_string(),
                    ));
                }
                rest[..len].to_string()
            }
            None => match rest.find('\0') {
                Some(end) => rest[..end].to_string(),
                None => {
                    return Err(ClientError::Protocol(
                        "frame missing NUL terminator".to_string(),
                    ))
                }
            },
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

/// `heart-beat` header value: `sx,sy` in milliseconds
pub fn parse_heart_beat(value: &str) -> Option<(u64, u64)> {
    let (sx, sy) = value.split_once(',')?;
    Some((sx.trim().parse().ok()?, sy.trim().parse().ok()?))
}

fn split_line(s: &str) -> Option<(&str, &str)> {
    s.split_once('\n')
        .map(|(line, rest)| (line.strip_suffix('\r').unwrap_or(line), rest))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                let tail = other.map(String::from).unwrap_or_default();
                return Err(ClientError::Protocol(format!(
                    "invalid header escape: \\{tail}"
                )));
            }
        }
    }
    Ok(out)
}
