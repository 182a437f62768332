//! STOMP Frame Protocol
//!
//! Text framing used on top of the WebSocket channel. The backend is a STOMP
//! 1.2 broker, so subscriptions, publishes and inbound deliveries are all
//! STOMP frames carried in WebSocket text messages.
//!
//! # Frame Format
//!
//! ```text
//! COMMAND\n
//! header-1:value\n
//! header-2:value\n
//! \n
//! body^@
//! ```
//!
//! `^@` is the NUL octet. Bare EOLs between frames are heart-beats and are
//! skipped by the decoder.
//!
//! # Security
//!
//! - Maximum frame size is enforced to prevent memory exhaustion
//! - A buffer that grows past the limit without a terminator is rejected

use std::fmt;

use super::TransportError;

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// STOMP protocol version negotiated on connect
pub const STOMP_VERSION: &str = "1.2";

const NUL: char = '\0';

/// STOMP commands used by this client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StompCommand {
    /// Client handshake
    Connect,
    /// Broker accepted the handshake
    Connected,
    /// Start receiving a destination
    Subscribe,
    /// Stop receiving a destination
    Unsubscribe,
    /// Publish to a destination
    Send,
    /// Delivery on a subscription
    Message,
    /// Broker-side error; the broker closes the connection afterwards
    Error,
    /// Acknowledgement of a `receipt` header
    Receipt,
    /// Graceful disconnect
    Disconnect,
}

impl StompCommand {
    /// Wire name of the command
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Receipt => "RECEIPT",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            "RECEIPT" => Self::Receipt,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StompFrame {
    /// Frame command
    pub command: StompCommand,
    /// Headers in wire order (repeats allowed, first one wins)
    pub headers: Vec<(String, String)>,
    /// Frame body
    pub body: String,
}

impl StompFrame {
    /// Create an empty frame
    #[must_use]
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame for the given virtual host
    #[must_use]
    pub fn connect(host: &str, credentials: Option<(&str, &str)>) -> Self {
        let mut frame = Self::new(StompCommand::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0");
        if let Some((login, passcode)) = credentials {
            frame = frame.header("login", login).header("passcode", passcode);
        }
        frame
    }

    /// SUBSCRIBE frame
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(StompCommand::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// SEND frame carrying a JSON body
    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        Self::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .with_body(body)
    }

    /// DISCONNECT frame
    #[must_use]
    pub fn disconnect() -> Self {
        Self::new(StompCommand::Disconnect)
    }

    /// Encode to wire text, including the NUL terminator
    #[must_use]
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(TransportError::Protocol(format!(
                    "Invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Parse a single frame (without its NUL terminator)
pub fn decode_frame(raw: &str) -> Result<StompFrame, TransportError> {
    let lf = raw.find("\n\n").map(|pos| (pos, 2));
    let crlf = raw.find("\r\n\r\n").map(|pos| (pos, 4));
    let split = match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    };
    let (head, body) = match split {
        Some((pos, len)) => (&raw[..pos], &raw[pos + len..]),
        None => (raw, ""),
    };

    let mut lines = head.lines();
    let command_line = lines
        .next()
        .map(|l| l.trim_end_matches('\r'))
        .ok_or_else(|| TransportError::Protocol("Empty frame".to_string()))?;
    let command = StompCommand::parse(command_line).ok_or_else(|| {
        TransportError::Protocol(format!("Unknown command: {command_line}"))
    })?;

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::Protocol(format!("Malformed header: {line}")))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok(StompFrame {
        command,
        headers,
        body: body.to_string(),
    })
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming text and yields complete frames.
#[derive(Debug, Default)]
pub struct StompDecoder {
    buffer: String,
}

impl StompDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text to the buffer
    pub fn push(&mut self, data: &str) {
        self.buffer.push_str(data);
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the frame is invalid or oversized
    pub fn decode(&mut self) -> Result<Option<StompFrame>, TransportError> {
        // Heart-beats
        let leading = self.buffer.len() - self.buffer.trim_start_matches(['\n', '\r']).len();
        if leading > 0 {
            self.buffer.drain(..leading);
        }

        let Some(end) = self.buffer.find(NUL) else {
            if self.buffer.len() > MAX_FRAME_SIZE {
                let size = self.buffer.len();
                self.buffer.clear();
                return Err(TransportError::SerializationError(format!(
                    "Frame size {size} exceeds maximum {MAX_FRAME_SIZE}"
                )));
            }
            return Ok(None);
        };

        let raw: String = self.buffer.drain(..=end).collect();
        decode_frame(&raw[..raw.len() - 1]).map(Some)
    }
}
