//! Trace data model.
//!
//! A [`Trace`] is produced by a loader (capture decoder, script reader, or
//! the JSON form in this module) and handed to the engine, which treats it as
//! read-only for its whole lifetime.
//!
//! ## Sender index
//!
//! The engine replays each endpoint's own messages independently. The
//! per-sender index maps an endpoint id to the messages it sends, in original
//! trace order. It is built once, on first use, and never re-sorted.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::Path,
    sync::OnceLock,
};

use serde::{Deserialize, Serialize};

use crate::error::TraceError;

/// Endpoint identifier, unique within a trace.
pub type EndpointId = u32;

/// Trace-wide defaults.
///
/// Informational only: the engine reads none of these directly. Front ends
/// use `timeout_ms`, `delay_ms` and `log_lines` to fill in engine
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Globals {
    /// Transport protocol tag (e.g. "tcp").
    pub protocol: String,
    /// Play-mode tag.
    pub play_mode: String,
    /// Connection timeout in milliseconds (0 = engine default).
    #[serde(alias = "timeout")]
    pub timeout_ms: u64,
    /// Default inter-message delay in milliseconds.
    #[serde(alias = "delay")]
    pub delay_ms: u64,
    /// In-memory log history size.
    pub log_lines: Option<usize>,
}

/// Endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Passive listener.
    Server,
    /// Active initiator replaying its messages.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// A simulated network participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique id.
    pub id: EndpointId,
    /// Server listens, client dials.
    #[serde(alias = "kind")]
    pub role: Role,
    /// Host the server listens on, or the client would be reached at.
    #[serde(default)]
    pub address: String,
    /// Port the server listens on.
    #[serde(default)]
    pub port: u16,
}

impl Endpoint {
    /// Server endpoint listening on `address:port`.
    pub fn server(id: EndpointId, address: impl Into<String>, port: u16) -> Self {
        Self { id, role: Role::Server, address: address.into(), port }
    }

    /// Client endpoint.
    pub fn client(id: EndpointId) -> Self {
        Self { id, role: Role::Client, address: String::new(), port: 0 }
    }

    /// Returns true for server endpoints.
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// `address:port` suitable for binding or dialing.
    ///
    /// IPv6 literals are bracketed.
    pub fn socket_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// What a message does when replayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Open a connection to the target.
    Syn,
    /// Write the payload on the open connection (`data`, `psh`, `push`).
    Data,
    /// Close the connection to the target.
    Fin,
    /// Anything else; replayed as a no-op.
    Other(String),
}

impl MessageKind {
    /// Parse a kind tag. Case-insensitive; unknown tags become `Other`.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "syn" => Self::Syn,
            "data" | "psh" | "push" => Self::Data,
            "fin" => Self::Fin,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syn => f.write_str("syn"),
            Self::Data => f.write_str("data"),
            Self::Fin => f.write_str("fin"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// One replayed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sending endpoint.
    pub from: EndpointId,
    /// Target endpoint.
    pub to: EndpointId,
    /// Action kind.
    pub kind: MessageKind,
    /// Hex-encoded payload (data messages only).
    #[serde(default, alias = "value")]
    pub payload: String,
    /// Wait before this message, relative to the sender's previous message.
    ///
    /// `None` falls back to the engine's default delay.
    #[serde(default, alias = "t_delta")]
    pub delay_ms: Option<u64>,
}

impl Message {
    /// Message with no payload and no explicit delay.
    pub fn new(from: EndpointId, to: EndpointId, kind: MessageKind) -> Self {
        Self { from, to, kind, payload: String::new(), delay_ms: None }
    }

    /// Set the hex payload.
    #[must_use]
    pub fn with_payload(mut self, hex_payload: impl Into<String>) -> Self {
        self.payload = hex_payload.into();
        self
    }

    /// Set an explicit delay.
    #[must_use]
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Decode the hex payload into bytes.
    pub fn decode_payload(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.payload)
    }
}

/// Endpoints plus the ordered messages between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    /// Trace-wide defaults.
    #[serde(default)]
    pub globals: Globals,
    /// Declared endpoints.
    pub endpoints: Vec<Endpoint>,
    /// Messages in original order.
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip)]
    by_sender: OnceLock<HashMap<EndpointId, Vec<Message>>>,
}

impl Trace {
    /// Assemble a trace. Does not validate.
    pub fn new(globals: Globals, endpoints: Vec<Endpoint>, messages: Vec<Message>) -> Self {
        Self { globals, endpoints, messages, by_sender: OnceLock::new() }
    }

    /// Parse the JSON form. Does not validate.
    pub fn from_json(json: &str) -> Result<Self, TraceError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read, parse and validate a JSON trace file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let json = std::fs::read_to_string(path)?;
        let trace = Self::from_json(&json)?;
        trace.validate()?;
        Ok(trace)
    }

    /// Check that endpoint ids are unique and every message references
    /// declared endpoints.
    pub fn validate(&self) -> Result<(), TraceError> {
        let mut ids = HashSet::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            if !ids.insert(endpoint.id) {
                return Err(TraceError::DuplicateEndpoint(endpoint.id));
            }
        }

        for (index, message) in self.messages.iter().enumerate() {
            if !ids.contains(&message.from) {
                return Err(TraceError::UnknownSender { index, id: message.from });
            }
            if !ids.contains(&message.to) {
                return Err(TraceError::UnknownTarget { index, id: message.to });
            }
        }

        Ok(())
    }

    /// Look up an endpoint by id.
    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.id == id)
    }

    /// Server endpoints, in declaration order.
    pub fn servers(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|endpoint| endpoint.is_server())
    }

    /// Per-sender message index, built on first call.
    pub fn sender_index(&self) -> &HashMap<EndpointId, Vec<Message>> {
        self.by_sender.get_or_init(|| {
            let mut index: HashMap<EndpointId, Vec<Message>> =
                HashMap::with_capacity(self.endpoints.len());
            for message in &self.messages {
                index.entry(message.from).or_default().push(message.clone());
            }
            index
        })
    }

    /// Messages sent by `id`, in trace order.
    pub fn messages_from(&self, id: EndpointId) -> &[Message] {
        self.sender_index().get(&id).map_or(&[], Vec::as_slice)
    }

    /// Returns true once the sender index has been built.
    pub fn is_indexed(&self) -> bool {
        self.by_sender.get().is_some()
    }
}
