use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::message::{Message, random_id};
use crate::request::RequestId;

/// Subscription key for one event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Input,
    Message,
    Error,
    Chunk,
    Finish,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Input,
        EventKind::Message,
        EventKind::Error,
        EventKind::Chunk,
        EventKind::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Message => "message",
            Self::Error => "error",
            Self::Chunk => "chunk",
            Self::Finish => "finish",
        }
    }
}

/// Variant-specific event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum EventPayload {
    /// Prompt echo.
    Input { prompt: String },
    /// One complete message to append.
    Message(Message),
    /// Terminal failure for the current request.
    Error { error: String },
    /// Partial assistant content.
    Chunk { chunk: String },
    /// The request settled.
    Finish {
        #[serde(default)]
        message: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Input { .. } => EventKind::Input,
            Self::Message(_) => EventKind::Message,
            Self::Error { .. } => EventKind::Error,
            Self::Chunk { .. } => EventKind::Chunk,
            Self::Finish { .. } => EventKind::Finish,
        }
    }
}

/// Lifecycle event emitted by a backend.
///
/// `request` carries the id of the request token the backend was handed. Events
/// without it are folded into whatever request the session considers current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Creates an untagged event with a random id stamped with the current time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: random_id(),
            request: None,
            timestamp: now_unix_millis(),
            payload,
        }
    }

    pub fn input(prompt: impl Into<String>) -> Self {
        Self::new(EventPayload::Input {
            prompt: prompt.into(),
        })
    }

    pub fn message(message: Message) -> Self {
        Self::new(EventPayload::Message(message))
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::new(EventPayload::Error {
            error: error.into(),
        })
    }

    pub fn chunk(chunk: impl Into<String>) -> Self {
        Self::new(EventPayload::Chunk {
            chunk: chunk.into(),
        })
    }

    pub fn finish(message: impl Into<String>) -> Self {
        Self::new(EventPayload::Finish {
            message: message.into(),
        })
    }

    /// Tags the event with the request it belongs to.
    pub fn for_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

fn now_unix_millis() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| u64::try_from(elapsed.as_millis()).ok())
}
