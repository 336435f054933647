//! Wire envelopes shared by the viewer and upstream protocols.
//!
//! Viewers receive JSON text:
//!
//! ```text
//! {"type":"frame","data":"<base64 JPEG>"}
//! {"type":"description","content":"<text>"}
//! ```
//!
//! The upstream service receives raw binary JPEG (no envelope) and answers
//! with the `description` shape above.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::MalformedMessage;
use crate::frame::Frame;

/// Typed wire message with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Latest camera frame, base64-encoded for text transport
    Frame { data: String },
    /// Text produced by the inference service
    Description { content: String },
}

impl Envelope {
    /// Wrap a frame for viewers
    pub fn frame(frame: &Frame) -> Self {
        Envelope::Frame {
            data: general_purpose::STANDARD.encode(&frame.payload),
        }
    }

    /// Wrap a description result for viewers
    pub fn description(result: DescriptionResult) -> Self {
        Envelope::Description {
            content: result.content,
        }
    }

    /// The `type` discriminator as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Frame { .. } => "frame",
            Envelope::Description { .. } => "description",
        }
    }

    /// Serialize to the JSON text sent to viewers
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A description returned by the inference service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResult {
    pub content: String,
}

impl DescriptionResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Parse an upstream text message.
    ///
    /// Anything other than a well-formed `description` envelope is rejected.
    /// Unknown extra fields are ignored.
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        match serde_json::from_str::<Envelope>(text)? {
            Envelope::Description { content } => Ok(Self { content }),
            other => Err(MalformedMessage::UnexpectedType(other.kind().to_string())),
        }
    }
}
