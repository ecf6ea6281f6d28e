//! Typed events carried by the generation stream.
//!
//! A frame payload is either the literal [`SENTINEL`] or a JSON object whose
//! `type` field selects the variant:
//!
//! ```text
//! {"type": "action", "tool": "Search", "tool_input": "rust 2024"}
//! {"type": "observation", "observation": "Title: ..."}
//! {"type": "output", "output": "Excited to share ..."}
//! {"type": "sources", "sources": [{"title": "...", "link": "https://..."}]}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ParseError;

/// Payload that terminates the stream.
pub const SENTINEL: &str = "[DONE]";

/// A citation attached to the generated post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub link: String,
}

impl Source {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
        }
    }
}

/// One application-level event decoded from the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The agent invoked a tool.
    Action { tool: String, tool_input: String },
    /// A tool returned a result.
    Observation { text: String },
    /// The generated post. Final for content, but not for the stream.
    Output { text: String },
    /// Citation list; replaces any earlier one.
    Sources { items: Vec<Source> },
    /// Explicit end of stream.
    Sentinel,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::Observation { .. } => "observation",
            Self::Output { .. } => "output",
            Self::Sources { .. } => "sources",
            Self::Sentinel => "sentinel",
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::Sentinel)
    }
}

#[derive(Deserialize)]
struct ActionPayload {
    tool: String,
    #[serde(deserialize_with = "lenient_string")]
    tool_input: String,
}

#[derive(Deserialize)]
struct ObservationPayload {
    observation: String,
}

#[derive(Deserialize)]
struct OutputPayload {
    output: String,
}

#[derive(Deserialize)]
struct SourcesPayload {
    sources: Vec<Source>,
}

/// Parse one frame payload (prefix already stripped).
pub fn parse_event(payload: &str) -> Result<StreamEvent, ParseError> {
    if payload == SENTINEL {
        return Ok(StreamEvent::Sentinel);
    }

    let value: Value = serde_json::from_str(payload)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingType)?
        .to_owned();

    let event = match kind.as_str() {
        "action" => {
            let p: ActionPayload = serde_json::from_value(value)?;
            StreamEvent::Action {
                tool: p.tool,
                tool_input: p.tool_input,
            }
        }
        "observation" => {
            let p: ObservationPayload = serde_json::from_value(value)?;
            StreamEvent::Observation {
                text: p.observation,
            }
        }
        "output" => {
            let p: OutputPayload = serde_json::from_value(value)?;
            StreamEvent::Output { text: p.output }
        }
        "sources" => {
            let p: SourcesPayload = serde_json::from_value(value)?;
            StreamEvent::Sources { items: p.sources }
        }
        _ => return Err(ParseError::UnknownType(kind)),
    };

    Ok(event)
}

/// Strings pass through, `null` becomes empty, anything else is rendered as
/// compact JSON.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
