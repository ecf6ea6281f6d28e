use thiserror::Error;

/// Message shown to the user whenever generation fails.
pub const GENERATION_FAILED: &str = "Failed to generate post. Please try again.";

/// Top-level error type for the postgen client.
#[derive(Debug, Error)]
pub enum PostgenError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Topic cannot be empty")]
    EmptyTopic,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PostgenError {
    /// Human-readable text surfaced to the presentation layer.
    pub fn user_message(&self) -> String {
        match self {
            PostgenError::EmptyTopic => "Please enter a topic.".into(),
            PostgenError::Config(msg) => format!("Invalid configuration: {msg}"),
            other => format!("{GENERATION_FAILED} ({other})"),
        }
    }
}

/// A single frame payload could not be turned into an event.
///
/// Always recoverable: the frame is dropped and decoding continues.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload has no string `type` field")]
    MissingType,

    #[error("unknown event type '{0}'")]
    UnknownType(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not reach generation service: {0}")]
    Connect(String),

    #[error("HTTP error! status: {status}{}", body_suffix(.body))]
    Status { status: u16, body: String },

    #[error("stream read failed: {0}")]
    Read(String),
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" ({body})")
    }
}

pub type Result<T> = std::result::Result<T, PostgenError>;
