//! Client side of the postgen generation stream.
//!
//! [`GenerationClient`] talks HTTP to the generation service,
//! [`StreamController`] turns one streamed response into a sequence of
//! [`StreamUpdate`]s for the presentation layer.

pub mod client;
pub mod controller;
pub mod source;

pub use client::{GeneratedPost, GenerationClient, Transport};
pub use controller::{StreamController, StreamOutcome, StreamUpdate};
pub use source::{ChunkSource, MemorySource, ResponseSource};
