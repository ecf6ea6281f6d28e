pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod progress;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::ClientConfig;
    pub use crate::error::{ParseError, PostgenError, Result, TransportError};
    pub use crate::event::{Source, StreamEvent, parse_event};
    pub use crate::frame::FrameDecoder;
    pub use crate::progress::{AggregateState, Stage, end_stream, fold};
}
