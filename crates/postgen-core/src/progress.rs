//! Fold of stream events into the state shown to the user.

use serde::Serialize;

use crate::event::{Source, StreamEvent};

/// Observations are cut to this many characters in the step log.
pub const OBSERVATION_PREVIEW_CHARS: usize = 100;

pub const PROGRESS_SEARCHING: u8 = 33;
pub const PROGRESS_ANALYZING: u8 = 66;
pub const PROGRESS_DONE: u8 = 100;

/// Coarse phase label shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Searching,
    Analyzing,
    Writing,
    Complete,
}

impl Stage {
    /// Stages drawn as the progress strip, in order.
    pub const PIPELINE: [Stage; 3] = [Stage::Searching, Stage::Analyzing, Stage::Writing];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Searching => "Searching",
            Self::Analyzing => "Analyzing",
            Self::Writing => "Writing",
            Self::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything the presentation layer needs to draw one stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AggregateState {
    /// Reasoning log, append-only.
    pub steps: Vec<String>,
    /// Last `Output` received; empty until then.
    pub final_answer: String,
    /// Last `Sources` received; empty until then.
    pub sources: Vec<Source>,
    pub stage: Stage,
    pub progress_percent: u8,
    pub is_streaming: bool,
}

impl AggregateState {
    /// State at the moment a request is issued.
    pub fn streaming() -> Self {
        Self {
            stage: Stage::Searching,
            is_streaming: true,
            ..Self::default()
        }
    }
}

/// Apply one event.
///
/// Stage and progress follow the type of the latest event only, so an
/// `Action` arriving after an `Output` moves the display back to
/// `Searching`.
pub fn fold(mut state: AggregateState, event: &StreamEvent) -> AggregateState {
    match event {
        StreamEvent::Action { tool, tool_input } => {
            state.steps.push(format!("🔍 {tool}: {tool_input}"));
            state.stage = Stage::Searching;
            state.progress_percent = PROGRESS_SEARCHING;
        }
        StreamEvent::Observation { text } => {
            let preview = truncate_chars(text, OBSERVATION_PREVIEW_CHARS);
            state.steps.push(format!("📊 Found: {preview}..."));
            state.stage = Stage::Analyzing;
            state.progress_percent = PROGRESS_ANALYZING;
        }
        StreamEvent::Output { text } => {
            state.final_answer = text.clone();
            state.stage = Stage::Writing;
            state.progress_percent = PROGRESS_DONE;
        }
        StreamEvent::Sources { items } => {
            state.sources = items.clone();
        }
        StreamEvent::Sentinel => {
            state.is_streaming = false;
            state.stage = Stage::Complete;
            state.progress_percent = PROGRESS_DONE;
        }
    }
    state
}

/// Stream stopped without a sentinel (end of body or transport failure).
/// Everything accumulated so far stays as it is.
pub fn end_stream(mut state: AggregateState) -> AggregateState {
    state.is_streaming = false;
    state
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
