//! Progressive terminal rendering of stream updates.

use std::io::{self, Write};

use postgen_client::StreamUpdate;
use postgen_core::prelude::*;

const BAR_WIDTH: usize = 20;

/// Draws each snapshot as the difference from the previous one: the stage
/// strip when the stage moves, then any steps not yet printed.
pub struct Renderer<W> {
    out: W,
    quiet: bool,
    stage: Option<Stage>,
    shown_steps: usize,
    failure: Option<String>,
}

impl<W: Write> Renderer<W> {
    /// A quiet renderer records failures but prints nothing.
    pub fn new(out: W, quiet: bool) -> Self {
        Self {
            out,
            quiet,
            stage: None,
            shown_steps: 0,
            failure: None,
        }
    }

    pub fn begin(&mut self, topic: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        writeln!(self.out, "Topic: {topic}")?;
        writeln!(self.out, "Connecting to AI agent...")
    }

    pub fn apply(&mut self, update: &StreamUpdate) -> io::Result<()> {
        match update {
            StreamUpdate::State(state) => self.draw_state(state),
            StreamUpdate::Failed(message) => {
                self.failure = Some(message.clone());
                if self.quiet {
                    return Ok(());
                }
                writeln!(self.out, "Error: {message}")
            }
        }
    }

    fn draw_state(&mut self, state: &AggregateState) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        if self.stage != Some(state.stage) {
            self.stage = Some(state.stage);
            writeln!(self.out)?;
            writeln!(self.out, "{}", stage_strip(state.stage))?;
            writeln!(self.out, "{}", progress_bar(state.progress_percent))?;
        }

        // Steps are append-only, so everything past the last count is new.
        for step in state.steps.iter().skip(self.shown_steps) {
            writeln!(self.out, "  {step}")?;
        }
        self.shown_steps = self.shown_steps.max(state.steps.len());
        Ok(())
    }

    /// Print the generated post and its sources.
    pub fn finish(&mut self, state: &AggregateState) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        writeln!(self.out)?;
        if state.final_answer.is_empty() {
            writeln!(self.out, "No post was generated.")?;
        } else {
            writeln!(self.out, "Your LinkedIn Post")?;
            writeln!(self.out, "------------------")?;
            writeln!(self.out, "{}", state.final_answer)?;
        }

        if !state.sources.is_empty() {
            writeln!(self.out)?;
            writeln!(self.out, "Sources")?;
            for (i, source) in state.sources.iter().enumerate() {
                writeln!(self.out, "  {}. {} <{}>", i + 1, source.title, source.link)?;
            }
        }
        self.out.flush()
    }

    /// Message of the last `Failed` update, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// `[x] Searching > [*] Analyzing > [ ] Writing` style strip.
pub fn stage_strip(current: Stage) -> String {
    let position = |stage: Stage| match stage {
        Stage::Idle => 0,
        Stage::Searching => 1,
        Stage::Analyzing => 2,
        Stage::Writing => 3,
        Stage::Complete => 4,
    };
    let now = position(current);

    Stage::PIPELINE
        .iter()
        .map(|&stage| {
            let mark = match position(stage).cmp(&now) {
                std::cmp::Ordering::Less => "x",
                std::cmp::Ordering::Equal => "*",
                std::cmp::Ordering::Greater => " ",
            };
            format!("[{mark}] {stage}")
        })
        .collect::<Vec<_>>()
        .join(" > ")
}

pub fn progress_bar(percent: u8) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent * BAR_WIDTH / 100;
    format!(
        "[{}{}] {percent:>3}%",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled)
    )
}
