//! Result channel: one sentinel-framed line on the worker's stdout.
//!
//! Line format: `<SENTINEL><JSON string literal wrapping the outcome's JSON text>`.
//!
//! The parent reads stdout to completion and only trusts what follows the
//! last sentinel, so stray output written by the operation before the frame
//! is tolerated. Pipe characters inside the frame are written as `\u007c`,
//! which keeps the sentinel out of every encoded value.

use super::protocol::WorkerOutcome;

/// Thirty pipe characters.
pub const SENTINEL: &str = "||||||||||||||||||||||||||||||";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("worker output is not framed: [{output}]")]
    MissingSentinel { output: String },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// What the parent captured from one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    /// The worker exited without writing anything.
    Empty,
    Outcome(WorkerOutcome),
}

/// Inner layer: outcome → JSON text.
pub fn encode_outcome(outcome: &WorkerOutcome) -> Result<String, serde_json::Error> {
    serde_json::to_string(&outcome.to_value()?)
}

/// Framing layer: JSON text → pipe-free JSON string literal.
pub fn to_frame(text: &str) -> Result<String, serde_json::Error> {
    Ok(serde_json::to_string(text)?.replace('|', "\\u007c"))
}

pub fn from_frame(frame: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str(frame.trim_end())
}

/// Encode an outcome as the full stdout line (without trailing newline).
pub fn encode_line(outcome: &WorkerOutcome) -> Result<String, serde_json::Error> {
    Ok(format!("{SENTINEL}{}", to_frame(&encode_outcome(outcome)?)?))
}

/// Decode everything a worker wrote to stdout.
pub fn decode_output(output: &str) -> Result<Captured, ChannelError> {
    if output.is_empty() {
        return Ok(Captured::Empty);
    }

    let Some((_, frame)) = output.rsplit_once(SENTINEL) else {
        return Err(ChannelError::MissingSentinel {
            output: output.to_string(),
        });
    };

    let text = from_frame(frame)?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    Ok(Captured::Outcome(WorkerOutcome::classify(value)?))
}
