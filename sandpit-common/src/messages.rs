//! Execution channel protocol
//!
//! Every frame is a single JSON object on its own line. Run-scoped frames carry
//! the [`RunId`] they belong to so the host can discard anything stale.

use crate::{ExecutionRequest, OutputFragment, RunId};
use serde::{Deserialize, Serialize};

/// Upper bound for a single encoded frame, in bytes
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Host -> isolated context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Execute(ExecutionRequest),
    Shutdown,
}

/// Isolated context -> host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The context finished loading and accepts requests
    Ready { runtime: String },

    /// The context could not initialize; it exits right after sending this
    LoadFailed { message: String },

    Output(OutputFragment),

    /// Terminal: the run completed normally
    Done { run_id: RunId },

    /// Terminal: the submitted code faulted
    Error { run_id: RunId, message: String },
}

impl WorkerMessage {
    /// The run this message belongs to, if it is run-scoped
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            WorkerMessage::Output(fragment) => Some(fragment.run_id),
            WorkerMessage::Done { run_id } | WorkerMessage::Error { run_id, .. } => Some(*run_id),
            WorkerMessage::Ready { .. } | WorkerMessage::LoadFailed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMessage::Done { .. } | WorkerMessage::Error { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Frame contains an embedded newline")]
    EmbeddedNewline,
}

/// Encode a message as a single frame (without the trailing newline)
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(message)?;
    // serde_json escapes control characters, so this only trips on a broken serializer
    if line.contains('\n') {
        return Err(ProtocolError::EmbeddedNewline);
    }
    if line.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: line.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(line)
}

/// Decode a single frame; surrounding whitespace is ignored
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, ProtocolError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: line.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_str(line.trim())?)
}
