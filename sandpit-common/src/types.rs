//! Identifiers and payloads exchanged between host and isolated context

use serde::{Deserialize, Serialize};

/// Opaque token correlating a request, its output and its terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request to execute code inside an isolated context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub run_id: RunId,

    /// The code to execute
    pub code: String,
}

impl ExecutionRequest {
    /// Create a request under a fresh run id
    pub fn new(code: impl Into<String>) -> Self {
        Self::with_run_id(RunId::new(), code)
    }

    pub fn with_run_id(run_id: RunId, code: impl Into<String>) -> Self {
        Self {
            run_id,
            code: code.into(),
        }
    }
}

/// Which stream of the submitted program produced a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One ordered chunk of captured output belonging to a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFragment {
    pub run_id: RunId,

    /// Starts at 0 for every run and increases by one per fragment
    pub sequence: u64,

    #[serde(default = "default_stream")]
    pub stream: OutputStream,

    pub text: String,
}

fn default_stream() -> OutputStream {
    OutputStream::Stdout
}

impl OutputFragment {
    pub fn stdout(run_id: RunId, sequence: u64, text: impl Into<String>) -> Self {
        Self {
            run_id,
            sequence,
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(run_id: RunId, sequence: u64, text: impl Into<String>) -> Self {
        Self {
            run_id,
            sequence,
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn test_run_id_serializes_as_bare_uuid() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_fragment_stream_defaults_to_stdout() {
        let id = RunId::new();
        let json = format!(r#"{{"run_id":"{}","sequence":3,"text":"hi"}}"#, id);
        let fragment: OutputFragment = serde_json::from_str(&json).unwrap();
        assert_eq!(fragment, OutputFragment::stdout(id, 3, "hi"));
    }
}
