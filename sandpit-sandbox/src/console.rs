//! Output aggregation for the host display

use sandpit_common::{OutputFragment, RunId};

/// Appended once when a run's output hits the cap
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Ordered, bounded output buffer for the active run.
///
/// Fragments must arrive in increasing `sequence` order; anything at or below
/// the last accepted sequence is dropped as a duplicate.
#[derive(Debug)]
pub struct Console {
    buffer: String,
    max_bytes: usize,
    active: Option<RunId>,
    next_sequence: u64,
    sealed: bool,
    truncated: bool,
}

impl Console {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_bytes,
            active: None,
            next_sequence: 0,
            sealed: false,
            truncated: false,
        }
    }

    /// Reset the buffer and make `run_id` the run that may append
    pub fn start_run(&mut self, run_id: RunId) {
        self.reset();
        self.active = Some(run_id);
    }

    /// Empty the buffer, but only on behalf of the active run
    pub fn clear(&mut self, run_id: RunId) -> bool {
        if self.active != Some(run_id) {
            return false;
        }
        self.reset();
        self.active = Some(run_id);
        true
    }

    /// Stop accepting fragments for `run_id`
    pub fn seal(&mut self, run_id: RunId) {
        if self.active == Some(run_id) {
            self.sealed = true;
        }
    }

    /// Append a fragment. Returns whether the visible text changed.
    pub fn append(&mut self, fragment: &OutputFragment) -> bool {
        if self.active != Some(fragment.run_id) || self.sealed {
            tracing::trace!(run_id = %fragment.run_id, "Dropping fragment for inactive run");
            return false;
        }
        if fragment.sequence < self.next_sequence {
            tracing::debug!(
                run_id = %fragment.run_id,
                sequence = fragment.sequence,
                expected = self.next_sequence,
                "Dropping duplicate fragment"
            );
            return false;
        }
        if fragment.sequence > self.next_sequence {
            tracing::warn!(
                run_id = %fragment.run_id,
                sequence = fragment.sequence,
                expected = self.next_sequence,
                "Gap in fragment sequence"
            );
        }
        self.next_sequence = fragment.sequence + 1;

        if self.truncated {
            return false;
        }

        let room = self.max_bytes.saturating_sub(self.buffer.len());
        if fragment.text.len() <= room {
            self.buffer.push_str(&fragment.text);
        } else {
            let mut cut = room;
            while !fragment.text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buffer.push_str(&fragment.text[..cut]);
            self.buffer.push_str(TRUNCATION_MARKER);
            self.truncated = true;
            tracing::warn!(
                run_id = %fragment.run_id,
                max_bytes = self.max_bytes,
                "Console output truncated"
            );
        }
        true
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.active
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.next_sequence = 0;
        self.sealed = false;
        self.truncated = false;
    }
}
