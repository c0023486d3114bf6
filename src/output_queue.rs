//! Drain-on-read buffer of tagged output lines.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Output of one drain, split by stream. Each line keeps its trailing `\n`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drained {
    pub out: String,
    pub err: String,
}

/// Unbounded queue with concurrent append and an atomic take-all.
///
/// Entries are ordered within a stream; the relative order of `out` and
/// `err` lines follows arrival time only.
#[derive(Debug, Default)]
pub struct OutputQueue {
    lines: Mutex<VecDeque<OutputLine>>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stream: Stream, text: impl Into<String>) {
        self.lock().push_back(OutputLine {
            stream,
            text: text.into(),
        });
    }

    /// Remove and return every queued line.
    pub fn take_all(&self) -> Vec<OutputLine> {
        self.lock().drain(..).collect()
    }

    /// Remove every queued line and concatenate them per stream.
    pub fn drain(&self) -> Drained {
        let mut drained = Drained::default();
        for line in self.take_all() {
            let target = match line.stream {
                Stream::Out => &mut drained.out,
                Stream::Err => &mut drained.err,
            };
            target.push_str(&line.text);
            target.push('\n');
        }
        drained
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A writer that panicked mid-push leaves the deque consistent, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<OutputLine>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
