use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

const DEFAULT_MAX_LINES: usize = 10_000;

struct Lines {
    session: u64,
    lines: VecDeque<String>,
}

/// Ring buffer of the inference server's captured stdout/stderr lines.
///
/// Each started process opens a new session; lines still trickling in from
/// an earlier process are discarded.
pub struct LogBuffer {
    max_lines: usize,
    inner: RwLock<Lines>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            inner: RwLock::new(Lines {
                session: 0,
                lines: VecDeque::new(),
            }),
        }
    }

    /// Drops all captured lines and returns the id of the new session.
    pub fn begin_session(&self) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.session += 1;
        inner.lines.clear();
        inner.session
    }

    /// Append a line for `session`, dropping the oldest once over capacity.
    /// Lines of a superseded session are ignored.
    pub fn push(&self, session: u64, line: String) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.session != session {
            return;
        }
        inner.lines.push_back(line);
        while inner.lines.len() > self.max_lines {
            inner.lines.pop_front();
        }
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let start = inner.lines.len().saturating_sub(n);
        inner.lines.range(start..).cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
