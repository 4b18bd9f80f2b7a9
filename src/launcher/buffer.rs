use crate::model::OutputStream;
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferedLine {
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
}

/// Bounded, sequence-numbered line store. Oldest lines are evicted first.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<BufferedLine>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl OutputBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 1,
            dropped: 0,
        }
    }

    /// Append a line and return its sequence number.
    pub fn push(&mut self, stream: OutputStream, text: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.lines.push_back(BufferedLine {
            seq,
            stream,
            text: text.into(),
        });
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        seq
    }

    pub fn lines(&self) -> impl DoubleEndedIterator<Item = &BufferedLine> + ExactSizeIterator {
        self.lines.iter()
    }

    /// Lines with a sequence number strictly greater than `seq`.
    pub fn since(&self, seq: u64) -> Vec<BufferedLine> {
        // Sequence numbers are contiguous, so the start index can be computed directly.
        let first = match self.lines.front() {
            Some(l) => l.seq,
            None => return Vec::new(),
        };
        let skip = seq.saturating_sub(first - 1) as usize;
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Sequence number of the most recent line, or 0 when nothing was pushed.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget all lines. Sequence numbers keep increasing so stale cursors stay valid.
    pub fn clear(&mut self) {
        self.dropped += self.lines.len() as u64;
        self.lines.clear();
    }
}
