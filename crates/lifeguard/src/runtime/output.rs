//! Captured process output

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

/// Which pipe a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One captured line of output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Receives every captured line as it is read
pub trait LogSink: Send + Sync {
    fn write_line(&self, service: &str, stream: OutputStream, line: &str);
}

/// Forwards child output to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogForwarder;

impl LogSink for LogForwarder {
    fn write_line(&self, service: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => log::info!("[{}] {}", service, line),
            OutputStream::Stderr => log::warn!("[{}] {}", service, line),
        }
    }
}

/// Bounded ring of the most recent output lines of a service.
///
/// Written only by the reader tasks of the service's current process; any
/// number of consumers may read concurrently.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Arc<RwLock<VecDeque<OutputLine>>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, stream: OutputStream, line: String) {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(OutputLine { stream, line });
    }

    /// The last `count` lines, oldest first
    pub fn tail(&self, count: usize) -> Vec<OutputLine> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_lines() {
        let buffer = OutputBuffer::new(3);
        for i in 0..5 {
            buffer.push(OutputStream::Stdout, format!("line {}", i));
        }

        assert_eq!(buffer.len(), 3);
        let lines: Vec<_> = buffer.tail(10).into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_tail_returns_oldest_first() {
        let buffer = OutputBuffer::new(10);
        buffer.push(OutputStream::Stdout, "a".to_string());
        buffer.push(OutputStream::Stderr, "b".to_string());
        buffer.push(OutputStream::Stdout, "c".to_string());

        let tail = buffer.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "b");
        assert_eq!(tail[0].stream, OutputStream::Stderr);
        assert_eq!(tail[1].line, "c");
    }

    #[test]
    fn test_clones_share_lines() {
        let buffer = OutputBuffer::new(4);
        let reader = buffer.clone();
        buffer.push(OutputStream::Stdout, "shared".to_string());

        assert!(!reader.is_empty());
        assert_eq!(reader.tail(1)[0].line, "shared");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = OutputBuffer::new(0);
        buffer.push(OutputStream::Stdout, "one".to_string());
        buffer.push(OutputStream::Stdout, "two".to_string());
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.tail(5)[0].line, "two");
    }
}
