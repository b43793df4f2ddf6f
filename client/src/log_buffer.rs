//! Capped log stream with follow/pin viewing modes
//!
//! Entries are kept in arrival order and never reordered. When the buffer is
//! full the oldest entry is evicted. The rendering side reports whether the
//! user is scrolled to the bottom; scrolling away pins the view, and entries
//! arriving while pinned are counted as unseen until the user returns.

use shared::LogLine;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    /// Lifecycle messages produced by the client itself
    System,
}

impl Severity {
    /// Uses the explicit level when it is recognized, otherwise falls back
    /// to conventional prefixes such as `[WARN]` or `ERROR:`
    pub fn classify(level: Option<&str>, text: &str) -> Self {
        if let Some(severity) = level.and_then(Self::from_label) {
            return severity;
        }

        let head = text
            .trim_start()
            .trim_start_matches('[')
            .split(|c: char| c == ']' || c == ':' || c.is_whitespace())
            .next()
            .unwrap_or("");
        Self::from_label(head).unwrap_or(Severity::Info)
    }

    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warning),
            "error" | "err" | "fatal" => Some(Severity::Error),
            "system" | "sys" => Some(Severity::System),
            _ => None,
        }
    }
}

pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub text: String,
    pub severity: Severity,
}

impl LogEntry {
    pub fn new(text: &str, severity: Severity) -> Self {
        Self {
            timestamp: get_timestamp(),
            text: text.to_string(),
            severity,
        }
    }

    pub fn system(text: &str) -> Self {
        Self::new(text, Severity::System)
    }

    pub fn from_line(line: &LogLine) -> Self {
        Self {
            timestamp: line.timestamp.unwrap_or_else(get_timestamp),
            text: line.text.clone(),
            severity: Severity::classify(line.level.as_deref(), &line.text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Following,
    PinnedByUser,
}

pub struct LogStreamBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    mode: ViewMode,
    unseen: usize,
    evicted: u64,
}

impl LogStreamBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            mode: ViewMode::Following,
            unseen: 0,
            evicted: 0,
        }
    }

    pub fn append(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);

        if self.mode == ViewMode::PinnedByUser {
            self.unseen = (self.unseen + 1).min(self.capacity);
        }
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Scroll feedback from the renderer
    pub fn set_scrolled_to_bottom(&mut self, at_bottom: bool) {
        if at_bottom {
            self.mode = ViewMode::Following;
            self.unseen = 0;
        } else {
            self.mode = ViewMode::PinnedByUser;
        }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Whether the newest entry is inside the visible window
    pub fn latest_visible(&self) -> bool {
        self.mode == ViewMode::Following || self.unseen == 0
    }

    /// Entries appended while pinned, capped at what is still buffered
    pub fn unseen(&self) -> usize {
        self.unseen
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.unseen = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
