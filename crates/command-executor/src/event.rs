//! Raw process events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw event from a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The type of event
    pub event_type: ProcessEventType,
    /// Line of output, for `Stdout`/`Stderr` events
    pub data: Option<String>,
}

impl ProcessEvent {
    /// Create a new process event
    pub fn new(event_type: ProcessEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data: None,
        }
    }

    /// Create a new process event carrying a line of output
    pub fn new_with_data(event_type: ProcessEventType, data: String) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            data: Some(data),
        }
    }

    /// Which output stream the line came from, if this is an output event
    pub fn source(&self) -> Option<LogSource> {
        match self.event_type {
            ProcessEventType::Stdout => Some(LogSource::Stdout),
            ProcessEventType::Stderr => Some(LogSource::Stderr),
            _ => None,
        }
    }
}

/// Types of raw process events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessEventType {
    /// Process has started
    Started {
        /// OS process id
        pid: u32,
    },
    /// Line from stdout
    Stdout,
    /// Line from stderr
    Stderr,
}

/// Source of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}
