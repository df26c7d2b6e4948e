use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

use crate::modules::types::LogLevel;

// -------------------- Ring Log --------------------
// Process-local bounded activity buffer, one per strategy kind. The runner
// writes, the status surface reads; both hold the same Arc.

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RingEntry {
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RingLog {
    capacity: usize,
    entries: Mutex<VecDeque<RingEntry>>,
}

impl RingLog {
    pub fn new(capacity: usize) -> Self {
        RingLog {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Insert at the head, evict at the tail.
    pub fn push(&self, level: LogLevel, message: impl Into<String>, data: Value) {
        let entry = RingEntry {
            level,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(entry);
    }

    pub fn info(&self, message: impl Into<String>, data: Value) {
        self.push(LogLevel::Info, message, data);
    }

    pub fn warning(&self, message: impl Into<String>, data: Value) {
        self.push(LogLevel::Warning, message, data);
    }

    pub fn error(&self, message: impl Into<String>, data: Value) {
        self.push(LogLevel::Error, message, data);
    }

    /// Newest-first copy of up to `limit` entries.
    pub fn snapshot(&self, limit: usize) -> Vec<RingEntry> {
        let entries = self.entries.lock();
        entries.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_evicts_at_capacity() {
        let ring = RingLog::new(3);
        for i in 0..5 {
            ring.push(LogLevel::Info, format!("entry {i}"), json!({ "i": i }));
        }
        assert_eq!(ring.len(), 3);
        let snap = ring.snapshot(10);
        // Newest first; the two oldest entries were evicted
        assert_eq!(snap[0].message, "entry 4");
        assert_eq!(snap[2].message, "entry 2");
    }

    #[test]
    fn snapshot_respects_limit() {
        let ring = RingLog::new(10);
        for i in 0..6 {
            ring.info(format!("m{i}"), Value::Null);
        }
        let snap = ring.snapshot(2);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].message, "m5");
    }
}
