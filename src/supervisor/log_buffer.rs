use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::rpc::LogLine;

const DEFAULT_MAX_LINES: usize = 10_000;

/// Per-bridge ring buffer of captured worker output.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<LogLine>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line for the given bridge, dropping the oldest when full.
    pub fn push(&self, bridge: &str, line: LogLine) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let entries = logs.entry(bridge.to_string()).or_default();
        entries.push_back(line);
        while entries.len() > self.max_lines {
            entries.pop_front();
        }
    }

    /// The last `n` lines for a bridge (all of them if fewer are stored).
    pub fn tail(&self, bridge: &str, n: usize) -> Vec<LogLine> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = logs.get(bridge) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    pub fn clear(&self, bridge: &str) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.remove(bridge);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
