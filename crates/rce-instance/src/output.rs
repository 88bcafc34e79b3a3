//! User-facing text output of management commands

use std::sync::Mutex;
use tracing::info;

/// Receives progress and result lines meant for a user
pub trait TextOutputReceiver: Send + Sync {
    fn add_output(&self, line: &str);
}

/// Forwards every line to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutputReceiver;

impl TextOutputReceiver for TracingOutputReceiver {
    fn add_output(&self, line: &str) {
        info!(target: "rce_instance::output", "{}", line);
    }
}

/// Keeps all lines, e.g. for a remote caller or a test
#[derive(Debug, Default)]
pub struct CollectingOutputReceiver {
    lines: Mutex<Vec<String>>,
}

impl CollectingOutputReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|line| line.contains(fragment))
    }
}

impl TextOutputReceiver for CollectingOutputReceiver {
    fn add_output(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.to_string());
    }
}
