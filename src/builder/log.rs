//! Captured tool output

use std::sync::{Mutex, PoisonError};

use apkforge_exec::{OutputHandler, OutputStream};

/// Tool output of the current build, in arrival order.
#[derive(Debug, Default)]
pub struct BuildLog {
    lines: Mutex<Vec<String>>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line not produced by a tool.
    pub fn note(&self, line: impl Into<String>) {
        self.lock().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Remove and return every line.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputHandler for BuildLog {
    fn line(&self, tool: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => tracing::debug!(tool, "{}", line),
            OutputStream::Stderr => tracing::debug!(tool, stream = "stderr", "{}", line),
        }
        let prefix = match stream {
            OutputStream::Stdout => "",
            OutputStream::Stderr => "stderr: ",
        };
        self.lock().push(format!("[{}] {}{}", tool, prefix, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_tagged_with_tool() {
        let log = BuildLog::new();
        log.line("javac", OutputStream::Stdout, "Note: uses unchecked operations");
        log.line("javac", OutputStream::Stderr, "error: cannot find symbol");
        log.note("build cancelled");

        assert_eq!(
            log.lines(),
            vec![
                "[javac] Note: uses unchecked operations",
                "[javac] stderr: error: cannot find symbol",
                "build cancelled",
            ]
        );
    }

    #[test]
    fn test_take_empties_log() {
        let log = BuildLog::new();
        log.note("one");
        assert_eq!(log.take(), vec!["one"]);
        assert!(log.is_empty());
    }
}
