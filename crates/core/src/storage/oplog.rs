//! Plain-text operational trace written next to the index (`log.txt`).
//! Diagnostic only; nothing reads it back.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::Result;

pub struct OperationLog {
    writer: Mutex<BufWriter<File>>,
}

impl OperationLog {
    /// Opens the log for appending, starting over when it grew past `max_bytes`.
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let oversized = fs::metadata(path).is_ok_and(|m| m.len() > max_bytes);
        let file = OpenOptions::new()
            .create(true)
            .append(!oversized)
            .write(true)
            .truncate(oversized)
            .open(path)?;
        if oversized {
            debug!("Truncated oversized operation log {}", path.display());
        }
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn line(&self, message: impl AsRef<str>) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let _ = writeln!(writer, "{secs} {}", message.as_ref());
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lines_are_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        let log = OperationLog::open(&path, 1024).unwrap();
        log.line("batch size=3");
        log.line("compaction gap=10");

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().ends_with("batch size=3"));
    }

    #[test]
    fn test_oversized_log_starts_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "x".repeat(64)).unwrap();

        let log = OperationLog::open(&path, 16).unwrap();
        log.line("fresh");
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains('x'));
    }
}
