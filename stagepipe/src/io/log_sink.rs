//! Pipeline log lines.
//!
//! The product log: "Checking on b0.nii ... [ ok ]" style lines, stage
//! banners and posted child output. Each line carries a debug level; the
//! console shows it when `level <= verbosity`, the optional log file records
//! everything.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::format::{Pad, check_line, pad_text};

/// Level for lines that are always shown.
pub const ALWAYS: u8 = 0;
/// Level for posted child stdout/stderr.
pub const CHILD_OUTPUT: u8 = 1;
/// Level for per-check detail lines.
pub const DETAIL: u8 = 9;

/// Sink for formatted pipeline log lines.
pub trait LogSink {
    /// Emit `text` (not newline-terminated implicitly) at `level` with width hints.
    fn log(&self, level: u8, text: &str, pad: Pad);

    /// Column widths for check lines.
    fn widths(&self) -> (usize, usize) {
        (60, 20)
    }

    /// Emit one unpadded line at `ALWAYS`.
    fn line(&self, text: &str) {
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.log(ALWAYS, &text, Pad::NONE);
    }

    /// Echo a command line about to run, at `ALWAYS`.
    fn command(&self, command: &str) {
        self.line(&format!("$ {command}"));
    }

    /// Emit a two-column check line at `DETAIL`.
    fn check(&self, label: &str, status: &str) {
        let (left, right) = self.widths();
        self.log(DETAIL, &check_line(label, status, left, right), Pad::NONE);
    }
}

/// Writes gated lines to stdout and every line to an optional log file.
pub struct ConsoleSink {
    verbosity: u8,
    left_width: usize,
    right_width: usize,
    tee: Option<Mutex<BufWriter<File>>>,
}

impl ConsoleSink {
    pub fn new(verbosity: u8, left_width: usize, right_width: usize) -> Self {
        Self {
            verbosity,
            left_width,
            right_width,
            tee: None,
        }
    }

    /// Also append every line (regardless of verbosity) to `path`.
    pub fn with_log_file(mut self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        self.tee = Some(Mutex::new(BufWriter::new(file)));
        Ok(self)
    }
}

impl LogSink for ConsoleSink {
    fn log(&self, level: u8, text: &str, pad: Pad) {
        let text = pad_text(text, pad);
        if level <= self.verbosity {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
                warn!(err = %e, "failed to write pipeline log to stdout");
            }
        }
        if let Some(tee) = &self.tee
            && let Ok(mut writer) = tee.lock()
            && let Err(e) = writer.write_all(text.as_bytes()).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write pipeline log file");
        }
    }

    fn widths(&self) -> (usize, usize) {
        (self.left_width, self.right_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn log_file_records_lines_above_verbosity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline.log");
        let sink = ConsoleSink::new(0, 12, 8)
            .with_log_file(&path)
            .expect("sink");

        sink.line("INIT: stagepipe run");
        sink.check("Checking on", "ok");

        let contents = fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "INIT: stagepipe run\nChecking on   [ ok ]\n");
    }

    #[test]
    fn visible_lines_reach_console_and_log_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline.log");
        let sink = ConsoleSink::new(DETAIL, 12, 8)
            .with_log_file(&path)
            .expect("sink");

        sink.command("bet.py s1");
        sink.log(CHILD_OUTPUT, "voxels: 1024\n", Pad::NONE);

        let contents = fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "$ bet.py s1\nvoxels: 1024\n");
    }

    #[test]
    fn widths_follow_configuration() {
        let sink = ConsoleSink::new(0, 85, 20);
        assert_eq!(sink.widths(), (85, 20));
    }
}
