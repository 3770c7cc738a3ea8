use crate::types::ScanSummary;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const REPORT_HEADER: &str = "Scan Report\n===================\n\n";

/// Writes each result line to `out` as it arrives and keeps a copy for the report.
#[derive(Debug)]
pub struct ResultLines<W> {
    out: Mutex<W>,
    lines: Mutex<Vec<String>>,
}

impl<W: io::Write> ResultLines<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, line: String) {
        {
            let mut out = relock(&self.out);
            let _ = writeln!(out, "{line}").and_then(|_| out.flush());
        }
        relock(&self.lines).push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        relock(&self.lines).clone()
    }

    pub fn into_inner(self) -> (W, Vec<String>) {
        (
            self.out.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.lines
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Render collected result lines as a plain-text report.
pub fn render_text_report<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::from(REPORT_HEADER);
    for line in lines {
        let _ = writeln!(out, "{}", line.as_ref());
    }
    out
}

pub fn write_text_report<S: AsRef<str>>(path: &Path, lines: &[S]) -> Result<()> {
    fs::write(path, render_text_report(lines))
        .with_context(|| format!("failed to write report: {}", path.display()))
}

pub fn write_summary_json(path: &Path, summary: &ScanSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create JSON output: {}", path.display()))?;
    serde_json::to_writer_pretty(file, summary)
        .with_context(|| format!("failed to write JSON output: {}", path.display()))?;
    Ok(())
}
