use std::io::{self, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use tracing::debug;

use crate::batch::BatchSummary;
use crate::status::StatusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Redraw the active row in place on every event.
    Interactive,
    /// Print each row once, when it reaches its final status.
    NonInteractive,
}

/// Receives every event of a batch, `path` set to the row name.
pub trait StatusSink {
    fn record(&mut self, event: &StatusEvent);

    fn finish(&mut self, _summary: &BatchSummary) {}
}

impl StatusSink for Vec<StatusEvent> {
    fn record(&mut self, event: &StatusEvent) {
        self.push(event.clone());
    }
}

/// Table of merged rows, one per action.
pub struct TableReporter<W: Write> {
    out: W,
    mode: OutputMode,
    row: Option<StatusEvent>,
    path_width: usize,
}

impl TableReporter<io::Stderr> {
    pub fn stderr(mode: OutputMode) -> Self {
        Self::new(io::stderr(), mode)
    }
}

impl<W: Write> TableReporter<W> {
    pub fn new(out: W, mode: OutputMode) -> Self {
        Self {
            out,
            mode,
            row: None,
            path_width: 32,
        }
    }

    pub fn with_path_width(mut self, width: usize) -> Self {
        self.path_width = width;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, row: &StatusEvent) -> io::Result<()> {
        let line = format_row(row, self.path_width);
        let terminal = row.is_terminal();
        match self.mode {
            OutputMode::Interactive => {
                queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
                write!(self.out, "{line}")?;
                if terminal {
                    writeln!(self.out)?;
                }
            }
            OutputMode::NonInteractive => {
                if terminal {
                    writeln!(self.out, "{line}")?;
                }
            }
        }
        self.out.flush()
    }
}

impl<W: Write> StatusSink for TableReporter<W> {
    fn record(&mut self, event: &StatusEvent) {
        let same_row = matches!(
            (&self.row, &event.path),
            (Some(row), Some(path)) if row.path.as_ref() == Some(path)
        );
        let mut row = match self.row.take() {
            Some(row) if same_row => row,
            _ => StatusEvent::default(),
        };
        row.merge(event);
        if let Err(err) = self.draw(&row) {
            debug!(%err, "failed to draw status row");
        }
        self.row = Some(row);
    }

    fn finish(&mut self, summary: &BatchSummary) {
        let result = writeln!(
            self.out,
            "{} done, {} skipped, {} failed",
            summary.done, summary.skipped, summary.failed
        )
        .and_then(|()| self.out.flush());
        if let Err(err) = result {
            debug!(%err, "failed to write batch summary");
        }
    }
}

/// One JSON object per event, for scripts.
pub struct JsonOutput<W: Write> {
    out: W,
}

impl JsonOutput<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> JsonOutput<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn print_json<T: serde::Serialize>(&mut self, value: &T) -> io::Result<()> {
        let json = serde_json::to_string(value).map_err(io::Error::other)?;
        self.out.write_all(json.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl<W: Write> StatusSink for JsonOutput<W> {
    fn record(&mut self, event: &StatusEvent) {
        if let Err(err) = self.print_json(event) {
            debug!(%err, "failed to print event");
        }
    }

    fn finish(&mut self, summary: &BatchSummary) {
        if let Err(err) = self.print_json(summary) {
            debug!(%err, "failed to print summary");
        }
    }
}

fn format_row(row: &StatusEvent, path_width: usize) -> String {
    let path = row.path.as_deref().unwrap_or("");
    let size = row.size.map(|size| human_bytes(size as f64)).unwrap_or_default();
    let percent = row
        .done_percent
        .map(|percent| format!("{percent:.0}%"))
        .unwrap_or_default();
    let speed = |value: Option<f64>| {
        value
            .map(|value| format!("{}/s", human_bytes(value)))
            .unwrap_or_default()
    };
    let checksum = row.checksum.map(|state| state.as_str()).unwrap_or("");
    let status = row.status.map(|status| status.as_str()).unwrap_or("");
    let mut line = format!(
        "{path:<path_width$} {size:>9} {percent:>5} {dspeed:>11} {wspeed:>11} {checksum:>7} {status}",
        dspeed = speed(row.dspeed),
        wspeed = speed(row.wspeed),
    );
    if let Some(message) = &row.message {
        line.push_str(": ");
        line.push_str(message);
    } else if let Some(progress) = &row.progress {
        line.push(' ');
        line.push_str(progress);
    }
    line.trim_end().to_string()
}

/// Render a byte count with a binary unit: `512 B`, `1.5 KB`, `3.2 GB`.
pub fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ChecksumState;

    fn at(path: &str, mut event: StatusEvent) -> StatusEvent {
        event.path = Some(path.to_string());
        event
    }

    #[test]
    fn human_units() {
        assert_eq!(human_bytes(512.0), "512 B");
        assert_eq!(human_bytes(1536.0), "1.5 KB");
        assert_eq!(human_bytes(5.0 * 1024.0 * 1024.0 * 1024.0), "5.0 GB");
        assert_eq!(human_bytes(3.0 * 1024f64.powi(5)), "3072.0 TB");
    }

    #[test]
    fn non_interactive_prints_final_rows_only() {
        let mut table = TableReporter::new(Vec::new(), OutputMode::NonInteractive).with_path_width(12);
        table.record(&at("IXI-T1.tar", StatusEvent::probed(Some(2048))));
        table.record(&at("IXI-T1.tar", StatusEvent::transfer(2048, Some(2048))));
        table.record(&at("IXI-T1.tar", StatusEvent::checksum(ChecksumState::Ok)));
        table.record(&at("IXI-T1.tar", StatusEvent::done()));
        table.record(&at("IXI-T2.tar", StatusEvent::skipped("already exists")));

        let text = String::from_utf8(table.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("IXI-T1.tar"));
        assert!(lines[0].contains("2.0 KB"));
        assert!(lines[0].contains("100%"));
        assert!(lines[0].contains("ok done"));
        assert!(lines[1].ends_with("skipped: already exists"));
    }

    #[test]
    fn json_lines() {
        let mut json = JsonOutput::new(Vec::new());
        json.record(&at("a.nii", StatusEvent::done()));
        json.finish(&BatchSummary {
            done: 1,
            skipped: 0,
            failed: 0,
        });
        let text = String::from_utf8(json.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[0]["path"], "a.nii");
        assert_eq!(lines[0]["status"], "done");
        assert_eq!(lines[1]["done"], 1);
    }
}
