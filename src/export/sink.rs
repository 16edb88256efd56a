//! Downstream destinations for decoded reports.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::model::report::ExtractedReport;

/// Receives every report the pipeline decodes, in mailbox order.
pub trait ReportSink: Send {
    fn deliver(&mut self, report: &ExtractedReport) -> Result<()>;
}

/// Collects reports in memory.
impl ReportSink for Vec<ExtractedReport> {
    fn deliver(&mut self, report: &ExtractedReport) -> Result<()> {
        self.push(report.clone());
        Ok(())
    }
}

/// Delivers to several sinks in turn; stops at the first failure.
///
/// An empty fan-out refuses every report rather than dropping it.
#[derive(Default)]
pub struct FanOut(pub Vec<Box<dyn ReportSink>>);

impl ReportSink for FanOut {
    fn deliver(&mut self, report: &ExtractedReport) -> Result<()> {
        if self.0.is_empty() {
            return Err(HarvestError::Sink("no report destination configured".into()));
        }
        for sink in &mut self.0 {
            sink.deliver(report)?;
        }
        Ok(())
    }
}

/// Destinations for one CLI run.
///
/// Text mode prints a line per report; JSON mode keeps every report for the
/// final document. Either way `dir` additionally receives one file per report.
pub struct RunOutput {
    collected: Option<Vec<ExtractedReport>>,
    sinks: FanOut,
}

impl RunOutput {
    pub fn new(json: bool, dir: Option<&Path>) -> Result<Self> {
        let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
        if !json {
            sinks.push(Box::new(PrintSink::new(std::io::stdout())));
        }
        if let Some(dir) = dir {
            sinks.push(Box::new(JsonDirSink::create(dir)?));
        }
        Ok(Self {
            collected: json.then(Vec::new),
            sinks: FanOut(sinks),
        })
    }

    /// Reports kept in JSON mode, in delivery order.
    pub fn into_collected(self) -> Vec<ExtractedReport> {
        self.collected.unwrap_or_default()
    }
}

impl ReportSink for RunOutput {
    fn deliver(&mut self, report: &ExtractedReport) -> Result<()> {
        if let Some(collected) = &mut self.collected {
            collected.push(report.clone());
            if self.sinks.0.is_empty() {
                return Ok(());
            }
        }
        self.sinks.deliver(report)
    }
}

/// Prints a one-line summary per report.
pub struct PrintSink<W> {
    out: W,
}

impl<W: Write + Send> PrintSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ReportSink for PrintSink<W> {
    fn deliver(&mut self, extracted: &ExtractedReport) -> Result<()> {
        let report = &extracted.report;
        let meta = &report.report_metadata;
        let range = match (meta.date_range.begin_utc(), meta.date_range.end_utc()) {
            (Some(b), Some(e)) => format!("{}..{}", b.format("%Y-%m-%d"), e.format("%Y-%m-%d")),
            _ => format!("{}..{}", meta.date_range.begin, meta.date_range.end),
        };
        writeln!(
            self.out,
            "  #{:<6} {:<24} {:<28} {:<24} {}  records={} messages={} pass={}",
            extracted.position,
            truncate(&meta.org_name, 24),
            truncate(&meta.report_id, 28),
            truncate(&report.policy_published.domain, 24),
            range,
            report.records.len(),
            report.message_count(),
            report.dmarc_pass_count(),
        )
        .map_err(|e| HarvestError::Sink(e.to_string()))
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Writes each report as pretty JSON into a directory.
///
/// File names are `{org}_{report_id}.json`; existing files are never
/// overwritten.
#[derive(Debug)]
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    /// Create the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| HarvestError::Sink(format!("cannot create '{}': {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ReportSink for JsonDirSink {
    fn deliver(&mut self, extracted: &ExtractedReport) -> Result<()> {
        let meta = &extracted.report.report_metadata;
        let name = format!(
            "{}_{}.json",
            sanitize_filename_part(&meta.org_name, 60),
            sanitize_filename_part(&meta.report_id, 120)
        );
        let path = unique_path(&self.dir.join(name));
        let json = serde_json::to_vec_pretty(extracted)
            .map_err(|e| HarvestError::Sink(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| HarvestError::Sink(format!("cannot write '{}': {e}", path.display())))?;
        debug!(path = %path.display(), "Wrote report");
        Ok(())
    }
}

/// Sanitize a string for use in filenames.
///
/// Replaces invalid characters with `_` and truncates to `max_len`.
pub fn sanitize_filename_part(s: &str, max_len: usize) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// If `path` already exists, append a counter to make it unique.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("report");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 1..1000 {
        let candidate = if ext.is_empty() {
            parent.join(format!("{stem}_{i}"))
        } else {
            parent.join(format!("{stem}_{i}.{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }

    parent.join(format!("{stem}_dup.{ext}"))
}
