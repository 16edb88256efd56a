//! Pipeline coordinator: drives one harvesting run from connect to logout.
//!
//! ```text
//! Idle → Connected → Selected → Fetching → Draining → Finalizing → Closed
//!                                 └──────(nothing new)──────┘
//! ```
//!
//! `Failed` replaces `Closed` when a fatal error occurred anywhere. Logout
//! is attempted exactly once whenever a session was established.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{HarvestError, Result};
use crate::export::sink::ReportSink;
use crate::mailbox::MailboxClient;
use crate::model::outcome::{ExtractionOutcome, RunSummary};
use crate::model::position::{FetchRange, MailboxPosition, MailboxSnapshot};
use crate::parser::mime::Decomposer;
use crate::parser::report::ReportDecoder;
use crate::store::cursor::{CursorRecord, CursorStore};

use super::extractor::Extractor;
use super::fetcher::BatchFetcher;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunState {
    Idle,
    Connected,
    Selected,
    Fetching,
    Draining,
    Finalizing,
    Closed,
    Failed,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    /// One outcome per consumed message, in position order.
    pub outcomes: Vec<ExtractionOutcome>,
    pub summary: RunSummary,
    pub snapshot: Option<MailboxSnapshot>,
    pub range: Option<FetchRange>,
    /// Cursor the run started from.
    pub cursor_before: Option<MailboxPosition>,
    /// Cursor stored at the end of the run.
    pub cursor_after: Option<MailboxPosition>,
    /// The fatal error that ended the run, if any.
    pub error: Option<HarvestError>,
    /// Logout failure; does not make the run fail.
    pub logout_error: Option<HarvestError>,
    /// States visited, ending in `Closed` or `Failed`.
    pub states: Vec<RunState>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            outcomes: Vec::new(),
            summary: RunSummary::default(),
            snapshot: None,
            range: None,
            cursor_before: None,
            cursor_after: None,
            error: None,
            logout_error: None,
            states: vec![RunState::Idle],
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Idle)
    }
}

/// Callback receiving `(consumed, total)` as messages are processed.
pub type Progress<'a> = Box<dyn Fn(u64, u64) + Send + 'a>;

/// Owns the lifecycle of a single run against one mailbox.
pub struct Coordinator<'a> {
    mailbox: String,
    mailbox_id: String,
    store: &'a mut dyn CursorStore,
    sink: &'a mut dyn ReportSink,
    fetcher: BatchFetcher,
    extractor: Extractor,
    progress: Option<Progress<'a>>,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        mailbox: impl Into<String>,
        mailbox_id: impl Into<String>,
        store: &'a mut dyn CursorStore,
        sink: &'a mut dyn ReportSink,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            mailbox_id: mailbox_id.into(),
            store,
            sink,
            fetcher: BatchFetcher::new(4),
            extractor: Extractor::default(),
            progress: None,
        }
    }

    /// Build a coordinator with the mailbox, limits and timeouts of `config`.
    pub fn from_config(
        config: &Config,
        store: &'a mut dyn CursorStore,
        sink: &'a mut dyn ReportSink,
    ) -> Self {
        let pipeline = &config.pipeline;
        let fetcher = BatchFetcher::new(pipeline.queue_capacity)
            .with_read_timeout(Duration::from_secs(config.imap.read_timeout_secs));
        let extractor = Extractor::new(
            Decomposer::new(pipeline.max_parts, pipeline.max_depth),
            ReportDecoder::new(pipeline.max_report_size),
            pipeline.compressed_hint,
        );
        Self::new(
            config.imap.mailbox_name(),
            config.imap.mailbox_id(),
            store,
            sink,
        )
        .with_fetcher(fetcher)
        .with_extractor(extractor)
    }

    pub fn with_fetcher(mut self, fetcher: BatchFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(u64, u64) + Send + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Run once: connect, select, fetch everything past the cursor, store
    /// the new cursor, log out.
    pub async fn run<C, F>(mut self, connect: F) -> RunReport
    where
        C: MailboxClient,
        F: Future<Output = Result<C>>,
    {
        let mut report = RunReport::new();

        let client = match connect.await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "imap: connect failed");
                report.error = Some(e);
                enter(&mut report, RunState::Failed);
                return report;
            }
        };
        enter(&mut report, RunState::Connected);

        let (client, result) = self.harvest(client, &mut report).await;
        if let Err(e) = result {
            error!(error = %e, fatal = e.is_fatal(), "Run failed");
            report.error = Some(e);
        }
        if report.final_state() != RunState::Finalizing {
            enter(&mut report, RunState::Finalizing);
        }

        match client {
            Some(mut client) => {
                if let Err(e) = client.logout().await {
                    error!(error = %e, "imap: logout error");
                    report.logout_error = Some(e);
                }
            }
            None => warn!("Session lost with the fetch task; logout skipped"),
        }

        let last = if report.error.is_some() {
            RunState::Failed
        } else {
            RunState::Closed
        };
        enter(&mut report, last);
        info!(
            messages = report.summary.messages,
            with_reports = report.summary.with_reports,
            errors = report.summary.errors,
            cursor = ?report.cursor_after.map(MailboxPosition::get),
            state = ?last,
            "Run finished"
        );
        report
    }

    /// Everything between `Connected` and `Finalizing`. Hands the client back
    /// unless the fetch task lost it.
    ///
    /// Extraction and sink delivery run inline on the runtime thread and may
    /// block on stdout or file writes. The fetch task keeps reading ahead up
    /// to the queue capacity meanwhile.
    async fn harvest<C: MailboxClient>(
        &mut self,
        mut client: C,
        report: &mut RunReport,
    ) -> (Option<C>, Result<()>) {
        let snapshot = match client.select(&self.mailbox).await {
            Ok(snapshot) => snapshot,
            Err(e) => return (Some(client), Err(e)),
        };
        report.snapshot = Some(snapshot);
        enter(report, RunState::Selected);

        let cursor = match self.read_cursor(&snapshot) {
            Ok(cursor) => cursor,
            Err(e) => return (Some(client), Err(e)),
        };
        report.cursor_before = Some(cursor);
        report.cursor_after = Some(cursor);

        let Some(range) = FetchRange::compute(cursor, &snapshot) else {
            if cursor > snapshot.total_messages {
                warn!(
                    cursor = cursor.get(),
                    total = snapshot.total_messages.get(),
                    "Cursor is past the end of the mailbox"
                );
            }
            info!(cursor = cursor.get(), "No new messages");
            enter(report, RunState::Finalizing);
            return (Some(client), Ok(()));
        };
        report.range = Some(range);
        enter(report, RunState::Fetching);
        info!(range = %range, count = range.len(), "Fetching messages");

        let mut fetch = self.fetcher.start(client, range);
        enter(report, RunState::Draining);

        let mut last_consumed: Option<MailboxPosition> = None;
        let mut fetch_error = None;
        while let Some(item) = fetch.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    fetch_error = Some(e);
                    break;
                }
            };
            let outcome = self.extractor.process_message(&message, &mut *self.sink);
            log_outcome(&outcome);
            last_consumed = Some(last_consumed.map_or(outcome.position, |p| p.max(outcome.position)));
            report.summary.record(&outcome);
            report.outcomes.push(outcome);
            if let Some(progress) = &self.progress {
                progress(report.outcomes.len() as u64, range.len());
            }
        }

        let client = match fetch.finish().await {
            Ok(client) => Some(client),
            Err(e) => {
                fetch_error.get_or_insert(e);
                None
            }
        };
        enter(report, RunState::Finalizing);

        if let Some(position) = last_consumed {
            let record = CursorRecord::new(position, snapshot.uid_validity);
            match self.store.write_cursor(&self.mailbox_id, record) {
                Ok(()) => {
                    report.cursor_after = Some(position);
                    debug!(position = position.get(), "Cursor advanced");
                }
                Err(e) => {
                    if fetch_error.is_some() {
                        error!(error = %e, "Could not store cursor");
                    } else {
                        fetch_error = Some(e);
                    }
                }
            }
        }

        (client, fetch_error.map_or(Ok(()), Err))
    }

    /// Stored position, or the first message when none is stored or the
    /// mailbox was rebuilt since it was recorded.
    fn read_cursor(&self, snapshot: &MailboxSnapshot) -> Result<MailboxPosition> {
        let Some(record) = self.store.read_cursor(&self.mailbox_id)? else {
            debug!(mailbox_id = %self.mailbox_id, "No stored cursor, starting at 1");
            return Ok(MailboxPosition::FIRST);
        };
        match (record.uid_validity, snapshot.uid_validity) {
            (Some(stored), Some(current)) if stored != current => {
                warn!(
                    stored,
                    current,
                    "UIDVALIDITY changed, restarting from the first message"
                );
                Ok(MailboxPosition::FIRST)
            }
            _ => Ok(record.position),
        }
    }
}

fn enter(report: &mut RunReport, state: RunState) {
    debug!(from = ?report.final_state(), to = ?state, "Run state");
    report.states.push(state);
}

fn log_outcome(outcome: &ExtractionOutcome) {
    debug!(
        position = outcome.position.get(),
        found = outcome.attachments_found,
        parsed = outcome.attachments_parsed,
        errors = outcome.errors.len(),
        "Message processed"
    );
}
