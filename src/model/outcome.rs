//! Per-message extraction outcomes and the run summary they fold into.

use crate::error::HarvestError;

use super::position::MailboxPosition;

/// What happened to one fetched message.
///
/// Every message pulled from the mailbox produces exactly one outcome, even
/// when its structure could not be walked.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub position: MailboxPosition,
    /// Parts classified as attachments.
    pub attachments_found: usize,
    /// Attachments that decoded into a report and reached the sink.
    pub attachments_parsed: usize,
    /// Contained errors, in the order they occurred.
    pub errors: Vec<HarvestError>,
}

impl ExtractionOutcome {
    pub fn new(position: MailboxPosition) -> Self {
        Self {
            position,
            attachments_found: 0,
            attachments_parsed: 0,
            errors: Vec::new(),
        }
    }

    /// At least one report was extracted from the message.
    pub fn is_success(&self) -> bool {
        self.attachments_parsed > 0
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments_found > 0
    }
}

/// Aggregated counts over all outcomes of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunSummary {
    pub messages: usize,
    /// Messages that yielded at least one report.
    pub with_reports: usize,
    pub without_attachments: usize,
    /// Messages with attachments none of which decoded.
    pub failed: usize,
    pub attachments_found: usize,
    pub attachments_parsed: usize,
    pub errors: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &ExtractionOutcome) {
        self.messages += 1;
        self.attachments_found += outcome.attachments_found;
        self.attachments_parsed += outcome.attachments_parsed;
        self.errors += outcome.errors.len();
        if outcome.is_success() {
            self.with_reports += 1;
        } else if !outcome.has_attachments() {
            self.without_attachments += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ExtractionOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        summary
    }
}
