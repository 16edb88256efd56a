//! DMARC aggregate report (RFC 7489, appendix C).
//!
//! Only the elements needed to identify and summarize a report are typed
//! strictly; enumerated values such as dispositions and auth results are
//! kept as strings so reports from lenient generators still decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Root `<feedback>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub version: Option<String>,
    pub report_metadata: ReportMetadata,
    pub policy_published: PolicyPublished,
    #[serde(default, rename = "record")]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub org_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub extra_contact_info: Option<String>,
    pub report_id: String,
    pub date_range: DateRange,
    #[serde(default, rename = "error")]
    pub errors: Vec<String>,
}

/// Reporting interval as Unix timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub begin: i64,
    pub end: i64,
}

impl DateRange {
    pub fn begin_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.begin, 0)
    }

    pub fn end_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.end, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyPublished {
    pub domain: String,
    #[serde(default)]
    pub adkim: Option<String>,
    #[serde(default)]
    pub aspf: Option<String>,
    pub p: String,
    #[serde(default)]
    pub sp: Option<String>,
    #[serde(default)]
    pub pct: Option<u32>,
    #[serde(default)]
    pub fo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub row: Row,
    pub identifiers: Identifiers,
    #[serde(default)]
    pub auth_results: AuthResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub source_ip: String,
    pub count: u64,
    pub policy_evaluated: PolicyEvaluated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluated {
    pub disposition: String,
    #[serde(default)]
    pub dkim: Option<String>,
    #[serde(default)]
    pub spf: Option<String>,
    #[serde(default, rename = "reason")]
    pub reasons: Vec<PolicyOverrideReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverrideReason {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifiers {
    pub header_from: String,
    #[serde(default)]
    pub envelope_from: Option<String>,
    #[serde(default)]
    pub envelope_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthResults {
    #[serde(default)]
    pub dkim: Vec<DkimAuthResult>,
    #[serde(default)]
    pub spf: Vec<SpfAuthResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkimAuthResult {
    pub domain: String,
    #[serde(default)]
    pub selector: Option<String>,
    pub result: String,
    #[serde(default)]
    pub human_result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpfAuthResult {
    pub domain: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub result: String,
}

impl Feedback {
    /// Total number of messages the report covers.
    pub fn message_count(&self) -> u64 {
        self.records.iter().map(|r| r.row.count).sum()
    }

    /// Messages whose evaluated DKIM or SPF result aligned and passed.
    pub fn dmarc_pass_count(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| {
                let pe = &r.row.policy_evaluated;
                pe.dkim.as_deref() == Some("pass") || pe.spf.as_deref() == Some("pass")
            })
            .map(|r| r.row.count)
            .sum()
    }
}

/// A decoded report together with where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedReport {
    /// Position of the message carrying the attachment.
    pub position: u32,
    /// Attachment filename as declared by the part.
    pub filename: String,
    pub report: Feedback,
}
