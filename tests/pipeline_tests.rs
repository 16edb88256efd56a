//! End-to-end runs of the harvesting pipeline against a scripted mailbox.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, BoxStream, StreamExt};

use dmarc_harvest::error::{HarvestError, Result};
use dmarc_harvest::export::sink::RunOutput;
use dmarc_harvest::mailbox::{MailboxClient, RawMessage};
use dmarc_harvest::model::position::{FetchRange, MailboxPosition, MailboxSnapshot};
use dmarc_harvest::model::report::ExtractedReport;
use dmarc_harvest::parser::mime::Decomposer;
use dmarc_harvest::parser::report::ReportDecoder;
use dmarc_harvest::pipeline::coordinator::{Coordinator, RunState};
use dmarc_harvest::pipeline::extractor::Extractor;
use dmarc_harvest::store::cursor::{CursorRecord, CursorStore, JsonCursorStore, MemoryCursorStore};

const ID: &str = "dmarc@imap.example.com/inbox";

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn report_xml() -> Vec<u8> {
    std::fs::read(fixture("report.xml")).unwrap()
}

fn zipped(name: &str, data: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(name, zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(data).unwrap();
    writer.finish().unwrap().into_inner()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

// ─── Message builders ───────────────────────────────────────────────

fn plain_message(subject: &str) -> Vec<u8> {
    format!(
        "From: someone@example.org\r\nTo: dmarc@example.com\r\nSubject: {subject}\r\n\
Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\r\nNothing attached here.\r\n"
    )
    .into_bytes()
}

/// A multipart report message with one base64 attachment per entry.
fn report_message(attachments: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut out = String::from(
        "From: noreply-dmarc-support@google.com\r\nTo: dmarc@example.com\r\n\
Subject: Report domain: example.com Submitter: google.com\r\n\
Date: Tue, 2 Jan 2024 09:00:00 +0000\r\nMIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\r\n\
--b1\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nThis is an aggregate report.\r\n",
    );
    for (name, content_type, data) in attachments {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        out.push_str(&format!(
            "--b1\r\nContent-Type: {content_type}; name=\"{name}\"\r\n\
Content-Disposition: attachment; filename=\"{name}\"\r\n\
Content-Transfer-Encoding: base64\r\n\r\n"
        ));
        for line in encoded.as_bytes().chunks(76) {
            out.push_str(std::str::from_utf8(line).unwrap());
            out.push_str("\r\n");
        }
    }
    out.push_str("--b1--\r\n");
    out.into_bytes()
}

// ─── Scripted mailbox ───────────────────────────────────────────────

#[derive(Clone, Default)]
struct Calls {
    selects: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
    logouts: Arc<AtomicUsize>,
    served: Arc<Mutex<Vec<u32>>>,
}

impl Calls {
    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    fn served(&self) -> Vec<u32> {
        self.served.lock().unwrap().clone()
    }
}

/// Serves `messages[p - 1]` for position `p`.
struct ScriptedMailbox {
    messages: Vec<Vec<u8>>,
    uid_validity: Option<u32>,
    fail_at: Option<u32>,
    select_error: bool,
    calls: Calls,
}

impl ScriptedMailbox {
    fn new(messages: Vec<Vec<u8>>) -> Self {
        Self {
            messages,
            uid_validity: Some(1700),
            fail_at: None,
            select_error: false,
            calls: Calls::default(),
        }
    }

    fn failing_at(mut self, position: u32) -> Self {
        self.fail_at = Some(position);
        self
    }
}

#[async_trait]
impl MailboxClient for ScriptedMailbox {
    async fn select(&mut self, name: &str) -> Result<MailboxSnapshot> {
        self.calls.selects.fetch_add(1, Ordering::SeqCst);
        if self.select_error {
            return Err(HarvestError::MailboxSelect {
                mailbox: name.to_string(),
                reason: "Mailbox doesn't exist".into(),
            });
        }
        Ok(MailboxSnapshot {
            total_messages: MailboxPosition(self.messages.len() as u32),
            uid_validity: self.uid_validity,
        })
    }

    async fn fetch_range<'a>(
        &'a mut self,
        range: FetchRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>> {
        self.calls.fetches.fetch_add(1, Ordering::SeqCst);
        let fail_at = self.fail_at;
        let served = self.calls.served.clone();
        let messages = &self.messages;
        Ok(stream::iter(range.positions().map(move |p| {
            if Some(p.get()) == fail_at {
                return Err(HarvestError::Network("connection reset by peer".into()));
            }
            served.lock().unwrap().push(p.get());
            let body = messages
                .get(p.get() as usize - 1)
                .cloned()
                .ok_or(HarvestError::MissingBody { position: p.get() })?;
            Ok(RawMessage { position: p, body })
        }))
        .boxed())
    }

    async fn logout(&mut self) -> Result<()> {
        self.calls.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn stored(store: &dyn CursorStore) -> Option<u32> {
    store
        .read_cursor(ID)
        .unwrap()
        .map(|record| record.position.get())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_gzip_report() {
    let xml = report_xml();
    let mailbox = ScriptedMailbox::new(vec![
        report_message(&[(
            "google.com!example.com!1704067200!1704153599.xml.gz",
            "application/gzip",
            &gzip(&xml),
        )]),
        plain_message("Hello"),
    ]);
    let calls = mailbox.calls.clone();
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    assert!(report.is_success(), "run failed: {:?}", report.error);
    assert_eq!(report.final_state(), RunState::Closed);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[0].is_success());
    assert!(!report.outcomes[1].is_success());
    assert_eq!(report.summary.with_reports, 1);
    assert_eq!(report.summary.without_attachments, 1);
    assert_eq!(report.cursor_before, Some(MailboxPosition(1)));
    assert_eq!(report.cursor_after, Some(MailboxPosition(2)));
    assert_eq!(stored(&store), Some(2));
    assert_eq!(calls.logouts(), 1);

    assert_eq!(reports.len(), 1);
    let feedback = &reports[0].report;
    assert_eq!(reports[0].position, 1);
    assert_eq!(feedback.report_metadata.org_name, "google.com");
    assert_eq!(feedback.report_metadata.report_id, "4912807263478192375");
    assert_eq!(feedback.policy_published.domain, "example.com");
    assert_eq!(feedback.records.len(), 2);
    assert_eq!(feedback.message_count(), 15);
    assert_eq!(feedback.dmarc_pass_count(), 12);
}

#[tokio::test]
async fn test_nothing_new_is_a_no_op() {
    let messages = (0..5).map(|i| plain_message(&format!("m{i}"))).collect();
    let mailbox = ScriptedMailbox::new(messages);
    let calls = mailbox.calls.clone();
    let mut store = MemoryCursorStore::seeded(
        ID,
        Some(CursorRecord::new(MailboxPosition(5), Some(1700))),
    );
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    assert!(report.is_success());
    assert_eq!(report.range, None);
    assert!(report.outcomes.is_empty());
    assert_eq!(calls.fetches(), 0);
    assert_eq!(calls.logouts(), 1);
    assert_eq!(store.writes(), 0);
    assert_eq!(stored(&store), Some(5));
    assert!(!report.states.contains(&RunState::Fetching));
}

#[tokio::test]
async fn test_range_starts_at_cursor() {
    let messages = (0..3).map(|i| plain_message(&format!("m{i}"))).collect();
    let mailbox = ScriptedMailbox::new(messages);
    let calls = mailbox.calls.clone();
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    assert_eq!(calls.served(), vec![1, 2, 3]);
    let positions: Vec<u32> = report.outcomes.iter().map(|o| o.position.get()).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert_eq!(stored(&store), Some(3));
}

#[tokio::test]
async fn test_cursor_never_moves_backwards() {
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();
    let mut previous = 0;

    for total in [2usize, 2, 4, 7] {
        let messages = (0..total).map(|i| plain_message(&format!("m{i}"))).collect();
        let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
            .run(async { Ok(ScriptedMailbox::new(messages)) })
            .await;
        assert!(report.is_success());
        let now = stored(&store).unwrap();
        assert!(now >= previous);
        assert_eq!(now as usize, total);
        previous = now;
    }
}

#[tokio::test]
async fn test_transport_error_keeps_partial_progress() {
    let messages = (0..6).map(|i| plain_message(&format!("m{i}"))).collect();
    let mailbox = ScriptedMailbox::new(messages).failing_at(4);
    let calls = mailbox.calls.clone();
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    assert!(!report.is_success());
    assert!(matches!(report.error, Some(HarvestError::Network(_))));
    assert_eq!(report.final_state(), RunState::Failed);
    assert!(report.states.contains(&RunState::Finalizing));
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(stored(&store), Some(3));
    assert_eq!(calls.logouts(), 1);
}

#[tokio::test]
async fn test_structural_error_does_not_stop_the_run() {
    let xml = report_xml();
    let crowded = report_message(&[
        ("a.xml", "text/xml", &xml),
        ("b.xml", "text/xml", &xml),
        ("c.xml", "text/xml", &xml),
    ]);
    let mailbox = ScriptedMailbox::new(vec![crowded, plain_message("after")]);
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();
    let extractor = Extractor::new(Decomposer::new(2, 10), ReportDecoder::default(), false);

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .with_extractor(extractor)
        .run(async { Ok(mailbox) })
        .await;

    assert!(report.is_success());
    let first = &report.outcomes[0];
    // Text part plus a.xml fit; b.xml trips the limit.
    assert_eq!(first.attachments_found, 1);
    assert_eq!(first.attachments_parsed, 1);
    assert!(matches!(
        first.errors[..],
        [HarvestError::StructuralParse { position: 1, .. }]
    ));
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(stored(&store), Some(2));
}

#[tokio::test]
async fn test_bad_attachment_does_not_hide_good_ones() {
    let xml = report_xml();
    let mailbox = ScriptedMailbox::new(vec![
        report_message(&[
            ("one.xml", "text/xml", &xml),
            ("two.xml.gz", "application/gzip", b"definitely not gzip"),
            ("three.xml.gz", "application/gzip", &gzip(&xml)),
        ]),
        plain_message("after"),
    ]);
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.attachments_found, 3);
    assert_eq!(outcome.attachments_parsed, 2);
    assert!(matches!(
        &outcome.errors[..],
        [HarvestError::Decode { filename, .. }] if filename == "two.xml.gz"
    ));
    let names: Vec<&str> = reports.iter().map(|r| r.filename.as_str()).collect();
    assert_eq!(names, vec!["one.xml", "three.xml.gz"]);
}

#[tokio::test]
async fn test_zipped_report_is_decoded() {
    let xml = report_xml();
    let archive = zipped("google.com!example.com!1704067200!1704153599.xml", &xml);
    let mailbox = ScriptedMailbox::new(vec![
        report_message(&[(
            "google.com!example.com!1704067200!1704153599.zip",
            "application/zip",
            &archive,
        )]),
        plain_message("after"),
    ]);
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.attachments_found, 1);
    assert_eq!(outcome.attachments_parsed, 1);
    assert!(outcome.errors.is_empty());
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].report.report_metadata.org_name, "google.com");
    assert_eq!(reports[0].report.message_count(), 15);
    assert_eq!(stored(&store), Some(2));
}

#[tokio::test]
async fn test_json_output_keeps_every_report() {
    let xml = report_xml();
    let mailbox = ScriptedMailbox::new(vec![
        report_message(&[("a.xml", "text/xml", &xml)]),
        report_message(&[("b.xml.gz", "application/gzip", &gzip(&xml))]),
    ]);
    let mut store = MemoryCursorStore::new();
    let mut output = RunOutput::new(true, None).unwrap();

    let report = Coordinator::new("inbox", ID, &mut store, &mut output)
        .run(async { Ok(mailbox) })
        .await;

    assert!(report.is_success());
    assert_eq!(report.summary.attachments_parsed, 2);
    let collected = output.into_collected();
    let names: Vec<&str> = collected.iter().map(|r| r.filename.as_str()).collect();
    assert_eq!(names, vec!["a.xml", "b.xml.gz"]);
    assert_eq!(stored(&store), Some(2));
}

#[tokio::test]
async fn test_select_failure_fails_run_without_cursor_write() {
    let mut mailbox = ScriptedMailbox::new(vec![plain_message("x")]);
    mailbox.select_error = true;
    let calls = mailbox.calls.clone();
    let mut store = MemoryCursorStore::new();
    let mut reports: Vec<ExtractedReport> = Vec::new();

    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    assert!(matches!(report.error, Some(HarvestError::MailboxSelect { .. })));
    assert_eq!(report.final_state(), RunState::Failed);
    assert_eq!(calls.fetches(), 0);
    assert_eq!(calls.logouts(), 1);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn test_json_store_survives_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cursors.json");
    let mut reports: Vec<ExtractedReport> = Vec::new();

    {
        let mut store = JsonCursorStore::new(&path);
        let messages = (0..2).map(|i| plain_message(&format!("m{i}"))).collect();
        let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
            .run(async { Ok(ScriptedMailbox::new(messages)) })
            .await;
        assert!(report.is_success());
    }

    let mut store = JsonCursorStore::new(&path);
    assert_eq!(stored(&store), Some(2));

    let messages = (0..4).map(|i| plain_message(&format!("m{i}"))).collect();
    let mailbox = ScriptedMailbox::new(messages);
    let calls = mailbox.calls.clone();
    let report = Coordinator::new("inbox", ID, &mut store, &mut reports)
        .run(async { Ok(mailbox) })
        .await;

    assert_eq!(report.cursor_before, Some(MailboxPosition(2)));
    assert_eq!(calls.served(), vec![2, 3, 4]);
    assert_eq!(stored(&store), Some(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_report_files_written_during_drain() {
    let tmp = tempfile::tempdir().unwrap();
    let xml = report_xml();
    let mailbox = ScriptedMailbox::new(vec![
        report_message(&[("a.xml", "text/xml", &xml)]),
        plain_message("after"),
    ]);
    let mut store = MemoryCursorStore::new();
    let mut output = RunOutput::new(true, Some(tmp.path())).unwrap();

    let report = Coordinator::new("inbox", ID, &mut store, &mut output)
        .run(async { Ok(mailbox) })
        .await;

    assert!(report.is_success());
    assert!(tmp
        .path()
        .join("google.com_4912807263478192375.json")
        .exists());
    assert_eq!(output.into_collected().len(), 1);
}
