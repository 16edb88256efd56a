//! Report extraction: decompose one message and decode each attachment.

use tracing::{debug, error, info, warn};

use crate::error::{HarvestError, Result};
use crate::export::sink::ReportSink;
use crate::mailbox::RawMessage;
use crate::model::outcome::ExtractionOutcome;
use crate::model::report::{ExtractedReport, Feedback};
use crate::parser::mime::{Decomposer, MimePart};
use crate::parser::report::ReportDecoder;

/// Turns fetched messages into reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor {
    decomposer: Decomposer,
    decoder: ReportDecoder,
    compressed_hint: bool,
}

impl Extractor {
    pub fn new(decomposer: Decomposer, decoder: ReportDecoder, compressed_hint: bool) -> Self {
        Self {
            decomposer,
            decoder,
            compressed_hint,
        }
    }

    /// Decode a single attachment body.
    pub fn extract(&self, filename: &str, body: &[u8]) -> Result<Feedback> {
        self.decoder
            .decode(body, filename, self.compressed_hint)
            .map_err(|source| HarvestError::Decode {
                filename: filename.to_string(),
                source,
            })
    }

    /// Walk every part of `message`, decoding attachments and handing the
    /// reports to `sink`.
    ///
    /// Never fails: structural, decode and sink errors are recorded in the
    /// returned outcome and processing moves on to the next attachment (or,
    /// for structural errors, ends this message).
    pub fn process_message(
        &self,
        message: &RawMessage,
        sink: &mut dyn ReportSink,
    ) -> ExtractionOutcome {
        let position = message.position;
        let mut outcome = ExtractionOutcome::new(position);

        let parsed = match self.decomposer.parse(position, &message.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(position = position.get(), error = %e, "Skipping unparseable message");
                outcome.errors.push(e);
                return outcome;
            }
        };

        for part in self.decomposer.parts(position, &parsed) {
            let (filename, body) = match part {
                Ok(MimePart::Attachment { filename, body, .. }) => (filename, body),
                Ok(MimePart::Other { content_type }) => {
                    debug!(position = position.get(), content_type = %content_type, "Ignoring part");
                    continue;
                }
                Err(e) => {
                    error!(position = position.get(), error = %e, "imap: can't read next part, skip");
                    outcome.errors.push(e);
                    break;
                }
            };

            outcome.attachments_found += 1;
            info!(
                position = position.get(),
                filename = %filename,
                size = %humansize::format_size(body.len(), humansize::BINARY),
                "imap: found attachment"
            );

            let report = match self.extract(&filename, body) {
                Ok(report) => report,
                Err(e) => {
                    error!(position = position.get(), error = %e, "parsing: skip");
                    outcome.errors.push(e);
                    continue;
                }
            };

            let extracted = ExtractedReport {
                position: position.get(),
                filename,
                report,
            };
            match sink.deliver(&extracted) {
                Ok(()) => outcome.attachments_parsed += 1,
                Err(e) => {
                    error!(position = position.get(), error = %e, "Report not delivered");
                    outcome.errors.push(e);
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::position::MailboxPosition;

    const XML: &str = "<feedback><report_metadata><org_name>acme</org_name>\
<report_id>id-1</report_id><date_range><begin>1</begin><end>2</end></date_range>\
</report_metadata><policy_published><domain>example.com</domain><p>none</p>\
</policy_published></feedback>";

    fn message(position: u32, attachments: &[(&str, &str)]) -> RawMessage {
        let mut body = String::from(
            "From: reports@acme.test\r\nSubject: Report\r\nMIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"zz\"\r\n\r\n\
--zz\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n",
        );
        for (name, content) in attachments {
            body.push_str(&format!(
                "--zz\r\nContent-Type: application/xml\r\n\
Content-Disposition: attachment; filename=\"{name}\"\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str("--zz--\r\n");
        RawMessage {
            position: MailboxPosition(position),
            body: body.into_bytes(),
        }
    }

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn deliver(&mut self, _report: &ExtractedReport) -> Result<()> {
            Err(HarvestError::Sink("read-only".into()))
        }
    }

    #[test]
    fn test_attachments_are_independent() {
        let msg = message(
            4,
            &[("a.xml", XML), ("broken.xml", "<feedback>"), ("c.xml", XML)],
        );
        let mut reports: Vec<ExtractedReport> = Vec::new();
        let outcome = Extractor::default().process_message(&msg, &mut reports);

        assert_eq!(outcome.position, MailboxPosition(4));
        assert_eq!(outcome.attachments_found, 3);
        assert_eq!(outcome.attachments_parsed, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(
            &outcome.errors[0],
            HarvestError::Decode { filename, .. } if filename == "broken.xml"
        ));
        let names: Vec<&str> = reports.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["a.xml", "c.xml"]);
    }

    #[test]
    fn test_message_without_attachments() {
        let outcome = Extractor::default().process_message(&message(1, &[]), &mut Vec::<ExtractedReport>::new());
        assert_eq!(outcome.attachments_found, 0);
        assert!(outcome.errors.is_empty());
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_unparseable_message_is_recorded() {
        let msg = RawMessage {
            position: MailboxPosition(9),
            body: Vec::new(),
        };
        let outcome = Extractor::default().process_message(&msg, &mut Vec::<ExtractedReport>::new());
        assert_eq!(outcome.attachments_found, 0);
        assert!(matches!(
            outcome.errors[0],
            HarvestError::StructuralParse { position: 9, .. }
        ));
    }

    #[test]
    fn test_sink_failure_is_contained() {
        let msg = message(2, &[("a.xml", XML), ("b.xml", XML)]);
        let outcome = Extractor::default().process_message(&msg, &mut FailingSink);
        assert_eq!(outcome.attachments_found, 2);
        assert_eq!(outcome.attachments_parsed, 0);
        assert_eq!(outcome.errors.len(), 2);
    }
}
