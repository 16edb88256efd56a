//! DMARC aggregate report decoding: decompression, XML, semantic checks.

use std::io::{BufReader, Cursor, Read};

use flate2::read::GzDecoder;
use tracing::debug;
use zip::ZipArchive;

use crate::error::ReportError;
use crate::model::report::Feedback;

/// Default upper bound on a decompressed report (32 MB).
pub const DEFAULT_MAX_REPORT_SIZE: u64 = 32 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Container format of an attachment body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zip,
}

impl Compression {
    /// Decide how a body is packed from the compressed hint, the filename and
    /// the leading bytes, in that order of precedence.
    pub fn detect(filename: &str, compressed_hint: bool, head: &[u8]) -> Self {
        let lower = filename.to_ascii_lowercase();
        if compressed_hint || lower.ends_with(".gz") || lower.ends_with(".gzip") {
            Compression::Gzip
        } else if lower.ends_with(".zip") || head.starts_with(&ZIP_MAGIC) {
            Compression::Zip
        } else if head.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// Decodes attachment bodies into [`Feedback`] reports.
#[derive(Debug, Clone, Copy)]
pub struct ReportDecoder {
    max_size: u64,
}

impl Default for ReportDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPORT_SIZE)
    }
}

impl ReportDecoder {
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }

    /// Decode one report from `body`.
    ///
    /// `filename` and `compressed_hint` only steer decompression; the XML is
    /// always validated the same way.
    pub fn decode<R: Read>(
        &self,
        mut body: R,
        filename: &str,
        compressed_hint: bool,
    ) -> Result<Feedback, ReportError> {
        let mut head = [0u8; 4];
        let head_len = read_up_to(&mut body, &mut head)?;
        let head = &head[..head_len];
        let rest = head.chain(body);

        let compression = Compression::detect(filename, compressed_hint, head);
        debug!(filename, ?compression, "Decoding report attachment");

        let xml = match compression {
            Compression::Gzip => self.read_limited(GzDecoder::new(rest))?,
            Compression::None => self.read_limited(rest)?,
            Compression::Zip => self.read_zip(rest)?,
        };

        let feedback: Feedback = quick_xml::de::from_reader(BufReader::new(xml.as_slice()))?;
        validate(&feedback)?;
        Ok(feedback)
    }

    fn read_limited<R: Read>(&self, reader: R) -> Result<Vec<u8>, ReportError> {
        let mut buf = Vec::new();
        reader.take(self.max_size.saturating_add(1)).read_to_end(&mut buf)?;
        if buf.len() as u64 > self.max_size {
            return Err(ReportError::TooLarge {
                limit: self.max_size,
            });
        }
        Ok(buf)
    }
}

impl ReportDecoder {
    /// Unpack the first `.xml` entry of a zip archive.
    ///
    /// The archive itself and the unpacked entry are both held to `max_size`.
    fn read_zip<R: Read>(&self, reader: R) -> Result<Vec<u8>, ReportError> {
        let archive = self.read_limited(reader)?;
        let mut archive = ZipArchive::new(Cursor::new(archive))?;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".xml") {
                continue;
            }
            debug!(entry = entry.name(), "Unpacking zipped report");
            return self.read_limited(entry);
        }
        Err(ReportError::Invalid("zip archive holds no .xml entry".into()))
    }
}

/// Fill `buf` as far as the reader allows, returning the byte count.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Semantic checks the schema alone does not enforce.
pub fn validate(feedback: &Feedback) -> Result<(), ReportError> {
    let meta = &feedback.report_metadata;
    if meta.org_name.trim().is_empty() {
        return Err(ReportError::Invalid("empty org_name".into()));
    }
    if meta.report_id.trim().is_empty() {
        return Err(ReportError::Invalid("empty report_id".into()));
    }
    if feedback.policy_published.domain.trim().is_empty() {
        return Err(ReportError::Invalid("empty policy domain".into()));
    }
    if meta.date_range.begin > meta.date_range.end {
        return Err(ReportError::Invalid(format!(
            "date range begins after it ends ({} > {})",
            meta.date_range.begin, meta.date_range.end
        )));
    }
    Ok(())
}
