//! MIME decomposition: walk a message's part tree one leaf at a time and
//! classify each leaf as an attachment or not.

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};
use crate::model::position::MailboxPosition;

/// Maximum multipart nesting depth (to bound work on adversarial input).
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Maximum number of leaf parts walked in a single message.
pub const DEFAULT_MAX_PARTS: usize = 64;

/// One leaf of a message's part tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimePart<'a> {
    /// A part that declares a usable filename.
    Attachment {
        filename: String,
        content_type: String,
        /// Transfer-decoded body.
        body: &'a [u8],
    },
    /// Anything else: text bodies, inline parts, parts with bad metadata.
    Other { content_type: String },
}

impl MimePart<'_> {
    pub fn is_attachment(&self) -> bool {
        matches!(self, MimePart::Attachment { .. })
    }
}

/// Splits raw messages into classified leaf parts.
#[derive(Debug, Clone, Copy)]
pub struct Decomposer {
    max_parts: usize,
    max_depth: usize,
}

impl Default for Decomposer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARTS, DEFAULT_MAX_DEPTH)
    }
}

impl Decomposer {
    pub fn new(max_parts: usize, max_depth: usize) -> Self {
        Self {
            max_parts,
            max_depth,
        }
    }

    /// Parse the message's structural header.
    ///
    /// Fails when the bytes do not look like a message at all (no headers).
    pub fn parse<'x>(&self, position: MailboxPosition, raw: &'x [u8]) -> Result<Message<'x>> {
        let message = MessageParser::default().parse(raw).ok_or_else(|| {
            HarvestError::StructuralParse {
                position: position.get(),
                reason: "not a MIME message".into(),
            }
        })?;

        let has_headers = message
            .parts
            .first()
            .map(|root| !root.headers.is_empty())
            .unwrap_or(false);
        if !has_headers {
            return Err(HarvestError::StructuralParse {
                position: position.get(),
                reason: "message has no headers".into(),
            });
        }

        debug!(
            position = position.get(),
            parts = message.parts.len(),
            "Parsed message structure"
        );
        Ok(message)
    }

    /// Iterate over the leaf parts of a parsed message in document order.
    pub fn parts<'a, 'x>(
        &self,
        position: MailboxPosition,
        message: &'a Message<'x>,
    ) -> MessageParts<'a, 'x> {
        MessageParts {
            position,
            stack: vec![(message, 0, 0)],
            leaves: 0,
            max_parts: self.max_parts,
            max_depth: self.max_depth,
            done: false,
        }
    }
}

/// Lazy depth-first walk over a message's leaf parts.
///
/// Yields at most one `Err`, after which the walk is over; parts already
/// yielded stay valid.
pub struct MessageParts<'a, 'x> {
    position: MailboxPosition,
    /// Pending parts as (owning message, part id, depth).
    stack: Vec<(&'a Message<'x>, usize, usize)>,
    leaves: usize,
    max_parts: usize,
    max_depth: usize,
    done: bool,
}

impl<'a, 'x> MessageParts<'a, 'x> {
    fn fail(&mut self, reason: String) -> Result<MimePart<'a>> {
        self.done = true;
        self.stack.clear();
        Err(HarvestError::StructuralParse {
            position: self.position.get(),
            reason,
        })
    }
}

impl<'a, 'x> Iterator for MessageParts<'a, 'x> {
    type Item = Result<MimePart<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some((message, id, depth)) = self.stack.pop() {
            if depth > self.max_depth {
                return Some(self.fail(format!(
                    "multipart nesting deeper than {}",
                    self.max_depth
                )));
            }
            let Some(part) = message.parts.get(id) else {
                return Some(self.fail(format!("dangling part reference {id}")));
            };
            match &part.body {
                PartType::Multipart(children) => {
                    self.stack.extend(
                        children
                            .iter()
                            .rev()
                            .map(|&child| (message, child, depth + 1)),
                    );
                    continue;
                }
                // Forwarded reports arrive as message/rfc822; walk the inner message.
                PartType::Message(nested) => {
                    debug!(position = self.position.get(), "Descending into attached message");
                    self.stack.push((nested, 0, depth + 1));
                    continue;
                }
                _ => {}
            }

            self.leaves += 1;
            if self.leaves > self.max_parts {
                return Some(self.fail(format!("more than {} parts", self.max_parts)));
            }
            return Some(Ok(classify(self.position, part)));
        }
        self.done = true;
        None
    }
}

/// Classify a leaf part. Parts whose filename cannot be used are logged
/// and demoted to [`MimePart::Other`].
fn classify<'a>(position: MailboxPosition, part: &'a MessagePart<'_>) -> MimePart<'a> {
    let content_type = content_type_of(part);
    let Some(name) = part.attachment_name() else {
        return MimePart::Other { content_type };
    };

    match validate_filename(name) {
        Ok(filename) => MimePart::Attachment {
            filename,
            content_type,
            body: part.contents(),
        },
        Err(e) => {
            warn!(position = position.get(), error = %e, "Skipping attachment candidate");
            MimePart::Other { content_type }
        }
    }
}

fn content_type_of(part: &MessagePart<'_>) -> String {
    part.content_type()
        .map(|ct: &mail_parser::ContentType| {
            let main = ct.ctype();
            match ct.subtype() {
                Some(sub) => format!("{main}/{sub}"),
                None => main.to_string(),
            }
        })
        .unwrap_or_else(|| "text/plain".to_string())
}

/// Check that a declared filename decoded into something usable.
pub fn validate_filename(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(HarvestError::AttachmentMetadata {
            reason: "empty filename".into(),
        });
    }
    if trimmed.chars().any(char::is_control) {
        return Err(HarvestError::AttachmentMetadata {
            reason: format!("control characters in filename {trimmed:?}"),
        });
    }
    if let Some(start) = trimmed.find("=?") {
        if trimmed[start + 2..].contains("?=") {
            return Err(HarvestError::AttachmentMetadata {
                reason: format!("undecoded encoded-word in filename {trimmed:?}"),
            });
        }
    }
    Ok(trimmed.to_string())
}
