//! Mailbox positions and the range of messages a run consumes.

use std::fmt;

/// Ordinal slot of a message in the selected mailbox (IMAP sequence number).
///
/// Positions start at 1 and grow as mail is appended. They are only
/// meaningful for one `UIDVALIDITY` epoch of the mailbox.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct MailboxPosition(pub u32);

impl MailboxPosition {
    /// The first message in a mailbox; also the cursor when none is stored.
    pub const FIRST: MailboxPosition = MailboxPosition(1);

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MailboxPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MailboxPosition {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Mailbox metadata captured once when the mailbox is selected.
///
/// Mail arriving after the snapshot is not part of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxSnapshot {
    /// Number of messages in the mailbox at select time.
    pub total_messages: MailboxPosition,
    /// `UIDVALIDITY` token, when the server reports one.
    pub uid_validity: Option<u32>,
}

/// Inclusive, non-empty range of positions to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    from: MailboxPosition,
    to: MailboxPosition,
}

impl FetchRange {
    /// Compute the range `[cursor, total_messages]`.
    ///
    /// Returns `None` when the cursor has already reached the snapshot's
    /// total, which is the ordinary "nothing new" case.
    pub fn compute(cursor: MailboxPosition, snapshot: &MailboxSnapshot) -> Option<Self> {
        if cursor >= snapshot.total_messages {
            return None;
        }
        Some(Self {
            from: cursor.max(MailboxPosition::FIRST),
            to: snapshot.total_messages,
        })
    }

    pub fn from(&self) -> MailboxPosition {
        self.from
    }

    pub fn to(&self) -> MailboxPosition {
        self.to
    }

    /// Number of messages covered.
    pub fn len(&self) -> u64 {
        u64::from(self.to.0 - self.from.0) + 1
    }

    /// Always false; an empty range is represented by `None`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The IMAP sequence set for this range, e.g. `"3:7"`.
    pub fn to_sequence_set(&self) -> String {
        if self.from == self.to {
            self.from.to_string()
        } else {
            format!("{}:{}", self.from, self.to)
        }
    }

    /// Positions covered, in ascending order.
    pub fn positions(&self) -> impl Iterator<Item = MailboxPosition> {
        (self.from.0..=self.to.0).map(MailboxPosition)
    }
}

impl fmt::Display for FetchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}
