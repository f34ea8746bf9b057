//! Abstract interface for the durable chat message log.
//!
//! The log is the source of truth for sent messages. A message counts as sent
//! once `append` returns its committed offset; real-time fan-out happens only
//! after that point.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker trait for `MessageLog` errors
pub trait MessageLogError: Debug + Error + Send + Sync + 'static {}

/// Position of a committed message in the log. Offsets start at 1 and increase
/// by one per append.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Offset(pub u64);

impl Offset {
    /// The offset preceding every committed message.
    pub const ZERO: Self = Self(0);

    /// The following offset.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message submitted for appending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// The group (conversation) the message belongs to.
    pub group_id: String,

    /// The sending user.
    pub sender_id: String,

    /// Message body.
    pub body: Bytes,
}

impl NewMessage {
    /// Creates a new message.
    pub fn new(
        group_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            sender_id: sender_id.into(),
            body: body.into(),
        }
    }
}

/// A committed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Committed offset.
    pub offset: Offset,

    /// The group (conversation) the message belongs to.
    pub group_id: String,

    /// The sending user.
    pub sender_id: String,

    /// Message body.
    pub body: Bytes,

    /// Commit time.
    pub sent_at: DateTime<Utc>,
}

/// One page of a group's history, newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    /// Messages in descending offset order.
    pub messages: Vec<StoredMessage>,

    /// Cursor for the next (older) page, if there is one.
    pub next_before: Option<Offset>,
}

/// The durable message log.
#[async_trait]
pub trait MessageLog: Send + Sync + 'static {
    /// The error type for log operations.
    type Error: MessageLogError;

    /// Durably appends a message. Returns only once the write is committed.
    async fn append(&self, message: NewMessage) -> Result<Offset, Self::Error>;

    /// Fetches a committed message by offset.
    async fn get(&self, offset: Offset) -> Result<Option<StoredMessage>, Self::Error>;

    /// Reads up to `limit` messages with offsets strictly greater than `after`,
    /// in ascending offset order.
    async fn read_from(
        &self,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, Self::Error>;

    /// Reads one page of a group's history with offsets strictly below `before`
    /// (or from the newest message when `before` is `None`).
    async fn read_group(
        &self,
        group_id: &str,
        before: Option<Offset>,
        limit: usize,
    ) -> Result<Page, Self::Error>;

    /// The offset of the newest committed message, `Offset::ZERO` when empty.
    async fn head(&self) -> Result<Offset, Self::Error>;
}
