//! In-memory message log for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use herald_message_log::{MessageLog, NewMessage, Offset, Page, StoredMessage};
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory message log.
#[derive(Clone, Debug, Default)]
pub struct MemoryMessageLog {
    messages: Arc<RwLock<Vec<StoredMessage>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryMessageLog {
    /// Creates a new, empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent appends fail with `Error::ReadOnly`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index_of(offset: Offset) -> Option<usize> {
        match offset.0 {
            0 => None,
            n => Some((n - 1) as usize),
        }
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    type Error = Error;

    async fn append(&self, message: NewMessage) -> Result<Offset, Self::Error> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        let mut messages = self.messages.write().await;
        let offset = Offset(messages.len() as u64 + 1);

        messages.push(StoredMessage {
            offset,
            group_id: message.group_id,
            sender_id: message.sender_id,
            body: message.body,
            sent_at: Utc::now(),
        });

        debug!(%offset, "Message appended");
        Ok(offset)
    }

    async fn get(&self, offset: Offset) -> Result<Option<StoredMessage>, Self::Error> {
        let messages = self.messages.read().await;

        Ok(Self::index_of(offset).and_then(|index| messages.get(index).cloned()))
    }

    async fn read_from(
        &self,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, Self::Error> {
        if limit == 0 {
            return Err(Error::ZeroLimit);
        }

        let messages = self.messages.read().await;
        let start = usize::try_from(after.0).unwrap_or(usize::MAX);

        Ok(messages.iter().skip(start).take(limit).cloned().collect())
    }

    async fn read_group(
        &self,
        group_id: &str,
        before: Option<Offset>,
        limit: usize,
    ) -> Result<Page, Self::Error> {
        if limit == 0 {
            return Err(Error::ZeroLimit);
        }

        let messages = self.messages.read().await;

        let mut matching = messages
            .iter()
            .rev()
            .filter(|message| before.is_none_or(|before| message.offset < before))
            .filter(|message| message.group_id == group_id);

        let page: Vec<StoredMessage> = matching.by_ref().take(limit).cloned().collect();
        let next_before = if matching.next().is_some() {
            page.last().map(|message| message.offset)
        } else {
            None
        };

        Ok(Page {
            messages: page,
            next_before,
        })
    }

    async fn head(&self) -> Result<Offset, Self::Error> {
        Ok(Offset(self.messages.read().await.len() as u64))
    }
}
