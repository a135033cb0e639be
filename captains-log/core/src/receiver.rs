//! Log Receiver
//!
//! Viewer-side read loop for one producer connection. Decodes framed
//! [`LogItem`]s, hands each to the caller and then advances that producer's
//! resumption cursor. The loop ends on the first stream or decode error and
//! returns it; reconnecting is the owner's job.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncRead;

use crate::models::{LastItemId, LogItem};
use crate::transport::{FrameReader, TransportError};

/// Last item seen per producer run id
///
/// Shared between the receivers of all connections; clones share storage.
#[derive(Clone, Debug, Default)]
pub struct CursorStore {
    cursors: Arc<DashMap<String, LastItemId>>,
}

impl CursorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor for a run, `Unassigned` if nothing was received yet
    #[must_use]
    pub fn get(&self, producer_id: &str) -> LastItemId {
        self.cursors
            .get(producer_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn record(&self, producer_id: &str, item_id: &str) {
        self.cursors
            .insert(producer_id.to_string(), LastItemId::Assigned(item_id.to_string()));
    }

    /// Forget a run, so its next connection gets a full replay
    pub fn forget(&self, producer_id: &str) -> bool {
        self.cursors.remove(producer_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Read loop for one producer
pub struct LogReceiver<R> {
    producer_id: String,
    reader: FrameReader<R>,
    cursors: CursorStore,
}

impl<R: AsyncRead + Unpin> LogReceiver<R> {
    pub fn new(producer_id: impl Into<String>, reader: FrameReader<R>, cursors: CursorStore) -> Self {
        Self {
            producer_id: producer_id.into(),
            reader,
            cursors,
        }
    }

    #[must_use]
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Receive until the stream fails, returning the error that ended it
    ///
    /// The cursor only moves after `deliver` returned, so an item is never
    /// marked seen before the caller had it.
    pub async fn run<F>(mut self, mut deliver: F) -> TransportError
    where
        F: FnMut(LogItem),
    {
        loop {
            match self.reader.recv::<LogItem>().await {
                Ok(item) => {
                    let item_id = item.id.clone();
                    tracing::trace!(producer = %self.producer_id, item = %item_id, "Item received");
                    deliver(item);
                    self.cursors.record(&self.producer_id, &item_id);
                }
                Err(e) => {
                    tracing::debug!(producer = %self.producer_id, error = %e, "Receive loop ended");
                    return e;
                }
            }
        }
    }
}
