//! Log Sender
//!
//! Per-connection outbound queue on the producer side.
//!
//! # Flushing
//!
//! `push` appends to the queue and schedules a flush. At most one flush runs
//! per connection: it swaps the queue for an empty one, writes the batch one
//! frame per item, then loops to pick up whatever was appended meanwhile.
//! Each frame write is retried under a short backoff policy; a partially
//! written frame is resumed, never restarted, so the framing stays intact.
//!
//! When retries are exhausted (or the viewer closes its side) a single
//! [`Disconnected`] is emitted and the sender stops. Items still queued are
//! not lost: the producer keeps its own history and replays it to the next
//! connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::models::LogItem;
use crate::retry::RetryBehavior;
use crate::transport::{encode, ConnectionId, FrameReader, FrameWriter, TransportError};

/// Upper bound on a graceful close of the write half
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Emitted once when a sender gives up on its connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnected {
    pub connection: ConnectionId,
    pub reason: String,
}

/// Destination of encoded frames
#[async_trait]
pub trait FrameSink: Send {
    /// Write one encoded frame
    ///
    /// After an error the same frame is passed again on retry.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Close the write direction
    async fn close(&mut self);
}

#[async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.send_frame(frame).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.shutdown().await {
            tracing::debug!(error = %e, "Write half shutdown failed");
        }
    }
}

/// Tuning for one sender
#[derive(Clone, Debug, PartialEq)]
pub struct SenderOptions {
    /// Policy applied to each frame write
    pub retry: RetryBehavior,
    /// Limit on a single write attempt
    pub write_timeout: Option<Duration>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            retry: RetryBehavior::short(),
            write_timeout: None,
        }
    }
}

struct Inner {
    id: ConnectionId,
    queue: Mutex<Vec<LogItem>>,
    flushing: AtomicBool,
    closed: AtomicBool,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    options: SenderOptions,
    events: mpsc::UnboundedSender<Disconnected>,
    runtime: Handle,
}

/// Background tasks of one sender
///
/// Shared by the handles only, never by the tasks themselves, so dropping
/// the last handle aborts them and releases the stream.
#[derive(Default)]
struct Tasks {
    flush: Mutex<Option<AbortHandle>>,
    watchdog: Mutex<Option<AbortHandle>>,
}

impl Tasks {
    fn abort(&self) {
        if let Some(task) = self.flush.lock().take() {
            task.abort();
        }
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Outbound half of a producer→viewer link
///
/// Cheap to clone; clones share the queue and the stream. Dropping the last
/// clone without [`close`](Self::close) still stops the sender.
#[derive(Clone)]
pub struct LogSender {
    inner: Arc<Inner>,
    tasks: Arc<Tasks>,
}

impl LogSender {
    /// Create a sender over any frame sink
    ///
    /// Must be called from within a Tokio runtime; later pushes may come
    /// from any thread.
    pub fn new(
        id: ConnectionId,
        sink: Box<dyn FrameSink>,
        options: SenderOptions,
        events: mpsc::UnboundedSender<Disconnected>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                queue: Mutex::new(Vec::new()),
                flushing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                sink: tokio::sync::Mutex::new(Some(sink)),
                options,
                events,
                runtime: Handle::current(),
            }),
            tasks: Arc::new(Tasks::default()),
        }
    }

    /// Create a sender over the two halves of a handshaken stream
    ///
    /// The read half is watched: the viewer never sends after the
    /// handshake, so end-of-stream there means the link is gone.
    pub fn spawn<R, W>(
        id: ConnectionId,
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        options: SenderOptions,
        events: mpsc::UnboundedSender<Disconnected>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let sender = Self::new(id, Box::new(writer), options, events);
        sender.watch(reader);
        sender
    }

    fn watch<R>(&self, mut reader: FrameReader<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            loop {
                match reader.recv::<serde_json::Value>().await {
                    Ok(_) => {
                        tracing::debug!(conn_id = %inner.id, "Ignoring unexpected frame from viewer");
                    }
                    // Undecodable payloads are consumed; an oversized header is not
                    Err(e @ TransportError::SerializationError(_)) => {
                        tracing::debug!(conn_id = %inner.id, error = %e, "Ignoring malformed frame from viewer");
                    }
                    Err(e) => {
                        inner.fail(format!("viewer stream ended: {e}"));
                        return;
                    }
                }
            }
        });
        *self.tasks.watchdog.lock() = Some(task.abort_handle());
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Queue one item for delivery
    pub fn push(&self, item: LogItem) {
        self.push_all(std::iter::once(item));
    }

    /// Queue items for delivery, in order
    pub fn push_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = LogItem>,
    {
        if self.is_closed() {
            return;
        }
        self.inner.queue.lock().extend(items);
        self.schedule_flush();
    }

    /// Items queued but not yet handed to a flush
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// True once the sender gave up or was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn schedule_flush(&self) {
        if self.is_closed() {
            return;
        }
        if self
            .inner
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // The running flush picks up the new items
            return;
        }

        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(inner.flush_loop());
        *self.tasks.flush.lock() = Some(task.abort_handle());
    }

    /// Abandon pending flushes and close the stream
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.tasks.abort();

        let sink = self.inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                tracing::debug!(conn_id = %self.inner.id, "Timed out closing viewer stream");
            }
        }
        tracing::debug!(conn_id = %self.inner.id, "Sender closed");
    }
}

impl Inner {
    async fn flush_loop(self: Arc<Self>) {
        loop {
            let batch = std::mem::take(&mut *self.queue.lock());

            if batch.is_empty() {
                self.flushing.store(false, Ordering::Release);
                // A push between the take and the store saw `flushing` set
                // and left its items for us
                if self.queue.lock().is_empty()
                    || self
                        .flushing
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    return;
                }
                continue;
            }

            if let Err(e) = self.write_batch(&batch).await {
                self.fail(e.to_string());
                return;
            }
        }
    }

    async fn write_batch(&self, batch: &[LogItem]) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(TransportError::ConnectionClosed);
        };

        for item in batch {
            let frame = match encode(item) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(conn_id = %self.id, item = %item.id, error = %e, "Dropping unencodable item");
                    continue;
                }
            };

            let mut backoff = self.options.retry.backoff();
            loop {
                match self.write_once(sink.as_mut(), &frame).await {
                    Ok(()) => break,
                    Err(e) => match backoff.next_delay() {
                        Some(delay) => {
                            tracing::debug!(
                                conn_id = %self.id,
                                retry = backoff.retries_used(),
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Frame write failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    },
                }
            }
        }
        Ok(())
    }

    async fn write_once(&self, sink: &mut dyn FrameSink, frame: &[u8]) -> Result<(), TransportError> {
        match self.options.write_timeout {
            Some(limit) => tokio::time::timeout(limit, sink.write_frame(frame))
                .await
                .map_err(|_| TransportError::Timeout(format!("frame write exceeded {limit:?}")))?,
            None => sink.write_frame(frame).await,
        }
    }

    fn fail(&self, reason: String) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(conn_id = %self.id, reason = %reason, "Viewer link lost");
        let _ = self.events.send(Disconnected {
            connection: self.id.clone(),
            reason,
        });
    }
}

impl std::fmt::Debug for LogSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSender")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogLevel, LogMessage};
    use crate::transport::frame::HEADER_SIZE;
    use crate::transport::FramedStream;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn item(id: &str) -> LogItem {
        LogItem::with_id(
            id,
            crate::models::LogItemKind::Log(LogMessage::new(LogLevel::Info, format!("message {id}"))),
        )
    }

    /// Records delivered ids and the peak number of concurrent writes
    struct RecordingSink {
        delivered: mpsc::UnboundedSender<String>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        failures_left: usize,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::IoError(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "no space",
                )));
            }

            let item: LogItem = serde_json::from_slice(&frame[HEADER_SIZE..]).unwrap();
            let _ = self.delivered.send(item.id);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct BrokenSink {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for BrokenSink {
        async fn write_frame(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectionClosed)
        }

        async fn close(&mut self) {}
    }

    fn recording(failures: usize) -> (Box<dyn FrameSink>, mpsc::UnboundedReceiver<String>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peak = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink {
            delivered: tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
            failures_left: failures,
        };
        (Box::new(sink), rx, peak)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pushes_single_writer_in_order() {
        let (sink, mut delivered, peak) = recording(0);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let sender = LogSender::new(ConnectionId::new(), sink, SenderOptions::default(), events);

        let mut pushers = Vec::new();
        for worker in 0..4 {
            let sender = sender.clone();
            pushers.push(tokio::spawn(async move {
                for n in 0..50 {
                    sender.push(item(&format!("{worker}-{n}")));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for pusher in pushers {
            pusher.await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 200 {
            seen.push(delivered.recv().await.unwrap());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(sender.pending(), 0);
        // Per-producer order is preserved
        for worker in 0..4 {
            let prefix = format!("{worker}-");
            let ours: Vec<u32> = seen
                .iter()
                .filter_map(|id| id.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(ours, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_failures_are_retried() {
        let (sink, mut delivered, _) = recording(2);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let sender = LogSender::new(ConnectionId::new(), sink, SenderOptions::default(), events);

        sender.push_all(["a", "b"].map(item));
        assert_eq!(delivered.recv().await.unwrap(), "a");
        assert_eq!(delivered.recv().await.unwrap(), "b");
        assert!(!sender.is_closed());
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_one_disconnect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sink = BrokenSink {
            attempts: Arc::clone(&attempts),
        };
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let sender = LogSender::new(id.clone(), Box::new(sink), SenderOptions::default(), events);

        sender.push(item("a"));
        let disconnected = events_rx.recv().await.unwrap();
        assert_eq!(disconnected.connection, id);
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(sender.is_closed());

        // Later pushes are ignored and nothing else is reported
        sender.push(item("b"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_viewer_eof_is_a_disconnect() {
        let (local, remote) = tokio::io::duplex(1024);
        let (reader, writer) = FramedStream::new(local).into_split();
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let sender = LogSender::spawn(
            ConnectionId::new(),
            reader,
            writer,
            SenderOptions::default(),
            events,
        );

        drop(remote);
        let disconnected = events_rx.recv().await.unwrap();
        assert_eq!(&disconnected.connection, sender.id());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_frames_reach_the_stream() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = FramedStream::new(local).into_split();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let sender = LogSender::spawn(
            ConnectionId::new(),
            reader,
            writer,
            SenderOptions::default(),
            events,
        );

        sender.push_all(["1", "2"].map(item));
        let mut viewer = FramedStream::new(remote);
        assert_eq!(viewer.recv::<LogItem>().await.unwrap().id, "1");
        assert_eq!(viewer.recv::<LogItem>().await.unwrap().id, "2");

        sender.close().await;
        assert!(matches!(
            viewer.recv::<LogItem>().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases_stream() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = FramedStream::new(local).into_split();
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let sender = LogSender::spawn(
            ConnectionId::new(),
            reader,
            writer,
            SenderOptions::default(),
            events,
        );
        let clone = sender.clone();

        sender.push(item("1"));
        let mut viewer = FramedStream::new(remote);
        assert_eq!(viewer.recv::<LogItem>().await.unwrap().id, "1");

        // A surviving clone keeps the link up
        drop(sender);
        clone.push(item("2"));
        assert_eq!(viewer.recv::<LogItem>().await.unwrap().id, "2");

        drop(clone);
        let outcome = tokio::time::timeout(Duration::from_secs(5), viewer.recv::<LogItem>()).await;
        assert!(matches!(outcome, Ok(Err(TransportError::ConnectionClosed))));
        assert!(events_rx.try_recv().is_err());
    }
}
