//! Streaming pipeline: bounded producer/consumer queue with cancellation.
//!
//! The producer runs on a blocking worker thread and pushes
//! [`StreamMessage`]s into a bounded `tokio::sync::mpsc` channel with
//! `blocking_send`, so a full queue stalls generation (backpressure).  The
//! consumer side is [`AudioStream`]: a forward-only sequence of
//! [`AudioChunk`]s terminated by an end or error sentinel.
//!
//! | Event                         | Effect                                         |
//! |-------------------------------|------------------------------------------------|
//! | no message within read timeout| `Err(Stalled)`, producer cancelled             |
//! | consumer dropped / cancelled  | token set, queue closed, worker joined within the join timeout |
//! | worker outlives join timeout  | abandoned; engine flagged for reload           |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::audio::{Assembler, AudioBuffer};
use crate::error::{Error, Result};

/// Default bounded wait for both queue reads and worker joins.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Default queue depth, in chunks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Speech,
    Silence,
}

/// One decoded piece of audio, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Position in the delivered sequence (0, 1, 2, …).
    pub sequence: usize,
    /// Index of the plan item this piece belongs to.  Incremental output of
    /// one chunk yields several pieces with the same plan index.
    pub plan_index: usize,
    pub kind: ChunkKind,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// What travels through the queue.
#[derive(Debug)]
pub enum StreamMessage {
    Audio(AudioChunk),
    End,
    Error(Error),
}

/// Cooperative stop signal checked by the producer between units.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub capacity: usize,
    pub read_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            read_timeout: DEFAULT_STREAM_TIMEOUT,
            join_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Producer side
// ─────────────────────────────────────────────────────────────────────────────

/// Producer handle: numbers outgoing chunks and notices a vanished consumer.
pub struct ChunkSender {
    tx: mpsc::Sender<StreamMessage>,
    cancel: CancelToken,
    sequence: usize,
}

impl ChunkSender {
    /// `true` while the consumer still wants audio.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Push one chunk, blocking while the queue is full.  Returns `false`
    /// once the consumer is gone.
    pub fn send_audio(&mut self, plan_index: usize, kind: ChunkKind, samples: Vec<f32>, sample_rate: u32) -> bool {
        if !self.is_open() {
            return false;
        }
        let chunk = AudioChunk { sequence: self.sequence, plan_index, kind, samples, sample_rate };
        if self.tx.blocking_send(StreamMessage::Audio(chunk)).is_err() {
            return false;
        }
        self.sequence += 1;
        true
    }

    pub fn finish(self) {
        let _ = self.tx.blocking_send(StreamMessage::End);
    }

    pub fn fail(self, err: Error) {
        let _ = self.tx.blocking_send(StreamMessage::Error(err));
    }

    /// Chunks delivered so far.
    pub fn sent(&self) -> usize {
        self.sequence
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consumer side
// ─────────────────────────────────────────────────────────────────────────────

/// Lazy, forward-only sequence of generated audio.
///
/// Dropping it cancels the producer; the worker is then joined in the
/// background within the join timeout.
pub struct AudioStream {
    rx: mpsc::Receiver<StreamMessage>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    options: StreamOptions,
    reload_flag: Arc<AtomicBool>,
    sample_rate: u32,
    received: usize,
    done: bool,
}

impl AudioStream {
    /// Start `producer` on a blocking worker.  Must be called from within a
    /// tokio runtime.
    pub fn spawn<F>(options: StreamOptions, sample_rate: u32, reload_flag: Arc<AtomicBool>, producer: F) -> Self
    where
        F: FnOnce(ChunkSender) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let cancel = CancelToken::new();
        let sender = ChunkSender { tx, cancel: cancel.clone(), sequence: 0 };
        let worker = tokio::task::spawn_blocking(move || producer(sender));
        Self {
            rx,
            cancel,
            worker: Some(worker),
            options,
            reload_flag,
            sample_rate,
            received: 0,
            done: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Token that stops this stream from another task.  The next read after
    /// cancellation yields [`Error::Cancelled`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next chunk, `None` after the end sentinel.  An error item is always
    /// the last item.
    pub async fn next_chunk(&mut self) -> Option<Result<AudioChunk>> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            self.rx.close();
            debug!(delivered = self.received, "stream read after cancellation");
            return Some(Err(Error::Cancelled));
        }
        match tokio::time::timeout(self.options.read_timeout, self.rx.recv()).await {
            Ok(Some(StreamMessage::Audio(chunk))) => {
                self.received += 1;
                Some(Ok(chunk))
            }
            Ok(Some(StreamMessage::End)) => {
                self.done = true;
                debug!(chunks = self.received, "stream complete");
                None
            }
            Ok(Some(StreamMessage::Error(err))) => {
                self.done = true;
                Some(Err(err))
            }
            Ok(None) => {
                self.done = true;
                Some(Err(Error::Generation {
                    chunk: self.received,
                    message: "generation worker exited without an end marker".into(),
                }))
            }
            Err(_) => {
                self.done = true;
                self.cancel.cancel();
                self.rx.close();
                warn!(timeout = ?self.options.read_timeout, "no audio from producer, treating as stalled");
                Some(Err(Error::Stalled(self.options.read_timeout)))
            }
        }
    }

    /// Stop the producer and wait for its worker.
    ///
    /// Returns `false` when the worker did not stop within the join timeout;
    /// it is then abandoned and the engine is flagged for reload.
    pub async fn cancel(mut self) -> bool {
        self.cancel.cancel();
        self.rx.close();
        match self.worker.take() {
            Some(worker) => join_or_abandon(worker, self.options.join_timeout, Arc::clone(&self.reload_flag)).await,
            None => true,
        }
    }

    /// Drain the stream into one buffer.
    pub async fn collect(mut self) -> Result<AudioBuffer> {
        let mut asm = Assembler::new(self.sample_rate);
        while let Some(item) = self.next_chunk().await {
            let chunk = item?;
            asm.push_chunk(&chunk.samples, chunk.sample_rate)
                .map_err(|e| Error::generation(chunk.plan_index, e))?;
        }
        Ok(asm.finish())
    }

    /// Adapt into a [`Stream`] for transports.
    pub fn into_stream(self) -> impl Stream<Item = Result<AudioChunk>> + Send {
        let mut this = self;
        async_stream::stream! {
            while let Some(item) = this.next_chunk().await {
                yield item;
            }
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else { return };
        if self.done && worker.is_finished() {
            return;
        }
        self.cancel.cancel();
        self.rx.close();
        if !self.done {
            debug!(delivered = self.received, "stream consumer dropped, cancelling producer");
        }
        let join_timeout = self.options.join_timeout;
        let reload_flag = Arc::clone(&self.reload_flag);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                join_or_abandon(worker, join_timeout, reload_flag).await;
            });
        }
    }
}

async fn join_or_abandon(worker: JoinHandle<()>, limit: Duration, reload_flag: Arc<AtomicBool>) -> bool {
    match tokio::time::timeout(limit, worker).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(error = %err, "generation worker panicked");
            reload_flag.store(true, Ordering::SeqCst);
            true
        }
        Err(_) => {
            warn!(timeout = ?limit, "generation worker did not stop in time, abandoning it");
            reload_flag.store(true, Ordering::SeqCst);
            false
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chunks_then_end() {
        let mut stream = AudioStream::spawn(StreamOptions::default(), 8, flag(), |mut tx| {
            for i in 0..3 {
                assert!(tx.send_audio(i, ChunkKind::Speech, vec![i as f32; 2], 8));
            }
            tx.finish();
        });
        let mut seen = Vec::new();
        while let Some(item) = stream.next_chunk().await {
            let chunk = item.unwrap();
            assert_eq!(chunk.sequence, seen.len());
            seen.push(chunk.plan_index);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_after_token_cancel_reports_cancelled() {
        let mut stream = AudioStream::spawn(StreamOptions::default(), 8, flag(), |mut tx| {
            let mut i = 0;
            while tx.send_audio(i, ChunkKind::Speech, vec![0.0; 2], 8) {
                i += 1;
                std::thread::sleep(Duration::from_millis(5));
            }
            tx.finish();
        });
        let token = stream.cancel_token();

        assert!(stream.next_chunk().await.unwrap().is_ok());
        token.cancel();
        assert!(matches!(stream.next_chunk().await, Some(Err(Error::Cancelled))));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_sentinel_after_delivered_chunks() {
        let stream = AudioStream::spawn(StreamOptions::default(), 8, flag(), |mut tx| {
            tx.send_audio(0, ChunkKind::Speech, vec![0.1], 8);
            tx.fail(Error::Generation { chunk: 1, message: "boom".into() });
        });
        let items: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Generation { chunk: 1, .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_timeout_reports_stall() {
        let options = StreamOptions { read_timeout: Duration::from_millis(30), ..Default::default() };
        let mut stream = AudioStream::spawn(options, 8, flag(), |tx| {
            std::thread::sleep(Duration::from_millis(200));
            tx.finish();
        });
        let err = stream.next_chunk().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Stalled(_)));
        assert!(err.is_retryable());
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_blocks_producer() {
        let options = StreamOptions { capacity: 1, ..Default::default() };
        let produced = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let mut stream = AudioStream::spawn(options, 8, flag(), move |mut tx| {
            for i in 0..10 {
                if !tx.send_audio(i, ChunkKind::Speech, vec![0.0], 8) {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
            tx.finish();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(produced.load(Ordering::SeqCst) <= 2);
        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert!(stream.cancel().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_stops_cooperative_producer() {
        let mut stream = AudioStream::spawn(StreamOptions::default(), 8, flag(), |mut tx| {
            let mut i = 0;
            while tx.send_audio(i, ChunkKind::Speech, vec![0.0], 8) {
                i += 1;
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        stream.next_chunk().await.unwrap().unwrap();
        assert!(stream.cancel().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stuck_worker_is_abandoned_and_flags_reload() {
        let reload = flag();
        let options = StreamOptions { join_timeout: Duration::from_millis(30), ..Default::default() };
        let stream = AudioStream::spawn(options, 8, Arc::clone(&reload), |_tx| {
            std::thread::sleep(Duration::from_millis(300));
        });
        assert!(!stream.cancel().await);
        assert!(reload.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_collect_assembles_in_order() {
        let stream = AudioStream::spawn(StreamOptions::default(), 4, flag(), |mut tx| {
            tx.send_audio(0, ChunkKind::Speech, vec![1.0, 2.0], 4);
            tx.send_audio(1, ChunkKind::Silence, vec![0.0; 2], 4);
            tx.send_audio(2, ChunkKind::Speech, vec![3.0], 4);
            tx.finish();
        });
        let buf = stream.collect().await.unwrap();
        assert_eq!(buf.samples, vec![1.0, 2.0, 0.0, 0.0, 3.0]);
        assert_eq!(buf.sample_rate, 4);
    }
}
