//! Single-producer, single-consumer byte pipe with flush backpressure.
//!
//! The writer stages bytes locally (`get_memory`/`advance` or `write`) and publishes them
//! with `flush`. The reader sees every published segment at once, without copying, and
//! releases them with `advance_to`. A flush that leaves `pause_writer_threshold` or more
//! unconsumed bytes waits until the reader drains the pipe to `resume_writer_threshold`.
//!
//! Either side can be completed or have its pending call canceled through a
//! [`PipeHandle`]; reads and flushes report that through `is_completed`/`is_canceled`
//! instead of failing.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::service::ConnectionConfig;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    pub pause_writer_threshold: usize,
    pub resume_writer_threshold: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        PipeOptions {
            pause_writer_threshold: 64 * 1024,
            resume_writer_threshold: 32 * 1024,
        }
    }
}

impl From<&ConnectionConfig> for PipeOptions {
    fn from(config: &ConnectionConfig) -> Self {
        PipeOptions {
            pause_writer_threshold: config.pause_writer_threshold,
            resume_writer_threshold: config.resume_writer_threshold,
        }
    }
}

#[derive(Debug, Default)]
struct PipeState {
    segments: VecDeque<Bytes>,
    buffered: usize,
    writer_completed: bool,
    reader_completed: bool,
    read_canceled: bool,
    flush_canceled: bool,
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
    reader_notify: Notify,
    writer_notify: Notify,
    options: PipeOptions,
}

impl PipeShared {
    fn complete_writer(&self) {
        self.state.lock().writer_completed = true;
        self.reader_notify.notify_one();
        self.writer_notify.notify_one();
    }

    fn complete_reader(&self) {
        let mut state = self.state.lock();
        state.reader_completed = true;
        state.segments.clear();
        state.buffered = 0;
        drop(state);
        self.writer_notify.notify_one();
        self.reader_notify.notify_one();
    }
}

/// Creates a pipe and returns its two ends.
pub fn pipe(options: PipeOptions) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState::default()),
        reader_notify: Notify::new(),
        writer_notify: Notify::new(),
        options,
    });
    (
        PipeWriter {
            shared: shared.clone(),
            staging: BytesMut::new(),
            memory_start: None,
        },
        PipeReader {
            shared,
            snapshot: Vec::new(),
        },
    )
}

/// Remote control for a pipe whose ends are owned elsewhere.
#[derive(Debug, Clone)]
pub struct PipeHandle {
    shared: Arc<PipeShared>,
}

impl PipeHandle {
    pub fn complete_writer(&self) {
        self.shared.complete_writer();
    }

    pub fn complete_reader(&self) {
        self.shared.complete_reader();
    }

    /// Makes the pending (or next) read return with `is_canceled` set.
    pub fn cancel_pending_read(&self) {
        self.shared.state.lock().read_canceled = true;
        self.shared.reader_notify.notify_one();
    }

    /// Makes the pending (or next) flush return with `is_canceled` set.
    pub fn cancel_pending_flush(&self) {
        self.shared.state.lock().flush_canceled = true;
        self.shared.writer_notify.notify_one();
    }

    pub fn is_writer_completed(&self) -> bool {
        self.shared.state.lock().writer_completed
    }

    pub fn is_reader_completed(&self) -> bool {
        self.shared.state.lock().reader_completed
    }

    /// Bytes published but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub is_canceled: bool,
    pub is_completed: bool,
}

#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<PipeShared>,
    staging: BytesMut,
    memory_start: Option<usize>,
}

impl PipeWriter {
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Returns a zeroed writable region of at least `size_hint` bytes. Only the part
    /// committed with [`advance`](Self::advance) is kept.
    pub fn get_memory(&mut self, size_hint: usize) -> &mut [u8] {
        let start = match self.memory_start {
            Some(start) => {
                self.staging.truncate(start);
                start
            }
            None => self.staging.len(),
        };
        self.memory_start = Some(start);
        self.staging.resize(start + size_hint.max(1), 0);
        &mut self.staging[start..]
    }

    pub fn advance(&mut self, count: usize) -> AppResult<()> {
        let start = self.memory_start.take().ok_or_else(|| {
            AppError::InvalidOperation("advance without a preceding get_memory".to_string())
        })?;
        let requested = self.staging.len() - start;
        if count > requested {
            self.staging.truncate(start);
            return Err(AppError::InvalidOperation(format!(
                "advance by {} exceeds the {} bytes handed out",
                count, requested
            )));
        }
        self.staging.truncate(start + count);
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) {
        self.drop_uncommitted();
        self.staging.extend_from_slice(data);
    }

    /// Bytes staged but not flushed yet.
    pub fn unflushed(&self) -> usize {
        self.memory_start.unwrap_or(self.staging.len())
    }

    fn drop_uncommitted(&mut self) {
        if let Some(start) = self.memory_start.take() {
            self.staging.truncate(start);
        }
    }

    /// Publishes the staged bytes and waits while the reader is behind.
    pub async fn flush(&mut self) -> FlushResult {
        self.drop_uncommitted();
        let pending = self.staging.split().freeze();
        {
            let mut state = self.shared.state.lock();
            if state.reader_completed || state.writer_completed {
                return FlushResult {
                    is_canceled: false,
                    is_completed: true,
                };
            }
            if !pending.is_empty() {
                state.buffered += pending.len();
                state.segments.push_back(pending);
                self.shared.reader_notify.notify_one();
            }
            if state.flush_canceled {
                state.flush_canceled = false;
                return FlushResult {
                    is_canceled: true,
                    is_completed: false,
                };
            }
            if state.buffered < self.shared.options.pause_writer_threshold {
                return FlushResult::default();
            }
        }

        loop {
            let notified = self.shared.writer_notify.notified();
            {
                let mut state = self.shared.state.lock();
                if state.reader_completed || state.writer_completed {
                    return FlushResult {
                        is_canceled: false,
                        is_completed: true,
                    };
                }
                if state.flush_canceled {
                    state.flush_canceled = false;
                    return FlushResult {
                        is_canceled: true,
                        is_completed: false,
                    };
                }
                if state.buffered <= self.shared.options.resume_writer_threshold {
                    return FlushResult::default();
                }
            }
            notified.await;
        }
    }

    pub fn complete(&mut self) {
        self.drop_uncommitted();
        self.shared.complete_writer();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.complete_writer();
    }
}

/// Published data as handed to the reader: the segments in arrival order.
#[derive(Debug, Clone, Copy)]
pub struct ReadBuffer<'a> {
    segments: &'a [Bytes],
    len: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn segments(&self) -> &'a [Bytes] {
        self.segments
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the data out into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments {
            [] => Bytes::new(),
            [single] => single.clone(),
            segments => {
                let mut joined = BytesMut::with_capacity(self.len);
                for segment in segments {
                    joined.extend_from_slice(segment);
                }
                joined.freeze()
            }
        }
    }
}

#[derive(Debug)]
pub struct ReadResult<'a> {
    pub buffer: ReadBuffer<'a>,
    pub is_canceled: bool,
    pub is_completed: bool,
}

#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<PipeShared>,
    snapshot: Vec<Bytes>,
}

impl PipeReader {
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Waits until data is published, the pipe is completed, or the read is canceled.
    pub async fn read(&mut self) -> ReadResult<'_> {
        let (is_canceled, is_completed) = loop {
            let notified = self.shared.reader_notify.notified();
            {
                let mut state = self.shared.state.lock();
                let is_completed = state.writer_completed || state.reader_completed;
                if state.read_canceled {
                    state.read_canceled = false;
                    fill_snapshot(&mut self.snapshot, &state);
                    break (true, is_completed);
                }
                if !state.segments.is_empty() || is_completed {
                    fill_snapshot(&mut self.snapshot, &state);
                    break (false, is_completed);
                }
            }
            notified.await;
        };
        let len = self.snapshot.iter().map(Bytes::len).sum();
        ReadResult {
            buffer: ReadBuffer {
                segments: &self.snapshot,
                len,
            },
            is_canceled,
            is_completed,
        }
    }

    /// Releases the first `consumed` bytes of the last read.
    pub fn advance_to(&mut self, consumed: usize) {
        self.snapshot.clear();
        if consumed == 0 {
            return;
        }
        let mut state = self.shared.state.lock();
        let mut remaining = consumed.min(state.buffered);
        state.buffered -= remaining;
        while remaining > 0 {
            let Some(front) = state.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                state.segments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        drop(state);
        self.shared.writer_notify.notify_one();
    }

    pub fn complete(&mut self) {
        self.snapshot.clear();
        self.shared.complete_reader();
    }
}

fn fill_snapshot(snapshot: &mut Vec<Bytes>, state: &PipeState) {
    snapshot.clear();
    snapshot.extend(state.segments.iter().cloned());
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.complete_reader();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn flushed_segments_reach_the_reader_in_order() {
        let (mut writer, mut reader) = pipe(PipeOptions::default());
        writer.write(b"abc");
        assert_eq!(writer.flush().await, FlushResult::default());
        let memory = writer.get_memory(16);
        memory[..2].copy_from_slice(b"de");
        writer.advance(2).unwrap();
        writer.flush().await;

        let result = reader.read().await;
        assert!(!result.is_completed);
        assert_eq!(result.buffer.segments().len(), 2);
        assert_eq!(result.buffer.to_bytes(), Bytes::from_static(b"abcde"));

        reader.advance_to(4);
        let result = reader.read().await;
        assert_eq!(result.buffer.to_bytes(), Bytes::from_static(b"e"));
    }

    #[tokio::test]
    async fn completed_writer_ends_reads() {
        let (mut writer, mut reader) = pipe(PipeOptions::default());
        writer.write(b"last");
        writer.flush().await;
        writer.complete();

        let result = reader.read().await;
        assert!(result.is_completed);
        assert_eq!(result.buffer.len(), 4);
        reader.advance_to(4);

        let result = reader.read().await;
        assert!(result.is_completed);
        assert!(result.buffer.is_empty());
    }

    #[tokio::test]
    async fn cancel_wakes_a_pending_read() {
        let (_writer, mut reader) = pipe(PipeOptions::default());
        let handle = reader.handle();
        let (result, _) = tokio::join!(reader.read(), async {
            tokio::task::yield_now().await;
            handle.cancel_pending_read();
        });
        assert!(result.is_canceled);
        assert!(!result.is_completed);
    }

    #[tokio::test]
    async fn flush_waits_for_reader_above_pause_threshold() {
        let (mut writer, mut reader) = pipe(PipeOptions {
            pause_writer_threshold: 8,
            resume_writer_threshold: 4,
        });
        writer.write(&[7u8; 10]);

        let blocked = tokio::time::timeout(Duration::from_millis(20), writer.flush()).await;
        assert!(blocked.is_err());
        assert_eq!(reader.handle().buffered(), 10);

        let consumed = reader.read().await.buffer.len();
        reader.advance_to(consumed);
        assert_eq!(writer.flush().await, FlushResult::default());
    }

    #[tokio::test]
    async fn completed_reader_ends_flushes() {
        let (mut writer, reader) = pipe(PipeOptions::default());
        drop(reader);
        writer.write(b"nobody listens");
        let result = writer.flush().await;
        assert!(result.is_completed);
    }

    #[test]
    fn advance_checks_the_handed_out_region() {
        let (mut writer, _reader) = pipe(PipeOptions::default());
        assert!(writer.advance(1).is_err());
        writer.get_memory(4);
        assert!(writer.advance(5).is_err());
        writer.get_memory(4);
        writer.advance(3).unwrap();
        assert_eq!(writer.unflushed(), 3);
    }
}
