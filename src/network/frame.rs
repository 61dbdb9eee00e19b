use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::network::pipe::{FlushResult, PipeReader, PipeWriter};
use crate::protocol::{
    Record, RecordContent, SocketEnvelope, SocketRecord, END_OF_TEXT, HEAD_LENGTH,
    START_OF_TEXT,
};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

// STX and ETX around every frame
const ENVELOPE_OVERHEAD: usize = 2;

/// Cuts a byte stream into enveloped [`SocketRecord`]s.
///
/// Bytes before a start-of-text marker are dropped. A candidate frame whose end-of-text
/// marker is missing is treated as noise: its start byte is skipped and the search goes
/// on. A head announcing more than `max_package_size` content bytes is an error when the
/// stream is in sync, and noise while the codec is still resyncing after a skip.
#[derive(Debug)]
pub struct SocketFrameCodec<C = bytes::Bytes> {
    max_package_size: usize,
    // set by any skipped byte, cleared by the next complete frame
    resyncing: bool,
    _content: PhantomData<fn() -> C>,
}

impl<C> Clone for SocketFrameCodec<C> {
    fn clone(&self) -> Self {
        SocketFrameCodec::new(self.max_package_size)
    }
}

impl<C> SocketFrameCodec<C> {
    pub fn new(max_package_size: usize) -> Self {
        SocketFrameCodec {
            max_package_size,
            resyncing: false,
            _content: PhantomData,
        }
    }

    pub fn max_package_size(&self) -> usize {
        self.max_package_size
    }

    /// Returns the full envelope length of the frame at the front of `buffer`.
    fn check(&mut self, buffer: &mut BytesMut) -> AppResult<usize> {
        loop {
            match buffer.iter().position(|byte| *byte == START_OF_TEXT) {
                Some(0) => {}
                Some(skip) => {
                    warn!("discarding {} bytes before start of text", skip);
                    buffer.advance(skip);
                    self.resyncing = true;
                }
                None => {
                    if !buffer.is_empty() {
                        warn!("discarding {} bytes without start of text", buffer.len());
                        buffer.clear();
                        self.resyncing = true;
                    }
                    return Err(Incomplete);
                }
            }
            if buffer.remaining() < 1 + HEAD_LENGTH {
                return Err(Incomplete);
            }
            let mut length_bytes = [0u8; 8];
            length_bytes.copy_from_slice(&buffer[1..9]);
            let content_length = i64::from_be_bytes(length_bytes);
            if content_length < 0 {
                warn!("negative content length {}, resyncing", content_length);
                buffer.advance(1);
                self.resyncing = true;
                continue;
            }
            if content_length as u64 > self.max_package_size as u64 {
                if self.resyncing {
                    trace!("oversized length {} while resyncing", content_length);
                    buffer.advance(1);
                    continue;
                }
                return Err(AppError::MalformedProtocol(format!(
                    "Frame of length {} is too large.",
                    content_length
                )));
            }
            let frame_length = HEAD_LENGTH + content_length as usize + ENVELOPE_OVERHEAD;
            if buffer.remaining() < frame_length {
                buffer.reserve(frame_length - buffer.remaining());
                return Err(Incomplete);
            }
            if buffer[frame_length - 1] != END_OF_TEXT {
                warn!(
                    "frame of {} bytes lacks end of text, resyncing",
                    frame_length
                );
                buffer.advance(1);
                self.resyncing = true;
                continue;
            }
            self.resyncing = false;
            return Ok(frame_length);
        }
    }
}

impl<C: RecordContent> SocketFrameCodec<C> {
    pub(crate) fn parse(&mut self, buffer: &mut BytesMut) -> AppResult<Option<SocketRecord<C>>> {
        match self.check(buffer) {
            Ok(frame_length) => {
                let frame = buffer.split_to(frame_length);
                let record = SocketRecord::<C>::from_bytes(&frame[1..frame_length - 1]);
                if !record.is_valid() {
                    warn!("frame of {} bytes could not be decoded", frame_length);
                }
                Ok(Some(record))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<C: RecordContent> Decoder for SocketFrameCodec<C> {
    type Item = SocketRecord<C>;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Self::Item>> {
        self.parse(src)
    }
}

impl<C: RecordContent> Encoder<SocketRecord<C>> for SocketFrameCodec<C> {
    type Error = AppError;

    fn encode(&mut self, item: SocketRecord<C>, dst: &mut BytesMut) -> AppResult<()> {
        item.write_envelope(dst)
    }
}

/// Reads enveloped records from a connection's input pipe.
#[derive(Debug)]
pub struct FrameReader<C = bytes::Bytes> {
    codec: SocketFrameCodec<C>,
    buffer: BytesMut,
}

impl<C: RecordContent> FrameReader<C> {
    pub fn new(max_package_size: usize) -> Self {
        FrameReader {
            codec: SocketFrameCodec::new(max_package_size),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Next record, or `None` once the pipe is completed or the read is canceled.
    ///
    /// A pipe completed in the middle of a frame is an error.
    pub async fn read_frame(
        &mut self,
        input: &mut PipeReader,
    ) -> AppResult<Option<SocketRecord<C>>> {
        loop {
            if let Some(record) = self.codec.parse(&mut self.buffer)? {
                return Ok(Some(record));
            }

            let result = input.read().await;
            let consumed = result.buffer.len();
            let is_canceled = result.is_canceled;
            let is_completed = result.is_completed;
            for segment in result.buffer.segments() {
                self.buffer.extend_from_slice(segment);
            }
            input.advance_to(consumed);

            if is_canceled {
                trace!("frame read canceled");
                return self.codec.parse(&mut self.buffer);
            }
            if is_completed && consumed == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(AppError::MalformedProtocol(format!(
                    "stream ended inside a frame, {} bytes left",
                    self.buffer.len()
                )));
            }
        }
    }
}

/// Writes enveloped records to a connection's output pipe.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buffer: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write_frame<R: SocketEnvelope>(
        &mut self,
        output: &mut PipeWriter,
        record: &R,
    ) -> AppResult<FlushResult> {
        self.buffer.clear();
        record.write_envelope(&mut self.buffer)?;
        output.write(&self.buffer);
        Ok(output.flush().await)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::network::pipe::{pipe, PipeOptions};
    use crate::protocol::{CommandRecord, StatusRecord};

    fn record(content: &'static [u8]) -> SocketRecord {
        SocketRecord::new(
            CommandRecord::new(1, 2),
            StatusRecord::new(0, 0),
            Bytes::from_static(content),
        )
        .unwrap()
    }

    fn enveloped(content: &'static [u8]) -> BytesMut {
        let mut buffer = BytesMut::new();
        record(content).write_envelope(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn decodes_across_partial_input() {
        let mut codec = SocketFrameCodec::<Bytes>::new(1024);
        let full = enveloped(b"abc");
        let mut buffer = BytesMut::from(&full[..10]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&full[10..]);
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(decoded.is_valid());
        assert_eq!(decoded.content.as_ref(), b"abc");
        assert!(buffer.is_empty());
    }

    #[test]
    fn skips_garbage_and_broken_frames() {
        let mut codec = SocketFrameCodec::<Bytes>::new(1024);
        let mut buffer = BytesMut::from(&b"\xFF\xFE"[..]);
        let mut broken = enveloped(b"xy");
        let last = broken.len() - 1;
        broken[last] = 0x00;
        buffer.extend_from_slice(&broken);
        buffer.extend_from_slice(&enveloped(b"ok"));

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.content.as_ref(), b"ok");
    }

    #[test]
    fn resync_survives_false_start_split_across_reads() {
        let mut codec = SocketFrameCodec::<Bytes>::new(1024);
        let mut broken = enveloped(b"xy");
        let last = broken.len() - 1;
        broken[last] = 0x00;
        let good = enveloped(b"ok");

        // stop right after the length byte 0x02 of the broken head, so the next read
        // starts at a false start of text
        let mut buffer = BytesMut::from(&broken[..9]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&broken[9..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&good);

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded.content.as_ref(), b"ok");
        assert!(buffer.is_empty());

        // back in sync: an oversized head is fatal again
        let mut oversized = enveloped(b"ok");
        oversized[1..9].copy_from_slice(&4096i64.to_be_bytes());
        assert!(matches!(
            codec.decode(&mut oversized),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut codec = SocketFrameCodec::<Bytes>::new(2);
        let mut buffer = enveloped(b"too long");
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn encoder_matches_envelope() {
        let mut codec = SocketFrameCodec::<Bytes>::new(1024);
        let mut dst = BytesMut::new();
        codec.encode(record(b"hi"), &mut dst).unwrap();
        assert_eq!(dst, enveloped(b"hi"));
    }

    #[tokio::test]
    async fn reader_and_writer_over_pipe() {
        let (mut writer, mut reader) = pipe(PipeOptions::default());
        let mut frame_writer = FrameWriter::new();
        let mut frame_reader = FrameReader::<Bytes>::new(1024);

        frame_writer
            .write_frame(&mut writer, &record(b"one"))
            .await
            .unwrap();
        frame_writer
            .write_frame(&mut writer, &record(b"two"))
            .await
            .unwrap();
        writer.complete();

        let first = frame_reader.read_frame(&mut reader).await.unwrap().unwrap();
        let second = frame_reader.read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.content.as_ref(), b"one");
        assert_eq!(second.content.as_ref(), b"two");
        assert!(frame_reader.read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut writer, mut reader) = pipe(PipeOptions::default());
        let full = enveloped(b"partial");
        writer.write(&full[..full.len() - 3]);
        writer.flush().await;
        writer.complete();

        let mut frame_reader = FrameReader::<Bytes>::new(1024);
        assert!(frame_reader.read_frame(&mut reader).await.is_err());
    }
}
