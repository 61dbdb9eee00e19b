//! Head plus variable content: the unit exchanged with a device.
//!
//! On the wire a socket record sits inside an envelope,
//!
//! ```text
//! STX(0x02) | head (14) | content (head.length) | ETX(0x03)
//! ```
//!
//! The record codec handles head and content; the envelope bytes belong to the stream
//! framer (see `network::frame`).

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::protocol::frames::{CheckRecord, CommandRecord, HeadRecord, StatusRecord, HEAD_LENGTH};
use crate::protocol::record::{nested_from_bytes, unknown_field, Record, RecordContent, RecordState, StructureCell};
use crate::protocol::structure::{FieldDesc, RecordStructure};
use crate::protocol::types::{FieldLength, FieldValue, TypeTag};
use crate::{AppError, AppResult};

pub const START_OF_TEXT: u8 = 0x02;
pub const END_OF_TEXT: u8 = 0x03;

/// Frames wrapped in the STX/ETX envelope.
pub trait SocketEnvelope {
    fn head(&self) -> &HeadRecord;

    /// Appends `STX | head | content | ETX` to `dst`, encoding the current field values.
    fn write_envelope(&self, dst: &mut BytesMut) -> AppResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SocketRecord<C: RecordContent = Bytes> {
    pub head: HeadRecord,
    pub content: C,
    state: RecordState,
}

// one layout serves every content type
static SOCKET_RECORD_STRUCTURE: StructureCell = StructureCell::new();

impl<C: RecordContent> SocketRecord<C> {
    /// Builds a record whose head carries the content's length and check.
    pub fn new(command: CommandRecord, status: StatusRecord, content: C) -> AppResult<Self> {
        let encoded = content.encode_content()?;
        let head = HeadRecord::new(
            encoded.len() as i64,
            command,
            status,
            CheckRecord::compute(&encoded),
        );
        let mut record = SocketRecord {
            head,
            content,
            state: RecordState::default(),
        };
        record.set_bytes()?;
        Ok(record)
    }

    /// Whether the head's check matches the encoded content.
    pub fn verify_check(&self) -> bool {
        match self.content.encode_content() {
            Ok(encoded) => self.head.check.matches(&encoded),
            Err(_) => false,
        }
    }

    fn decode(bytes: &[u8]) -> AppResult<Self> {
        if bytes.len() < HEAD_LENGTH {
            return Err(AppError::MalformedProtocol(format!(
                "socket record needs at least {} bytes, got {}",
                HEAD_LENGTH,
                bytes.len()
            )));
        }
        let head: HeadRecord = nested_from_bytes(&bytes[..HEAD_LENGTH])?;
        let content_length = head.content_length().ok_or_else(|| {
            AppError::MalformedProtocol(format!("negative content length {}", head.length))
        })?;
        let content_bytes = &bytes[HEAD_LENGTH..];
        if content_bytes.len() != content_length {
            return Err(AppError::MalformedProtocol(format!(
                "head announces {} content bytes, got {}",
                content_length,
                content_bytes.len()
            )));
        }
        let content = C::decode_content(content_bytes)?;
        let mut record = SocketRecord {
            head,
            content,
            state: RecordState::default(),
        };
        record.state.mark_valid(Bytes::copy_from_slice(bytes));
        Ok(record)
    }
}

impl<C: RecordContent> Record for SocketRecord<C> {
    fn structure() -> &'static RecordStructure {
        SOCKET_RECORD_STRUCTURE.get_or_init(|| {
            RecordStructure::from_fields_desc_vec(
                "SocketRecord",
                vec![
                    FieldDesc {
                        order: 1,
                        name: "head",
                        tag: TypeTag::Record,
                        length: Some(FieldLength::Fixed(HEAD_LENGTH)),
                    },
                    FieldDesc {
                        order: 2,
                        name: "content",
                        tag: TypeTag::Content,
                        length: Some(FieldLength::Variable),
                    },
                ],
            )
        })
    }

    fn get_field(&self, name: &str) -> AppResult<FieldValue> {
        match name {
            "head" => Ok(FieldValue::Record(self.head.to_bytes()?)),
            "content" => Ok(FieldValue::Content(self.content.encode_content()?)),
            _ => Err(unknown_field(Self::structure().name, name)),
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> AppResult<()> {
        match (name, value) {
            ("head", FieldValue::Record(bytes)) => {
                self.head = nested_from_bytes(&bytes)?;
                Ok(())
            }
            ("content", FieldValue::Content(bytes)) => {
                self.content = C::decode_content(&bytes)?;
                Ok(())
            }
            (name, value) => Err(AppError::InvalidValue(format!(
                "cannot assign {:?} to SocketRecord.{}",
                value, name
            ))),
        }
    }

    fn state(&self) -> &RecordState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RecordState {
        &mut self.state
    }

    /// Reads the head, then exactly `head.length` content bytes.
    fn from_bytes(bytes: &[u8]) -> Self {
        match Self::decode(bytes) {
            Ok(record) => record,
            Err(e) => {
                trace!("SocketRecord rejected: {}", e);
                Self::default()
            }
        }
    }

    fn to_bytes(&self) -> AppResult<Bytes> {
        let head = self.head.to_bytes()?;
        let content = self.content.encode_content()?;
        if self.head.content_length() != Some(content.len()) {
            return Err(AppError::InvalidValue(format!(
                "head announces {} content bytes but content encodes to {}",
                self.head.length,
                content.len()
            )));
        }
        let mut buffer = BytesMut::with_capacity(head.len() + content.len());
        buffer.put_slice(&head);
        buffer.put_slice(&content);
        Ok(buffer.freeze())
    }
}

impl<C: RecordContent> SocketEnvelope for SocketRecord<C> {
    fn head(&self) -> &HeadRecord {
        &self.head
    }

    fn write_envelope(&self, dst: &mut BytesMut) -> AppResult<()> {
        let encoded = self.to_bytes()?;
        dst.reserve(encoded.len() + 2);
        dst.put_u8(START_OF_TEXT);
        dst.put_slice(&encoded);
        dst.put_u8(END_OF_TEXT);
        Ok(())
    }
}

impl<C: RecordContent + PartialEq> PartialEq for SocketRecord<C> {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head && self.content == other.content
    }
}
