//! Declarative binary records and the frames built from them.
//!
//! Record types are declared with [`define_record!`](crate::define_record); their layout
//! is compiled into a [`RecordStructure`] on first use and every field travels through
//! the converter table of its [`TypeTag`].

pub use bytes::Bytes;
pub use frames::{CheckRecord, CommandRecord, HeadRecord, StatusRecord, HEAD_LENGTH};
pub use record::{
    nested_from_bytes, nested_from_field, nested_length, nested_to_field, unknown_field,
    Record, RecordContent, RecordState, RecordValue, StructureCell,
};
pub use socket_record::{SocketEnvelope, SocketRecord, END_OF_TEXT, START_OF_TEXT};
pub use structure::{FieldDesc, RecordField, RecordStructure};
pub use types::{coerce_to_length, Converter, FieldLength, FieldValue, TypeTag};

mod frames;
mod record;
mod socket_record;
mod structure;
mod types;
