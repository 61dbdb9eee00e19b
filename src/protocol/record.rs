//! Declarative fixed-layout records.
//!
//! A record type declares its fields once, with an order and optionally an explicit
//! width, through [`define_record!`](crate::define_record). The declaration compiles to a
//! [`RecordStructure`] built on first use; decoding and encoding walk that structure and
//! move each field through the converter table of its [`TypeTag`].

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tracing::{trace, warn};

use crate::protocol::structure::RecordStructure;
use crate::protocol::types::{coerce_to_length, FieldLength, FieldValue, TypeTag};
use crate::{AppError, AppResult};

/// Holder for a record type's compiled structure.
pub type StructureCell = OnceCell<RecordStructure>;

/// Whether a record holds a verified encoding, and that encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordState {
    valid: bool,
    bytes: Option<Bytes>,
}

impl RecordState {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.bytes.as_ref()
    }

    pub fn mark_valid(&mut self, bytes: Bytes) {
        self.valid = true;
        self.bytes = Some(bytes);
    }

    pub fn mark_invalid(&mut self) {
        self.valid = false;
        self.bytes = None;
    }
}

pub trait Record: Clone + Default {
    fn structure() -> &'static RecordStructure;

    fn get_field(&self, name: &str) -> AppResult<FieldValue>;

    fn set_field(&mut self, name: &str, value: FieldValue) -> AppResult<()>;

    fn state(&self) -> &RecordState;

    fn state_mut(&mut self) -> &mut RecordState;

    /// Decodes a record. A buffer that does not match the structure yields an empty,
    /// invalid record.
    fn from_bytes(bytes: &[u8]) -> Self {
        match decode_fixed::<Self>(bytes) {
            Ok(record) => record,
            Err(e) => {
                trace!("{} rejected: {}", Self::structure().name, e);
                Self::default()
            }
        }
    }

    /// Encodes the current field values and stores the result.
    fn set_bytes(&mut self) -> AppResult<()> {
        match self.to_bytes() {
            Ok(bytes) => {
                self.state_mut().mark_valid(bytes);
                Ok(())
            }
            Err(e) => {
                self.state_mut().mark_invalid();
                Err(e)
            }
        }
    }

    /// Encodes the current field values without storing them.
    fn to_bytes(&self) -> AppResult<Bytes> {
        encode_fixed(self)
    }

    /// `set_bytes` for constructors: a failure leaves the record invalid.
    fn sealed(mut self) -> Self {
        if let Err(e) = self.set_bytes() {
            warn!("{} could not be encoded: {}", Self::structure().name, e);
            self.state_mut().mark_invalid();
        }
        self
    }

    fn is_valid(&self) -> bool {
        self.state().is_valid()
    }

    fn bytes(&self) -> Option<&Bytes> {
        self.state().bytes()
    }
}

/// A Rust type usable as a record field.
pub trait RecordValue: Sized {
    const TAG: TypeTag;

    /// Width implied by the type itself, when the converter table cannot know it.
    fn declared_length() -> Option<FieldLength> {
        None
    }

    fn to_field_value(&self) -> AppResult<FieldValue>;

    fn from_field_value(value: FieldValue) -> AppResult<Self>;
}

impl RecordValue for u8 {
    const TAG: TypeTag = TypeTag::Byte;

    fn to_field_value(&self) -> AppResult<FieldValue> {
        Ok(FieldValue::Byte(*self))
    }

    fn from_field_value(value: FieldValue) -> AppResult<Self> {
        match value {
            FieldValue::Byte(byte) => Ok(byte),
            other => Err(unexpected_value(Self::TAG, &other)),
        }
    }
}

impl RecordValue for i64 {
    const TAG: TypeTag = TypeTag::Long;

    fn to_field_value(&self) -> AppResult<FieldValue> {
        Ok(FieldValue::Long(*self))
    }

    fn from_field_value(value: FieldValue) -> AppResult<Self> {
        match value {
            FieldValue::Long(long) => Ok(long),
            other => Err(unexpected_value(Self::TAG, &other)),
        }
    }
}

/// Payload carried after a head: raw bytes or any fixed record.
pub trait RecordContent: Clone + Default {
    fn decode_content(bytes: &[u8]) -> AppResult<Self>;

    fn encode_content(&self) -> AppResult<Bytes>;
}

impl RecordContent for Bytes {
    fn decode_content(bytes: &[u8]) -> AppResult<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn encode_content(&self) -> AppResult<Bytes> {
        Ok(self.clone())
    }
}

/// Width of a nested record field.
pub fn nested_length<R: Record>() -> Option<FieldLength> {
    Some(FieldLength::Fixed(R::structure().length()))
}

pub fn nested_to_field<R: Record>(record: &R) -> AppResult<FieldValue> {
    Ok(FieldValue::Record(record.to_bytes()?))
}

pub fn nested_from_field<R: Record>(value: FieldValue) -> AppResult<R> {
    match value {
        FieldValue::Record(bytes) | FieldValue::Content(bytes) => nested_from_bytes(&bytes),
        other => Err(unexpected_value(TypeTag::Record, &other)),
    }
}

pub fn nested_from_bytes<R: Record>(bytes: &[u8]) -> AppResult<R> {
    let record = R::from_bytes(bytes);
    if record.is_valid() {
        Ok(record)
    } else {
        Err(AppError::MalformedProtocol(format!(
            "{} expects {} bytes, got {}",
            R::structure().name,
            R::structure().length(),
            bytes.len()
        )))
    }
}

pub fn unknown_field(record: &str, name: &str) -> AppError {
    AppError::InvalidValue(format!("{} has no field {}", record, name))
}

fn unexpected_value(expected: TypeTag, found: &FieldValue) -> AppError {
    AppError::InvalidValue(format!("expected a {:?} value but found {:?}", expected, found))
}

fn decode_fixed<R: Record>(bytes: &[u8]) -> AppResult<R> {
    let structure = R::structure();
    if !structure.is_fixed() {
        return Err(AppError::InvalidOperation(format!(
            "{} has no fixed layout",
            structure.name
        )));
    }
    if bytes.len() != structure.length() {
        return Err(AppError::MalformedProtocol(format!(
            "{} expects {} bytes, got {}",
            structure.name,
            structure.length(),
            bytes.len()
        )));
    }
    // decoded into a fresh record, so a failure part way leaves nothing behind
    let mut record = R::default();
    for field in structure.fields() {
        let range = fixed_range(structure, field.name, field.range())?;
        let value = (field.tag.converter().decode)(&bytes[range]);
        record.set_field(field.name, value)?;
    }
    record
        .state_mut()
        .mark_valid(Bytes::copy_from_slice(bytes));
    Ok(record)
}

fn encode_fixed<R: Record>(record: &R) -> AppResult<Bytes> {
    let structure = R::structure();
    if !structure.is_fixed() {
        return Err(AppError::InvalidOperation(format!(
            "{} has no fixed layout",
            structure.name
        )));
    }
    let mut buffer = BytesMut::zeroed(structure.length());
    for field in structure.fields() {
        let range = fixed_range(structure, field.name, field.range())?;
        let width = range.len();
        let value = record.get_field(field.name)?;
        let encoded = (field.tag.converter().encode)(&value)?;
        if encoded.len() != width {
            trace!(
                "{}.{} coerced from {} to {} bytes",
                structure.name,
                field.name,
                encoded.len(),
                width
            );
        }
        buffer[range].copy_from_slice(&coerce_to_length(&encoded, width));
    }
    Ok(buffer.freeze())
}

fn fixed_range(
    structure: &RecordStructure,
    name: &str,
    range: Option<std::ops::Range<usize>>,
) -> AppResult<std::ops::Range<usize>> {
    range.ok_or_else(|| {
        AppError::IllegalStateError(format!(
            "{}.{} has no fixed width",
            structure.name, name
        ))
    })
}

/// Declares a fixed-layout record type.
///
/// Each field is written `[order] name: Type` or `[order, width] name: Type`. The type
/// must implement [`RecordValue`]: `u8`, `i64` or another record declared with this
/// macro. Without a width, primitives take the converter table's canonical width and
/// nested records take their own structure's length.
///
/// ```
/// devcom::define_record! {
///     /// Firmware version reported by a device.
///     pub struct VersionRecord {
///         [1] pub major: u8,
///         [2] pub minor: u8,
///         [3, 4] pub build: i64,
///     }
/// }
///
/// use devcom::protocol::Record;
/// assert_eq!(VersionRecord::structure().length(), 6);
/// ```
#[macro_export]
macro_rules! define_record {
    (@length $ty:ty) => {
        <$ty as $crate::protocol::RecordValue>::declared_length()
    };
    (@length $ty:ty, $length:literal) => {
        Some($crate::protocol::FieldLength::Fixed($length))
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                [$order:literal $(, $length:literal)?] $field_vis:vis $field:ident : $ty:ty
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )+
            state: $crate::protocol::RecordState,
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                true $(&& self.$field == other.$field)+
            }
        }

        impl Eq for $name {}

        impl $crate::protocol::Record for $name {
            fn structure() -> &'static $crate::protocol::RecordStructure {
                static STRUCTURE: $crate::protocol::StructureCell =
                    $crate::protocol::StructureCell::new();
                STRUCTURE.get_or_init(|| {
                    $crate::protocol::RecordStructure::from_fields_desc_vec(
                        stringify!($name),
                        vec![
                            $(
                                $crate::protocol::FieldDesc {
                                    order: $order,
                                    name: stringify!($field),
                                    tag: <$ty as $crate::protocol::RecordValue>::TAG,
                                    length: $crate::define_record!(@length $ty $(, $length)?),
                                },
                            )+
                        ],
                    )
                })
            }

            fn get_field(
                &self,
                name: &str,
            ) -> $crate::AppResult<$crate::protocol::FieldValue> {
                match name {
                    $(
                        stringify!($field) => {
                            $crate::protocol::RecordValue::to_field_value(&self.$field)
                        }
                    )+
                    _ => Err($crate::protocol::unknown_field(stringify!($name), name)),
                }
            }

            fn set_field(
                &mut self,
                name: &str,
                value: $crate::protocol::FieldValue,
            ) -> $crate::AppResult<()> {
                match name {
                    $(
                        stringify!($field) => {
                            self.$field =
                                <$ty as $crate::protocol::RecordValue>::from_field_value(value)?;
                            Ok(())
                        }
                    )+
                    _ => Err($crate::protocol::unknown_field(stringify!($name), name)),
                }
            }

            fn state(&self) -> &$crate::protocol::RecordState {
                &self.state
            }

            fn state_mut(&mut self) -> &mut $crate::protocol::RecordState {
                &mut self.state
            }
        }

        impl $crate::protocol::RecordValue for $name {
            const TAG: $crate::protocol::TypeTag = $crate::protocol::TypeTag::Record;

            fn declared_length() -> Option<$crate::protocol::FieldLength> {
                $crate::protocol::nested_length::<Self>()
            }

            fn to_field_value(&self) -> $crate::AppResult<$crate::protocol::FieldValue> {
                $crate::protocol::nested_to_field(self)
            }

            fn from_field_value(value: $crate::protocol::FieldValue) -> $crate::AppResult<Self> {
                $crate::protocol::nested_from_field(value)
            }
        }

        impl $crate::protocol::RecordContent for $name {
            fn decode_content(bytes: &[u8]) -> $crate::AppResult<Self> {
                $crate::protocol::nested_from_bytes(bytes)
            }

            fn encode_content(&self) -> $crate::AppResult<$crate::protocol::Bytes> {
                $crate::protocol::Record::to_bytes(self)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::define_record! {
        struct WideRecord {
            [2, 2] narrow: i64,
            [1, 3] padded: u8,
        }
    }

    #[test]
    fn declared_widths_override_the_table() {
        let structure = WideRecord::structure();
        assert_eq!(structure.length(), 5);
        assert_eq!(structure.fields()[0].name, "padded");
        assert_eq!(structure.fields()[1].offset, 3);
    }

    #[test]
    fn encode_pads_and_truncates_to_declared_width() {
        let record = WideRecord {
            narrow: 0x0102_0304,
            padded: 0x7F,
            ..Default::default()
        }
        .sealed();

        assert!(record.is_valid());
        assert_eq!(record.bytes().unwrap().as_ref(), &[0, 0, 0x7F, 0x03, 0x04]);

        let decoded = WideRecord::from_bytes(&[0, 0, 0x7F, 0x03, 0x04]);
        assert!(decoded.is_valid());
        assert_eq!(decoded.padded, 0x7F);
        assert_eq!(decoded.narrow, 0x0304);
    }

    #[test]
    fn empty_record_is_invalid_without_bytes() {
        let record = WideRecord::default();
        assert!(!record.is_valid());
        assert!(record.bytes().is_none());
    }

    #[test]
    fn unknown_fields_are_errors() {
        let mut record = WideRecord::default();
        assert!(record.get_field("missing").is_err());
        assert!(record.set_field("narrow", FieldValue::Byte(1)).is_err());
        record.set_field("narrow", FieldValue::Long(9)).unwrap();
        assert_eq!(record.narrow, 9);
    }
}
