use std::borrow::Cow;

use bytes::Bytes;

use crate::{AppError, AppResult};

/// Wire length of a field. `Variable` marks content whose length travels in the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLength {
    Fixed(usize),
    Variable,
}

impl FieldLength {
    pub fn fixed(self) -> Option<usize> {
        match self {
            FieldLength::Fixed(length) => Some(length),
            FieldLength::Variable => None,
        }
    }
}

/// Closed set of field kinds a record may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Byte = 0,
    Long = 1,
    Record = 2,
    Content = 3,
}

/// A decoded field, or a field ready to be encoded.
///
/// Nested records travel as their encoded bytes; the owning record turns them back into
/// the concrete type when the field is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Byte(u8),
    Long(i64),
    Record(Bytes),
    Content(Bytes),
}

/// Byte conversion for one [`TypeTag`].
pub struct Converter {
    pub decode: fn(&[u8]) -> FieldValue,
    pub encode: fn(&FieldValue) -> AppResult<Bytes>,
    /// Canonical wire length; `Variable` when it depends on the declaring record.
    pub length: FieldLength,
}

// indexed by `TypeTag as usize`
static CONVERTERS: [Converter; 4] = [
    Converter {
        decode: decode_byte,
        encode: encode_byte,
        length: FieldLength::Fixed(1),
    },
    Converter {
        decode: decode_long,
        encode: encode_long,
        length: FieldLength::Fixed(8),
    },
    Converter {
        decode: decode_record,
        encode: encode_record,
        length: FieldLength::Variable,
    },
    Converter {
        decode: decode_content,
        encode: encode_content,
        length: FieldLength::Variable,
    },
];

impl TypeTag {
    pub fn converter(self) -> &'static Converter {
        &CONVERTERS[self as usize]
    }
}

// a wider byte field keeps its low-order (last) byte
fn decode_byte(bytes: &[u8]) -> FieldValue {
    FieldValue::Byte(bytes.last().copied().unwrap_or_default())
}

fn encode_byte(value: &FieldValue) -> AppResult<Bytes> {
    match value {
        FieldValue::Byte(byte) => Ok(Bytes::copy_from_slice(&[*byte])),
        other => Err(mismatch(TypeTag::Byte, other)),
    }
}

// big-endian; bytes beyond the eighth shift the high-order ones out
fn decode_long(bytes: &[u8]) -> FieldValue {
    let value = bytes
        .iter()
        .fold(0u64, |value, byte| (value << 8) | u64::from(*byte));
    FieldValue::Long(value as i64)
}

fn encode_long(value: &FieldValue) -> AppResult<Bytes> {
    match value {
        FieldValue::Long(long) => Ok(Bytes::copy_from_slice(&long.to_be_bytes())),
        other => Err(mismatch(TypeTag::Long, other)),
    }
}

fn decode_record(bytes: &[u8]) -> FieldValue {
    FieldValue::Record(Bytes::copy_from_slice(bytes))
}

fn encode_record(value: &FieldValue) -> AppResult<Bytes> {
    match value {
        FieldValue::Record(bytes) => Ok(bytes.clone()),
        other => Err(mismatch(TypeTag::Record, other)),
    }
}

fn decode_content(bytes: &[u8]) -> FieldValue {
    FieldValue::Content(Bytes::copy_from_slice(bytes))
}

fn encode_content(value: &FieldValue) -> AppResult<Bytes> {
    match value {
        FieldValue::Content(bytes) => Ok(bytes.clone()),
        other => Err(mismatch(TypeTag::Content, other)),
    }
}

fn mismatch(expected: TypeTag, found: &FieldValue) -> AppError {
    AppError::InvalidValue(format!("expected a {:?} field but found {:?}", expected, found))
}

/// Fits an encoded field into its declared width.
///
/// Values are big-endian, so the high-order end is the front: a longer encoding loses its
/// leading bytes, a shorter one is left-padded with zeros. No error is raised.
pub fn coerce_to_length(bytes: &[u8], length: usize) -> Cow<'_, [u8]> {
    match bytes.len() {
        len if len == length => Cow::Borrowed(bytes),
        len if len > length => Cow::Borrowed(&bytes[len - length..]),
        len => {
            let mut padded = vec![0u8; length - len];
            padded.extend_from_slice(bytes);
            Cow::Owned(padded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_keeps_exact_width() {
        let fitted = coerce_to_length(&[1, 2, 3], 3);
        assert!(matches!(fitted, Cow::Borrowed(_)));
        assert_eq!(&*fitted, &[1, 2, 3]);
    }

    #[test]
    fn coerce_truncates_high_order_bytes() {
        let encoded = 0x0102_0304_0506_0708i64.to_be_bytes();
        assert_eq!(&*coerce_to_length(&encoded, 4), &[5, 6, 7, 8]);
    }

    #[test]
    fn coerce_pads_high_order_bytes() {
        assert_eq!(&*coerce_to_length(&[0xAB], 4), &[0, 0, 0, 0xAB]);
        assert_eq!(&*coerce_to_length(&[], 2), &[0, 0]);
    }

    #[test]
    fn converter_table_is_indexed_by_tag() {
        assert_eq!(TypeTag::Byte.converter().length, FieldLength::Fixed(1));
        assert_eq!(TypeTag::Long.converter().length, FieldLength::Fixed(8));
        assert_eq!(TypeTag::Record.converter().length, FieldLength::Variable);

        let long = TypeTag::Long.converter();
        let encoded = (long.encode)(&FieldValue::Long(-2)).unwrap();
        assert_eq!((long.decode)(&encoded), FieldValue::Long(-2));
        assert!((long.encode)(&FieldValue::Byte(1)).is_err());
    }

    #[test]
    fn narrow_and_wide_integer_fields_decode_from_the_low_end() {
        assert_eq!(decode_long(&[0x01, 0x00]), FieldValue::Long(256));
        assert_eq!(decode_byte(&[0x00, 0x00, 0x7F]), FieldValue::Byte(0x7F));
    }
}
