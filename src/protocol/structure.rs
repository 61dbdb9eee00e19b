use std::collections::HashMap;

use crate::protocol::types::{FieldLength, TypeTag};

/// One declared field: position, name, kind and an optional explicit width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub order: i32,
    pub name: &'static str,
    pub tag: TypeTag,
    /// Overrides the converter table's canonical width.
    pub length: Option<FieldLength>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordField {
    pub order: i32,
    pub name: &'static str,
    pub tag: TypeTag,
    pub length: FieldLength,
    pub offset: usize,
}

impl RecordField {
    /// Byte range of the field inside an encoded record, for fixed-width fields.
    pub fn range(&self) -> Option<std::ops::Range<usize>> {
        self.length
            .fixed()
            .map(|length| self.offset..self.offset + length)
    }
}

/// Compiled layout of a record type.
///
/// Fields are kept sorted by `order`, each at the running sum of the widths before it,
/// so the encoded record has no gaps and no overlaps. Built once per record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStructure {
    pub name: &'static str,
    fields: Vec<RecordField>,
    fields_index_by_name: HashMap<&'static str, usize>,
    length: usize,
    fixed: bool,
}

impl RecordStructure {
    /// Compiles a field list.
    ///
    /// Panics on duplicate orders or names, on a field whose width cannot be resolved,
    /// and on a variable-width field that is not the last one: all are mistakes in a
    /// static record declaration.
    pub fn from_fields_desc_vec(name: &'static str, mut fields_desc: Vec<FieldDesc>) -> Self {
        fields_desc.sort_by_key(|desc| desc.order);

        let mut fields: Vec<RecordField> = Vec::with_capacity(fields_desc.len());
        let mut fields_index_by_name = HashMap::with_capacity(fields_desc.len());
        let mut offset = 0;
        let mut fixed = true;
        for (index, desc) in fields_desc.into_iter().enumerate() {
            if let Some(previous) = fields.last() {
                assert_ne!(
                    previous.order, desc.order,
                    "{}: fields {} and {} share order {}",
                    name, previous.name, desc.name, desc.order
                );
                assert!(
                    previous.length != FieldLength::Variable,
                    "{}: variable-width field {} must be the last field",
                    name,
                    previous.name
                );
            }
            let length = desc.length.unwrap_or(desc.tag.converter().length);
            if desc.length.is_none() && length == FieldLength::Variable {
                panic!(
                    "{}: field {} of kind {:?} needs an explicit length",
                    name, desc.name, desc.tag
                );
            }
            let previous_index = fields_index_by_name.insert(desc.name, index);
            assert!(
                previous_index.is_none(),
                "{}: duplicate field name {}",
                name,
                desc.name
            );

            fields.push(RecordField {
                order: desc.order,
                name: desc.name,
                tag: desc.tag,
                length,
                offset,
            });
            match length {
                FieldLength::Fixed(width) => offset += width,
                FieldLength::Variable => fixed = false,
            }
        }

        RecordStructure {
            name,
            fields,
            fields_index_by_name,
            length: offset,
            fixed,
        }
    }

    /// Sum of all fixed field widths.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Whether every field has a fixed width, i.e. `length` is the whole record.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn fields(&self) -> &[RecordField] {
        &self.fields
    }

    pub fn get_field(&self, name: &str) -> Option<&RecordField> {
        self.fields_index_by_name
            .get(name)
            .and_then(|index| self.fields.get(*index))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields_index_by_name.contains_key(name)
    }
}
