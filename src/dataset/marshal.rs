// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! `marshal` / `unmarshal` (spec.md §4.1, §4.8): walk a dataset descriptor,
//! honouring natural alignment, byte-swapping to big-endian, recursing into
//! nested datasets, and length-prefixing dynamic arrays.

use crate::dataset::registry::Registry;
use crate::dataset::types::{Count, Dataset, DatasetId, Element, ElementKind, Primitive};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// One primitive value in host representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Char(u8),
    Utf16(u16),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Real32(f32),
    Real64(f64),
    TimeDate32(u32),
    TimeDate48([u8; 6]),
    TimeDate64(u64),
}

impl Value {
    fn matches(self, primitive: Primitive) -> bool {
        matches!(
            (self, primitive),
            (Value::Bool(_), Primitive::Bool8)
                | (Value::Char(_), Primitive::Char8)
                | (Value::Utf16(_), Primitive::Utf16)
                | (Value::I8(_), Primitive::Int8)
                | (Value::I16(_), Primitive::Int16)
                | (Value::I32(_), Primitive::Int32)
                | (Value::I64(_), Primitive::Int64)
                | (Value::U8(_), Primitive::Uint8)
                | (Value::U16(_), Primitive::Uint16)
                | (Value::U32(_), Primitive::Uint32)
                | (Value::U64(_), Primitive::Uint64)
                | (Value::Real32(_), Primitive::Real32)
                | (Value::Real64(_), Primitive::Real64)
                | (Value::TimeDate32(_), Primitive::TimeDate32)
                | (Value::TimeDate48(_), Primitive::TimeDate48)
                | (Value::TimeDate64(_), Primitive::TimeDate64)
        )
    }

    fn write_be(self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(b) => out.push(b as u8),
            Value::Char(c) => out.push(c),
            Value::Utf16(v) => {
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::I8(v) => out.push(v as u8),
            Value::I16(v) => {
                let mut buf = [0u8; 2];
                BigEndian::write_i16(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::I32(v) => {
                let mut buf = [0u8; 4];
                BigEndian::write_i32(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::I64(v) => {
                let mut buf = [0u8; 8];
                BigEndian::write_i64(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::U8(v) => out.push(v),
            Value::U16(v) => {
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::U32(v) | Value::TimeDate32(v) => {
                let mut buf = [0u8; 4];
                BigEndian::write_u32(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::U64(v) | Value::TimeDate64(v) => {
                let mut buf = [0u8; 8];
                BigEndian::write_u64(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::Real32(v) => {
                let mut buf = [0u8; 4];
                BigEndian::write_f32(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::Real64(v) => {
                let mut buf = [0u8; 8];
                BigEndian::write_f64(&mut buf, v);
                out.extend_from_slice(&buf);
            }
            Value::TimeDate48(bytes) => out.extend_from_slice(&bytes),
        }
    }

    fn read_be(primitive: Primitive, bytes: &[u8]) -> Value {
        match primitive {
            Primitive::Bool8 => Value::Bool(bytes[0] != 0),
            Primitive::Char8 => Value::Char(bytes[0]),
            Primitive::Utf16 => Value::Utf16(BigEndian::read_u16(bytes)),
            Primitive::Int8 => Value::I8(bytes[0] as i8),
            Primitive::Int16 => Value::I16(BigEndian::read_i16(bytes)),
            Primitive::Int32 => Value::I32(BigEndian::read_i32(bytes)),
            Primitive::Int64 => Value::I64(BigEndian::read_i64(bytes)),
            Primitive::Uint8 => Value::U8(bytes[0]),
            Primitive::Uint16 => Value::U16(BigEndian::read_u16(bytes)),
            Primitive::Uint32 => Value::U32(BigEndian::read_u32(bytes)),
            Primitive::Uint64 => Value::U64(BigEndian::read_u64(bytes)),
            Primitive::Real32 => Value::Real32(BigEndian::read_f32(bytes)),
            Primitive::Real64 => Value::Real64(BigEndian::read_f64(bytes)),
            Primitive::TimeDate32 => Value::TimeDate32(BigEndian::read_u32(bytes)),
            Primitive::TimeDate48 => {
                let mut buf = [0u8; 6];
                buf.copy_from_slice(&bytes[..6]);
                Value::TimeDate48(buf)
            }
            Primitive::TimeDate64 => Value::TimeDate64(BigEndian::read_u64(bytes)),
        }
    }
}

/// One element's worth of host data, parallel in order to its
/// [`Dataset`]'s element list.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Scalar(Value),
    Array(Vec<Value>),
    Nested(Box<DatasetValue>),
    NestedArray(Vec<DatasetValue>),
}

/// A fully-populated dataset instance in host representation.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetValue {
    pub dataset_id: DatasetId,
    pub fields: Vec<Field>,
}

fn align_out(out: &mut Vec<u8>, alignment: usize) {
    let pad = (alignment - (out.len() % alignment)) % alignment;
    out.resize(out.len() + pad, 0);
}

fn align_cursor(cursor: usize, alignment: usize) -> usize {
    (alignment - (cursor % alignment)) % alignment + cursor
}

/// Marshal `value` (which must describe `com_id`'s dataset) into `out`,
/// returning the number of bytes appended.
pub fn marshal(registry: &Registry, com_id: u32, value: &DatasetValue, out: &mut Vec<u8>) -> Result<usize> {
    let dataset = registry.dataset_for_com_id(com_id)?;
    if dataset.id != value.dataset_id {
        return Err(Error::Marshalling("value does not describe this comId's dataset"));
    }
    let start = out.len();
    marshal_dataset(registry, dataset, value, out)?;
    Ok(out.len() - start)
}

fn marshal_dataset(
    registry: &Registry,
    dataset: &Dataset,
    value: &DatasetValue,
    out: &mut Vec<u8>,
) -> Result<()> {
    if dataset.elements.len() != value.fields.len() {
        return Err(Error::Marshalling("field count does not match dataset element count"));
    }
    for (element, field) in dataset.elements.iter().zip(&value.fields) {
        marshal_element(registry, element, field, out)?;
    }
    Ok(())
}

fn marshal_element(registry: &Registry, element: &Element, field: &Field, out: &mut Vec<u8>) -> Result<()> {
    align_out(out, element.kind.alignment());
    match (element.kind, element.count, field) {
        (ElementKind::Primitive(p), Count::Fixed(1), Field::Scalar(v)) => {
            if !v.matches(p) {
                return Err(Error::Marshalling("value type does not match element type"));
            }
            v.write_be(out);
        }
        (ElementKind::Primitive(p), Count::Fixed(n), Field::Array(values)) => {
            if values.len() != n as usize {
                return Err(Error::Marshalling("fixed array length mismatch"));
            }
            for v in values {
                if !v.matches(p) {
                    return Err(Error::Marshalling("value type does not match element type"));
                }
                v.write_be(out);
            }
        }
        (ElementKind::Primitive(p), Count::Dynamic, Field::Array(values)) => {
            let len = u32::try_from(values.len()).map_err(|_| Error::Marshalling("array too long"))?;
            out.extend_from_slice(&len.to_be_bytes());
            for v in values {
                if !v.matches(p) {
                    return Err(Error::Marshalling("value type does not match element type"));
                }
                v.write_be(out);
            }
        }
        (ElementKind::Nested(id), Count::Fixed(1), Field::Nested(nested)) => {
            let nested_dataset = registry.dataset(id).ok_or(Error::Marshalling("unknown nested dataset"))?;
            marshal_dataset(registry, nested_dataset, nested, out)?;
        }
        (ElementKind::Nested(id), Count::Fixed(n), Field::NestedArray(values)) => {
            if values.len() != n as usize {
                return Err(Error::Marshalling("fixed nested array length mismatch"));
            }
            let nested_dataset = registry.dataset(id).ok_or(Error::Marshalling("unknown nested dataset"))?;
            for v in values {
                marshal_dataset(registry, nested_dataset, v, out)?;
            }
        }
        (ElementKind::Nested(id), Count::Dynamic, Field::NestedArray(values)) => {
            let len = u32::try_from(values.len()).map_err(|_| Error::Marshalling("array too long"))?;
            out.extend_from_slice(&len.to_be_bytes());
            let nested_dataset = registry.dataset(id).ok_or(Error::Marshalling("unknown nested dataset"))?;
            for v in values {
                marshal_dataset(registry, nested_dataset, v, out)?;
            }
        }
        _ => return Err(Error::Marshalling("field shape does not match element descriptor")),
    }
    Ok(())
}

/// Unmarshal `com_id`'s dataset out of `bytes`. Every declared element
/// count is checked against the remaining payload length before any byte
/// is read (spec.md §4.1 invariant).
pub fn unmarshal(registry: &Registry, com_id: u32, bytes: &[u8]) -> Result<DatasetValue> {
    let dataset = registry.dataset_for_com_id(com_id)?;
    let mut cursor = 0usize;
    let fields = unmarshal_dataset(registry, dataset, bytes, &mut cursor)?;
    Ok(DatasetValue { dataset_id: dataset.id, fields })
}

fn unmarshal_dataset(
    registry: &Registry,
    dataset: &Dataset,
    bytes: &[u8],
    cursor: &mut usize,
) -> Result<Vec<Field>> {
    let mut fields = Vec::with_capacity(dataset.elements.len());
    for element in &dataset.elements {
        fields.push(unmarshal_element(registry, element, bytes, cursor)?);
    }
    Ok(fields)
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *cursor + len > bytes.len() {
        return Err(Error::Marshalling("declared length exceeds payload"));
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn unmarshal_element(
    registry: &Registry,
    element: &Element,
    bytes: &[u8],
    cursor: &mut usize,
) -> Result<Field> {
    *cursor = align_cursor(*cursor, element.kind.alignment());
    match (element.kind, element.count) {
        (ElementKind::Primitive(p), Count::Fixed(1)) => {
            let slice = take(bytes, cursor, p.size())?;
            Ok(Field::Scalar(Value::read_be(p, slice)))
        }
        (ElementKind::Primitive(p), Count::Fixed(n)) => {
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                *cursor = align_cursor(*cursor, p.alignment());
                let slice = take(bytes, cursor, p.size())?;
                values.push(Value::read_be(p, slice));
            }
            Ok(Field::Array(values))
        }
        (ElementKind::Primitive(p), Count::Dynamic) => {
            let len_bytes = take(bytes, cursor, 4)?;
            let len = BigEndian::read_u32(len_bytes) as usize;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                *cursor = align_cursor(*cursor, p.alignment());
                let slice = take(bytes, cursor, p.size())?;
                values.push(Value::read_be(p, slice));
            }
            Ok(Field::Array(values))
        }
        (ElementKind::Nested(id), Count::Fixed(1)) => {
            let nested_dataset = registry.dataset(id).ok_or(Error::Marshalling("unknown nested dataset"))?;
            let nested_fields = unmarshal_dataset(registry, nested_dataset, bytes, cursor)?;
            Ok(Field::Nested(Box::new(DatasetValue { dataset_id: id, fields: nested_fields })))
        }
        (ElementKind::Nested(id), Count::Fixed(n)) => {
            let nested_dataset = registry.dataset(id).ok_or(Error::Marshalling("unknown nested dataset"))?;
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let nested_fields = unmarshal_dataset(registry, nested_dataset, bytes, cursor)?;
                values.push(DatasetValue { dataset_id: id, fields: nested_fields });
            }
            Ok(Field::NestedArray(values))
        }
        (ElementKind::Nested(id), Count::Dynamic) => {
            let len_bytes = take(bytes, cursor, 4)?;
            let len = BigEndian::read_u32(len_bytes) as usize;
            let nested_dataset = registry.dataset(id).ok_or(Error::Marshalling("unknown nested dataset"))?;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                let nested_fields = unmarshal_dataset(registry, nested_dataset, bytes, cursor)?;
                values.push(DatasetValue { dataset_id: id, fields: nested_fields });
            }
            Ok(Field::NestedArray(values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::registry::Registry;
    use crate::dataset::types::Dataset;

    fn flat_registry() -> Registry {
        let mut registry = Registry::new();
        registry.define(Dataset {
            id: 1,
            elements: vec![
                Element::scalar(ElementKind::Primitive(Primitive::Uint8)),
                Element::scalar(ElementKind::Primitive(Primitive::Uint32)),
                Element { kind: ElementKind::Primitive(Primitive::Char8), count: Count::Dynamic },
            ],
        });
        registry.bind_com_id(1000, 1).unwrap();
        registry
    }

    #[test]
    fn round_trips_flat_dataset_with_dynamic_tail() {
        let registry = flat_registry();
        let value = DatasetValue {
            dataset_id: 1,
            fields: vec![
                Field::Scalar(Value::U8(7)),
                Field::Scalar(Value::U32(0xDEAD_BEEF)),
                Field::Array(vec![Value::Char(b'h'), Value::Char(b'i')]),
            ],
        };
        let mut out = Vec::new();
        marshal(&registry, 1000, &value, &mut out).unwrap();
        let decoded = unmarshal(&registry, 1000, &out).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn aligns_uint32_to_four_bytes() {
        let registry = flat_registry();
        let value = DatasetValue {
            dataset_id: 1,
            fields: vec![
                Field::Scalar(Value::U8(1)),
                Field::Scalar(Value::U32(2)),
                Field::Array(vec![]),
            ],
        };
        let mut out = Vec::new();
        marshal(&registry, 1000, &value, &mut out).unwrap();
        // byte 0: the u8; bytes 1..4: padding; bytes 4..8: the u32.
        assert_eq!(&out[1..4], &[0, 0, 0]);
        assert_eq!(BigEndian::read_u32(&out[4..8]), 2);
    }

    #[test]
    fn nested_dataset_round_trips() {
        let mut registry = Registry::new();
        registry.define(Dataset {
            id: 10,
            elements: vec![Element::scalar(ElementKind::Primitive(Primitive::Uint16))],
        });
        registry.define(Dataset {
            id: 11,
            elements: vec![Element::scalar(ElementKind::Nested(10))],
        });
        registry.bind_com_id(2000, 11).unwrap();
        registry.check_acyclic().unwrap();

        let value = DatasetValue {
            dataset_id: 11,
            fields: vec![Field::Nested(Box::new(DatasetValue {
                dataset_id: 10,
                fields: vec![Field::Scalar(Value::U16(99))],
            }))],
        };
        let mut out = Vec::new();
        marshal(&registry, 2000, &value, &mut out).unwrap();
        let decoded = unmarshal(&registry, 2000, &out).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_truncated_dynamic_array_length() {
        let registry = flat_registry();
        // A length prefix claiming far more elements than remain.
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        assert!(matches!(unmarshal(&registry, 1000, &bytes), Err(Error::Marshalling(_))));
    }

    #[test]
    fn rejects_wrong_value_type_for_element() {
        let registry = flat_registry();
        let value = DatasetValue {
            dataset_id: 1,
            fields: vec![
                Field::Scalar(Value::Bool(true)),
                Field::Scalar(Value::U32(0)),
                Field::Array(vec![]),
            ],
        };
        let mut out = Vec::new();
        assert!(matches!(marshal(&registry, 1000, &value, &mut out), Err(Error::Marshalling(_))));
    }
}
