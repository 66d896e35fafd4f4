// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Primitive element types and dataset descriptors (spec.md §4.8).

/// A dataset's numeric identity, distinct from the comId that names it on
/// the wire — several comIds may share one dataset.
pub type DatasetId = u32;

/// Primitive wire types. Names match the IEC 61375-2-3 dataset vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool8,
    Char8,
    Utf16,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Real32,
    Real64,
    TimeDate32,
    TimeDate48,
    TimeDate64,
}

impl Primitive {
    /// Size in bytes of one element, on the wire.
    pub const fn size(self) -> usize {
        match self {
            Primitive::Bool8 | Primitive::Char8 | Primitive::Int8 | Primitive::Uint8 => 1,
            Primitive::Utf16 | Primitive::Int16 | Primitive::Uint16 => 2,
            Primitive::Int32
            | Primitive::Uint32
            | Primitive::Real32
            | Primitive::TimeDate32 => 4,
            Primitive::TimeDate48 => 6,
            Primitive::Int64
            | Primitive::Uint64
            | Primitive::Real64
            | Primitive::TimeDate64 => 8,
        }
    }

    /// Natural alignment on the wire: every primitive aligns to its own
    /// size, except `TimeDate48` which aligns to 4 (its first 32-bit
    /// seconds field).
    pub const fn alignment(self) -> usize {
        match self {
            Primitive::TimeDate48 => 4,
            other => other.size(),
        }
    }
}

/// How many elements an array element carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    /// Fixed-size array of `n` elements (`n >= 2`), or a single scalar
    /// when `n == 1`.
    Fixed(u32),
    /// Dynamic, length-prefixed array (`count == 0` in spec.md's encoding).
    Dynamic,
}

/// One element in a dataset's ordered element list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Primitive(Primitive),
    /// A reference to another dataset by id, expanded recursively at
    /// marshal time.
    Nested(DatasetId),
}

impl ElementKind {
    /// Alignment a nested dataset contributes is 4 bytes per spec.md §4.8
    /// ("nested datasets align to 4 bytes"); primitives use their own.
    pub fn alignment(self) -> usize {
        match self {
            ElementKind::Primitive(p) => p.alignment(),
            ElementKind::Nested(_) => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub kind: ElementKind,
    pub count: Count,
}

impl Element {
    pub fn scalar(kind: ElementKind) -> Self {
        Element { kind, count: Count::Fixed(1) }
    }
}

/// An ordered element list identified by [`DatasetId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: DatasetId,
    pub elements: Vec<Element>,
}
