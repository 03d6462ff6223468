use int_enum::IntEnum;

use crate::error::{EncodeError, EncodeResult};

/// Declared cardinality of a field. The discriminants are the values used by
/// proto field descriptors, so they round-trip through `u8`.
#[derive(IntEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldCount {
    Unknown = 0,
    Single = 1,
    Repeated = 2,
    Packed = 5,
}

/// Declared wire type of a field, numbered as in descriptor.proto.
#[derive(IntEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    UInt64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Object = 11,
    Bytes = 12,
    UInt32 = 13,
    Enum = 14,
    SFixed32 = 15,
    SFixed64 = 16,
    SInt32 = 17,
    SInt64 = 18,
}

impl FieldType {
    /// The low three bits of a field tag for this type.
    pub fn wire_kind(self) -> WireKind {
        match self {
            FieldType::Double | FieldType::Fixed64 | FieldType::SFixed64 => WireKind::Fixed64,
            FieldType::Float | FieldType::Fixed32 | FieldType::SFixed32 => WireKind::Fixed32,
            FieldType::String | FieldType::Bytes | FieldType::Object => {
                WireKind::LengthDelimited
            }
            _ => WireKind::Varint,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            FieldType::Double => "double",
            FieldType::Float => "float",
            FieldType::Int64 => "int64",
            FieldType::UInt64 => "uint64",
            FieldType::Int32 => "int32",
            FieldType::Fixed64 => "fixed64",
            FieldType::Fixed32 => "fixed32",
            FieldType::Bool => "bool",
            FieldType::String => "string",
            FieldType::Object => "object",
            FieldType::Bytes => "bytes",
            FieldType::UInt32 => "uint32",
            FieldType::Enum => "enum",
            FieldType::SFixed32 => "sfixed32",
            FieldType::SFixed64 => "sfixed64",
            FieldType::SInt32 => "sint32",
            FieldType::SInt64 => "sint64",
        }
    }
}

/// Wire-format tag kind, as encoded in the low three bits of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireKind {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

/// An immutable field descriptor: a positive field number plus the declared
/// cardinality and wire type. Built once by the caller; only its effect on
/// the encoded bytes matters, so it is an ordinary struct rather than a
/// packed integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId {
    number: u32,
    count: FieldCount,
    ty: FieldType,
}

impl FieldId {
    pub const fn new(number: u32, count: FieldCount, ty: FieldType) -> FieldId {
        FieldId { number, count, ty }
    }

    pub fn number(self) -> u32 {
        self.number
    }

    pub fn count(self) -> FieldCount {
        self.count
    }

    pub fn ty(self) -> FieldType {
        self.ty
    }

    pub(crate) fn as_single(self) -> FieldId {
        FieldId {
            count: FieldCount::Single,
            ..self
        }
    }
}

/// The snake_case method matching a count/type pair, for diagnostics.
fn method_name(count: FieldCount, ty: FieldType) -> String {
    let prefix = if ty == FieldType::Object {
        "start"
    } else {
        "write"
    };
    let infix = match count {
        FieldCount::Repeated => "_repeated",
        FieldCount::Packed => "_packed",
        FieldCount::Unknown | FieldCount::Single => "",
    };
    format!("{}{}_{}", prefix, infix, ty.name())
}

/// The method(s) a field's declaration permits, for diagnostics.
fn permitted_methods(count: FieldCount, ty: FieldType) -> String {
    match count {
        FieldCount::Unknown => "the generic write dispatch".to_string(),
        FieldCount::Single => method_name(FieldCount::Single, ty),
        FieldCount::Repeated => method_name(FieldCount::Repeated, ty),
        FieldCount::Packed => format!(
            "{} or {}",
            method_name(FieldCount::Packed, ty),
            method_name(FieldCount::Repeated, ty)
        ),
    }
}

/// Validates a field descriptor against the method being called and returns
/// the field number.
///
/// The wire type must match exactly. Cardinality is asymmetric: a
/// packed-declared field additionally accepts the repeated-element call,
/// since packed encoding is a layout choice, not a different shape.
pub(crate) fn check_field(
    field: FieldId,
    count: FieldCount,
    ty: FieldType,
    called: &'static str,
) -> EncodeResult<u32> {
    if field.number == 0 {
        return Err(EncodeError::InvalidFieldNumber);
    }
    let count_ok = field.count == count
        || (field.count == FieldCount::Packed && count == FieldCount::Repeated);
    if field.ty != ty || !count_ok {
        return Err(EncodeError::FieldMismatch {
            number: field.number,
            called,
            expected: permitted_methods(field.count, field.ty),
        });
    }
    Ok(field.number)
}
