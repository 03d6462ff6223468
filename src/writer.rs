use crate::buffer::{varint_size32, varint_size64, ChunkBuffer};
use crate::error::{EncodeError, EncodeResult};
use crate::field::{check_field, FieldCount, FieldId, FieldType, WireKind};
use crate::token::Token;

/// Bytes reserved for a nested object's length until compaction. The largest
/// minimal varint for a 32-bit length is 5 bytes.
const SIZE_SLOT_LEN: usize = 5;

fn zigzag32(val: i32) -> u32 {
    ((val << 1) ^ (val >> 31)) as u32
}

fn zigzag64(val: i64) -> u64 {
    ((val << 1) ^ (val >> 63)) as u64
}

/// A currently-open nested object.
struct OpenObject {
    token: Token,
    /// Placeholder bytes already saved by completed descendants; subtracted
    /// from the raw content length when this object ends.
    child_shrink: usize,
}

/// A completed length reservation, resolved during the compaction pass.
struct SizeSlot {
    size_pos: usize,
    len: u64,
}

/// A dynamically typed scalar for the generic [`ProtoWriter::write`]
/// dispatch.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Double(f64),
    Float(f32),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Str(&'a str),
    Bytes(&'a [u8]),
}

impl FieldValue<'_> {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Double(_) => "double",
            FieldValue::Float(_) => "float",
            FieldValue::Int32(_) => "int32",
            FieldValue::Int64(_) => "int64",
            FieldValue::UInt32(_) => "uint32",
            FieldValue::UInt64(_) => "uint64",
            FieldValue::Bool(_) => "bool",
            FieldValue::Str(_) => "string",
            FieldValue::Bytes(_) => "bytes",
        }
    }
}

/// Streaming proto wire-format writer.
///
/// Scalar fields are appended directly. Nested objects are written through
/// the token protocol: `start_object` reserves an oversized length slot and
/// returns a [`Token`], child fields are written recursively, and the
/// matching `end_object` records the actual content length. [`finish`]
/// resolves every reservation to its minimal varint in a single in-place
/// forward pass and returns the contiguous result, byte-for-byte identical
/// to a writer that had known every nested length in advance.
///
/// A writer is single-threaded and single-use; `finish` consumes it.
///
/// [`finish`]: ProtoWriter::finish
pub struct ProtoWriter {
    buf: ChunkBuffer,
    depth: u32,
    next_object_id: u32,
    open: Vec<OpenObject>,
    slots: Vec<SizeSlot>,
}

impl ProtoWriter {
    pub fn new() -> ProtoWriter {
        ProtoWriter::with_chunk_size(0)
    }

    /// Creates a writer whose buffer grows in chunks of `chunk_size` bytes;
    /// 0 selects the default.
    pub fn with_chunk_size(chunk_size: usize) -> ProtoWriter {
        ProtoWriter {
            buf: ChunkBuffer::with_chunk_size(chunk_size),
            depth: 0,
            next_object_id: 0,
            open: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn buffer(&self) -> &ChunkBuffer {
        &self.buf
    }

    fn write_tag(&mut self, number: u32, wire: WireKind) {
        self.buf
            .write_varint64(((number as u64) << 3) | wire as u64);
    }

    fn length_delimited(&mut self, number: u32, data: &[u8]) {
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(data.len() as u64);
        self.buf.write_bytes(data);
    }

    // ------------------------------------------------------------------
    // Generic dispatch
    // ------------------------------------------------------------------

    /// Writes `value` according to the field's own declared cardinality and
    /// type. This is the only entry point for `Unknown`-declared fields,
    /// which are written as single. Repeated- and packed-declared fields
    /// get one element per call.
    pub fn write(&mut self, field: FieldId, value: FieldValue<'_>) -> EncodeResult<()> {
        let field = match field.count() {
            FieldCount::Unknown => field.as_single(),
            _ => field,
        };
        let repeated = matches!(field.count(), FieldCount::Repeated | FieldCount::Packed);
        match (field.ty(), value) {
            (FieldType::Double, FieldValue::Double(v)) => {
                if repeated {
                    self.write_repeated_double(field, v)
                } else {
                    self.write_double(field, v)
                }
            }
            (FieldType::Float, FieldValue::Float(v)) => {
                if repeated {
                    self.write_repeated_float(field, v)
                } else {
                    self.write_float(field, v)
                }
            }
            (FieldType::Int32, FieldValue::Int32(v)) => {
                if repeated {
                    self.write_repeated_int32(field, v)
                } else {
                    self.write_int32(field, v)
                }
            }
            (FieldType::Int64, FieldValue::Int64(v)) => {
                if repeated {
                    self.write_repeated_int64(field, v)
                } else {
                    self.write_int64(field, v)
                }
            }
            (FieldType::UInt32, FieldValue::UInt32(v)) => {
                if repeated {
                    self.write_repeated_uint32(field, v)
                } else {
                    self.write_uint32(field, v)
                }
            }
            (FieldType::UInt64, FieldValue::UInt64(v)) => {
                if repeated {
                    self.write_repeated_uint64(field, v)
                } else {
                    self.write_uint64(field, v)
                }
            }
            (FieldType::SInt32, FieldValue::Int32(v)) => {
                if repeated {
                    self.write_repeated_sint32(field, v)
                } else {
                    self.write_sint32(field, v)
                }
            }
            (FieldType::SInt64, FieldValue::Int64(v)) => {
                if repeated {
                    self.write_repeated_sint64(field, v)
                } else {
                    self.write_sint64(field, v)
                }
            }
            (FieldType::Fixed32, FieldValue::UInt32(v)) => {
                if repeated {
                    self.write_repeated_fixed32(field, v)
                } else {
                    self.write_fixed32(field, v)
                }
            }
            (FieldType::Fixed64, FieldValue::UInt64(v)) => {
                if repeated {
                    self.write_repeated_fixed64(field, v)
                } else {
                    self.write_fixed64(field, v)
                }
            }
            (FieldType::SFixed32, FieldValue::Int32(v)) => {
                if repeated {
                    self.write_repeated_sfixed32(field, v)
                } else {
                    self.write_sfixed32(field, v)
                }
            }
            (FieldType::SFixed64, FieldValue::Int64(v)) => {
                if repeated {
                    self.write_repeated_sfixed64(field, v)
                } else {
                    self.write_sfixed64(field, v)
                }
            }
            (FieldType::Bool, FieldValue::Bool(v)) => {
                if repeated {
                    self.write_repeated_bool(field, v)
                } else {
                    self.write_bool(field, v)
                }
            }
            (FieldType::Enum, FieldValue::Int32(v)) => {
                if repeated {
                    self.write_repeated_enum(field, v)
                } else {
                    self.write_enum(field, v)
                }
            }
            (FieldType::String, FieldValue::Str(v)) => {
                if repeated {
                    self.write_repeated_string(field, v)
                } else {
                    self.write_string(field, v)
                }
            }
            (FieldType::Bytes, FieldValue::Bytes(v)) => {
                if repeated {
                    self.write_repeated_bytes(field, v)
                } else {
                    self.write_bytes(field, v)
                }
            }
            (FieldType::Object, FieldValue::Bytes(v)) => {
                if repeated {
                    self.write_repeated_object(field, v)
                } else {
                    self.write_object(field, v)
                }
            }
            (ty, value) => Err(EncodeError::ValueKind {
                number: field.number(),
                declared: ty.name(),
                supplied: value.kind(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // double / float
    // ------------------------------------------------------------------

    pub fn write_double(&mut self, field: FieldId, val: f64) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Double, "write_double")?;
        if val != 0.0 {
            self.write_tag(number, WireKind::Fixed64);
            self.buf.write_fixed64(val.to_bits());
        }
        Ok(())
    }

    pub fn write_repeated_double(&mut self, field: FieldId, val: f64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Double,
            "write_repeated_double",
        )?;
        self.write_tag(number, WireKind::Fixed64);
        self.buf.write_fixed64(val.to_bits());
        Ok(())
    }

    pub fn write_packed_double(&mut self, field: FieldId, vals: &[f64]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Double,
            "write_packed_double",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64((vals.len() * 8) as u64);
        for val in vals {
            self.buf.write_fixed64(val.to_bits());
        }
        Ok(())
    }

    pub fn write_float(&mut self, field: FieldId, val: f32) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Float, "write_float")?;
        if val != 0.0 {
            self.write_tag(number, WireKind::Fixed32);
            self.buf.write_fixed32(val.to_bits());
        }
        Ok(())
    }

    pub fn write_repeated_float(&mut self, field: FieldId, val: f32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Float,
            "write_repeated_float",
        )?;
        self.write_tag(number, WireKind::Fixed32);
        self.buf.write_fixed32(val.to_bits());
        Ok(())
    }

    pub fn write_packed_float(&mut self, field: FieldId, vals: &[f32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Float,
            "write_packed_float",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64((vals.len() * 4) as u64);
        for val in vals {
            self.buf.write_fixed32(val.to_bits());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // int32 / int64 / enum
    // ------------------------------------------------------------------

    pub fn write_int32(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Int32, "write_int32")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint32(val);
        }
        Ok(())
    }

    pub fn write_repeated_int32(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Int32,
            "write_repeated_int32",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint32(val);
        Ok(())
    }

    pub fn write_packed_int32(&mut self, field: FieldId, vals: &[i32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Int32,
            "write_packed_int32",
        )?;
        // negative elements sign-extend, so they must be sized as 64-bit
        let size: usize = vals.iter().map(|v| varint_size64(*v as i64 as u64)).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint32(*val);
        }
        Ok(())
    }

    pub fn write_int64(&mut self, field: FieldId, val: i64) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Int64, "write_int64")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint64(val as u64);
        }
        Ok(())
    }

    pub fn write_repeated_int64(&mut self, field: FieldId, val: i64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Int64,
            "write_repeated_int64",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint64(val as u64);
        Ok(())
    }

    pub fn write_packed_int64(&mut self, field: FieldId, vals: &[i64]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Int64,
            "write_packed_int64",
        )?;
        let size: usize = vals.iter().map(|v| varint_size64(*v as u64)).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint64(*val as u64);
        }
        Ok(())
    }

    pub fn write_enum(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Enum, "write_enum")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint32(val);
        }
        Ok(())
    }

    pub fn write_repeated_enum(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Enum,
            "write_repeated_enum",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint32(val);
        Ok(())
    }

    pub fn write_packed_enum(&mut self, field: FieldId, vals: &[i32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Enum,
            "write_packed_enum",
        )?;
        let size: usize = vals.iter().map(|v| varint_size64(*v as i64 as u64)).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint32(*val);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // uint32 / uint64
    // ------------------------------------------------------------------

    pub fn write_uint32(&mut self, field: FieldId, val: u32) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::UInt32, "write_uint32")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint64(val as u64);
        }
        Ok(())
    }

    pub fn write_repeated_uint32(&mut self, field: FieldId, val: u32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::UInt32,
            "write_repeated_uint32",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint64(val as u64);
        Ok(())
    }

    pub fn write_packed_uint32(&mut self, field: FieldId, vals: &[u32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::UInt32,
            "write_packed_uint32",
        )?;
        let size: usize = vals.iter().map(|v| varint_size32(*v)).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint64(*val as u64);
        }
        Ok(())
    }

    pub fn write_uint64(&mut self, field: FieldId, val: u64) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::UInt64, "write_uint64")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint64(val);
        }
        Ok(())
    }

    pub fn write_repeated_uint64(&mut self, field: FieldId, val: u64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::UInt64,
            "write_repeated_uint64",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint64(val);
        Ok(())
    }

    pub fn write_packed_uint64(&mut self, field: FieldId, vals: &[u64]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::UInt64,
            "write_packed_uint64",
        )?;
        let size: usize = vals.iter().map(|v| varint_size64(*v)).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint64(*val);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sint32 / sint64
    // ------------------------------------------------------------------

    pub fn write_sint32(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::SInt32, "write_sint32")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint64(zigzag32(val) as u64);
        }
        Ok(())
    }

    pub fn write_repeated_sint32(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::SInt32,
            "write_repeated_sint32",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint64(zigzag32(val) as u64);
        Ok(())
    }

    pub fn write_packed_sint32(&mut self, field: FieldId, vals: &[i32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::SInt32,
            "write_packed_sint32",
        )?;
        let size: usize = vals.iter().map(|v| varint_size32(zigzag32(*v))).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint64(zigzag32(*val) as u64);
        }
        Ok(())
    }

    pub fn write_sint64(&mut self, field: FieldId, val: i64) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::SInt64, "write_sint64")?;
        if val != 0 {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_varint64(zigzag64(val));
        }
        Ok(())
    }

    pub fn write_repeated_sint64(&mut self, field: FieldId, val: i64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::SInt64,
            "write_repeated_sint64",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_varint64(zigzag64(val));
        Ok(())
    }

    pub fn write_packed_sint64(&mut self, field: FieldId, vals: &[i64]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::SInt64,
            "write_packed_sint64",
        )?;
        let size: usize = vals.iter().map(|v| varint_size64(zigzag64(*v))).sum();
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(size as u64);
        for val in vals {
            self.buf.write_varint64(zigzag64(*val));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // fixed32 / fixed64 / sfixed32 / sfixed64
    // ------------------------------------------------------------------

    pub fn write_fixed32(&mut self, field: FieldId, val: u32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Single,
            FieldType::Fixed32,
            "write_fixed32",
        )?;
        if val != 0 {
            self.write_tag(number, WireKind::Fixed32);
            self.buf.write_fixed32(val);
        }
        Ok(())
    }

    pub fn write_repeated_fixed32(&mut self, field: FieldId, val: u32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Fixed32,
            "write_repeated_fixed32",
        )?;
        self.write_tag(number, WireKind::Fixed32);
        self.buf.write_fixed32(val);
        Ok(())
    }

    pub fn write_packed_fixed32(&mut self, field: FieldId, vals: &[u32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Fixed32,
            "write_packed_fixed32",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64((vals.len() * 4) as u64);
        for val in vals {
            self.buf.write_fixed32(*val);
        }
        Ok(())
    }

    pub fn write_fixed64(&mut self, field: FieldId, val: u64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Single,
            FieldType::Fixed64,
            "write_fixed64",
        )?;
        if val != 0 {
            self.write_tag(number, WireKind::Fixed64);
            self.buf.write_fixed64(val);
        }
        Ok(())
    }

    pub fn write_repeated_fixed64(&mut self, field: FieldId, val: u64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Fixed64,
            "write_repeated_fixed64",
        )?;
        self.write_tag(number, WireKind::Fixed64);
        self.buf.write_fixed64(val);
        Ok(())
    }

    pub fn write_packed_fixed64(&mut self, field: FieldId, vals: &[u64]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Fixed64,
            "write_packed_fixed64",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64((vals.len() * 8) as u64);
        for val in vals {
            self.buf.write_fixed64(*val);
        }
        Ok(())
    }

    pub fn write_sfixed32(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Single,
            FieldType::SFixed32,
            "write_sfixed32",
        )?;
        if val != 0 {
            self.write_tag(number, WireKind::Fixed32);
            self.buf.write_fixed32(val as u32);
        }
        Ok(())
    }

    pub fn write_repeated_sfixed32(&mut self, field: FieldId, val: i32) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::SFixed32,
            "write_repeated_sfixed32",
        )?;
        self.write_tag(number, WireKind::Fixed32);
        self.buf.write_fixed32(val as u32);
        Ok(())
    }

    pub fn write_packed_sfixed32(&mut self, field: FieldId, vals: &[i32]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::SFixed32,
            "write_packed_sfixed32",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64((vals.len() * 4) as u64);
        for val in vals {
            self.buf.write_fixed32(*val as u32);
        }
        Ok(())
    }

    pub fn write_sfixed64(&mut self, field: FieldId, val: i64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Single,
            FieldType::SFixed64,
            "write_sfixed64",
        )?;
        if val != 0 {
            self.write_tag(number, WireKind::Fixed64);
            self.buf.write_fixed64(val as u64);
        }
        Ok(())
    }

    pub fn write_repeated_sfixed64(&mut self, field: FieldId, val: i64) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::SFixed64,
            "write_repeated_sfixed64",
        )?;
        self.write_tag(number, WireKind::Fixed64);
        self.buf.write_fixed64(val as u64);
        Ok(())
    }

    pub fn write_packed_sfixed64(&mut self, field: FieldId, vals: &[i64]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::SFixed64,
            "write_packed_sfixed64",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64((vals.len() * 8) as u64);
        for val in vals {
            self.buf.write_fixed64(*val as u64);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // bool
    // ------------------------------------------------------------------

    pub fn write_bool(&mut self, field: FieldId, val: bool) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Bool, "write_bool")?;
        if val {
            self.write_tag(number, WireKind::Varint);
            self.buf.write_byte(1);
        }
        Ok(())
    }

    pub fn write_repeated_bool(&mut self, field: FieldId, val: bool) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Bool,
            "write_repeated_bool",
        )?;
        self.write_tag(number, WireKind::Varint);
        self.buf.write_byte(val as u8);
        Ok(())
    }

    pub fn write_packed_bool(&mut self, field: FieldId, vals: &[bool]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Packed,
            FieldType::Bool,
            "write_packed_bool",
        )?;
        self.write_tag(number, WireKind::LengthDelimited);
        self.buf.write_varint64(vals.len() as u64);
        for val in vals {
            self.buf.write_byte(*val as u8);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // string / bytes
    // ------------------------------------------------------------------

    pub fn write_string(&mut self, field: FieldId, val: &str) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::String, "write_string")?;
        if !val.is_empty() {
            self.length_delimited(number, val.as_bytes());
        }
        Ok(())
    }

    pub fn write_repeated_string(&mut self, field: FieldId, val: &str) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::String,
            "write_repeated_string",
        )?;
        self.length_delimited(number, val.as_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, field: FieldId, val: &[u8]) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Bytes, "write_bytes")?;
        if !val.is_empty() {
            self.length_delimited(number, val);
        }
        Ok(())
    }

    pub fn write_repeated_bytes(&mut self, field: FieldId, val: &[u8]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Bytes,
            "write_repeated_bytes",
        )?;
        self.length_delimited(number, val);
        Ok(())
    }

    // ------------------------------------------------------------------
    // pre-encoded objects
    // ------------------------------------------------------------------

    /// Embeds an already-serialized sub-message verbatim, bypassing the token
    /// machinery. An empty value is the default and writes nothing.
    pub fn write_object(&mut self, field: FieldId, val: &[u8]) -> EncodeResult<()> {
        let number = check_field(field, FieldCount::Single, FieldType::Object, "write_object")?;
        if !val.is_empty() {
            self.length_delimited(number, val);
        }
        Ok(())
    }

    /// Embeds an already-serialized sub-message as a repeated element; an
    /// empty value still writes its header.
    pub fn write_repeated_object(&mut self, field: FieldId, val: &[u8]) -> EncodeResult<()> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Object,
            "write_repeated_object",
        )?;
        self.length_delimited(number, val);
        Ok(())
    }

    // ------------------------------------------------------------------
    // nested objects
    // ------------------------------------------------------------------

    /// Opens a nested object: writes the field tag, reserves an oversized
    /// length slot, and returns the token the matching [`end_object`] call
    /// must present.
    ///
    /// [`end_object`]: ProtoWriter::end_object
    pub fn start_object(&mut self, field: FieldId) -> EncodeResult<Token> {
        let number = check_field(field, FieldCount::Single, FieldType::Object, "start_object")?;
        Ok(self.start_object_impl(number, false))
    }

    pub fn start_repeated_object(&mut self, field: FieldId) -> EncodeResult<Token> {
        let number = check_field(
            field,
            FieldCount::Repeated,
            FieldType::Object,
            "start_repeated_object",
        )?;
        Ok(self.start_object_impl(number, true))
    }

    fn start_object_impl(&mut self, number: u32, repeated: bool) -> Token {
        let tag = ((number as u64) << 3) | WireKind::LengthDelimited as u64;
        self.buf.write_varint64(tag);
        let size_pos = self.buf.write_pos();
        for _ in 0..SIZE_SLOT_LEN {
            self.buf.write_byte(0);
        }
        self.depth += 1;
        self.next_object_id += 1;
        let token = Token::pack(
            varint_size64(tag),
            repeated,
            self.depth,
            self.next_object_id,
            size_pos,
        );
        self.open.push(OpenObject {
            token,
            child_shrink: 0,
        });
        token
    }

    /// Closes the innermost open object. An empty non-repeated object is
    /// retracted entirely, tag included.
    pub fn end_object(&mut self, token: Token) -> EncodeResult<()> {
        self.end_object_impl(token, false)
    }

    /// Closes the innermost open repeated object. Empty repeated objects
    /// keep their tag and record a length of zero.
    pub fn end_repeated_object(&mut self, token: Token) -> EncodeResult<()> {
        self.end_object_impl(token, true)
    }

    fn end_object_impl(&mut self, token: Token, repeated: bool) -> EncodeResult<()> {
        let entry = match self.open.pop() {
            Some(entry) => entry,
            None => return Err(EncodeError::UnmatchedEnd { supplied: token }),
        };
        if entry.token != token {
            let expected = entry.token;
            self.open.push(entry);
            return Err(EncodeError::TokenMismatch {
                expected,
                supplied: token,
            });
        }
        if token.repeated() != repeated {
            self.open.push(entry);
            return Err(EncodeError::EndKindMismatch {
                supplied: token,
                repeated_call: repeated,
            });
        }

        let size_pos = token.size_pos();
        let raw_len = self.buf.write_pos() - size_pos - SIZE_SLOT_LEN;
        self.depth -= 1;
        if raw_len == 0 && !repeated {
            // nothing was written inside; retract the tag and length slot
            self.buf.rewind_write_to(size_pos - token.tag_size());
        } else {
            // raw_len still counts descendants' oversized slots; what their
            // minimal varints will save has accumulated in child_shrink
            let len = (raw_len - entry.child_shrink) as u64;
            let shrink = entry.child_shrink + (SIZE_SLOT_LEN - varint_size64(len));
            self.slots.push(SizeSlot { size_pos, len });
            if let Some(parent) = self.open.last_mut() {
                parent.child_shrink += shrink;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // finalization
    // ------------------------------------------------------------------

    /// Compacts every reserved length slot to its minimal varint in a single
    /// forward pass and returns the finished wire-format bytes. Consuming
    /// the writer makes the destructive rewrite a terminal operation.
    pub fn finish(mut self) -> EncodeResult<Vec<u8>> {
        if let Some(top) = self.open.last() {
            return Err(EncodeError::UnterminatedObjects {
                open: self.open.len(),
                innermost: top.token,
            });
        }
        // slots were recorded in end-call order; the pass walks by position
        self.slots.sort_by_key(|slot| slot.size_pos);
        self.buf.start_compaction();
        let readable = self.buf.readable_size().unwrap_or(0);
        let mut src = 0;
        for slot in &self.slots {
            self.buf.copy_forward(src, slot.size_pos - src)?;
            self.buf.write_varint64(slot.len);
            src = slot.size_pos + SIZE_SLOT_LEN;
        }
        self.buf.copy_forward(src, readable - src)?;
        let total = self.buf.write_pos();
        self.buf.start_compaction();
        self.buf.read_slice(total)
    }
}

impl Default for ProtoWriter {
    fn default() -> ProtoWriter {
        ProtoWriter::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn single(number: u32, ty: FieldType) -> FieldId {
        FieldId::new(number, FieldCount::Single, ty)
    }

    fn repeated(number: u32, ty: FieldType) -> FieldId {
        FieldId::new(number, FieldCount::Repeated, ty)
    }

    fn packed(number: u32, ty: FieldType) -> FieldId {
        FieldId::new(number, FieldCount::Packed, ty)
    }

    /// Runs the same write sequence at several chunk sizes, including the
    /// degenerate 1-byte chunks, and asserts the outputs agree.
    fn encode_with<F: Fn(&mut ProtoWriter)>(f: F) -> Vec<u8> {
        let mut out: Option<Vec<u8>> = None;
        for chunk_size in [0, 1, 5] {
            let mut writer = ProtoWriter::with_chunk_size(chunk_size);
            f(&mut writer);
            let bytes = writer.finish().expect("finish");
            if let Some(prev) = &out {
                assert_eq!(prev, &bytes, "output differs for chunk size {}", chunk_size);
            }
            out = Some(bytes);
        }
        out.unwrap()
    }

    #[test]
    fn test_object_one_char() {
        let bytes = encode_with(|w| {
            let token = w.start_object(single(1, FieldType::Object)).unwrap();
            w.write_uint32(single(2, FieldType::UInt32), 'b' as u32).unwrap();
            w.end_object(token).unwrap();
        });
        assert_eq!(bytes, vec![0x0a, 0x02, 0x10, 0x62]);
    }

    #[test]
    fn test_object_one_large_char() {
        let bytes = encode_with(|w| {
            let token = w.start_object(single(1, FieldType::Object)).unwrap();
            w.write_uint32(single(5000, FieldType::UInt32), 0x3110).unwrap();
            w.end_object(token).unwrap();
        });
        assert_eq!(bytes, vec![0x0a, 0x05, 0xc0, 0xb8, 0x02, 0x90, 0x62]);
    }

    #[test]
    fn test_object_and_two_chars() {
        let bytes = encode_with(|w| {
            w.write_uint32(single(1, FieldType::UInt32), 'a' as u32).unwrap();
            let token = w.start_object(single(2, FieldType::Object)).unwrap();
            w.write_uint32(single(3, FieldType::UInt32), 'b' as u32).unwrap();
            w.end_object(token).unwrap();
            w.write_uint32(single(4, FieldType::UInt32), 'c' as u32).unwrap();
        });
        assert_eq!(
            bytes,
            vec![0x08, 0x61, 0x12, 0x02, 0x18, 0x62, 0x20, 0x63]
        );
    }

    #[test]
    fn test_empty_object() {
        let bytes = encode_with(|w| {
            let token = w.start_object(single(1, FieldType::Object)).unwrap();
            w.end_object(token).unwrap();
        });
        assert_eq!(bytes, Vec::<u8>::new());
    }

    #[test]
    fn test_deep_empty_objects() {
        let bytes = encode_with(|w| {
            let token1 = w.start_object(single(1, FieldType::Object)).unwrap();
            let token2 = w.start_object(single(2, FieldType::Object)).unwrap();
            let token3 = w.start_object(single(3, FieldType::Object)).unwrap();
            w.end_object(token3).unwrap();
            w.end_object(token2).unwrap();
            w.end_object(token1).unwrap();
        });
        assert_eq!(bytes, Vec::<u8>::new());
    }

    #[test]
    fn test_empty_object_between_fields() {
        let bytes = encode_with(|w| {
            w.write_uint32(single(1, FieldType::UInt32), 'a' as u32).unwrap();
            let token = w.start_object(single(2, FieldType::Object)).unwrap();
            w.end_object(token).unwrap();
            w.write_uint32(single(4, FieldType::UInt32), 'c' as u32).unwrap();
        });
        assert_eq!(bytes, vec![0x08, 0x61, 0x20, 0x63]);
    }

    #[test]
    fn test_empty_repeated_object() {
        let bytes = encode_with(|w| {
            let token = w
                .start_repeated_object(repeated(1, FieldType::Object))
                .unwrap();
            w.end_repeated_object(token).unwrap();
            let token = w
                .start_repeated_object(repeated(1, FieldType::Object))
                .unwrap();
            w.end_repeated_object(token).unwrap();
        });
        assert_eq!(bytes, vec![0x0a, 0x00, 0x0a, 0x00]);
    }

    #[test]
    fn test_complex_object() {
        let bytes = encode_with(|w| {
            w.write_uint32(single(1, FieldType::UInt32), 'x' as u32).unwrap();
            let token = w.start_object(single(2, FieldType::Object)).unwrap();
            w.write_uint32(single(3, FieldType::UInt32), 'y' as u32).unwrap();
            w.write_string(single(4, FieldType::String), "abcdefghijkl")
                .unwrap();
            let empty = w.start_object(single(500, FieldType::Object)).unwrap();
            w.end_object(empty).unwrap();
            w.end_object(token).unwrap();
            w.write_uint32(single(5, FieldType::UInt32), 'z' as u32).unwrap();
        });
        assert_eq!(
            bytes,
            vec![
                0x08, 0x78, // 1 -> 'x'
                0x12, 0x10, // begin object 2
                0x18, 0x79, // 3 -> 'y'
                0x22, 0x0c, // 4 -> "abcdefghijkl"
                0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x6b, 0x6c,
                0x28, 0x7a, // 5 -> 'z'
            ]
        );
    }

    #[test]
    fn test_deep_objects() {
        let bytes = encode_with(|w| {
            let token1 = w.start_object(single(1, FieldType::Object)).unwrap();
            w.write_uint32(single(2, FieldType::UInt32), 'a' as u32).unwrap();
            let token2 = w.start_object(single(3, FieldType::Object)).unwrap();
            w.write_uint32(single(4, FieldType::UInt32), 'b' as u32).unwrap();
            let token3 = w.start_object(single(5, FieldType::Object)).unwrap();
            w.write_uint32(single(6, FieldType::UInt32), 'c' as u32).unwrap();
            w.end_object(token3).unwrap();
            w.end_object(token2).unwrap();
            w.end_object(token1).unwrap();
        });
        assert_eq!(
            bytes,
            vec![
                0x0a, 0x0a, 0x10, 0x61, 0x1a, 0x06, 0x20, 0x62, 0x2a, 0x02, 0x30, 0x63
            ]
        );
    }

    #[test]
    fn test_sint32_zigzag_bytes() {
        let bytes = encode_with(|w| {
            w.write_sint32(single(1, FieldType::SInt32), -1).unwrap();
        });
        assert_eq!(bytes, vec![0x08, 0x01]);

        let bytes = encode_with(|w| {
            w.write_sint32(single(1, FieldType::SInt32), 1).unwrap();
        });
        assert_eq!(bytes, vec![0x08, 0x02]);
    }

    #[test]
    fn test_negative_int32_is_ten_bytes() {
        let bytes = encode_with(|w| {
            w.write_int32(single(1, FieldType::Int32), -1).unwrap();
        });
        assert_eq!(
            bytes,
            vec![0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]
        );
    }

    #[test]
    fn test_packed_empty_arrays_keep_header() {
        let bytes = encode_with(|w| {
            w.write_packed_int32(packed(1000, FieldType::Int32), &[]).unwrap();
            w.write_packed_int32(packed(1001, FieldType::Int32), &[]).unwrap();
        });
        assert_eq!(bytes, vec![0xc2, 0x3e, 0x00, 0xca, 0x3e, 0x00]);
    }

    #[test]
    fn test_default_omission() {
        let bytes = encode_with(|w| {
            w.write_int32(single(1, FieldType::Int32), 0).unwrap();
            w.write_uint64(single(2, FieldType::UInt64), 0).unwrap();
            w.write_bool(single(3, FieldType::Bool), false).unwrap();
            w.write_double(single(4, FieldType::Double), -0.0).unwrap();
            w.write_string(single(5, FieldType::String), "").unwrap();
            w.write_bytes(single(6, FieldType::Bytes), &[]).unwrap();
            w.write_object(single(7, FieldType::Object), &[]).unwrap();
        });
        assert_eq!(bytes, Vec::<u8>::new());
    }

    #[test]
    fn test_repeated_never_omits_defaults() {
        let bytes = encode_with(|w| {
            w.write_repeated_int32(repeated(1, FieldType::Int32), 0).unwrap();
            w.write_repeated_string(repeated(2, FieldType::String), "").unwrap();
            w.write_repeated_object(repeated(3, FieldType::Object), &[]).unwrap();
        });
        assert_eq!(bytes, vec![0x08, 0x00, 0x12, 0x00, 0x1a, 0x00]);
    }

    #[test]
    fn test_nan_and_infinity_are_written() {
        let bytes = encode_with(|w| {
            w.write_double(single(1, FieldType::Double), f64::NEG_INFINITY)
                .unwrap();
            w.write_float(single(2, FieldType::Float), f32::NAN).unwrap();
        });
        assert_eq!(bytes[0], 0x09);
        assert_eq!(
            bytes[1..9],
            f64::NEG_INFINITY.to_bits().to_le_bytes()
        );
        assert_eq!(bytes[9], 0x15);
        let nan_bits = u32::from_le_bytes(bytes[10..14].try_into().unwrap());
        assert!(f32::from_bits(nan_bits).is_nan());
    }

    #[test]
    fn test_repeated_write_on_packed_field() {
        // a packed-declared field accepts element-at-a-time repeated writes
        let bytes = encode_with(|w| {
            w.write_repeated_uint32(packed(1, FieldType::UInt32), 1).unwrap();
            w.write_repeated_uint32(packed(1, FieldType::UInt32), 2).unwrap();
        });
        assert_eq!(bytes, vec![0x08, 0x01, 0x08, 0x02]);
    }

    #[test]
    fn test_pre_encoded_object_embedding() {
        let inner = encode_with(|w| {
            w.write_uint32(single(2, FieldType::UInt32), 'b' as u32).unwrap();
        });
        let bytes = encode_with(|w| {
            w.write_object(single(1, FieldType::Object), &inner).unwrap();
        });
        assert_eq!(bytes, vec![0x0a, 0x02, 0x10, 0x62]);
    }

    #[test]
    fn test_end_object_twice_fails() {
        let mut w = ProtoWriter::new();
        let token1 = w.start_object(single(1, FieldType::Object)).unwrap();
        w.write_uint32(single(2, FieldType::UInt32), 'a' as u32).unwrap();
        let token2 = w.start_object(single(3, FieldType::Object)).unwrap();
        w.write_uint32(single(4, FieldType::UInt32), 'b' as u32).unwrap();
        w.end_object(token2).unwrap();
        let err = w.end_object(token2).unwrap_err();
        assert!(matches!(err, EncodeError::TokenMismatch { .. }));
        // the message decodes both tokens
        let msg = err.to_string();
        assert!(msg.contains(&token1.to_string()), "message: {}", msg);
        assert!(msg.contains(&token2.to_string()), "message: {}", msg);
    }

    #[test]
    fn test_crossed_end_calls_fail() {
        let mut w = ProtoWriter::new();
        let token1 = w.start_object(single(1, FieldType::Object)).unwrap();
        let _token2 = w.start_object(single(2, FieldType::Object)).unwrap();
        assert!(matches!(
            w.end_object(token1),
            Err(EncodeError::TokenMismatch { .. })
        ));
    }

    #[test]
    fn test_end_kind_mismatch() {
        let mut w = ProtoWriter::new();
        let token = w
            .start_repeated_object(repeated(1, FieldType::Object))
            .unwrap();
        assert!(matches!(
            w.end_object(token),
            Err(EncodeError::EndKindMismatch { .. })
        ));
        // the writer is still consistent enough to report the right message
        let mut w = ProtoWriter::new();
        let token = w.start_object(single(1, FieldType::Object)).unwrap();
        let err = w.end_repeated_object(token).unwrap_err();
        assert!(err.to_string().contains("start_object"));
    }

    #[test]
    fn test_end_without_start_fails() {
        let mut w = ProtoWriter::new();
        let token = w.start_object(single(1, FieldType::Object)).unwrap();
        w.end_object(token).unwrap();
        assert!(matches!(
            w.end_object(token),
            Err(EncodeError::UnmatchedEnd { .. })
        ));
    }

    #[test]
    fn test_finish_with_open_object_fails() {
        for empty in [true, false] {
            let mut w = ProtoWriter::new();
            let _token = w.start_object(single(1, FieldType::Object)).unwrap();
            if !empty {
                w.write_uint32(single(2, FieldType::UInt32), 'a' as u32).unwrap();
            }
            assert!(matches!(
                w.finish(),
                Err(EncodeError::UnterminatedObjects { open: 1, .. })
            ));
        }
    }

    #[test]
    fn test_object_ids_are_unique_per_writer() {
        let mut w = ProtoWriter::new();
        let token1 = w.start_object(single(1, FieldType::Object)).unwrap();
        w.end_object(token1).unwrap();
        let token2 = w.start_object(single(1, FieldType::Object)).unwrap();
        assert_ne!(token1.object_id(), token2.object_id());
        // same depth, stale id: ending with the first token must fail
        assert!(matches!(
            w.end_object(token1),
            Err(EncodeError::TokenMismatch { .. })
        ));
        w.end_object(token2).unwrap();
    }

    #[test]
    fn test_sibling_objects_after_nested() {
        // exercises the slot side table being recorded out of position order
        let bytes = encode_with(|w| {
            let outer = w.start_object(single(1, FieldType::Object)).unwrap();
            let inner = w.start_object(single(2, FieldType::Object)).unwrap();
            w.write_uint32(single(3, FieldType::UInt32), 1).unwrap();
            w.end_object(inner).unwrap();
            w.end_object(outer).unwrap();
            let second = w.start_object(single(4, FieldType::Object)).unwrap();
            w.write_uint32(single(5, FieldType::UInt32), 2).unwrap();
            w.end_object(second).unwrap();
        });
        assert_eq!(
            bytes,
            vec![
                0x0a, 0x04, 0x12, 0x02, 0x18, 0x01, // 1 { 2 { 3: 1 } }
                0x22, 0x02, 0x28, 0x02, // 4 { 5: 2 }
            ]
        );
    }

    #[test]
    fn test_large_object_spanning_many_chunks() {
        let payload = "x".repeat(300);
        let bytes = encode_with(|w| {
            let token = w.start_object(single(1, FieldType::Object)).unwrap();
            w.write_string(single(2, FieldType::String), &payload).unwrap();
            w.end_object(token).unwrap();
        });
        // tag + 2-byte length, then tag + 2-byte length + 300 bytes
        assert_eq!(bytes.len(), 3 + 3 + 300);
        assert_eq!(&bytes[..6], &[0x0a, 0xaf, 0x02, 0x12, 0xac, 0x02]);
        assert!(bytes[6..].iter().all(|b| *b == b'x'));
    }
}
