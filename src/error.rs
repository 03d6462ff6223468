use std::fmt::Display;

use crate::token::Token;

/// Errors raised by the write path.
///
/// Every variant indicates either a caller bug (wrong method for a field's
/// declared shape, mismatched object nesting) or a corrupted buffer. None of
/// them are recoverable: the writer that produced one must be discarded.
#[derive(Debug)]
pub enum EncodeError {
    /// Field number 0 is not a valid proto field.
    InvalidFieldNumber,
    /// A write method was called whose cardinality or wire type does not
    /// match the field's declaration.
    FieldMismatch {
        number: u32,
        called: &'static str,
        expected: String,
    },
    /// The generic `write` dispatch was given a value whose kind does not
    /// match the field's declared wire type.
    ValueKind {
        number: u32,
        declared: &'static str,
        supplied: &'static str,
    },
    /// An end call arrived with no object open.
    UnmatchedEnd { supplied: Token },
    /// An end call arrived for an object that is not the innermost open one.
    TokenMismatch { expected: Token, supplied: Token },
    /// `end_object` was called for a repeated-object token, or
    /// `end_repeated_object` for a plain one.
    EndKindMismatch {
        supplied: Token,
        repeated_call: bool,
    },
    /// `finish` was called while objects were still open.
    UnterminatedObjects { open: usize, innermost: Token },
    /// The compaction copy primitive was asked to read outside the window it
    /// is allowed to. Never caller-reachable; indicates an internal bug.
    CopyRange {
        src_offset: usize,
        size: usize,
        write_pos: usize,
        readable_size: usize,
    },
    /// A read past the readable portion of the buffer.
    ReadPastEnd { wanted: usize, available: usize },
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFieldNumber => f.write_str("invalid proto field number 0"),
            Self::FieldMismatch {
                number,
                called,
                expected,
            } => f.write_fmt(format_args!(
                "{} called for field {} which should be used with {}",
                called, number, expected
            )),
            Self::ValueKind {
                number,
                declared,
                supplied,
            } => f.write_fmt(format_args!(
                "write called for field {} with a {} value, but the field is declared {}",
                number, supplied, declared
            )),
            Self::UnmatchedEnd { supplied } => f.write_fmt(format_args!(
                "end called with {} but no object is open",
                supplied
            )),
            Self::TokenMismatch { expected, supplied } => f.write_fmt(format_args!(
                "mismatched end call: innermost open object is {} but the supplied token is {}",
                expected, supplied
            )),
            Self::EndKindMismatch {
                supplied,
                repeated_call,
            } => {
                let (called, starter) = if *repeated_call {
                    ("end_repeated_object", "start_object")
                } else {
                    ("end_object", "start_repeated_object")
                };
                f.write_fmt(format_args!(
                    "{} called for {} which was created by {}",
                    called, supplied, starter
                ))
            }
            Self::UnterminatedObjects { open, innermost } => f.write_fmt(format_args!(
                "trying to compact with {} missing calls to end_object; innermost open object is {}",
                open, innermost
            )),
            Self::CopyRange {
                src_offset,
                size,
                write_pos,
                readable_size,
            } => f.write_fmt(format_args!(
                "copy_forward precondition violated: src_offset={} size={} write_pos={} readable_size={}",
                src_offset, size, write_pos, readable_size
            )),
            Self::ReadPastEnd { wanted, available } => f.write_fmt(format_args!(
                "cannot read {} bytes, only {} are readable",
                wanted, available
            )),
        }
    }
}

impl std::error::Error for EncodeError {}

pub type EncodeResult<T> = Result<T, EncodeError>;
