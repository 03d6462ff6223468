//! Streaming protobuf wire-format encoder.
//!
//! [`ProtoWriter`] appends fields to a chunked buffer in a single forward
//! pass. Nested messages never require pre-computing their serialized size:
//! `start_object` reserves an oversized length slot and hands back a
//! [`Token`], and once every object is ended, [`ProtoWriter::finish`]
//! rewrites the buffer in place so each length becomes a minimal varint.
//! The output is byte-for-byte standard proto wire format.

mod buffer;
mod error;
mod field;
mod token;
mod writer;

pub use buffer::*;
pub use error::*;
pub use field::*;
pub use token::*;
pub use writer::*;
