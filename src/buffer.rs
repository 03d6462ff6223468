use std::fmt;

use crate::error::{EncodeError, EncodeResult};

/// Chunk size used when the caller passes 0.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Returns the number of 7-bit groups needed to varint-encode a 32-bit
/// unsigned value. No sign extension is applied; callers that are about to
/// write a negative `int32` must size it with [`varint_size64`] of the
/// sign-extended value instead.
pub fn varint_size32(val: u32) -> usize {
    if val & (!0u32 << 7) == 0 {
        1
    } else if val & (!0u32 << 14) == 0 {
        2
    } else if val & (!0u32 << 21) == 0 {
        3
    } else if val & (!0u32 << 28) == 0 {
        4
    } else {
        5
    }
}

/// Returns the number of 7-bit groups needed to varint-encode a 64-bit
/// unsigned value.
pub fn varint_size64(mut val: u64) -> usize {
    let mut size = 1;
    while val >= 0x80 {
        size += 1;
        val >>= 7;
    }
    size
}

/// A sequence of fixed-capacity chunks forming one growable byte array.
///
/// Chunks are allocated lazily as the write position grows and are never
/// freed during an encode session. After [`start_compaction`] the same
/// storage is rewritten in place: the write cursor returns to offset 0 and
/// [`copy_forward`] relocates byte runs without the read point ever falling
/// behind the write point, so no scratch copy of the data is needed.
///
/// [`start_compaction`]: ChunkBuffer::start_compaction
/// [`copy_forward`]: ChunkBuffer::copy_forward
pub struct ChunkBuffer {
    chunk_size: usize,
    chunks: Vec<Box<[u8]>>,
    write_pos: usize,
    chunk_index: usize,
    offset: usize,
    readable_size: Option<usize>,
}

impl ChunkBuffer {
    pub fn new() -> ChunkBuffer {
        ChunkBuffer::with_chunk_size(0)
    }

    pub fn with_chunk_size(chunk_size: usize) -> ChunkBuffer {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        ChunkBuffer {
            chunk_size,
            chunks: Vec::new(),
            write_pos: 0,
            chunk_index: 0,
            offset: 0,
            readable_size: None,
        }
    }

    /// Total bytes appended so far; during compaction, the rewrite cursor.
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes that had been appended when compaction started, or `None` while
    /// still in append mode.
    pub fn readable_size(&self) -> Option<usize> {
        self.readable_size
    }

    fn advance_chunk(&mut self) {
        if self.offset >= self.chunk_size {
            self.chunk_index += 1;
            self.offset = 0;
        }
        if self.chunk_index >= self.chunks.len() {
            self.chunks.push(vec![0u8; self.chunk_size].into_boxed_slice());
        }
    }

    fn set_cursor(&mut self, pos: usize) {
        self.write_pos = pos;
        self.chunk_index = pos / self.chunk_size;
        self.offset = pos % self.chunk_size;
    }

    fn byte_at(&self, pos: usize) -> u8 {
        self.chunks[pos / self.chunk_size][pos % self.chunk_size]
    }

    pub fn write_byte(&mut self, val: u8) {
        self.advance_chunk();
        self.chunks[self.chunk_index][self.offset] = val;
        self.offset += 1;
        self.write_pos += 1;
    }

    /// Copies `data` into the buffer across as many chunks as needed. The
    /// caller's slice is never retained.
    pub fn write_bytes(&mut self, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            self.advance_chunk();
            let run = (self.chunk_size - self.offset).min(rest.len());
            self.chunks[self.chunk_index][self.offset..self.offset + run]
                .copy_from_slice(&rest[..run]);
            self.offset += run;
            self.write_pos += run;
            rest = &rest[run..];
        }
    }

    pub fn write_fixed32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, val: u64) {
        self.write_bytes(&val.to_le_bytes());
    }

    /// Varint-encodes the raw 64-bit pattern: little-endian base-128 groups,
    /// continuation bit set on all but the last byte.
    pub fn write_varint64(&mut self, mut val: u64) {
        while val >= 0x80 {
            self.write_byte((val as u8 & 0x7f) | 0x80);
            val >>= 7;
        }
        self.write_byte(val as u8);
    }

    /// Varint-encodes a 32-bit signed value. Negative values sign-extend to
    /// 64 bits first and always occupy 10 bytes, matching the proto wire
    /// behavior of `int32`.
    pub fn write_varint32(&mut self, val: i32) {
        self.write_varint64(val as i64 as u64);
    }

    /// Switches the buffer into compaction mode: the write cursor returns to
    /// offset 0 and the number of bytes appended so far becomes the readable
    /// window. Chunk contents are left intact.
    pub fn start_compaction(&mut self) {
        self.readable_size = Some(self.write_pos);
        self.set_cursor(0);
    }

    /// Returns the next `n` bytes ahead of the write cursor without advancing
    /// it. Only meaningful in compaction mode.
    pub fn read_slice(&self, n: usize) -> EncodeResult<Vec<u8>> {
        let limit = self.readable_size.unwrap_or(self.write_pos);
        let available = limit.saturating_sub(self.write_pos);
        if n > available {
            return Err(EncodeError::ReadPastEnd {
                wanted: n,
                available,
            });
        }
        let mut out = Vec::with_capacity(n);
        let mut pos = self.write_pos;
        let end = self.write_pos + n;
        while pos < end {
            let off = pos % self.chunk_size;
            let run = (self.chunk_size - off).min(end - pos);
            out.extend_from_slice(&self.chunks[pos / self.chunk_size][off..off + run]);
            pos += run;
        }
        Ok(out)
    }

    /// Appends `size` bytes read from absolute offset `src_offset` to the
    /// write cursor. The source range must lie at or ahead of the cursor and
    /// inside the readable window; because the read point never falls behind
    /// the write point, source and destination may alias the same chunks.
    pub fn copy_forward(&mut self, src_offset: usize, size: usize) -> EncodeResult<()> {
        let readable = self.readable_size.unwrap_or(0);
        if self.readable_size.is_none()
            || src_offset < self.write_pos
            || src_offset + size > readable
        {
            return Err(EncodeError::CopyRange {
                src_offset,
                size,
                write_pos: self.write_pos,
                readable_size: readable,
            });
        }
        let mut src = src_offset;
        let mut remaining = size;
        while remaining > 0 {
            if self.offset >= self.chunk_size {
                self.chunk_index += 1;
                self.offset = 0;
            }
            let src_chunk = src / self.chunk_size;
            let src_off = src % self.chunk_size;
            let run = remaining
                .min(self.chunk_size - src_off)
                .min(self.chunk_size - self.offset);
            if src_chunk == self.chunk_index {
                // overlapping ranges within one chunk; the destination is
                // never past the source, so a forward copy is safe
                self.chunks[self.chunk_index].copy_within(src_off..src_off + run, self.offset);
            } else {
                let (head, tail) = self.chunks.split_at_mut(src_chunk);
                head[self.chunk_index][self.offset..self.offset + run]
                    .copy_from_slice(&tail[0][src_off..src_off + run]);
            }
            self.offset += run;
            self.write_pos += run;
            src += run;
            remaining -= run;
        }
        Ok(())
    }

    /// Moves the write cursor back to `pos`, discarding everything appended
    /// after it. Used to retract an empty object's tag and length slot.
    pub(crate) fn rewind_write_to(&mut self, pos: usize) {
        debug_assert!(self.readable_size.is_none());
        debug_assert!(pos <= self.write_pos);
        self.set_cursor(pos);
    }
}

impl Default for ChunkBuffer {
    fn default() -> ChunkBuffer {
        ChunkBuffer::new()
    }
}

impl fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("chunk_size", &self.chunk_size)
            .field("chunks", &self.chunks.len())
            .field("write_pos", &self.write_pos)
            .field("readable_size", &self.readable_size)
            .finish()
    }
}
