use std::fmt::Display;

const TAG_SIZE_SHIFT: u64 = 61;
const REPEATED_SHIFT: u64 = 60;
const DEPTH_SHIFT: u64 = 51;
const OBJECT_ID_SHIFT: u64 = 32;

/// Handle returned by `start_object`/`start_repeated_object` and consumed by
/// the matching end call.
///
/// The 64 bits are packed so that an end call can be checked against the
/// innermost open object without any lookup:
///
/// ```text
/// bits 61-63  tag_size   bytes occupied by the object's field tag
/// bit  60     repeated   opened via start_repeated_object
/// bits 51-59  depth      nesting depth at open time
/// bits 32-50  object_id  per-writer monotonic counter value
/// bits 0-31   size_pos   buffer offset of the reserved length slot
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

impl Token {
    pub(crate) fn pack(
        tag_size: usize,
        repeated: bool,
        depth: u32,
        object_id: u32,
        size_pos: usize,
    ) -> Token {
        Token(
            ((tag_size as u64 & 0x07) << TAG_SIZE_SHIFT)
                | ((repeated as u64) << REPEATED_SHIFT)
                | ((depth as u64 & 0x01ff) << DEPTH_SHIFT)
                | ((object_id as u64 & 0x07ffff) << OBJECT_ID_SHIFT)
                | (size_pos as u64 & 0xffff_ffff),
        )
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Token {
        Token(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn tag_size(self) -> usize {
        ((self.0 >> TAG_SIZE_SHIFT) & 0x07) as usize
    }

    pub fn repeated(self) -> bool {
        (self.0 >> REPEATED_SHIFT) & 0x01 == 1
    }

    pub fn depth(self) -> u32 {
        ((self.0 >> DEPTH_SHIFT) & 0x01ff) as u32
    }

    pub fn object_id(self) -> u32 {
        ((self.0 >> OBJECT_ID_SHIFT) & 0x07ffff) as u32
    }

    pub fn size_pos(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "token 0x{:016x} (tag_size={} repeated={} depth={} object_id={} size_pos={})",
            self.0,
            self.tag_size(),
            self.repeated(),
            self.depth(),
            self.object_id(),
            self.size_pos()
        ))
    }
}
