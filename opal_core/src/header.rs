//! One-word block headers: tag, collector color, and size.
//!
//! Every heap or arena block is preceded by a header word:
//!
//! ```text
//! 63                    10 9      8 7           0
//! +-----------------------+--------+------------+
//! |     size in words     | color  |    tag     |
//! +-----------------------+--------+------------+
//! ```
//!
//! Tag [`TAG_BOUNDARY`] is reserved for the arena boundary sentinel and
//! never allocated, so a walk over packed blocks can detect the end of
//! an arena from the header alone.

use crate::{Value, WORD};

const TAG_BITS: u32 = 8;
const COLOR_SHIFT: u32 = TAG_BITS;
const SIZE_SHIFT: u32 = TAG_BITS + 2;

/// Tag of an interior block: its size field holds the offset, in words,
/// back to the start of the enclosing block's payload.
pub const TAG_INTERIOR: u8 = 249;

/// First tag whose blocks hold no scannable references (raw bytes,
/// boxed floats, and so on).
pub const NO_SCAN_TAG: u8 = 251;

/// Tag for two-field carrier blocks (condition, payload).
pub const TAG_PAIR: u8 = 0;

/// Tag reserved for the arena boundary sentinel. Never allocated.
pub const TAG_BOUNDARY: u8 = 255;

/// Collector color of a block, two bits in its header.
///
/// The tri-color scheme belongs to the major collector; `NotMarkable`
/// identifies blocks outside its management (local-arena blocks and
/// foreign or static data).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not yet reached by the current major cycle.
    Unmarked = 0,
    /// Reached by the current major cycle.
    Marked = 1,
    /// Known dead, awaiting sweep.
    Garbage = 2,
    /// Outside major-collector management (local or foreign block).
    NotMarkable = 3,
}

impl Color {
    #[inline]
    fn from_bits(bits: usize) -> Self {
        match bits & 0b11 {
            0 => Color::Unmarked,
            1 => Color::Marked,
            2 => Color::Garbage,
            _ => Color::NotMarkable,
        }
    }
}

/// A one-word block header.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(usize);

impl Header {
    /// The arena boundary sentinel, stored above the newest block of an
    /// arena so the object walk knows where the arena ends.
    pub const SENTINEL: Header = Header::new(TAG_BOUNDARY, Color::NotMarkable, 0);

    /// Compose a header from tag, color, and size in words.
    #[inline]
    pub const fn new(tag: u8, color: Color, wosize: usize) -> Self {
        Header((wosize << SIZE_SHIFT) | ((color as usize) << COLOR_SHIFT) | tag as usize)
    }

    /// The block's tag.
    #[inline]
    pub const fn tag(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// The block's collector color.
    #[inline]
    pub fn color(self) -> Color {
        Color::from_bits(self.0 >> COLOR_SHIFT)
    }

    /// The block's payload size in words.
    #[inline]
    pub const fn wosize(self) -> usize {
        self.0 >> SIZE_SHIFT
    }

    /// Total byte size of the block including this header.
    #[inline]
    pub const fn byte_size(self) -> usize {
        (self.wosize() + 1) * WORD
    }

    /// Same header with a different color.
    #[inline]
    pub fn with_color(self, color: Color) -> Self {
        Header((self.0 & !(0b11 << COLOR_SHIFT)) | ((color as usize) << COLOR_SHIFT))
    }

    /// For an interior block, the offset in words back to the start of
    /// the enclosing block's payload.
    #[inline]
    pub const fn interior_offset_words(self) -> usize {
        self.wosize()
    }

    /// Whether this header is the arena boundary sentinel.
    #[inline]
    pub const fn is_sentinel(self) -> bool {
        self.tag() == TAG_BOUNDARY
    }

    /// The raw header word.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Reinterpret a raw word as a header.
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Header(raw)
    }

    /// Read the header of the block a value points into.
    ///
    /// # Safety
    ///
    /// `v` must be a block pointer whose payload is immediately preceded
    /// by a valid header word.
    #[inline]
    pub unsafe fn of_value(v: Value) -> Header {
        unsafe { *(v.as_ptr() as *const Header).sub(1) }
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_sentinel() {
            write!(f, "Header::SENTINEL")
        } else {
            write!(
                f,
                "Header(tag={}, color={:?}, wosize={})",
                self.tag(),
                self.color(),
                self.wosize()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let hd = Header::new(7, Color::NotMarkable, 12);
        assert_eq!(hd.tag(), 7);
        assert_eq!(hd.color(), Color::NotMarkable);
        assert_eq!(hd.wosize(), 12);
        assert_eq!(hd.byte_size(), 13 * WORD);
    }

    #[test]
    fn test_with_color_preserves_rest() {
        let hd = Header::new(3, Color::Unmarked, 5);
        let marked = hd.with_color(Color::Marked);
        assert_eq!(marked.tag(), 3);
        assert_eq!(marked.wosize(), 5);
        assert_eq!(marked.color(), Color::Marked);
    }

    #[test]
    fn test_sentinel_is_distinct() {
        assert!(Header::SENTINEL.is_sentinel());
        assert!(!Header::new(TAG_PAIR, Color::Unmarked, 1).is_sentinel());
    }

    #[test]
    fn test_header_of_value() {
        let mut block = [0usize; 3];
        block[0] = Header::new(TAG_PAIR, Color::NotMarkable, 2).raw();
        let payload = unsafe { block.as_ptr().add(1) };
        let v = Value::from_ptr(payload as *const ());
        let hd = unsafe { Header::of_value(v) };
        assert_eq!(hd.tag(), TAG_PAIR);
        assert_eq!(hd.wosize(), 2);
    }
}
