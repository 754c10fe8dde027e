//! Object model.
//!
//! Objects are word arrays inside committed regions:
//!
//! ```text
//! word 0   mark word   age << 3 | 0b01            (normal)
//!                      forwardee | 0b11           (forwarded)
//! word 1   layout      kind | shape fields
//! word 2.. reference slots (0 is null), then data words
//! ```
//!
//! Sizes are rounded up to [`MIN_OBJ_ALIGN_WORDS`] so every gap left by
//! the collector can hold a filler object.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MAX_AGE;

/// Bytes per heap word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
/// log2 of [`WORD_SIZE`].
pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();
/// Words in every object header.
pub const HEADER_WORDS: usize = 2;
/// Object sizes and addresses are multiples of this many words.
pub const MIN_OBJ_ALIGN_WORDS: usize = 2;
/// Largest field count representable in a layout word.
pub const MAX_SHAPE_FIELD: usize = (1 << 30) - 1;

const KIND_BITS: usize = 2;
const KIND_MASK: usize = 0b11;
const KIND_INSTANCE: usize = 0;
const KIND_REF_ARRAY: usize = 1;
const KIND_FILLER: usize = 2;
const FIELD_MASK: usize = MAX_SHAPE_FIELD;

/// Rounds a word count up to the object alignment.
#[inline]
#[must_use]
pub const fn align_object_words(words: usize) -> usize {
    (words + MIN_OBJ_ALIGN_WORDS - 1) & !(MIN_OBJ_ALIGN_WORDS - 1)
}

/// Shape of an object requested by a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectShape {
    /// Fixed number of reference slots followed by raw data words.
    Instance {
        /// Reference slots.
        refs: usize,
        /// Raw data words.
        data: usize,
    },
    /// Array of reference slots.
    RefArray {
        /// Element count.
        len: usize,
    },
}

impl ObjectShape {
    /// Instance with `refs` reference slots and `data` data words.
    #[must_use]
    pub const fn instance(refs: usize, data: usize) -> Self {
        Self::Instance { refs, data }
    }

    /// Reference array of `len` elements.
    #[must_use]
    pub const fn ref_array(len: usize) -> Self {
        Self::RefArray { len }
    }

    /// Total size in words including header and alignment padding.
    #[must_use]
    pub const fn size_words(self) -> usize {
        match self {
            Self::Instance { refs, data } => align_object_words(HEADER_WORDS + refs + data),
            Self::RefArray { len } => align_object_words(HEADER_WORDS + len),
        }
    }

    pub(crate) const fn fits(self) -> bool {
        match self {
            Self::Instance { refs, data } => refs <= MAX_SHAPE_FIELD && data <= MAX_SHAPE_FIELD,
            Self::RefArray { len } => len <= MAX_SHAPE_FIELD,
        }
    }

    pub(crate) const fn layout(self) -> Layout {
        match self {
            Self::Instance { refs, data } => Layout::Instance { refs, data },
            Self::RefArray { len } => Layout::RefArray { len },
        }
    }
}

/// Decoded layout word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Instance { refs: usize, data: usize },
    RefArray { len: usize },
    Filler { words: usize },
}

impl Layout {
    pub(crate) const fn encode(self) -> usize {
        match self {
            Self::Instance { refs, data } => {
                KIND_INSTANCE | (refs << KIND_BITS) | (data << (KIND_BITS + 30))
            }
            Self::RefArray { len } => KIND_REF_ARRAY | (len << KIND_BITS),
            Self::Filler { words } => KIND_FILLER | (words << KIND_BITS),
        }
    }

    pub(crate) const fn decode(raw: usize) -> Self {
        match raw & KIND_MASK {
            KIND_INSTANCE => Self::Instance {
                refs: (raw >> KIND_BITS) & FIELD_MASK,
                data: (raw >> (KIND_BITS + 30)) & FIELD_MASK,
            },
            KIND_REF_ARRAY => Self::RefArray {
                len: raw >> KIND_BITS,
            },
            _ => Self::Filler {
                words: raw >> KIND_BITS,
            },
        }
    }

    pub(crate) const fn size_words(self) -> usize {
        match self {
            Self::Instance { refs, data } => align_object_words(HEADER_WORDS + refs + data),
            Self::RefArray { len } => align_object_words(HEADER_WORDS + len),
            Self::Filler { words } => words,
        }
    }

    /// Number of reference slots.
    pub(crate) const fn ref_count(self) -> usize {
        match self {
            Self::Instance { refs, .. } => refs,
            Self::RefArray { len } => len,
            Self::Filler { .. } => 0,
        }
    }

    pub(crate) const fn is_filler(self) -> bool {
        matches!(self, Self::Filler { .. })
    }

    pub(crate) const fn is_ref_array(self) -> bool {
        matches!(self, Self::RefArray { .. })
    }
}

/// Decoded mark word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarkWord(usize);

impl MarkWord {
    const TAG_MASK: usize = 0b11;
    const TAG_NORMAL: usize = 0b01;
    const TAG_FORWARDED: usize = 0b11;
    const AGE_SHIFT: usize = 3;
    const AGE_MASK: usize = 0xF;

    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub(crate) const fn raw(self) -> usize {
        self.0
    }

    pub(crate) const fn with_age(age: u8) -> Self {
        Self(((age as usize & Self::AGE_MASK) << Self::AGE_SHIFT) | Self::TAG_NORMAL)
    }

    pub(crate) const fn forwarded_to(addr: usize) -> Self {
        Self(addr | Self::TAG_FORWARDED)
    }

    pub(crate) const fn is_forwarded(self) -> bool {
        self.0 & Self::TAG_MASK == Self::TAG_FORWARDED
    }

    pub(crate) const fn forwardee(self) -> usize {
        self.0 & !Self::TAG_MASK
    }

    pub(crate) const fn age(self) -> u8 {
        ((self.0 >> Self::AGE_SHIFT) & Self::AGE_MASK) as u8
    }

    /// Adds `by` to the age, saturating at the maximum age.
    pub(crate) const fn aged(self, by: u8) -> Self {
        let age = self.age().saturating_add(by);
        Self::with_age(if age > MAX_AGE { MAX_AGE } else { age })
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_forwarded() {
            write!(f, "MarkWord(forwarded -> {:#x})", self.forwardee())
        } else {
            write!(f, "MarkWord(age {})", self.age())
        }
    }
}

/// Address of an object in the heap.
///
/// Values are only produced by the heap and always point at an object
/// header inside a committed region; the accessors below rely on that.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroUsize);

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.0)
    }
}

impl ObjRef {
    /// Wraps a raw slot value; `0` is null.
    #[inline]
    pub(crate) const fn from_raw(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Raw address of the object header.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    fn word(self, index: usize) -> &'static AtomicUsize {
        // SAFETY: an ObjRef always points at a header inside a committed
        // region, regions outlive every reference handed out for them, and
        // callers stay within the object's size.
        unsafe { word_at(self.addr() + index * WORD_SIZE) }
    }

    #[inline]
    pub(crate) fn mark_word(self) -> MarkWord {
        MarkWord(self.word(0).load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_mark_word(self, mark: MarkWord) {
        self.word(0).store(mark.0, Ordering::Release);
    }

    /// Installs `new` if the header still holds `expected`. Returns the
    /// header value observed on failure.
    #[inline]
    pub(crate) fn cas_mark_word(self, expected: MarkWord, new: MarkWord) -> Result<(), MarkWord> {
        self.word(0)
            .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(MarkWord)
    }

    #[inline]
    pub(crate) fn layout(self) -> Layout {
        Layout::decode(self.word(1).load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn size_words(self) -> usize {
        self.layout().size_words()
    }

    #[inline]
    pub(crate) fn size_bytes(self) -> usize {
        self.size_words() * WORD_SIZE
    }

    #[inline]
    pub(crate) fn end(self) -> usize {
        self.addr() + self.size_bytes()
    }

    #[inline]
    pub(crate) fn is_forwarded(self) -> bool {
        self.mark_word().is_forwarded()
    }

    /// The forwardee, or `self` if not forwarded.
    #[inline]
    pub(crate) fn resolve_forwarded(self) -> Self {
        let mark = self.mark_word();
        if mark.is_forwarded() {
            Self::from_raw(mark.forwardee()).unwrap_or(self)
        } else {
            self
        }
    }

    /// Address of reference slot `index`.
    #[inline]
    pub(crate) fn ref_slot_addr(self, index: usize) -> usize {
        self.addr() + (HEADER_WORDS + index) * WORD_SIZE
    }

    #[inline]
    pub(crate) fn ref_slot(self, index: usize) -> &'static AtomicUsize {
        debug_assert!(index < self.layout().ref_count());
        self.word(HEADER_WORDS + index)
    }

    #[inline]
    pub(crate) fn data_word(self, index: usize) -> &'static AtomicUsize {
        let refs = self.layout().ref_count();
        self.word(HEADER_WORDS + refs + index)
    }

    /// Calls `f(slot_addr, slot)` for every reference slot in `[from, to)`.
    #[inline]
    pub(crate) fn slots_in(
        self,
        from: usize,
        to: usize,
        mut f: impl FnMut(usize, &'static AtomicUsize),
    ) {
        for i in from..to {
            f(self.ref_slot_addr(i), self.word(HEADER_WORDS + i));
        }
    }

    /// Calls `f(slot_addr, slot)` for every reference slot.
    #[inline]
    pub(crate) fn slots(self, f: impl FnMut(usize, &'static AtomicUsize)) {
        let n = self.layout().ref_count();
        self.slots_in(0, n, f);
    }
}

/// Atomic view of the heap word at `addr`.
///
/// # Safety
///
/// `addr` must be word aligned and lie inside committed heap memory that
/// stays mapped for the rest of the program's use of the reference.
#[inline]
pub(crate) unsafe fn word_at(addr: usize) -> &'static AtomicUsize {
    debug_assert_eq!(addr % WORD_SIZE, 0);
    unsafe { &*(addr as *const AtomicUsize) }
}

/// Writes a fresh object header and clears its body.
///
/// The mark word is published last with release ordering so a reader that
/// finds the object through a published reference sees a parseable header.
///
/// # Safety
///
/// `[addr, addr + shape.size_words())` must be committed heap memory owned
/// exclusively by the caller.
pub(crate) unsafe fn init_object(addr: usize, shape: ObjectShape) -> ObjRef {
    let words = shape.size_words();
    unsafe {
        word_at(addr + WORD_SIZE).store(shape.layout().encode(), Ordering::Relaxed);
        for i in HEADER_WORDS..words {
            word_at(addr + i * WORD_SIZE).store(0, Ordering::Relaxed);
        }
        word_at(addr).store(MarkWord::with_age(0).raw(), Ordering::Release);
    }
    ObjRef::from_raw(addr).unwrap_or_else(|| unreachable!("heap addresses are non-zero"))
}

/// Turns `[addr, addr + words)` into a parseable dead object.
///
/// # Safety
///
/// The range must be committed heap memory that no live object overlaps
/// and `words` must be a non-zero multiple of [`MIN_OBJ_ALIGN_WORDS`].
pub(crate) unsafe fn fill_with_filler(addr: usize, words: usize) {
    debug_assert!(words >= MIN_OBJ_ALIGN_WORDS && words % MIN_OBJ_ALIGN_WORDS == 0);
    unsafe {
        word_at(addr + WORD_SIZE).store(Layout::Filler { words }.encode(), Ordering::Relaxed);
        word_at(addr).store(MarkWord::with_age(0).raw(), Ordering::Release);
    }
}

/// Copies `words` words from `from` to `to` word by word.
///
/// # Safety
///
/// Both ranges must be committed heap memory and must not overlap unless
/// `to <= from` (sliding compaction copies downwards).
pub(crate) unsafe fn copy_words(from: usize, to: usize, words: usize) {
    for i in 0..words {
        unsafe {
            let v = word_at(from + i * WORD_SIZE).load(Ordering::Relaxed);
            word_at(to + i * WORD_SIZE).store(v, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_round_trip() {
        for layout in [
            Layout::Instance { refs: 3, data: 7 },
            Layout::Instance { refs: MAX_SHAPE_FIELD, data: 1 },
            Layout::RefArray { len: 100_000 },
            Layout::Filler { words: 64 },
        ] {
            assert_eq!(Layout::decode(layout.encode()), layout);
        }
    }

    #[test]
    fn test_sizes_are_aligned() {
        assert_eq!(ObjectShape::instance(0, 0).size_words(), 2);
        assert_eq!(ObjectShape::instance(1, 0).size_words(), 4);
        assert_eq!(ObjectShape::instance(1, 1).size_words(), 4);
        assert_eq!(ObjectShape::ref_array(3).size_words(), 6);
    }

    #[test]
    fn test_mark_word_states() {
        let m = MarkWord::with_age(3);
        assert!(!m.is_forwarded());
        assert_eq!(m.age(), 3);
        assert_eq!(m.aged(20).age(), MAX_AGE);

        let f = MarkWord::forwarded_to(0x1000);
        assert!(f.is_forwarded());
        assert_eq!(f.forwardee(), 0x1000);
    }

    #[test]
    fn test_object_in_plain_memory() {
        let mut buf = vec![0usize; 16];
        let addr = buf.as_mut_ptr() as usize;
        // SAFETY: the buffer is owned by this test and large enough.
        let obj = unsafe { init_object(addr, ObjectShape::instance(2, 3)) };
        assert_eq!(obj.size_words(), 8);
        assert_eq!(obj.layout().ref_count(), 2);
        obj.data_word(2).store(99, Ordering::Relaxed);
        assert_eq!(buf[6], 99);

        let copy = addr + 8 * WORD_SIZE;
        // SAFETY: both halves belong to the buffer.
        unsafe { copy_words(addr, copy, 8) };
        let twin = ObjRef::from_raw(copy).unwrap();
        assert_eq!(twin.data_word(2).load(Ordering::Relaxed), 99);

        assert!(obj
            .cas_mark_word(MarkWord::with_age(0), MarkWord::forwarded_to(copy))
            .is_ok());
        assert_eq!(obj.resolve_forwarded(), twin);
        assert_eq!(obj.size_words(), 8);
        drop(buf);
    }
}
