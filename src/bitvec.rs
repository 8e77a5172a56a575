use std::{cmp, mem, ptr::NonNull, slice};

/// Number of bits in one backing word.
const BITS_PER_WORD: usize = usize::BITS as usize;

/// Fixed capacity bit set that tracks which slots of a bin are in use. A
/// marked bit (`1`) is a used slot, an unmarked bit (`0`) is free.
///
/// The vector doesn't own its words. Inside the allocator they live right
/// after the bin header, in the same page, so we can't hold a `&mut [usize]`
/// with a lifetime and store a raw pointer instead:
///
/// ```text
/// +------------+---------------------+-----------------------------------+
/// | Bin header | words[0..N] (usize) | slot 0 | slot 1 | ... | slot K-1 |
/// +------------+---------------------+-----------------------------------+
///       |            ^
///       +------------+ BitVector::words
/// ```
///
/// Bits past `len` in the last word are marked when the vector is created and
/// never touched again, so a word equal to `usize::MAX` always means "no free
/// bit here", even at the tail.
#[derive(Debug)]
pub struct BitVector {
    /// Number of usable bits.
    len: usize,
    /// Number of usable bits currently marked. Sentinel bits don't count.
    marked: usize,
    /// Every word before this index is full. Searches start here.
    cursor: usize,
    /// Backing storage, `BitVector::words_for(len)` words.
    words: NonNull<usize>,
}

impl BitVector {
    /// Number of words needed to track `len` bits.
    #[inline]
    pub const fn words_for(len: usize) -> usize {
        len.div_ceil(BITS_PER_WORD)
    }

    /// Number of bytes needed to track `len` bits.
    #[inline]
    pub const fn size_for(len: usize) -> usize {
        Self::words_for(len) * mem::size_of::<usize>()
    }

    /// Builds a bit vector of `len` unmarked bits on top of `words`, zeroing
    /// them and marking the sentinel tail.
    ///
    /// # Safety
    ///
    /// `words` must be valid for reads and writes of
    /// [`BitVector::words_for`]`(len)` words for as long as the returned value
    /// is used, and nothing else may access them in the meantime.
    pub unsafe fn new(words: NonNull<usize>, len: usize) -> Self {
        let count = Self::words_for(len);
        words.as_ptr().write_bytes(0, count);

        let tail = len % BITS_PER_WORD;
        if tail != 0 {
            *words.as_ptr().add(count - 1) = usize::MAX << tail;
        }

        Self {
            len,
            marked: 0,
            cursor: 0,
            words,
        }
    }

    #[inline]
    fn words(&self) -> &[usize] {
        // SAFETY: guaranteed by the contract of `BitVector::new`.
        unsafe { slice::from_raw_parts(self.words.as_ptr(), Self::words_for(self.len)) }
    }

    #[inline]
    fn words_mut(&mut self) -> &mut [usize] {
        // SAFETY: guaranteed by the contract of `BitVector::new`.
        unsafe { slice::from_raw_parts_mut(self.words.as_ptr(), Self::words_for(self.len)) }
    }

    /// Number of bits, marked or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the vector tracks no bits at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of marked bits.
    #[inline]
    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Number of unmarked bits.
    #[inline]
    pub fn free(&self) -> usize {
        self.len - self.marked
    }

    /// Whether bit `index` is marked. Out of range indices read as unmarked.
    pub fn is_marked(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }

        self.words()[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    /// Marks bit `index` as used. Out of range indices are ignored.
    pub fn mark(&mut self, index: usize) {
        if index >= self.len {
            return;
        }

        let (word, bit) = (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD));
        let cursor = self.cursor;
        let words = self.words_mut();

        if words[word] & bit != 0 {
            return;
        }

        words[word] |= bit;
        let full = words[word] == usize::MAX;

        self.marked += 1;
        if full && word == cursor {
            self.cursor += 1;
        }
    }

    /// Marks bit `index` as free. Out of range indices are ignored.
    pub fn unmark(&mut self, index: usize) {
        if index >= self.len {
            return;
        }

        let (word, bit) = (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD));
        let words = self.words_mut();

        if words[word] & bit == 0 {
            return;
        }

        words[word] &= !bit;

        self.marked -= 1;
        self.cursor = cmp::min(self.cursor, word);
    }

    /// Index of the lowest unmarked bit, or `None` if every bit is marked.
    /// Doesn't mark anything. Words before the cursor are known to be full,
    /// so a sequence of "find, mark" calls scans each word once.
    pub fn find_first_free(&mut self) -> Option<usize> {
        if self.all_marked() {
            return None;
        }

        let cursor = self.cursor;
        let offset = self.words()[cursor..]
            .iter()
            .position(|word| *word != usize::MAX)?;

        self.cursor = cursor + offset;
        let word = self.words()[self.cursor];

        Some(self.cursor * BITS_PER_WORD + (!word).trailing_zeros() as usize)
    }

    /// `true` when every usable bit is marked.
    #[inline]
    pub fn all_marked(&self) -> bool {
        self.marked == self.len
    }

    /// `true` when no usable bit is marked.
    #[inline]
    pub fn all_unmarked(&self) -> bool {
        self.marked == 0
    }
}
