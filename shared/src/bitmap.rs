use alloc::vec;
use alloc::vec::Vec;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-length array of bits, packed into words.
///
/// Bit `i` set means slot `i` is in use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(BITS_PER_WORD)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bitmap index {idx} out of bounds");
        (self.words[idx / BITS_PER_WORD] >> (idx % BITS_PER_WORD)) & 1 != 0
    }

    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bitmap index {idx} out of bounds");
        let mask = 1 << (idx % BITS_PER_WORD);
        let word = &mut self.words[idx / BITS_PER_WORD];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Finds the first clear bit, sets it, and returns its index.
    pub fn scan_and_set(&mut self) -> Option<usize> {
        let (word_idx, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let idx = word_idx * BITS_PER_WORD + word.trailing_ones() as usize;
        // The last word may have spare high bits that are never handed out.
        if idx >= self.len {
            return None;
        }
        self.set(idx, true);
        Some(idx)
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit() {
        let mut bitmap = Bitmap::new(4);
        assert_eq!(bitmap.scan_and_set(), Some(0));
        assert_eq!(bitmap.scan_and_set(), Some(1));
        bitmap.set(0, false);
        // The lowest free index is reused first.
        assert_eq!(bitmap.scan_and_set(), Some(0));
        assert_eq!(bitmap.scan_and_set(), Some(2));
        assert_eq!(bitmap.scan_and_set(), Some(3));
        assert_eq!(bitmap.scan_and_set(), None);
        assert_eq!(bitmap.count_set(), 4);
    }

    #[test]
    fn crosses_word_boundary() {
        let mut bitmap = Bitmap::new(70);
        for i in 0..70 {
            assert_eq!(bitmap.scan_and_set(), Some(i));
        }
        assert_eq!(bitmap.scan_and_set(), None);
        bitmap.set(65, false);
        assert!(!bitmap.get(65));
        assert_eq!(bitmap.scan_and_set(), Some(65));
    }

    #[test]
    fn empty() {
        let mut bitmap = Bitmap::new(0);
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.scan_and_set(), None);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds() {
        Bitmap::new(3).get(3);
    }
}
