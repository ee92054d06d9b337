use thiserror::Error;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub(crate) struct BitSet {
    words: Vec<u64>,
    size: usize,
    count: usize,
}

impl BitSet {
    pub(crate) fn new(size: usize) -> BitSet {
        BitSet {
            words: vec![0; size.div_ceil(WORD_BITS)],
            size,
            count: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    // index starts from 0
    pub(crate) fn set(&mut self, index: usize, value: bool) -> Result<(), BitSetError> {
        if index >= self.size {
            return Err(BitSetError::InvalidIndex);
        }
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        let was = self.words[word] & (1 << bit) != 0;
        match value {
            true => self.words[word] |= 1 << bit,
            false => self.words[word] &= !(1 << bit),
        }
        match (was, value) {
            (false, true) => self.count += 1,
            (true, false) => self.count -= 1,
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn set_true(&mut self, index: usize) -> Result<(), BitSetError> {
        if self.is_set(index) {
            return Err(BitSetError::AlreadySet);
        }
        self.set(index, true)
    }

    pub(crate) fn set_next(&mut self) -> Result<usize, BitSetError> {
        let index = self.get_min_unset_index(&[])?;
        self.set(index, true)?;
        Ok(index)
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        if index >= self.size {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    // Skips indexes listed in `exclude` as if they were set.
    pub(crate) fn get_min_unset_index(&self, exclude: &[usize]) -> Result<usize, BitSetError> {
        for (w, word) in self.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            for bit in 0..WORD_BITS {
                let index = w * WORD_BITS + bit;
                if index >= self.size {
                    return Err(BitSetError::Full);
                }
                if word & (1 << bit) == 0 && !exclude.contains(&index) {
                    return Ok(index);
                }
            }
        }
        Err(BitSetError::Full)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitSetError {
    #[error("Invalid index")]
    InvalidIndex,
    #[error("Index already set")]
    AlreadySet,
    #[error("BitSet is full")]
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn with_set(size: usize, indexes: &[usize]) -> BitSet {
        let mut b = BitSet::new(size);
        for i in indexes {
            b.set(*i, true).unwrap();
        }
        b
    }

    #[rstest(
        base,
        index,
        value,
        expected_count,
        case(with_set(32, &[]), 0, true, 1),
        case(with_set(32, &[0]), 0, true, 1),
        case(with_set(32, &[0]), 0, false, 0),
        case(with_set(32, &[]), 31, true, 1),
        case(with_set(130, &[64, 65]), 129, true, 3),
        case(with_set(130, &[64, 65]), 64, false, 1)
    )]
    fn works_bitset_set(mut base: BitSet, index: usize, value: bool, expected_count: usize) {
        base.set(index, value).unwrap();
        assert_eq!(base.is_set(index), value);
        assert_eq!(base.count(), expected_count);
    }

    #[rstest(
        base,
        index,
        expected,
        case(with_set(32, &[]), 32, BitSetError::InvalidIndex),
        case(with_set(8, &[]), 100, BitSetError::InvalidIndex)
    )]
    fn fails_bitset_set(mut base: BitSet, index: usize, expected: BitSetError) {
        let res = base.set(index, true);
        match res {
            Ok(_) => panic!("this test should be failed"),
            Err(e) => assert_eq!(e, expected),
        }
    }

    #[test]
    fn fails_bitset_set_true_twice() {
        let mut b = BitSet::new(8);
        b.set_true(3).unwrap();
        assert_eq!(b.set_true(3), Err(BitSetError::AlreadySet));
        assert_eq!(b.count(), 1);
    }

    #[rstest(
        base,
        exclude,
        expected,
        case(with_set(8, &[0, 1, 3]), vec![], 2),
        case(with_set(8, &[1, 2]), vec![], 0),
        case(with_set(8, &[0, 1, 2]), vec![3, 4], 5),
        case(with_set(8, &[0, 1, 2, 3, 4, 5, 6]), vec![], 7),
        case(with_set(70, &(0..64).collect::<Vec<usize>>()), vec![], 64)
    )]
    fn works_bitset_get_min_unset_index(base: BitSet, exclude: Vec<usize>, expected: usize) {
        let index = base.get_min_unset_index(&exclude).unwrap();
        assert_eq!(index, expected);
    }

    #[rstest(
        base,
        exclude,
        case(with_set(8, &[0, 1, 2, 3, 4, 5, 6, 7]), vec![]),
        case(with_set(1, &[0]), vec![]),
        case(with_set(2, &[0]), vec![1]),
        case(with_set(0, &[]), vec![])
    )]
    fn fails_bitset_get_min_unset_index(base: BitSet, exclude: Vec<usize>) {
        let res = base.get_min_unset_index(&exclude);
        match res {
            Ok(_) => panic!("this test should be failed"),
            Err(e) => assert_eq!(e, BitSetError::Full),
        }
    }

    #[test]
    fn works_bitset_set_next_until_full() {
        let mut b = BitSet::new(3);
        assert_eq!(b.set_next(), Ok(0));
        assert_eq!(b.set_next(), Ok(1));
        b.set(0, false).unwrap();
        assert_eq!(b.set_next(), Ok(0));
        assert_eq!(b.set_next(), Ok(2));
        assert_eq!(b.set_next(), Err(BitSetError::Full));
        assert_eq!(b.count(), 3);
    }
}
