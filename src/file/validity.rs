//! Byte ranges of a chunk that were written while the chunk was being read

/// One populated `(offset, len)` range inside a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityPair {
    offset: u32,
    len: u32,
}

impl ValidityPair {
    pub fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u32 {
        self.offset + self.len
    }

    /// Overlapping or touching ranges can be merged into one
    pub fn can_be_merged(&self, other: &ValidityPair) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    /// Extend this range to also cover `other`
    ///
    /// Caller must check [`can_be_merged`](Self::can_be_merged) first.
    pub fn merge(&mut self, other: &ValidityPair) {
        let offset = self.offset.min(other.offset);
        let end = self.end().max(other.end());
        self.offset = offset;
        self.len = end - offset;
    }
}

/// Sorted, minimal list of populated ranges
///
/// Ranges never overlap nor touch: every insertion merges with its
/// neighbours. The list stays tiny (a handful of pairs) so a sorted vector
/// with linear merging beats any tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidityMap {
    pairs: Vec<ValidityPair>,
}

impl ValidityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `len` bytes starting at `offset` are populated
    pub fn add_pair(&mut self, offset: u32, len: u32) {
        let mut pair = ValidityPair::new(offset, len);
        if pair.is_empty() {
            return;
        }

        // First pair that may touch the new one
        let pos = self.pairs.partition_point(|p| p.end() < pair.offset);

        // Swallow every following pair that touches the new one
        while pos < self.pairs.len() && self.pairs[pos].can_be_merged(&pair) {
            let old = self.pairs.remove(pos);
            pair.merge(&old);
        }

        // The predecessor may now touch the grown pair
        if pos > 0 && self.pairs[pos - 1].can_be_merged(&pair) {
            self.pairs[pos - 1].merge(&pair);
            return;
        }

        self.pairs.insert(pos, pair);
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidityPair> {
        self.pairs.iter()
    }

    /// End of the last populated range
    pub fn max_end(&self) -> u32 {
        self.pairs.last().map(ValidityPair::end).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(map: &ValidityMap) -> Vec<(u32, u32)> {
        map.iter().map(|p| (p.offset(), p.len())).collect()
    }

    #[test]
    fn test_disjoint_pairs_stay_sorted() {
        let mut map = ValidityMap::new();
        map.add_pair(100, 10);
        map.add_pair(0, 10);
        map.add_pair(50, 5);
        assert_eq!(ranges(&map), vec![(0, 10), (50, 5), (100, 10)]);
        assert_eq!(map.max_end(), 110);
    }

    #[test]
    fn test_adjacent_pairs_merge() {
        let mut map = ValidityMap::new();
        map.add_pair(0, 10);
        map.add_pair(10, 10);
        assert_eq!(ranges(&map), vec![(0, 20)]);

        map.add_pair(30, 5);
        map.add_pair(20, 10);
        assert_eq!(ranges(&map), vec![(0, 35)]);
    }

    #[test]
    fn test_overlap_spanning_several_pairs() {
        let mut map = ValidityMap::new();
        map.add_pair(0, 5);
        map.add_pair(10, 5);
        map.add_pair(20, 5);
        map.add_pair(40, 5);
        map.add_pair(3, 20);
        assert_eq!(ranges(&map), vec![(0, 25), (40, 5)]);
    }

    #[test]
    fn test_contained_pair_is_absorbed() {
        let mut map = ValidityMap::new();
        map.add_pair(0, 100);
        map.add_pair(10, 5);
        assert_eq!(ranges(&map), vec![(0, 100)]);
    }

    #[test]
    fn test_add_is_idempotent() {
        let updates = [(7u32, 13u32), (100, 1), (0, 7), (50, 60), (20, 30)];

        let mut once = ValidityMap::new();
        let mut twice = ValidityMap::new();
        for (offset, len) in updates {
            once.add_pair(offset, len);
            twice.add_pair(offset, len);
            twice.add_pair(offset, len);
        }
        assert_eq!(once, twice);
        assert_eq!(ranges(&once), vec![(0, 110)]);
    }

    #[test]
    fn test_empty_pair_is_ignored() {
        let mut map = ValidityMap::new();
        map.add_pair(10, 0);
        assert!(map.is_empty());
    }
}
