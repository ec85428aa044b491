/// Deterministic visible-index set backed by a bitset.
///
/// Used both as the *applied* set (what the surface currently shows) and the
/// *target* set (what should be shown after the next commit).
///
/// Ordering contract:
/// - Iteration yields item indices in ascending order.
#[derive(Debug, Clone, Default)]
pub struct VisibleSet {
    words: Vec<u64>,
    len: usize,
}

impl VisibleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_index(max_index_inclusive: u32) -> Self {
        let mut s = Self::default();
        s.ensure_capacity(max_index_inclusive);
        s
    }

    /// Set containing `0..len`.
    pub fn full(len: u32) -> Self {
        let mut s = Self::default();
        for idx in 0..len {
            s.insert(idx);
        }
        s
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: u32) -> bool {
        let (word, bit) = word_bit(index);
        self.words
            .get(word)
            .is_some_and(|w| (w & (1u64 << bit)) != 0)
    }

    /// Inserts `index` into the set.
    ///
    /// Returns `true` if the set changed.
    pub fn insert(&mut self, index: u32) -> bool {
        self.ensure_capacity(index);
        let (word, bit) = word_bit(index);
        let mask = 1u64 << bit;
        let w = &mut self.words[word];
        if (*w & mask) != 0 {
            return false;
        }
        *w |= mask;
        self.len += 1;
        true
    }

    /// Removes `index` from the set.
    ///
    /// Returns `true` if the set changed.
    pub fn remove(&mut self, index: u32) -> bool {
        let (word, bit) = word_bit(index);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let mask = 1u64 << bit;
        if (*w & mask) == 0 {
            return false;
        }
        *w &= !mask;
        self.len -= 1;
        true
    }

    /// Keeps only the indices for which `keep` returns `true`.
    ///
    /// Returns the number of removed indices.
    pub fn retain(&mut self, mut keep: impl FnMut(u32) -> bool) -> usize {
        let doomed: Vec<u32> = self.iter().filter(|idx| !keep(*idx)).collect();
        for idx in &doomed {
            self.remove(*idx);
        }
        doomed.len()
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.union_in_place(other);
        out
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.intersect_in_place(other);
        out
    }

    /// Set difference: `self \ other`.
    pub fn diff(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.diff_in_place(other);
        out
    }

    /// Indices in exactly one of the two sets.
    pub fn symmetric_diff(&self, other: &Self) -> Self {
        let max_words = other.words.len().max(self.words.len());
        let mut words = vec![0u64; max_words];
        for (idx, w) in words.iter_mut().enumerate() {
            let a = self.words.get(idx).copied().unwrap_or(0);
            let b = other.words.get(idx).copied().unwrap_or(0);
            *w = a ^ b;
        }
        let mut out = Self { words, len: 0 };
        out.recount_len();
        out
    }

    pub fn union_in_place(&mut self, other: &Self) {
        let max_words = other.words.len().max(self.words.len());
        self.words.resize(max_words, 0);
        for (idx, ow) in other.words.iter().copied().enumerate() {
            self.words[idx] |= ow;
        }
        self.recount_len();
    }

    pub fn intersect_in_place(&mut self, other: &Self) {
        let min_words = other.words.len().min(self.words.len());
        for idx in 0..min_words {
            self.words[idx] &= other.words[idx];
        }
        for idx in min_words..self.words.len() {
            self.words[idx] = 0;
        }
        self.recount_len();
    }

    /// Set difference: `self \ other`.
    pub fn diff_in_place(&mut self, other: &Self) {
        let min_words = other.words.len().min(self.words.len());
        for idx in 0..min_words {
            self.words[idx] &= !other.words[idx];
        }
        self.recount_len();
    }

    /// Iterates indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, &word)| {
            let base = (word_index as u32) * 64;
            BitIter { word }.map(move |bit| base + bit)
        })
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    fn ensure_capacity(&mut self, index: u32) {
        let (word, _bit) = word_bit(index);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
    }

    fn recount_len(&mut self) {
        self.len = self.words.iter().map(|w| w.count_ones() as usize).sum();
    }

    fn significant_words(&self) -> &[u64] {
        let end = self
            .words
            .iter()
            .rposition(|w| *w != 0)
            .map_or(0, |i| i + 1);
        &self.words[..end]
    }
}

// Membership equality; trailing zero words from removals do not matter.
impl PartialEq for VisibleSet {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.significant_words() == other.significant_words()
    }
}

impl Eq for VisibleSet {}

impl FromIterator<u32> for VisibleSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut s = Self::new();
        for idx in iter {
            s.insert(idx);
        }
        s
    }
}

impl Extend<u32> for VisibleSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for idx in iter {
            self.insert(idx);
        }
    }
}

fn word_bit(index: u32) -> (usize, u32) {
    let word = (index / 64) as usize;
    let bit = index % 64;
    (word, bit)
}

struct BitIter {
    word: u64,
}

impl Iterator for BitIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros();
        self.word &= self.word - 1;
        Some(bit)
    }
}
