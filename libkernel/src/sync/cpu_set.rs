use core::sync::atomic::{AtomicU64, Ordering};

pub const MAX_CPUS: usize = 128;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_CPUS.div_ceil(WORD_BITS);

/// A fixed-size set of CPU ids that any CPU may update without a lock.
pub struct CpuSet {
    words: [AtomicU64; WORDS],
}

impl CpuSet {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    fn slot(cpu: usize) -> (usize, u64) {
        assert!(cpu < MAX_CPUS, "CPU id {cpu} out of range");
        (cpu / WORD_BITS, 1 << (cpu % WORD_BITS))
    }

    /// Adds `cpu`, returning whether it was already present.
    pub fn set(&self, cpu: usize) -> bool {
        let (word, bit) = Self::slot(cpu);
        self.words[word].fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    pub fn contains(&self, cpu: usize) -> bool {
        let (word, bit) = Self::slot(cpu);
        self.words[word].load(Ordering::Acquire) & bit != 0
    }

    /// Removes `cpu`, returning whether it was present.
    pub fn test_and_clear(&self, cpu: usize) -> bool {
        let (word, bit) = Self::slot(cpu);
        self.words[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Adds every member of `other`.
    pub fn merge(&self, other: &CpuSet) {
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            let bits = src.load(Ordering::Acquire);
            if bits != 0 {
                dst.fetch_or(bits, Ordering::AcqRel);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Snapshot of the members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            let bits = word.load(Ordering::Acquire);
            (0..WORD_BITS)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| idx * WORD_BITS + bit)
        })
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
