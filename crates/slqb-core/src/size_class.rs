//! Size class index for kmalloc.
//!
//! Classes are powers of two from `KMALLOC_MIN_SIZE` up to `MAX_CLASS_SIZE`,
//! plus the 96 and 192 byte classes when the cache line is small enough for
//! them to pay off. A class is identified by its table index, which is also
//! the log2 of its object size for the power-of-two classes.

use serde::Serialize;

/// Page size assumed by the allocator.
pub const PAGE_SHIFT: u32 = 12;

/// Page size assumed by the allocator (bytes).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Platform cache line size.
pub const L1_CACHE_BYTES: usize = 64;

/// Minimum kmalloc object size, also the minimum object alignment.
pub const KMALLOC_MIN_SIZE: usize = 8;

/// Index of the smallest power-of-two class (`ilog2(KMALLOC_MIN_SIZE)`).
pub const KMALLOC_SHIFT_LOW: u8 = KMALLOC_MIN_SIZE.trailing_zeros() as u8;

/// Index of the largest class.
pub const KMALLOC_SHIFT_HIGH: u8 = (PAGE_SHIFT + 9) as u8;

/// Largest size served by kmalloc (2 MiB).
pub const MAX_CLASS_SIZE: usize = 1 << KMALLOC_SHIFT_HIGH;

/// Number of slots in a kmalloc cache table (indices `0..=KMALLOC_SHIFT_HIGH`).
pub const KMALLOC_TABLE_LEN: usize = KMALLOC_SHIFT_HIGH as usize + 1;

const HAS_96_CLASS: bool = L1_CACHE_BYTES < 64;
const HAS_192_CLASS: bool = L1_CACHE_BYTES < 128;

/// A kmalloc size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Returns the class at `index` if it is active on this platform.
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        if class_size(index) == 0 {
            None
        } else {
            Some(Self(index))
        }
    }

    /// Table index of this class.
    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Object size served by this class.
    #[must_use]
    pub const fn size(self) -> usize {
        class_size(self.0)
    }
}

/// Maps a requested size to its size class.
///
/// Returns `None` for a zero size or anything above `MAX_CLASS_SIZE`.
/// Written as a comparison ladder so constant sizes fold away entirely.
#[must_use]
pub const fn classify(size: usize) -> Option<SizeClass> {
    if size == 0 || size > MAX_CLASS_SIZE {
        return None;
    }
    if size <= KMALLOC_MIN_SIZE {
        return Some(SizeClass(KMALLOC_SHIFT_LOW));
    }
    if HAS_96_CLASS && size > 64 && size <= 96 {
        return Some(SizeClass(1));
    }
    if HAS_192_CLASS && size > 128 && size <= 192 {
        return Some(SizeClass(2));
    }
    let index = if size <= 16 {
        4
    } else if size <= 32 {
        5
    } else if size <= 64 {
        6
    } else if size <= 128 {
        7
    } else if size <= 256 {
        8
    } else if size <= 512 {
        9
    } else if size <= 1024 {
        10
    } else if size <= 2 * 1024 {
        11
    } else if size <= 4 * 1024 {
        12
    } else if size <= 8 * 1024 {
        13
    } else if size <= 16 * 1024 {
        14
    } else if size <= 32 * 1024 {
        15
    } else if size <= 64 * 1024 {
        16
    } else if size <= 128 * 1024 {
        17
    } else if size <= 256 * 1024 {
        18
    } else if size <= 512 * 1024 {
        19
    } else if size <= 1024 * 1024 {
        20
    } else {
        21
    };
    Some(SizeClass(index))
}

/// Returns the object size for a table index.
///
/// Returns 0 for index 0, for classes disabled on this platform, and for
/// out-of-range indices.
#[must_use]
pub const fn class_size(index: u8) -> usize {
    match index {
        1 if HAS_96_CLASS => 96,
        2 if HAS_192_CLASS => 192,
        i if i >= KMALLOC_SHIFT_LOW && i <= KMALLOC_SHIFT_HIGH => 1 << i,
        _ => 0,
    }
}

/// All active classes in ascending object-size order.
#[must_use]
pub fn active_classes() -> Vec<SizeClass> {
    let mut classes: Vec<SizeClass> = (0..KMALLOC_TABLE_LEN as u8)
        .filter_map(SizeClass::from_index)
        .collect();
    classes.sort_by_key(|class| class.size());
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_zero_and_oversize() {
        assert_eq!(classify(0), None);
        assert_eq!(classify(MAX_CLASS_SIZE + 1), None);
        assert_eq!(classify(usize::MAX), None);
    }

    #[test]
    fn classify_min() {
        assert_eq!(classify(1).map(SizeClass::index), Some(KMALLOC_SHIFT_LOW));
        assert_eq!(classify(8).map(SizeClass::size), Some(8));
    }

    #[test]
    fn classify_exact() {
        assert_eq!(classify(16).map(SizeClass::index), Some(4));
        assert_eq!(classify(64).map(SizeClass::index), Some(6));
        assert_eq!(classify(4096).map(SizeClass::index), Some(12));
        assert_eq!(classify(MAX_CLASS_SIZE).map(SizeClass::index), Some(21));
    }

    #[test]
    fn classify_round_up() {
        assert_eq!(classify(9).map(SizeClass::size), Some(16));
        assert_eq!(classify(65).map(SizeClass::size), Some(128));
        assert_eq!(classify(129).map(SizeClass::size), Some(192));
        assert_eq!(classify(193).map(SizeClass::size), Some(256));
        assert_eq!(classify(1024 * 1024 + 1).map(SizeClass::size), Some(MAX_CLASS_SIZE));
    }

    #[test]
    fn class_192_active_96_inactive() {
        assert_eq!(class_size(2), 192);
        assert_eq!(class_size(1), 0);
        assert!(SizeClass::from_index(1).is_none());
        assert_eq!(class_size(0), 0);
        assert_eq!(class_size(KMALLOC_SHIFT_HIGH + 1), 0);
    }

    #[test]
    fn classify_is_minimal_for_every_size_up_to_64k() {
        let classes = active_classes();
        for size in 1..=64 * 1024 {
            let class = classify(size).expect("in range");
            assert!(class.size() >= size, "class {} too small for {size}", class.size());
            let smaller = classes
                .iter()
                .filter(|c| c.size() < class.size())
                .any(|c| c.size() >= size);
            assert!(!smaller, "a smaller class also fits {size}");
        }
    }

    #[test]
    fn classify_minimal_at_power_of_two_edges() {
        for shift in 16..=KMALLOC_SHIFT_HIGH as u32 {
            let edge = 1usize << shift;
            assert_eq!(classify(edge).map(SizeClass::size), Some(edge));
            if edge < MAX_CLASS_SIZE {
                assert_eq!(classify(edge + 1).map(SizeClass::size), Some(edge * 2));
            }
        }
    }

    #[test]
    fn active_classes_monotonic() {
        let classes = active_classes();
        assert_eq!(classes.first().map(|c| c.size()), Some(KMALLOC_MIN_SIZE));
        assert_eq!(classes.last().map(|c| c.size()), Some(MAX_CLASS_SIZE));
        for pair in classes.windows(2) {
            assert!(pair[1].size() > pair[0].size());
            assert_eq!(pair[0].size() % KMALLOC_MIN_SIZE, 0);
        }
    }

    #[test]
    fn classify_is_const() {
        const CLASS: Option<SizeClass> = classify(100);
        assert_eq!(CLASS.map(SizeClass::size), Some(128));
    }
}
