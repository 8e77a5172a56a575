/// Alignment every allocation gets without asking. Bin slots of size `s` are
/// aligned to `min(s, MAX_ALIGN)`, free list blocks and huge allocations to
/// `MAX_ALIGN`. Anything stronger is served by aligned huge regions.
pub(crate) const MAX_ALIGN: usize = 16;

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of two.
///
/// ```text
/// align_up(13, 8) == 16
/// align_up(16, 8) == 16
/// align_up(17, 16) == 32
/// ```
#[inline]
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment`, which must be a power of
/// two. This is how we find the start of the page that contains a pointer.
#[inline]
pub(crate) const fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Smallest `n` such that `2^n >= value`. Zero and one both map to `0`.
#[inline]
pub(crate) const fn ceil_log2(value: usize) -> usize {
    if value <= 1 {
        0
    } else {
        (usize::BITS - (value - 1).leading_zeros()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        let alignment = 8;

        let mut alignments = Vec::new();

        for i in 0..10 {
            // (1..8), (9..16), (16..24) and so on.
            let sizes = (alignment * i + 1)..=(alignment * (i + 1));
            // Matching the sizes above, this would be: 8, 16, 24 and so on.
            let expected_alignment = alignment * (i + 1);
            alignments.push((sizes, expected_alignment));
        }

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align_up(size, alignment));
            }
        }

        assert_eq!(align_up(0, alignment), 0);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_down(4096 * 3 + 17, 4096), 4096 * 3);
    }

    #[test]
    fn test_ceil_log2() {
        let expected = [(0, 0), (1, 0), (2, 1), (3, 2), (4, 2), (5, 3), (8, 3), (9, 4), (128, 7)];
        for (value, log) in expected {
            assert_eq!(ceil_log2(value), log, "ceil_log2({value})");
        }
    }
}
