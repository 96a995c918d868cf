//! # Vectorized Payload Scans
//!
//! Equality scans and sums over packed payloads work on 64-bit chunks
//! instead of single elements. To find value `v` among `N`-bit elements
//! packed in a word `W`:
//!
//! 1. Broadcast: `P = (u64::MAX / ((1 << N) - 1)) * v` puts `v` in every
//!    element slot.
//! 2. `X = W ^ P` zeroes exactly the matching slots.
//! 3. `(X - L) & !X & H` with `L` = one in the low bit of each slot and
//!    `H` = one in the high bit of each slot is non-zero iff some slot is
//!    zero.
//!
//! The zero detection can report a carry-induced false positive at slot
//! boundaries, so a hit chunk is always re-verified element-wise. The
//! misaligned prefix and suffix of a range are scanned element-wise.
//!
//! On x86_64 the byte-sized widths (8, 16, 32 bits) take an SSE2
//! `cmpeq` path over 16-byte chunks; SSE2 is in the x86_64 baseline, so
//! no runtime detection is needed. Other architectures and the sub-byte
//! widths use the portable broadcast kernel.
//!
//! Sums of sub-byte widths use a parallel bit-count style reduction per
//! 64-bit chunk; byte widths sum element-wise.

use super::width::{self, Width};

/// `0b0001_0001…` pattern: a one in the low bit of every `bits`-wide slot.
#[inline]
fn low_bits(bits: usize) -> u64 {
    u64::MAX / ((1u64 << bits) - 1)
}

/// `v` replicated into every `bits`-wide slot of a word.
#[inline]
fn broadcast(value: i64, bits: usize) -> u64 {
    let mask = if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    low_bits(bits).wrapping_mul(value as u64 & mask)
}

/// Whether any `bits`-wide slot of `x` is zero. May report false
/// positives at slot boundaries; never misses.
#[inline]
fn has_zero_slot(x: u64, bits: usize) -> bool {
    let low = low_bits(bits);
    let high = low << (bits - 1);
    x.wrapping_sub(low) & !x & high != 0
}

/// First index in `start..end` holding `value`, scanning 64 bits at a
/// time. Caller has already ruled out width 0 and values wider than the
/// elements.
pub fn find(data: &[u8], w: Width, value: i64, start: usize, end: usize) -> Option<usize> {
    debug_assert!(start <= end);
    match w {
        Width::W0 => {
            if value == 0 && start < end {
                Some(start)
            } else {
                None
            }
        }
        Width::W64 => (start..end).find(|&i| width::get(data, w, i) == value),
        _ => {
            #[cfg(target_arch = "x86_64")]
            if matches!(w, Width::W8 | Width::W16 | Width::W32) && end - start >= 64 {
                return find_sse2(data, w, value, start, end);
            }
            find_broadcast(data, w, value, start, end)
        }
    }
}

/// Portable chunked scan for widths 1..=32.
fn find_broadcast(data: &[u8], w: Width, value: i64, start: usize, end: usize) -> Option<usize> {
    let bits = w.bits();
    let per_word = 64 / bits;
    let pattern = broadcast(value, bits);

    let mut i = start;

    // element-wise until the next 64-bit boundary
    while i < end && i % per_word != 0 {
        if width::get(data, w, i) == value {
            return Some(i);
        }
        i += 1;
    }

    while i + per_word <= end {
        let at = i * bits / 8;
        let word = u64::from_le_bytes(data[at..at + 8].try_into().unwrap());
        if has_zero_slot(word ^ pattern, bits) {
            // re-verify: the zero detection has boundary false positives
            for j in i..i + per_word {
                if width::get(data, w, j) == value {
                    return Some(j);
                }
            }
        }
        i += per_word;
    }

    while i < end {
        if width::get(data, w, i) == value {
            return Some(i);
        }
        i += 1;
    }

    None
}

#[cfg(target_arch = "x86_64")]
fn find_sse2(data: &[u8], w: Width, value: i64, start: usize, end: usize) -> Option<usize> {
    use std::arch::x86_64::*;

    let bytewidth = w.bits() / 8;
    let per_chunk = 16 / bytewidth;
    let first = start * bytewidth;
    let chunks = (end - start) / per_chunk;

    // SAFETY: every load reads 16 in-bounds bytes: chunk c spans byte
    // offsets [first + c*16, first + (c+1)*16) and c < chunks keeps the
    // upper end at most `end * bytewidth <= data.len()`. _mm_loadu_si128
    // has no alignment requirement.
    unsafe {
        let search = match w {
            Width::W8 => _mm_set1_epi8(value as i8),
            Width::W16 => _mm_set1_epi16(value as i16),
            Width::W32 => _mm_set1_epi32(value as i32),
            _ => unreachable!("sse2 scan only covers byte widths"),
        };

        for c in 0..chunks {
            let next = _mm_loadu_si128(data.as_ptr().add(first + c * 16) as *const __m128i);
            let compare = match w {
                Width::W8 => _mm_cmpeq_epi8(search, next),
                Width::W16 => _mm_cmpeq_epi16(search, next),
                Width::W32 => _mm_cmpeq_epi32(search, next),
                _ => unreachable!(),
            };
            let mask = _mm_movemask_epi8(compare);
            if mask != 0 {
                let lane = mask.trailing_zeros() as usize / bytewidth;
                return Some(start + c * per_chunk + lane);
            }
        }
    }

    // element-wise remainder
    let mut i = start + chunks * per_chunk;
    while i < end {
        if width::get(data, w, i) == value {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Append every index in `start..end` holding `value` to `out`. Same
/// chunked kernel as [`find`], re-verifying every element of a hit chunk.
pub fn find_all(
    data: &[u8],
    w: Width,
    value: i64,
    start: usize,
    end: usize,
    out: &mut impl Extend<usize>,
) {
    match w {
        Width::W0 => {
            if value == 0 {
                out.extend(start..end);
            }
        }
        Width::W64 => {
            out.extend((start..end).filter(|&i| width::get(data, w, i) == value));
        }
        _ => {
            let bits = w.bits();
            let per_word = 64 / bits;
            let pattern = broadcast(value, bits);

            let mut i = start;
            while i < end && i % per_word != 0 {
                if width::get(data, w, i) == value {
                    out.extend(std::iter::once(i));
                }
                i += 1;
            }
            while i + per_word <= end {
                let at = i * bits / 8;
                let word = u64::from_le_bytes(data[at..at + 8].try_into().unwrap());
                if has_zero_slot(word ^ pattern, bits) {
                    out.extend((i..i + per_word).filter(|&j| width::get(data, w, j) == value));
                }
                i += per_word;
            }
            out.extend((i..end).filter(|&j| width::get(data, w, j) == value));
        }
    }
}

/// Sum of `start..end`. Sub-byte widths reduce 64-bit chunks with the
/// parallel bit-count scheme; byte widths add element-wise.
pub fn sum(data: &[u8], w: Width, start: usize, end: usize) -> i64 {
    const M2: u64 = 0x3333_3333_3333_3333;
    const M4: u64 = 0x0F0F_0F0F_0F0F_0F0F;
    const H01: u64 = 0x0101_0101_0101_0101;

    let mut total: i64 = 0;
    match w {
        Width::W0 => 0,
        Width::W8 | Width::W16 | Width::W32 | Width::W64 => {
            for i in start..end {
                total = total.wrapping_add(width::get(data, w, i));
            }
            total
        }
        Width::W1 | Width::W2 | Width::W4 => {
            let bits = w.bits();
            let per_word = 64 / bits;

            let mut i = start;
            while i < end && i % per_word != 0 {
                total += width::get(data, w, i);
                i += 1;
            }

            while i + per_word <= end {
                let at = i * bits / 8;
                let mut a = u64::from_le_bytes(data[at..at + 8].try_into().unwrap());

                // horizontal add of the packed slots; each step doubles
                // the slot width until byte sums, then one multiply
                // gathers the bytes
                a = match w {
                    Width::W1 => a.count_ones() as u64,
                    Width::W2 => {
                        a = (a & M2) + ((a >> 2) & M2);
                        a = (a + (a >> 4)) & M4;
                        a.wrapping_mul(H01) >> 56
                    }
                    Width::W4 => {
                        a = (a & M4) + ((a >> 4) & M4);
                        a.wrapping_mul(H01) >> 56
                    }
                    _ => unreachable!(),
                };
                total += a as i64;
                i += per_word;
            }

            while i < end {
                total += width::get(data, w, i);
                i += 1;
            }
            total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(values: &[i64], w: Width) -> Vec<u8> {
        let bytes = (values.len() * w.bits() + 7) / 8 + 8;
        let mut data = vec![0u8; bytes];
        for (i, &v) in values.iter().enumerate() {
            width::set(&mut data, w, i, v);
        }
        data
    }

    fn brute_find(values: &[i64], v: i64, start: usize, end: usize) -> Option<usize> {
        (start..end).find(|&i| values[i] == v)
    }

    #[test]
    fn broadcast_patterns_match_known_constants() {
        assert_eq!(low_bits(2), 0x5555_5555_5555_5555);
        assert_eq!(low_bits(4), 0x1111_1111_1111_1111);
        assert_eq!(low_bits(8), 0x0101_0101_0101_0101);
        assert_eq!(low_bits(16), 0x0001_0001_0001_0001);
        assert_eq!(broadcast(3, 2), 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(broadcast(-1, 8), 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(broadcast(7, 8), 0x0707_0707_0707_0707);
    }

    #[test]
    fn zero_slot_detection_never_misses() {
        // one zero slot among set slots, at every position
        for slot in 0..8 {
            let mut word = u64::MAX;
            word &= !(0xFFu64 << (slot * 8));
            assert!(has_zero_slot(word, 8), "slot {}", slot);
        }
        assert!(!has_zero_slot(u64::MAX, 8));
        assert!(!has_zero_slot(0x0101_0101_0101_0101, 8));
    }

    #[test]
    fn find_agrees_with_brute_force_across_widths() {
        for w in [Width::W1, Width::W2, Width::W4, Width::W8, Width::W16, Width::W32] {
            let (_, hi) = w.bounds();
            let modulus = hi.min(100) + 1;
            let values: Vec<i64> = (0..200).map(|i| (i * 7 + 3) % modulus).collect();
            let data = pack(&values, w);

            for probe in [0, 1, modulus - 1, modulus / 2] {
                for (s, e) in [(0, 200), (3, 197), (63, 66), (100, 100)] {
                    assert_eq!(
                        find(&data, w, probe, s, e),
                        brute_find(&values, probe, s, e),
                        "width {:?} probe {} range {}..{}",
                        w,
                        probe,
                        s,
                        e
                    );
                }
            }
        }
    }

    #[test]
    fn find_handles_negative_byte_width_values() {
        let values: Vec<i64> = (0..100).map(|i| if i == 77 { -19 } else { i }).collect();
        for w in [Width::W8, Width::W16, Width::W32, Width::W64] {
            let data = pack(&values, w);
            assert_eq!(find(&data, w, -19, 0, 100), Some(77), "width {:?}", w);
            assert_eq!(find(&data, w, -20, 0, 100), None, "width {:?}", w);
        }
    }

    #[test]
    fn sse2_and_broadcast_paths_agree() {
        for w in [Width::W8, Width::W16, Width::W32] {
            let values: Vec<i64> = (0..300).map(|i| (i * 13 + 5) % 120).collect();
            let data = pack(&values, w);
            for probe in 0..120 {
                assert_eq!(
                    find(&data, w, probe, 0, 300),
                    find_broadcast(&data, w, probe, 0, 300),
                    "width {:?} probe {}",
                    w,
                    probe
                );
            }
        }
    }

    #[test]
    fn find_all_collects_every_match() {
        let values: Vec<i64> = (0..500)
            .map(|i| if i % 71 == 0 { 7 } else { i % 50 + 10 })
            .collect();
        for w in [Width::W4, Width::W8, Width::W16] {
            let data = pack(&values, w);
            let mut hits: Vec<usize> = Vec::new();
            find_all(&data, w, 7, 0, 500, &mut hits);
            let expected: Vec<usize> = (0..500).filter(|i| i % 71 == 0).collect();
            assert_eq!(hits, expected, "width {:?}", w);
        }
    }

    #[test]
    fn sum_matches_element_wise_fold() {
        for w in [
            Width::W0,
            Width::W1,
            Width::W2,
            Width::W4,
            Width::W8,
            Width::W16,
            Width::W32,
            Width::W64,
        ] {
            let (lo, hi) = w.bounds();
            let (lo, hi) = (lo.max(-500), hi.min(500));
            let span = hi - lo + 1;
            let values: Vec<i64> = (0..137).map(|i| lo + (i * 31) % span).collect();
            let data = pack(&values, w);

            for (s, e) in [(0, 137), (5, 131), (64, 128), (7, 7)] {
                let expected: i64 = values[s..e].iter().sum();
                assert_eq!(sum(&data, w, s, e), expected, "width {:?} {}..{}", w, s, e);
            }
        }
    }
}
