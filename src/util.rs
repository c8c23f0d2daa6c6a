use core::mem::size_of;

pub fn align_down(x: usize, alignment: usize) -> usize {
    x & !(alignment - 1)
}

pub fn align_up(x: usize, alignment: usize) -> usize {
    x.wrapping_add(alignment.wrapping_sub(1)) & !(alignment - 1)
}

/// Returns `alignment` normalized to a usable power of two, treating `0` as `1`.
pub fn normalize_alignment(alignment: usize) -> Option<usize> {
    match alignment {
        0 => Some(1),
        a if a.is_power_of_two() => Some(a),
        _ => None,
    }
}

pub fn bit_vector_get_bit(buf: &[u32], index: usize) -> bool {
    let vec_index = index / 32;
    let bit_index = index % 32;

    ((buf[vec_index] >> bit_index) & 1) != 0
}

pub fn bit_vector_set_bit(buf: &mut [u32], index: usize, value: bool) {
    let vec_index = index / 32;
    let bit_index = index % 32;

    if value {
        buf[vec_index] |= 1 << bit_index;
    } else {
        buf[vec_index] &= !(1 << bit_index);
    }
}

macro_rules! bitvector_op {
    ($name: ident, $op: expr, $opf: expr) => {
        pub fn $name(mut buf: &mut [u32], index: usize, mut count: usize) {
            if count == 0 {
                return;
            }

            let vec_index = index / 32;
            let bit_index = index % 32;

            buf = &mut buf[vec_index..];

            const FILL_MASK: u32 = u32::MAX;

            let first_n_bits = (32 - bit_index).min(count);

            buf[0] = $op(
                buf[0],
                (FILL_MASK >> (32 - first_n_bits as u32)) << bit_index as u32,
            );

            count -= first_n_bits;

            while count >= 32 {
                buf = &mut buf[1..];
                buf[0] = $opf(buf[0], FILL_MASK);
                count -= 32;
            }

            if count != 0 {
                buf = &mut buf[1..];
                buf[0] = $op(buf[0], FILL_MASK >> (32 - count as u32));
            }
        }
    };
}

bitvector_op!(bit_vector_fill, |x, y| x | y, |_, x| x);
bitvector_op!(bit_vector_clear, |x: u32, y: u32| x & !y, |_, y: u32| !y);

/// Index of the first bit equal to `value` at or after `start`, or `buf.len() * 32` if none.
pub fn bit_vector_index_of(buf: &[u32], start: usize, value: bool) -> usize {
    let vec_index = start / 32;
    let bit_index = start % 32;

    let mut p = &buf[vec_index..];
    const FILL_MASK: u32 = u32::MAX;

    let flip_mask = if value { 0 } else { FILL_MASK };

    let mut bits = (p[0] ^ flip_mask) & (FILL_MASK << bit_index as u32);

    loop {
        if bits != 0 {
            return ((p.as_ptr() as usize - buf.as_ptr() as usize) / size_of::<u32>()) * 32
                + bits.trailing_zeros() as usize;
        }

        p = &p[1..];

        if p.is_empty() {
            return buf.len() * 32;
        }

        bits = p[0] ^ flip_mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(37, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_down(127, 64), 64);
        assert_eq!(normalize_alignment(0), Some(1));
        assert_eq!(normalize_alignment(16), Some(16));
        assert_eq!(normalize_alignment(24), None);
    }

    #[test]
    fn fill_and_clear_across_words() {
        let mut bits = [0u32; 4];
        bit_vector_fill(&mut bits, 30, 40);

        assert!(!bit_vector_get_bit(&bits, 29));
        assert!(bit_vector_get_bit(&bits, 30));
        assert!(bit_vector_get_bit(&bits, 69));
        assert!(!bit_vector_get_bit(&bits, 70));
        assert_eq!(bits[1], u32::MAX);

        bit_vector_clear(&mut bits, 31, 38);
        assert!(bit_vector_get_bit(&bits, 30));
        assert!(!bit_vector_get_bit(&bits, 31));
        assert!(!bit_vector_get_bit(&bits, 68));
        assert!(bit_vector_get_bit(&bits, 69));
    }

    #[test]
    fn fill_exact_words() {
        let mut bits = [0u32; 3];
        bit_vector_fill(&mut bits, 0, 64);
        assert_eq!(bits, [u32::MAX, u32::MAX, 0]);
    }

    #[test]
    fn index_of_finds_first_match() {
        let mut bits = [0u32; 3];
        bit_vector_set_bit(&mut bits, 75, true);

        assert_eq!(bit_vector_index_of(&bits, 0, true), 75);
        assert_eq!(bit_vector_index_of(&bits, 75, true), 75);
        assert_eq!(bit_vector_index_of(&bits, 76, true), 96);
        assert_eq!(bit_vector_index_of(&bits, 75, false), 76);
    }
}
