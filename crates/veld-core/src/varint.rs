//! Width-tagged variable-length integers.
//!
//! The top two bits of the first byte select the total encoded width:
//! tag 0 → 1 byte, tag 1 → 2 bytes, tag 2 → 4 bytes, tag 3 → 8 bytes.
//! The first byte contributes its low six bits as the least-significant
//! value bits; the remaining bytes follow little-endian. Capacities are
//! therefore 6, 14, 30, and 62 bits.

/// Largest value a 1-byte encoding can carry.
pub const MAX_1: u64 = (1 << 6) - 1;
/// Largest value a 2-byte encoding can carry.
pub const MAX_2: u64 = (1 << 14) - 1;
/// Largest value a 4-byte encoding can carry.
pub const MAX_4: u64 = (1 << 30) - 1;
/// Largest encodable value (8-byte encoding).
pub const MAX_8: u64 = (1 << 62) - 1;

/// Number of bytes the minimal encoding of `value` occupies.
pub fn encoded_len(value: u64) -> usize {
    if value <= MAX_1 {
        1
    } else if value <= MAX_2 {
        2
    } else if value <= MAX_4 {
        4
    } else {
        8
    }
}

/// Append the minimal encoding of `value` to `out`.
///
/// Values above [`MAX_8`] cannot be represented; reaching one is an
/// invariant violation in the caller.
pub fn encode(value: u64, out: &mut Vec<u8>) {
    assert!(value <= MAX_8, "varint value {value} exceeds 62 bits");
    let (tag, width): (u8, usize) = match encoded_len(value) {
        1 => (0, 1),
        2 => (1, 2),
        4 => (2, 4),
        _ => (3, 8),
    };
    out.push((tag << 6) | (value & 0x3f) as u8);
    let mut rest = value >> 6;
    for _ in 1..width {
        out.push((rest & 0xff) as u8);
        rest >>= 8;
    }
}

/// Decode one varint from the front of `buf`.
///
/// Returns `None` when `buf` holds fewer bytes than the tagged width
/// announces (the caller should read more), otherwise the value and the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let width = 1usize << (first >> 6);
    if buf.len() < width {
        return None;
    }
    let mut value = (first & 0x3f) as u64;
    for (i, byte) in buf[1..width].iter().enumerate() {
        value |= (*byte as u64) << (6 + 8 * i);
    }
    Some((value, width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(value: u64) -> (u64, usize) {
        let mut buf = Vec::new();
        encode(value, &mut buf);
        assert_eq!(buf.len(), encoded_len(value));
        decode(&buf).expect("complete encoding must decode")
    }

    #[test]
    fn width_boundaries() {
        for value in [0, 1, MAX_1, MAX_1 + 1, MAX_2, MAX_2 + 1, MAX_4, MAX_4 + 1, MAX_8] {
            let (decoded, consumed) = round_trip(value);
            assert_eq!(decoded, value);
            assert_eq!(consumed, encoded_len(value));
        }
    }

    #[test]
    fn truncated_input_asks_for_more() {
        let mut buf = Vec::new();
        encode(MAX_2, &mut buf);
        assert_eq!(buf.len(), 2);
        assert_eq!(decode(&buf[..1]), None);
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn wide_encodings_of_small_values_decode() {
        // A non-minimal 8-byte encoding of 5 is accepted by the decoder.
        let buf = [(3 << 6) | 5, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode(&buf), Some((5, 8)));
    }

    #[test]
    #[should_panic]
    fn oversized_value_panics() {
        let mut buf = Vec::new();
        encode(MAX_8 + 1, &mut buf);
    }

    proptest! {
        #[test]
        fn prop_round_trip(value in 0..=MAX_8) {
            let (decoded, consumed) = round_trip(value);
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, encoded_len(value));
        }

        #[test]
        fn prop_decode_ignores_trailing_bytes(value in 0..=MAX_8, tail in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut buf = Vec::new();
            encode(value, &mut buf);
            let width = buf.len();
            buf.extend_from_slice(&tail);
            prop_assert_eq!(decode(&buf), Some((value, width)));
        }
    }
}
