//! # Prefix-varint encoding and decoding
//!
//! This file implements the encoding described here:
//! <https://github.com/WebAssembly/design/issues/601#issuecomment-196022303>
//!
//! Node pages use it for element lengths and child page ids, so the length of every field is known
//! from its first byte.

fn unaligned_load_u64(p: &[u8]) -> u64 {
  let mut array = [0u8; 8];
  let len = p.len().min(8);
  array[..len].copy_from_slice(&p[..len]);
  u64::from_le_bytes(array)
}

fn length(initial: u8) -> usize {
  1 + (initial as u32 | 0x100).trailing_zeros() as usize
}

/// Returns the number of bytes [`encode`] produces for `x`.
pub fn encoded_len(x: u64) -> usize {
  let bits = 64 - (x | 1).leading_zeros() as usize;
  if bits > 56 {
    9
  } else {
    1 + (bits - 1) / 7
  }
}

/// Decodes an unsigned 64-bit integer from the front of a byte slice.
///
/// Returns the value together with the number of bytes it occupied, or `None` if the slice ends
/// before the encoded value does.
pub fn decode(p: &[u8]) -> Option<(u64, usize)> {
  let length = length(*p.first()?);
  if p.len() < length {
    return None;
  }
  let value = if length < 9 {
    let unused = 64 - 8 * length as u32;
    unaligned_load_u64(&p[..length]) << unused >> (unused + length as u32)
  } else {
    unaligned_load_u64(&p[1..])
  };
  Some((value, length))
}

/// Decodes a value from the front of `*input` and advances the slice past it.
pub fn take(input: &mut &[u8]) -> Option<u64> {
  let (value, length) = decode(input)?;
  *input = &input[length..];
  Some(value)
}

/// Encodes an unsigned 64-bit integer into a byte vector, using the prefix-varint format.
pub fn encode(x: u64, output: &mut Vec<u8>) {
  let bytes = encoded_len(x);
  if bytes == 9 {
    output.push(0);
    output.extend_from_slice(&x.to_le_bytes());
    return;
  }
  let tagged = (x << bytes) | (1 << (bytes - 1));
  output.extend_from_slice(&tagged.to_le_bytes()[..bytes]);
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::Rng;

  #[test]
  fn test_unaligned_load_u64() {
    assert_eq!(unaligned_load_u64(&[0x01, 0x02, 0x03]), 0x30201);
    assert_eq!(unaligned_load_u64(&[0xFF; 16]), 0xFFFFFFFFFFFFFFFF);
    assert_eq!(unaligned_load_u64(&[]), 0);
  }

  #[test]
  fn test_length() {
    let test_cases = vec![(0b00000001, 1), (0b00000010, 2), (0b01000000, 7), (0b10000000, 8), (0b00000000, 9)];
    for (initial, expected) in test_cases {
      assert_eq!(length(initial), expected, "Initial byte: {:08b}", initial);
    }
  }

  #[test]
  fn test_specific_encodings() {
    let test_cases = vec![
      (0, vec![0x01]),
      (1, vec![0x03]),
      (127, vec![0xFF]),
      (128, vec![0x02, 0x02]),
      (16383, vec![0xFE, 0xFF]),
      (16384, vec![0x04, 0x00, 0x02]),
      (u64::MAX, vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
    ];
    for (decoded, encoded) in test_cases {
      let mut output = Vec::new();
      encode(decoded, &mut output);
      assert_eq!(output, encoded, "Failed for decoded value: {}", decoded);
      assert_eq!(encoded_len(decoded), encoded.len());
      assert_eq!(decode(&encoded), Some((decoded, encoded.len())));
    }
  }

  #[test]
  fn test_decode_ignores_trailing_bytes() {
    // A one-byte value followed by unrelated data must not pick up the following bytes.
    assert_eq!(decode(&[0x03, 0xFF, 0xFF]), Some((1, 1)));
    assert_eq!(decode(&[0x02, 0x02, 0xAA]), Some((128, 2)));
  }

  #[test]
  fn test_decode_truncated() {
    assert_eq!(decode(&[]), None);
    assert_eq!(decode(&[0x04, 0x00]), None);
    assert_eq!(decode(&[0x00, 0xFF, 0xFF]), None);
  }

  #[test]
  fn test_take_sequence() {
    let values = [3u64, 300, 1 << 40, u64::MAX, 0];
    let mut encoded = Vec::new();
    for &value in &values {
      encode(value, &mut encoded);
    }
    let mut input = &encoded[..];
    for &value in &values {
      assert_eq!(take(&mut input), Some(value));
    }
    assert!(input.is_empty());
    assert_eq!(take(&mut input), None);
  }

  #[test]
  fn test_round_trip_random_values() {
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
      let value: u64 = rng.gen::<u64>() >> rng.gen_range(0..64);
      let mut encoded = Vec::new();
      encode(value, &mut encoded);
      assert_eq!(decode(&encoded), Some((value, encoded.len())), "Encoded bytes: {:?}", encoded);
    }
  }
}
