// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! Bit-level buffers used to build and take apart hardware transfers.
//!
//! Transfers are packed least-significant-bit first: bit `i` of a transfer
//! lives in bit `i % 8` of byte `i / 8`, and is shifted out `i`th.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not enough bits to extract required data.")]
    NotEnoughBits,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Convert a slice of bits to a Vec of u8s, least-significant-bit first.
///
/// If `bits` is not a multiple of 8, the final byte has the higher-order
/// bits set to 0.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((bits.len() + 7) / 8);
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (idx, bit) in chunk.iter().enumerate() {
            byte |= (*bit as u8) << idx;
        }
        bytes.push(byte);
    }
    bytes
}

/// Convert a slice of u8 to a Vec of bool, least-significant-bit first.
/// Reads exactly `n` bits; returns an error if n>bytes.len()*8.
pub fn bytes_to_bits(bytes: &[u8], n: usize) -> Result<Vec<bool>> {
    if n > bytes.len() * 8 {
        return Err(Error::NotEnoughBits);
    }
    Ok((0..n).map(|i| (bytes[i / 8] >> (i % 8)) & 1 == 1).collect())
}

/// Reverse the bit order of every byte, converting between the
/// most-significant-bit-first order of VME rows and the
/// least-significant-bit-first order of hardware transfers.
pub fn to_lsb_first(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.reverse_bits()).collect()
}

/// Concatenate bit strings, each given as `(bytes, bit length)`, first part first.
pub fn merge(parts: &[(&[u8], usize)]) -> Result<Vec<u8>> {
    let mut bits = Vec::with_capacity(parts.iter().map(|(_, n)| n).sum());
    for (bytes, n) in parts.iter() {
        bits.extend(bytes_to_bits(bytes, *n)?);
    }
    Ok(bits_to_bytes(&bits))
}

/// Recover the `data_len` bits which follow `head_len` bits in `combined`.
///
/// `combined` must hold at least `head_len + data_len + tail_len` bits.
pub fn extract(combined: &[u8], head_len: usize, data_len: usize, tail_len: usize)
    -> Result<Vec<u8>>
{
    let bits = bytes_to_bits(combined, head_len + data_len + tail_len)?;
    Ok(bits_to_bytes(&bits[head_len..head_len + data_len]))
}

/// Count the bits among the first `n` of `actual` that differ from `expected`,
/// considering only bits set in `mask` if one is given.
pub fn mismatches(actual: &[u8], expected: &[u8], mask: Option<&[u8]>, n: usize) -> Result<usize> {
    let actual = bytes_to_bits(actual, n)?;
    let expected = bytes_to_bits(expected, n)?;
    let care = match mask {
        Some(mask) => bytes_to_bits(mask, n)?,
        None => vec![true; n],
    };
    Ok((0..n).filter(|&i| care[i] && actual[i] != expected[i]).count())
}

/// Convenience macro for creating a &[bool] from &[u8] of 0/1.
#[cfg(test)]
macro_rules! bv {
    ($($x:expr),*) => {
        &[ $(($x != 0),)* ] as &[bool]
    }
}

#[test]
fn test_bits_to_bytes() {
    assert_eq!(bits_to_bytes(&[]),                                      vec![]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0]),                          vec![0x07]);
    assert_eq!(bits_to_bytes(bv![1, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 1]),  vec![0x27, 0x08]);
}

#[test]
fn test_bytes_to_bits() {
    assert_eq!(bytes_to_bits(&[0xFF], 1).unwrap(), bv![1]);
    assert_eq!(bytes_to_bits(&[0xFF, 0x01], 10).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1, 1, 0]);
    assert_eq!(bytes_to_bits(&[], 0).unwrap(), bv![]);
    assert!(bytes_to_bits(&[0xFF], 9).is_err());
}

#[test]
fn test_to_lsb_first() {
    assert_eq!(to_lsb_first(&[0x80, 0x01, 0xF0, 0xA5]), vec![0x01, 0x80, 0x0F, 0xA5]);
}

#[test]
fn test_merge() {
    // Two head bits, a 4 bit payload, and three tail bits.
    let (head, data, tail) = ([0b11u8], [0b1010u8], [0b001u8]);
    let merged = merge(&[(&head[..], 2), (&data[..], 4), (&tail[..], 3)]).unwrap();
    assert_eq!(merged, vec![0b0110_1011, 0b0]);
    let byte = [0xABu8];
    assert_eq!(merge(&[(&[0u8; 0][..], 0), (&byte[..], 8), (&[0u8; 0][..], 0)]).unwrap(), vec![0xAB]);
    assert!(merge(&[(&byte[..], 9)]).is_err());
}

#[test]
fn test_merge_extract() {
    let payloads: [(&[u8], usize); 4] = [
        (&[0x5A][..], 8),
        (&[0x3C, 0x01][..], 9),
        (&[0xDE, 0xAD, 0xBE, 0xEF][..], 32),
        (&[0x05][..], 3),
    ];
    let head = [0xA5u8, 0x0F];
    let tail = [0x77u8, 0x03];
    for &(payload, n) in payloads.iter() {
        for head_len in [0, 1, 7, 8, 13].iter().copied() {
            for tail_len in [0, 1, 5, 8, 10].iter().copied() {
                let merged = merge(&[(&head[..], head_len), (payload, n), (&tail[..], tail_len)]).unwrap();
                assert_eq!(merged.len(), (head_len + n + tail_len + 7) / 8);
                let out = extract(&merged, head_len, n, tail_len).unwrap();
                assert_eq!(bytes_to_bits(&out, n).unwrap(), bytes_to_bits(payload, n).unwrap());
            }
        }
    }
}

#[test]
fn test_extract_short() {
    assert!(extract(&[0xFF], 4, 4, 1).is_err());
}

#[test]
fn test_mismatches() {
    assert_eq!(mismatches(&[0xFF], &[0xFF], None, 8).unwrap(), 0);
    assert_eq!(mismatches(&[0x00], &[0xFF], None, 8).unwrap(), 8);
    assert_eq!(mismatches(&[0x00], &[0xFF], Some(&[0x0Fu8][..]), 8).unwrap(), 4);
    assert_eq!(mismatches(&[0x00], &[0xFF], Some(&[0x00u8][..]), 8).unwrap(), 0);
    // Bits beyond the length are never compared.
    assert_eq!(mismatches(&[0x07], &[0xFF], None, 3).unwrap(), 0);
}
