// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! Conversion of SVF scan data into VME rows.
//!
//! VME rows hold bit 0 of a scan in the most significant bit of the first
//! byte, so every hexadecimal digit of an SVF literal is bit-reversed as it
//! is packed, starting from the least significant digit.

use crate::Result;

/// Number of bytes required to hold `n` bits.
pub fn bytes_for_bits(n: usize) -> usize {
    (n + 7) / 8
}

fn reverse_nibble(nibble: u8) -> u8 {
    nibble.reverse_bits() >> 4
}

/// Pack the hexadecimal `digits` of an SVF literal into a row of `bit_length` bits.
///
/// The literal is zero-padded on the left if it is shorter than `bit_length`.
/// Non-zero digits beyond `bit_length` are dropped with a warning.
pub fn parse_vector(digits: &str, bit_length: usize) -> Result<Vec<u8>> {
    let nbytes = bytes_for_bits(bit_length);
    let mut data = Vec::new();
    data.try_reserve_exact(nbytes)?;
    data.resize(nbytes, 0u8);

    let mut dropped = false;
    let nibbles = digits.chars().rev().filter_map(|c| c.to_digit(16)).map(|n| n as u8);
    for (k, nibble) in nibbles.enumerate() {
        match data.get_mut(k / 2) {
            Some(byte) if k % 2 == 0 => *byte |= reverse_nibble(nibble) << 4,
            Some(byte) => *byte |= reverse_nibble(nibble),
            None => dropped |= nibble != 0,
        }
    }
    if dropped {
        log::warn!("Scan data ({}) longer than {} bits, excess truncated", digits, bit_length);
    }
    Ok(data)
}

/// Render a row of `bit_length` bits back into SVF hexadecimal digits.
pub fn to_hex(data: &[u8], bit_length: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let ndigits = (bit_length + 3) / 4;
    (0..ndigits).rev().map(|k| {
        let byte = data.get(k / 2).copied().unwrap_or(0);
        let nibble = if k % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        HEX[reverse_nibble(nibble) as usize] as char
    }).collect()
}

/// One bounded piece of a cascaded scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Bit offset of the segment within the scan.
    pub offset: usize,
    /// Number of bits in the segment.
    pub length: usize,
}

impl Segment {
    /// The bytes of `row` covered by this segment.
    ///
    /// Segment offsets are always a multiple of 8.
    pub fn slice<'a>(&self, row: &'a [u8]) -> &'a [u8] {
        let end = (self.offset / 8 + bytes_for_bits(self.length)).min(row.len());
        let start = (self.offset / 8).min(end);
        &row[start..end]
    }
}

/// Split a scan of `length` bits into segments of at most `row_bits` bits.
///
/// Scans no longer than `row_bits` produce a single segment.
pub fn cascade(length: usize, row_bits: usize) -> Vec<Segment> {
    if length <= row_bits || row_bits == 0 {
        return vec![Segment { offset: 0, length }];
    }
    (0..length).step_by(row_bits)
               .map(|offset| Segment { offset, length: (length - offset).min(row_bits) })
               .collect()
}

/// TDI of the most recent data scan, kept to spot a TDO which reads it back.
#[derive(Clone, Debug, Default)]
pub struct PreviousTdi(Option<(usize, Vec<u8>)>);

impl PreviousTdi {
    pub fn set(&mut self, length: usize, tdi: Vec<u8>) {
        self.0 = Some((length, tdi));
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// Check whether `tdo` for a scan of `length` bits equals the previous TDI.
    pub fn matches(&self, length: usize, tdo: &[u8]) -> bool {
        match &self.0 {
            Some((prev_length, tdi)) => *prev_length == length && tdi[..] == tdo[..],
            None => false,
        }
    }
}
