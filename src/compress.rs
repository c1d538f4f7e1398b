// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! Row compression for VME scan data.
//!
//! Each compressed row starts with a mode byte:
//!
//! * `0x00`: the row follows verbatim.
//! * `0x01` / `0x02`: runs of `0x00` / `0xFF` are written as a single byte
//!   followed by the ConvNumber count of further repeats.
//! * `0x03..=0xFE`: the row repeats every `mode` nibbles, and only the
//!   `(mode + 1) / 2` bytes holding the first period follow.
//! * `0xFF`: a key byte follows, then a bitstream where each row byte is
//!   either a `0` bit (equal to the key) or a `1` bit and the byte itself.

use std::cmp::Reverse;

use crate::vme::conv_number;

/// Compression applied to a single row.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Encoding {
    Store,
    ZeroRun,
    OnesRun,
    Nibble { period: usize },
    Key { key: u8 },
}

impl Encoding {
    /// Mode byte which introduces a row using this encoding.
    pub fn mode(&self) -> u8 {
        match self {
            Encoding::Store => 0x00,
            Encoding::ZeroRun => 0x01,
            Encoding::OnesRun => 0x02,
            Encoding::Nibble { period } => *period as u8,
            Encoding::Key { .. } => 0xFF,
        }
    }
}

/// Write `row` to `out` using whichever encoding produces the fewest bytes.
///
/// Returns the encoding that was used.
pub fn encode_row(row: &[u8], out: &mut Vec<u8>) -> Encoding {
    let (encoding, body) = choose(row);
    log::trace!("Compressed {} byte row with {:?} to {} bytes", row.len(), encoding, body.len() + 1);
    out.push(encoding.mode());
    out.extend_from_slice(&body);
    encoding
}

fn choose(row: &[u8]) -> (Encoding, Vec<u8>) {
    if row.len() < 3 {
        return (Encoding::Store, row.to_vec());
    }

    let zeros = bytecount::count(row, 0x00);
    let ones = bytecount::count(row, 0xFF);
    let (colour, run_encoding) = if zeros > ones {
        (0x00, Encoding::ZeroRun)
    } else {
        (0xFF, Encoding::OnesRun)
    };

    let runs = run_length(row, colour);
    let (encoding, body) = if runs.len() < row.len() {
        (run_encoding, runs)
    } else if let Some(period) = nibble_period(row) {
        return (Encoding::Nibble { period }, row[..(period + 1) / 2].to_vec());
    } else {
        (Encoding::Store, row.to_vec())
    };

    let (key, keyed) = key_stream(row);
    if keyed.len() < body.len() {
        (Encoding::Key { key }, keyed)
    } else {
        (encoding, body)
    }
}

/// Run-length encode `row`, coalescing runs of `colour`.
fn run_length(row: &[u8], colour: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len());
    let mut idx = 0;
    while idx < row.len() {
        let byte = row[idx];
        out.push(byte);
        idx += 1;
        if byte == colour {
            let repeats = row[idx..].iter().take_while(|&&b| b == colour).count();
            conv_number(&mut out, repeats as u64);
            idx += repeats;
        }
    }
    out
}

/// Find the period, in nibbles, with which `row` repeats, if it is short
/// enough to be worth storing.
///
/// Candidate periods come from the count of the rarest nibble value, which
/// must appear exactly once per period. An odd period is stored as the
/// whole bytes covering it.
fn nibble_period(row: &[u8]) -> Option<usize> {
    let nibbles: Vec<u8> = row.iter().flat_map(|b| [b >> 4, b & 0x0F]).collect();
    let mut counts = [0usize; 16];
    for nibble in nibbles.iter() {
        counts[*nibble as usize] += 1;
    }
    let occurrence = counts.iter().copied().filter(|&c| c > 0).min()?;
    if occurrence < 2 || nibbles.len() % occurrence != 0 {
        return None;
    }

    let period = nibbles.len() / occurrence;
    if period < 3 || period >= row.len() || period > 0xFE {
        return None;
    }
    let pattern = &nibbles[..period];
    if nibbles.chunks(period).all(|chunk| chunk == pattern) {
        Some(period)
    } else {
        None
    }
}

/// Packs bits most-significant-bit first.
struct BitWriter {
    out: Vec<u8>,
    byte: u8,
    used: u8,
}

impl BitWriter {
    fn new(out: Vec<u8>) -> Self {
        BitWriter { out, byte: 0, used: 0 }
    }

    fn push(&mut self, bit: bool) {
        self.byte = (self.byte << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.out.push(self.byte);
            self.byte = 0;
            self.used = 0;
        }
    }

    fn push_byte(&mut self, byte: u8) {
        for idx in (0..8).rev() {
            self.push((byte >> idx) & 1 == 1);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.out.push(self.byte << (8 - self.used));
        }
        self.out
    }
}

/// Encode `row` against its most frequent byte, returning the key and the
/// key byte followed by the selector bitstream.
fn key_stream(row: &[u8]) -> (u8, Vec<u8>) {
    let mut counts = [0usize; 256];
    for byte in row.iter() {
        counts[*byte as usize] += 1;
    }
    let key = (0..=255u8).max_by_key(|&b| (counts[b as usize], Reverse(b))).unwrap_or(0);

    let mut writer = BitWriter::new(vec![key]);
    for &byte in row.iter() {
        if byte == key {
            writer.push(false);
        } else {
            writer.push(true);
            writer.push_byte(byte);
        }
    }
    (key, writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vme::read_number;

    /// Decode a compressed row of `n` bytes.
    fn decode(stream: &[u8], n: usize) -> Vec<u8> {
        let (mode, data) = (stream[0], &stream[1..]);
        match mode {
            0x00 => data[..n].to_vec(),
            0x01 | 0x02 => {
                let colour = if mode == 0x01 { 0x00 } else { 0xFF };
                let mut out = Vec::new();
                let mut idx = 0;
                while out.len() < n {
                    let byte = data[idx];
                    idx += 1;
                    out.push(byte);
                    if byte == colour {
                        let (repeats, used) = read_number(&data[idx..]).unwrap();
                        idx += used;
                        out.extend(std::iter::repeat(colour).take(repeats as usize));
                    }
                }
                assert_eq!(idx, data.len());
                out
            }
            0xFF => {
                let key = data[0];
                let bits: Vec<bool> = data[1..].iter()
                    .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
                    .collect();
                let mut out = Vec::new();
                let mut idx = 0;
                while out.len() < n {
                    if bits[idx] {
                        let byte = bits[idx + 1..idx + 9].iter().fold(0u8, |a, &b| (a << 1) | b as u8);
                        out.push(byte);
                        idx += 9;
                    } else {
                        out.push(key);
                        idx += 1;
                    }
                }
                out
            }
            period => {
                let period = period as usize;
                let prefix = &data[..(period + 1) / 2];
                assert_eq!(prefix.len(), data.len());
                let nibbles: Vec<u8> = prefix.iter().flat_map(|b| vec![b >> 4, b & 0x0F]).take(period).collect();
                let stream: Vec<u8> = nibbles.iter().copied().cycle().take(2 * n).collect();
                stream.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect()
            }
        }
    }

    fn round_trip(row: &[u8]) -> Encoding {
        let mut out = Vec::new();
        let encoding = encode_row(row, &mut out);
        assert_eq!(decode(&out, row.len()), row, "{:?}", encoding);
        encoding
    }

    #[test]
    fn test_short_rows_stored() {
        let rows: [&[u8]; 4] = [&[], &[0x00], &[0x00, 0x00], &[0xFF, 0x12]];
        for row in rows.iter() {
            let mut out = Vec::new();
            assert_eq!(encode_row(row, &mut out), Encoding::Store);
            assert_eq!(out[0], 0x00);
            assert_eq!(&out[1..], *row);
        }
    }

    #[test]
    fn test_zero_run() {
        assert_eq!(round_trip(&[0x00; 3]), Encoding::ZeroRun);
        assert_eq!(round_trip(&[0x00; 1000]), Encoding::ZeroRun);
        let mut out = Vec::new();
        encode_row(&[0x00; 200], &mut out);
        assert_eq!(out, vec![0x01, 0x00, 0xC7, 0x01]);
    }

    #[test]
    fn test_ones_run() {
        assert_eq!(round_trip(&[0xFF; 3]), Encoding::OnesRun);
        assert_eq!(round_trip(&[0xFF; 64]), Encoding::OnesRun);
        let mut row = vec![0xFF; 40];
        row[10] = 0x12;
        row[30] = 0x00;
        assert_eq!(round_trip(&row), Encoding::OnesRun);
    }

    #[test]
    fn test_nibble_period() {
        let row: Vec<u8> = [0x12, 0x34].iter().copied().cycle().take(16).collect();
        assert_eq!(nibble_period(&row), Some(4));
        let encoding = round_trip(&row);
        assert_eq!(encoding, Encoding::Nibble { period: 4 });
        assert_eq!(encoding.mode(), 4);

        // Aperiodic data and patterns as long as the row are rejected.
        assert_eq!(nibble_period(&[0x12, 0x34, 0x56, 0x12, 0x34, 0x57]), None);
        assert_eq!(nibble_period(&[0x12, 0x34, 0x56, 0x78]), None);
    }

    #[test]
    fn test_odd_nibble_period() {
        let row: Vec<u8> = [0x12, 0x31, 0x23].iter().copied().cycle().take(12).collect();
        assert_eq!(nibble_period(&row), Some(3));
        assert_eq!(round_trip(&row), Encoding::Nibble { period: 3 });
        let mut out = Vec::new();
        encode_row(&row, &mut out);
        assert_eq!(out, vec![0x03, 0x12, 0x31]);
    }

    #[test]
    fn test_key() {
        let mut row = vec![0x5A; 64];
        row[3] = 0x11;
        row[40] = 0x22;
        assert_eq!(round_trip(&row), Encoding::Key { key: 0x5A });
        let mut out = Vec::new();
        encode_row(&row, &mut out);
        // 62 key bits and two 9 bit literals.
        assert_eq!(out.len(), 2 + (62 + 18 + 7) / 8);
    }

    #[test]
    fn test_store() {
        let row: Vec<u8> = (0x10..0x30).collect();
        assert_eq!(round_trip(&row), Encoding::Store);
    }

    #[test]
    fn test_mixed_rows_round_trip() {
        let rows: Vec<Vec<u8>> = vec![
            vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00],
            vec![0xFF, 0xFE, 0xFF, 0xFF, 0xFF, 0x00, 0xFF],
            (0..100).map(|i| if i % 7 == 0 { 0x3C } else { 0xA0 }).collect(),
            (0..50).map(|i| (i * 37) as u8).collect(),
        ];
        for row in rows.iter() {
            round_trip(row);
        }
    }
}
