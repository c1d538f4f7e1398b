// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! VME bytecode output.
//!
//! A VME file is a flat stream of single byte opcodes, each followed by its
//! operands. Numbers are written with [`conv_number`] and scan data as rows,
//! optionally compressed with [`compress::encode_row`].

use std::io::Write;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{compress, scandata};
use crate::{Backend, Command, Result, RunTestStep, Scan, ScanKind, ScanNode, Summary, TrailerKind};

/// Version tag at the start of every VME file.
pub const VERSION: &[u8] = b"____13";

/// Mode byte following the version tag for compressed files.
pub const MODE_COMPRESSED: u8 = 0xF1;

/// Mode byte following the version tag for uncompressed files.
pub const MODE_FULL: u8 = 0xF2;

/// SETFLOW/RESETFLOW operand enabling cascaded scans.
pub const FLOW_CASCADE: u64 = 0x0002;

/// VME opcodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
pub enum Opcode {
    ENDDATA   = 0x00,
    RUNTEST   = 0x01,
    ENDDR     = 0x02,
    ENDIR     = 0x03,
    ENDSTATE  = 0x04,
    TRST      = 0x05,
    HIR       = 0x06,
    TIR       = 0x07,
    HDR       = 0x08,
    TDR       = 0x09,
    ISPEN     = 0x0A,
    FREQUENCY = 0x0B,
    STATE     = 0x10,
    SIR       = 0x11,
    SDR       = 0x12,
    TDI       = 0x13,
    TDO       = 0x14,
    MASK      = 0x15,
    XSDR      = 0x16,
    XTDI      = 0x17,
    XTDO      = 0x18,
    MEM       = 0x19,
    WAIT      = 0x1A,
    TCK       = 0x1B,
    SETFLOW   = 0x30,
    RESETFLOW = 0x31,
    REPEAT    = 0x33,
    CRC       = 0x47,
    CMASK     = 0x48,
    RMASK     = 0x49,
    READ      = 0x50,
    VENDOR    = 0x56,
    LOOP      = 0x58,
    ENDLOOP   = 0x59,
    VUES      = 0x61,
    DMASK     = 0x62,
    COMMENT   = 0x63,
    HEADER    = 0x64,
    FILE_CRC  = 0x65,
    LCOUNT    = 0x66,
    LDELAY    = 0x67,
    LSDR      = 0x68,
    CONTINUE  = 0x70,
    LVDS      = 0x71,
    ENDVME    = 0x7F,
}

impl From<TrailerKind> for Opcode {
    fn from(kind: TrailerKind) -> Opcode {
        match kind {
            TrailerKind::HIR => Opcode::HIR,
            TrailerKind::TIR => Opcode::TIR,
            TrailerKind::HDR => Opcode::HDR,
            TrailerKind::TDR => Opcode::TDR,
        }
    }
}

/// Append `n` to `out` seven bits at a time, least significant group first,
/// with the top bit of each byte set when more groups follow.
pub fn conv_number(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a number written by [`conv_number`] from the start of `data`.
///
/// Returns the number and how many bytes it occupied, or None if `data` ends
/// before the number does.
pub fn read_number(data: &[u8]) -> Option<(u64, usize)> {
    let mut n = 0u64;
    for (idx, byte) in data.iter().enumerate().take(10) {
        n |= ((byte & 0x7F) as u64) << (7 * idx);
        if byte & 0x80 == 0 {
            return Some((n, idx + 1));
        }
    }
    None
}

const CRC_TABLE: [u16; 16] = [
    0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401,
    0xA001, 0x6C00, 0x7800, 0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
];

/// CRC16 of a VME file, computed a nibble at a time over bit-reversed bytes.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, byte| {
        let byte = byte.reverse_bits();
        let entry = CRC_TABLE[(crc & 0xF) as usize];
        let crc = ((crc >> 4) & 0x0FFF) ^ entry ^ CRC_TABLE[(byte & 0xF) as usize];
        let entry = CRC_TABLE[(crc & 0xF) as usize];
        ((crc >> 4) & 0x0FFF) ^ entry ^ CRC_TABLE[(byte >> 4) as usize]
    })
}

/// Prefix a complete VME file with FILE_CRC and its big-endian CRC16.
pub fn stamp_crc(data: &[u8]) -> Vec<u8> {
    let crc = crc16(data);
    let mut out = Vec::with_capacity(data.len() + 3);
    out.push(Opcode::FILE_CRC.into());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Backend which writes commands as VME bytecode to a writer.
pub struct VmeWriter<W: Write> {
    inner: W,
    compress: bool,
    capture: Option<Vec<u8>>,
    scans: usize,
}

impl<W: Write> VmeWriter<W> {
    /// Create a new VmeWriter, writing the version tag and mode byte to `inner`.
    ///
    /// When `compress` is set, scan rows are compressed.
    pub fn new(mut inner: W, compress: bool) -> Result<Self> {
        inner.write_all(VERSION)?;
        inner.write_all(&[if compress { MODE_COMPRESSED } else { MODE_FULL }])?;
        Ok(VmeWriter { inner, compress, capture: None, scans: 0 })
    }

    /// Consume this writer, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write bytes either to the loop capture buffer or straight to the output.
    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        match self.capture.as_mut() {
            Some(capture) => capture.extend_from_slice(bytes),
            None => self.inner.write_all(bytes)?,
        }
        Ok(())
    }

    /// Append a scan data row, compressing it if enabled.
    fn row(&self, out: &mut Vec<u8>, row: &[u8]) {
        if self.compress {
            compress::encode_row(row, out);
        } else {
            out.extend_from_slice(row);
        }
    }

    fn encode_scan(&self, scan: &Scan, out: &mut Vec<u8>) {
        let node = &scan.node;
        let opcode = match (scan.kind, scan.xtdo) {
            (ScanKind::Instruction, _) => Opcode::SIR,
            (ScanKind::Data, false) => Opcode::SDR,
            (ScanKind::Data, true) => Opcode::XSDR,
        };

        for (idx, segment) in scan.segments.iter().enumerate() {
            // Every segment but the last runs in cascade mode.
            let cascade = idx + 1 < scan.segments.len();
            if cascade {
                out.push(Opcode::SETFLOW.into());
                conv_number(out, FLOW_CASCADE);
            }

            out.push(opcode.into());
            conv_number(out, segment.length as u64);

            if let Some(tdi) = &node.tdi {
                out.push(Opcode::TDI.into());
                self.row(out, segment.slice(tdi));
            }
            if let Some(tdo) = &node.tdo {
                if scan.xtdo {
                    out.push(Opcode::XTDO.into());
                } else {
                    out.push(Opcode::TDO.into());
                    self.row(out, segment.slice(tdo));
                }
                if let Some(mask) = &node.mask {
                    out.push(Opcode::MASK.into());
                    self.row(out, segment.slice(mask));
                }
            }
            let aux = [
                (Opcode::CRC, &node.crc),
                (Opcode::CMASK, &node.cmask),
                (Opcode::READ, &node.read),
                (Opcode::RMASK, &node.rmask),
                (Opcode::DMASK, &node.dmask),
            ];
            for (opcode, data) in aux.iter() {
                if let Some(data) = data {
                    out.push((*opcode).into());
                    self.row(out, segment.slice(data));
                }
            }
            out.push(Opcode::CONTINUE.into());

            if cascade {
                out.push(Opcode::RESETFLOW.into());
                conv_number(out, FLOW_CASCADE);
            }
        }
    }

    /// Header and trailer data is always stored uncompressed.
    fn encode_trailer(kind: TrailerKind, node: &ScanNode, out: &mut Vec<u8>) {
        out.push(Opcode::from(kind).into());
        conv_number(out, node.length as u64);
        if node.length == 0 {
            return;
        }
        let nbytes = scandata::bytes_for_bits(node.length);
        let vectors = [(Opcode::TDI, &node.tdi), (Opcode::TDO, &node.tdo), (Opcode::MASK, &node.mask)];
        for (opcode, data) in vectors.iter() {
            if let Some(data) = data {
                out.push((*opcode).into());
                out.extend(data.iter().take(nbytes));
            }
        }
        out.push(Opcode::CONTINUE.into());
    }

    fn encode_runtest(steps: &[RunTestStep], out: &mut Vec<u8>) {
        for step in steps.iter() {
            match step {
                RunTestStep::State(state) => {
                    out.push(Opcode::STATE.into());
                    out.push((*state).into());
                }
                RunTestStep::Tck(ticks) => {
                    out.push(Opcode::TCK.into());
                    conv_number(out, *ticks as u64);
                }
                RunTestStep::Wait(wait) => {
                    out.push(Opcode::WAIT.into());
                    conv_number(out, wait.word() as u64);
                }
            }
        }
    }

    fn encode_text(text: &str, out: &mut Vec<u8>) {
        out.push(Opcode::COMMENT.into());
        conv_number(out, text.len() as u64);
        out.extend_from_slice(text.as_bytes());
    }

    fn begin_loop(&mut self, count: usize) -> Result<()> {
        let mut out = vec![Opcode::LCOUNT.into()];
        conv_number(&mut out, count as u64);
        self.emit(&out)?;
        if self.capture.is_some() {
            log::warn!("LOOP started while another is being captured, nesting it");
        } else {
            self.capture = Some(Vec::new());
        }
        Ok(())
    }

    fn end_loop(&mut self) -> Result<()> {
        let mut capture = match self.capture.take() {
            Some(capture) => capture,
            None => {
                log::warn!("ENDLOOP without LOOP, ignoring");
                return Ok(());
            }
        };
        capture.push(Opcode::ENDLOOP.into());
        let mut out = Vec::with_capacity(capture.len() + 4);
        conv_number(&mut out, capture.len() as u64);
        out.extend_from_slice(&capture);
        self.emit(&out)
    }
}

impl<W: Write> Backend for VmeWriter<W> {
    fn execute(&mut self, command: &Command) -> Result<()> {
        let mut out = Vec::new();
        match command {
            Command::Header(text) => {
                let text: String = text.chars()
                    .map(|c| if c == '\t' || c == '\r' { ' ' } else { c })
                    .collect();
                out.push(Opcode::COMMENT.into());
                conv_number(&mut out, text.len() as u64 + 1);
                out.extend_from_slice(text.as_bytes());
                out.push(0);
            }
            Command::Memory(bits) => {
                out.push(Opcode::MEM.into());
                conv_number(&mut out, *bits as u64);
            }
            Command::Vendor(vendor) => {
                out.push(Opcode::VENDOR.into());
                out.push((*vendor).into());
            }
            Command::Comment(text) => Self::encode_text(text, &mut out),
            Command::State(state) => {
                out.push(Opcode::STATE.into());
                out.push((*state).into());
            }
            Command::EndIR(state) => {
                out.push(Opcode::ENDIR.into());
                out.push((*state).into());
            }
            Command::EndDR(state) => {
                out.push(Opcode::ENDDR.into());
                out.push((*state).into());
            }
            Command::Scan(scan) => {
                self.scans += 1;
                self.encode_scan(scan, &mut out);
            }
            Command::Trailer(kind, node) => Self::encode_trailer(*kind, node, &mut out),
            Command::RunTest(steps) => Self::encode_runtest(steps, &mut out),
            Command::Frequency(hz) => {
                out.push(Opcode::FREQUENCY.into());
                conv_number(&mut out, *hz as u64);
            }
            Command::LoopBegin(count) => return self.begin_loop(*count),
            Command::LoopEnd => return self.end_loop(),
            Command::Lvds(pairs) => {
                out.push(Opcode::LVDS.into());
                conv_number(&mut out, pairs.len() as u64);
                for (a, b) in pairs.iter() {
                    conv_number(&mut out, *a as u64);
                    conv_number(&mut out, *b as u64);
                }
            }
            Command::Trst(high) => {
                out.push(Opcode::TRST.into());
                out.push(*high as u8);
            }
            Command::IspEn(high) => {
                out.push(Opcode::ISPEN.into());
                out.push(*high as u8);
            }
            Command::VerifyUsercode => out.push(Opcode::VUES.into()),
        }
        self.emit(&out)
    }

    fn finish(&mut self) -> Result<Summary> {
        if self.capture.is_some() {
            log::warn!("LOOP still open at end of output, closing it");
            self.end_loop()?;
        }
        self.emit(&[Opcode::ENDVME.into()])?;
        self.inner.flush()?;
        Ok(Summary { scans: self.scans, verified: 0, failures: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;
    use crate::{scandata::{cascade, parse_vector}, State, Vendor, Wait};

    fn writer(compress: bool) -> VmeWriter<Vec<u8>> {
        VmeWriter::new(Vec::new(), compress).unwrap()
    }

    /// Bytes written after the version tag and mode byte.
    fn body(writer: VmeWriter<Vec<u8>>) -> Vec<u8> {
        writer.into_inner()[VERSION.len() + 1..].to_vec()
    }

    fn op(opcode: Opcode) -> u8 {
        opcode.into()
    }

    fn scan(kind: ScanKind, length: usize, tdi: &str, tdo: Option<&str>, row_bits: usize) -> Scan {
        Scan {
            kind,
            node: ScanNode {
                length,
                tdi: Some(parse_vector(tdi, length).unwrap()),
                tdo: tdo.map(|tdo| parse_vector(tdo, length).unwrap()),
                ..Default::default()
            },
            xtdo: false,
            segments: cascade(length, row_bits),
        }
    }

    #[test]
    fn test_conv_number() {
        let cases: [(u64, &[u8]); 5] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16383, &[0xFF, 0x7F]),
            (16384, &[0x80, 0x80, 0x01]),
        ];
        for (n, expected) in cases.iter() {
            let mut out = Vec::new();
            conv_number(&mut out, *n);
            assert_eq!(&out[..], *expected);
            assert_eq!(read_number(&out), Some((*n, expected.len())));
        }
        assert_eq!(read_number(&[0x80]), None);
    }

    #[test]
    fn test_header() {
        let w = writer(true);
        assert_eq!(w.into_inner(), b"____13\xF1".to_vec());
        let w = writer(false);
        assert_eq!(w.into_inner(), b"____13\xF2".to_vec());
    }

    #[test]
    fn test_simple_commands() {
        let mut w = writer(true);
        w.execute(&Command::Header("a\tb".to_string())).unwrap();
        w.execute(&Command::Memory(200)).unwrap();
        w.execute(&Command::Vendor(Vendor::Lattice)).unwrap();
        w.execute(&Command::State(State::IDLE)).unwrap();
        w.execute(&Command::EndDR(State::DRPAUSE)).unwrap();
        w.execute(&Command::Frequency(1_000_000)).unwrap();
        w.execute(&Command::Trst(true)).unwrap();
        w.execute(&Command::VerifyUsercode).unwrap();
        w.finish().unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::COMMENT), 4, b'a', b' ', b'b', 0,
            op(Opcode::MEM), 0xC8, 0x01,
            op(Opcode::VENDOR), 0x01,
            op(Opcode::STATE), 0x01,
            op(Opcode::ENDDR), 0x03,
            op(Opcode::FREQUENCY), 0xC0, 0x84, 0x3D,
            op(Opcode::TRST), 0x01,
            op(Opcode::VUES),
            op(Opcode::ENDVME),
        ]);
    }

    #[test]
    fn test_runtest() {
        let mut w = writer(true);
        w.execute(&Command::RunTest(vec![
            RunTestStep::State(State::IDLE),
            RunTestStep::Tck(100),
            RunTestStep::Wait(Wait::Millis(5)),
        ])).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::STATE), 0x01,
            op(Opcode::TCK), 100,
            op(Opcode::WAIT), 0x85, 0x80, 0x02,
        ]);
    }

    #[test]
    fn test_scan_uncompressed() {
        let mut w = writer(false);
        let mut sdr = scan(ScanKind::Data, 8, "A5", Some("FF"), 64_000);
        sdr.node.mask = Some(vec![0x0F]);
        w.execute(&Command::Scan(sdr)).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::SDR), 8,
            op(Opcode::TDI), 0xA5,
            op(Opcode::TDO), 0xFF,
            op(Opcode::MASK), 0x0F,
            op(Opcode::CONTINUE),
        ]);
    }

    #[test]
    fn test_scan_compressed() {
        let mut w = writer(true);
        w.execute(&Command::Scan(scan(ScanKind::Instruction, 32, "00000000", None, 64_000))).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::SIR), 32,
            op(Opcode::TDI), 0x01, 0x00, 0x03,
            op(Opcode::CONTINUE),
        ]);
    }

    #[test]
    fn test_mask_needs_tdo() {
        let mut w = writer(false);
        let mut sir = scan(ScanKind::Instruction, 8, "16", None, 64_000);
        sir.node.mask = Some(vec![0xFF]);
        w.execute(&Command::Scan(sir)).unwrap();
        assert_eq!(body(w), vec![op(Opcode::SIR), 8, op(Opcode::TDI), 0x68, op(Opcode::CONTINUE)]);
    }

    #[test]
    fn test_xtdo() {
        let mut w = writer(false);
        let mut sdr = scan(ScanKind::Data, 8, "12", Some("34"), 64_000);
        sdr.xtdo = true;
        w.execute(&Command::Scan(sdr)).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::XSDR), 8,
            op(Opcode::TDI), 0x48,
            op(Opcode::XTDO),
            op(Opcode::CONTINUE),
        ]);
    }

    #[test]
    fn test_cascade() {
        let mut w = writer(false);
        let sdr = scan(ScanKind::Data, 24, "123456", None, 16);
        assert!(sdr.is_cascaded());
        let tdi = sdr.node.tdi.clone().unwrap();
        w.execute(&Command::Scan(sdr)).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::SETFLOW), 0x02,
            op(Opcode::SDR), 16,
            op(Opcode::TDI), tdi[0], tdi[1],
            op(Opcode::CONTINUE),
            op(Opcode::RESETFLOW), 0x02,
            op(Opcode::SDR), 8,
            op(Opcode::TDI), tdi[2],
            op(Opcode::CONTINUE),
        ]);
    }

    #[test]
    fn test_trailers() {
        let mut w = writer(true);
        w.execute(&Command::Trailer(TrailerKind::HDR, ScanNode::default())).unwrap();
        let tir = ScanNode { length: 10, tdi: Some(vec![0xFF, 0xC0]), ..Default::default() };
        w.execute(&Command::Trailer(TrailerKind::TIR, tir)).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::HDR), 0,
            op(Opcode::TIR), 10, op(Opcode::TDI), 0xFF, 0xC0, op(Opcode::CONTINUE),
        ]);
    }

    #[test]
    fn test_loop_capture() {
        let mut w = writer(true);
        w.execute(&Command::LoopBegin(3)).unwrap();
        w.execute(&Command::State(State::IDLE)).unwrap();
        w.execute(&Command::RunTest(vec![RunTestStep::Tck(2)])).unwrap();
        w.execute(&Command::LoopEnd).unwrap();
        w.execute(&Command::VerifyUsercode).unwrap();
        assert_eq!(body(w), vec![
            op(Opcode::LCOUNT), 3,
            5, op(Opcode::STATE), 0x01, op(Opcode::TCK), 2, op(Opcode::ENDLOOP),
            op(Opcode::VUES),
        ]);
    }

    #[test]
    fn test_lvds() {
        let mut w = writer(true);
        w.execute(&Command::Lvds(vec![(1, 2), (200, 3)])).unwrap();
        assert_eq!(body(w), vec![op(Opcode::LVDS), 2, 1, 2, 0xC8, 0x01, 3]);
    }

    #[test]
    fn test_stamp_crc() {
        assert_eq!(crc16(&[]), 0);
        let data = b"____13\xF1\x7F".to_vec();
        let stamped = stamp_crc(&data);
        let crc = crc16(&data);
        assert_eq!(stamped[0], op(Opcode::FILE_CRC));
        assert_eq!(&stamped[1..3], &crc.to_be_bytes()[..]);
        assert_eq!(&stamped[3..], &data[..]);
        assert_ne!(crc16(&data), crc16(b"____13\xF2\x7F"));
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::try_from(0x7Fu8).unwrap(), Opcode::ENDVME);
        assert!(Opcode::try_from(0x20u8).is_err());
        assert_eq!(Opcode::from(TrailerKind::TDR), Opcode::TDR);
    }
}
