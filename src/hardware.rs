// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! Live execution of commands on a JTAG TAP.

use std::time::{Duration, Instant};

use crate::bits;
use crate::scandata::{self, bytes_for_bits};
use crate::{Backend, Command, Error, Result, RunTestStep, RowSize, Scan, ScanKind, State, Summary, TrailerKind};

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("Transfer of {0} bits is too long for the driver")]
    TooLong(usize),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Whether a data scan needs its captured TDO.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// State the TAP is left in once a scan completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndState {
    Idle,
    Pause,
}

impl From<State> for EndState {
    fn from(state: State) -> EndState {
        if state.is_pause() { EndState::Pause } else { EndState::Idle }
    }
}

/// Low-level access to a JTAG TAP controller.
///
/// All bit buffers are least-significant-bit first: bit `i` of a transfer is
/// bit `i % 8` of byte `i / 8`, and is the `i`th bit shifted.
pub trait TapDriver {
    /// Shift `bits` bits of `tdi` through the instruction register, finishing in `end`.
    ///
    /// Returns the bits captured from TDO.
    fn instruction_scan(&mut self, bits: usize, tdi: &[u8], end: EndState) -> DriverResult<Vec<u8>>;

    /// Shift `bits` bits of `buffer` through the data register, finishing in `end`.
    ///
    /// For [`Direction::Read`] the captured TDO bits are written back into `buffer`.
    fn data_scan(&mut self, direction: Direction, bits: usize, buffer: &mut [u8], end: EndState)
        -> DriverResult<()>;

    /// Toggle TCK `ticks` times in Run-Test/Idle.
    fn toggle_clock(&mut self, ticks: u32) -> DriverResult<()>;

    /// Set the TCK frequency in Hz.
    fn set_frequency(&mut self, hz: u32) -> DriverResult<()>;

    /// Wait for `duration`.
    ///
    /// By default this busy-waits, which holds the calling thread for the
    /// whole duration.
    fn delay(&mut self, duration: Duration) -> DriverResult<()> {
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
        Ok(())
    }
}

impl<T: TapDriver + ?Sized> TapDriver for &mut T {
    fn instruction_scan(&mut self, bits: usize, tdi: &[u8], end: EndState) -> DriverResult<Vec<u8>> {
        (**self).instruction_scan(bits, tdi, end)
    }

    fn data_scan(&mut self, direction: Direction, bits: usize, buffer: &mut [u8], end: EndState)
        -> DriverResult<()>
    {
        (**self).data_scan(direction, bits, buffer, end)
    }

    fn toggle_clock(&mut self, ticks: u32) -> DriverResult<()> {
        (**self).toggle_clock(ticks)
    }

    fn set_frequency(&mut self, hz: u32) -> DriverResult<()> {
        (**self).set_frequency(hz)
    }

    fn delay(&mut self, duration: Duration) -> DriverResult<()> {
        (**self).delay(duration)
    }
}

/// A header or trailer, held least-significant-bit first.
#[derive(Clone, Debug, Default)]
struct Pattern {
    length: usize,
    data: Vec<u8>,
}

/// Backend which executes commands on a [`TapDriver`], verifying every
/// scan with an expected TDO.
pub struct HardwareBackend<D> {
    driver: D,
    capacity: usize,
    end_ir: State,
    end_dr: State,
    hir: Pattern,
    tir: Pattern,
    hdr: Pattern,
    tdr: Pattern,
    last_ir: Option<(usize, Vec<u8>)>,
    last_dr: Option<(usize, Vec<u8>)>,
    summary: Summary,
}

impl<D: TapDriver> HardwareBackend<D> {
    /// Create a backend for scans cascaded at `row_size`.
    ///
    /// Transfers are limited to three rows, leaving room for headers and trailers.
    pub fn new(driver: D, row_size: RowSize) -> Self {
        Self::with_capacity(driver, row_size.bits() * 3)
    }

    /// Create a backend allowing transfers of up to `capacity` bits.
    pub fn with_capacity(driver: D, capacity: usize) -> Self {
        HardwareBackend {
            driver,
            capacity,
            end_ir: State::IRPAUSE,
            end_dr: State::DRPAUSE,
            hir: Pattern::default(),
            tir: Pattern::default(),
            hdr: Pattern::default(),
            tdr: Pattern::default(),
            last_ir: None,
            last_dr: None,
            summary: Summary::default(),
        }
    }

    /// Consume this backend, returning the driver.
    pub fn into_inner(self) -> D {
        self.driver
    }

    fn scan(&mut self, scan: &Scan) -> Result<()> {
        let node = &scan.node;
        let last = match scan.kind {
            ScanKind::Instruction => &self.last_ir,
            ScanKind::Data => &self.last_dr,
        };
        let tdi = match (&node.tdi, last) {
            (Some(tdi), _) => tdi.clone(),
            (None, Some((length, tdi))) if *length == node.length => tdi.clone(),
            (None, _) => vec![0u8; bytes_for_bits(node.length)],
        };
        let (head, tail, end) = match scan.kind {
            ScanKind::Instruction => (&self.hir, &self.tir, self.end_ir),
            ScanKind::Data => (&self.hdr, &self.tdr, self.end_dr),
        };
        let (head, tail) = (head.clone(), tail.clone());

        let mut failed = false;
        let nsegments = scan.segments.len();
        for (idx, segment) in scan.segments.iter().enumerate() {
            let head_len = if idx == 0 { head.length } else { 0 };
            let tail_len = if idx + 1 == nsegments { tail.length } else { 0 };
            let end = if idx + 1 == nsegments { EndState::from(end) } else { EndState::Pause };
            let total = head_len + segment.length + tail_len;
            if total > self.capacity {
                return Err(Error::TransferTooLong { bits: total, capacity: self.capacity });
            }

            let payload = bits::to_lsb_first(segment.slice(&tdi));
            let combined = bits::merge(&[
                (&head.data[..], head_len),
                (&payload[..], segment.length),
                (&tail.data[..], tail_len),
            ])?;
            log::trace!("{:?} scan of {} bits, end {:?}", scan.kind, total, end);

            let response = match scan.kind {
                ScanKind::Instruction => self.driver.instruction_scan(total, &combined, end)?,
                ScanKind::Data => {
                    let direction = if node.tdo.is_some() { Direction::Read } else { Direction::Write };
                    let mut buffer = combined;
                    self.driver.data_scan(direction, total, &mut buffer, end)?;
                    buffer
                }
            };

            if let Some(tdo) = &node.tdo {
                let actual = bits::extract(&response, head_len, segment.length, tail_len)?;
                let expected = bits::to_lsb_first(segment.slice(tdo));
                let mask = node.mask.as_ref().map(|mask| bits::to_lsb_first(segment.slice(mask)));
                let bad = bits::mismatches(&actual, &expected, mask.as_deref(), segment.length)?;
                if bad > 0 {
                    failed = true;
                    log::error!(
                        "{:?} scan {} failed verification at bit {}: {} bits differ, \
                         expected {} got {} mask {}",
                        scan.kind, self.summary.scans + 1, segment.offset, bad,
                        scandata::to_hex(segment.slice(tdo), segment.length),
                        scandata::to_hex(&bits::to_lsb_first(&actual), segment.length),
                        node.mask.as_ref()
                            .map(|mask| scandata::to_hex(segment.slice(mask), segment.length))
                            .unwrap_or_else(|| "all".to_string()),
                    );
                }
            }
        }

        self.summary.scans += 1;
        if node.tdo.is_some() {
            self.summary.verified += 1;
        }
        if failed {
            self.summary.failures += 1;
        }
        match scan.kind {
            ScanKind::Instruction => self.last_ir = Some((node.length, tdi)),
            ScanKind::Data => self.last_dr = Some((node.length, tdi)),
        }
        Ok(())
    }

    fn run_test(&mut self, steps: &[RunTestStep]) -> Result<()> {
        let mut ticks = 0u64;
        let mut delay = Duration::from_secs(0);
        for step in steps.iter() {
            match step {
                RunTestStep::State(_) => (),
                RunTestStep::Tck(n) => ticks += *n as u64,
                RunTestStep::Wait(wait) => delay += wait.duration(),
            }
        }
        while ticks > 0 {
            let chunk = ticks.min(u32::MAX as u64);
            self.driver.toggle_clock(chunk as u32)?;
            ticks -= chunk;
        }
        if delay > Duration::from_secs(0) {
            self.driver.delay(delay)?;
        }
        Ok(())
    }
}

impl<D: TapDriver> Backend for HardwareBackend<D> {
    fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Scan(scan) => self.scan(scan)?,
            Command::Trailer(kind, node) => {
                let data = match &node.tdi {
                    Some(tdi) => bits::to_lsb_first(tdi),
                    None => vec![0u8; bytes_for_bits(node.length)],
                };
                let pattern = Pattern { length: node.length, data };
                match kind {
                    TrailerKind::HIR => self.hir = pattern,
                    TrailerKind::TIR => self.tir = pattern,
                    TrailerKind::HDR => self.hdr = pattern,
                    TrailerKind::TDR => self.tdr = pattern,
                }
            }
            Command::EndIR(state) => self.end_ir = *state,
            Command::EndDR(state) => self.end_dr = *state,
            Command::RunTest(steps) => self.run_test(steps)?,
            Command::Frequency(hz) => self.driver.set_frequency(*hz)?,
            Command::Comment(text) => log::info!("{}", text),
            Command::Header(_) | Command::Memory(_) | Command::Vendor(_) | Command::State(_)
            | Command::LoopBegin(_) | Command::LoopEnd | Command::Lvds(_) | Command::Trst(_)
            | Command::IspEn(_) | Command::VerifyUsercode => {
                log::debug!("No transfer needed for {}", command);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Summary> {
        log::info!("Executed {} scans, {} verified, {} failed",
                   self.summary.scans, self.summary.verified, self.summary.failures);
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scandata::{cascade, parse_vector}, ScanNode, Wait};

    /// How the mock driver answers data scans.
    #[derive(Copy, Clone, PartialEq)]
    enum Reply {
        Echo,
        Zeros,
    }

    struct MockDriver {
        reply: Reply,
        ir: Vec<(usize, Vec<u8>, EndState)>,
        dr: Vec<(Direction, usize, Vec<u8>, EndState)>,
        ticks: u64,
        toggles: Vec<u32>,
        delay: Duration,
        frequency: Option<u32>,
    }

    impl MockDriver {
        fn new(reply: Reply) -> Self {
            MockDriver {
                reply, ir: Vec::new(), dr: Vec::new(), ticks: 0, toggles: Vec::new(),
                delay: Duration::default(), frequency: None,
            }
        }
    }

    impl TapDriver for MockDriver {
        fn instruction_scan(&mut self, bits: usize, tdi: &[u8], end: EndState) -> DriverResult<Vec<u8>> {
            self.ir.push((bits, tdi.to_vec(), end));
            match self.reply {
                Reply::Echo => Ok(tdi.to_vec()),
                Reply::Zeros => Ok(vec![0; tdi.len()]),
            }
        }

        fn data_scan(&mut self, direction: Direction, bits: usize, buffer: &mut [u8], end: EndState)
            -> DriverResult<()>
        {
            self.dr.push((direction, bits, buffer.to_vec(), end));
            if self.reply == Reply::Zeros && direction == Direction::Read {
                buffer.iter_mut().for_each(|b| *b = 0);
            }
            Ok(())
        }

        fn toggle_clock(&mut self, ticks: u32) -> DriverResult<()> {
            self.ticks += ticks as u64;
            self.toggles.push(ticks);
            Ok(())
        }

        fn set_frequency(&mut self, hz: u32) -> DriverResult<()> {
            self.frequency = Some(hz);
            Ok(())
        }

        fn delay(&mut self, duration: Duration) -> DriverResult<()> {
            self.delay += duration;
            Ok(())
        }
    }

    fn sdr(length: usize, tdi: &str, tdo: Option<&str>, mask: Option<&str>) -> Command {
        Command::Scan(Scan {
            kind: ScanKind::Data,
            node: ScanNode {
                length,
                tdi: Some(parse_vector(tdi, length).unwrap()),
                tdo: tdo.map(|v| parse_vector(v, length).unwrap()),
                mask: mask.map(|v| parse_vector(v, length).unwrap()),
                ..Default::default()
            },
            xtdo: false,
            segments: cascade(length, 64_000),
        })
    }

    #[test]
    fn test_verify_pass() {
        let mut mock = MockDriver::new(Reply::Echo);
        let mut hw = HardwareBackend::new(&mut mock, RowSize::K64);
        hw.execute(&sdr(8, "FF", Some("FF"), Some("FF"))).unwrap();
        let summary = hw.finish().unwrap();
        assert_eq!(summary, Summary { scans: 1, verified: 1, failures: 0 });
        assert!(summary.check().is_ok());
        assert_eq!(mock.dr, vec![(Direction::Read, 8, vec![0xFF], EndState::Pause)]);
    }

    #[test]
    fn test_verify_fail() {
        let mut hw = HardwareBackend::new(MockDriver::new(Reply::Zeros), RowSize::K64);
        hw.execute(&sdr(8, "FF", Some("FF"), Some("FF"))).unwrap();
        // Execution continues after a failure.
        hw.execute(&sdr(8, "00", Some("00"), None)).unwrap();
        let summary = hw.finish().unwrap();
        assert_eq!(summary, Summary { scans: 2, verified: 2, failures: 1 });
        assert!(matches!(summary.check(), Err(Error::Verification { failures: 1 })));
    }

    #[test]
    fn test_mask() {
        let mut hw = HardwareBackend::new(MockDriver::new(Reply::Zeros), RowSize::K64);
        hw.execute(&sdr(8, "F0", Some("F0"), Some("0F"))).unwrap();
        assert!(hw.finish().unwrap().passed());
    }

    #[test]
    fn test_write_only() {
        let mut hw = HardwareBackend::new(MockDriver::new(Reply::Zeros), RowSize::K64);
        hw.execute(&Command::EndDR(State::IDLE)).unwrap();
        hw.execute(&sdr(12, "ABC", None, None)).unwrap();
        assert_eq!(hw.finish().unwrap(), Summary { scans: 1, verified: 0, failures: 0 });
        let mock = hw.into_inner();
        assert_eq!(mock.dr, vec![(Direction::Write, 12, vec![0xBC, 0x0A], EndState::Idle)]);
    }

    #[test]
    fn test_runtest() {
        let mut mock = MockDriver::new(Reply::Echo);
        let mut hw = HardwareBackend::new(&mut mock, RowSize::K64);
        hw.execute(&Command::Frequency(1_000_000)).unwrap();
        hw.execute(&Command::RunTest(vec![
            RunTestStep::State(State::IDLE),
            RunTestStep::Tck(100),
            RunTestStep::Wait(Wait::Micros(1000)),
        ])).unwrap();
        drop(hw);
        assert_eq!(mock.frequency, Some(1_000_000));
        assert_eq!(mock.ticks, 100);
        assert_eq!(mock.delay, Duration::from_micros(1000));
    }

    #[test]
    fn test_runtest_long_clock() {
        // 65540 steps of 0xFFFF ticks add up to more than u32::MAX.
        let steps = vec![RunTestStep::Tck(0xFFFF); 65540];
        let mut mock = MockDriver::new(Reply::Echo);
        let mut hw = HardwareBackend::new(&mut mock, RowSize::K64);
        hw.execute(&Command::RunTest(steps)).unwrap();
        drop(hw);
        assert_eq!(mock.ticks, 65540 * 0xFFFF);
        assert_eq!(mock.toggles, vec![u32::MAX, 196_605]);
    }

    #[test]
    fn test_trailers_merged() {
        let mut mock = MockDriver::new(Reply::Echo);
        let mut hw = HardwareBackend::new(&mut mock, RowSize::K64);
        let hir = ScanNode { length: 4, tdi: Some(vec![0xF0]), ..Default::default() };
        let tir = ScanNode { length: 2, tdi: Some(vec![0x00]), ..Default::default() };
        hw.execute(&Command::Trailer(TrailerKind::HIR, hir)).unwrap();
        hw.execute(&Command::Trailer(TrailerKind::TIR, tir)).unwrap();
        hw.execute(&Command::EndIR(State::IDLE)).unwrap();
        hw.execute(&Command::Scan(Scan {
            kind: ScanKind::Instruction,
            node: ScanNode {
                length: 8,
                tdi: Some(parse_vector("A5", 8).unwrap()),
                tdo: Some(parse_vector("A5", 8).unwrap()),
                ..Default::default()
            },
            xtdo: false,
            segments: cascade(8, 64_000),
        })).unwrap();
        assert!(hw.finish().unwrap().passed());
        drop(hw);
        // Four header ones, then 0xA5 from bit 4, then two trailer zeros.
        assert_eq!(mock.ir, vec![(14, vec![0x5F, 0x0A], EndState::Idle)]);
    }

    #[test]
    fn test_cascaded_scan() {
        let mut mock = MockDriver::new(Reply::Echo);
        let mut hw = HardwareBackend::with_capacity(&mut mock, 16);
        let length = 24;
        hw.execute(&Command::Scan(Scan {
            kind: ScanKind::Data,
            node: ScanNode {
                length,
                tdi: Some(parse_vector("123456", length).unwrap()),
                tdo: Some(parse_vector("123456", length).unwrap()),
                ..Default::default()
            },
            xtdo: false,
            segments: cascade(length, 16),
        })).unwrap();
        assert!(hw.finish().unwrap().passed());
        drop(hw);
        let ends: Vec<(usize, EndState)> = mock.dr.iter().map(|(_, n, _, end)| (*n, *end)).collect();
        assert_eq!(ends, vec![(16, EndState::Pause), (8, EndState::Pause)]);
    }

    #[test]
    fn test_transfer_too_long() {
        let mut hw = HardwareBackend::with_capacity(MockDriver::new(Reply::Echo), 8);
        let hdr = ScanNode { length: 1, tdi: Some(vec![0x00]), ..Default::default() };
        hw.execute(&Command::Trailer(TrailerKind::HDR, hdr)).unwrap();
        match hw.execute(&sdr(8, "00", None, None)) {
            Err(Error::TransferTooLong { bits: 9, capacity: 8 }) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_previous_tdi_reused() {
        let mut hw = HardwareBackend::new(MockDriver::new(Reply::Echo), RowSize::K64);
        hw.execute(&sdr(8, "3C", None, None)).unwrap();
        hw.execute(&Command::Scan(Scan {
            kind: ScanKind::Data,
            node: ScanNode { length: 8, ..Default::default() },
            xtdo: false,
            segments: cascade(8, 64_000),
        })).unwrap();
        hw.execute(&Command::Scan(Scan {
            kind: ScanKind::Data,
            node: ScanNode { length: 4, ..Default::default() },
            xtdo: false,
            segments: cascade(4, 64_000),
        })).unwrap();
        let mock = hw.into_inner();
        assert_eq!(mock.dr[1].2, vec![0x3C]);
        assert_eq!(mock.dr[2].2, vec![0x00]);
    }
}
