// Copyright 2021 Adam Greig
// Licensed under the MIT license.

#![allow(clippy::upper_case_acronyms)]

//! # svf2vme
//!
//! Compile SVF files into VME bytecode, or execute them directly on a JTAG TAP.
//!
//! SVF text is interpreted by a [`Session`] into typed [`Command`] values,
//! which are handed to a [`Backend`]:
//!
//! * [`VmeWriter`] serialises commands as a VME byte stream, compressing scan
//!   data and cascading long scans into bounded rows.
//! * [`HardwareBackend`] drives a [`TapDriver`] and verifies scanned-out data
//!   against the expected TDO under its mask.
//!
//! [`compile`] and [`program`] run the whole pipeline for a single device,
//! and [`compile_chain`] combines the files for several devices of one chain.

use std::time::Duration;

use num_enum::IntoPrimitive;

pub mod bits;
pub mod compress;
pub mod config;
mod display;
mod error;
pub mod hardware;
mod interpreter;
pub mod scandata;
pub mod tokenizer;
pub mod vme;

pub use config::{Config, Device, Fill, RowSize, TckLimit, Vendor};
pub use error::{Error, ErrorKind, Result};
pub use hardware::{HardwareBackend, TapDriver};
pub use interpreter::{ir_length, max_scan_length, Session};
pub use scandata::Segment;
pub use vme::VmeWriter;

/// Stable TAP states which may be named in SVF files.
///
/// The discriminant is the code written to VME files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum State {
    /// Test-Logic-Reset
    RESET = 0x00,

    /// Run-Test/Idle
    IDLE = 0x01,

    /// Pause-IR
    IRPAUSE = 0x02,

    /// Pause-DR
    DRPAUSE = 0x03,

    /// Capture-DR
    DRCAPTURE = 0x06,
}

impl State {
    /// Look up a stable state by its SVF name, ignoring case.
    pub fn from_name(name: &str) -> Option<State> {
        match name.to_ascii_uppercase().as_str() {
            "RESET"     => Some(State::RESET),
            "IDLE"      => Some(State::IDLE),
            "IRPAUSE"   => Some(State::IRPAUSE),
            "DRPAUSE"   => Some(State::DRPAUSE),
            "DRCAPTURE" => Some(State::DRCAPTURE),
            _           => None,
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, State::IRPAUSE | State::DRPAUSE)
    }
}

/// Register targeted by a scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanKind {
    /// SIR
    Instruction,
    /// SDR
    Data,
}

/// Fixed patterns shifted around every scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrailerKind {
    /// Header for instruction scans.
    HIR,
    /// Trailer for instruction scans.
    TIR,
    /// Header for data scans.
    HDR,
    /// Trailer for data scans.
    TDR,
}

/// Bit length and data vectors of one scan.
///
/// Vectors hold `length` bits packed as VME rows, see [`scandata::parse_vector`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanNode {
    /// Number of bits to be scanned.
    pub length: usize,

    /// Value to be scanned into the target.
    pub tdi: Option<Vec<u8>>,

    /// Value expected to be scanned out of the target.
    /// If not specified, no comparison is performed.
    pub tdo: Option<Vec<u8>>,

    /// Mask used when comparing TDO, 1 indicates care.
    /// If not specified every bit is compared.
    pub mask: Option<Vec<u8>>,

    pub crc: Option<Vec<u8>>,
    pub cmask: Option<Vec<u8>>,
    pub read: Option<Vec<u8>>,
    pub rmask: Option<Vec<u8>>,
    pub dmask: Option<Vec<u8>>,
}

/// An instruction or data scan, split into row-sized segments.
#[derive(Clone, Debug, PartialEq)]
pub struct Scan {
    pub kind: ScanKind,
    pub node: ScanNode,

    /// Set when the expected TDO equals the TDI of the previous data scan,
    /// allowing the VME player to compare while shifting the next TDI.
    pub xtdo: bool,

    /// Segments covering `node.length`; more than one when cascaded.
    pub segments: Vec<Segment>,
}

impl Scan {
    pub fn is_cascaded(&self) -> bool {
        self.segments.len() > 1
    }
}

/// A delay, as encoded in a VME WAIT operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Up to 0x7FFF microseconds.
    Micros(u16),
    /// Up to 0x7FFF milliseconds.
    Millis(u16),
}

impl Wait {
    /// The 16 bit WAIT operand, with the top bit flagging milliseconds.
    pub fn word(&self) -> u16 {
        match self {
            Wait::Micros(us) => *us & 0x7FFF,
            Wait::Millis(ms) => (*ms & 0x7FFF) | 0x8000,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Wait::Micros(us) => Duration::from_micros(*us as u64),
            Wait::Millis(ms) => Duration::from_millis(*ms as u64),
        }
    }
}

/// One element of a RUNTEST command, in the order it appeared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunTestStep {
    /// Move to a stable state.
    State(State),
    /// Toggle TCK this many times.
    Tck(u16),
    /// Wait for a time.
    Wait(Wait),
}

/// Interpreted SVF command, ready for a [`Backend`].
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Free-form header placed at the start of the output.
    Header(String),

    /// Longest scan, in bits, that the output will contain.
    Memory(usize),

    /// Vendor of the device whose commands follow.
    Vendor(Vendor),

    /// Comment carried over from the SVF file.
    Comment(String),

    /// Move to a stable state.
    State(State),

    /// State for the bus after an instruction scan.
    EndIR(State),

    /// State for the bus after a data scan.
    EndDR(State),

    /// Instruction or data scan.
    Scan(Scan),

    /// Set a header or trailer pattern.
    Trailer(TrailerKind, ScanNode),

    /// Clock and delay sequence.
    RunTest(Vec<RunTestStep>),

    /// Maximum TCK frequency in Hz.
    Frequency(u32),

    /// Start of a block repeated up to this many times until its scans verify.
    LoopBegin(usize),

    /// End of a repeated block.
    LoopEnd,

    /// LVDS pairs, by boundary scan cell index.
    Lvds(Vec<(usize, usize)>),

    /// Level of the TRST pin, true for high.
    Trst(bool),

    /// Level of the ispEN pin, true for high.
    IspEn(bool),

    /// Verify the device USERCODE.
    VerifyUsercode,
}

/// Result of running commands through a [`Backend`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Number of scans processed.
    pub scans: usize,
    /// Number of scans whose output was checked against an expected TDO.
    pub verified: usize,
    /// Number of checked scans which did not match.
    pub failures: usize,
}

impl Summary {
    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    /// Turn a summary with verification failures into an error.
    pub fn check(self) -> Result<Summary> {
        if self.passed() {
            Ok(self)
        } else {
            Err(Error::Verification { failures: self.failures })
        }
    }
}

/// Consumer of interpreted commands.
pub trait Backend {
    /// Process a single command.
    fn execute(&mut self, command: &Command) -> Result<()>;

    /// Called once after all devices have been processed.
    fn finish(&mut self) -> Result<Summary>;
}

/// Compile the SVF file `svf` for `device` into a CRC-stamped VME file.
pub fn compile(svf: &str, config: &Config, device: &Device) -> Result<Vec<u8>> {
    let mut writer = VmeWriter::new(Vec::new(), config.compress)?;
    let mut session = Session::new(config.clone());
    session.begin(&mut writer, max_scan_length(svf, config.row_size)?)?;
    session.run(device, svf.as_bytes(), &mut writer)?;
    writer.finish()?;
    Ok(vme::stamp_crc(&writer.into_inner()))
}

/// Compile one SVF file per device of a JTAG chain into a single VME file.
///
/// Devices are listed in the order used by [`Fill::for_position`]. When the
/// chain holds more than one device, any device without an explicit fill is
/// given one which bypasses the others, using the length of the first SIR in
/// each file as that device's instruction register length.
pub fn compile_chain(config: &Config, devices: &[(Device, &str)]) -> Result<Vec<u8>> {
    let mut ir_lengths = Vec::with_capacity(devices.len());
    let mut max_scan = 0;
    for (idx, (_, svf)) in devices.iter().enumerate() {
        let ir = ir_length(svf)?.unwrap_or_else(|| {
            log::warn!("No SIR found for device {}, assuming an empty instruction register", idx);
            0
        });
        ir_lengths.push(ir);
        max_scan = max_scan.max(max_scan_length(svf, config.row_size)?);
    }

    let mut writer = VmeWriter::new(Vec::new(), config.compress)?;
    let mut session = Session::new(config.clone());
    session.begin(&mut writer, max_scan)?;
    for (idx, (device, svf)) in devices.iter().enumerate() {
        let mut device = device.clone();
        if devices.len() > 1 && device.fill.is_none() {
            device.fill = Some(Fill::for_position(&ir_lengths, idx));
        }
        log::info!("Compiling device {} of {}", idx + 1, devices.len());
        session.run(&device, svf.as_bytes(), &mut writer)?;
    }
    writer.finish()?;
    Ok(vme::stamp_crc(&writer.into_inner()))
}

/// Execute the SVF file `svf` for `device` using `driver`.
///
/// Verification failures do not stop execution; they are reported in the
/// returned [`Summary`].
pub fn program<D: TapDriver>(svf: &str, config: &Config, device: &Device, driver: D)
    -> Result<Summary>
{
    let mut backend = HardwareBackend::new(driver, config.row_size);
    let mut session = Session::new(config.clone());
    session.begin(&mut backend, max_scan_length(svf, config.row_size)?)?;
    session.run(device, svf.as_bytes(), &mut backend)?;
    backend.finish()
}
