// Copyright 2021 Adam Greig
// Licensed under the MIT license.

//! Output and per-device settings.

use std::convert::TryFrom;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, Result, ScanNode, TrailerKind};

/// Device vendor, written to the VME file ahead of each device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Vendor {
    Lattice = 0x01,
    Altera  = 0x02,
    Xilinx  = 0x03,
}

impl Default for Vendor {
    fn default() -> Self {
        Vendor::Lattice
    }
}

impl FromStr for Vendor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lattice" => Ok(Vendor::Lattice),
            "altera"  => Ok(Vendor::Altera),
            "xilinx"  => Ok(Vendor::Xilinx),
            _         => Err(Error::UnknownVendor(s.to_string())),
        }
    }
}

/// Maximum number of bits in one scan segment, in thousands of bits.
///
/// Longer scans are cascaded over several segments.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum RowSize {
    K8   = 8,
    K16  = 16,
    K32  = 32,
    K64  = 64,
    K128 = 128,
    K256 = 256,
}

impl RowSize {
    /// Look up the row size for a value given in thousands of bits.
    pub fn from_kilobits(k: u16) -> Result<Self> {
        RowSize::try_from(k).map_err(|_| Error::InvalidRowSize(k))
    }

    /// Number of bits in a full row.
    pub fn bits(&self) -> usize {
        *self as usize * 1000
    }
}

impl Default for RowSize {
    fn default() -> Self {
        RowSize::K64
    }
}

/// Handling of long RUNTEST TCK counts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TckLimit {
    /// Issue at most this many TCKs, waiting out the remaining cycles
    /// at the active frequency.
    Limit(u32),

    /// Issue TCKs as written, and convert SEC delays into TCKs at the
    /// active frequency instead of waits.
    NoConversion,
}

impl Default for TckLimit {
    fn default() -> Self {
        TckLimit::Limit(1000)
    }
}

impl FromStr for TckLimit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("no") {
            Ok(TckLimit::NoConversion)
        } else {
            s.parse().map(TckLimit::Limit).map_err(|_| Error::InvalidTckLimit(s.to_string()))
        }
    }
}

/// Bypass padding around one device in a multi-device chain.
///
/// Devices before the target in the chain sit between it and TDO and so are
/// reached by trailers; devices after it are reached by headers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Fill {
    pub devices_before: usize,
    pub ir_bits_before: usize,
    pub devices_after: usize,
    pub ir_bits_after: usize,
}

impl Fill {
    /// Compute the fill for the device at `index` in a chain whose devices
    /// have the instruction register lengths `ir_lengths`.
    pub fn for_position(ir_lengths: &[usize], index: usize) -> Fill {
        let (before, rest) = ir_lengths.split_at(index.min(ir_lengths.len()));
        let after = rest.get(1..).unwrap_or(&[]);
        Fill {
            devices_before: before.len(),
            ir_bits_before: before.iter().sum(),
            devices_after: after.len(),
            ir_bits_after: after.iter().sum(),
        }
    }

    /// Trailer commands placing every other device in BYPASS: instruction
    /// registers are filled with ones and each bypass register with a zero.
    ///
    /// Returned in the order TDR, TIR, HDR, HIR.
    pub fn trailers(&self) -> Vec<(TrailerKind, ScanNode)> {
        let pattern = |length: usize, fill: u8| {
            let tdi = if length > 0 {
                let mut tdi = vec![fill; crate::scandata::bytes_for_bits(length)];
                // Unused bits of the final byte stay clear.
                let spare = tdi.len() * 8 - length;
                if let Some(last) = tdi.last_mut() {
                    *last &= 0xFFu8 << spare;
                }
                Some(tdi)
            } else {
                None
            };
            ScanNode { length, tdi, ..Default::default() }
        };
        vec![
            (TrailerKind::TDR, pattern(self.devices_before, 0x00)),
            (TrailerKind::TIR, pattern(self.ir_bits_before, 0xFF)),
            (TrailerKind::HDR, pattern(self.devices_after, 0x00)),
            (TrailerKind::HIR, pattern(self.ir_bits_after, 0xFF)),
        ]
    }
}

/// Settings for a whole output file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Maximum scan segment size.
    pub row_size: RowSize,

    /// Compress scan data rows.
    pub compress: bool,

    /// Copy SVF comments into the output.
    pub preserve_comments: bool,

    /// Text written as a comment at the start of the output.
    pub header: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config { row_size: RowSize::default(), compress: true, preserve_comments: false, header: None }
    }
}

/// Settings for one device and its SVF file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Device {
    pub vendor: Vendor,

    /// TCK frequency in Hz, used until the file sets a lower one.
    pub frequency: Option<u32>,

    pub tck_limit: TckLimit,

    /// Bypass padding when the device shares its chain with others.
    pub fill: Option<Fill>,
}
