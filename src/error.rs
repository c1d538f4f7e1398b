// Copyright 2021 Adam Greig
// Licensed under the MIT license.

use std::collections::TryReserveError;
use thiserror::Error;

use crate::tokenizer::ErrLoc;

/// Broad category of an [`Error`], used by callers deciding whether to
/// continue with the next device of a chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed SVF input.
    FileFormat,
    /// A buffer could not be allocated.
    OutOfMemory,
    /// One or more hardware responses did not match the expected TDO.
    Verification,
    /// Invalid configuration or a request exceeding configured limits.
    Configuration,
    /// Failure reading input, writing output, or talking to the TAP driver.
    Io,
}

/// svf2vme error.
///
/// Syntax errors carry the location in the SVF file where they were found.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown command '{1}' at {0}")]
    UnknownCommand(ErrLoc, String),
    #[error("Unexpected token '{1}' at {0}")]
    UnexpectedToken(ErrLoc, String),
    #[error("Unexpected end of file after line {0}")]
    UnexpectedEof(usize),
    #[error("Could not parse number from '{1}' at {0}")]
    InvalidNumber(ErrLoc, String),
    #[error("Invalid hexadecimal digit '{1}' at {0}")]
    InvalidHex(ErrLoc, char),
    #[error("Scan length must be non-zero at {0}")]
    InvalidScanLength(ErrLoc),
    #[error("Stray character at {0}")]
    StrayCharacter(ErrLoc),
    #[error("LOOP nested inside another LOOP at {0}")]
    NestedLoop(ErrLoc),
    #[error("ENDLOOP without LOOP at {0}")]
    UnmatchedEndLoop(ErrLoc),
    #[error("LOOP still open at end of file")]
    UnterminatedLoop,
    #[error("Invalid LVDS pair list at {0}")]
    InvalidLvds(ErrLoc),
    #[error("RUNTEST delay or TCK count too long at {0}")]
    RunTestTooLong(ErrLoc),

    #[error("Out of memory allocating scan buffer")]
    OutOfMemory(#[from] TryReserveError),

    #[error("{failures} scan(s) failed verification")]
    Verification { failures: usize },

    #[error("Unknown vendor '{0}'")]
    UnknownVendor(String),
    #[error("Invalid maximum row size {0}K")]
    InvalidRowSize(u16),
    #[error("Invalid maximum TCK setting '{0}'")]
    InvalidTckLimit(String),
    #[error("Duplicate LVDS index {1} at {0}")]
    DuplicateLvdsIndex(ErrLoc, usize),
    #[error("LVDS index {1} exceeds maximum scan size {2} at {0}")]
    LvdsIndexOutOfRange(ErrLoc, usize, usize),
    #[error("Scan length {1} exceeds maximum buffer size {2} at {0}")]
    ScanTooLong(ErrLoc, usize, usize),
    #[error("Transfer of {bits} bits exceeds capacity of {capacity} bits")]
    TransferTooLong { bits: usize, capacity: usize },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("TAP driver error")]
    Driver(#[from] crate::hardware::DriverError),
    #[error(transparent)]
    Bits(#[from] crate::bits::Error),
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            UnknownCommand(..) | UnexpectedToken(..) | UnexpectedEof(..) | InvalidNumber(..)
            | InvalidHex(..) | InvalidScanLength(..) | StrayCharacter(..) | NestedLoop(..)
            | UnmatchedEndLoop(..) | UnterminatedLoop | InvalidLvds(..) | RunTestTooLong(..) => ErrorKind::FileFormat,
            OutOfMemory(..) => ErrorKind::OutOfMemory,
            Verification { .. } => ErrorKind::Verification,
            UnknownVendor(..) | InvalidRowSize(..) | InvalidTckLimit(..) | DuplicateLvdsIndex(..)
            | LvdsIndexOutOfRange(..) | ScanTooLong(..) | TransferTooLong { .. } => {
                ErrorKind::Configuration
            }
            Io(..) | Driver(..) | Bits(..) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
