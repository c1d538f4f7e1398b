// Copyright 2021 Adam Greig
// Licensed under the MIT license.

use std::fmt;

use super::{Command, RunTestStep, Scan, ScanKind, ScanNode, State, TrailerKind, Wait};
use crate::scandata::to_hex;

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for TrailerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for ScanNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.length)?;
        // Scan vectors may be many thousands of digits, so wrap them.
        const DIGITS_PER_LINE: usize = 72;
        let mut break_next = false;
        for (name, data) in [
            ("TDI", &self.tdi),
            ("TDO", &self.tdo),
            ("MASK", &self.mask),
            ("CRC", &self.crc),
            ("CMASK", &self.cmask),
            ("READ", &self.read),
            ("RMASK", &self.rmask),
            ("DMASK", &self.dmask),
        ].iter() {
            if let Some(data) = data {
                if break_next {
                    write!(f, "\n ")?;
                    break_next = false;
                }
                let hex = to_hex(data, self.length);
                let hex = match hex.trim_start_matches('0') {
                    "" => "0",
                    trimmed => trimmed,
                };
                write!(f, " {} (", name)?;
                for chunk in hex.as_bytes().chunks(DIGITS_PER_LINE) {
                    if hex.len() > DIGITS_PER_LINE {
                        write!(f, "\n    ")?;
                    }
                    f.write_str(&String::from_utf8_lossy(chunk))?;
                }
                write!(f, ")")?;
                if hex.len() > DIGITS_PER_LINE {
                    break_next = true;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Scan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ScanKind::Instruction => write!(f, "SIR {};", self.node),
            ScanKind::Data => write!(f, "SDR {};", self.node),
        }
    }
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Wait::Micros(us) => write!(f, "{}E-6 SEC", us),
            Wait::Millis(ms) => write!(f, "{}E-3 SEC", ms),
        }
    }
}

impl fmt::Display for RunTestStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunTestStep::State(state) => write!(f, "{}", state),
            RunTestStep::Tck(n) => write!(f, "{} TCK", n),
            RunTestStep::Wait(wait) => write!(f, "{}", wait),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Header(text) => write!(f, "// {}", text),
            Command::Memory(bits) => write!(f, "// MEM {}", bits),
            Command::Vendor(vendor) => write!(f, "// VENDOR {:?}", vendor),
            Command::Comment(text) => write!(f, "{}", text),
            Command::State(state) => write!(f, "STATE {};", state),
            Command::EndIR(state) => write!(f, "ENDIR {};", state),
            Command::EndDR(state) => write!(f, "ENDDR {};", state),
            Command::Scan(scan) => write!(f, "{}", scan),
            Command::Trailer(kind, node) => write!(f, "{} {};", kind, node),
            Command::RunTest(steps) => {
                write!(f, "RUNTEST")?;
                for step in steps.iter() {
                    write!(f, " {}", step)?;
                }
                write!(f, ";")
            },
            Command::Frequency(hz) => write!(f, "FREQUENCY {:E} HZ;", *hz as f64),
            Command::LoopBegin(count) => write!(f, "LOOP {};", count),
            Command::LoopEnd => write!(f, "ENDLOOP;"),
            Command::Lvds(pairs) => {
                write!(f, "LVDS {} (", pairs.len())?;
                for (idx, (a, b)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}:{}", a, b)?;
                }
                write!(f, ");")
            },
            Command::Trst(high) => write!(f, "TRST {};", if *high { "OFF" } else { "ON" }),
            Command::IspEn(high) => write!(f, "ISPEN {};", if *high { "HIGH" } else { "LOW" }),
            Command::VerifyUsercode => write!(f, "VUES;"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::scandata::{cascade, parse_vector};
    use crate::*;

    fn pattern(length: usize, tdi: &str) -> ScanNode {
        ScanNode { length, tdi: Some(parse_vector(tdi, length).unwrap()), ..Default::default() }
    }

    #[test]
    fn test_display_scan() {
        let mut node = pattern(16, "00A5");
        node.tdo = Some(parse_vector("0000", 16).unwrap());
        let scan = Scan { kind: ScanKind::Data, node, xtdo: false, segments: cascade(16, 64) };
        assert_eq!(Command::Scan(scan).to_string(), "SDR 16 TDI (A5) TDO (0);");
        assert_eq!(Command::Trailer(TrailerKind::HIR, pattern(6, "3F")).to_string(), "HIR 6 TDI (3F);");
        assert_eq!(Command::Trailer(TrailerKind::TDR, ScanNode::default()).to_string(), "TDR 0;");
    }

    #[test]
    fn test_display_wrapping() {
        let digits = "1".repeat(100);
        let text = Command::Trailer(TrailerKind::HDR, pattern(400, &digits)).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "HDR 400 TDI (");
        assert_eq!(lines[1].trim().len(), 72);
        assert_eq!(lines[2].trim(), format!("{});", "1".repeat(28)));
    }

    #[test]
    fn test_display_commands() {
        assert_eq!(Command::State(State::IDLE).to_string(), "STATE IDLE;");
        assert_eq!(Command::EndDR(State::DRPAUSE).to_string(), "ENDDR DRPAUSE;");
        assert_eq!(Command::Frequency(1_000_000).to_string(), "FREQUENCY 1E6 HZ;");
        assert_eq!(Command::RunTest(vec![
            RunTestStep::State(State::IDLE),
            RunTestStep::Tck(100),
            RunTestStep::Wait(Wait::Millis(5)),
        ]).to_string(), "RUNTEST IDLE 100 TCK 5E-3 SEC;");
        assert_eq!(Command::Lvds(vec![(1, 2), (3, 4)]).to_string(), "LVDS 2 (1:2, 3:4);");
        assert_eq!(Command::Trst(true).to_string(), "TRST OFF;");
        assert_eq!(Command::LoopBegin(3).to_string(), "LOOP 3;");
    }
}
