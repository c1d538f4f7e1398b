// Copyright 2021 Adam Greig
// Licensed under the MIT license.

use std::collections::HashSet;
use std::io::BufRead;

use nom::{
    character::complete::{char as nom_char, digit1, multispace0},
    combinator::{all_consuming, map_res},
    multi::separated_list1,
    sequence::{delimited, separated_pair},
    IResult,
};

use crate::scandata::{self, PreviousTdi};
use crate::tokenizer::{ErrLoc, Keyword, Token, Tokenizer};
use crate::{Backend, Command, Config, Device, Error, Result, RowSize, TckLimit};
use crate::{RunTestStep, Scan, ScanKind, ScanNode, State, TrailerKind, Wait};

/// Largest TCK count in one TCK step.
const MAX_TCK: u64 = 0xFFFF;

/// Largest delay in one WAIT step, in either unit.
const MAX_WAIT: u64 = 0x7FFF;

/// Longest delay written in microseconds; longer delays are written in milliseconds.
const MAX_MICROS: f64 = 1000.0;

/// Longest delay accepted in one RUNTEST, in seconds.
const MAX_DELAY: f64 = 3600.0;

/// Most TCKs accepted in one RUNTEST.
const MAX_TICKS: u64 = 1 << 36;

/// TDI and MASK carried from one scan to the next scan of the same kind.
#[derive(Clone, Debug, Default)]
struct Sticky {
    length: usize,
    tdi: Option<Vec<u8>>,
    mask: Option<Vec<u8>>,
}

/// Vectors given in one SIR, SDR or trailer command.
#[derive(Default)]
struct Vectors {
    tdi: Option<Vec<u8>>,
    tdo: Option<Vec<u8>>,
    mask: Option<Vec<u8>>,
    crc: Option<Vec<u8>>,
    cmask: Option<Vec<u8>>,
    read: Option<Vec<u8>>,
    rmask: Option<Vec<u8>>,
    dmask: Option<Vec<u8>>,
}

/// Interprets SVF files into [`Command`]s for a [`Backend`].
///
/// One session is used for a whole output: [`Session::begin`] writes the
/// prologue, then [`Session::run`] is called once for each device.
pub struct Session {
    config: Config,
    end_ir: State,
    end_dr: State,
    frequency: u32,
    max_scan: usize,
    in_loop: bool,
    sir: Sticky,
    sdr: Sticky,
    previous_tdi: PreviousTdi,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let max_scan = config.row_size.bits();
        Session {
            config,
            end_ir: State::IRPAUSE,
            end_dr: State::DRPAUSE,
            frequency: 0,
            max_scan,
            in_loop: false,
            sir: Sticky::default(),
            sdr: Sticky::default(),
            previous_tdi: PreviousTdi::default(),
        }
    }

    /// Emit the header and the memory requirement for scans up to `max_scan` bits.
    pub fn begin<B: Backend + ?Sized>(&mut self, backend: &mut B, max_scan: usize) -> Result<()> {
        self.max_scan = max_scan;
        if let Some(header) = self.config.header.clone() {
            if !header.is_empty() {
                emit(backend, Command::Header(header))?;
            }
        }
        emit(backend, Command::Memory(max_scan))
    }

    /// Interpret the SVF file read from `reader` for `device`.
    pub fn run<R: BufRead, B: Backend + ?Sized>(&mut self, device: &Device, reader: R, backend: &mut B)
        -> Result<()>
    {
        self.end_ir = State::IRPAUSE;
        self.end_dr = State::DRPAUSE;
        self.frequency = device.frequency.unwrap_or(0);
        self.in_loop = false;
        self.sir = Sticky::default();
        self.sdr = Sticky::default();
        self.previous_tdi.clear();

        emit(backend, Command::Vendor(device.vendor))?;
        if let Some(fill) = &device.fill {
            for (kind, node) in fill.trailers() {
                emit(backend, Command::Trailer(kind, node))?;
            }
        }

        let mut tokens = Tokenizer::new(reader, self.config.preserve_comments);
        while let Some(token) = tokens.next_token()? {
            self.flush_comments(&mut tokens, backend)?;
            self.dispatch(device, token, &mut tokens, backend)?;
        }
        self.flush_comments(&mut tokens, backend)?;
        if self.in_loop {
            return Err(Error::UnterminatedLoop);
        }
        log::info!("Processed {} lines of SVF", tokens.line());
        Ok(())
    }

    fn flush_comments<R: BufRead, B: Backend + ?Sized>(&mut self, tokens: &mut Tokenizer<R>, backend: &mut B)
        -> Result<()>
    {
        for text in tokens.take_comments() {
            emit(backend, Command::Comment(text))?;
        }
        Ok(())
    }

    fn dispatch<R: BufRead, B: Backend + ?Sized>(
        &mut self, device: &Device, token: Token, tokens: &mut Tokenizer<R>, backend: &mut B,
    ) -> Result<()> {
        if token.is(";") {
            return Ok(());
        }
        let keyword = match token.keyword() {
            Some(keyword) => keyword,
            None => return Err(Error::UnknownCommand(token.loc, token.text)),
        };
        match keyword {
            Keyword::SIR => self.scan(ScanKind::Instruction, tokens, backend),
            Keyword::SDR => self.scan(ScanKind::Data, tokens, backend),
            Keyword::HIR => self.trailer(device, TrailerKind::HIR, tokens, backend),
            Keyword::TIR => self.trailer(device, TrailerKind::TIR, tokens, backend),
            Keyword::HDR => self.trailer(device, TrailerKind::HDR, tokens, backend),
            Keyword::TDR => self.trailer(device, TrailerKind::TDR, tokens, backend),
            Keyword::STATE => {
                for token in statement(tokens)? {
                    match token.state() {
                        Some(state) => emit(backend, Command::State(state))?,
                        None => log::warn!("Skipping unknown state '{}' at {}", token.text, token.loc),
                    }
                }
                Ok(())
            }
            Keyword::ENDIR => {
                self.end_ir = end_state(tokens, State::IRPAUSE)?;
                emit(backend, Command::EndIR(self.end_ir))
            }
            Keyword::ENDDR => {
                self.end_dr = end_state(tokens, State::DRPAUSE)?;
                emit(backend, Command::EndDR(self.end_dr))
            }
            Keyword::RUNTEST | Keyword::LDELAY => {
                let steps = self.run_test(device, tokens)?;
                emit(backend, Command::RunTest(steps))
            }
            Keyword::FREQUENCY => self.frequency_command(tokens, backend),
            Keyword::LOOP | Keyword::LCOUNT => {
                if self.in_loop {
                    return Err(Error::NestedLoop(token.loc));
                }
                let count = tokens.expect_token()?.decimal()?;
                end_statement(tokens)?;
                self.in_loop = true;
                emit(backend, Command::LoopBegin(count))
            }
            Keyword::ENDLOOP => {
                end_statement(tokens)?;
                self.end_loop(&token, backend)
            }
            Keyword::LSDR => {
                self.scan(ScanKind::Data, tokens, backend)?;
                self.end_loop(&token, backend)
            }
            Keyword::LVDS => {
                let pairs = self.lvds(tokens)?;
                emit(backend, Command::Lvds(pairs))
            }
            Keyword::TRST => {
                let high = statement(tokens)?.first().map(|t| t.is("OFF")).unwrap_or(false);
                emit(backend, Command::Trst(high))
            }
            Keyword::ISPEN => {
                let high = statement(tokens)?.first().map(|t| t.is("ON") || t.is("HIGH")).unwrap_or(false);
                emit(backend, Command::IspEn(high))
            }
            Keyword::VUES => {
                end_statement(tokens)?;
                emit(backend, Command::VerifyUsercode)
            }
            Keyword::TDI => {
                log::warn!("Skipping TDI outside of a scan at {}", token.loc);
                while !tokens.expect_token()?.is(")") {}
                Ok(())
            }
            _ => Err(Error::UnexpectedToken(token.loc, token.text)),
        }
    }

    fn end_loop<B: Backend + ?Sized>(&mut self, token: &Token, backend: &mut B) -> Result<()> {
        if !self.in_loop {
            return Err(Error::UnmatchedEndLoop(token.loc));
        }
        self.in_loop = false;
        emit(backend, Command::LoopEnd)
    }

    /// Read the vectors of a scan or trailer command of `length` bits, up to its `;`.
    fn vectors<R: BufRead>(&mut self, tokens: &mut Tokenizer<R>, length: usize) -> Result<Vectors> {
        let mut vectors = Vectors::default();
        loop {
            let token = tokens.expect_token()?;
            if token.is(";") {
                return Ok(vectors);
            }
            let slot = match token.keyword() {
                Some(Keyword::TDI)   => &mut vectors.tdi,
                Some(Keyword::TDO)   => &mut vectors.tdo,
                Some(Keyword::MASK)  => &mut vectors.mask,
                Some(Keyword::CRC)   => &mut vectors.crc,
                Some(Keyword::CMASK) => &mut vectors.cmask,
                Some(Keyword::READ)  => &mut vectors.read,
                Some(Keyword::RMASK) => &mut vectors.rmask,
                Some(Keyword::DMASK) => &mut vectors.dmask,
                Some(Keyword::SMASK) => {
                    hex_vector(tokens, length)?;
                    continue;
                }
                _ => return Err(Error::UnexpectedToken(token.loc, token.text)),
            };
            *slot = Some(hex_vector(tokens, length)?);
        }
    }

    fn scan<R: BufRead, B: Backend + ?Sized>(
        &mut self, kind: ScanKind, tokens: &mut Tokenizer<R>, backend: &mut B,
    ) -> Result<()> {
        let token = tokens.expect_token()?;
        let length = token.decimal()?;
        if length == 0 {
            return Err(Error::InvalidScanLength(token.loc));
        }
        let vectors = self.vectors(tokens, length)?;

        if kind == ScanKind::Instruction {
            // Any following SDR can no longer read back the previous TDI.
            self.sdr.tdi = None;
            self.previous_tdi.clear();
        }
        let sticky = match kind {
            ScanKind::Instruction => &mut self.sir,
            ScanKind::Data => &mut self.sdr,
        };
        if sticky.length != length {
            sticky.length = length;
            sticky.tdi = None;
            sticky.mask = None;
            if kind == ScanKind::Data {
                self.previous_tdi.clear();
            }
        }
        if vectors.tdi.is_some() {
            sticky.tdi = vectors.tdi;
        }
        if vectors.mask.is_some() {
            sticky.mask = vectors.mask;
        }
        let node = ScanNode {
            length,
            tdi: sticky.tdi.clone(),
            tdo: vectors.tdo,
            mask: sticky.mask.clone(),
            crc: vectors.crc,
            cmask: vectors.cmask,
            read: vectors.read,
            rmask: vectors.rmask,
            dmask: vectors.dmask,
        };

        let xtdo = kind == ScanKind::Data
            && node.tdo.as_ref().map(|tdo| self.previous_tdi.matches(length, tdo)).unwrap_or(false);
        if kind == ScanKind::Data {
            match &node.tdi {
                Some(tdi) => self.previous_tdi.set(length, tdi.clone()),
                None => self.previous_tdi.clear(),
            }
        }

        let row_bits = self.config.row_size.bits();
        let segments = scandata::cascade(length, row_bits);
        let cascaded = kind == ScanKind::Data && segments.len() > 1;
        if cascaded {
            emit(backend, Command::State(State::DRPAUSE))?;
        }
        emit(backend, Command::Scan(Scan { kind, node, xtdo, segments }))?;
        if cascaded {
            emit(backend, Command::State(self.end_dr))?;
        }
        Ok(())
    }

    fn trailer<R: BufRead, B: Backend + ?Sized>(
        &mut self, device: &Device, kind: TrailerKind, tokens: &mut Tokenizer<R>, backend: &mut B,
    ) -> Result<()> {
        if device.fill.is_some() {
            statement(tokens)?;
            return Ok(());
        }
        let token = tokens.expect_token()?;
        let length = token.decimal()?;
        let row_bits = self.config.row_size.bits();
        if length > row_bits {
            return Err(Error::ScanTooLong(token.loc, length, row_bits));
        }
        let vectors = self.vectors(tokens, length)?;
        let node = ScanNode {
            length,
            tdi: vectors.tdi,
            tdo: vectors.tdo,
            mask: vectors.mask,
            ..Default::default()
        };
        emit(backend, Command::Trailer(kind, node))
    }

    fn frequency_command<R: BufRead, B: Backend + ?Sized>(
        &mut self, tokens: &mut Tokenizer<R>, backend: &mut B,
    ) -> Result<()> {
        let args = statement(tokens)?;
        let hz = match args.first() {
            Some(token) => token.real()? as u32,
            None => return Ok(()),
        };
        if self.frequency == 0 || self.frequency > hz {
            self.frequency = hz;
        }
        emit(backend, Command::Frequency(self.frequency))
    }

    fn run_test<R: BufRead>(&mut self, device: &Device, tokens: &mut Tokenizer<R>) -> Result<Vec<RunTestStep>> {
        let mut steps = Vec::new();
        let mut state_named = false;
        loop {
            let token = tokens.expect_token()?;
            if token.is(";") {
                return Ok(steps);
            }
            if let Some(state) = token.state() {
                steps.push(RunTestStep::State(state));
                state_named = true;
            } else if token.is("MAXIMUM") {
                tokens.expect_token()?;
                tokens.expect_token()?;
            } else if token.is("ENDSTATE") {
                let next = tokens.expect_token()?;
                match next.state() {
                    Some(state) => steps.push(RunTestStep::State(state)),
                    None => log::warn!("Skipping unknown state '{}' at {}", next.text, next.loc),
                }
            } else if let Ok(count) = token.decimal() {
                let unit = tokens.expect_token()?;
                if count == 0 {
                    continue;
                }
                if !state_named {
                    steps.push(RunTestStep::State(State::IDLE));
                    state_named = true;
                }
                if unit.is("TCK") {
                    self.tck(device, count as u64, token.loc, &mut steps)?;
                } else if unit.is("SEC") {
                    self.seconds(device, count as f64, token.loc, &mut steps)?;
                } else {
                    return Err(Error::UnexpectedToken(unit.loc, unit.text));
                }
            } else {
                let seconds = token.real()?;
                let unit = tokens.expect_token()?;
                if !unit.is("SEC") {
                    return Err(Error::UnexpectedToken(unit.loc, unit.text));
                }
                self.seconds(device, seconds, token.loc, &mut steps)?;
            }
        }
    }

    /// Append steps for `ticks` TCKs, waiting out any beyond the configured limit.
    fn tck(&self, device: &Device, ticks: u64, loc: ErrLoc, steps: &mut Vec<RunTestStep>) -> Result<()> {
        match device.tck_limit {
            TckLimit::Limit(limit) if ticks > limit as u64 => {
                if self.frequency == 0 {
                    log::warn!("Cannot convert {} TCK to a delay without a frequency", ticks);
                    tck_steps(ticks, loc, steps)
                } else {
                    tck_steps(limit as u64, loc, steps)?;
                    let remaining = (ticks - limit as u64) as f64 / self.frequency as f64;
                    wait_steps(remaining, loc, steps)
                }
            }
            _ => tck_steps(ticks, loc, steps),
        }
    }

    /// Append steps waiting for `seconds`.
    fn seconds(&self, device: &Device, seconds: f64, loc: ErrLoc, steps: &mut Vec<RunTestStep>) -> Result<()> {
        if seconds > MAX_DELAY {
            return Err(Error::RunTestTooLong(loc));
        }
        if device.tck_limit == TckLimit::NoConversion {
            if self.frequency == 0 {
                log::warn!("Cannot convert {} SEC to TCK without a frequency, waiting instead", seconds);
            } else {
                return tck_steps((seconds * self.frequency as f64).ceil() as u64, loc, steps);
            }
        }
        wait_steps(seconds, loc, steps)
    }

    fn lvds<R: BufRead>(&mut self, tokens: &mut Tokenizer<R>) -> Result<Vec<(usize, usize)>> {
        let count_token = tokens.expect_token()?;
        let count = count_token.decimal()?;
        if count == 0 || !tokens.expect_token()?.is("(") {
            return Err(Error::InvalidLvds(count_token.loc));
        }
        let mut list = String::new();
        loop {
            let token = tokens.expect_token()?;
            if token.is(")") {
                break;
            }
            list.push_str(&token.text);
        }
        end_statement(tokens)?;

        let pairs = match all_consuming(pair_list)(list.as_str()) {
            Ok((_, pairs)) if pairs.len() == count => pairs,
            _ => return Err(Error::InvalidLvds(count_token.loc)),
        };
        let mut used = HashSet::new();
        for &(a, b) in pairs.iter() {
            for idx in [a, b].iter().copied() {
                if idx >= self.max_scan {
                    return Err(Error::LvdsIndexOutOfRange(count_token.loc, idx, self.max_scan));
                }
                if !used.insert(idx) {
                    return Err(Error::DuplicateLvdsIndex(count_token.loc, idx));
                }
            }
        }
        Ok(pairs)
    }
}

/// Log and execute a command.
fn emit<B: Backend + ?Sized>(backend: &mut B, command: Command) -> Result<()> {
    log::debug!("{}", command);
    backend.execute(&command)
}

/// Read the remaining tokens of a statement, consuming its `;`.
fn statement<R: BufRead>(tokens: &mut Tokenizer<R>) -> Result<Vec<Token>> {
    let mut args = Vec::new();
    loop {
        let token = tokens.expect_token()?;
        if token.is(";") {
            return Ok(args);
        }
        args.push(token);
    }
}

/// Consume the `;` ending a statement which takes no further arguments.
fn end_statement<R: BufRead>(tokens: &mut Tokenizer<R>) -> Result<()> {
    let token = tokens.expect_token()?;
    if token.is(";") {
        Ok(())
    } else {
        Err(Error::UnexpectedToken(token.loc, token.text))
    }
}

/// Read the argument of ENDIR or ENDDR, using `default` if no stable state is named.
fn end_state<R: BufRead>(tokens: &mut Tokenizer<R>, default: State) -> Result<State> {
    let args = statement(tokens)?;
    match args.iter().find_map(Token::state) {
        Some(state) => Ok(state),
        None => {
            if let Some(token) = args.first() {
                log::warn!("Unknown end state '{}' at {}, using {:?}", token.text, token.loc, default);
            }
            Ok(default)
        }
    }
}

/// Read a bracketed hexadecimal vector of `length` bits.
fn hex_vector<R: BufRead>(tokens: &mut Tokenizer<R>, length: usize) -> Result<Vec<u8>> {
    let open = tokens.expect_token()?;
    if !open.is("(") {
        return Err(Error::UnexpectedToken(open.loc, open.text));
    }
    let mut digits = String::new();
    loop {
        let token = tokens.expect_token()?;
        if token.is(")") {
            break;
        }
        if let Some((idx, c)) = token.text.char_indices().find(|(_, c)| !c.is_ascii_hexdigit()) {
            let loc = ErrLoc { line: token.loc.line, col: token.loc.col + idx };
            return Err(Error::InvalidHex(loc, c));
        }
        digits.try_reserve(token.text.len())?;
        digits.push_str(&token.text);
    }
    scandata::parse_vector(&digits, length)
}

/// Round `seconds` to whole microseconds, or milliseconds for longer delays,
/// and append WAIT steps covering it.
fn wait_steps(seconds: f64, loc: ErrLoc, steps: &mut Vec<RunTestStep>) -> Result<()> {
    if seconds > MAX_DELAY {
        return Err(Error::RunTestTooLong(loc));
    }
    let micros = (seconds * 1e6).round();
    if micros <= 0.0 {
        return Ok(());
    }
    if micros <= MAX_MICROS {
        steps.push(RunTestStep::Wait(Wait::Micros(micros as u16)));
        return Ok(());
    }
    let mut millis = (micros / 1000.0).ceil() as u64;
    while millis > MAX_WAIT {
        steps.push(RunTestStep::Wait(Wait::Millis(MAX_WAIT as u16)));
        millis -= MAX_WAIT;
    }
    steps.push(RunTestStep::Wait(Wait::Millis(millis as u16)));
    Ok(())
}

fn tck_steps(mut ticks: u64, loc: ErrLoc, steps: &mut Vec<RunTestStep>) -> Result<()> {
    if ticks > MAX_TICKS {
        return Err(Error::RunTestTooLong(loc));
    }
    while ticks > MAX_TCK {
        steps.push(RunTestStep::Tck(MAX_TCK as u16));
        ticks -= MAX_TCK;
    }
    if ticks > 0 {
        steps.push(RunTestStep::Tck(ticks as u16));
    }
    Ok(())
}

fn index(input: &str) -> IResult<&str, usize> {
    delimited(multispace0, map_res(digit1, |s: &str| s.parse::<usize>()), multispace0)(input)
}

/// Parse a list of LVDS pairs such as `1:2,3:4`.
fn pair_list(input: &str) -> IResult<&str, Vec<(usize, usize)>> {
    separated_list1(nom_char(','), separated_pair(index, nom_char(':'), index))(input)
}

/// Find the longest SIR or SDR in `svf`, limited to the row size.
pub fn max_scan_length(svf: &str, row_size: RowSize) -> Result<usize> {
    let mut tokens = Tokenizer::new(svf.as_bytes(), false);
    let mut max = 0;
    while let Some(token) = tokens.next_token()? {
        if matches!(token.keyword(), Some(Keyword::SIR) | Some(Keyword::SDR) | Some(Keyword::LSDR)) {
            if let Some(length) = tokens.next_token()?.and_then(|t| t.decimal().ok()) {
                max = max.max(length);
            }
        }
    }
    Ok(max.min(row_size.bits()))
}

/// Find the instruction register length of the device targeted by `svf`,
/// from the length of its first SIR.
pub fn ir_length(svf: &str) -> Result<Option<usize>> {
    let mut tokens = Tokenizer::new(svf.as_bytes(), false);
    while let Some(token) = tokens.next_token()? {
        if token.keyword() == Some(Keyword::SIR) {
            return Ok(tokens.next_token()?.and_then(|t| t.decimal().ok()));
        }
    }
    Ok(None)
}
