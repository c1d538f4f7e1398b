// Copyright 2021 Adam Greig
// Licensed under the MIT license.

use std::collections::VecDeque;
use std::io::BufRead;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{char as nom_char, digit1, multispace0, not_line_ending, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::many0,
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use nom_locate::LocatedSpan;

use crate::{Error, Result, State};

// Alias Span for brevity.
type Span<'a> = LocatedSpan<&'a str>;

/// Location of a token in the SVF file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ErrLoc {
    /// Line number, starting from 1.
    pub line: usize,
    /// Column number, starting from 1.
    pub col: usize,
}

impl std::fmt::Display for ErrLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "L{}:{}", self.line, self.col)
    }
}

/// SVF keywords recognised by the interpreter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    SIR, SDR, TDI, TDO, MASK, STATE, TCK, WAIT, XSDR, XTDI, XTDO, ENDDR, ENDIR,
    HIR, TIR, HDR, TDR, MEM, RUNTEST, ENDSTATE, TRST, FREQUENCY, SEC, SMASK,
    MAXIMUM, ON, OFF, ISPEN, HIGH, LOW, SETFLOW, RESETFLOW, REPEAT, ENDLOOP,
    CRC, CMASK, RMASK, READ, DMASK, VUES, LCOUNT, LDELAY, LSDR, LVDS, LOOP,
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        use Keyword::*;
        Ok(match s.to_ascii_uppercase().as_str() {
            "SIR"       => SIR,
            "SDR"       => SDR,
            "TDI"       => TDI,
            "TDO"       => TDO,
            "MASK"      => MASK,
            "STATE"     => STATE,
            "TCK"       => TCK,
            "WAIT"      => WAIT,
            "XSDR"      => XSDR,
            "XTDI"      => XTDI,
            "XTDO"      => XTDO,
            "ENDDR"     => ENDDR,
            "ENDIR"     => ENDIR,
            "HIR"       => HIR,
            "TIR"       => TIR,
            "HDR"       => HDR,
            "TDR"       => TDR,
            "MEM"       => MEM,
            "RUNTEST"   => RUNTEST,
            "ENDSTATE"  => ENDSTATE,
            "TRST"      => TRST,
            "FREQUENCY" => FREQUENCY,
            "SEC"       => SEC,
            "SMASK"     => SMASK,
            "MAXIMUM"   => MAXIMUM,
            "ON"        => ON,
            "OFF"       => OFF,
            "ISPEN"     => ISPEN,
            "HIGH"      => HIGH,
            "LOW"       => LOW,
            "SETFLOW"   => SETFLOW,
            "RESETFLOW" => RESETFLOW,
            "REPEAT"    => REPEAT,
            "ENDLOOP"   => ENDLOOP,
            "CRC"       => CRC,
            "CMASK"     => CMASK,
            "RMASK"     => RMASK,
            "READ"      => READ,
            "DMASK"     => DMASK,
            "VUES"      => VUES,
            "LCOUNT"    => LCOUNT,
            "LDELAY"    => LDELAY,
            "LSDR"      => LSDR,
            "LVDS"      => LVDS,
            "LOOP"      => LOOP,
            _           => return Err(()),
        })
    }
}

/// A single token from the SVF file.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub text: String,
    pub loc: ErrLoc,
}

impl Token {
    /// Case-insensitive comparison against `text`.
    pub fn is(&self, text: &str) -> bool {
        self.text.eq_ignore_ascii_case(text)
    }

    pub fn keyword(&self) -> Option<Keyword> {
        self.text.parse().ok()
    }

    /// Parse this token as one of the stable state names.
    pub fn state(&self) -> Option<State> {
        State::from_name(&self.text)
    }

    /// Parse this token as an unsigned decimal integer.
    pub fn decimal(&self) -> Result<usize> {
        all_consuming(decimal)(Span::new(&self.text))
            .map(|(_, n)| n)
            .map_err(|_| Error::InvalidNumber(self.loc, self.text.clone()))
    }

    /// Parse this token as a real number, such as `1.0E-3`.
    pub fn real(&self) -> Result<f64> {
        all_consuming(real)(Span::new(&self.text))
            .map(|(_, x)| x)
            .map_err(|_| Error::InvalidNumber(self.loc, self.text.clone()))
    }
}

/// Parse a decimal number.
fn decimal(input: Span) -> IResult<Span, usize> {
    map_res(digit1, |s: Span| s.fragment().parse::<usize>())(input)
}

/// Parse a real number, with optional fractional part and exponent.
fn real(input: Span) -> IResult<Span, f64> {
    map_res(
        recognize(
            tuple((
                digit1,
                opt(preceded(nom_char('.'), opt(digit1))),
                opt(preceded(
                    alt((nom_char('E'), nom_char('e'))),
                    tuple((opt(alt((nom_char('+'), nom_char('-')))), digit1))
                )),
            ))
        ),
        |float_str: Span| match float_str.fragment().parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(f),
            _ => Err(()),
        }
    )(input)
}

enum Lexeme<'a> {
    Word(Span<'a>),
    Comment(Span<'a>),
}

/// Parse a comment, which starts with `//` or `!` and finishes at the end of the line.
///
/// The returned span includes the comment marker.
fn comment(input: Span) -> IResult<Span, Span> {
    recognize(pair(alt((tag("//"), tag("!"))), not_line_ending))(input)
}

/// Statement terminator and brackets are always tokens of their own.
fn punct(input: Span) -> IResult<Span, Span> {
    recognize(one_of(";()"))(input)
}

fn word(input: Span) -> IResult<Span, Span> {
    is_not(" \t\r\n;()!/")(input)
}

fn lexeme(input: Span) -> IResult<Span, Lexeme> {
    preceded(
        multispace0,
        alt((
            map(comment, Lexeme::Comment),
            map(punct, Lexeme::Word),
            map(word, Lexeme::Word),
        ))
    )(input)
}

/// Split one line into lexemes, failing on anything that is neither.
fn line(input: Span) -> IResult<Span, Vec<Lexeme>> {
    all_consuming(terminated(many0(lexeme), multispace0))(input)
}

/// Reads SVF source one line at a time and hands out tokens.
pub struct Tokenizer<R> {
    reader: R,
    line: usize,
    pending: VecDeque<Token>,
    preserve_comments: bool,
    comments: Vec<String>,
}

impl<R: BufRead> Tokenizer<R> {
    /// Create a new tokenizer over `reader`.
    ///
    /// If `preserve_comments` is set, comment text is kept and can be
    /// collected with [`Tokenizer::take_comments`].
    pub fn new(reader: R, preserve_comments: bool) -> Self {
        Tokenizer {
            reader,
            line: 0,
            pending: VecDeque::new(),
            preserve_comments,
            comments: Vec::new(),
        }
    }

    /// Number of the most recently read line.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Return the next token, or None at the end of the input.
    pub fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            if !self.read_line()? {
                return Ok(None);
            }
        }
    }

    /// Return the next token, treating the end of the input as an error.
    pub fn expect_token(&mut self) -> Result<Token> {
        match self.next_token()? {
            Some(token) => Ok(token),
            None => Err(Error::UnexpectedEof(self.line)),
        }
    }

    /// Remove and return all comments read so far.
    pub fn take_comments(&mut self) -> Vec<String> {
        std::mem::take(&mut self.comments)
    }

    fn read_line(&mut self) -> Result<bool> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf)? == 0 {
            return Ok(false);
        }
        self.line += 1;
        let lineno = self.line;
        let text = buf.replace(|c: char| c == '\t' || c == '\r', " ");
        let (_, lexemes) = line(Span::new(&text)).map_err(|e| {
            let col = match e {
                nom::Err::Error(e) | nom::Err::Failure(e) => e.input.get_column(),
                nom::Err::Incomplete(_) => 1,
            };
            Error::StrayCharacter(ErrLoc { line: lineno, col })
        })?;
        for lexeme in lexemes {
            match lexeme {
                Lexeme::Word(span) => self.pending.push_back(Token {
                    text: span.fragment().to_string(),
                    loc: ErrLoc { line: lineno, col: span.get_column() },
                }),
                Lexeme::Comment(span) if self.preserve_comments => {
                    self.comments.push(span.fragment().trim_end().to_string());
                }
                Lexeme::Comment(_) => (),
            }
        }
        Ok(true)
    }
}
