//! Braille Encoding
//!
//! Stateless translation between symbols, dot patterns and wire bytes.
//!
//! # Cell layout
//!
//! ```text
//! 1 o o 4
//! 2 o o 5
//! 3 o o 6
//! ```
//!
//! # Wire byte
//!
//! ```text
//! bit:  7 6 5 4 3 2 1 0
//! dot:  - - 6 5 4 3 2 1
//! ```
//!
//! Bits 6-7 are always zero. An all-zero byte drives the cell flat.

use crate::error::PatternError;
use std::fmt;

/// Highest dot position in a six-dot cell.
pub const MAX_DOT: u8 = 6;

const DOT_MASK: u8 = 0b0011_1111;

/// Set of raised dots (1-6) forming one braille cell.
///
/// Stored as a bitmask so uniqueness and ordering hold by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DotPattern(u8);

impl DotPattern {
    /// The flat cell: no dots raised.
    pub const EMPTY: DotPattern = DotPattern(0);

    /// Build a pattern from dot numbers, rejecting anything outside 1..=6
    /// and repeated dots.
    pub fn new(dots: &[u8]) -> Result<Self, PatternError> {
        let mut mask = 0u8;
        for &dot in dots {
            if dot == 0 || dot > MAX_DOT {
                return Err(PatternError::OutOfRange(dot));
            }
            let bit = 1 << (dot - 1);
            if mask & bit != 0 {
                return Err(PatternError::Duplicate(dot));
            }
            mask |= bit;
        }
        Ok(Self(mask))
    }

    pub fn contains(&self, dot: u8) -> bool {
        (1..=MAX_DOT).contains(&dot) && self.0 & (1 << (dot - 1)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Raised dots in ascending order.
    pub fn dots(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=MAX_DOT).filter(move |d| self.contains(*d))
    }

    /// Unicode braille character for this cell (U+2800 block).
    pub fn to_unicode(&self) -> char {
        // Dots 1-6 occupy the low six bits of the block offset.
        char::from_u32(0x2800 + u32::from(self.0)).unwrap_or('\u{2800}')
    }
}

impl fmt::Display for DotPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.to_unicode())?;
        if self.is_empty() {
            return write!(f, "-");
        }
        for dot in self.dots() {
            write!(f, "{}", dot)?;
        }
        Ok(())
    }
}

/// Single command byte sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WireByte(u8);

impl WireByte {
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for WireByte {
    type Error = PatternError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value & !DOT_MASK != 0 {
            return Err(PatternError::ReservedBits(value));
        }
        Ok(Self(value))
    }
}

impl From<WireByte> for u8 {
    fn from(byte: WireByte) -> Self {
        byte.0
    }
}

impl fmt::Display for WireByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010b}", self.0)
    }
}

/// `OR` of `1 << (d - 1)` over every raised dot.
pub fn encode(pattern: DotPattern) -> WireByte {
    WireByte(pattern.dots().fold(0u8, |byte, d| byte | (1 << (d - 1))))
}

/// Inverse of [`encode`].
pub fn decode(byte: WireByte) -> DotPattern {
    DotPattern(byte.0 & DOT_MASK)
}

const fn cell(dots: &[u8]) -> DotPattern {
    let mut mask = 0u8;
    let mut i = 0;
    while i < dots.len() {
        mask |= 1 << (dots[i] - 1);
        i += 1;
    }
    DotPattern(mask)
}

/// Prefix announcing that the following a-j cells are digits.
pub const NUMBER_SIGN: DotPattern = cell(&[3, 4, 5, 6]);

/// Prefix announcing a capital letter.
pub const CAPITAL_SIGN: DotPattern = cell(&[6]);

const LETTERS: [DotPattern; 26] = [
    cell(&[1]),             // a
    cell(&[1, 2]),          // b
    cell(&[1, 4]),          // c
    cell(&[1, 4, 5]),       // d
    cell(&[1, 5]),          // e
    cell(&[1, 2, 4]),       // f
    cell(&[1, 2, 4, 5]),    // g
    cell(&[1, 2, 5]),       // h
    cell(&[2, 4]),          // i
    cell(&[2, 4, 5]),       // j
    cell(&[1, 3]),          // k
    cell(&[1, 2, 3]),       // l
    cell(&[1, 3, 4]),       // m
    cell(&[1, 3, 4, 5]),    // n
    cell(&[1, 3, 5]),       // o
    cell(&[1, 2, 3, 4]),    // p
    cell(&[1, 2, 3, 4, 5]), // q
    cell(&[1, 2, 3, 5]),    // r
    cell(&[2, 3, 4]),       // s
    cell(&[2, 3, 4, 5]),    // t
    cell(&[1, 3, 6]),       // u
    cell(&[1, 2, 3, 6]),    // v
    cell(&[2, 4, 5, 6]),    // w
    cell(&[1, 3, 4, 6]),    // x
    cell(&[1, 3, 4, 5, 6]), // y
    cell(&[1, 3, 5, 6]),    // z
];

const PUNCTUATION: &[(char, DotPattern)] = &[
    (',', cell(&[2])),
    (';', cell(&[2, 3])),
    (':', cell(&[2, 5])),
    ('.', cell(&[2, 5, 6])),
    ('!', cell(&[2, 3, 5])),
    ('?', cell(&[2, 3, 6])),
    ('\'', cell(&[3])),
    ('-', cell(&[3, 6])),
];

/// Single-cell contractions, keyed in upper case.
const CONTRACTIONS: &[(&str, DotPattern)] = &[
    ("AND", cell(&[1, 2, 3, 4, 6])),
    ("FOR", cell(&[1, 2, 3, 4, 5, 6])),
    ("OF", cell(&[1, 2, 3, 5, 6])),
    ("THE", cell(&[2, 3, 4, 6])),
    ("WITH", cell(&[2, 3, 4, 5, 6])),
    ("CH", cell(&[1, 6])),
    ("GH", cell(&[1, 2, 6])),
    ("SH", cell(&[1, 4, 6])),
    ("TH", cell(&[1, 4, 5, 6])),
    ("WH", cell(&[1, 5, 6])),
    ("ED", cell(&[1, 2, 4, 6])),
    ("ER", cell(&[1, 2, 4, 5, 6])),
    ("OU", cell(&[1, 2, 5, 6])),
    ("OW", cell(&[2, 4, 6])),
    ("ST", cell(&[3, 4])),
    ("AR", cell(&[3, 4, 5])),
    ("ING", cell(&[3, 4, 6])),
    ("EN", cell(&[2, 6])),
    ("IN", cell(&[3, 5])),
];

/// Pattern for one character. Digits use the a-j cells; anything not in
/// the table is the flat cell.
pub fn pattern_for_char(c: char) -> DotPattern {
    let c = c.to_ascii_lowercase();
    match c {
        'a'..='z' => LETTERS[(c as u8 - b'a') as usize],
        '1'..='9' => LETTERS[(c as u8 - b'1') as usize],
        '0' => LETTERS[9],
        _ => PUNCTUATION
            .iter()
            .find(|(p, _)| *p == c)
            .map(|(_, pattern)| *pattern)
            .unwrap_or(DotPattern::EMPTY),
    }
}

/// Pattern for a single character or a multi-letter contraction
/// ("AND", "th", "Ing"). Lookup is case-insensitive; unknown input yields
/// the flat cell.
pub fn pattern_for(symbol: &str) -> DotPattern {
    let symbol = symbol.trim();
    let mut chars = symbol.chars();
    match (chars.next(), chars.next()) {
        (None, _) => DotPattern::EMPTY,
        (Some(c), None) => pattern_for_char(c),
        _ => CONTRACTIONS
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(symbol))
            .map(|(_, pattern)| *pattern)
            .unwrap_or(DotPattern::EMPTY),
    }
}

/// Cell for the first character of a word, used for tactile feedback on
/// words and single letters.
pub fn first_cell(word: &str) -> DotPattern {
    word.trim()
        .chars()
        .next()
        .map(pattern_for_char)
        .unwrap_or(DotPattern::EMPTY)
}
