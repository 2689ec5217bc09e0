//! Command verbs and argument parsing
//!
//! Parsing works on the raw command line as received, CRLF included.

use crate::bytes::{self, digit, index_of, to_upper};
use std::ops::Range;

/// Bytes separating command tokens.
pub const WHITESPACE: &[u8] = b" \r\n\t";

const SIZE_PARAM: &[u8] = b"SIZE=";

/// Every verb the server knows. Anything else is an unknown command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Rset,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Vrfy,
    Expn,
    Quit,
    Noop,
    Help,
}

const KNOWN_VERBS: [(&[u8], Verb); 11] = [
    (b"RSET", Verb::Rset),
    (b"HELO", Verb::Helo),
    (b"EHLO", Verb::Ehlo),
    (b"MAIL", Verb::Mail),
    (b"RCPT", Verb::Rcpt),
    (b"DATA", Verb::Data),
    (b"VRFY", Verb::Vrfy),
    (b"EXPN", Verb::Expn),
    (b"QUIT", Verb::Quit),
    (b"NOOP", Verb::Noop),
    (b"HELP", Verb::Help),
];

impl Verb {
    /// Match a command token, ignoring ASCII case.
    #[must_use]
    pub fn parse(token: &[u8]) -> Option<Self> {
        let mut word = [0u8; 4];
        if token.len() != word.len() {
            return None;
        }
        word.copy_from_slice(token);
        to_upper(&mut word);
        KNOWN_VERBS
            .iter()
            .find(|(name, _)| bytes::is_same(name, &word))
            .map(|&(_, verb)| verb)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rset => "RSET",
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Vrfy => "VRFY",
            Self::Expn => "EXPN",
            Self::Quit => "QUIT",
            Self::Noop => "NOOP",
            Self::Help => "HELP",
        }
    }
}

/// Where the mailbox of a `MAIL FROM:` / `RCPT TO:` line sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpan {
    /// Bytes strictly between `<` and `>`.
    pub address: Range<usize>,
    /// Offset just past the closing `>`; parameters follow from here.
    pub params_start: usize,
}

/// Locate the `<...>` path following the first colon of `line`.
///
/// Returns `None` when the colon or either bracket is missing.
#[must_use]
pub fn find_path(line: &[u8]) -> Option<PathSpan> {
    let colon = line.iter().position(|&b| b == b':')?;
    let lt = colon + 1 + line[colon + 1..].iter().position(|&b| b == b'<')?;
    let gt = lt + 1 + line[lt + 1..].iter().position(|&b| b == b'>')?;
    Some(PathSpan {
        address: lt + 1..gt,
        params_start: gt + 1,
    })
}

/// Decode an address span into a trimmed string.
#[must_use]
pub fn address_at(line: &[u8], span: &PathSpan) -> String {
    String::from_utf8_lossy(&line[span.address.clone()])
        .trim()
        .to_string()
}

/// Outcome of looking for a `SIZE=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredSize {
    /// No `SIZE=` parameter given.
    Unknown,
    /// Declared size in bytes. Values above the limit passed to
    /// [`parse_size`] are only guaranteed to stay above it, not exact.
    Bytes(u64),
    /// `SIZE=` present but not followed by a run of digits.
    Malformed,
}

/// Parse the `SIZE=` parameter out of the MAIL parameters.
///
/// `params` is upper-cased in place so the keyword matches in any case.
/// Accumulation stops once the running value exceeds `max`: further
/// digits can only make it larger, so overflow is never reached.
pub fn parse_size(params: &mut [u8], max: u64) -> DeclaredSize {
    to_upper(params);
    let Some(at) = index_of(SIZE_PARAM, params) else {
        return DeclaredSize::Unknown;
    };

    let value = &params[at + SIZE_PARAM.len()..];
    let digits = value
        .iter()
        .position(|b| WHITESPACE.contains(b))
        .map_or(value, |end| &value[..end]);
    if digits.is_empty() {
        return DeclaredSize::Malformed;
    }

    let mut size: u64 = 0;
    for &b in digits {
        let Some(d) = digit(b) else {
            return DeclaredSize::Malformed;
        };
        if size <= max {
            size = size.saturating_mul(10).saturating_add(u64::from(d));
        }
    }
    DeclaredSize::Bytes(size)
}
