//! Allocation-free helpers over raw byte regions
//!
//! The protocol layer works directly on the connection's re-assembly
//! buffer. These helpers let it fold case, compare and tokenize command
//! lines without turning every token into an owned `String`.
//!
//! All lookups go through the constant tables below, which are built at
//! compile time and never mutated.

/// Maps every byte to its ASCII uppercase form; non-letters map to
/// themselves.
pub static ALPHA_UPPER: [u8; 256] = build_upper_table();

/// Maps `b'0'..=b'9'` to their numeric value and every other byte to
/// [`NOT_A_DIGIT`].
pub static DIGITS: [u8; 256] = build_digit_table();

/// Marker used by [`DIGITS`] for non-digit bytes.
pub const NOT_A_DIGIT: u8 = 0xFF;

const fn build_upper_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        #[allow(clippy::cast_possible_truncation)]
        let b = i as u8;
        table[i] = if b.is_ascii_lowercase() { b - 32 } else { b };
        i += 1;
    }
    table
}

const fn build_digit_table() -> [u8; 256] {
    let mut table = [NOT_A_DIGIT; 256];
    let mut i = b'0';
    while i <= b'9' {
        table[i as usize] = i - b'0';
        i += 1;
    }
    table
}

/// Uppercase the ASCII letters of `region` in place.
pub fn to_upper(region: &mut [u8]) {
    for b in region {
        *b = ALPHA_UPPER[usize::from(*b)];
    }
}

/// Numeric value of an ASCII digit, `None` for anything else.
#[must_use]
pub fn digit(b: u8) -> Option<u8> {
    match DIGITS[usize::from(b)] {
        NOT_A_DIGIT => None,
        d => Some(d),
    }
}

/// Exact byte equality.
#[must_use]
pub fn is_same(pattern: &[u8], region: &[u8]) -> bool {
    pattern.len() == region.len() && pattern == region
}

#[must_use]
pub fn starts_with(pattern: &[u8], region: &[u8]) -> bool {
    region.len() >= pattern.len() && &region[..pattern.len()] == pattern
}

#[must_use]
pub fn ends_with(pattern: &[u8], region: &[u8]) -> bool {
    region.len() >= pattern.len() && &region[region.len() - pattern.len()..] == pattern
}

/// Offset of the first occurrence of `pattern` in `region`.
///
/// A plain scan: command lines and body lines are short enough that a
/// sublinear search would not pay for itself. An empty pattern matches at
/// offset 0.
#[must_use]
pub fn index_of(pattern: &[u8], region: &[u8]) -> Option<usize> {
    if pattern.len() > region.len() {
        return None;
    }
    (0..=region.len() - pattern.len()).find(|&start| starts_with(pattern, &region[start..]))
}

/// Split `region` on any byte contained in `delimiters`.
///
/// Runs of delimiters are collapsed, so the iterator never yields an
/// empty token. Tokens borrow from `region`.
#[must_use]
pub const fn split<'a>(region: &'a [u8], delimiters: &'a [u8]) -> Split<'a> {
    Split {
        rest: region,
        delimiters,
    }
}

/// Iterator returned by [`split`].
#[derive(Debug, Clone)]
pub struct Split<'a> {
    rest: &'a [u8],
    delimiters: &'a [u8],
}

impl<'a> Iterator for Split<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let start = self
            .rest
            .iter()
            .position(|b| !self.delimiters.contains(b))?;
        let tail = &self.rest[start..];
        let len = tail
            .iter()
            .position(|b| self.delimiters.contains(b))
            .unwrap_or(tail.len());
        let (token, rest) = tail.split_at(len);
        self.rest = rest;
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WS: &[u8] = b" \r\n\t";

    #[test]
    fn upper_only_touches_letters() {
        let mut line = *b"ehlo mx-1.example{}[]@`~\xff";
        to_upper(&mut line);
        assert_eq!(&line, b"EHLO MX-1.EXAMPLE{}[]@`~\xff");
    }

    #[test]
    fn digit_table() {
        assert_eq!(digit(b'0'), Some(0));
        assert_eq!(digit(b'9'), Some(9));
        assert_eq!(digit(b'a'), None);
        assert_eq!(digit(b'/'), None);
        assert_eq!(digit(b':'), None);
    }

    #[test]
    fn comparisons() {
        assert!(is_same(b"DATA", b"DATA"));
        assert!(!is_same(b"DATA", b"DATA "));
        assert!(!is_same(b"DATA", b"DAT"));

        assert!(starts_with(b".\r\n", b".\r\n"));
        assert!(starts_with(b"MAIL", b"MAIL FROM:<a@b>"));
        assert!(!starts_with(b"MAIL FROM", b"MAIL"));

        assert!(ends_with(b"\r\n", b"QUIT\r\n"));
        assert!(!ends_with(b"\r\n", b"QUIT\n"));
        assert!(!ends_with(b"QUIT\r\n", b"\r\n"));
    }

    #[test]
    fn index_of_finds_first_match() {
        assert_eq!(index_of(b"\r\n", b"HELO x\r\nQUIT\r\n"), Some(6));
        assert_eq!(index_of(b"SIZE=", b"<a@b> SIZE=10"), Some(6));
        assert_eq!(index_of(b"\r\n", b"HELO x\r"), None);
        assert_eq!(index_of(b"long pattern", b"short"), None);
        assert_eq!(index_of(b"", b"abc"), Some(0));
    }

    #[test]
    fn split_collapses_delimiters() {
        let tokens: Vec<&[u8]> = split(b"  MAIL \t FROM:<a@b>  SIZE=12\r\n", WS).collect();
        assert_eq!(tokens, vec![&b"MAIL"[..], &b"FROM:<a@b>"[..], &b"SIZE=12"[..]]);
    }

    #[test]
    fn split_of_blank_line_is_empty() {
        assert_eq!(split(b"\r\n", WS).count(), 0);
        assert_eq!(split(b"", WS).count(), 0);
    }

    proptest! {
        #[test]
        fn split_never_yields_empty_tokens(input in proptest::collection::vec(any::<u8>(), 0..128)) {
            for token in split(&input, WS) {
                prop_assert!(!token.is_empty());
                prop_assert!(token.iter().all(|b| !WS.contains(b)));
            }
        }

        #[test]
        fn split_rejoins_to_collapsed_input(input in "[a-c ]{0,64}") {
            let tokens: Vec<&[u8]> = split(input.as_bytes(), b" ").collect();
            let rejoined = tokens.join(&b' ');
            let collapsed = input.split(' ').filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ");
            prop_assert_eq!(rejoined, collapsed.into_bytes());
        }

        #[test]
        fn split_keeps_every_non_delimiter_byte(input in proptest::collection::vec(any::<u8>(), 0..128)) {
            let kept: Vec<u8> = split(&input, WS).flatten().copied().collect();
            let expected: Vec<u8> = input.iter().copied().filter(|b| !WS.contains(b)).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
