use std::fmt::Write as _;

/// CSI sequences used for in-place redraw. These values are fixed; when
/// the destination is not a terminal, none of them are ever emitted.
pub(crate) const SAVE_CURSOR: &str = "\x1b[s";
pub(crate) const RESTORE_CURSOR: &str = "\x1b[u";
pub(crate) const LINE_START: &str = "\r";
pub(crate) const ERASE_TO_EOL: &str = "\x1b[K";

/// Move the cursor up `n` lines.
pub(crate) fn cursor_up(out: &mut String, n: usize) {
    if n > 0 {
        // _: fmt for string does not fail
        let _ = write!(out, "\x1b[{n}A");
    }
}

/// Move the cursor down `n` lines.
pub(crate) fn cursor_down(out: &mut String, n: usize) {
    if n > 0 {
        let _ = write!(out, "\x1b[{n}B");
    }
}

/// Erase `n` characters from the cursor position without moving it.
pub(crate) fn erase_chars(out: &mut String, n: usize) {
    if n > 0 {
        let _ = write!(out, "\x1b[{n}X");
    }
}

/// Iterator of (char, width) that assigns zero width to ANSI escape
/// sequences, so already-colored frames can be truncated to a column
/// budget.
pub(crate) fn with_width(x: std::str::Chars<'_>) -> AnsiWidthIter<'_> {
    AnsiWidthIter {
        is_escaping: false,
        chars: x,
    }
}

/// Visible column width of a string, ignoring embedded escape sequences.
pub(crate) fn visible_width(x: &str) -> usize {
    with_width(x.chars()).map(|(_, w)| w).sum()
}

pub(crate) struct AnsiWidthIter<'a> {
    is_escaping: bool,
    chars: std::str::Chars<'a>,
}

impl<'a> Iterator for AnsiWidthIter<'a> {
    type Item = (char, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let c = self.chars.next()?;
        let width = if self.is_escaping {
            if is_ansi_end_char(c) {
                self.is_escaping = false;
            }
            0
        } else if c == '\x1b' {
            self.is_escaping = true;
            0
        } else {
            use unicode_width::UnicodeWidthChar;
            c.width_cjk().unwrap_or(0)
        };

        Some((c, width))
    }
}

pub(crate) fn is_ansi_end_char(c: char) -> bool {
    // we only do very basic check right now
    c < u8::MAX as char && b"mAKGJBCDEFHSTfhlinsuX".contains(&(c as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_sequences() {
        let mut out = String::new();
        cursor_up(&mut out, 3);
        cursor_down(&mut out, 1);
        erase_chars(&mut out, 12);
        assert_eq!(out, "\x1b[3A\x1b[1B\x1b[12X");
        out.clear();
        cursor_up(&mut out, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn escape_aware_width() {
        assert_eq!(visible_width("abc"), 3);
        assert_eq!(visible_width("\x1b[1;33mabc\x1b[0m"), 3);
        // full-width CJK counts as two columns
        assert_eq!(visible_width("\u{4f60}\u{597d}"), 4);
    }
}
