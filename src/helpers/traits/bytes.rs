use crate::error::NoSeparator;

pub const HEADER_BODY_SEPARATOR: &[u8] = b"\r\n\r\n";

pub trait SplitBytes {
    fn find_bytes(&self, pattern: &[u8]) -> Option<usize>;
    fn split_header_body(&self) -> Result<(&[u8], &[u8]), NoSeparator>;
    fn find_blank_line(&self) -> Option<(usize, usize)>;
    fn lines(&self) -> LineIterator<'_>;
}

impl SplitBytes for [u8] {
    fn find_bytes(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() || pattern.len() > self.len() {
            return None;
        }
        self.windows(pattern.len())
            .position(|window| window == pattern)
    }

    /// Splits on the first `\r\n\r\n`. Anything separator-like after it stays
    /// in the body.
    fn split_header_body(&self) -> Result<(&[u8], &[u8]), NoSeparator> {
        let pos = self.find_bytes(HEADER_BODY_SEPARATOR).ok_or(NoSeparator)?;
        Ok((&self[..pos], &self[pos + HEADER_BODY_SEPARATOR.len()..]))
    }

    /// Lenient header terminator search used inside multipart parts: accepts
    /// `\r\n\r\n` as well as bare `\n\n`. Returns `(header_end, body_start)`.
    fn find_blank_line(&self) -> Option<(usize, usize)> {
        let crlf = self.find_bytes(b"\r\n\r\n").map(|pos| (pos, pos + 4));
        let lf = self.find_bytes(b"\n\n").map(|pos| (pos, pos + 2));
        match (crlf, lf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn lines(&self) -> LineIterator<'_> {
        LineIterator { data: self, pos: 0 }
    }
}

/// Iterates lines ending in `\n` or `\r\n`, without the terminator.
pub struct LineIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for LineIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let start = self.pos;
        match self.data[start..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let end = start + offset;
                self.pos = end + 1;
                let line_end = if end > start && self.data[end - 1] == b'\r' {
                    end - 1
                } else {
                    end
                };
                Some(&self.data[start..line_end])
            }
            None => {
                self.pos = self.data.len();
                Some(&self.data[start..])
            }
        }
    }
}
