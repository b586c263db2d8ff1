//! Splits a byte stream into [`LogLine`]s, holding partial lines across reads

use crate::logline::LogLine;
use std::sync::Arc;

#[derive(Debug)]
pub struct LineReader {
    filename: Arc<str>,
    partial: Vec<u8>,
}

impl LineReader {
    pub fn new(filename: impl Into<Arc<str>>) -> Self {
        LineReader {
            filename: filename.into(),
            partial: Vec::new(),
        }
    }

    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    /// Append `bytes` and return every line they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LogLine> {
        let mut lines = Vec::new();
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// The unterminated remainder, if any
    pub fn flush(&mut self) -> Option<LogLine> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    /// Drop buffered bytes, after a truncation
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    fn take_line(&mut self) -> LogLine {
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        LogLine::new(Arc::clone(&self.filename), line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(lines: &[LogLine]) -> Vec<&str> {
        lines.iter().map(|l| l.line.as_str()).collect()
    }

    #[test]
    fn test_complete_lines() {
        let mut r = LineReader::new("f");
        assert_eq!(text(&r.feed(b"1\n2\n3\n")), vec!["1", "2", "3"]);
        assert!(r.flush().is_none());
    }

    #[test]
    fn test_partial_writes_join() {
        let mut r = LineReader::new("f");
        assert!(r.feed(b"a").is_empty());
        assert!(r.feed(b"b").is_empty());
        assert!(r.has_partial());
        assert_eq!(text(&r.feed(b"\n")), vec!["ab"]);
        assert!(!r.has_partial());
    }

    #[test]
    fn test_crlf_and_flush() {
        let mut r = LineReader::new("f");
        assert_eq!(text(&r.feed(b"x\r\ny")), vec!["x"]);
        assert_eq!(r.flush().unwrap().line, "y");
        assert!(r.flush().is_none());
    }

    #[test]
    fn test_empty_lines_are_kept() {
        let mut r = LineReader::new("f");
        assert_eq!(text(&r.feed(b"\n\nz\n")), vec!["", "", "z"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut r = LineReader::new("f");
        let lines = r.feed(b"a\xffb\n");
        assert_eq!(lines[0].line, "a\u{fffd}b");
    }
}
