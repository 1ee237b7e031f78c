//! Newline framing for the C-Gate byte streams
//!
//! C-Gate speaks an ASCII line protocol. Reads arrive in arbitrary chunks,
//! so the framer accumulates bytes and yields one callback per complete
//! line, keeping the residual after the last newline for the next feed.

use bytes::BytesMut;
use std::io;

/// A line that never terminates is a protocol violation, not backpressure.
const MAX_LINE_BYTES: usize = 64 * 1024;

pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    /// Feed a chunk of bytes; `on_line` is invoked once per complete line,
    /// trimmed of surrounding whitespace, with empty lines dropped.
    ///
    /// Returns an error when the unterminated residual exceeds the line
    /// cap; the owning connection must treat that as fatal for the socket.
    pub fn feed<F: FnMut(&str)>(&mut self, bytes: &[u8], mut on_line: F) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                on_line(trimmed);
            }
        }

        if self.buf.len() > MAX_LINE_BYTES {
            self.buf.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unterminated line exceeded {} bytes", MAX_LINE_BYTES),
            ));
        }

        Ok(())
    }

    /// Drop any buffered residual (used when a socket is torn down).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut LineFramer, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        framer.feed(bytes, |l| lines.push(l.to_string())).unwrap();
        lines
    }

    #[test]
    fn test_single_line() {
        let mut framer = LineFramer::new();
        assert_eq!(collect(&mut framer, b"lighting on 254/56/4\n"), vec!["lighting on 254/56/4"]);
    }

    #[test]
    fn test_split_across_feeds() {
        let mut framer = LineFramer::new();
        assert!(collect(&mut framer, b"lighting on 254").is_empty());
        assert_eq!(framer.pending(), 15);
        assert_eq!(collect(&mut framer, b"/56/4\nlighting "), vec!["lighting on 254/56/4"]);
        assert_eq!(collect(&mut framer, b"off 254/56/5\n"), vec!["lighting off 254/56/5"]);
    }

    #[test]
    fn test_multiple_lines_one_feed() {
        let mut framer = LineFramer::new();
        let lines = collect(&mut framer, b"300 a\n343 b\n347 c\n");
        assert_eq!(lines, vec!["300 a", "343 b", "347 c"]);
    }

    #[test]
    fn test_crlf_and_blank_lines_dropped() {
        let mut framer = LineFramer::new();
        let lines = collect(&mut framer, b"  300 ok  \r\n\r\n\n300 again\n");
        assert_eq!(lines, vec!["300 ok", "300 again"]);
    }

    #[test]
    fn test_oversized_residual_is_fatal() {
        let mut framer = LineFramer::new();
        let big = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(framer.feed(&big, |_| {}).is_err());
        // The poisoned buffer is discarded so a reconnect starts clean.
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_reset_clears_residual() {
        let mut framer = LineFramer::new();
        let _ = collect(&mut framer, b"partial");
        framer.reset();
        assert_eq!(collect(&mut framer, b"300 fresh\n"), vec!["300 fresh"]);
    }
}
