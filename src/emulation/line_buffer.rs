use crate::error_handling::types::SessionFault;

/// Longest line a line-oriented emulator accepts.
pub const MAX_LINE_LEN: usize = 1024;

/// Accumulates bytes and yields complete lines (`\n` or `\r\n` terminated).
///
/// The pending partial line is capped at `max_line` bytes so a peer that never
/// sends a newline cannot grow the buffer.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE_LEN)
    }
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, SessionFault> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                lines.push(String::from_utf8_lossy(&line).into_owned());
                continue;
            }
            if self.pending.len() >= self.max_line {
                return Err(SessionFault::oversized(format!(
                    "line exceeds {} bytes",
                    self.max_line
                )));
            }
            self.pending.push(b);
        }
        Ok(lines)
    }

    /// The unterminated tail, if any.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::types::FaultKind;

    #[test]
    fn test_splits_lines_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"USER ro").unwrap().is_empty());
        assert_eq!(buf.push(b"ot\r\nPASS x\n").unwrap(), vec!["USER root", "PASS x"]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"ls \xff\xfe\n").unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ls "));
    }

    #[test]
    fn test_overlong_line_faults() {
        let mut buf = LineBuffer::new(8);
        let err = buf.push(b"0123456789").unwrap_err();
        assert_eq!(err.kind, FaultKind::Oversized);
    }
}
