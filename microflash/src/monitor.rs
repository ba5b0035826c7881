//! Serial console text handling.
//!
//! DAPLink hands serial output over in packet-sized pieces that may split
//! UTF-8 sequences. [`drain_utf8_lossy`] turns a byte buffer into text while
//! holding back an incomplete tail. [`TracebackScrollback`] watches the text
//! for MicroPython tracebacks so a front end can point at the failing line.

use std::collections::VecDeque;

/// Characters of serial output kept for traceback detection.
pub const SCROLLBACK_LIMIT: usize = 4096;

const TRACEBACK_START: &str = "Traceback (most recent call last):";

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// Invalid sequences become `\u{FFFD}`. An incomplete sequence at the end
/// stays in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        let err = match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                return output;
            },
            Err(err) => err,
        };

        let valid_up_to = err.valid_up_to();
        output.push_str(&String::from_utf8_lossy(&buffer[..valid_up_to]));

        match err.error_len() {
            Some(invalid_len) => {
                output.push(char::REPLACEMENT_CHARACTER);
                let end = (valid_up_to + invalid_len).min(buffer.len());
                buffer.drain(..end);
            },
            None => {
                buffer.drain(..valid_up_to);
                return output;
            },
        }
    }
}

/// Drop control characters other than newline and tab; lone `\r` becomes `\n`.
pub fn clean_monitor_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .chars()
        .filter_map(|ch| match ch {
            '\r' => Some('\n'),
            '\n' | '\t' => Some(ch),
            _ if ch.is_control() => None,
            _ => Some(ch),
        })
        .collect()
}

/// Convert line endings to `\r\n` for a raw-mode terminal, optionally
/// prefixing each line with a wall-clock timestamp.
pub fn format_monitor_output(text: &str, timestamp: bool, at_line_start: &mut bool) -> String {
    let normalized = text
        .replace("\r\n", "\n")
        .replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len() + 16);

    for ch in normalized.chars() {
        if ch == '\n' {
            out.push_str("\r\n");
            *at_line_start = true;
            continue;
        }
        if timestamp && *at_line_start {
            out.push_str(&timestamp_prefix());
        }
        *at_line_start = false;
        out.push(ch);
    }

    out
}

fn timestamp_prefix() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    format!(
        "\x1b[90m[{:02}:{:02}:{:02}.{:03}]\x1b[0m ",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}

/// A MicroPython runtime error seen on the serial console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceback {
    /// The error line, e.g. `NameError: name 'x' isn't defined`.
    pub error: String,
    /// Trimmed stack lines, outermost first.
    pub trace: Vec<String>,
}

impl Traceback {
    /// File of the innermost frame. `__main__` is reported as `main.py`;
    /// REPL input has no file.
    pub fn file(&self) -> Option<String> {
        match self.innermost()? {
            ("stdin", _) => None,
            ("__main__", _) => Some("main.py".to_string()),
            (file, _) => Some(file.to_string()),
        }
    }

    /// Line of the innermost frame.
    pub fn line(&self) -> Option<u32> {
        self.innermost()
            .and_then(|(_, line)| line)
    }

    fn innermost(&self) -> Option<(&str, Option<u32>)> {
        parse_trace_line(self.trace.last()?)
    }
}

/// Parse `File "main.py", line 5, in foo` into its file and line.
fn parse_trace_line(line: &str) -> Option<(&str, Option<u32>)> {
    let rest = line
        .trim()
        .strip_prefix("File ")?;
    let rest = rest.trim_start_matches(['"', '<']);
    let end = rest.find(['"', '>'])?;
    let file = &rest[..end];

    let number = rest[end + 1..]
        .trim_start_matches(['"', '>'])
        .strip_prefix(", line ")
        .map(|s| {
            s.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok());

    Some((file, number))
}

/// Rolling view of recent serial output that finds the latest traceback.
#[derive(Debug, Default)]
pub struct TracebackScrollback {
    text: VecDeque<char>,
}

impl TracebackScrollback {
    /// Create an empty scrollback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append serial text and return the most recent traceback, if the
    /// scrollback currently ends with one that came from a running program.
    pub fn push(&mut self, data: &str) -> Option<Traceback> {
        self.text
            .extend(data.chars());
        let excess = self
            .text
            .len()
            .saturating_sub(SCROLLBACK_LIMIT);
        self.text
            .drain(..excess);

        let text: String = self
            .text
            .iter()
            .collect();
        latest_traceback(&text)
    }

    /// Forget everything seen so far.
    pub fn clear(&mut self) {
        self.text
            .clear();
    }
}

fn latest_traceback(text: &str) -> Option<Traceback> {
    let lines: Vec<&str> = text
        .split("\r\n")
        .collect();
    let start = lines
        .iter()
        .rposition(|line| line.starts_with(TRACEBACK_START))?;

    let frames = lines[start + 1..]
        .iter()
        .take_while(|line| line.starts_with("  "))
        .count();
    let error = lines.get(start + 1 + frames)?;

    let trace: Vec<String> = lines[start + 1..start + 1 + frames]
        .iter()
        .map(|line| line.trim().to_string())
        .collect();

    // typed at the REPL
    if trace
        .first()
        .is_some_and(|first| first.starts_with("File \"<stdin>\""))
    {
        return None;
    }
    if error.starts_with("KeyboardInterrupt") {
        return None;
    }

    Some(Traceback {
        error: (*error).to_string(),
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crlf(text: &str) -> String {
        text.replace('\n', "\r\n")
    }

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid_bytes_and_continues() {
        let mut buf = vec![0xFF, b'A', 0xFE, b'B'];
        assert_eq!(drain_utf8_lossy(&mut buf), "\u{FFFD}A\u{FFFD}B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_utf8_lossy_keeps_incomplete_suffix() {
        // lead byte of U+00E9
        let mut buf = vec![b'x', 0xC3];
        assert_eq!(drain_utf8_lossy(&mut buf), "x");
        assert_eq!(buf, [0xC3]);

        buf.push(0xA9);
        assert_eq!(drain_utf8_lossy(&mut buf), "\u{e9}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_clean_monitor_text() {
        assert_eq!(clean_monitor_text("A\x07B\x1bC\tD\r\nE\rF"), "ABC\tD\nE\nF");
    }

    #[test]
    fn test_format_output_tracks_line_start() {
        let mut at_line_start = true;
        assert_eq!(format_monitor_output("abc\rdef", false, &mut at_line_start), "abc\r\ndef");
        assert!(!at_line_start);
        assert_eq!(format_monitor_output("\n", false, &mut at_line_start), "\r\n");
        assert!(at_line_start);
    }

    #[test]
    fn test_format_output_timestamps_each_line() {
        let mut at_line_start = true;
        let out = format_monitor_output("a\nb", true, &mut at_line_start);
        assert_eq!(out.matches("\x1b[90m[").count(), 2);
    }

    #[test]
    fn test_traceback_found() {
        let mut scrollback = TracebackScrollback::new();
        let traceback = scrollback
            .push(&crlf(
                "Misc output\n>>> Other stuff\nTraceback (most recent call last):\n  File \"main.py\", line 7, in <module>\n  File \"main.py\", line 5, in foo\nRuntimeError: maximum recursion depth exceeded\n\n>>> ",
            ))
            .unwrap();

        assert_eq!(traceback.error, "RuntimeError: maximum recursion depth exceeded");
        assert_eq!(traceback.trace[0], "File \"main.py\", line 7, in <module>");
        assert_eq!(traceback.file().as_deref(), Some("main.py"));
        assert_eq!(traceback.line(), Some(5));
    }

    #[test]
    fn test_traceback_latest_wins() {
        let mut scrollback = TracebackScrollback::new();
        let traceback = scrollback
            .push(&crlf(
                "Traceback (most recent call last):\n  File \"main.py\", line 5, in foo\nRuntimeError: 1\nTraceback (most recent call last):\n  File \"main.py\", line 5, in foo\nRuntimeError: 2\n",
            ))
            .unwrap();
        assert_eq!(traceback.error, "RuntimeError: 2");
    }

    #[test]
    fn test_traceback_ignores_repl_input() {
        let mut scrollback = TracebackScrollback::new();
        assert!(scrollback
            .push(&crlf(
                ">>> bar()\nTraceback (most recent call last):\n  File \"<stdin>\", line 1, in <module>\n  File \"main.py\", line 5, in bar\nValueError: Wow!",
            ))
            .is_none());
    }

    #[test]
    fn test_traceback_ignores_keyboard_interrupt() {
        let mut scrollback = TracebackScrollback::new();
        assert!(scrollback
            .push(&crlf(
                "Traceback (most recent call last):\n  File \"main.py\", line 10, in <module>\nKeyboardInterrupt:",
            ))
            .is_none());
    }

    #[test]
    fn test_traceback_waits_for_error_line() {
        let mut scrollback = TracebackScrollback::new();
        assert!(scrollback
            .push(&crlf("Traceback (most recent call last):\n  File \"main.py\", line 3"))
            .is_none());
        let traceback = scrollback
            .push(&crlf(", in <module>\nNameError: x\n"))
            .unwrap();
        assert_eq!(traceback.line(), Some(3));
    }

    #[test]
    fn test_traceback_main_module_maps_to_main_py() {
        let traceback = Traceback {
            error: "E".to_string(),
            trace: vec!["File \"__main__\", line 2, in <module>".to_string()],
        };
        assert_eq!(traceback.file().as_deref(), Some("main.py"));
        assert_eq!(traceback.line(), Some(2));
    }

    #[test]
    fn test_scrollback_is_bounded() {
        let mut scrollback = TracebackScrollback::new();
        scrollback.push(&crlf(
            "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\nValueError: old\n",
        ));
        let traceback = scrollback.push(&"x".repeat(SCROLLBACK_LIMIT));

        assert!(traceback.is_none());
        assert_eq!(scrollback.text.len(), SCROLLBACK_LIMIT);

        scrollback.clear();
        assert!(scrollback.text.is_empty());
    }
}
