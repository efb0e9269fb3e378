//! Weight extraction from the ASCII lines printed by scale indicators.
//!
//! Vendors disagree on the format (`WT:  125.5 kg`, `GROSS:340.2KG`, `+089.7`,
//! bare numbers), so the line is normalised first and the first signed decimal
//! is taken. Anything outside the sanity bound is noise and yields `None`.

use regex::Regex;
use std::sync::LazyLock;

/// Labels and units printed around the number.
const STRIP_TOKENS: [&str; 5] = ["WT:", "GROSS:", "NET:", "TARE:", "KG"];

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[+-]?\d+\.?\d*").expect("static weight pattern")
});

pub fn parse_weight(line: &str, sanity_limit: f64) -> Option<f64> {
    let mut cleaned = line.to_uppercase();
    for token in STRIP_TOKENS {
        cleaned = cleaned.replace(token, "");
    }
    let cleaned = cleaned.trim();

    let m = NUMBER.find(cleaned)?;
    let value: f64 = m.as_str().parse().ok()?;
    if value.is_finite() && (-sanity_limit..=sanity_limit).contains(&value) {
        Some(value)
    } else {
        None
    }
}

/// Accumulates raw bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

/// Upper bound on a line without terminator, past this the buffer is dropped.
const MAX_PENDING: usize = 4096;

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        // indicators are ASCII, anything else is line noise
        self.pending
            .extend(bytes.iter().filter(|b| b.is_ascii()).map(|b| *b as char));

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find(['\n', '\r']) {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.pending.len() > MAX_PENDING {
            self.pending.clear();
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: f64 = 10_000.0;

    #[test]
    fn vendor_formats() {
        assert_eq!(parse_weight("WT:  125.5 kg\r\n", LIMIT), Some(125.5));
        assert_eq!(parse_weight("GROSS:340.2KG\r\n", LIMIT), Some(340.2));
        assert_eq!(parse_weight("+089.7\r\n", LIMIT), Some(89.7));
        assert_eq!(parse_weight("  125.5  \r\n", LIMIT), Some(125.5));
        assert_eq!(parse_weight("net:-12.0kg", LIMIT), Some(-12.0));
        assert_eq!(parse_weight("ST,GS,  0042.", LIMIT), Some(42.0));
    }

    #[test]
    fn rejects_lines_without_number() {
        assert_eq!(parse_weight("banana", LIMIT), None);
        assert_eq!(parse_weight("", LIMIT), None);
        assert_eq!(parse_weight("WT: -- kg", LIMIT), None);
    }

    #[test]
    fn out_of_range_values_are_dropped() {
        assert_eq!(parse_weight("10000.0", LIMIT), Some(10_000.0));
        assert_eq!(parse_weight("-10000", LIMIT), Some(-10_000.0));
        assert_eq!(parse_weight("10000.1", LIMIT), None);
        assert_eq!(parse_weight("GROSS:99999KG", LIMIT), None);
        assert_eq!(parse_weight("250", 100.0), None);
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"WT:  12").is_empty());
        assert_eq!(buf.push(b"5.5 kg\r\nGROSS:3"), vec!["WT:  125.5 kg".to_string()]);
        assert_eq!(buf.push(b"40.2KG\r\n\r\n"), vec!["GROSS:340.2KG".to_string()]);
        assert!(buf.push(b"\n").is_empty());
    }

    #[test]
    fn line_buffer_drops_runaway_garbage() {
        let mut buf = LineBuffer::default();
        let junk = vec![b'x'; MAX_PENDING + 10];
        assert!(buf.push(&junk).is_empty());
        assert_eq!(buf.push(b"+1.0\n"), vec!["+1.0".to_string()]);
    }
}
