//! Incremental log scanning.

use regex::Regex;

/// Longest partial line carried between chunks. Output that runs past it
/// without a newline is scanned as a line of its own.
pub const MAX_PARTIAL_LINE: usize = 1024 * 1024;

/// Counts pattern matches over a log delivered in arbitrary chunks.
///
/// Matching happens on complete lines; a trailing partial line is carried to
/// the next chunk, so the count never depends on where chunks were split.
/// The exception is a line longer than [`MAX_PARTIAL_LINE`], which is cut
/// there.
#[derive(Debug, Clone)]
pub struct LogScanner {
    pattern: Regex,
    partial: Vec<u8>,
    matches: usize,
}

impl LogScanner {
    /// Create a scanner for a pattern.
    #[must_use]
    pub const fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            partial: Vec::new(),
            matches: 0,
        }
    }

    /// Feed the next chunk of output.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);
        if let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
            for line in complete.split(|b| *b == b'\n') {
                self.count_line(line);
            }
        }
        while self.partial.len() > MAX_PARTIAL_LINE {
            let head: Vec<u8> = self.partial.drain(..MAX_PARTIAL_LINE).collect();
            self.count_line(&head);
        }
    }

    /// Count the trailing partial line, once the stream has ended.
    pub fn finish(&mut self) {
        let rest = std::mem::take(&mut self.partial);
        self.count_line(&rest);
    }

    /// Matches seen so far.
    #[must_use]
    pub const fn matches(&self) -> usize {
        self.matches
    }

    fn count_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line);
        self.matches += self.pattern.find_iter(&text).count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scanner(pattern: &str) -> LogScanner {
        LogScanner::new(Regex::new(pattern).unwrap())
    }

    #[test]
    fn counts_across_chunks() {
        let mut s = scanner("ready");
        s.feed(b"starting\nrea");
        assert_eq!(s.matches(), 0);
        s.feed(b"dy to accept connections\n");
        assert_eq!(s.matches(), 1);
        s.feed(b"ready ready\n");
        assert_eq!(s.matches(), 3);
    }

    #[test]
    fn partial_line_counts_on_finish() {
        let mut s = scanner("^done$");
        s.feed(b"working\r\ndone");
        assert_eq!(s.matches(), 0);
        s.finish();
        assert_eq!(s.matches(), 1);
    }

    #[test]
    fn anchors_apply_per_line() {
        let mut s = scanner("^ready$");
        s.feed(b"ready\nnot ready\nready\n");
        assert_eq!(s.matches(), 2);
    }

    #[test]
    fn endless_line_is_cut_at_the_cap() {
        let mut s = scanner("ready");
        let filler = vec![b'x'; MAX_PARTIAL_LINE - 5];
        s.feed(&filler);
        s.feed(b"ready");
        assert_eq!(s.matches(), 0);
        s.feed(b"xxxx");
        assert_eq!(s.matches(), 1);
        assert!(s.partial.len() <= MAX_PARTIAL_LINE);

        for _ in 0..4 {
            s.feed(&filler);
        }
        assert!(s.partial.len() <= MAX_PARTIAL_LINE);
        s.feed(b"\nready\n");
        assert_eq!(s.matches(), 2);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_the_count(
            lines in prop::collection::vec("(ready|booting|database system is ready|x{0,5})", 0..20),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let text = lines.join("\n");
            let bytes = text.as_bytes();

            let mut whole = scanner("ready");
            whole.feed(bytes);
            whole.finish();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.sort_unstable();
            let mut chunked = scanner("ready");
            let mut start = 0;
            for point in points {
                chunked.feed(&bytes[start..point]);
                start = point;
            }
            chunked.feed(&bytes[start..]);
            chunked.finish();

            prop_assert_eq!(whole.matches(), chunked.matches());
            prop_assert_eq!(whole.matches(), text.matches("ready").count());
        }
    }
}
