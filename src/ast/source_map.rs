use super::Position;

/// Maps byte offsets to line/column positions within source text.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceMap { line_starts }
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line + 1, col + 1)
    }

    pub fn position(&self, offset: usize) -> Position {
        let (line, column) = self.lookup(offset);
        Position { line, column }
    }

    /// Byte offset of a 1-based position, clamped to the last line.
    pub fn offset(&self, pos: Position) -> usize {
        let line = pos.line.clamp(1, self.line_starts.len());
        self.line_starts[line - 1] + pos.column.saturating_sub(1)
    }

    /// Returns the full text of the given 1-based line number.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = if line < self.line_starts.len() {
            self.line_starts[line]
        } else {
            source.len()
        };
        let text = &source[start..end];
        text.trim_end_matches('\n').trim_end_matches('\r')
    }

    /// True if a line break lies between the two offsets.
    pub fn crosses_line(&self, from: usize, to: usize) -> bool {
        self.lookup(from).0 != self.lookup(to).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let src = "let x = 1 + 2";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(4), (1, 5));
        assert_eq!(sm.lookup(13), (1, 14));
    }

    #[test]
    fn multi_line() {
        let src = "function f() {\n  return 1\n}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(14), (1, 15)); // '\n' after '{'
        assert_eq!(sm.lookup(17), (2, 3));  // 'r' of return
        assert_eq!(sm.position(26), Position { line: 3, column: 1 });
    }

    #[test]
    fn offset_inverts_lookup() {
        let src = "a\nbb\nccc";
        let sm = SourceMap::new(src);
        for offset in 0..src.len() {
            assert_eq!(sm.offset(sm.position(offset)), offset);
        }
    }

    #[test]
    fn line_text_multi() {
        let src = "first\nsecond\r\nthird";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "first");
        assert_eq!(sm.line_text(src, 2), "second");
        assert_eq!(sm.line_text(src, 3), "third");
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 99), "");
    }

    #[test]
    fn crosses_line() {
        let src = "return\nx";
        let sm = SourceMap::new(src);
        assert!(sm.crosses_line(5, 7));
        assert!(!sm.crosses_line(0, 5));
    }
}
