use super::Diagnostic;
use crate::ast::SourceMap;

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, code: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{code}m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold(&self, s: &str) -> String {
        self.paint("1", s)
    }

    fn bold_red(&self, s: &str) -> String {
        self.paint("1;31", s)
    }

    fn cyan(&self, s: &str) -> String {
        self.paint("36", s)
    }

    fn dim(&self, s: &str) -> String {
        self.paint("2", s)
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let head = match d.code {
            Some(code) => format!("error[{code}]"),
            None => "error".to_string(),
        };
        out.push_str(&format!("{}: {}\n", self.bold_red(&head), self.bold(&d.message)));

        let file = d.file.as_deref().map(|f| format!("{f}:")).unwrap_or_default();
        match &d.source {
            Some(source) => {
                let map = SourceMap::new(source);
                if let Some((start, end)) = d.primary_range(&map) {
                    self.snippet(&mut out, d, &map, source, &file, start, end);
                }
            }
            None => {
                if let Some(pos) = d.position {
                    out.push_str(&format!("  {} {}{}:{}\n", self.cyan("-->"), file, pos.line, pos.column));
                } else if let Some(f) = &d.file {
                    out.push_str(&format!("  {} {}\n", self.cyan("-->"), f));
                }
            }
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }
        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} suggestion: {}\n", self.dim("="), suggestion));
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn snippet(
        &self,
        out: &mut String,
        d: &Diagnostic,
        map: &SourceMap,
        source: &str,
        file: &str,
        start: usize,
        end: usize,
    ) {
        let (line, col) = map.lookup(start);
        let line_text = map.line_text(source, line);
        out.push_str(&format!("  {} {}{}:{}\n", self.cyan("-->"), file, line, col));

        let gutter = line.to_string().len();
        let pipe = self.cyan("|");
        let pad = " ".repeat(gutter);
        out.push_str(&format!("{pad} {pipe}\n"));

        let number = self.cyan(&format!("{line:>gutter$}"));
        out.push_str(&format!("{number} {pipe} {line_text}\n"));

        // carets stop at the end of the line
        let room = line_text.len().saturating_sub(col - 1).max(1);
        let width = end.saturating_sub(start).clamp(1, room);
        let carets = self.bold_red(&"^".repeat(width));
        let indent = " ".repeat(col - 1);
        let label = d.labels.first().map(|l| l.message.as_str()).unwrap_or_default();
        if label.is_empty() {
            out.push_str(&format!("{pad} {pipe} {indent}{carets}\n"));
        } else {
            out.push_str(&format!("{pad} {pipe} {indent}{carets} {}\n", self.bold_red(label)));
        }
        out.push_str(&format!("{pad} {pipe}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Position, Span};
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "let x = 1;\nlet y = x +* 2;";

    fn plain() -> AnsiRenderer {
        AnsiRenderer { use_color: false }
    }

    #[test]
    fn full_report() {
        let d = Diagnostic::error("unexpected token Mul")
            .with_code("GALE-P002")
            .with_span(Span { start: 22, end: 23 }, "here")
            .with_source(SOURCE)
            .with_file("main.ts")
            .with_suggestion("remove the extra operator");
        let expected = "\
error[GALE-P002]: unexpected token Mul
  --> main.ts:2:12
  |
2 | let y = x +* 2;
  |            ^ here
  |
  = suggestion: remove the extra operator
";
        assert_eq!(plain().render(&d), expected);
    }

    #[test]
    fn position_without_span() {
        let d = Diagnostic::error("Undeclared identifier: z")
            .with_position(Position { line: 1, column: 5 })
            .with_source(SOURCE);
        let out = plain().render(&d);
        assert!(out.contains("--> 1:5"), "{out}");
        assert!(out.contains("1 | let x = 1;"), "{out}");
    }

    #[test]
    fn position_without_source() {
        let d = Diagnostic::error("bad").with_file("lib.ts").with_position(Position { line: 4, column: 2 });
        assert!(plain().render(&d).contains("--> lib.ts:4:2"));
    }

    #[test]
    fn no_location() {
        let out = plain().render(&Diagnostic::error("something bad"));
        assert_eq!(out, "error: something bad\n");
    }

    #[test]
    fn notes_follow_the_snippet() {
        let d = Diagnostic::error("Attempt to divide by zero").with_note("at line 3").with_note("at main.ts:6");
        let out = plain().render(&d);
        assert!(out.ends_with("  = note: at line 3\n  = note: at main.ts:6\n"), "{out}");
    }

    #[test]
    fn carets_cover_the_span() {
        let d = Diagnostic::error("bad").with_span(Span { start: 4, end: 5 }, "").with_source(SOURCE);
        assert!(plain().render(&d).contains("|     ^\n"));
        let d = Diagnostic::error("bad").with_span(Span { start: 0, end: 3 }, "").with_source(SOURCE);
        assert!(plain().render(&d).contains("| ^^^\n"));
    }

    #[test]
    fn color_toggles_escapes() {
        let d = Diagnostic::error("bad").with_span(Span { start: 0, end: 3 }, "here").with_source(SOURCE);
        assert!(AnsiRenderer { use_color: true }.render(&d).contains("\x1b["));
        assert!(!plain().render(&d).contains("\x1b["));
    }
}
