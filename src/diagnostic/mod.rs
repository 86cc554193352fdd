pub mod ansi;
pub mod json;
pub mod registry;

use crate::ast::{Position, Span};
use crate::compiler::CompileError;
use crate::config::ConfigError;
use crate::lexer::LexError;
use crate::parser::loader::LoadError;
use crate::parser::{ParseError, SyntaxError};
use crate::value::{Exception, VmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// A user facing error report, rendered by `ansi` or `json`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
    pub file: Option<String>,
    /// Used when no label span is known, as for compile errors.
    pub position: Option<Position>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
            file: None,
            position: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        if position != Position::NONE {
            self.position = Some(position);
        }
        self
    }

    /// Byte range to underline, if the report points into its source.
    fn primary_range(&self, map: &crate::ast::SourceMap) -> Option<(usize, usize)> {
        if let Some(label) = self.labels.first()
            && label.span != Span::UNKNOWN
        {
            return Some((label.span.start, label.span.end));
        }
        let pos = self.position?;
        let start = map.offset(pos);
        Some((start, start + 1))
    }
}

// ---- Conversions ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        let span = Span { start: e.position, end: e.position + e.snippet.len().max(1) };
        let mut d = Diagnostic::error(format!("unexpected character '{}'", e.snippet))
            .with_code("GALE-L001")
            .with_span(span, "here");
        if !e.suggestion.is_empty() {
            d = d.with_suggestion(e.suggestion.clone());
        }
        d
    }
}

impl From<&ParseError> for Diagnostic {
    fn from(e: &ParseError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

impl From<&SyntaxError> for Diagnostic {
    fn from(e: &SyntaxError) -> Self {
        match e {
            SyntaxError::Lex(e) => e.into(),
            SyntaxError::Parse(e) => e.into(),
        }
    }
}

impl From<&LoadError> for Diagnostic {
    fn from(e: &LoadError) -> Self {
        match e {
            LoadError::Io { path, source } => Diagnostic::error(format!("cannot read {}: {}", path, source))
                .with_code("GALE-F001")
                .with_file(path.clone()),
            LoadError::Syntax { path, text, error } => {
                Diagnostic::from(error).with_file(path.clone()).with_source(text.clone())
            }
        }
    }
}

impl From<&ConfigError> for Diagnostic {
    fn from(e: &ConfigError) -> Self {
        Diagnostic::error(e.to_string()).with_code("GALE-F002")
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let mut d = Diagnostic::error(&e.message).with_code("GALE-C001").with_position(e.position);
        if !e.file.is_empty() {
            d = d.with_file(e.file.clone());
        }
        if e.span != Span::UNKNOWN {
            d = d.with_span(e.span, "here");
        }
        d
    }
}

impl From<&Exception> for Diagnostic {
    fn from(e: &Exception) -> Self {
        let code = match e.kind {
            VmError::StepLimit(_) | VmError::AllocationLimit(_) | VmError::FrameLimit(_) => "GALE-R002",
            VmError::Panic(_) => "GALE-R003",
            _ => "GALE-R001",
        };
        // the first line only; a panic message carries the host backtrace
        let message = e.message.lines().next().unwrap_or_default();
        let mut d = Diagnostic::error(message).with_code(code);
        for line in e.stacktrace.iter().filter(|l| !l.is_empty()) {
            d = d.with_note(format!("at {}", line));
        }
        for inner in &e.wrapped {
            d = d.with_note(format!("caused by: {}", inner.message));
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::TraceLine;

    #[test]
    fn builder() {
        let d = Diagnostic::error("type mismatch")
            .with_code("GALE-C001")
            .with_span(Span { start: 5, end: 8 }, "here")
            .with_note("in function 'foo'")
            .with_suggestion("rename it");
        assert_eq!(d.code, Some("GALE-C001"));
        assert_eq!(d.labels, vec![Label { span: Span { start: 5, end: 8 }, message: "here".into() }]);
        assert_eq!(d.notes, vec!["in function 'foo'"]);
        assert_eq!(d.suggestion.as_deref(), Some("rename it"));
    }

    #[test]
    fn from_lex_error() {
        let e = LexError { position: 3, snippet: "#".to_string(), suggestion: String::new() };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("GALE-L001"));
        assert!(d.message.contains('#'));
        assert_eq!(d.labels[0].span, Span { start: 3, end: 4 });
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn from_parse_error() {
        let e = ParseError {
            code: "GALE-P005",
            position: 2,
            span: Span { start: 10, end: 15 },
            message: "expected identifier, got Assign".to_string(),
        };
        let d = Diagnostic::from(&SyntaxError::Parse(e));
        assert_eq!(d.code, Some("GALE-P005"));
        assert_eq!(d.labels[0].span, Span { start: 10, end: 15 });
    }

    #[test]
    fn from_compile_error_uses_position() {
        let e = CompileError {
            message: "Undeclared identifier: y".to_string(),
            position: Position { line: 2, column: 5 },
            file: "main.ts".to_string(),
            span: Span::UNKNOWN,
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("GALE-C001"));
        assert!(d.labels.is_empty());
        assert_eq!(d.position, Some(Position { line: 2, column: 5 }));
        assert_eq!(d.file.as_deref(), Some("main.ts"));
    }

    #[test]
    fn from_exception_lists_trace() {
        let mut e: Exception = VmError::DivideByZero.into();
        e.stacktrace = vec![
            TraceLine { function: "bar".into(), file: String::new(), line: 3 },
            TraceLine { function: "main".into(), file: "main.ts".into(), line: 6 },
        ];
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("GALE-R001"));
        assert_eq!(d.message, "Attempt to divide by zero");
        assert_eq!(d.notes, vec!["at line 3", "at main.ts:6"]);
    }

    #[test]
    fn limits_have_their_own_code() {
        let e: Exception = VmError::StepLimit(10).into();
        assert_eq!(Diagnostic::from(&e).code, Some("GALE-R002"));
    }
}
