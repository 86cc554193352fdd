use logos::Logos;

use crate::ast::Span;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r"//([^/\n][^\n]*)?", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    // Keywords
    #[token("let")]
    Let,
    #[token("const")]
    Const,
    #[token("var")]
    Var,
    #[token("function")]
    Function,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("while")]
    While,
    #[token("in")]
    In,
    #[token("of")]
    Of,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("throw")]
    Throw,
    #[token("try")]
    Try,
    #[token("catch")]
    Catch,
    #[token("finally")]
    Finally,
    #[token("new")]
    New,
    #[token("class")]
    Class,
    #[token("export")]
    Export,
    #[token("import")]
    Import,
    #[token("from")]
    From,
    #[token("as")]
    As,
    #[token("enum")]
    Enum,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("undefined")]
    Undefined,

    // Punctuation
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token("...")]
    Ellipsis,
    #[token("?")]
    Question,
    #[token("=>")]
    Arrow,

    // Operators
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("|")]
    Pipe,
    #[token("&")]
    Amp,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("!")]
    Bang,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("===")]
    EqEqEq,
    #[token("!==")]
    NotEqEq,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEq,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("|=")]
    PipeAssign,
    #[token("&=")]
    AmpAssign,
    #[token("^=")]
    CaretAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,

    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| i64::from_str_radix(&lex.slice()[2..], 16).ok())]
    Int(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r"`[^`]*`", |lex| { let s = lex.slice(); Some(s[1..s.len() - 1].to_string()) })]
    Str(String),

    /// Single quoted text. One character is a rune, anything else a string.
    #[regex(r"'([^'\\\n]|\\.)*'", |lex| unescape(lex.slice()))]
    Quoted(String),

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice().to_string())]
    Ident(String),

    /// `/// name value` pragma lines.
    #[regex(r"///[^\n]*", |lex| lex.slice()[3..].trim().to_string(), allow_greedy = true)]
    Directive(String),
}

fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            other => out.push(other),
        }
    }
    Some(out)
}

/// Lex source code into a stream of tokens with positions.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => tokens.push((token, Span { start: span.start, end: span.end })),
            Err(()) => {
                let snippet = source[span.clone()].to_string();
                return Err(LexError {
                    position: span.start,
                    suggestion: suggest_fix(&snippet),
                    snippet,
                });
            }
        }
    }

    Ok(tokens)
}

fn suggest_fix(bad_token: &str) -> String {
    if bad_token.starts_with('"') || bad_token.starts_with('\'') {
        "Close the string literal on the same line".to_string()
    } else if bad_token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("'{}' is not a valid number", bad_token)
    } else if bad_token == "#" || bad_token == "@" {
        format!("'{}' is not used by the language", bad_token)
    } else {
        format!("Unexpected character(s): '{}'", bad_token)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Lex error at position {position}: '{snippet}'. {suggestion}")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_function_header() {
        let tokens = kinds("function main() { return 2 + 3 }");
        assert_eq!(tokens[0], Token::Function);
        assert_eq!(tokens[1], Token::Ident("main".into()));
        assert!(tokens.contains(&Token::Int(2)));
        assert!(tokens.contains(&Token::Plus));
    }

    #[test]
    fn lex_numbers() {
        assert_eq!(kinds("0xAA 1.5 42 1e3"), vec![
            Token::Int(170),
            Token::Float(1.5),
            Token::Int(42),
            Token::Float(1000.0),
        ]);
    }

    #[test]
    fn lex_strings_and_runes() {
        assert_eq!(kinds(r#""a\nb" 'x' `raw`"#), vec![
            Token::Str("a\nb".into()),
            Token::Quoted("x".into()),
            Token::Str("raw".into()),
        ]);
    }

    #[test]
    fn lex_longest_operator() {
        assert_eq!(kinds("a !== b >>= 1"), vec![
            Token::Ident("a".into()),
            Token::NotEqEq,
            Token::Ident("b".into()),
            Token::ShrAssign,
            Token::Int(1),
        ]);
    }

    #[test]
    fn comments_skipped_directives_kept() {
        let tokens = kinds("// note\n/// permissions fs\n/* block */ x");
        assert_eq!(tokens, vec![Token::Directive("permissions fs".into()), Token::Ident("x".into())]);
    }

    #[test]
    fn lex_error_reports_position() {
        let err = lex("let x = #").unwrap_err();
        assert_eq!(err.position, 8);
        assert_eq!(err.snippet, "#");
    }
}
