use crate::ast::*;
use crate::lexer::{self, LexError, Token};

pub mod loader;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    map: SourceMap,
    imports: Vec<Import>,
    directives: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

/// Anything that stops a file from producing a syntax tree.
#[derive(Debug, thiserror::Error)]
pub enum SyntaxError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

type Result<T> = std::result::Result<T, ParseError>;

type Block = Vec<Spanned<Stmt>>;

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>, source: &str) -> Self {
        Parser {
            tokens,
            pos: 0,
            map: SourceMap::new(source),
            imports: Vec::new(),
            directives: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_is(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| self.tokens.last().map(|(_, s)| Span { start: s.end, end: s.end }).unwrap_or(Span::UNKNOWN))
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            return Span::UNKNOWN;
        }
        self.tokens.get(self.pos - 1).map(|(_, s)| *s).unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Consumes the token if it matches.
    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek_is(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("GALE-P003", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("GALE-P004", format!("expected {:?}, got EOF", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("GALE-P005", format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("GALE-P006", "expected identifier, got EOF".into())),
        }
    }

    /// Identifiers and keywords, for property names and map keys.
    fn expect_name(&mut self) -> Result<String> {
        if let Some(tok) = self.peek()
            && let Some(word) = keyword_text(tok)
        {
            self.advance();
            return Ok(word.to_string());
        }
        self.expect_ident()
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            position: self.pos,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    fn is_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    /// True if the current token starts a new source line.
    fn on_new_line(&self) -> bool {
        if self.pos == 0 || self.at_end() {
            return false;
        }
        self.map.crosses_line(self.prev_span().end, self.peek_span().start)
    }

    fn spanned<T>(&self, node: T, start: Span) -> Spanned<T> {
        let span = start.merge(self.prev_span());
        Spanned::new(node, span, self.map.position(start.start))
    }

    fn end_stmt(&mut self) {
        self.eat(&Token::Semi);
    }

    // ---- Top-level parsing ----

    pub fn parse_file(&mut self, path: &str) -> Result<SourceFile> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            self.parse_stmt(&mut stmts)?;
        }
        Ok(SourceFile {
            path: path.to_string(),
            imports: std::mem::take(&mut self.imports),
            directives: std::mem::take(&mut self.directives),
            stmts,
        })
    }

    fn parse_import(&mut self) -> Result<()> {
        let start = self.expect(&Token::Import)?;
        let pos = self.map.position(start.start);
        let alias = if self.eat(&Token::Star) {
            self.expect(&Token::As)?;
            let alias = self.expect_ident()?;
            self.expect(&Token::From)?;
            Some(alias)
        } else {
            None
        };
        let path = match self.peek().cloned() {
            Some(Token::Str(s) | Token::Quoted(s)) => {
                self.advance();
                s
            }
            _ => return Err(self.error("GALE-P010", "expected a module path string".into())),
        };
        self.end_stmt();
        self.imports.push(Import { alias, path, pos });
        Ok(())
    }

    // ---- Statements ----

    fn parse_stmt(&mut self, out: &mut Block) -> Result<()> {
        let start = self.peek_span();
        let tok = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.error("GALE-P001", "unexpected end of input".into())),
        };

        match tok {
            Token::Semi => {
                self.advance();
            }
            Token::Directive(text) => {
                self.advance();
                self.directives.push(text);
            }
            Token::Import => self.parse_import()?,
            Token::Export => {
                self.advance();
                self.parse_declaration(out, start, true)?;
            }
            Token::Function | Token::Class | Token::Let | Token::Const | Token::Var | Token::Enum => {
                self.parse_declaration(out, start, false)?;
            }
            Token::LBrace => {
                let body = self.parse_block()?;
                out.push(self.spanned(Stmt::Block(body), start));
            }
            Token::If => {
                let stmt = self.parse_if()?;
                out.push(self.spanned(stmt, start));
            }
            Token::Switch => {
                let stmt = self.parse_switch()?;
                out.push(self.spanned(stmt, start));
            }
            Token::For => {
                let stmt = self.parse_for()?;
                out.push(self.spanned(stmt, start));
            }
            Token::While => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let body = self.parse_body()?;
                out.push(self.spanned(Stmt::While { cond, body }, start));
            }
            Token::Throw => {
                self.advance();
                let value = self.parse_expr()?;
                self.end_stmt();
                out.push(self.spanned(Stmt::Throw(value), start));
            }
            Token::Try => {
                let stmt = self.parse_try()?;
                out.push(self.spanned(stmt, start));
            }
            Token::Return => {
                self.advance();
                let value = if self.at_stmt_end() { None } else { Some(self.parse_expr()?) };
                self.end_stmt();
                out.push(self.spanned(Stmt::Return(value), start));
            }
            Token::Break | Token::Continue => {
                self.advance();
                let label = match self.peek().cloned() {
                    Some(Token::Ident(l)) if !self.on_new_line() => {
                        self.advance();
                        Some(l)
                    }
                    _ => None,
                };
                self.end_stmt();
                let stmt = if tok == Token::Break { Stmt::Break(label) } else { Stmt::Continue(label) };
                out.push(self.spanned(stmt, start));
            }
            Token::Ident(ref word) if matches!(self.token_at(self.pos + 1), Some(Token::Colon)) => {
                let label = word.clone();
                self.advance();
                self.advance();
                let mut inner = Vec::new();
                self.parse_stmt(&mut inner)?;
                let body = match inner.len() {
                    1 => inner.remove(0),
                    _ => return Err(self.error("GALE-P011", format!("invalid statement after label '{}'", label))),
                };
                out.push(self.spanned(Stmt::Labeled { label, body: Box::new(body) }, start));
            }
            Token::Ident(ref word) if word == "interface" && matches!(self.token_at(self.pos + 1), Some(Token::Ident(_))) => {
                self.skip_interface()?;
            }
            Token::Ident(ref word) if word == "type" && matches!(self.token_at(self.pos + 1), Some(Token::Ident(_))) => {
                self.skip_type_alias()?;
            }
            Token::Ident(ref word) if word == "declare" && !self.next_is_operator() => {
                self.skip_declare();
            }
            _ => {
                let stmt = self.parse_simple_stmt()?;
                self.end_stmt();
                out.push(stmt);
            }
        }
        Ok(())
    }

    fn next_is_operator(&self) -> bool {
        matches!(
            self.token_at(self.pos + 1),
            Some(Token::Assign | Token::Dot | Token::LParen | Token::LBracket | Token::PlusPlus | Token::MinusMinus)
        )
    }

    fn at_stmt_end(&self) -> bool {
        matches!(self.peek(), None | Some(Token::Semi) | Some(Token::RBrace)) || self.on_new_line()
    }

    fn parse_declaration(&mut self, out: &mut Block, start: Span, exported: bool) -> Result<()> {
        match self.peek() {
            Some(Token::Function) => {
                let decl = self.parse_function(exported)?;
                out.push(self.spanned(Stmt::Function(decl), start));
            }
            Some(Token::Class) => {
                let decl = self.parse_class(exported)?;
                out.push(self.spanned(Stmt::Class(decl), start));
            }
            Some(Token::Let | Token::Const | Token::Var) => {
                self.advance();
                let mut decl_start = start;
                loop {
                    let name = self.expect_ident()?;
                    if self.eat(&Token::Colon) {
                        self.skip_type()?;
                    }
                    let value = if self.eat(&Token::Assign) { Some(self.parse_expr()?) } else { None };
                    let node = Stmt::Var { name, value, exported, is_enum: false };
                    out.push(self.spanned(node, decl_start));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                    decl_start = self.peek_span();
                }
                self.end_stmt();
            }
            Some(Token::Enum) => {
                let stmt = self.parse_enum(exported)?;
                out.push(self.spanned(stmt, start));
            }
            _ => return Err(self.error("GALE-P012", "expected a declaration after 'export'".into())),
        }
        Ok(())
    }

    /// `x = e`, `x += e`, `x++`, `++x` or a bare expression.
    fn parse_simple_stmt(&mut self) -> Result<Spanned<Stmt>> {
        let start = self.peek_span();

        if matches!(self.peek(), Some(Token::PlusPlus | Token::MinusMinus)) {
            let op = if self.advance() == Some(&Token::PlusPlus) { UpdateOp::Inc } else { UpdateOp::Dec };
            let target = self.parse_unary()?;
            return Ok(self.spanned(Stmt::Update { target, op }, start));
        }

        let target = self.parse_expr()?;
        let compound = match self.peek() {
            Some(Token::Assign) => {
                self.advance();
                let value = self.parse_expr()?;
                return Ok(self.spanned(Stmt::Assign { target, value }, start));
            }
            Some(Token::PlusPlus) if !self.on_new_line() => {
                self.advance();
                return Ok(self.spanned(Stmt::Update { target, op: UpdateOp::Inc }, start));
            }
            Some(Token::MinusMinus) if !self.on_new_line() => {
                self.advance();
                return Ok(self.spanned(Stmt::Update { target, op: UpdateOp::Dec }, start));
            }
            Some(Token::PlusAssign) => BinOp::Add,
            Some(Token::MinusAssign) => BinOp::Sub,
            Some(Token::StarAssign) => BinOp::Mul,
            Some(Token::SlashAssign) => BinOp::Div,
            Some(Token::PercentAssign) => BinOp::Mod,
            Some(Token::PipeAssign) => BinOp::BitOr,
            Some(Token::AmpAssign) => BinOp::BitAnd,
            Some(Token::CaretAssign) => BinOp::BitXor,
            Some(Token::ShlAssign) => BinOp::Shl,
            Some(Token::ShrAssign) => BinOp::Shr,
            _ => return Ok(self.spanned(Stmt::Expr(target), start)),
        };
        self.advance();
        let rhs = self.parse_expr()?;
        let span = target.span.merge(rhs.span);
        let pos = target.pos;
        let value = Spanned::new(
            Expr::Binary { op: compound, left: Box::new(target.clone()), right: Box::new(rhs) },
            span,
            pos,
        );
        Ok(self.spanned(Stmt::Assign { target, value }, start))
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.peek_is(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("GALE-P007", "unclosed block, expected '}'".into()));
            }
            self.parse_stmt(&mut stmts)?;
        }
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    /// A braced block or a single statement.
    fn parse_body(&mut self) -> Result<Block> {
        if self.peek_is(&Token::LBrace) {
            return self.parse_block();
        }
        let mut stmts = Vec::new();
        self.parse_stmt(&mut stmts)?;
        Ok(stmts)
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        self.expect(&Token::If)?;
        loop {
            self.expect(&Token::LParen)?;
            let cond = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            let body = self.parse_body()?;
            branches.push(IfBranch { cond, body });

            if !self.eat(&Token::Else) {
                break;
            }
            if self.eat(&Token::If) {
                continue;
            }
            otherwise = Some(self.parse_body()?);
            break;
        }
        Ok(Stmt::If { branches, otherwise })
    }

    fn parse_switch(&mut self) -> Result<Stmt> {
        self.expect(&Token::Switch)?;
        self.expect(&Token::LParen)?;
        let subject = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            match self.peek() {
                Some(Token::Case) => {
                    self.advance();
                    let value = self.parse_expr()?;
                    self.expect(&Token::Colon)?;
                    let body = self.parse_case_body()?;
                    cases.push(SwitchCase { value, body });
                }
                Some(Token::Default) => {
                    self.advance();
                    self.expect(&Token::Colon)?;
                    default = Some(self.parse_case_body()?);
                }
                Some(Token::RBrace) => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error("GALE-P013", "expected 'case', 'default' or '}'".into())),
            }
        }
        Ok(Stmt::Switch { subject, cases, default })
    }

    fn parse_case_body(&mut self) -> Result<Block> {
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Some(Token::Case | Token::Default | Token::RBrace) | None) {
            self.parse_stmt(&mut stmts)?;
        }
        Ok(stmts)
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;

        if matches!(self.peek(), Some(Token::Let | Token::Const | Token::Var))
            && matches!(self.token_at(self.pos + 2), Some(Token::In | Token::Of))
        {
            self.advance();
            let name = self.expect_ident()?;
            let kind = if self.advance() == Some(&Token::In) { ForEachKind::In } else { ForEachKind::Of };
            let iterable = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            let body = self.parse_body()?;
            return Ok(Stmt::ForEach { kind, name, iterable, body });
        }

        let mut init = Vec::new();
        if !self.peek_is(&Token::Semi) {
            let start = self.peek_span();
            if matches!(self.peek(), Some(Token::Let | Token::Const | Token::Var)) {
                self.parse_declaration(&mut init, start, false)?;
                // the declaration consumed the separator
                self.pos -= 1;
            } else {
                init.push(self.parse_simple_stmt()?);
            }
        }
        self.expect(&Token::Semi)?;
        let cond = if self.peek_is(&Token::Semi) { None } else { Some(self.parse_expr()?) };
        self.expect(&Token::Semi)?;
        let step = if self.peek_is(&Token::RParen) { None } else { Some(Box::new(self.parse_simple_stmt()?)) };
        self.expect(&Token::RParen)?;
        let body = self.parse_body()?;
        Ok(Stmt::For { init, cond, step, body })
    }

    fn parse_try(&mut self) -> Result<Stmt> {
        self.expect(&Token::Try)?;
        let body = self.parse_block()?;
        let catch = if self.eat(&Token::Catch) {
            let binding = if self.eat(&Token::LParen) {
                let name = self.expect_ident()?;
                if self.eat(&Token::Colon) {
                    self.skip_type()?;
                }
                self.expect(&Token::RParen)?;
                Some(name)
            } else {
                None
            };
            Some(CatchClause { binding, body: self.parse_block()? })
        } else {
            None
        };
        let finally = if self.eat(&Token::Finally) { Some(self.parse_block()?) } else { None };
        if catch.is_none() && finally.is_none() {
            return Err(self.error("GALE-P014", "try requires a catch or finally block".into()));
        }
        Ok(Stmt::Try { body, catch, finally })
    }

    // ---- Declarations ----

    fn parse_function(&mut self, exported: bool) -> Result<FuncDecl> {
        self.expect(&Token::Function)?;
        let name = match self.peek().cloned() {
            Some(Token::Ident(n)) => {
                self.advance();
                n
            }
            _ => String::new(),
        };
        let (params, variadic) = self.parse_params()?;
        if self.eat(&Token::Colon) {
            self.skip_type()?;
        }
        let body = self.parse_block()?;
        Ok(FuncDecl { name, params, variadic, exported, body })
    }

    fn parse_params(&mut self) -> Result<(Vec<String>, bool)> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        while !self.peek_is(&Token::RParen) {
            if variadic {
                return Err(self.error("GALE-P015", "the rest parameter must be last".into()));
            }
            variadic = self.eat(&Token::Ellipsis);
            params.push(self.expect_ident()?);
            self.eat(&Token::Question);
            if self.eat(&Token::Colon) {
                self.skip_type()?;
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok((params, variadic))
    }

    fn parse_class(&mut self, exported: bool) -> Result<ClassDecl> {
        self.expect(&Token::Class)?;
        let name = self.expect_ident()?;
        if self.peek_is(&Token::Less) {
            self.skip_generic_args()?;
        }
        self.expect(&Token::LBrace)?;

        let mut fields = Vec::new();
        let mut constructor = None;
        let mut methods = Vec::new();

        while !self.eat(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("GALE-P007", "unclosed class body, expected '}'".into()));
            }
            if self.eat(&Token::Semi) {
                continue;
            }
            let mut private = false;
            while let Some(Token::Ident(m)) = self.peek() {
                let is_modifier = matches!(m.as_str(), "public" | "private" | "protected" | "readonly" | "static");
                let followed_by_member = matches!(self.token_at(self.pos + 1), Some(Token::Ident(_)));
                if !(is_modifier && followed_by_member) {
                    break;
                }
                private |= m == "private";
                self.advance();
            }

            let member_name = self.expect_name()?;
            if self.peek_is(&Token::LParen) {
                let (params, variadic) = self.parse_params()?;
                if self.eat(&Token::Colon) {
                    self.skip_type()?;
                }
                let body = self.parse_block()?;
                let decl = FuncDecl { name: member_name.clone(), params, variadic, exported: !private, body };
                if member_name == "constructor" {
                    constructor = Some(decl);
                } else {
                    methods.push(decl);
                }
                continue;
            }

            self.eat(&Token::Question);
            if self.eat(&Token::Colon) {
                self.skip_type()?;
            }
            let value = if self.eat(&Token::Assign) { Some(self.parse_expr()?) } else { None };
            self.end_stmt();
            fields.push(ClassField { name: member_name, value, exported: !private });
        }

        Ok(ClassDecl { name, exported, fields, constructor, methods })
    }

    /// Enums become a map. Implicit members continue from the last integer.
    fn parse_enum(&mut self, exported: bool) -> Result<Stmt> {
        self.expect(&Token::Enum)?;
        let name = self.expect_ident()?;
        let map_start = self.expect(&Token::LBrace)?;
        let mut entries = Vec::new();
        let mut next: i64 = 0;
        while !self.peek_is(&Token::RBrace) {
            let key_span = self.peek_span();
            let key = self.expect_name()?;
            let value = if self.eat(&Token::Assign) {
                let e = self.parse_expr()?;
                if let Expr::Literal(Literal::Int(i)) = e.node {
                    next = i + 1;
                }
                e
            } else {
                let e = self.spanned(Expr::Literal(Literal::Int(next)), key_span);
                next += 1;
                e
            };
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        let value = self.spanned(Expr::Map(entries), map_start);
        Ok(Stmt::Var { name, value: Some(value), exported, is_enum: true })
    }

    // ---- Types (parsed and discarded) ----

    fn skip_type(&mut self) -> Result<()> {
        self.eat(&Token::Pipe);
        loop {
            self.skip_type_atom()?;
            while self.peek_is(&Token::LBracket) && matches!(self.token_at(self.pos + 1), Some(Token::RBracket)) {
                self.advance();
                self.advance();
            }
            if !(self.eat(&Token::Pipe) || self.eat(&Token::Amp)) {
                return Ok(());
            }
        }
    }

    fn skip_type_atom(&mut self) -> Result<()> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.skip_balanced(&Token::LParen, &Token::RParen)?;
                if self.eat(&Token::Arrow) {
                    self.skip_type()?;
                }
            }
            Some(Token::LBrace) => self.skip_balanced(&Token::LBrace, &Token::RBrace)?,
            Some(Token::LBracket) => self.skip_balanced(&Token::LBracket, &Token::RBracket)?,
            Some(Token::Str(_) | Token::Quoted(_) | Token::Int(_) | Token::Float(_)) => {
                self.advance();
            }
            Some(Token::Null | Token::Undefined | Token::True | Token::False | Token::Function) => {
                self.advance();
            }
            Some(Token::Ident(_)) => {
                self.advance();
                while self.peek_is(&Token::Dot) {
                    self.advance();
                    self.expect_name()?;
                }
                if self.peek_is(&Token::Less) {
                    self.skip_generic_args()?;
                }
            }
            _ => return Err(self.error("GALE-P020", "expected a type".into())),
        }
        Ok(())
    }

    fn skip_generic_args(&mut self) -> Result<()> {
        self.expect(&Token::Less)?;
        let mut depth: i32 = 1;
        while depth > 0 {
            match self.advance() {
                Some(Token::Less) => depth += 1,
                Some(Token::Greater) => depth -= 1,
                Some(Token::Shr) => depth -= 2,
                Some(_) => {}
                None => return Err(self.error("GALE-P021", "unclosed type arguments".into())),
            }
        }
        Ok(())
    }

    fn skip_balanced(&mut self, open: &Token, close: &Token) -> Result<()> {
        self.expect(open)?;
        let mut depth = 1;
        while depth > 0 {
            match self.advance() {
                Some(t) if t == open => depth += 1,
                Some(t) if t == close => depth -= 1,
                Some(_) => {}
                None => return Err(self.error("GALE-P007", format!("expected {:?}", close))),
            }
        }
        Ok(())
    }

    fn skip_interface(&mut self) -> Result<()> {
        self.advance();
        self.expect_ident()?;
        while !self.peek_is(&Token::LBrace) {
            if self.advance().is_none() {
                return Err(self.error("GALE-P022", "expected interface body".into()));
            }
        }
        self.skip_balanced(&Token::LBrace, &Token::RBrace)
    }

    fn skip_type_alias(&mut self) -> Result<()> {
        self.advance();
        self.expect_ident()?;
        if self.peek_is(&Token::Less) {
            self.skip_generic_args()?;
        }
        self.expect(&Token::Assign)?;
        self.skip_type()?;
        self.end_stmt();
        Ok(())
    }

    /// Skips an ambient `declare ...` statement up to the end of its line.
    fn skip_declare(&mut self) {
        self.advance();
        let mut depth: i32 = 0;
        while let Some(tok) = self.peek() {
            if depth == 0 && self.on_new_line() {
                break;
            }
            match tok {
                Token::LBrace | Token::LParen | Token::LBracket => depth += 1,
                Token::RBrace | Token::RParen | Token::RBracket => depth -= 1,
                Token::Semi if depth == 0 => {
                    self.advance();
                    break;
                }
                _ => {}
            }
            self.advance();
        }
    }

    // ---- Expressions ----

    pub fn parse_expr(&mut self) -> Result<Spanned<Expr>> {
        let cond = self.parse_binary(0)?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.parse_expr()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.parse_expr()?;
        let span = cond.span.merge(otherwise.span);
        let pos = cond.pos;
        Ok(Spanned::new(
            Expr::Ternary { cond: Box::new(cond), then: Box::new(then), otherwise: Box::new(otherwise) },
            span,
            pos,
        ))
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Spanned<Expr>> {
        let mut left = self.parse_unary()?;
        loop {
            if self.is_ident("as") {
                self.advance();
                self.skip_type()?;
                continue;
            }
            let Some((op, prec)) = self.peek().and_then(binary_op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span.merge(right.span);
            let pos = left.pos;
            left = Spanned::new(Expr::Binary { op, left: Box::new(left), right: Box::new(right) }, span, pos);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Spanned<Expr>> {
        let start = self.peek_span();
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Tilde) => UnaryOp::BitNot,
            Some(Token::Plus) => {
                self.advance();
                return self.parse_unary();
            }
            Some(Token::New) => return self.parse_new(),
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(self.spanned(Expr::Unary { op, operand: Box::new(operand) }, start))
    }

    fn parse_new(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(&Token::New)?;
        let class_start = self.peek_span();
        let class_name = self.expect_ident()?;
        let mut class = self.spanned(Expr::Ident(class_name), class_start);
        while self.eat(&Token::Dot) {
            let name = self.expect_name()?;
            class = self.spanned(Expr::Selector { object: Box::new(class), name }, class_start);
        }
        if self.peek_is(&Token::Less) {
            self.skip_generic_args()?;
        }
        let (args, spread) = if self.peek_is(&Token::LParen) { self.parse_args()? } else { (Vec::new(), false) };
        let expr = self.spanned(Expr::New { class: Box::new(class), args, spread }, start);
        self.parse_postfix_ops(expr)
    }

    fn parse_postfix(&mut self) -> Result<Spanned<Expr>> {
        let primary = self.parse_primary()?;
        self.parse_postfix_ops(primary)
    }

    fn parse_postfix_ops(&mut self, mut expr: Spanned<Expr>) -> Result<Spanned<Expr>> {
        let start = expr.span;
        loop {
            match self.peek() {
                Some(Token::LParen) if !self.on_new_line() => {
                    let (args, spread) = self.parse_args()?;
                    expr = self.spanned(Expr::Call { callee: Box::new(expr), args, spread }, start);
                }
                Some(Token::LBracket) if !self.on_new_line() => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = self.spanned(Expr::Index { object: Box::new(expr), index: Box::new(index) }, start);
                }
                Some(Token::Dot) => {
                    self.advance();
                    let name = self.expect_name()?;
                    expr = self.spanned(Expr::Selector { object: Box::new(expr), name }, start);
                }
                // non-null assertion
                Some(Token::Bang) if !self.on_new_line() && self.closes_operand() => {
                    self.advance();
                }
                _ => return Ok(expr),
            }
        }
    }

    /// A postfix `!` is only an assertion when no operand follows it.
    fn closes_operand(&self) -> bool {
        matches!(
            self.token_at(self.pos + 1),
            None | Some(Token::Dot | Token::RParen | Token::RBracket | Token::Semi | Token::Comma | Token::RBrace | Token::LBracket)
        )
    }

    fn parse_args(&mut self) -> Result<(Vec<Spanned<Expr>>, bool)> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        let mut spread = false;
        while !self.peek_is(&Token::RParen) {
            if spread {
                return Err(self.error("GALE-P016", "a spread argument must be last".into()));
            }
            spread = self.eat(&Token::Ellipsis);
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok((args, spread))
    }

    fn parse_primary(&mut self) -> Result<Spanned<Expr>> {
        let start = self.peek_span();
        let tok = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.error("GALE-P001", "unexpected end of input".into())),
        };

        let literal = match tok {
            Token::Int(i) => Some(Literal::Int(i)),
            Token::Float(f) => Some(Literal::Float(f)),
            Token::Str(ref s) => Some(Literal::String(s.clone())),
            Token::Quoted(ref s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(Literal::Rune(c)),
                    _ => Some(Literal::String(s.clone())),
                }
            }
            Token::True => Some(Literal::Bool(true)),
            Token::False => Some(Literal::Bool(false)),
            Token::Null => Some(Literal::Null),
            Token::Undefined => Some(Literal::Undefined),
            _ => None,
        };
        if let Some(lit) = literal {
            self.advance();
            return Ok(self.spanned(Expr::Literal(lit), start));
        }

        match tok {
            Token::Ident(name) => {
                if matches!(self.token_at(self.pos + 1), Some(Token::Arrow)) {
                    self.advance();
                    self.advance();
                    let body = self.parse_arrow_body()?;
                    let decl = FuncDecl { params: vec![name], body, ..Default::default() };
                    return Ok(self.spanned(Expr::Function(Box::new(decl)), start));
                }
                self.advance();
                Ok(self.spanned(Expr::Ident(name), start))
            }
            Token::LParen if self.is_arrow_ahead() => {
                let (params, variadic) = self.parse_params()?;
                if self.eat(&Token::Colon) {
                    self.skip_type()?;
                }
                self.expect(&Token::Arrow)?;
                let body = self.parse_arrow_body()?;
                let decl = FuncDecl { params, variadic, body, ..Default::default() };
                Ok(self.spanned(Expr::Function(Box::new(decl)), start))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Function => {
                let decl = self.parse_function(false)?;
                Ok(self.spanned(Expr::Function(Box::new(decl)), start))
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.peek_is(&Token::RBracket) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(self.spanned(Expr::Array(items), start))
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.peek_is(&Token::RBrace) {
                    let key_span = self.peek_span();
                    let key = match self.peek().cloned() {
                        Some(Token::Str(s) | Token::Quoted(s)) => {
                            self.advance();
                            s
                        }
                        Some(Token::Int(i)) => {
                            self.advance();
                            i.to_string()
                        }
                        _ => self.expect_name()?,
                    };
                    let value = if self.eat(&Token::Colon) {
                        self.parse_expr()?
                    } else {
                        self.spanned(Expr::Ident(key.clone()), key_span)
                    };
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(self.spanned(Expr::Map(entries), start))
            }
            other => Err(self.error("GALE-P002", format!("unexpected token {:?}", other))),
        }
    }

    fn parse_arrow_body(&mut self) -> Result<Block> {
        if self.peek_is(&Token::LBrace) {
            return self.parse_block();
        }
        let start = self.peek_span();
        let value = self.parse_expr()?;
        Ok(vec![self.spanned(Stmt::Return(Some(value)), start)])
    }

    /// Looks past a parenthesized group for `=>`, allowing a return type.
    fn is_arrow_ahead(&self) -> bool {
        let mut depth = 0;
        let mut i = self.pos;
        while let Some(tok) = self.token_at(i) {
            match tok {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        match self.token_at(i + 1) {
            Some(Token::Arrow) => true,
            Some(Token::Colon) => {
                let mut lookahead = Parser {
                    tokens: Vec::new(),
                    pos: 0,
                    map: SourceMap::new(""),
                    imports: Vec::new(),
                    directives: Vec::new(),
                };
                lookahead.tokens = self.tokens[i + 2..].to_vec();
                lookahead.skip_type().is_ok() && lookahead.peek_is(&Token::Arrow)
            }
            _ => false,
        }
    }
}

fn binary_op(tok: &Token) -> Option<(BinOp, u8)> {
    let op = match tok {
        Token::OrOr => (BinOp::Or, 1),
        Token::AndAnd => (BinOp::And, 2),
        Token::Pipe => (BinOp::BitOr, 3),
        Token::Caret => (BinOp::BitXor, 4),
        Token::Amp => (BinOp::BitAnd, 5),
        Token::EqEq => (BinOp::Equals, 6),
        Token::NotEq => (BinOp::NotEquals, 6),
        Token::EqEqEq => (BinOp::StrictEquals, 6),
        Token::NotEqEq => (BinOp::StrictNotEquals, 6),
        Token::Less => (BinOp::Less, 7),
        Token::LessEq => (BinOp::LessEq, 7),
        Token::Greater => (BinOp::Greater, 7),
        Token::GreaterEq => (BinOp::GreaterEq, 7),
        Token::Shl => (BinOp::Shl, 8),
        Token::Shr => (BinOp::Shr, 8),
        Token::Plus => (BinOp::Add, 9),
        Token::Minus => (BinOp::Sub, 9),
        Token::Star => (BinOp::Mul, 10),
        Token::Slash => (BinOp::Div, 10),
        Token::Percent => (BinOp::Mod, 10),
        _ => return None,
    };
    Some(op)
}

/// Keywords that may also appear as property names.
fn keyword_text(tok: &Token) -> Option<&'static str> {
    let word = match tok {
        Token::Let => "let",
        Token::Const => "const",
        Token::Var => "var",
        Token::Function => "function",
        Token::Return => "return",
        Token::If => "if",
        Token::Else => "else",
        Token::For => "for",
        Token::While => "while",
        Token::In => "in",
        Token::Of => "of",
        Token::Break => "break",
        Token::Continue => "continue",
        Token::Switch => "switch",
        Token::Case => "case",
        Token::Default => "default",
        Token::Throw => "throw",
        Token::Try => "try",
        Token::Catch => "catch",
        Token::Finally => "finally",
        Token::New => "new",
        Token::Class => "class",
        Token::Export => "export",
        Token::Import => "import",
        Token::From => "from",
        Token::As => "as",
        Token::Enum => "enum",
        Token::True => "true",
        Token::False => "false",
        Token::Null => "null",
        Token::Undefined => "undefined",
        _ => return None,
    };
    Some(word)
}

/// Lexes and parses one file.
pub fn parse(source: &str, path: &str) -> std::result::Result<SourceFile, SyntaxError> {
    let tokens = lexer::lex(source)?;
    let mut parser = Parser::new(tokens, source);
    Ok(parser.parse_file(path)?)
}
