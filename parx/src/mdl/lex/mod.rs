pub(crate) mod constants;
pub(crate) mod number;

use crate::mdl::data::{HasSpan, Position, Span};
use crate::mdl::diagnostics::Diagnostic;
use crate::mdl::error_codes::ErrorCode;
use crate::mdl::lex::constants::MAX_NAME;
use crate::mdl::lex::number::{scan_number, NumberError};
use crate::mdl::reader::ByteReader;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Bytes that terminate a name and may not appear inside one.
pub const RESERVED_NAME_TOKENS: &str = "\r\n\t \\\",;:=(){}+-*/^!><&|";
/// Bytes that may appear inside a name but not at its start.
pub const NOT_AT_NAME_START_TOKENS: &str = "._0123456789";
/// Token used by hosts to namespace model names.
pub const NAME_SEPARATOR_TOKEN: &str = ":";

/// Maximum length of a physical source line, excluding the newline.
pub const MAX_LINE: usize = 200;
/// Maximum length of a logical line joined by `\` continuations.
pub const MAX_LOGICAL_LINE: usize = 1005;
/// Maximum length of a unit token, in bytes.
pub const MAX_UNIT: usize = 32;

fn is_reserved(ch: u8) -> bool {
    ch == 0 || RESERVED_NAME_TOKENS.as_bytes().contains(&ch)
}

fn is_name_start(ch: u8) -> bool {
    !is_reserved(ch) && !NOT_AT_NAME_START_TOKENS.as_bytes().contains(&ch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Model,
    Author,
    Date,
    Version,
    Ident,
    Declarations,
    Equations,
    End,
    If,
    Else,
    Fi,
    Var,
    Aux,
    Par,
    Con,
    Flg,
    Res,
}

impl Keyword {
    fn from_name(name: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match name {
            "model" => Model,
            "author" => Author,
            "date" => Date,
            "version" => Version,
            "ident" => Ident,
            "declarations" => Declarations,
            "equations" => Equations,
            "end" => End,
            "if" => If,
            "else" => Else,
            "fi" => Fi,
            "var" => Var,
            "aux" => Aux,
            "par" => Par,
            "con" => Con,
            "flg" => Flg,
            "res" => Res,
            _ => return None,
        })
    }
}

impl Display for Keyword {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use Keyword::*;
        let text = match self {
            Model => "model",
            Author => "author",
            Date => "date",
            Version => "version",
            Ident => "ident",
            Declarations => "declarations",
            Equations => "equations",
            End => "end",
            If => "if",
            Else => "else",
            Fi => "fi",
            Var => "var",
            Aux => "aux",
            Par => "par",
            Con => "con",
            Flg => "flg",
            Res => "res",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Number(f64),
    Unit(String),
    Keyword(Keyword),
    Assign,
    Semicolon,
    Comma,
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Bang,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    EqualEqual,
    BangEqual,
    Amp,
    Bar,
    Eol,
    /// Already reported by the lexer; the parser skips these.
    Error,
    Unknown(u8),
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use TokenKind::*;
        match self {
            Name(_) => write!(f, "name"),
            Number(_) => write!(f, "number"),
            Unit(_) => write!(f, "unit"),
            Keyword(kw) => write!(f, "'{kw}'"),
            Assign => write!(f, "'='"),
            Semicolon => write!(f, "';'"),
            Comma => write!(f, "','"),
            LeftBrace => write!(f, "'{{'"),
            RightBrace => write!(f, "'}}'"),
            LeftParen => write!(f, "'('"),
            RightParen => write!(f, "')'"),
            Plus => write!(f, "'+'"),
            Minus => write!(f, "'-'"),
            Star => write!(f, "'*'"),
            Slash => write!(f, "'/'"),
            Caret => write!(f, "'^'"),
            Bang => write!(f, "'!'"),
            Less => write!(f, "'<'"),
            Greater => write!(f, "'>'"),
            LessEqual => write!(f, "'<='"),
            GreaterEqual => write!(f, "'>='"),
            EqualEqual => write!(f, "'=='"),
            BangEqual => write!(f, "'!='"),
            Amp => write!(f, "'&'"),
            Bar => write!(f, "'|'"),
            Eol => write!(f, "end of line"),
            Error => write!(f, "invalid token"),
            Unknown(ch) => write!(f, "'{}'", *ch as char),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub source: Arc<str>,
}

impl HasSpan for Token {
    fn span(&self) -> Span {
        self.span
    }
}

pub struct Lexer {
    reader: ByteReader,
    source: Arc<str>,
    diagnostics: Vec<Diagnostic>,
    /// Bytes already joined into the current logical line by continuations.
    logical_len: usize,
    logical_reported: bool,
}

impl Lexer {
    pub fn new(reader: ByteReader, source: Arc<str>) -> Lexer {
        Lexer {
            reader,
            source,
            diagnostics: Vec::new(),
            logical_len: 0,
            logical_reported: false,
        }
    }

    pub fn from_text(text: impl Into<String>, source: Arc<str>) -> Lexer {
        Lexer::new(ByteReader::from_string(text.into()), source)
    }

    pub fn pos(&self) -> Position {
        self.reader.pos()
    }

    pub fn source(&self) -> Arc<str> {
        self.source.clone()
    }

    fn error(&mut self, span: Span, code: ErrorCode, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::new(span, self.source.clone(), code, message));
    }

    fn token(&self, kind: TokenKind, start: Position) -> Token {
        Token {
            kind,
            span: start.to(self.reader.pos()),
            source: self.source.clone(),
        }
    }

    /// Skip blanks and `\`-newline continuations.
    fn skip_blanks(&mut self) {
        loop {
            match self.reader.peek() {
                Some(b' ' | b'\t' | b'\r') => self.reader.skip(),
                Some(b'\\') => {
                    let after = match self.reader.peek_at(1) {
                        Some(b'\n') => 2,
                        Some(b'\r') if self.reader.peek_at(2) == Some(b'\n') => 3,
                        _ => return,
                    };
                    self.check_physical_line();
                    self.logical_len += self.reader.pos().column() as usize;
                    if self.logical_len > MAX_LOGICAL_LINE && !self.logical_reported {
                        self.logical_reported = true;
                        let span = self.reader.pos().as_char_span();
                        self.error(
                            span,
                            ErrorCode::OversizedLine,
                            format!("logical line exceeds {MAX_LOGICAL_LINE} bytes"),
                        );
                    }
                    self.reader.advance(after);
                }
                _ => return,
            }
        }
    }

    fn check_physical_line(&mut self) {
        let column = self.reader.pos().column() as usize;
        if column > MAX_LINE {
            let span = self.reader.pos().as_span();
            self.error(
                span,
                ErrorCode::OversizedLine,
                format!("line exceeds {MAX_LINE} bytes"),
            );
        }
    }

    fn number(&mut self, start: Position) -> Token {
        match scan_number(self.reader.rest()) {
            Ok((value, len)) => {
                self.reader.advance(len);
                match self.reader.peek() {
                    // a byte that could continue a literal or a name must not
                    // directly follow a number
                    Some(next) if !is_reserved(next) => {
                        let at = self.reader.pos().as_char_span();
                        self.error(
                            at,
                            ErrorCode::BadNumber,
                            format!("unexpected '{}' after number literal", next as char),
                        );
                        self.reader.skip();
                        self.token(TokenKind::Error, start)
                    }
                    _ => self.token(TokenKind::Number(value), start),
                }
            }
            Err(err) => {
                let code = match err {
                    NumberError::Malformed { .. } => ErrorCode::BadNumber,
                    NumberError::UnknownConstant { .. } => ErrorCode::UnknownConstant,
                };
                self.reader.advance(err.consumed().max(1));
                let span = start.to(self.reader.pos());
                let message = match code {
                    ErrorCode::UnknownConstant => "unknown named constant",
                    _ => "malformed number literal",
                };
                self.error(span, code, message);
                self.token(TokenKind::Error, start)
            }
        }
    }

    fn name(&mut self, start: Position) -> Token {
        let rest = self.reader.rest();
        let mut len = 1;
        while rest.get(len).is_some_and(|ch| !is_reserved(*ch)) {
            len += 1;
        }
        if len > MAX_NAME {
            self.reader.advance(len);
            let span = start.to(self.reader.pos());
            self.error(
                span,
                ErrorCode::OversizedToken,
                format!("name exceeds {MAX_NAME} bytes"),
            );
            return self.token(TokenKind::Error, start);
        }
        let text = std::str::from_utf8(&rest[..len])
            .expect("source is valid UTF-8")
            .to_string();
        self.reader.advance(len);
        match Keyword::from_name(&text) {
            Some(keyword) => self.token(TokenKind::Keyword(keyword), start),
            None => self.token(TokenKind::Name(text), start),
        }
    }

    /// Consume the remainder of the physical line as raw text, trimmed.
    /// The terminating newline is left for the next token.
    pub fn take_rest_of_line(&mut self) -> (String, Span) {
        self.skip_blanks();
        let start = self.reader.pos();
        let mut text = Vec::new();
        while let Some(ch) = self.reader.peek() {
            if ch == b'\n' {
                break;
            }
            text.push(ch);
            self.reader.skip();
        }
        let text = String::from_utf8(text).expect("source is valid UTF-8");
        let text = text.trim_end().to_string();
        (text, start.to(self.reader.pos()))
    }

    /// Consume a unit token: everything up to `,`, end of line or end of
    /// input, at most [`MAX_UNIT`] bytes. Returns `None` when the line ends
    /// immediately (a declaration without a unit).
    pub fn take_unit(&mut self) -> Option<Token> {
        self.skip_blanks();
        let start = self.reader.pos();
        let mut text = Vec::new();
        while let Some(ch) = self.reader.peek() {
            if ch == b'\n' || ch == b',' || ch == 0 {
                break;
            }
            text.push(ch);
            self.reader.skip();
        }
        if text.is_empty() {
            return None;
        }
        if text.len() > MAX_UNIT {
            let span = start.to(self.reader.pos());
            self.error(
                span,
                ErrorCode::OversizedToken,
                format!("unit exceeds {MAX_UNIT} bytes"),
            );
            return Some(self.token(TokenKind::Error, start));
        }
        let unit = String::from_utf8(text).expect("source is valid UTF-8");
        Some(self.token(TokenKind::Unit(unit.trim_end().to_string()), start))
    }

    fn consume(&mut self) -> Option<Token> {
        self.skip_blanks();
        let start = self.reader.pos();
        let ch = self.reader.peek()?;
        let simple = |lexer: &mut Lexer, kind: TokenKind, width: usize| -> Token {
            lexer.reader.advance(width);
            lexer.token(kind, start)
        };
        use TokenKind::*;
        Some(match ch {
            b'\n' => {
                self.check_physical_line();
                self.logical_len = 0;
                self.logical_reported = false;
                simple(self, Eol, 1)
            }
            b'=' if self.reader.peek_at(1) == Some(b'=') => simple(self, EqualEqual, 2),
            b'=' => simple(self, Assign, 1),
            b'!' if self.reader.peek_at(1) == Some(b'=') => simple(self, BangEqual, 2),
            b'!' => simple(self, Bang, 1),
            b'<' if self.reader.peek_at(1) == Some(b'=') => simple(self, LessEqual, 2),
            b'<' => simple(self, Less, 1),
            b'>' if self.reader.peek_at(1) == Some(b'=') => simple(self, GreaterEqual, 2),
            b'>' => simple(self, Greater, 1),
            b';' => simple(self, Semicolon, 1),
            b',' => simple(self, Comma, 1),
            b'{' => simple(self, LeftBrace, 1),
            b'}' => simple(self, RightBrace, 1),
            b'(' => simple(self, LeftParen, 1),
            b')' => simple(self, RightParen, 1),
            b'+' => simple(self, Plus, 1),
            b'-' => simple(self, Minus, 1),
            b'*' => simple(self, Star, 1),
            b'/' => simple(self, Slash, 1),
            b'^' => simple(self, Caret, 1),
            b'&' => simple(self, Amp, 1),
            b'|' => simple(self, Bar, 1),
            b'0'..=b'9' | b'_' => self.number(start),
            ch if is_name_start(ch) => self.name(start),
            ch => simple(self, Unknown(ch), 1),
        })
    }

    pub(crate) fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

impl Iterator for Lexer {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            let next = self.consume()?;
            if next.kind != TokenKind::Error {
                return Some(next);
            }
        }
    }
}

/// A copy of the `Peekable` interface. Operations like taking the rest of
/// a line or querying the EOF position still need a handle to the lexer,
/// so the standard adaptor does not fit.
pub struct PeekingLexer {
    lexer: Lexer,
    peeked: Option<Option<Token>>,
}

impl From<Lexer> for PeekingLexer {
    fn from(value: Lexer) -> Self {
        PeekingLexer {
            lexer: value,
            peeked: None,
        }
    }
}

impl PeekingLexer {
    pub fn peek(&mut self) -> Option<&Token> {
        let iter = &mut self.lexer;
        self.peeked.get_or_insert_with(|| iter.next()).as_ref()
    }

    pub fn peek_kind(&mut self) -> Option<&TokenKind> {
        self.peek().map(|tok| &tok.kind)
    }

    pub fn source(&self) -> Arc<str> {
        self.lexer.source()
    }

    pub fn pos(&self) -> Position {
        self.lexer.pos()
    }

    pub fn expect_next(&mut self) -> Result<Token, Diagnostic> {
        let eof_pos = self.lexer.pos();
        match self.next() {
            None => Err(Diagnostic::new(
                eof_pos.as_span(),
                self.lexer.source(),
                ErrorCode::UnexpectedToken,
                "unexpected end of file",
            )),
            Some(token) => Ok(token),
        }
    }

    /// See [`Lexer::take_rest_of_line`]. Must not be called with a token
    /// already peeked; the raw text would be gone.
    pub fn take_rest_of_line(&mut self) -> (String, Span) {
        debug_assert!(self.peeked.is_none(), "peeked token before raw line read");
        self.lexer.take_rest_of_line()
    }

    /// See [`Lexer::take_unit`].
    pub fn take_unit(&mut self) -> Option<Token> {
        debug_assert!(self.peeked.is_none(), "peeked token before unit read");
        self.lexer.take_unit()
    }

    pub(crate) fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.lexer.take_diagnostics()
    }
}

impl Iterator for PeekingLexer {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        match self.peeked.take() {
            Some(v) => v,
            None => self.lexer.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Keyword, Lexer, TokenKind};
    use crate::mdl::error_codes::ErrorCode;
    use crate::mdl::HasSpan;
    use std::sync::Arc;

    fn tokenize(text: &str) -> (Vec<TokenKind>, Vec<ErrorCode>) {
        let source: Arc<str> = "inline".into();
        let mut lexer = Lexer::from_text(text, source);
        let kinds: Vec<TokenKind> = (&mut lexer).map(|tok| tok.kind).collect();
        let codes = lexer
            .take_diagnostics()
            .iter()
            .map(|diag| diag.code())
            .collect();
        (kinds, codes)
    }

    #[test]
    fn tokenize_declaration_line() {
        use TokenKind::*;
        let (kinds, codes) = tokenize("par beta = { 2, 0, 10, 0, 10 }");
        assert!(codes.is_empty());
        assert_eq!(
            kinds,
            vec![
                Keyword(super::Keyword::Par),
                Name("beta".into()),
                Assign,
                LeftBrace,
                Number(2.0),
                Comma,
                Number(0.0),
                Comma,
                Number(10.0),
                Comma,
                Number(0.0),
                Comma,
                Number(10.0),
                RightBrace,
            ]
        );
    }

    #[test]
    fn tokenize_expression() {
        use TokenKind::*;
        let (kinds, codes) = tokenize("r = a*x + sin(x)^2;");
        assert!(codes.is_empty());
        assert_eq!(
            kinds,
            vec![
                Name("r".into()),
                Assign,
                Name("a".into()),
                Star,
                Name("x".into()),
                Plus,
                Name("sin".into()),
                LeftParen,
                Name("x".into()),
                RightParen,
                Caret,
                Number(2.0),
                Semicolon,
            ]
        );
    }

    #[test]
    fn tokenize_comparisons() {
        use TokenKind::*;
        let (kinds, codes) = tokenize("< <= > >= == != & | !");
        assert!(codes.is_empty());
        assert_eq!(
            kinds,
            vec![Less, LessEqual, Greater, GreaterEqual, EqualEqual, BangEqual, Amp, Bar, Bang]
        );
    }

    #[test]
    fn numbers_with_suffix_and_constant() {
        use TokenKind::*;
        let (kinds, codes) = tokenize("1.5k 2u _pi 2_pi");
        assert!(codes.is_empty());
        assert_eq!(
            kinds,
            vec![
                Number(1500.0),
                Number(2e-6),
                Number(std::f64::consts::PI),
                Number(2.0 * std::f64::consts::PI),
            ]
        );
    }

    #[test]
    fn stray_digit_after_suffix_is_a_lex_error() {
        let source: Arc<str> = "inline".into();
        let mut lexer = Lexer::from_text("1k5", source);
        let tokens: Vec<_> = (&mut lexer).collect();
        assert!(tokens.is_empty());
        let diagnostics = lexer.take_diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code(), ErrorCode::BadNumber);
        // the error points at the stray '5'
        assert_eq!(diagnostics[0].span().start().column(), 2);
    }

    #[test]
    fn unknown_constant_is_reported() {
        let (kinds, codes) = tokenize("2_foo");
        assert!(kinds.is_empty());
        assert_eq!(codes, vec![ErrorCode::UnknownConstant]);
    }

    #[test]
    fn oversized_name_is_reported() {
        let long = "x".repeat(33);
        let (kinds, codes) = tokenize(&long);
        assert!(kinds.is_empty());
        assert_eq!(codes, vec![ErrorCode::OversizedToken]);
    }

    #[test]
    fn continuation_joins_lines() {
        use TokenKind::*;
        let (kinds, codes) = tokenize("a + \\\nb");
        assert!(codes.is_empty());
        assert_eq!(kinds, vec![Name("a".into()), Plus, Name("b".into())]);
    }

    #[test]
    fn newline_is_a_token() {
        use TokenKind::*;
        let (kinds, codes) = tokenize("a\nb");
        assert!(codes.is_empty());
        assert_eq!(kinds, vec![Name("a".into()), Eol, Name("b".into())]);
    }

    #[test]
    fn keywords_are_recognized() {
        let (kinds, codes) = tokenize("if else fi end");
        assert!(codes.is_empty());
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::If),
                TokenKind::Keyword(Keyword::Else),
                TokenKind::Keyword(Keyword::Fi),
                TokenKind::Keyword(Keyword::End),
            ]
        );
    }

    #[test]
    fn oversized_physical_line_is_reported() {
        let line = format!("{}\n", "x ".repeat(110));
        let (_, codes) = tokenize(&line);
        assert_eq!(codes, vec![ErrorCode::OversizedLine]);
    }

    #[test]
    fn unit_tokens() {
        let source: Arc<str> = "inline".into();
        let mut lexer = Lexer::from_text("V/m\nnext", source);
        let unit = lexer.take_unit().expect("unit present");
        assert_eq!(unit.kind, TokenKind::Unit("V/m".into()));
        assert_eq!(lexer.next().map(|tok| tok.kind), Some(TokenKind::Eol));
    }
}
