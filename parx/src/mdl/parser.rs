use crate::mdl::avl::InsertOutcome;
use crate::mdl::code::{AuxDecl, ConDecl, FlgDecl, ParDecl, Tables, VarDecl};
use crate::mdl::data::{HasSpan, Span};
use crate::mdl::diagnostics::Diagnostic;
use crate::mdl::error_codes::ErrorCode;
use crate::mdl::expr::{BinaryOp, ExprPool, Node, NodeId, SymRef, UnaryOp};
use crate::mdl::lex::{Keyword, Lexer, PeekingLexer, Token, TokenKind};
use crate::mdl::symbols::{Symbol, SymbolKind, SymbolTable};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Maximum nesting level of conditional statements.
pub const MAX_NESTING: usize = 16;
/// Maximum number of statements in the equation section.
pub const MAX_STATEMENTS: usize = 1000;
/// Diagnostics are collected up to this bound, then parsing stops.
pub const MAX_ERRORS: usize = 20;

type Result<T> = std::result::Result<T, Diagnostic>;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Header {
    pub model: String,
    pub author: String,
    pub date: String,
    pub version: String,
    pub ident: String,
}

/// Everything the later phases need from a parse, error or not.
pub(crate) struct ParseOutput {
    pub header: Header,
    pub tables: Tables,
    pub pool: ExprPool,
    pub symbols: SymbolTable,
    /// Definition tree per residual, in declaration order.
    pub res_defs: Vec<Option<NodeId>>,
    /// Definition tree per auxiliary, in declaration order.
    pub aux_defs: Vec<Option<NodeId>>,
    pub diagnostics: Vec<Diagnostic>,
}

/// An expression with its statically known type. The model language only
/// knows reals and booleans; booleans exist in conditions.
struct TypedExpr {
    id: NodeId,
    boolean: bool,
    span: Span,
}

/// One open `if`: the condition and the definitions collected per branch.
struct Frame {
    cond: NodeId,
    in_else: bool,
    then_defs: HashMap<String, NodeId>,
    else_defs: HashMap<String, NodeId>,
    span: Span,
}

impl Frame {
    fn current_defs(&self) -> &HashMap<String, NodeId> {
        if self.in_else {
            &self.else_defs
        } else {
            &self.then_defs
        }
    }

    fn current_defs_mut(&mut self) -> &mut HashMap<String, NodeId> {
        if self.in_else {
            &mut self.else_defs
        } else {
            &mut self.then_defs
        }
    }
}

/// Recursive-descent parser for model files. Consumes the declaration
/// section, then the equation section, building the expression DAG and
/// symbol table as it goes. Recovers at statement boundaries so one
/// invocation reports as much as possible.
pub struct Parser {
    lexer: PeekingLexer,
    diagnostics: Vec<Diagnostic>,
    pool: ExprPool,
    symbols: SymbolTable,
    tables: Tables,
    header: Header,
    frames: Vec<Frame>,
    tmp_count: u32,
    stmt_count: usize,
    aborted: bool,
}

impl Parser {
    pub fn from_text(text: impl Into<String>, source: Arc<str>) -> Parser {
        Parser {
            lexer: Lexer::from_text(text, source).into(),
            diagnostics: Vec::new(),
            pool: ExprPool::new(),
            symbols: SymbolTable::new(),
            tables: Tables::default(),
            header: Header::default(),
            frames: Vec::new(),
            tmp_count: 0,
            stmt_count: 0,
            aborted: false,
        }
    }

    pub(crate) fn parse(mut self) -> ParseOutput {
        self.parse_header();
        if self.parse_declarations() {
            self.parse_equations();
        }
        self.finalize()
    }

    fn diag(&self, span: Span, code: ErrorCode, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(span, self.lexer.source(), code, message)
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        if self.aborted {
            return;
        }
        self.diagnostics.push(diagnostic);
        if self.diagnostics.len() >= MAX_ERRORS {
            let span = self.lexer.pos().as_span();
            self.diagnostics.push(self.diag(
                span,
                ErrorCode::TooManyErrors,
                "too many errors, giving up",
            ));
            self.aborted = true;
        }
    }

    fn error(&mut self, span: Span, code: ErrorCode, message: impl Into<String>) {
        let diagnostic = self.diag(span, code, message);
        self.report(diagnostic);
    }

    fn expect(&mut self, kind: TokenKind, code: ErrorCode) -> Result<Token> {
        let eof_pos = self.lexer.pos();
        match self.lexer.next() {
            None => Err(self.diag(
                eof_pos.as_span(),
                code,
                format!("expected {kind}, found end of file"),
            )),
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(self.diag(
                token.span,
                code,
                format!("expected {kind}, found {}", token.kind),
            )),
        }
    }

    fn skip_eols(&mut self) {
        while self.lexer.peek_kind() == Some(&TokenKind::Eol) {
            self.lexer.next();
        }
    }

    fn expect_end_of_line(&mut self) -> Result<()> {
        match self.lexer.peek_kind() {
            None | Some(TokenKind::Eol) => {
                self.lexer.next();
                Ok(())
            }
            Some(_) => {
                let token = self.lexer.next().expect("token was peeked");
                Err(self.diag(
                    token.span,
                    ErrorCode::UnexpectedToken,
                    format!("expected end of line, found {}", token.kind),
                ))
            }
        }
    }

    // --- header ---------------------------------------------------------

    fn parse_header(&mut self) {
        use Keyword::*;
        for keyword in [Model, Author, Date, Version, Ident] {
            self.skip_eols();
            match self.lexer.peek_kind() {
                Some(TokenKind::Keyword(found)) if *found == keyword => {
                    self.lexer.next();
                    let (text, _) = self.lexer.take_rest_of_line();
                    match keyword {
                        Model => self.header.model = text,
                        Author => self.header.author = text,
                        Date => self.header.date = text,
                        Version => self.header.version = text,
                        Ident => self.header.ident = text,
                        _ => unreachable!(),
                    }
                }
                _ => {
                    let span = self
                        .lexer
                        .peek()
                        .map(|tok| tok.span)
                        .unwrap_or_else(|| self.lexer.pos().as_span());
                    self.error(
                        span,
                        ErrorCode::MissingHeader,
                        format!("expected '{keyword}' header line"),
                    );
                    return;
                }
            }
        }
    }

    // --- declarations ---------------------------------------------------

    /// Returns true when the `equations` keyword was reached.
    fn parse_declarations(&mut self) -> bool {
        self.skip_eols();
        if self.lexer.peek_kind() != Some(&TokenKind::Keyword(Keyword::Declarations)) {
            let span = self
                .lexer
                .peek()
                .map(|tok| tok.span)
                .unwrap_or_else(|| self.lexer.pos().as_span());
            self.error(
                span,
                ErrorCode::MissingPunctuation,
                "expected 'declarations'",
            );
            // resynchronize on the section keyword
            loop {
                match self.lexer.peek_kind() {
                    None => return false,
                    Some(TokenKind::Keyword(Keyword::Declarations)) => break,
                    Some(TokenKind::Keyword(Keyword::Equations)) => {
                        self.lexer.next();
                        return true;
                    }
                    _ => {
                        self.lexer.next();
                    }
                }
            }
        }
        self.lexer.next();
        if let Err(diagnostic) = self.expect_end_of_line() {
            self.report(diagnostic);
        }

        loop {
            if self.aborted {
                return false;
            }
            self.skip_eols();
            match self.lexer.peek_kind() {
                None => {
                    let span = self.lexer.pos().as_span();
                    self.error(
                        span,
                        ErrorCode::MissingPunctuation,
                        "expected 'equations' before end of file",
                    );
                    return false;
                }
                Some(TokenKind::Keyword(Keyword::Equations)) => {
                    self.lexer.next();
                    if let Err(diagnostic) = self.expect_end_of_line() {
                        self.report(diagnostic);
                    }
                    return true;
                }
                Some(TokenKind::Keyword(
                    Keyword::Var | Keyword::Aux | Keyword::Par | Keyword::Con | Keyword::Flg
                    | Keyword::Res,
                )) => {
                    if let Err(diagnostic) = self.parse_declaration() {
                        self.report(diagnostic);
                        self.sync_to_eol();
                    }
                }
                Some(_) => {
                    let token = self.lexer.next().expect("token was peeked");
                    self.error(
                        token.span,
                        ErrorCode::UnexpectedToken,
                        format!("expected declaration or 'equations', found {}", token.kind),
                    );
                    self.sync_to_eol();
                }
            }
        }
    }

    fn sync_to_eol(&mut self) {
        loop {
            match self.lexer.next() {
                None => return,
                Some(token) if token.kind == TokenKind::Eol => return,
                Some(_) => {}
            }
        }
    }

    fn parse_declaration(&mut self) -> Result<()> {
        let kind_token = self.lexer.expect_next()?;
        let kind = match kind_token.kind {
            TokenKind::Keyword(Keyword::Var) => SymbolKind::Var,
            TokenKind::Keyword(Keyword::Aux) => SymbolKind::Aux,
            TokenKind::Keyword(Keyword::Par) => SymbolKind::Par,
            TokenKind::Keyword(Keyword::Con) => SymbolKind::Con,
            TokenKind::Keyword(Keyword::Flg) => SymbolKind::Flg,
            TokenKind::Keyword(Keyword::Res) => SymbolKind::Res,
            _ => unreachable!("caller checked the keyword"),
        };
        let name_token = self.lexer.expect_next()?;
        let name = match &name_token.kind {
            TokenKind::Name(name) => name.clone(),
            TokenKind::Number(_) => {
                return Err(self.diag(
                    name_token.span,
                    ErrorCode::ReservedPrefix,
                    "a declared name may not begin with a digit, '.' or '_'",
                ))
            }
            other => {
                return Err(self.diag(
                    name_token.span,
                    ErrorCode::UnexpectedToken,
                    format!("expected name, found {other}"),
                ))
            }
        };

        match kind {
            SymbolKind::Res => {
                self.expect_end_of_line()?;
                self.register(&name, SymbolKind::Res, name_token.span)?;
                self.tables.res.push(name);
            }
            SymbolKind::Var => {
                self.expect(TokenKind::Assign, ErrorCode::MissingPunctuation)?;
                let [abstol, lower_limit, upper_limit] = self.parse_values()?;
                let unit = self.parse_unit()?;
                self.expect_end_of_line()?;
                self.register(&name, SymbolKind::Var, name_token.span)?;
                self.tables.var.push(VarDecl {
                    name,
                    abstol,
                    lower_limit,
                    upper_limit,
                    unit,
                });
            }
            SymbolKind::Aux => {
                self.expect(TokenKind::Assign, ErrorCode::MissingPunctuation)?;
                let [abstol, lower_limit, upper_limit] = self.parse_values()?;
                self.expect_end_of_line()?;
                self.register(&name, SymbolKind::Aux, name_token.span)?;
                self.tables.aux.push(AuxDecl {
                    name,
                    abstol,
                    lower_limit,
                    upper_limit,
                });
            }
            SymbolKind::Par => {
                self.expect(TokenKind::Assign, ErrorCode::MissingPunctuation)?;
                let [default, lower_bound, upper_bound, lower_limit, upper_limit] =
                    self.parse_values()?;
                let unit = self.parse_unit()?;
                self.expect_end_of_line()?;
                self.register(&name, SymbolKind::Par, name_token.span)?;
                self.tables.par.push(ParDecl {
                    name,
                    default,
                    lower_bound,
                    upper_bound,
                    lower_limit,
                    upper_limit,
                    unit,
                });
            }
            SymbolKind::Con => {
                self.expect(TokenKind::Assign, ErrorCode::MissingPunctuation)?;
                let [default] = self.parse_values()?;
                let unit = self.parse_unit()?;
                self.expect_end_of_line()?;
                self.register(&name, SymbolKind::Con, name_token.span)?;
                self.tables.con.push(ConDecl {
                    name,
                    default,
                    unit,
                });
            }
            SymbolKind::Flg => {
                self.expect(TokenKind::Assign, ErrorCode::MissingPunctuation)?;
                let [default] = self.parse_values()?;
                self.expect_end_of_line()?;
                self.register(&name, SymbolKind::Flg, name_token.span)?;
                self.tables.flg.push(FlgDecl { name, default });
            }
            SymbolKind::Tmp => unreachable!("temporaries are never declared"),
        }
        Ok(())
    }

    fn register(&mut self, name: &str, kind: SymbolKind, span: Span) -> Result<()> {
        let index = match kind {
            SymbolKind::Var => self.tables.var.len(),
            SymbolKind::Aux => self.tables.aux.len(),
            SymbolKind::Par => self.tables.par.len(),
            SymbolKind::Con => self.tables.con.len(),
            SymbolKind::Flg => self.tables.flg.len(),
            SymbolKind::Res => self.tables.res.len(),
            SymbolKind::Tmp => unreachable!(),
        } as u32;
        match self.symbols.declare(name, Symbol::new(kind, index, span)) {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Exists => Err(self.diag(
                span,
                ErrorCode::Redeclared,
                format!("'{name}' is already declared"),
            )),
        }
    }

    fn parse_values<const N: usize>(&mut self) -> Result<[f64; N]> {
        let open = self.expect(TokenKind::LeftBrace, ErrorCode::MissingPunctuation)?;
        let mut values = Vec::new();
        loop {
            values.push(self.parse_value()?);
            let token = self.lexer.expect_next()?;
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RightBrace => break,
                other => {
                    return Err(self.diag(
                        token.span,
                        ErrorCode::MalformedDeclaration,
                        format!("expected ',' or '}}', found {other}"),
                    ))
                }
            }
        }
        values.try_into().map_err(|values: Vec<f64>| {
            self.diag(
                open.span,
                ErrorCode::MalformedDeclaration,
                format!("expected {} values, found {}", N, values.len()),
            )
        })
    }

    fn parse_value(&mut self) -> Result<f64> {
        let mut sign = 1.0;
        let mut token = self.lexer.expect_next()?;
        match token.kind {
            TokenKind::Plus => token = self.lexer.expect_next()?,
            TokenKind::Minus => {
                sign = -1.0;
                token = self.lexer.expect_next()?;
            }
            _ => {}
        }
        match &token.kind {
            TokenKind::Number(value) => Ok(sign * value),
            TokenKind::Name(name) if name == "inf" || name == "Inf" => Ok(sign * f64::INFINITY),
            other => Err(self.diag(
                token.span,
                ErrorCode::MalformedDeclaration,
                format!("expected value, found {other}"),
            )),
        }
    }

    fn parse_unit(&mut self) -> Result<String> {
        match self.lexer.take_unit() {
            None => Ok(String::new()),
            Some(token) => match token.kind {
                TokenKind::Unit(unit) => Ok(unit),
                // oversize already reported by the lexer
                _ => Ok(String::new()),
            },
        }
    }

    // --- equations ------------------------------------------------------

    fn parse_equations(&mut self) {
        loop {
            if self.aborted {
                return;
            }
            self.skip_eols();
            match self.lexer.peek_kind() {
                None => break,
                Some(TokenKind::Keyword(Keyword::End)) => {
                    self.lexer.next();
                    break;
                }
                Some(TokenKind::Keyword(Keyword::If)) => {
                    self.count_statement();
                    if let Err(diagnostic) = self.parse_if_open() {
                        self.report(diagnostic);
                        self.recover();
                    }
                }
                Some(TokenKind::Keyword(Keyword::Else)) => {
                    self.count_statement();
                    self.parse_else();
                }
                Some(TokenKind::Keyword(Keyword::Fi)) => {
                    self.count_statement();
                    self.parse_fi();
                }
                Some(TokenKind::Name(_)) => {
                    self.count_statement();
                    if let Err(diagnostic) = self.parse_assignment() {
                        self.report(diagnostic);
                        self.recover();
                    }
                }
                Some(_) => {
                    let token = self.lexer.next().expect("token was peeked");
                    self.error(
                        token.span,
                        ErrorCode::UnexpectedToken,
                        format!("expected statement, found {}", token.kind),
                    );
                    self.recover();
                }
            }
        }
        if let Some(frame) = self.frames.last() {
            let span = frame.span;
            self.error(span, ErrorCode::MissingPunctuation, "'if' without 'fi'");
            self.frames.clear();
        }
    }

    fn count_statement(&mut self) {
        self.stmt_count += 1;
        if self.stmt_count == MAX_STATEMENTS + 1 {
            let span = self.lexer.pos().as_span();
            self.error(
                span,
                ErrorCode::TooManyStatements,
                format!("more than {MAX_STATEMENTS} statements"),
            );
        }
    }

    /// Skip to the next statement boundary.
    fn recover(&mut self) {
        loop {
            match self.lexer.peek_kind() {
                None => return,
                Some(TokenKind::Semicolon | TokenKind::Eol) => {
                    self.lexer.next();
                    return;
                }
                Some(TokenKind::Keyword(
                    Keyword::If | Keyword::Else | Keyword::Fi | Keyword::End,
                )) => return,
                Some(_) => {
                    self.lexer.next();
                }
            }
        }
    }

    /// The definition of `name` visible on the current control path.
    fn visible_def(&self, name: &str) -> Option<NodeId> {
        for frame in self.frames.iter().rev() {
            if let Some(def) = frame.current_defs().get(name) {
                return Some(*def);
            }
        }
        self.symbols.find(name).and_then(|sym| sym.def)
    }

    /// Record a definition on the current control path, without checks.
    fn set_def(&mut self, name: &str, def: NodeId) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.current_defs_mut().insert(name.to_string(), def);
            }
            None => {
                self.symbols
                    .find_mut(name)
                    .expect("assignment target was registered")
                    .def = Some(def);
            }
        }
    }

    fn parse_assignment(&mut self) -> Result<()> {
        let name_token = self.lexer.expect_next()?;
        let TokenKind::Name(name) = name_token.kind.clone() else {
            unreachable!("caller checked the name");
        };
        let target_ok = match self.symbols.find(&name) {
            Some(symbol) => match symbol.kind {
                SymbolKind::Res | SymbolKind::Aux | SymbolKind::Tmp => true,
                kind => {
                    self.error(
                        name_token.span,
                        ErrorCode::InvalidAssignTarget,
                        format!("cannot assign to {kind} '{name}'"),
                    );
                    false
                }
            },
            None => {
                // first left-hand-side use introduces a temporary
                let index = self.tmp_count;
                self.tmp_count += 1;
                self.symbols
                    .declare(&name, Symbol::new(SymbolKind::Tmp, index, name_token.span));
                true
            }
        };
        self.expect(TokenKind::Assign, ErrorCode::MissingPunctuation)?;
        let rhs = self.parse_expression()?;
        if rhs.boolean {
            self.error(
                rhs.span,
                ErrorCode::FlagAsReal,
                "a boolean expression cannot be assigned",
            );
        }
        self.expect(TokenKind::Semicolon, ErrorCode::MissingPunctuation)?;
        if target_ok {
            if self.visible_def(&name).is_some() {
                self.error(
                    name_token.span,
                    ErrorCode::MultipleAssignment,
                    format!("'{name}' is assigned more than once"),
                );
            } else {
                self.set_def(&name, rhs.id);
            }
            let symbol = self.symbols.find_mut(&name).expect("target exists");
            symbol.assigned = true;
            symbol.used = true;
        }
        Ok(())
    }

    fn parse_if_open(&mut self) -> Result<()> {
        let if_token = self.lexer.expect_next()?;
        if self.frames.len() >= MAX_NESTING {
            self.error(
                if_token.span,
                ErrorCode::NestingTooDeep,
                format!("conditionals nest deeper than {MAX_NESTING}"),
            );
        }
        self.expect(TokenKind::LeftParen, ErrorCode::MissingPunctuation)?;
        let cond = self.parse_expression()?;
        if !cond.boolean {
            self.error(
                cond.span,
                ErrorCode::RealAsCondition,
                "the condition must be a boolean expression",
            );
        }
        self.expect(TokenKind::RightParen, ErrorCode::MissingPunctuation)?;
        self.frames.push(Frame {
            cond: cond.id,
            in_else: false,
            then_defs: HashMap::new(),
            else_defs: HashMap::new(),
            span: if_token.span,
        });
        Ok(())
    }

    fn parse_else(&mut self) {
        let token = self.lexer.next().expect("token was peeked");
        match self.frames.last_mut() {
            None => self.error(
                token.span,
                ErrorCode::UnexpectedToken,
                "'else' without 'if'",
            ),
            Some(frame) if frame.in_else => {
                self.error(token.span, ErrorCode::UnexpectedToken, "second 'else'")
            }
            Some(frame) => frame.in_else = true,
        }
    }

    fn parse_fi(&mut self) {
        let token = self.lexer.next().expect("token was peeked");
        let Some(frame) = self.frames.pop() else {
            self.error(token.span, ErrorCode::UnexpectedToken, "'fi' without 'if'");
            return;
        };
        // merge both branches into conditional definitions
        let names: BTreeSet<String> = frame
            .then_defs
            .keys()
            .chain(frame.else_defs.keys())
            .cloned()
            .collect();
        for name in names {
            let fallback = self.visible_def(&name);
            let then_def = frame.then_defs.get(&name).copied().or(fallback);
            let else_def = frame.else_defs.get(&name).copied().or(fallback);
            match (then_def, else_def) {
                (Some(then_def), Some(else_def)) => {
                    let merged = self.pool.cond(frame.cond, then_def, else_def);
                    self.set_def(&name, merged);
                }
                _ => self.error(
                    token.span,
                    ErrorCode::NotAssignedOnAllPaths,
                    format!("'{name}' is not assigned on all paths of the conditional"),
                ),
            }
        }
    }

    // --- expressions ----------------------------------------------------

    fn parse_expression(&mut self) -> Result<TypedExpr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<TypedExpr> {
        let mut lhs = self.parse_unary()?;
        while let Some((precedence, op, right_assoc)) =
            self.lexer.peek_kind().and_then(binary_operator)
        {
            if precedence < min_precedence {
                break;
            }
            let op_token = self.lexer.next().expect("operator was peeked");
            let next_min = if right_assoc {
                precedence
            } else {
                precedence + 1
            };
            let rhs = self.parse_binary(next_min)?;
            lhs = self.combine(op, lhs, rhs, &op_token);
        }
        Ok(lhs)
    }

    fn combine(&mut self, op: BinaryOp, lhs: TypedExpr, rhs: TypedExpr, token: &Token) -> TypedExpr {
        use BinaryOp::*;
        let boolean = match op {
            And | Or => {
                for operand in [&lhs, &rhs] {
                    if !operand.boolean {
                        self.error(
                            operand.span,
                            ErrorCode::RealAsCondition,
                            format!("{} requires boolean operands", token.kind),
                        );
                    }
                }
                true
            }
            Lt | Gt | Le | Ge | Eq | Ne => {
                for operand in [&lhs, &rhs] {
                    if operand.boolean {
                        self.error(
                            operand.span,
                            ErrorCode::FlagAsReal,
                            format!("{} compares numbers, not booleans", token.kind),
                        );
                    }
                }
                true
            }
            Add | Sub | Mul | Div | Pow => {
                for operand in [&lhs, &rhs] {
                    if operand.boolean {
                        self.error(
                            operand.span,
                            ErrorCode::FlagAsReal,
                            "a boolean expression cannot be used as a number",
                        );
                    }
                }
                false
            }
        };
        TypedExpr {
            id: self.pool.binary(op, lhs.id, rhs.id),
            boolean,
            span: lhs.span.start().to(rhs.span.end()),
        }
    }

    fn parse_unary(&mut self) -> Result<TypedExpr> {
        match self.lexer.peek_kind() {
            Some(TokenKind::Minus) => {
                let token = self.lexer.next().expect("token was peeked");
                let operand = self.parse_unary()?;
                if operand.boolean {
                    self.error(
                        operand.span,
                        ErrorCode::FlagAsReal,
                        "a boolean expression cannot be negated with '-'",
                    );
                }
                Ok(TypedExpr {
                    id: self.pool.unary(UnaryOp::Neg, operand.id),
                    boolean: false,
                    span: token.span.start().to(operand.span.end()),
                })
            }
            Some(TokenKind::Bang) => {
                let token = self.lexer.next().expect("token was peeked");
                let operand = self.parse_unary()?;
                if !operand.boolean {
                    self.error(
                        operand.span,
                        ErrorCode::RealAsCondition,
                        "'!' requires a boolean operand",
                    );
                }
                Ok(TypedExpr {
                    id: self.pool.unary(UnaryOp::Not, operand.id),
                    boolean: true,
                    span: token.span.start().to(operand.span.end()),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<TypedExpr> {
        let token = self.lexer.expect_next()?;
        match &token.kind {
            TokenKind::Number(value) => Ok(TypedExpr {
                id: self.pool.number(*value),
                boolean: false,
                span: token.span,
            }),
            TokenKind::LeftParen => {
                let inner = self.parse_expression()?;
                let close = self.expect(TokenKind::RightParen, ErrorCode::MissingPunctuation)?;
                Ok(TypedExpr {
                    id: inner.id,
                    boolean: inner.boolean,
                    span: token.span.start().to(close.span.end()),
                })
            }
            TokenKind::Name(name) => {
                if self.lexer.peek_kind() == Some(&TokenKind::LeftParen) {
                    if let Some(op) = function_op(name) {
                        let name = name.clone();
                        return self.parse_call(op, &name, token.span);
                    }
                }
                self.parse_reference(name.clone(), token.span)
            }
            other => Err(self.diag(
                token.span,
                ErrorCode::UnexpectedToken,
                format!("expected expression, found {other}"),
            )),
        }
    }

    fn parse_call(&mut self, op: UnaryOp, name: &str, start: Span) -> Result<TypedExpr> {
        self.expect(TokenKind::LeftParen, ErrorCode::MissingPunctuation)?;
        let argument = self.parse_expression()?;
        if argument.boolean {
            self.error(
                argument.span,
                ErrorCode::FlagAsReal,
                format!("'{name}' takes a number"),
            );
        }
        let close = self.expect(TokenKind::RightParen, ErrorCode::MissingPunctuation)?;
        Ok(TypedExpr {
            id: self.pool.unary(op, argument.id),
            boolean: false,
            span: start.start().to(close.span.end()),
        })
    }

    fn parse_reference(&mut self, name: String, span: Span) -> Result<TypedExpr> {
        let Some(symbol) = self.symbols.find(&name) else {
            return Err(self.diag(
                span,
                ErrorCode::Undeclared,
                format!("'{name}' is not declared"),
            ));
        };
        let kind = symbol.kind;
        let index = symbol.index;
        match kind {
            SymbolKind::Var | SymbolKind::Par | SymbolKind::Con | SymbolKind::Aux => {
                self.symbols.find_mut(&name).expect("symbol exists").used = true;
                Ok(TypedExpr {
                    id: self.pool.sym(SymRef { kind, index }),
                    boolean: false,
                    span,
                })
            }
            SymbolKind::Flg => {
                self.symbols.find_mut(&name).expect("symbol exists").used = true;
                Ok(TypedExpr {
                    id: self.pool.sym(SymRef { kind, index }),
                    boolean: true,
                    span,
                })
            }
            SymbolKind::Tmp => match self.visible_def(&name) {
                Some(def) => {
                    self.symbols.find_mut(&name).expect("symbol exists").used = true;
                    Ok(TypedExpr {
                        id: def,
                        boolean: false,
                        span,
                    })
                }
                None => Err(self.diag(
                    span,
                    ErrorCode::Undeclared,
                    format!("temporary '{name}' is used before it is assigned"),
                )),
            },
            SymbolKind::Res => Err(self.diag(
                span,
                ErrorCode::InvalidAssignTarget,
                format!("residual '{name}' cannot appear in an expression"),
            )),
        }
    }

    // --- wrap-up --------------------------------------------------------

    fn finalize(mut self) -> ParseOutput {
        // residuals must all have been assigned
        for res_name in self.tables.res.clone() {
            let symbol = self.symbols.find(&res_name).expect("residuals are declared");
            if symbol.def.is_none() {
                let span = symbol.decl_span;
                self.error(
                    span,
                    ErrorCode::NotAssigned,
                    format!("residual '{res_name}' is never assigned"),
                );
            }
        }
        self.check_aux_cycles();
        if self.pool.overflowed() {
            let span = self.lexer.pos().as_span();
            self.error(span, ErrorCode::OutOfMemory, "expression pool exhausted");
        }
        self.warn_unused();

        let res_defs = self
            .tables
            .res
            .iter()
            .map(|name| self.symbols.find(name).and_then(|sym| sym.def))
            .collect();
        let aux_defs = self
            .tables
            .aux
            .iter()
            .map(|decl| self.symbols.find(&decl.name).and_then(|sym| sym.def))
            .collect();

        let mut diagnostics = self.diagnostics;
        diagnostics.extend(self.lexer.take_diagnostics());
        diagnostics.sort_by_key(|diag| (diag.start().line(), diag.start().column()));
        ParseOutput {
            header: self.header,
            tables: self.tables,
            pool: self.pool,
            symbols: self.symbols,
            res_defs,
            aux_defs,
            diagnostics,
        }
    }

    /// Reject auxiliaries whose definitions depend on themselves.
    fn check_aux_cycles(&mut self) {
        let aux_defs: Vec<Option<NodeId>> = self
            .tables
            .aux
            .iter()
            .map(|decl| self.symbols.find(&decl.name).and_then(|sym| sym.def))
            .collect();
        let mut states = vec![0u8; aux_defs.len()];
        for index in 0..aux_defs.len() {
            if Self::aux_has_cycle(&self.pool, &aux_defs, &mut states, index) {
                let name = self.tables.aux[index].name.clone();
                let span = self.symbols.find(&name).expect("aux is declared").decl_span;
                self.error(
                    span,
                    ErrorCode::RecursiveDefinition,
                    format!("auxiliary '{name}' depends on itself"),
                );
            }
        }
    }

    fn aux_has_cycle(
        pool: &ExprPool,
        aux_defs: &[Option<NodeId>],
        states: &mut [u8],
        index: usize,
    ) -> bool {
        match states[index] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        states[index] = 1;
        let mut cyclic = false;
        if let Some(def) = aux_defs[index] {
            cyclic = Self::node_has_cycle(pool, aux_defs, states, def);
        }
        states[index] = 2;
        cyclic
    }

    fn node_has_cycle(
        pool: &ExprPool,
        aux_defs: &[Option<NodeId>],
        states: &mut [u8],
        id: NodeId,
    ) -> bool {
        match pool.node(id) {
            Node::Num(_) => false,
            Node::Sym(sym) => {
                sym.kind == SymbolKind::Aux
                    && aux_defs[sym.index as usize].is_some()
                    && Self::aux_has_cycle(pool, aux_defs, states, sym.index as usize)
            }
            Node::Unary(_, child) => Self::node_has_cycle(pool, aux_defs, states, child),
            Node::Binary(_, lhs, rhs) => {
                Self::node_has_cycle(pool, aux_defs, states, lhs)
                    || Self::node_has_cycle(pool, aux_defs, states, rhs)
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                Self::node_has_cycle(pool, aux_defs, states, cond)
                    || Self::node_has_cycle(pool, aux_defs, states, then)
                    || Self::node_has_cycle(pool, aux_defs, states, otherwise)
            }
        }
    }

    fn warn_unused(&mut self) {
        let mut unused: Vec<(String, Span)> = Vec::new();
        for (name, symbol) in self.symbols.iter() {
            if !symbol.used {
                unused.push((name.clone(), symbol.decl_span));
            }
        }
        unused.sort_by_key(|(_, span)| (span.start().line(), span.start().column()));
        for (name, span) in unused {
            self.error(
                span,
                ErrorCode::UnusedSymbol,
                format!("'{name}' is declared but never used"),
            );
        }
    }
}

fn binary_operator(kind: &TokenKind) -> Option<(u8, BinaryOp, bool)> {
    use BinaryOp::*;
    Some(match kind {
        TokenKind::Bar => (1, Or, false),
        TokenKind::Amp => (2, And, false),
        TokenKind::Less => (3, Lt, false),
        TokenKind::Greater => (3, Gt, false),
        TokenKind::LessEqual => (3, Le, false),
        TokenKind::GreaterEqual => (3, Ge, false),
        TokenKind::EqualEqual => (3, Eq, false),
        TokenKind::BangEqual => (3, Ne, false),
        TokenKind::Plus => (4, Add, false),
        TokenKind::Minus => (4, Sub, false),
        TokenKind::Star => (5, Mul, false),
        TokenKind::Slash => (5, Div, false),
        TokenKind::Caret => (6, Pow, true),
        _ => return None,
    })
}

fn function_op(name: &str) -> Option<UnaryOp> {
    use UnaryOp::*;
    Some(match name {
        "sin" => Sin,
        "cos" => Cos,
        "tan" => Tan,
        "asin" => Asin,
        "acos" => Acos,
        "atan" => Atan,
        "sinh" => Sinh,
        "cosh" => Cosh,
        "tanh" => Tanh,
        "exp" => Exp,
        "log" => Log,
        "lg" => Lg,
        "sqrt" => Sqrt,
        "abs" => Abs,
        "sgn" => Sgn,
        "erf" => Erf,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::{ParseOutput, Parser};
    use crate::mdl::error_codes::ErrorCode;
    use crate::mdl::expr::Node;
    use crate::mdl::symbols::SymbolKind;
    use crate::mdl::test::model_source;
    use crate::mdl::HasSpan;

    fn parse(declarations: &str, equations: &str) -> ParseOutput {
        let text = model_source(declarations, equations);
        Parser::from_text(text, "test.mdl".into()).parse()
    }

    fn codes(output: &ParseOutput) -> Vec<ErrorCode> {
        output.diagnostics.iter().map(|diag| diag.code()).collect()
    }

    #[test]
    fn parses_a_minimal_model() {
        let output = parse(
            "var x = { 1e-6, -1, 1 } V\n\
             par a = { 2, 0, 10, 0, 10 }\n\
             par b = { 3, -10, 10, -10, 10 }\n\
             res r",
            "r = a*x + b;",
        );
        assert_eq!(codes(&output), vec![]);
        assert_eq!(output.header.model, "test");
        assert_eq!(output.tables.var.len(), 1);
        assert_eq!(output.tables.var[0].unit, "V");
        assert_eq!(output.tables.var[0].abstol, 1e-6);
        assert_eq!(output.tables.par.len(), 2);
        assert_eq!(output.tables.res, vec!["r".to_string()]);
        assert!(output.res_defs[0].is_some());
    }

    #[test]
    fn declaration_values_accept_infinities() {
        let output = parse(
            "var x = { 1u, -inf, Inf }\n\
             par a = { 1, -Inf, inf, -inf, +inf }\n\
             res r",
            "r = a*x;",
        );
        assert_eq!(codes(&output), vec![]);
        assert_eq!(output.tables.var[0].lower_limit, f64::NEG_INFINITY);
        assert_eq!(output.tables.var[0].upper_limit, f64::INFINITY);
        assert_eq!(output.tables.par[0].lower_bound, f64::NEG_INFINITY);
    }

    #[test]
    fn redeclaration_points_at_the_second_occurrence() {
        let text = model_source(
            "var x = { 1u, -1, 1 }\n\
             par x = { 2, 0, 10, 0, 10 }\n\
             res r",
            "r = x;",
        );
        let code = crate::mdl::test::Code::new(text.clone());
        let output = Parser::from_text(text, "test.mdl".into()).parse();
        let errors: Vec<_> = output
            .diagnostics
            .iter()
            .filter(|diag| diag.code() == ErrorCode::Redeclared)
            .collect();
        assert_eq!(errors.len(), 1);
        // the error points at the second occurrence, on the `par` line
        assert_eq!(
            errors[0].span().start().line(),
            code.s1("par x").start().line()
        );
        // the first declaration wins
        assert_eq!(
            output.symbols.find("x").unwrap().kind,
            SymbolKind::Var
        );
    }

    #[test]
    fn wrong_value_count_is_malformed() {
        let output = parse("par a = { 1, 2 }\nres r", "r = a;");
        assert!(codes(&output).contains(&ErrorCode::MalformedDeclaration));
    }

    #[test]
    fn residual_assigned_twice() {
        let output = parse(
            "par a = { 2, 0, 10, 0, 10 }\nres r",
            "r = a;\nr = a + 1;",
        );
        assert!(codes(&output).contains(&ErrorCode::MultipleAssignment));
    }

    #[test]
    fn residual_never_assigned() {
        let output = parse("par a = { 2, 0, 10, 0, 10 }\nres r", "tmp = a;");
        assert!(codes(&output).contains(&ErrorCode::NotAssigned));
    }

    #[test]
    fn assignment_to_inputs_is_a_type_error() {
        let output = parse(
            "var x = { 1u, -1, 1 }\npar a = { 2, 0, 10, 0, 10 }\nres r",
            "x = a;\nr = a*x;",
        );
        assert!(codes(&output).contains(&ErrorCode::InvalidAssignTarget));
    }

    #[test]
    fn undeclared_names_are_reported() {
        let output = parse("res r", "r = nope;");
        assert!(codes(&output).contains(&ErrorCode::Undeclared));
    }

    #[test]
    fn flags_cannot_be_used_as_numbers() {
        let output = parse("flg mode = { 1 }\nres r", "r = mode + 1;");
        assert!(codes(&output).contains(&ErrorCode::FlagAsReal));
    }

    #[test]
    fn conditions_must_be_boolean() {
        let output = parse(
            "var x = { 1u, -1, 1 }\nres r",
            "if (x) r = x; else r = x + 1; fi",
        );
        assert!(codes(&output).contains(&ErrorCode::RealAsCondition));
    }

    #[test]
    fn conditional_assignments_merge() {
        let output = parse(
            "var x = { 1u, -1, 1 }\n\
             par p = { 0.5, 0, 1, 0, 1 }\n\
             flg mode = { 1 }\n\
             res r",
            "if (mode) r = x - p; else r = x + p; fi",
        );
        assert_eq!(codes(&output), vec![]);
        let def = output.res_defs[0].expect("merged definition");
        assert!(matches!(output.pool.node(def), Node::Cond { .. }));
    }

    #[test]
    fn one_sided_first_assignment_is_rejected() {
        let output = parse(
            "var x = { 1u, -1, 1 }\nflg mode = { 1 }\nres r",
            "if (mode) r = x; fi",
        );
        assert!(codes(&output).contains(&ErrorCode::NotAssignedOnAllPaths));
    }

    #[test]
    fn reassignment_inside_a_conditional_is_caught() {
        let output = parse(
            "var x = { 1u, -1, 1 }\nflg mode = { 1 }\nres r",
            "r = x;\nif (mode) r = x + 1; else r = x + 2; fi",
        );
        assert!(codes(&output).contains(&ErrorCode::MultipleAssignment));
    }

    #[test]
    fn temporaries_are_introduced_on_first_assignment() {
        let output = parse(
            "var x = { 1u, -1, 1 }\nres r",
            "t = x * x;\nr = t + 1;",
        );
        assert_eq!(codes(&output), vec![]);
        assert_eq!(output.symbols.find("t").unwrap().kind, SymbolKind::Tmp);
    }

    #[test]
    fn temporary_use_before_assignment() {
        let output = parse("var x = { 1u, -1, 1 }\nres r", "r = t + x;\nt = x;");
        assert!(codes(&output).contains(&ErrorCode::Undeclared));
    }

    #[test]
    fn auxiliaries_may_be_used_before_their_assignment() {
        let output = parse(
            "var x = { 1u, -1, 1 }\naux y = { 1u, -1, 1 }\nres r",
            "r = y + x;\ny = x * x;",
        );
        assert_eq!(codes(&output), vec![]);
        assert!(output.aux_defs[0].is_some());
    }

    #[test]
    fn recursive_auxiliaries_are_rejected() {
        let output = parse(
            "var x = { 1u, -1, 1 }\naux y = { 1u, -1, 1 }\nres r",
            "y = y + x;\nr = y;",
        );
        assert!(codes(&output).contains(&ErrorCode::RecursiveDefinition));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut equations = String::new();
        for _ in 0..17 {
            equations.push_str("if (mode) ");
        }
        equations.push_str("r = x;");
        for _ in 0..17 {
            equations.push_str(" else r = x; fi");
        }
        // the innermost fi closes first; the guard fires at depth 17
        let output = parse(
            "var x = { 1u, -1, 1 }\nflg mode = { 1 }\nres r",
            &equations,
        );
        assert!(codes(&output).contains(&ErrorCode::NestingTooDeep));
    }

    #[test]
    fn usage_bits_track_every_reference() {
        let output = parse(
            "var x = { 1u, -1, 1 }\n\
             par a = { 2, 0, 10, 0, 10 }\n\
             par unused = { 1, 0, 1, 0, 1 }\n\
             con c = { 3 }\n\
             res r",
            "r = a*x;",
        );
        assert!(output.symbols.find("x").unwrap().used);
        assert!(output.symbols.find("a").unwrap().used);
        assert!(!output.symbols.find("unused").unwrap().used);
        assert!(!output.symbols.find("c").unwrap().used);
        let unused_warnings: Vec<_> = output
            .diagnostics
            .iter()
            .filter(|diag| diag.code() == ErrorCode::UnusedSymbol)
            .collect();
        assert_eq!(unused_warnings.len(), 2);
    }

    #[test]
    fn missing_header_line_is_reported() {
        let output = Parser::from_text(
            "model test\ndeclarations\nres r\nequations\nr = 1;\nend\n",
            "test.mdl".into(),
        )
        .parse();
        assert!(codes(&output).contains(&ErrorCode::MissingHeader));
    }

    #[test]
    fn recovery_collects_multiple_errors() {
        let output = parse(
            "var x = { 1u, -1, 1 }\nres r",
            "r = nope1;\nr2 = ;\nr = x;",
        );
        let error_count = output
            .diagnostics
            .iter()
            .filter(|diag| diag.code() != ErrorCode::UnusedSymbol)
            .count();
        assert!(error_count >= 2, "found {:?}", codes(&output));
    }

    #[test]
    fn power_is_right_associative() {
        let output = parse(
            "var x = { 1u, -1, 1 }\nres r",
            "r = x^2^3;",
        );
        assert_eq!(codes(&output), vec![]);
        // x^(2^3) folds the constant part to 8
        let def = output.res_defs[0].unwrap();
        match output.pool.node(def) {
            Node::Binary(crate::mdl::expr::BinaryOp::Pow, _, exponent) => {
                assert_eq!(output.pool.as_const(exponent), Some(8.0));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }
}
