use std::fmt::{Debug, Display, Formatter};

/// A source position, given as zero-based line and zero-based byte column.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Position {
    line: u32,
    column: u32,
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

impl Debug for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Position {
    pub fn new(line: u32, column: u32) -> Position {
        Position { line, column }
    }

    pub fn zero() -> Position {
        Position::new(0, 0)
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn to(&self, other: Position) -> Span {
        debug_assert!(other >= *self, "position {other} precedes {self}");
        Span::new(*self, other)
    }

    pub fn offset_by(&self, count: i32) -> Position {
        Position::new(
            self.line,
            self.column
                .checked_add_signed(count)
                .expect("column offset out of range"),
        )
    }

    /// The zero-length span formed by this position.
    pub fn as_span(&self) -> Span {
        Span::new(*self, *self)
    }

    /// The span covering the single byte at this position.
    pub fn as_char_span(&self) -> Span {
        Span::new(*self, self.offset_by(1))
    }
}

/// A half-open region of source text; the start is inclusive, the end is not.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Span {
    start: Position,
    end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Span {
        Span { start, end }
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }
}

pub trait HasSpan {
    fn span(&self) -> Span;

    fn start(&self) -> Position {
        self.span().start()
    }

    fn end(&self) -> Position {
        self.span().end()
    }
}

impl HasSpan for Span {
    fn span(&self) -> Span {
        *self
    }
}
