use crate::mdl::diagnostics::Severity;
use enum_map::{enum_map, Enum, EnumMap};
use std::fmt::{Display, Formatter};
use std::ops::Index;
use strum::{AsRefStr, EnumString};

#[derive(PartialEq, Eq, Debug, Copy, Clone, EnumString, AsRefStr, Enum)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    BadNumber,
    UnknownConstant,
    OversizedToken,
    OversizedLine,
    UnexpectedToken,
    MissingPunctuation,
    MalformedDeclaration,
    MissingHeader,
    Redeclared,
    Undeclared,
    ReservedPrefix,
    InvalidAssignTarget,
    FlagAsReal,
    RealAsCondition,
    NotAssigned,
    NotAssignedOnAllPaths,
    MultipleAssignment,
    RecursiveDefinition,
    NestingTooDeep,
    TooManyStatements,
    TooManyErrors,
    OutOfMemory,
    IoError,
    UnusedSymbol,
}

/// Coarse classification of an error code, as reported to the user.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum ErrorClass {
    Lex,
    Syntax,
    Name,
    Type,
    Semantic,
    Fatal,
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Lex => write!(f, "lex error"),
            ErrorClass::Syntax => write!(f, "syntax error"),
            ErrorClass::Name => write!(f, "name error"),
            ErrorClass::Type => write!(f, "type error"),
            ErrorClass::Semantic => write!(f, "semantic error"),
            ErrorClass::Fatal => write!(f, "fatal error"),
        }
    }
}

impl ErrorCode {
    pub fn class(&self) -> ErrorClass {
        use ErrorCode::*;
        match self {
            BadNumber | UnknownConstant | OversizedToken | OversizedLine => ErrorClass::Lex,
            UnexpectedToken | MissingPunctuation | MalformedDeclaration | MissingHeader => {
                ErrorClass::Syntax
            }
            Redeclared | Undeclared | ReservedPrefix => ErrorClass::Name,
            InvalidAssignTarget | FlagAsReal | RealAsCondition => ErrorClass::Type,
            NotAssigned | NotAssignedOnAllPaths | MultipleAssignment | RecursiveDefinition
            | NestingTooDeep | TooManyStatements | UnusedSymbol => ErrorClass::Semantic,
            TooManyErrors | OutOfMemory | IoError => ErrorClass::Fatal,
        }
    }
}

/// The `SeverityMap` maps error codes to severities.
///
/// Implementation for `Index` is provided, so elements within the map can
/// be accessed using the `[]` operator.
#[derive(Clone, PartialEq, Eq, Debug, Copy)]
pub struct SeverityMap {
    // An `EnumMap` ensures that each error code is mapped to exactly one severity.
    inner: EnumMap<ErrorCode, Severity>,
}

impl Default for SeverityMap {
    fn default() -> Self {
        use ErrorCode::*;
        let map = enum_map! {
            BadNumber
            | UnknownConstant
            | OversizedToken
            | OversizedLine
            | UnexpectedToken
            | MissingPunctuation
            | MalformedDeclaration
            | MissingHeader
            | Redeclared
            | Undeclared
            | ReservedPrefix
            | InvalidAssignTarget
            | FlagAsReal
            | RealAsCondition
            | NotAssigned
            | NotAssignedOnAllPaths
            | MultipleAssignment
            | RecursiveDefinition
            | NestingTooDeep
            | TooManyStatements
            | TooManyErrors
            | OutOfMemory
            | IoError => Severity::Error,
            UnusedSymbol => Severity::Warning
        };
        SeverityMap { inner: map }
    }
}

impl Index<ErrorCode> for SeverityMap {
    type Output = Severity;

    fn index(&self, key: ErrorCode) -> &Self::Output {
        self.inner.index(key)
    }
}
