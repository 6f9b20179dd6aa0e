//! Compiler and interpreter for implicit device and circuit models.
//!
//! A model file declares variables, auxiliaries, parameters, constants,
//! flags and residuals, followed by the residual equations of an implicit
//! model f(x, a, p, c, flg) = 0. Compilation parses the file, symbolically
//! differentiates every residual with respect to the variables, auxiliaries
//! and parameters, and linearizes everything into a compact stack-machine
//! program. The interpreter then evaluates residuals and Jacobians from
//! live input vectors without allocating.
mod avl;
mod code;
mod codegen;
mod compiler;
mod data;
mod deriv;
mod diagnostics;
mod error_codes;
mod expr;
mod interp;
mod lex;
mod parser;
mod reader;
mod symbols;
#[cfg(test)]
mod test;

pub use avl::{AvlTree, InsertOutcome};
pub use code::{
    AuxDecl, Code, ConDecl, FlgDecl, ModelCode, Opr, ParDecl, Tables, Typ, VarDecl, CODE_VERSION,
    FILE_ID,
};
pub use compiler::ModelCompiler;
pub use data::{HasSpan, Position, Span};
pub use diagnostics::{Diagnostic, Severity};
pub use error_codes::{ErrorClass, ErrorCode, SeverityMap};
pub use expr::{BinaryOp, ExprPool, Node, NodeId, NumId, SymRef, UnaryOp, MAX_POOL_INDEX};
pub use interp::{EvalError, Evaluator};
pub use lex::number::format_eng;
pub use lex::{MAX_LINE, MAX_LOGICAL_LINE, MAX_UNIT};
pub use symbols::{Symbol, SymbolKind, SymbolTable};
