use crate::mdl::data::{HasSpan, Position, Span};
use crate::mdl::error_codes::{ErrorCode, SeverityMap};
use codespan_reporting::diagnostic::{Diagnostic as CsDiagnostic, Label, Severity as CsSeverity};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Severity {
    Error,
    Warning,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single compiler message, anchored to a span in one source file.
#[derive(PartialEq, Debug, Clone)]
pub struct Diagnostic {
    span: Span,
    source: Arc<str>,
    code: ErrorCode,
    message: String,
}

impl Diagnostic {
    pub fn new(
        span: Span,
        source: Arc<str>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Diagnostic {
        Diagnostic {
            span,
            source,
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Arc<str> {
        self.source.clone()
    }

    /// One-based line of the diagnostic's start.
    pub fn line(&self) -> u32 {
        self.span.start().line() + 1
    }

    /// One-based column of the diagnostic's start.
    pub fn column(&self) -> u32 {
        self.span.start().column() + 1
    }

    pub fn severity(&self, severities: &SeverityMap) -> Severity {
        severities[self.code]
    }

    /// Convert into a `codespan-reporting` diagnostic for terminal rendering.
    /// `text` must be the source the spans were produced from.
    pub fn into_codespan_diagnostic(
        self,
        file_id: usize,
        text: &str,
        severities: &SeverityMap,
    ) -> CsDiagnostic<usize> {
        let severity = match severities[self.code] {
            Severity::Error => CsSeverity::Error,
            Severity::Warning => CsSeverity::Warning,
        };
        let start = byte_offset(text, self.span.start()).min(text.len());
        let end = byte_offset(text, self.span.end()).clamp(start, text.len());
        CsDiagnostic::new(severity)
            .with_code(self.code.as_ref())
            .with_message(self.message)
            .with_labels(vec![Label::primary(file_id, start..end)])
    }
}

fn byte_offset(text: &str, pos: Position) -> usize {
    let mut offset = 0;
    for (line_no, line) in text.split('\n').enumerate() {
        if line_no as u32 == pos.line() {
            return offset + (pos.column() as usize).min(line.len());
        }
        offset += line.len() + 1;
    }
    text.len()
}

impl HasSpan for Diagnostic {
    fn span(&self) -> Span {
        self.span
    }
}
