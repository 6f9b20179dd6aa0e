use crate::mdl::code::ModelCode;
use crate::mdl::codegen;
use crate::mdl::data::Position;
use crate::mdl::diagnostics::{Diagnostic, Severity};
use crate::mdl::error_codes::{ErrorCode, SeverityMap};
use crate::mdl::expr::MAX_POOL_INDEX;
use crate::mdl::lex::{NAME_SEPARATOR_TOKEN, NOT_AT_NAME_START_TOKENS, RESERVED_NAME_TOKENS};
use crate::mdl::parser::Parser;
use std::path::Path;
use std::sync::Arc;

/// One compilation of a model file. Drives the parser, differentiator and
/// code generator, and keeps the diagnostics and symbol queries around
/// whether or not compilation succeeded.
pub struct ModelCompiler {
    source_name: Arc<str>,
    source_text: String,
    diagnostics: Vec<Diagnostic>,
    code: Option<ModelCode>,
    not_assigned: Vec<String>,
    not_used: Vec<String>,
}

impl ModelCompiler {
    /// Compile a model file. An unreadable file is reported like any other
    /// failure, as a diagnostic, so the caller sees one error surface.
    pub fn from_path(path: impl AsRef<Path>) -> ModelCompiler {
        let name: Arc<str> = path.as_ref().to_string_lossy().into_owned().into();
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => ModelCompiler::from_source(text, name),
            Err(err) => ModelCompiler {
                source_name: name.clone(),
                source_text: String::new(),
                diagnostics: vec![Diagnostic::new(
                    Position::zero().as_span(),
                    name,
                    ErrorCode::IoError,
                    format!("cannot read model file: {err}"),
                )],
                code: None,
                not_assigned: Vec::new(),
                not_used: Vec::new(),
            },
        }
    }

    pub fn from_source(text: impl Into<String>, source_name: Arc<str>) -> ModelCompiler {
        let source_text = text.into();
        let output = Parser::from_text(source_text.clone(), source_name.clone()).parse();
        let severities = SeverityMap::default();
        let mut diagnostics = output.diagnostics;
        let has_errors = diagnostics
            .iter()
            .any(|diagnostic| diagnostic.severity(&severities) == Severity::Error);

        let mut not_assigned = Vec::new();
        for name in &output.tables.res {
            if !output.symbols.find(name).is_some_and(|sym| sym.assigned) {
                not_assigned.push(name.clone());
            }
        }
        for decl in &output.tables.aux {
            if !output.symbols.find(&decl.name).is_some_and(|sym| sym.assigned) {
                not_assigned.push(decl.name.clone());
            }
        }

        let mut not_used = Vec::new();
        let declared = itertools::chain!(
            output.tables.var.iter().map(|decl| &decl.name),
            output.tables.aux.iter().map(|decl| &decl.name),
            output.tables.par.iter().map(|decl| &decl.name),
            output.tables.con.iter().map(|decl| &decl.name),
            output.tables.flg.iter().map(|decl| &decl.name),
            output.tables.res.iter(),
        );
        for name in declared {
            if !output.symbols.find(name).is_some_and(|sym| sym.used) {
                not_used.push(name.clone());
            }
        }

        let code = if has_errors {
            None
        } else {
            let mut pool = output.pool;
            let res_defs: Vec<_> = output
                .res_defs
                .iter()
                .map(|def| def.expect("unassigned residuals are compile errors"))
                .collect();
            let (code_words, number_of_temp) =
                codegen::generate(&mut pool, &output.tables, &res_defs, &output.aux_defs);
            if pool.overflowed() || code_words.len() >= MAX_POOL_INDEX {
                diagnostics.push(Diagnostic::new(
                    Position::zero().as_span(),
                    source_name.clone(),
                    ErrorCode::OutOfMemory,
                    "the model is too large for the interpreter code format",
                ));
                None
            } else {
                Some(ModelCode {
                    model: output.header.model,
                    author: output.header.author,
                    date: output.header.date,
                    version: output.header.version,
                    ident: output.header.ident,
                    tables: output.tables,
                    code: code_words,
                    numbers: pool.numbers().to_vec(),
                    number_of_temp,
                })
            }
        };

        ModelCompiler {
            source_name,
            source_text,
            diagnostics,
            code,
            not_assigned,
            not_used,
        }
    }

    /// The compiled artifact; `None` when any diagnostic is an error.
    pub fn model_code(&self) -> Option<&ModelCode> {
        self.code.as_ref()
    }

    pub fn into_model_code(self) -> Result<ModelCode, Vec<Diagnostic>> {
        match self.code {
            Some(code) => Ok(code),
            None => Err(self.diagnostics),
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source(&self) -> &str {
        &self.source_text
    }

    pub fn source_name(&self) -> Arc<str> {
        self.source_name.clone()
    }

    /// Declared residuals and auxiliaries that were never assigned.
    pub fn symbols_not_assigned(&self) -> &[String] {
        &self.not_assigned
    }

    /// Declared symbols that no equation references.
    pub fn symbols_not_used(&self) -> &[String] {
        &self.not_used
    }

    /// Bytes that may not appear inside a name.
    pub fn reserved_name_tokens() -> &'static str {
        RESERVED_NAME_TOKENS
    }

    /// Bytes that may not start a name.
    pub fn not_at_name_start_tokens() -> &'static str {
        NOT_AT_NAME_START_TOKENS
    }

    /// Separator hosts use to namespace model names.
    pub fn name_separator_token() -> &'static str {
        NAME_SEPARATOR_TOKEN
    }
}
