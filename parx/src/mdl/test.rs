use crate::mdl::data::{Position, Span};

/// A complete model file around the given declaration and equation bodies,
/// with a fixed header. Test sources count their lines from the body start:
/// the header and section keywords occupy lines 0 through 5.
pub fn model_source(declarations: &str, equations: &str) -> String {
    format!(
        "model test\n\
         author tester\n\
         date 2026-08-01\n\
         version 1.0\n\
         ident test model\n\
         declarations\n\
         {declarations}\n\
         equations\n\
         {equations}\n\
         end\n"
    )
}

/// Source text with span lookup by substring, for diagnostics assertions.
pub struct Code {
    source: String,
}

impl Code {
    pub fn new(source: impl Into<String>) -> Code {
        Code {
            source: source.into(),
        }
    }

    /// The span of the first occurrence of `substr`.
    pub fn s1(&self, substr: &str) -> Span {
        for (line_no, line) in self.source.lines().enumerate() {
            if let Some(column) = line.find(substr) {
                let start = Position::new(line_no as u32, column as u32);
                let end = Position::new(line_no as u32, (column + substr.len()) as u32);
                return start.to(end);
            }
        }
        panic!("substring {substr:?} not found");
    }
}

#[cfg(test)]
mod tests {
    use super::Code;
    use crate::mdl::data::Position;
    use crate::mdl::HasSpan;

    #[test]
    fn substring_spans() {
        let code = Code::new("first\nsecond line\n");
        let span = code.s1("second");
        assert_eq!(span.start(), Position::new(1, 0));
        assert_eq!(span.end(), Position::new(1, 6));
    }
}
