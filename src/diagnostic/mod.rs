pub mod ansi;
pub mod json;

use crate::assembler::AsmError;
use crate::scanner::Span;
use crate::vm::RuntimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Place a byte offset in source text: 1-based line and column, plus the
/// full text of the line the offset falls on (without its line break).
pub(crate) fn locate(source: &str, offset: usize) -> (u32, u32, &str) {
    let at = offset.min(source.len());
    let head = &source[..at];
    let line = head.bytes().filter(|&b| b == b'\n').count() as u32 + 1;
    let start = head.rfind('\n').map_or(0, |i| i + 1);
    let end = source[at..].find('\n').map_or(source.len(), |i| at + i);
    let text = source[start..end].trim_end_matches('\r');
    (line, (at - start) as u32 + 1, text)
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

/// A structured error record from any phase: scan, assembly, load, or run.
/// Rendering is left to the `ansi` and `json` modules.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(message)
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label {
            span,
            message: label.into(),
            is_primary: true,
        });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl From<&AsmError> for Diagnostic {
    fn from(e: &AsmError) -> Self {
        let code = match e {
            AsmError::Scan { .. } => "TPV-L001",
            AsmError::OperandType { .. } => "TPV-A001",
            AsmError::UnexpectedToken { .. } => "TPV-A002",
            AsmError::UnexpectedEof { .. } => "TPV-A003",
            AsmError::UndefinedLabel { .. } => "TPV-A004",
            AsmError::Truncated { .. } => "TPV-A005",
            AsmError::UnknownByte { .. } => "TPV-A006",
        };
        let mut d = Diagnostic::error(e.to_string()).with_code(code);
        if let Some(span) = e.span() {
            d = d.with_span(span, "here");
        }
        if let AsmError::UndefinedLabel { name, .. } = e {
            d = d.with_suggestion(format!(
                "define `{name}:` somewhere in the program or jump to a byte offset"
            ));
        }
        d
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        let code = match e {
            RuntimeError::BinaryType { .. } | RuntimeError::UnaryType { .. } => "TPV-R001",
            RuntimeError::DivisionByZero => "TPV-R002",
            RuntimeError::MissingString { .. } => "TPV-R003",
            RuntimeError::MissingTableEntry { .. } => "TPV-R004",
            RuntimeError::BadTableSelector(_) => "TPV-R005",
            RuntimeError::ArrayBounds { .. } => "TPV-R006",
            RuntimeError::MissingFunction { .. } => "TPV-R007",
            RuntimeError::MissingArgument { .. } => "TPV-R008",
            RuntimeError::BadCallSelector(_) => "TPV-R009",
            RuntimeError::StackUnderflow => "TPV-R010",
            RuntimeError::InvalidIntInput | RuntimeError::InvalidFloatInput => "TPV-R011",
            RuntimeError::InputFailed => "TPV-R012",
            RuntimeError::BadHostCall(_) => "TPV-R013",
            RuntimeError::FrameOverflow => "TPV-R014",
            RuntimeError::TruncatedStream => "TPV-R015",
            RuntimeError::IllegalInstruction => "TPV-R016",
            RuntimeError::UnknownOpcode(_) => "TPV-R017",
            RuntimeError::BadJumpTarget(_) => "TPV-R018",
            RuntimeError::StrayFunctionMarker => "TPV-R019",
            RuntimeError::NestedFunction => "TPV-R020",
            RuntimeError::UnterminatedFunction => "TPV-R021",
        };
        let mut d = Diagnostic::error(e.to_string()).with_code(code);
        if e.is_fatal() {
            d = d.with_note("execution stopped");
        }
        d
    }
}
