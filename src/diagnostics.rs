//! Diagnostic reporting with source locations
//!
//! `VerifyError` is the location-free error kind returned by the contract
//! checks; `ProgramError` attaches a source span for reporting with miette.

use crate::common::Span;
use miette::{Diagnostic, NamedSource, SourceSpan};
use std::sync::Arc;
use thiserror::Error;

/// Source file for error reporting
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content: Arc<str>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Arc::from(content.into()),
        }
    }

    pub fn to_named_source(&self) -> NamedSource<String> {
        NamedSource::new(self.name.clone(), self.content.to_string())
    }
}

/// Convert our Span to miette's SourceSpan
impl From<Span> for SourceSpan {
    fn from(span: Span) -> Self {
        SourceSpan::new(span.start.into(), span.len())
    }
}

/// Violation of an operation's static contract
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("shape mismatch: {0}")]
    #[diagnostic(code(verify::shape_mismatch))]
    ShapeMismatch(String),

    #[error("rank mismatch: {what} expects {expected} indices, found {found}")]
    #[diagnostic(code(verify::rank_mismatch))]
    RankMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("type mismatch: {0}")]
    #[diagnostic(code(verify::type_mismatch))]
    TypeMismatch(String),

    #[error("async copy token {0} already belongs to a group")]
    #[diagnostic(
        code(verify::double_group_membership),
        help("each copy token may be listed in exactly one create_group")
    )]
    DoubleGroupMembership(String),

    #[error("sparse metadata must be vector<2xi16>, found {0}")]
    #[diagnostic(code(verify::metadata_shape_mismatch))]
    MetadataShapeMismatch(String),

    #[error("unsupported rounding mode `{0}`")]
    #[diagnostic(
        code(verify::unsupported_rounding_mode),
        help("only `approx` is supported")
    )]
    UnsupportedRoundingMode(String),

    #[error("mbarrier {0} is already initialized and has a phase in progress")]
    #[diagnostic(code(verify::already_initialized))]
    AlreadyInitialized(usize),

    #[error("invalid address space: {0}")]
    #[diagnostic(code(verify::invalid_address_space))]
    InvalidAddressSpace(String),

    #[error("invalid attribute: {0}")]
    #[diagnostic(code(verify::invalid_attribute))]
    InvalidAttribute(String),

    #[error("invalid operand: {0}")]
    #[diagnostic(code(verify::invalid_operand))]
    InvalidOperand(String),
}

impl VerifyError {
    /// Stable short name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::ShapeMismatch(_) => "ShapeMismatch",
            VerifyError::RankMismatch { .. } => "RankMismatch",
            VerifyError::TypeMismatch(_) => "TypeMismatch",
            VerifyError::DoubleGroupMembership(_) => "DoubleGroupMembership",
            VerifyError::MetadataShapeMismatch(_) => "MetadataShapeMismatch",
            VerifyError::UnsupportedRoundingMode(_) => "UnsupportedRoundingMode",
            VerifyError::AlreadyInitialized(_) => "AlreadyInitialized",
            VerifyError::InvalidAddressSpace(_) => "InvalidAddressSpace",
            VerifyError::InvalidAttribute(_) => "InvalidAttribute",
            VerifyError::InvalidOperand(_) => "InvalidOperand",
        }
    }
}

/// Program diagnostic
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum ProgramError {
    // === Lex Errors ===
    #[error("Invalid token")]
    #[diagnostic(code(lex::invalid_token))]
    InvalidToken {
        #[label("unrecognized input")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    // === Parse Errors ===
    #[error("Unexpected token: expected {expected}, found {found}")]
    #[diagnostic(code(parse::unexpected_token))]
    UnexpectedToken {
        expected: String,
        found: String,
        #[label("unexpected token here")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    #[error("Unexpected end of file")]
    #[diagnostic(code(parse::unexpected_eof))]
    UnexpectedEof {
        #[label("expected more tokens")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    #[error("Unknown operation `{name}`")]
    #[diagnostic(code(parse::unknown_op))]
    UnknownOperation {
        name: String,
        #[label("not a known operation")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    #[error("Malformed `{op}`: {message}")]
    #[diagnostic(code(parse::malformed_op))]
    MalformedOperation {
        op: String,
        message: String,
        #[label("{message}")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    #[error("Invalid type: {message}")]
    #[diagnostic(code(parse::invalid_type))]
    InvalidType {
        message: String,
        #[label("{message}")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    // === Resolution Errors ===
    #[error("Undefined value `%{name}`")]
    #[diagnostic(
        code(resolve::undefined_value),
        help("values must be defined before they are used")
    )]
    UndefinedValue {
        name: String,
        #[label("not defined above")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    #[error("Duplicate definition of `%{name}`")]
    #[diagnostic(code(resolve::duplicate_def))]
    DuplicateDefinition {
        name: String,
        #[label("redefined here")]
        span: SourceSpan,
        #[label("first defined here")]
        first_span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },

    // === Verification Errors ===
    #[error("`{op}` failed verification: {error}")]
    #[diagnostic(code(verify::failed))]
    Verification {
        op: String,
        error: VerifyError,
        #[label("this operation violates its contract")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
        #[help]
        help: Option<String>,
    },

    // === Runtime Errors ===
    #[error("`{op}` failed on thread {thread}: {message}")]
    #[diagnostic(code(sim::runtime))]
    Runtime {
        op: String,
        thread: usize,
        message: String,
        #[label("while executing this operation")]
        span: SourceSpan,
        #[source_code]
        src: NamedSource<String>,
    },
}

/// Error reporter that collects diagnostics
pub struct Reporter {
    source: SourceFile,
    errors: Vec<ProgramError>,
    warnings: Vec<ProgramError>,
}

impl Reporter {
    pub fn new(source: SourceFile) -> Self {
        Self {
            source,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, error: ProgramError) {
        self.errors.push(error);
    }

    pub fn warning(&mut self, warning: ProgramError) {
        self.warnings.push(warning);
    }

    /// Record a contract violation at `span`
    pub fn verify_error(&mut self, op: &str, error: VerifyError, span: Span) {
        let help = error.help().map(|h| h.to_string());
        self.errors.push(ProgramError::Verification {
            op: op.to_string(),
            error,
            span: span.into(),
            src: self.source.to_named_source(),
            help,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Create NamedSource for this file
    pub fn named_source(&self) -> NamedSource<String> {
        self.source.to_named_source()
    }

    /// Get the source file
    pub fn source(&self) -> &SourceFile {
        &self.source
    }

    /// Print all diagnostics
    pub fn emit_all(&self) {
        for warning in &self.warnings {
            eprintln!("{:?}", miette::Report::new(warning.clone()));
        }
        for error in &self.errors {
            eprintln!("{:?}", miette::Report::new(error.clone()));
        }
    }

    /// Consume and return errors
    pub fn into_errors(self) -> Vec<ProgramError> {
        self.errors
    }

    /// Get errors by reference
    pub fn errors(&self) -> &[ProgramError] {
        &self.errors
    }
}

/// Error returned when a program has one or more diagnostics
#[derive(Error, Debug, Diagnostic)]
#[error("{count} error(s) in {file}")]
#[diagnostic(code(nvgpu::errors))]
pub struct Errors {
    pub file: String,
    pub count: usize,
    #[related]
    pub errors: Vec<ProgramError>,
}

impl Errors {
    pub fn from_reporter(reporter: Reporter) -> Self {
        let file = reporter.source().name.clone();
        let errors = reporter.into_errors();
        Self {
            file,
            count: errors.len(),
            errors,
        }
    }

    /// Kinds of the verification errors, in report order
    pub fn verify_kinds(&self) -> Vec<&'static str> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                ProgramError::Verification { error, .. } => Some(error.kind()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_conversion() {
        let span: SourceSpan = Span::new(3, 9).into();
        assert_eq!(span.offset(), 3);
        assert_eq!(span.len(), 6);
    }

    #[test]
    fn test_reporter_collects_verify_errors() {
        let mut reporter = Reporter::new(SourceFile::new("t.mlir", "nvgpu.rcp %v"));
        reporter.verify_error(
            "nvgpu.rcp",
            VerifyError::UnsupportedRoundingMode("rn".into()),
            Span::new(0, 9),
        );
        assert!(reporter.has_errors());

        let errors = Errors::from_reporter(reporter);
        assert_eq!(errors.count, 1);
        assert_eq!(errors.verify_kinds(), vec!["UnsupportedRoundingMode"]);
    }
}
