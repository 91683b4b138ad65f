//! Error types and the compile-time diagnostic log.
//!
//! Compile-time problems never abort compilation: they are appended to the
//! [`DiagnosticLog`] and the offending expression evaluates to the poison
//! value, which downstream code recognizes and stays quiet about. Runtime
//! faults terminate the current execution and surface as [`RuntimeError`].

use crate::span::SrcSpan;

/// The kinds of diagnostics the compiler emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // name resolution
    TypeNotFound,
    PropertyNotFound,
    ExportNotFound,
    MethodNotFound,

    // overload ambiguity
    AmbiguousMethod,
    AmbiguousConstructor,
    AmbiguousCast,
    AmbiguousExport,

    // type violations
    NotConvertible,
    NotAssignable,
    TypeUsedAsValue,
    ModuleUsedAsValue,
    ModuleDataUsedAsValue,
    NotWritable,
    NoReadAccess,
    NoWriteAccess,
    StaticPropertyOnInstance,
    InstancePropertyOnType,
    StaticMethodOnInstance,
    InstanceMethodOnType,

    // access control
    IsPrivate,
    NotTrusted,

    // structural
    DuplicateType,
    InvalidOperand,

    // informational follow-ups ("could be ...")
    CouldBe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    pub span: SrcSpan,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        if self.span.is_synthetic() {
            write!(f, "{}: {}", sev, self.message)
        } else {
            write!(f, "{}: {} ({})", sev, self.message, self.span)
        }
    }
}

/// Accumulates diagnostics for a compilation.
///
/// A bad expression logs an error here and yields poison; compilation keeps
/// going so one mistake does not bury the rest of the program in noise.
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    entries: Vec<Diagnostic>,
    error_count: usize,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        DiagnosticLog::default()
    }

    pub fn error(&mut self, kind: ErrorKind, span: SrcSpan, message: impl Into<String>) {
        self.error_count += 1;
        self.entries.push(Diagnostic {
            severity: Severity::Error,
            kind,
            message: message.into(),
            span,
        });
    }

    pub fn warn(&mut self, kind: ErrorKind, span: SrcSpan, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            kind,
            message: message.into(),
            span,
        });
    }

    pub fn info(&mut self, kind: ErrorKind, span: SrcSpan, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity: Severity::Info,
            kind,
            message: message.into(),
            span,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.error_count = 0;
    }
}

/// Failures while mutating the type or function registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A type with the same fully qualified name exists and is not
    /// structurally equivalent to the one being registered.
    DuplicateType { fqn: String },
    /// A referenced type id is not registered.
    UnknownType(u64),
    /// A referenced function id is not registered.
    UnknownFunction(u32),
    /// The descriptor is not of the expected kind (e.g. a signature type
    /// was required and a plain type was given).
    KindMismatch { fqn: String, expected: &'static str },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateType { fqn } => {
                write!(f, "type '{}' is already registered with a different structure", fqn)
            }
            RegistryError::UnknownType(id) => write!(f, "unknown type id {:#x}", id),
            RegistryError::UnknownFunction(id) => write!(f, "unknown function id {}", id),
            RegistryError::KindMismatch { fqn, expected } => {
                write!(f, "type '{}' is not a {}", fqn, expected)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Faults raised while executing script code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A stack allocation, load or store touched the guard region.
    StackOverflow,
    /// Malformed or unsupported instruction encoding.
    InvalidOpcode(String),
    /// An indirect call went through a null or dangling closure.
    NullCallback,
    /// An instruction referenced a module that is not loaded.
    InvalidModule(u32),
    /// Integer division or remainder by zero.
    DivideByZero,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::InvalidOpcode(what) => write!(f, "invalid instruction: {}", what),
            RuntimeError::NullCallback => write!(f, "null callback invoked"),
            RuntimeError::InvalidModule(id) => write!(f, "invalid module id {}", id),
            RuntimeError::DivideByZero => write!(f, "integer division by zero"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Failures while writing or reading a compiled module image.
#[derive(Debug)]
pub enum ModuleIoError {
    Io(std::io::Error),
    Encoding(String),
    /// The image references an id that resolves to nothing after both
    /// resolve passes ran.
    Unresolved(String),
}

impl std::fmt::Display for ModuleIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleIoError::Io(e) => write!(f, "module io error: {}", e),
            ModuleIoError::Encoding(e) => write!(f, "module encoding error: {}", e),
            ModuleIoError::Unresolved(what) => write!(f, "unresolved module reference: {}", what),
        }
    }
}

impl std::error::Error for ModuleIoError {}

impl From<std::io::Error> for ModuleIoError {
    fn from(e: std::io::Error) -> Self {
        ModuleIoError::Io(e)
    }
}

impl From<Box<bincode::ErrorKind>> for ModuleIoError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ModuleIoError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_counts_errors_only() {
        let mut log = DiagnosticLog::new();
        log.warn(ErrorKind::NotConvertible, SrcSpan::synthetic(), "w");
        assert!(!log.has_errors());
        log.error(ErrorKind::MethodNotFound, SrcSpan::synthetic(), "e");
        log.info(ErrorKind::CouldBe, SrcSpan::synthetic(), "i");
        assert_eq!(log.error_count(), 1);
        assert_eq!(log.entries().len(), 3);
    }
}
