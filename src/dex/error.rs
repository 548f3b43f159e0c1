use std::fmt;
use thiserror::Error;

macro_rules! err {
    ($base:ident, $msg:literal) => {
        DexError::with_context($base, $msg.to_string())
    };
    ($base:ident, $fmtstr:literal, $($args:tt)*) => {
        DexError::with_context($base, format!($fmtstr, $($args)*))
    };
    ($msg:literal) => {
        DexError::new($msg)
    };
    ($fmtstr:literal, $($args:tt)*) => {
        DexError::new(&format!($fmtstr, $($args)*))
    };
}

#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::dex::error::DexError::new($msg))
    };
    (($msg:literal), ($context:literal)) => {
        return Err($crate::dex::error::DexError::with_context($crate::dex::error::DexError::new($msg), $context.to_string()))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::dex::error::DexError::new(&format!($fmtstr, $($args)*)))
    };
    (($fmtstr:literal, $($args:tt)*), ($contextfmt:literal, $($contextargs:tt)*)) => {
        return Err($crate::dex::error::DexError::with_context(
            $crate::dex::error::DexError::new(&format!($fmtstr, $($args)*)),
            format!($contextfmt, $($contextargs)*),
        ))
    };
}

/// Returns a structural violation from the enclosing function.
#[macro_export]
macro_rules! violation {
    ($fmtstr:literal $(, $args:expr)* $(,)?) => {
        return Err($crate::dex::error::DexError::structural(format!($fmtstr $(, $args)*)))
    };
}

/// The failure classes surfaced by the core. None of them is recovered from
/// internally; callers decide whether to abort.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Malformed DEX input.
    #[error("{0}")]
    Format(String),

    /// A Method-IR invariant does not hold.
    #[error("structural violation: {message}{}", in_method(.method))]
    StructuralViolation {
        method: Option<String>,
        message: String,
    },

    #[error("duplicate method {0}")]
    DuplicateMethod(String),

    #[error("duplicate field {0}")]
    DuplicateField(String),

    #[error("duplicate class definition for {0}")]
    DuplicateClass(String),

    #[error("unable to resolve {0}")]
    ResolutionFailure(String),

    /// Errors captured from parallel workers, raised after the join.
    #[error("{} worker task(s) failed: {}", .0.len(), join_errors(.0))]
    AggregateWorker(Vec<DexError>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn in_method(method: &Option<String>) -> String {
    match method {
        Some(m) => format!(" in {}", m),
        None => String::new(),
    }
}

fn join_errors(errors: &[DexError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug)]
pub struct DexError {
    kind: ErrorKind,
    contexts: Vec<String>,
}

impl DexError {
    pub(crate) fn new(msg: &str) -> Self {
        Self::from_kind(ErrorKind::Format(msg.to_string()))
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        DexError { kind, contexts: Vec::new() }
    }

    pub(crate) fn structural(message: String) -> Self {
        Self::from_kind(ErrorKind::StructuralViolation { method: None, message })
    }

    pub(crate) fn with_context(base: DexError, context: String) -> Self {
        let mut contexts = base.contexts;
        contexts.push(context);
        DexError { kind: base.kind, contexts }
    }

    /// Attaches the method being processed to a structural violation. Other
    /// kinds get the method as an ordinary context frame.
    pub fn in_method(self, name: &str) -> Self {
        match self.kind {
            ErrorKind::StructuralViolation { method: None, message } => DexError {
                kind: ErrorKind::StructuralViolation { method: Some(name.to_string()), message },
                contexts: self.contexts,
            },
            _ => DexError::with_context(self, name.to_string()),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    /// Folds worker results into one aggregate error, or `Ok` if all passed.
    pub fn aggregate(errors: Vec<DexError>) -> Result<(), DexError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::from_kind(ErrorKind::AggregateWorker(errors)))
        }
    }
}

impl fmt::Display for DexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        let mut connector = " for ";
        for context in &self.contexts {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DexError {
    fn from(e: std::io::Error) -> Self {
        DexError::from_kind(ErrorKind::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truncated() -> Result<(), DexError> {
        fail!("Unexpected end of stream reading u4 at index {}", 12);
    }

    #[test]
    fn contexts_render_innermost_first() {
        let e = truncated().unwrap_err();
        let e = err!(e, "code item at 0x{:x}", 0x70);
        let e = err!(e, "Lfoo/Bar;.baz:()V");
        assert_eq!(
            e.to_string(),
            "Unexpected end of stream reading u4 at index 12 for code item at 0x70 of Lfoo/Bar;.baz:()V"
        );
    }

    #[test]
    fn structural_violation_names_method() {
        let e = DexError::structural("unopened try end".to_string()).in_method("LA;.m:()V");
        assert!(matches!(e.kind(), ErrorKind::StructuralViolation { method: Some(_), .. }));
        assert_eq!(e.to_string(), "structural violation: unopened try end in LA;.m:()V");
    }

    #[test]
    fn aggregate_collects_every_worker_error() {
        assert!(DexError::aggregate(vec![]).is_ok());
        let agg = DexError::aggregate(vec![DexError::new("a"), DexError::new("b")]).unwrap_err();
        match agg.kind() {
            ErrorKind::AggregateWorker(errs) => assert_eq!(errs.len(), 2),
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(agg.to_string().starts_with("2 worker task(s) failed"));
    }
}
