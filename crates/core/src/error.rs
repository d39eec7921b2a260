//! Error taxonomy of the execution backend.
//!
//! Invariant violations and module-validation failures are fatal and abort
//! with a diagnostic; guest assertions abort via the `insist` callback;
//! typed guest exceptions, compile/instantiate failures and traps surface as
//! a failed query. The backend never retries and always disposes its
//! per-query resources.

use std::fmt;
use thiserror::Error;

/// The exception kinds a guest may raise through the `throw` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    OutOfBounds,
    DivisionByZero,
    NoMemory,
    InvalidArgument,
}

impl ExceptionKind {
    pub fn from_u64(v: u64) -> Option<ExceptionKind> {
        match v {
            0 => Some(ExceptionKind::OutOfBounds),
            1 => Some(ExceptionKind::DivisionByZero),
            2 => Some(ExceptionKind::NoMemory),
            3 => Some(ExceptionKind::InvalidArgument),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExceptionKind::OutOfBounds => "out_of_bounds",
            ExceptionKind::DivisionByZero => "division_by_zero",
            ExceptionKind::NoMemory => "no_memory",
            ExceptionKind::InvalidArgument => "invalid_argument",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed exception raised by generated code via the `throw` callback.
///
/// Carries the provenance recorded in the module's message table.
#[derive(Debug, Clone)]
pub struct GuestException {
    pub kind: ExceptionKind,
    pub file: String,
    pub line: u32,
    pub msg: String,
}

impl std::error::Error for GuestException {}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: exception `{}` thrown",
            self.file, self.line, self.kind
        )?;
        if !self.msg.is_empty() {
            write!(f, ".  {}", self.msg)?;
        }
        Ok(())
    }
}

/// Everything that can make a query fail.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown Wasm context id {0}")]
    UnknownContext(u32),
    #[error("unknown index id {0}")]
    UnknownIndex(u64),
    #[error("failed to compile Wasm module to machine code")]
    Compile(#[source] anyhow::Error),
    #[error("failed to instantiate Wasm module")]
    Instantiate(#[source] anyhow::Error),
    #[error("query trapped in guest code")]
    Trap(#[source] anyhow::Error),
    #[error(transparent)]
    Guest(#[from] GuestException),
    #[error(transparent)]
    Codegen(#[from] crate::codegen::CodegenError),
    #[error(transparent)]
    Arena(#[from] crate::arena::ArenaError),
    #[error(transparent)]
    Inspector(#[from] crate::inspect::InspectorError),
    #[error("result sink I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_exception_renders_provenance() {
        let exc = GuestException {
            kind: ExceptionKind::DivisionByZero,
            file: "query.rs".into(),
            line: 42,
            msg: "divisor is zero".into(),
        };
        assert_eq!(
            exc.to_string(),
            "query.rs:42: exception `division_by_zero` thrown.  divisor is zero"
        );
    }

    #[test]
    fn exception_kinds_round_trip() {
        for v in 0..4 {
            let kind = ExceptionKind::from_u64(v).unwrap();
            assert_eq!(ExceptionKind::from_u64(v), Some(kind));
        }
        assert_eq!(ExceptionKind::from_u64(99), None);
    }
}
