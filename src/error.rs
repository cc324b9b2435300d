use crate::{
    types::{BasicType, WellKnown},
    value::ObjectRef,
};
use thiserror::Error;

/// A symbolic reference that could not be linked. Each kind surfaces in the
/// guest as the matching linkage error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("class not found: {0}")]
    NoClassDef(String),
    #[error("no field {name}:{descriptor} in {class}")]
    NoSuchField {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("no method {name}{descriptor} in {class}")]
    NoSuchMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("incompatible class change: {0}")]
    IncompatibleClassChange(String),
    #[error("constant pool entry {index} of {class} is not a {expected}")]
    BadConstant {
        class: String,
        index: u16,
        expected: &'static str,
    },
}

impl ResolutionError {
    pub fn exception_class(&self) -> WellKnown {
        match self {
            ResolutionError::NoClassDef(_) => WellKnown::NoClassDefFoundError,
            ResolutionError::NoSuchField { .. } => WellKnown::NoSuchFieldError,
            ResolutionError::NoSuchMethod { .. } => WellKnown::NoSuchMethodError,
            ResolutionError::IncompatibleClassChange(_) => WellKnown::IncompatibleClassChangeError,
            ResolutionError::BadConstant { .. } => WellKnown::VerifyError,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("malformed descriptor: {0}")]
    BadDescriptor(String),
    #[error("class {0} is already defined")]
    Duplicate(String),
    #[error("{missing}, needed by {class}, is not defined")]
    Undefined { class: String, missing: String },
    #[error("{0} is not an interface")]
    NotAnInterface(String),
    #[error("method {0} has neither code nor a native binding")]
    MissingBody(String),
}

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("native method {0} has no binding")]
    UnsatisfiedLink(String),
    #[error("failed to load native library: {0}")]
    Library(#[from] libloading::Error),
    #[error("unsupported native type {0:?}")]
    UnsupportedType(BasicType),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AssemblerError {
    #[error("label {0} was never bound")]
    UnboundLabel(usize),
    #[error("branch from {from} to {to} does not fit in 16 bits")]
    BranchTooFar { from: usize, to: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonitorStateError {
    #[error("thread {thread} does not own the monitor of {object:?}")]
    NotOwner { thread: u64, object: ObjectRef },
}

/// Failure to put together one of the built-in programs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProgramError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
    #[error("method {0} is missing")]
    MissingMethod(String),
}
