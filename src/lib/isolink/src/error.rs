//! Definitions for errors for the isolation loader.

use elf::file::Class;
use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

use crate::image::LoadDirective;

#[derive(Debug, Error, Diagnostic, Default)]
#[error("{kind}")]
pub struct IsolinkError {
    pub kind: IsolinkErrorKind,
    #[related]
    pub related: Vec<IsolinkError>,
}

impl IsolinkError {
    pub fn new(kind: IsolinkErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn new_collect(kind: IsolinkErrorKind, related: Vec<IsolinkError>) -> Self {
        Self { kind, related }
    }

    /// Partition an iterator of per-item results into its values, or one
    /// aggregate error carrying every per-item failure as related diagnostics.
    pub fn collect<I, T>(parent_kind: IsolinkErrorKind, it: I) -> Result<Vec<T>, IsolinkError>
    where
        I: IntoIterator<Item = Result<T, IsolinkError>>,
    {
        let (vals, errs): (Vec<T>, Vec<IsolinkError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(IsolinkError {
                kind: parent_kind,
                related: errs,
            })
        }
    }
}

impl From<IsolinkErrorKind> for IsolinkError {
    fn from(value: IsolinkErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

#[derive(Debug, Error, Diagnostic, Default)]
pub enum IsolinkErrorKind {
    #[default]
    #[error("unknown")]
    Unknown,
    #[error("failed to load library {library}")]
    LibraryLoadFail { library: String },
    #[error("failed to open {path}")]
    FileOpenFail {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("parse failed: {err}")]
    ParseError {
        #[from]
        err: elf::ParseError,
    },
    #[error("invalid ELF header: {hdr_err}")]
    InvalidELFHeader {
        #[from]
        #[diagnostic_source]
        hdr_err: HeaderError,
    },
    #[error("dynamic object is missing a required segment or section '{name}'")]
    MissingSection { name: String },
    #[error("failed to satisfy load directive")]
    LoadDirectiveFail { dir: LoadDirective },
    #[error("failed to map segments for {library}: {reason}")]
    MappingFail { library: String, reason: String },
    #[error("library {library} requested relocation that is unsupported: {reloc}")]
    UnsupportedReloc { library: String, reloc: String },
    #[error("failed to process relocation section '{secname}' for library '{library}'")]
    RelocationSectionFail { secname: String, library: String },
    #[error("library '{library}' failed to relocate")]
    RelocationFail { library: String },
    #[error("failed to find symbol '{symname}' for '{sourcelib}'")]
    SymbolLookupFail { symname: String, sourcelib: String },
    #[error("library {library} had no TLS data for request")]
    NoTLSInfo { library: String },
    #[error("load already attempted for library {library}")]
    DoubleLoad { library: String },
    #[error("tried to operate on an unloaded library '{library}'")]
    UseBeforeLoad { library: String },
    #[error("provider chain for {library} is sealed once load begins")]
    ChainSealed { library: String },
    #[error("interposition hook invoked before its owning scope was bound")]
    HookUninitialized,
    #[error("system loader failed for {path}: {reason}")]
    SystemLoaderFail { path: String, reason: String },
    #[error("argument contains a nul byte: {arg}")]
    BadArgument { arg: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum HeaderError {
    #[error("class mismatch: expected {expect:?}, got {got:?}")]
    ClassMismatch { expect: Class, got: Class },
    #[error("ELF version mismatch: expected {expect}, got {got}")]
    VersionMismatch { expect: u32, got: u32 },
    #[error("OS/ABI mismatch: expected {expect}, got {got}")]
    OSABIMismatch { expect: u8, got: u8 },
    #[error("ELF type mismatch: expected {expect}, got {got}")]
    ELFTypeMismatch { expect: u16, got: u16 },
    #[error("machine mismatch: expected {expect}, got {got}")]
    MachineMismatch { expect: u16, got: u16 },
}

impl From<HeaderError> for IsolinkError {
    fn from(value: HeaderError) -> Self {
        Self {
            kind: IsolinkErrorKind::InvalidELFHeader { hdr_err: value },
            related: vec![],
        }
    }
}

impl From<elf::ParseError> for IsolinkError {
    fn from(value: elf::ParseError) -> Self {
        Self {
            kind: IsolinkErrorKind::ParseError { err: value },
            related: vec![],
        }
    }
}
