//! Welcome to isolink, a loader for isolated copies of shared libraries.
//!
//! The system dynamic linker keeps one global symbol namespace per process: load
//! libpython twice and you get the same mapping, the same globals, the same GIL.
//! isolink exists to break that rule on purpose. It loads ELF shared objects
//! itself -- parsing, mapping, relocating, and running constructors -- and
//! resolves each object's undefined symbols against an *ordered provider chain*
//! supplied by the caller instead of the process-wide namespace. Two instances
//! loaded from the same file get separate writable segments and separate
//! thread-local storage, while still living in one address space, so plain
//! pointers can be handed between them.
//!
//! The pieces:
//!
//! 1. [`provider::SymbolProvider`] is the resolution capability: a name to an
//!    address, or a name to a TLS location. Providers are chained; first match
//!    wins.
//! 2. [`system::SystemLibrary`] answers lookups from the OS loader's own
//!    namespace, for the libraries that should stay shared (libc, libm, ...).
//! 3. [`library::CustomLibrary`] is the loader core: one instance per loaded
//!    copy, itself a provider exporting the symbols it defines.
//! 4. [`raw`] carries a provider across a `cdylib` boundary, where Rust trait
//!    objects from another copy of this crate are not ABI-stable.
//! 5. [`retain::RetentionArena`] owns libraries loaded on behalf of an embedded
//!    runtime, which must never be unmapped while that runtime can still reach
//!    them.
//!
//! Loading an object is a fixed pipeline: validate the ELF header, map every
//! PT_LOAD segment at a loader-chosen base, walk the RELA tables resolving
//! imports through the chain, mint a private TLS module for the instance, then
//! run DT_INIT and DT_INIT_ARRAY. Any failure poisons that instance and only
//! that instance.
//!
//! This crate reports errors with the [error::IsolinkError] type, which
//! implements std::error::Error and miette's Diagnostic.

pub(crate) mod arch;

mod error;
pub use error::*;

mod image;
mod relocate;
pub(crate) mod tls;

pub mod library;
pub mod provider;
pub mod raw;
pub mod retain;
pub mod symbol;
pub mod system;

pub use library::CustomLibrary;
pub use provider::{SymbolProvider, TlsDescriptor};
pub use symbol::ResolvedSymbol;
pub use system::SystemLibrary;
