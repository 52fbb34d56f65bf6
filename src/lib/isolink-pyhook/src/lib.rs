//! CPython extension-load interposer.
//!
//! CPython's dynload_shlib funnels every native extension import through
//! `_PyImport_FindSharedFuncptr`. When an isolated interpreter instance is
//! linked against this cdylib's export of that name, its extension modules
//! load through isolink instead of dlopen, each bound to the scope of the
//! interpreter that imported it.
//!
//! The hook is built for exactly one interpreter instance. The embedding
//! program loads one copy of this cdylib per interpreter and calls
//! [isolink_hook_bind_scope] once, before the interpreter runs, handing it
//! that instance's scope as a [RawProvider]. Until a scope is bound every
//! lookup fails; the hook never substitutes another interpreter's scope or
//! the process namespace, since a module initialized against the wrong copy
//! of the runtime corrupts both.

use std::{
    ffi::{c_char, CStr},
    sync::{Arc, OnceLock},
};

use isolink::{
    raw::{RawProvider, RawProviderRef},
    retain::RetentionArena,
    CustomLibrary, IsolinkError, IsolinkErrorKind, SystemLibrary,
};
use tracing::{debug, error, warn};

static OWNING_SCOPE: OnceLock<RawProvider> = OnceLock::new();

/// Bind the owning interpreter's scope. Write-once; returns false if a
/// scope was already bound, leaving the original in place.
///
/// # Safety
/// `scope` must point to a valid [RawProvider] whose context and function
/// pointers outlive the process (the producing side leaks them).
#[no_mangle]
pub unsafe extern "C" fn isolink_hook_bind_scope(scope: *const RawProvider) -> bool {
    if scope.is_null() {
        return false;
    }
    let bound = OWNING_SCOPE.set(*scope).is_ok();
    if bound {
        debug!("hook bound to owning interpreter scope");
    } else {
        warn!("rejecting second scope bind; hook is single-instance");
    }
    bound
}

unsafe fn load_extension(
    prefix: *const c_char,
    shortname: *const c_char,
    pathname: *const c_char,
) -> Result<usize, IsolinkError> {
    let scope = OWNING_SCOPE
        .get()
        .ok_or(IsolinkErrorKind::HookUninitialized)?;
    let prefix = CStr::from_ptr(prefix).to_string_lossy();
    let shortname = CStr::from_ptr(shortname).to_string_lossy();
    let pathname = CStr::from_ptr(pathname).to_string_lossy();

    let initname = format!("{}_{}", prefix, shortname);
    debug!("loading extension {} (want {})", pathname, initname);

    let lib = CustomLibrary::create(pathname.as_ref());
    // System libraries first, then the owning interpreter: libc stays
    // shared, while runtime API symbols bind to the importing instance.
    lib.add_search_library(Arc::new(SystemLibrary::current()))?;
    lib.add_search_library(Arc::new(RawProviderRef::new(*scope)))?;
    lib.load()?;

    let sym = lib
        .sym(&initname)?
        .ok_or_else(|| IsolinkErrorKind::SymbolLookupFail {
            symname: initname,
            sourcelib: pathname.into_owned(),
        })?;

    let entry = sym.value();
    RetentionArena::global().retain(lib, entry);
    Ok(entry)
}

/// CPython's dynload entry point. Returns the module's init function on
/// success and null on any failure; CPython raises ImportError on null.
#[no_mangle]
pub unsafe extern "C" fn _PyImport_FindSharedFuncptr(
    prefix: *const c_char,
    shortname: *const c_char,
    pathname: *const c_char,
    _fp: *mut libc::FILE,
) -> Option<unsafe extern "C" fn()> {
    if prefix.is_null() || shortname.is_null() || pathname.is_null() {
        return None;
    }
    // Never let a panic unwind into the interpreter's C frames.
    let result = std::panic::catch_unwind(|| load_extension(prefix, shortname, pathname));
    match result {
        Ok(Ok(entry)) => Some(core::mem::transmute(entry)),
        Ok(Err(e)) => {
            error!("extension load failed: {}", e);
            None
        }
        Err(_) => {
            error!("extension load panicked");
            None
        }
    }
}
