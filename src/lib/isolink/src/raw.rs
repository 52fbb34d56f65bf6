//! C-ABI provider transport.
//!
//! The hook ships as a cdylib with its own statically linked copy of this
//! crate, so Rust trait objects cannot cross from the embedding program
//! into it. A [RawProvider] is the chain-provider seam flattened into a
//! context pointer plus two C function pointers, which both copies of the
//! crate agree on by layout.

use std::{
    ffi::{c_char, c_void, CStr},
    sync::Arc,
};

use crate::provider::{SymbolProvider, TlsDescriptor};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTlsDescriptor {
    pub module: usize,
    pub offset: usize,
}

/// A [SymbolProvider] flattened to a stable ABI. `resolve` returns 0 on a
/// miss; `resolve_tls` fills `out` and returns true on a hit.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawProvider {
    pub ctx: *const c_void,
    pub resolve: unsafe extern "C" fn(ctx: *const c_void, name: *const c_char) -> usize,
    pub resolve_tls: unsafe extern "C" fn(
        ctx: *const c_void,
        name: *const c_char,
        out: *mut RawTlsDescriptor,
    ) -> bool,
}

unsafe impl Send for RawProvider {}
unsafe impl Sync for RawProvider {}

unsafe extern "C" fn raw_resolve(ctx: *const c_void, name: *const c_char) -> usize {
    let provider = &*(ctx as *const Arc<dyn SymbolProvider>);
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return 0;
    };
    provider.resolve(name).unwrap_or_default()
}

unsafe extern "C" fn raw_resolve_tls(
    ctx: *const c_void,
    name: *const c_char,
    out: *mut RawTlsDescriptor,
) -> bool {
    let provider = &*(ctx as *const Arc<dyn SymbolProvider>);
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return false;
    };
    match provider.resolve_tls(name) {
        Some(desc) => {
            (*out) = RawTlsDescriptor {
                module: desc.module,
                offset: desc.offset,
            };
            true
        }
        None => false,
    }
}

impl RawProvider {
    /// Flatten a provider. The backing Arc is leaked; raw providers are
    /// handed across an ABI boundary with no way to signal release.
    pub fn new(provider: Arc<dyn SymbolProvider>) -> Self {
        let ctx = Box::leak(Box::new(provider)) as *const Arc<dyn SymbolProvider>;
        Self {
            ctx: ctx as *const c_void,
            resolve: raw_resolve,
            resolve_tls: raw_resolve_tls,
        }
    }
}

/// The receiving side: a [RawProvider] viewed as a [SymbolProvider] again.
pub struct RawProviderRef {
    raw: RawProvider,
}

impl RawProviderRef {
    /// # Safety
    /// `raw` must have been produced by a [RawProvider] whose context and
    /// function pointers are still live.
    pub unsafe fn new(raw: RawProvider) -> Self {
        Self { raw }
    }
}

impl SymbolProvider for RawProviderRef {
    fn resolve(&self, name: &str) -> Option<usize> {
        let cname = std::ffi::CString::new(name).ok()?;
        let addr = unsafe { (self.raw.resolve)(self.raw.ctx, cname.as_ptr()) };
        if addr == 0 {
            None
        } else {
            Some(addr)
        }
    }

    fn resolve_tls(&self, name: &str) -> Option<TlsDescriptor> {
        let cname = std::ffi::CString::new(name).ok()?;
        let mut out = RawTlsDescriptor::default();
        let hit = unsafe { (self.raw.resolve_tls)(self.raw.ctx, cname.as_ptr(), &mut out) };
        if hit {
            Some(TlsDescriptor {
                module: out.module,
                offset: out.offset,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(usize);

    impl SymbolProvider for FixedProvider {
        fn resolve(&self, name: &str) -> Option<usize> {
            (name == "hit").then_some(self.0)
        }

        fn resolve_tls(&self, name: &str) -> Option<TlsDescriptor> {
            (name == "tls_hit").then_some(TlsDescriptor {
                module: 3,
                offset: 0x40,
            })
        }
    }

    #[test]
    fn round_trips_through_c_abi() {
        let raw = RawProvider::new(Arc::new(FixedProvider(0xdead_b000)));
        let back = unsafe { RawProviderRef::new(raw) };
        assert_eq!(back.resolve("hit"), Some(0xdead_b000));
        assert_eq!(back.resolve("miss"), None);
        let tls = back.resolve_tls("tls_hit").unwrap();
        assert_eq!((tls.module, tls.offset), (3, 0x40));
        assert!(back.resolve_tls("other").is_none());
    }
}
