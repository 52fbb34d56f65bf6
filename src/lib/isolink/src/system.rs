//! Bridge to the process's native dynamic loader.

use std::{
    ffi::{c_char, c_int, c_void, CStr, CString},
    path::Path,
};

use tracing::trace;

use crate::{
    provider::{SymbolProvider, TlsDescriptor},
    IsolinkError, IsolinkErrorKind,
};

// Not in the libc crate; glibc-specific dlinfo requests.
const RTLD_DI_LINKMAP: c_int = 2;
const RTLD_DI_TLS_MODID: c_int = 9;

extern "C" {
    fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
}

#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *const Elf64Dyn,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

#[repr(C)]
struct Elf64Dyn {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

const STT_TLS: u8 = 6;
const SHN_UNDEF: u16 = 0;

/// A handle into the native loader's namespace, usable as a provider.
///
/// [SystemLibrary::current] wraps `RTLD_DEFAULT` (the global scope of the
/// host process); [SystemLibrary::open] dlopens a specific object. Either
/// way, symbol definitions come from the native loader and stay shared
/// process-wide.
pub struct SystemLibrary {
    handle: *mut c_void,
    owned: bool,
}

// dlsym and dlinfo on a live handle are thread-safe in glibc.
unsafe impl Send for SystemLibrary {}
unsafe impl Sync for SystemLibrary {}

impl SystemLibrary {
    /// The default search scope of the host process.
    pub fn current() -> Self {
        Self {
            handle: libc::RTLD_DEFAULT,
            owned: false,
        }
    }

    /// Wrap an existing dlopen handle. If `steal` is set, the handle is
    /// dlclosed when this wrapper drops.
    ///
    /// # Safety
    /// `handle` must be a live handle returned by dlopen (or one of the
    /// pseudo-handles), and with `steal` the caller must not dlclose it.
    pub unsafe fn from_handle(handle: *mut c_void, steal: bool) -> Self {
        Self {
            handle,
            owned: steal,
        }
    }

    /// dlopen an object through the native loader.
    pub fn open(path: impl AsRef<Path>, flags: c_int) -> Result<Self, IsolinkError> {
        let path = path.as_ref();
        let cpath = CString::new(path.display().to_string()).map_err(|_| {
            IsolinkErrorKind::BadArgument {
                arg: path.display().to_string(),
            }
        })?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), flags) };
        if handle.is_null() {
            let reason = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "unknown dlopen failure".to_string()
                } else {
                    CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(IsolinkErrorKind::SystemLoaderFail {
                path: path.display().to_string(),
                reason,
            }
            .into());
        }
        Ok(Self {
            handle,
            owned: true,
        })
    }

    fn link_map(&self) -> Option<&LinkMap> {
        // The pseudo-handles have no link map.
        if self.handle.is_null() || self.handle == libc::RTLD_DEFAULT {
            return None;
        }
        let mut map: *mut LinkMap = std::ptr::null_mut();
        let r = unsafe {
            dlinfo(
                self.handle,
                RTLD_DI_LINKMAP,
                &mut map as *mut *mut LinkMap as *mut c_void,
            )
        };
        if r != 0 || map.is_null() {
            return None;
        }
        Some(unsafe { &*map })
    }

    fn tls_module_id(&self) -> Option<usize> {
        let mut modid: usize = 0;
        let r = unsafe {
            dlinfo(
                self.handle,
                RTLD_DI_TLS_MODID,
                &mut modid as *mut usize as *mut c_void,
            )
        };
        if r != 0 || modid == 0 {
            return None;
        }
        Some(modid)
    }

    /// Find a symbol's table entry in this object's live link map. The
    /// loader keeps dynamic table addresses relocated in memory, so the
    /// hash/symbol/string pointers are usable directly.
    fn lookup_in_link_map(&self, name: &str) -> Option<&Elf64Sym> {
        let map = self.link_map()?;
        let mut symtab: *const Elf64Sym = std::ptr::null();
        let mut strtab: *const c_char = std::ptr::null();
        let mut gnu_hash: *const u32 = std::ptr::null();
        let mut sysv_hash: *const u32 = std::ptr::null();

        const DT_HASH: i64 = 4;
        const DT_STRTAB: i64 = 5;
        const DT_SYMTAB: i64 = 6;
        const DT_GNU_HASH: i64 = 0x6fff_fef5;

        let mut dynp = map.l_ld;
        unsafe {
            while !dynp.is_null() && (*dynp).d_tag != 0 {
                match (*dynp).d_tag {
                    DT_SYMTAB => symtab = (*dynp).d_val as *const Elf64Sym,
                    DT_STRTAB => strtab = (*dynp).d_val as *const c_char,
                    DT_GNU_HASH => gnu_hash = (*dynp).d_val as *const u32,
                    DT_HASH => sysv_hash = (*dynp).d_val as *const u32,
                    _ => {}
                }
                dynp = dynp.add(1);
            }
        }
        if symtab.is_null() || strtab.is_null() {
            return None;
        }

        if !gnu_hash.is_null() {
            return unsafe { gnu_hash_lookup(gnu_hash, symtab, strtab, name) };
        }
        if !sysv_hash.is_null() {
            return unsafe { sysv_hash_lookup(sysv_hash, symtab, strtab, name) };
        }
        None
    }
}

impl SymbolProvider for SystemLibrary {
    fn resolve(&self, name: &str) -> Option<usize> {
        let cname = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(self.handle, cname.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as usize)
        }
    }

    fn resolve_tls(&self, name: &str) -> Option<TlsDescriptor> {
        // RTLD_DEFAULT has no single link map to search; TLS definitions
        // come only from concretely opened objects.
        let sym = self.lookup_in_link_map(name)?;
        if sym.st_info & 0xf != STT_TLS || sym.st_shndx == SHN_UNDEF {
            return None;
        }
        let module = self.tls_module_id()?;
        trace!(
            "resolved native TLS symbol {} to module {} offset {:x}",
            name,
            module,
            sym.st_value
        );
        Some(TlsDescriptor {
            module,
            offset: sym.st_value as usize,
        })
    }
}

impl Drop for SystemLibrary {
    fn drop(&mut self) {
        if self.owned && !self.handle.is_null() {
            unsafe {
                libc::dlclose(self.handle);
            }
        }
    }
}

unsafe fn symbol_matches(
    sym: *const Elf64Sym,
    strtab: *const c_char,
    name: &str,
) -> Option<&'static Elf64Sym> {
    let sname = CStr::from_ptr(strtab.add((*sym).st_name as usize));
    if sname.to_bytes() == name.as_bytes() {
        Some(&*sym)
    } else {
        None
    }
}

/// GNU hash layout: [nbuckets, symoffset, bloom_size, bloom_shift,
/// bloom[bloom_size] as u64, buckets[nbuckets], chains...]. The bloom
/// filter is skipped here; this path only runs on resolver misses.
unsafe fn gnu_hash_lookup(
    table: *const u32,
    symtab: *const Elf64Sym,
    strtab: *const c_char,
    name: &str,
) -> Option<&'static Elf64Sym> {
    let nbuckets = *table as usize;
    let symoffset = *table.add(1) as usize;
    let bloom_size = *table.add(2) as usize;
    if nbuckets == 0 {
        return None;
    }
    let buckets = table.add(4 + bloom_size * 2);
    let chains = buckets.add(nbuckets);

    let mut hash: u32 = 5381;
    for &b in name.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }

    let mut idx = *buckets.add(hash as usize % nbuckets) as usize;
    if idx < symoffset {
        return None;
    }
    loop {
        let chain_val = *chains.add(idx - symoffset);
        if chain_val >> 1 == hash >> 1 {
            if let Some(sym) = symbol_matches(symtab.add(idx), strtab, name) {
                return Some(sym);
            }
        }
        // Low bit marks the end of the bucket's chain.
        if chain_val & 1 != 0 {
            return None;
        }
        idx += 1;
    }
}

unsafe fn sysv_hash_lookup(
    table: *const u32,
    symtab: *const Elf64Sym,
    strtab: *const c_char,
    name: &str,
) -> Option<&'static Elf64Sym> {
    let nbuckets = *table as usize;
    if nbuckets == 0 {
        return None;
    }
    let buckets = table.add(2);
    let chains = buckets.add(nbuckets);

    let mut hash: u32 = 0;
    for &b in name.as_bytes() {
        hash = (hash << 4).wrapping_add(b as u32);
        let g = hash & 0xf000_0000;
        if g != 0 {
            hash ^= g >> 24;
        }
        hash &= !g;
    }

    let mut idx = *buckets.add(hash as usize % nbuckets) as usize;
    while idx != 0 {
        if let Some(sym) = symbol_matches(symtab.add(idx), strtab, name) {
            return Some(sym);
        }
        idx = *chains.add(idx) as usize;
    }
    None
}
