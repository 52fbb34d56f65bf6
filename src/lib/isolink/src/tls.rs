//! Per-instance thread-local storage, general-dynamic model only.
//!
//! The OS loader hands each shared object a small integer TLS module id and
//! serves `__tls_get_addr` from the thread's DTV. We cannot extend glibc's
//! DTV, so isolated instances get their own scheme: a module "id" minted here
//! is the address of a leaked [TlsModule] record, and every loaded image has
//! its `__tls_get_addr` import bound to [tls_get_addr_shim] instead of the
//! real resolver. The shim tells the two kinds of id apart by value range and
//! a magic word, serving record handles from the record's per-thread block
//! table and forwarding genuine small ids to the real resolver found via
//! `dlsym(RTLD_NEXT)`.
//!
//! All state lives inside the record itself so a handle minted by one copy of
//! this crate (the hook cdylib carries its own copy) is honored by whichever
//! copy's shim ends up being called.

use std::{alloc::Layout, collections::HashMap};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::trace;

use crate::arch::MINIMUM_TLS_ALIGNMENT;

/// glibc TLS module ids count up from 1; anything below this is treated as
/// one of them. Handles minted here are heap addresses, far above it.
const HANDLE_FLOOR: usize = 1 << 20;

const MODULE_MAGIC: usize = 0x6973_6f6c_6b74_6c73;

/// The argument to `__tls_get_addr`, per the x86-64 psABI.
#[repr(C)]
pub(crate) struct TlsIndex {
    pub module: usize,
    pub offset: usize,
}

/// One instance's TLS module: the initialization template (pointing into the
/// instance's mapped PT_TLS segment) plus the per-thread blocks materialized
/// from it. Records are leaked on creation; their addresses are written into
/// relocated GOT slots and must stay valid for the life of the process.
pub(crate) struct TlsModule {
    magic: usize,
    template: *const u8,
    filesz: usize,
    memsz: usize,
    align: usize,
    /// Blocks keyed by pthread id, created on first touch, never freed. The
    /// count is bounded by threads times instances.
    blocks: Mutex<HashMap<libc::pthread_t, usize>>,
}

// Template pointers are read-only views into a mapping that outlives the
// record; block addresses are plain integers.
unsafe impl Send for TlsModule {}
unsafe impl Sync for TlsModule {}

impl TlsModule {
    /// Mint a module handle for a freshly mapped PT_TLS segment.
    pub fn new_handle(template: *const u8, filesz: usize, memsz: usize, align: usize) -> usize {
        let record = Box::leak(Box::new(TlsModule {
            magic: MODULE_MAGIC,
            template,
            filesz,
            memsz,
            align,
            blocks: Mutex::new(HashMap::new()),
        }));
        let handle = record as *const TlsModule as usize;
        trace!("minted TLS module handle {:x} (memsz {})", handle, memsz);
        handle
    }

    fn block_for_current_thread(&self) -> *mut u8 {
        let tid = unsafe { libc::pthread_self() };
        let mut blocks = self.blocks.lock();
        let addr = blocks.entry(tid).or_insert_with(|| self.allocate_block());
        *addr as *mut u8
    }

    fn allocate_block(&self) -> usize {
        let align = self.align.max(MINIMUM_TLS_ALIGNMENT).next_power_of_two();
        let layout = match Layout::from_size_align(self.memsz.max(1), align) {
            Ok(layout) => layout,
            Err(_) => Layout::new::<usize>(),
        };
        unsafe {
            let block = std::alloc::alloc_zeroed(layout);
            if block.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            std::ptr::copy_nonoverlapping(self.template, block, self.filesz.min(self.memsz));
            block as usize
        }
    }
}

/// Is this module word one of our record handles, as opposed to a module id
/// assigned by the system loader?
pub(crate) fn is_module_handle(module: usize) -> bool {
    if module < HANDLE_FLOOR || module % core::mem::align_of::<TlsModule>() != 0 {
        return false;
    }
    unsafe { (*(module as *const TlsModule)).magic == MODULE_MAGIC }
}

type TlsGetAddr = unsafe extern "C" fn(*mut TlsIndex) -> *mut u8;

static REAL_TLS_GET_ADDR: OnceCell<Option<TlsGetAddr>> = OnceCell::new();

fn real_tls_get_addr() -> Option<TlsGetAddr> {
    *REAL_TLS_GET_ADDR.get_or_init(|| unsafe {
        let sym = libc::dlsym(libc::RTLD_NEXT, "__tls_get_addr\0".as_ptr().cast());
        if sym.is_null() {
            let sym = libc::dlsym(libc::RTLD_DEFAULT, "__tls_get_addr\0".as_ptr().cast());
            if sym.is_null() {
                return None;
            }
            return Some(core::mem::transmute::<*mut core::ffi::c_void, TlsGetAddr>(sym));
        }
        Some(core::mem::transmute::<*mut core::ffi::c_void, TlsGetAddr>(sym))
    })
}

/// The `__tls_get_addr` every loaded image is bound to. Record handles are
/// served from the record; untagged ids belong to modules the system loader
/// owns and go to the real resolver, so host-loader modules keep working
/// through the same GOT slots.
/// The shim's address, for writing into relocation slots.
pub(crate) fn shim_addr() -> usize {
    let shim: extern "C" fn(*mut TlsIndex) -> *mut u8 = tls_get_addr_shim;
    shim as usize
}

pub(crate) extern "C" fn tls_get_addr_shim(index: *mut TlsIndex) -> *mut u8 {
    let idx = unsafe { &*index };
    if is_module_handle(idx.module) {
        let record = unsafe { &*(idx.module as *const TlsModule) };
        unsafe { record.block_for_current_thread().add(idx.offset) }
    } else {
        match real_tls_get_addr() {
            Some(real) => unsafe { real(index) },
            None => std::ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_recognized_and_small_ids_are_not() {
        let template = [0u8; 8];
        let handle = TlsModule::new_handle(template.as_ptr(), 8, 16, 8);
        assert!(is_module_handle(handle));
        assert!(!is_module_handle(0));
        assert!(!is_module_handle(1));
        assert!(!is_module_handle(517));
    }

    #[test]
    fn blocks_initialize_from_template_and_zero_fill() {
        let template: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
        let handle = TlsModule::new_handle(template.as_ptr(), 4, 8, 8);
        let mut index = TlsIndex {
            module: handle,
            offset: 0,
        };
        let block = tls_get_addr_shim(&mut index);
        let bytes = unsafe { std::slice::from_raw_parts(block, 8) };
        assert_eq!(&bytes[..4], &template);
        assert_eq!(&bytes[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn blocks_are_private_per_thread() {
        let template: [u8; 8] = 1234u64.to_ne_bytes();
        let handle = TlsModule::new_handle(template.as_ptr(), 8, 8, 8);

        let read_and_bump = move || {
            let mut index = TlsIndex {
                module: handle,
                offset: 0,
            };
            let block = tls_get_addr_shim(&mut index) as *mut u64;
            unsafe {
                let seen = *block;
                *block += 1;
                seen
            }
        };

        // First touch on this thread sees the template, then mutates it.
        assert_eq!(read_and_bump(), 1234);
        assert_eq!(read_and_bump(), 1235);

        // A fresh thread gets its own block, initialized from the template.
        let other = std::thread::spawn(read_and_bump).join().unwrap();
        assert_eq!(other, 1234);

        // This thread's block is unaffected.
        assert_eq!(read_and_bump(), 1236);
    }
}
