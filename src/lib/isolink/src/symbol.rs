//! Definitions for symbols resolved from a loaded library.

/// A symbol found in a loaded instance's export table. The value is already
/// adjusted for the instance's load base. Extracting a typed pointer is the
/// caller's one unsafe step, taken at resolution time rather than at every
/// call site.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSymbol {
    value: u64,
    size: u64,
}

impl ResolvedSymbol {
    pub(crate) fn new(value: u64, size: u64) -> Self {
        Self { value, size }
    }

    /// The symbol's absolute address.
    pub fn value(&self) -> usize {
        self.value as usize
    }

    /// The symbol's size, as recorded in the dynamic symbol table.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// View the symbol as a data pointer.
    ///
    /// # Safety
    /// The symbol must actually refer to a `T`, and the instance it came from
    /// must outlive every use of the pointer.
    pub unsafe fn as_ptr<T>(&self) -> *mut T {
        self.value as usize as *mut T
    }

    /// View the symbol as a function of type `F` (an `extern "C" fn` type).
    ///
    /// # Safety
    /// The symbol must actually be a function of signature `F`, and the
    /// instance it came from must outlive every call through it.
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        debug_assert_eq!(core::mem::size_of::<F>(), core::mem::size_of::<usize>());
        let addr = self.value as usize;
        core::mem::transmute_copy(&addr)
    }
}
