//! Management of isolated library instances.

use std::{
    ffi::{c_char, c_int, CString},
    fmt::{Debug, Display},
    path::{Path, PathBuf},
    sync::Arc,
};

use elf::{
    abi::{
        DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ,
        DT_NEEDED, DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ, PT_TLS, STT_TLS,
    },
    endian::NativeEndian,
    symbol::Symbol,
    ElfBytes,
};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::{
    image::{self, FileImage, MappedImage},
    provider::{ProviderChain, SymbolProvider, TlsDescriptor},
    relocate::RelocCtx,
    symbol::ResolvedSymbol,
    tls::TlsModule,
    IsolinkError, IsolinkErrorKind,
};

/// Lifecycle of an instance, as visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryState {
    Unloaded,
    Loaded,
    Failed,
}

/// Initializer routines recorded from the dynamic table.
#[derive(Debug, Default)]
struct CtorSet {
    legacy_init: usize,
    init_array: usize,
    init_array_len: usize,
}

/// Finalizer routines, run best-effort when a loaded instance drops.
#[derive(Debug, Default)]
struct FiniSet {
    legacy_fini: usize,
    fini_array: usize,
    fini_array_len: usize,
}

struct LoadedImage {
    file: FileImage,
    image: MappedImage,
    tls_handle: Option<usize>,
    fini: FiniSet,
}

enum State {
    Unloaded { chain: ProviderChain },
    Loaded(LoadedImage),
    Failed,
}

/// One isolated copy of a shared object.
///
/// An instance is bound to a file at creation, gathers its provider chain,
/// and becomes usable after [CustomLibrary::load]. Loaded instances answer
/// [CustomLibrary::sym] from their own export table and serve as a
/// [SymbolProvider] for further loads. Writable segments and TLS are private
/// to the instance for its whole lifetime.
pub struct CustomLibrary {
    /// Just for debug and logging purposes.
    name: String,
    full_path: PathBuf,
    argv: Vec<CString>,
    state: RwLock<State>,
}

impl CustomLibrary {
    fn new(path: &Path, argv: Vec<CString>) -> Arc<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Arc::new(Self {
            name,
            full_path: path.to_owned(),
            argv,
            state: RwLock::new(State::Unloaded {
                chain: ProviderChain::default(),
            }),
        })
    }

    /// Bind a new unloaded instance to a file.
    pub fn create(path: impl AsRef<Path>) -> Arc<Self> {
        Self::new(path.as_ref(), Vec::new())
    }

    /// Like [CustomLibrary::create], with process-style arguments handed to
    /// the image's initializers as (argc, argv, envp).
    pub fn create_with_args(
        path: impl AsRef<Path>,
        args: &[&str],
    ) -> Result<Arc<Self>, IsolinkError> {
        let argv = args
            .iter()
            .map(|a| {
                CString::new(*a).map_err(|_| {
                    IsolinkError::from(IsolinkErrorKind::BadArgument {
                        arg: a.to_string(),
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(path.as_ref(), argv))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.full_path
    }

    pub fn state(&self) -> LibraryState {
        match &*self.state.read() {
            State::Unloaded { .. } => LibraryState::Unloaded,
            State::Loaded(_) => LibraryState::Loaded,
            State::Failed => LibraryState::Failed,
        }
    }

    /// Append a provider to this instance's chain. Valid only before `load`;
    /// the chain is sealed once loading begins.
    pub fn add_search_library(
        &self,
        provider: Arc<dyn SymbolProvider>,
    ) -> Result<(), IsolinkError> {
        match &mut *self.state.write() {
            State::Unloaded { chain } => {
                chain.push(provider);
                Ok(())
            }
            _ => Err(IsolinkErrorKind::ChainSealed {
                library: self.name.clone(),
            }
            .into()),
        }
    }

    /// Parse, map, relocate, and initialize the instance, in that order. Any
    /// failure marks the instance Failed; partial state is torn down and the
    /// error is fatal to this instance only.
    pub fn load(&self) -> Result<(), IsolinkError> {
        let mut guard = self.state.write();
        let chain = match &mut *guard {
            State::Unloaded { chain } => std::mem::take(chain),
            State::Loaded(_) | State::Failed => {
                return Err(IsolinkErrorKind::DoubleLoad {
                    library: self.name.clone(),
                }
                .into())
            }
        };
        match self.do_load(chain) {
            Ok(loaded) => {
                *guard = State::Loaded(loaded);
                Ok(())
            }
            Err(e) => {
                *guard = State::Failed;
                Err(IsolinkError::new_collect(
                    IsolinkErrorKind::LibraryLoadFail {
                        library: self.name.clone(),
                    },
                    vec![e],
                ))
            }
        }
    }

    fn do_load(&self, chain: ProviderChain) -> Result<LoadedImage, IsolinkError> {
        let file = FileImage::open(&self.full_path)?;
        file.validate_header()?;
        let elf = file.elf()?;

        let directives = image::load_directives(&elf)?;
        let mapped = MappedImage::map(&file, &directives, &self.name)?;

        for needed in self.enumerate_needed(&elf)? {
            debug!("{}: needs {} (chain must satisfy)", self.name, needed);
        }

        // Register a private TLS module before relocating; DTPMOD entries
        // against local symbols write its handle.
        let tls_phdr = elf
            .segments()
            .and_then(|phdrs| phdrs.iter().find(|phdr| phdr.p_type == PT_TLS));
        let tls_handle = tls_phdr.map(|phdr| {
            let formatter = humansize::make_format(humansize::BINARY);
            debug!(
                "{}: registering TLS data ({} total, {} copy)",
                self.name,
                formatter(phdr.p_memsz),
                formatter(phdr.p_filesz)
            );
            TlsModule::new_handle(
                mapped.laddr(phdr.p_vaddr),
                phdr.p_filesz as usize,
                phdr.p_memsz as usize,
                phdr.p_align as usize,
            )
        });

        let ctx = RelocCtx {
            name: &self.name,
            image: &mapped,
            chain: &chain,
            tls_handle,
        };
        ctx.relocate(&elf)?;

        let ctors = self.get_ctor_info(&elf)?;
        let fini = self.get_fini_info(&elf)?;
        self.run_ctors(&ctors, &mapped);

        Ok(LoadedImage {
            file,
            image: mapped,
            tls_handle,
            fini,
        })
    }

    fn enumerate_needed(
        &self,
        elf: &ElfBytes<'_, NativeEndian>,
    ) -> Result<Vec<String>, IsolinkError> {
        let common = elf.find_common_data()?;
        let (Some(dynamic), Some(strs)) = (common.dynamic, common.dynsyms_strs) else {
            return Ok(Vec::new());
        };
        Ok(dynamic
            .iter()
            .filter(|d| d.d_tag == DT_NEEDED)
            .filter_map(|d| strs.get(d.d_val() as usize).ok())
            .map(|s| s.to_string())
            .collect())
    }

    fn get_ctor_info(&self, elf: &ElfBytes<'_, NativeEndian>) -> Result<CtorSet, IsolinkError> {
        let dynamic = elf
            .dynamic()?
            .ok_or_else(|| IsolinkErrorKind::MissingSection {
                name: "dynamic".to_string(),
            })?;
        // If this isn't present, just call it 0, since if there's an
        // init_array, this entry must be present in valid ELF files.
        let init_array_len = dynamic
            .iter()
            .find_map(|d| {
                if d.d_tag == DT_INIT_ARRAYSZ {
                    Some(d.d_val() as usize / core::mem::size_of::<usize>())
                } else {
                    None
                }
            })
            .unwrap_or_default();
        let init_array = dynamic.iter().find_map(|d| {
            if d.d_tag == DT_INIT_ARRAY {
                Some(d.d_ptr() as usize)
            } else {
                None
            }
        });
        // Legacy _init call. Supported for, well, legacy.
        let leg_init = dynamic.iter().find_map(|d| {
            if d.d_tag == DT_INIT {
                Some(d.d_ptr() as usize)
            } else {
                None
            }
        });

        if dynamic.iter().any(|d| d.d_tag == DT_PREINIT_ARRAY)
            && dynamic
                .iter()
                .find(|d| d.d_tag == DT_PREINIT_ARRAYSZ)
                .is_some_and(|d| d.d_val() > 0)
        {
            warn!("{}: PREINIT_ARRAY is unsupported", self.name);
        }

        debug!(
            "{}: ctor info: init_array: {:?} len={}, legacy: {:?}",
            self.name, init_array, init_array_len, leg_init
        );
        Ok(CtorSet {
            legacy_init: leg_init.unwrap_or_default(),
            init_array: init_array.unwrap_or_default(),
            init_array_len,
        })
    }

    fn get_fini_info(&self, elf: &ElfBytes<'_, NativeEndian>) -> Result<FiniSet, IsolinkError> {
        let dynamic = elf
            .dynamic()?
            .ok_or_else(|| IsolinkErrorKind::MissingSection {
                name: "dynamic".to_string(),
            })?;
        let fini_array_len = dynamic
            .iter()
            .find_map(|d| {
                if d.d_tag == DT_FINI_ARRAYSZ {
                    Some(d.d_val() as usize / core::mem::size_of::<usize>())
                } else {
                    None
                }
            })
            .unwrap_or_default();
        let fini_array = dynamic
            .iter()
            .find_map(|d| {
                if d.d_tag == DT_FINI_ARRAY {
                    Some(d.d_ptr() as usize)
                } else {
                    None
                }
            })
            .unwrap_or_default();
        let legacy_fini = dynamic
            .iter()
            .find_map(|d| {
                if d.d_tag == DT_FINI {
                    Some(d.d_ptr() as usize)
                } else {
                    None
                }
            })
            .unwrap_or_default();
        Ok(FiniSet {
            legacy_fini,
            fini_array,
            fini_array_len,
        })
    }

    /// Run DT_INIT then DT_INIT_ARRAY in order, exactly once, synchronously.
    /// glibc hands initializers (argc, argv, envp); images that expect
    /// process-style startup read them.
    fn run_ctors(&self, ctors: &CtorSet, image: &MappedImage) {
        type Ctor = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char);

        let argc = self.argv.len() as c_int;
        let mut argv_ptrs: Vec<*mut c_char> = self
            .argv
            .iter()
            .map(|a| a.as_ptr() as *mut c_char)
            .collect();
        argv_ptrs.push(std::ptr::null_mut());
        let mut envp: [*mut c_char; 1] = [std::ptr::null_mut()];

        let mut call = |addr: usize| {
            trace!("{}: running ctor at {:x}", self.name, addr);
            unsafe {
                let ctor: Ctor = core::mem::transmute(addr);
                ctor(argc, argv_ptrs.as_mut_ptr(), envp.as_mut_ptr());
            }
        };

        if ctors.legacy_init != 0 {
            call(image.base() + ctors.legacy_init);
        }
        if ctors.init_array != 0 {
            let entries: *const usize = image.laddr(ctors.init_array as u64);
            for i in 0..ctors.init_array_len {
                let entry = unsafe { *entries.add(i) };
                // Linkers emit 0 and -1 placeholder entries.
                if entry != 0 && entry != usize::MAX {
                    call(entry);
                }
            }
        }
    }

    fn do_lookup_symbol(
        &self,
        loaded: &LoadedImage,
        name: &str,
    ) -> Result<Option<Symbol>, IsolinkError> {
        let elf = loaded.file.elf()?;
        let common = elf.find_common_data()?;
        let dynsyms = common
            .dynsyms
            .ok_or_else(|| IsolinkErrorKind::MissingSection {
                name: "dynsyms".to_string(),
            })?;
        let dynsyms_str = common
            .dynsyms_strs
            .ok_or_else(|| IsolinkErrorKind::MissingSection {
                name: "dynsyms_strs".to_string(),
            })?;

        // Try the GNU hash table, if present; defined global and weak
        // symbols are both exports from the provider's point of view.
        if let Some(h) = &common.gnu_hash {
            if let Some((_, sym)) = h
                .find(name.as_bytes(), &dynsyms, &dynsyms_str)
                .ok()
                .flatten()
            {
                if !sym.is_undefined() {
                    return Ok(Some(sym));
                }
            }
            return Ok(None);
        }

        // Fall back to the sysv hash table.
        if let Some(h) = &common.sysv_hash {
            if let Some((_, sym)) = h
                .find(name.as_bytes(), &dynsyms, &dynsyms_str)
                .ok()
                .flatten()
            {
                if !sym.is_undefined() {
                    return Ok(Some(sym));
                }
            }
        }
        Ok(None)
    }

    /// Look up a name in this instance's own export table. A miss for a
    /// loaded instance is `Ok(None)`, never an error; calling this before a
    /// successful load is UseBeforeLoad.
    pub fn sym(&self, name: &str) -> Result<Option<ResolvedSymbol>, IsolinkError> {
        let guard = self.state.read();
        let loaded = match &*guard {
            State::Loaded(loaded) => loaded,
            _ => {
                return Err(IsolinkErrorKind::UseBeforeLoad {
                    library: self.name.clone(),
                }
                .into())
            }
        };
        Ok(self.do_lookup_symbol(loaded, name)?.map(|sym| {
            ResolvedSymbol::new(loaded.image.base() as u64 + sym.st_value, sym.st_size)
        }))
    }
}

impl SymbolProvider for CustomLibrary {
    fn resolve(&self, name: &str) -> Option<usize> {
        let guard = self.state.read();
        let loaded = match &*guard {
            State::Loaded(loaded) => loaded,
            _ => return None,
        };
        let sym = self.do_lookup_symbol(loaded, name).ok().flatten()?;
        if sym.st_symtype() == STT_TLS {
            return None;
        }
        Some(loaded.image.base() + sym.st_value as usize)
    }

    fn resolve_tls(&self, name: &str) -> Option<TlsDescriptor> {
        let guard = self.state.read();
        let loaded = match &*guard {
            State::Loaded(loaded) => loaded,
            _ => return None,
        };
        let sym = self.do_lookup_symbol(loaded, name).ok().flatten()?;
        if sym.st_symtype() != STT_TLS {
            return None;
        }
        Some(TlsDescriptor {
            module: loaded.tls_handle?,
            offset: sym.st_value as usize,
        })
    }
}

impl Drop for CustomLibrary {
    fn drop(&mut self) {
        // Best-effort finalizers, DT_FINI_ARRAY in reverse then DT_FINI.
        // Instances kept by the retention arena never reach this path.
        if let State::Loaded(loaded) = &*self.state.get_mut() {
            type Fini = unsafe extern "C" fn();
            debug!("{}: running finalizers and unmapping", self.name);
            if loaded.fini.fini_array != 0 {
                let entries: *const usize = loaded.image.laddr(loaded.fini.fini_array as u64);
                for i in (0..loaded.fini.fini_array_len).rev() {
                    let entry = unsafe { *entries.add(i) };
                    if entry != 0 && entry != usize::MAX {
                        unsafe {
                            let fini: Fini = core::mem::transmute(entry);
                            fini();
                        }
                    }
                }
            }
            if loaded.fini.legacy_fini != 0 {
                unsafe {
                    let fini: Fini =
                        core::mem::transmute(loaded.image.base() + loaded.fini.legacy_fini);
                    fini();
                }
            }
        }
    }
}

impl Debug for CustomLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomLibrary")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Display for CustomLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.name)
    }
}
