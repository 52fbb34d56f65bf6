//! Backing files and segment mapping.
//!
//! A [FileImage] is a read-only map of the object file, used for all parsing
//! (headers, symbol tables, relocation tables). A [MappedImage] is the live
//! copy: one PROT_NONE reservation spanning the file's address extent, with
//! each PT_LOAD segment fixed-mapped inside it at its declared protections.
//! Every call to [MappedImage::map] picks a fresh base, so two instances of
//! the same file never share writable pages.

use std::{ffi::c_void, fs::File, os::fd::AsRawFd, path::Path};

use elf::{
    abi::{ET_DYN, EV_CURRENT, PF_R, PF_W, PF_X, PT_LOAD},
    endian::NativeEndian,
    file::{Class, FileHeader},
    ElfBytes,
};
use memmap2::Mmap;
use tracing::{debug, trace};

use crate::{arch, HeaderError, IsolinkError, IsolinkErrorKind};

const PAGE_SIZE: usize = 4096;

fn page_down(val: usize) -> usize {
    val & !(PAGE_SIZE - 1)
}

fn page_up(val: usize) -> usize {
    (val + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// The object file on disk, mapped read-only for parsing.
pub(crate) struct FileImage {
    file: File,
    map: Mmap,
}

impl FileImage {
    pub fn open(path: &Path) -> Result<Self, IsolinkError> {
        let open_fail = |err| IsolinkErrorKind::FileOpenFail {
            path: path.display().to_string(),
            err,
        };
        let file = File::open(path).map_err(open_fail)?;
        // Safety: the map is read-only and private; later truncation of the
        // file by another process is outside our contract.
        let map = unsafe { Mmap::map(&file) }.map_err(open_fail)?;
        Ok(Self { file, map })
    }

    pub fn elf(&self) -> Result<ElfBytes<'_, NativeEndian>, IsolinkError> {
        Ok(ElfBytes::minimal_parse(&self.map)?)
    }

    pub fn validate_header(&self) -> Result<(), IsolinkError> {
        let elf = self.elf()?;
        check_header(&elf.ehdr)?;
        Ok(())
    }
}

/// Sanity-check the ELF header: 64-bit, current version, SysV or GNU ABI, a
/// shared object, for the architecture we relocate for.
pub(crate) fn check_header(ehdr: &FileHeader<NativeEndian>) -> Result<(), HeaderError> {
    if ehdr.class != Class::ELF64 {
        return Err(HeaderError::ClassMismatch {
            expect: Class::ELF64,
            got: ehdr.class,
        });
    }
    if ehdr.version != EV_CURRENT as u32 {
        return Err(HeaderError::VersionMismatch {
            expect: EV_CURRENT as u32,
            got: ehdr.version,
        });
    }
    if ehdr.osabi != elf::abi::ELFOSABI_SYSV && ehdr.osabi != elf::abi::ELFOSABI_GNU {
        return Err(HeaderError::OSABIMismatch {
            expect: elf::abi::ELFOSABI_SYSV,
            got: ehdr.osabi,
        });
    }
    if ehdr.e_type != ET_DYN {
        return Err(HeaderError::ELFTypeMismatch {
            expect: ET_DYN,
            got: ehdr.e_type,
        });
    }
    if ehdr.e_machine != arch::EM_EXPECTED {
        return Err(HeaderError::MachineMismatch {
            expect: arch::EM_EXPECTED,
            got: ehdr.e_machine,
        });
    }
    Ok(())
}

bitflags::bitflags! {
    /// Access flags for a load directive, straight from the segment's PF_ bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct LoadFlags: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// A single load directive, matching closely with an ELF program header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LoadDirective {
    pub load_flags: LoadFlags,
    pub vaddr: usize,
    pub memsz: usize,
    pub offset: usize,
    pub align: usize,
    pub filesz: usize,
}

impl LoadDirective {
    fn prot(&self) -> i32 {
        let mut prot = 0;
        if self.load_flags.contains(LoadFlags::READ) {
            prot |= libc::PROT_READ;
        }
        if self.load_flags.contains(LoadFlags::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.load_flags.contains(LoadFlags::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Extract the PT_LOAD directives from the program header table.
pub(crate) fn load_directives(
    elf: &ElfBytes<'_, NativeEndian>,
) -> Result<Vec<LoadDirective>, IsolinkError> {
    let segments = elf
        .segments()
        .ok_or_else(|| IsolinkErrorKind::MissingSection {
            name: "segment info".to_string(),
        })?;
    let directives: Vec<_> = segments
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .map(|phdr| {
            let mut load_flags = LoadFlags::empty();
            if phdr.p_flags & PF_R != 0 {
                load_flags |= LoadFlags::READ;
            }
            if phdr.p_flags & PF_W != 0 {
                load_flags |= LoadFlags::WRITE;
            }
            if phdr.p_flags & PF_X != 0 {
                load_flags |= LoadFlags::EXEC;
            }
            let ld = LoadDirective {
                load_flags,
                vaddr: phdr.p_vaddr as usize,
                memsz: phdr.p_memsz as usize,
                offset: phdr.p_offset as usize,
                align: phdr.p_align as usize,
                filesz: phdr.p_filesz as usize,
            };
            trace!("{:?}", ld);
            ld
        })
        .collect();
    if directives.is_empty() {
        return Err(IsolinkErrorKind::MissingSection {
            name: "PT_LOAD".to_string(),
        }
        .into());
    }
    for dir in &directives {
        if dir.filesz > dir.memsz || (dir.align != 0 && !dir.align.is_power_of_two()) {
            return Err(IsolinkErrorKind::LoadDirectiveFail { dir: *dir }.into());
        }
    }
    Ok(directives)
}

/// One loaded copy of an object file's segments. Owns its reservation; the
/// whole range is unmapped on drop.
pub(crate) struct MappedImage {
    base: usize,
    reserve: *mut c_void,
    reserve_len: usize,
}

// The mapping is owned uniquely; raw pointers here are just addresses.
unsafe impl Send for MappedImage {}
unsafe impl Sync for MappedImage {}

impl MappedImage {
    /// Map every directive at a kernel-chosen base: reserve the full extent
    /// PROT_NONE, then fix each segment inside it. File-backed pages are
    /// mapped copy-on-write; the zero-fill tail past `filesz` gets anonymous
    /// pages, with the partial page after `filesz` cleared by hand.
    pub fn map(
        file: &FileImage,
        directives: &[LoadDirective],
        name: &str,
    ) -> Result<Self, IsolinkError> {
        let mapping_fail = |reason: String| IsolinkErrorKind::MappingFail {
            library: name.to_string(),
            reason,
        };

        let min_vaddr = directives
            .iter()
            .map(|d| page_down(d.vaddr))
            .min()
            .unwrap_or(0);
        let max_vaddr = directives
            .iter()
            .map(|d| page_up(d.vaddr + d.memsz))
            .max()
            .unwrap_or(0);
        let reserve_len = max_vaddr - min_vaddr;

        // The kernel arbitrates address-space allocation; this reservation is
        // what guarantees no collision with any other loaded instance.
        let reserve = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserve_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserve == libc::MAP_FAILED {
            return Err(mapping_fail(format!(
                "reservation of {} bytes failed: {}",
                reserve_len,
                std::io::Error::last_os_error()
            ))
            .into());
        }
        let image = Self {
            base: (reserve as usize).wrapping_sub(min_vaddr),
            reserve,
            reserve_len,
        };

        let fd = file.file.as_raw_fd();
        for dir in directives {
            image.map_directive(dir, fd).map_err(|reason| {
                // The image's Drop tears down the partial reservation.
                IsolinkError::from(mapping_fail(reason))
            })?;
        }

        let formatter = humansize::make_format(humansize::BINARY);
        debug!(
            "{}: mapped {} at {:x}",
            name,
            formatter(reserve_len as u64),
            image.base
        );
        Ok(image)
    }

    fn map_directive(&self, dir: &LoadDirective, fd: i32) -> Result<(), String> {
        let prot = dir.prot();
        let map_start = page_down(dir.vaddr);
        let file_off = page_down(dir.offset);
        let file_end = page_up(dir.vaddr + dir.filesz);
        let mem_end = page_up(dir.vaddr + dir.memsz);

        if dir.filesz > 0 {
            let addr = (self.base + map_start) as *mut c_void;
            let len = file_end - map_start;
            let mapped = unsafe {
                libc::mmap(
                    addr,
                    len,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_FIXED,
                    fd,
                    file_off as i64,
                )
            };
            if mapped != addr {
                return Err(format!(
                    "segment map at {:p} failed: {}",
                    addr,
                    std::io::Error::last_os_error()
                ));
            }
        }

        if dir.memsz > dir.filesz {
            // Clear the slice of the last file-backed page past filesz; the
            // file content there belongs to whatever came next on disk.
            let zero_start = self.base + dir.vaddr + dir.filesz;
            let zero_end = self.base + dir.vaddr + dir.memsz;
            if dir.filesz > 0 {
                let partial_end = page_up(zero_start).min(zero_end);
                unsafe {
                    std::ptr::write_bytes(
                        zero_start as *mut u8,
                        0,
                        partial_end.saturating_sub(zero_start),
                    );
                }
            }

            let anon_start = if dir.filesz > 0 { file_end } else { map_start };
            if mem_end > anon_start {
                let addr = (self.base + anon_start) as *mut c_void;
                let len = mem_end - anon_start;
                let mapped = unsafe {
                    libc::mmap(
                        addr,
                        len,
                        prot,
                        libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if mapped != addr {
                    return Err(format!(
                        "bss map at {:p} failed: {}",
                        addr,
                        std::io::Error::last_os_error()
                    ));
                }
            }
        }
        Ok(())
    }

    /// The load bias: `base + p_vaddr` yields the in-memory address for any
    /// ELF virtual address in this image.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Compute an in-memory address for an ELF virtual addr.
    pub fn laddr<T>(&self, val: u64) -> *const T {
        (self.base + val as usize) as *const T
    }

    /// Compute an in-memory address (mut) for an ELF virtual addr.
    pub fn laddr_mut<T>(&self, val: u64) -> *mut T {
        (self.base + val as usize) as *mut T
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.reserve, self.reserve_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_header() -> FileHeader<NativeEndian> {
        FileHeader {
            class: Class::ELF64,
            endianness: Default::default(),
            version: EV_CURRENT as u32,
            osabi: elf::abi::ELFOSABI_SYSV,
            abiversion: 0,
            e_type: ET_DYN,
            e_machine: arch::EM_EXPECTED,
            e_entry: 0,
            e_phoff: 64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    #[test]
    fn accepts_valid_header() {
        assert!(check_header(&good_header()).is_ok());
    }

    #[test]
    fn rejects_wrong_class() {
        let mut hdr = good_header();
        hdr.class = Class::ELF32;
        assert!(matches!(
            check_header(&hdr),
            Err(HeaderError::ClassMismatch { .. })
        ));
    }

    #[test]
    fn rejects_executable_type() {
        let mut hdr = good_header();
        hdr.e_type = elf::abi::ET_EXEC;
        assert!(matches!(
            check_header(&hdr),
            Err(HeaderError::ELFTypeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_foreign_machine() {
        let mut hdr = good_header();
        hdr.e_machine = elf::abi::EM_AARCH64;
        assert!(matches!(
            check_header(&hdr),
            Err(HeaderError::MachineMismatch { .. })
        ));
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_down(0x1fff), 0x1000);
        assert_eq!(page_up(0x1001), 0x2000);
        assert_eq!(page_up(0x1000), 0x1000);
    }
}
