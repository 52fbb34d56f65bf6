//! Relocation processing for a freshly mapped image.
//!
//! x86-64 shared objects carry RELA-form tables only (DT_RELA plus DT_JMPREL);
//! a REL-form table is refused rather than guessed at. Every entry in a table
//! is processed even after a failure, so the caller gets one aggregate error
//! naming every unresolved symbol instead of the first.

use std::mem::size_of;

use elf::{
    abi::{
        DF_TEXTREL, DT_FLAGS, DT_FLAGS_1, DT_JMPREL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA,
        DT_RELAENT, DT_RELASZ, DT_TEXTREL, SHN_UNDEF, STB_WEAK,
    },
    endian::NativeEndian,
    parse::{ParseAt, ParsingIterator},
    relocation::Rela,
    string_table::StringTable,
    symbol::{Symbol, SymbolTable},
    ElfBytes,
};
use tracing::{debug, error, trace};

use crate::{
    arch::{reloc_name, REL_DTPMOD, REL_DTPOFF, REL_GOT, REL_PLT, REL_RELATIVE, REL_SYMBOLIC},
    image::MappedImage,
    provider::ProviderChain,
    tls, IsolinkError, IsolinkErrorKind,
};

// Packed relative relocations; the elf crate's abi module predates them.
const DT_RELRSZ: i64 = 35;
const DT_RELR: i64 = 36;
const DT_RELRENT: i64 = 37;

pub(crate) struct RelocCtx<'a> {
    pub name: &'a str,
    pub image: &'a MappedImage,
    pub chain: &'a ProviderChain,
    pub tls_handle: Option<usize>,
}

impl<'a> RelocCtx<'a> {
    fn get_parsing_iter<P: ParseAt>(
        &self,
        start: *const u8,
        ent: usize,
        sz: usize,
    ) -> Option<ParsingIterator<'_, NativeEndian, P>> {
        P::validate_entsize(elf::file::Class::ELF64, ent).ok()?;
        let iter = ParsingIterator::new(NativeEndian, elf::file::Class::ELF64, unsafe {
            core::slice::from_raw_parts(start, sz)
        });
        Some(iter)
    }

    fn do_reloc(
        &self,
        rela: Rela,
        strings: &StringTable,
        syms: &SymbolTable<NativeEndian>,
    ) -> Result<(), IsolinkError> {
        let addend = rela.r_addend;
        let base = self.image.base() as u64;
        let target: *mut u64 = self.image.laddr_mut(rela.r_offset);

        // Grab the symbol entry if the relocation references one.
        let symbol: Option<(&str, Symbol)> = if rela.r_sym != 0 {
            let sym = syms.get(rela.r_sym as usize)?;
            let name = strings.get(sym.st_name as usize)?;
            Some((name, sym))
        } else {
            None
        };

        // Resolve the referenced symbol to an address: locally if this image
        // defines it, otherwise through the chain in order. Weak undefined
        // symbols resolve to null; anything else unresolved is fatal.
        let resolve_addr = || -> Result<u64, IsolinkError> {
            let (name, sym) = symbol
                .as_ref()
                .ok_or_else(|| IsolinkErrorKind::MissingSection {
                    name: "symbol data".to_string(),
                })?;
            if sym.st_shndx != SHN_UNDEF {
                return Ok(base + sym.st_value);
            }
            if *name == "__tls_get_addr" {
                return Ok(tls::shim_addr() as u64);
            }
            if let Some(addr) = self.chain.resolve(name) {
                trace!("{}: resolved {} to {:x}", self.name, name, addr);
                return Ok(addr as u64);
            }
            if sym.st_bind() == STB_WEAK {
                trace!("{}: weak undefined {} resolves to null", self.name, name);
                return Ok(0);
            }
            error!("{}: needed symbol {} not found", self.name, name);
            Err(IsolinkErrorKind::SymbolLookupFail {
                symname: name.to_string(),
                sourcelib: self.name.to_string(),
            }
            .into())
        };

        // Resolve to a TLS location: this instance's own module for local
        // symbols, the chain's resolve_tls for imported ones.
        let resolve_tls = || -> Result<(usize, u64), IsolinkError> {
            match &symbol {
                Some((name, sym)) if sym.st_shndx == SHN_UNDEF => {
                    let desc = self.chain.resolve_tls(name).ok_or_else(|| {
                        error!("{}: needed TLS symbol {} not found", self.name, name);
                        IsolinkError::from(IsolinkErrorKind::SymbolLookupFail {
                            symname: name.to_string(),
                            sourcelib: self.name.to_string(),
                        })
                    })?;
                    Ok((desc.module, desc.offset as u64))
                }
                other => {
                    let offset = other.as_ref().map(|(_, sym)| sym.st_value).unwrap_or(0);
                    let module = self
                        .tls_handle
                        .ok_or_else(|| IsolinkErrorKind::NoTLSInfo {
                            library: self.name.to_string(),
                        })?;
                    Ok((module, offset))
                }
            }
        };

        match rela.r_type {
            REL_RELATIVE => unsafe { *target = base.wrapping_add_signed(addend) },
            REL_SYMBOLIC => unsafe { *target = resolve_addr()?.wrapping_add_signed(addend) },
            REL_PLT | REL_GOT => unsafe { *target = resolve_addr()? },
            REL_DTPMOD => {
                let (module, _) = resolve_tls()?;
                unsafe { *target = module as u64 }
            }
            REL_DTPOFF => {
                let (_, offset) = resolve_tls()?;
                unsafe { *target = offset.wrapping_add_signed(addend) }
            }
            other => {
                error!("{}: unsupported relocation: {}", self.name, other);
                Err(IsolinkError::from(IsolinkErrorKind::UnsupportedReloc {
                    library: self.name.to_string(),
                    reloc: reloc_name(other),
                }))?
            }
        }

        Ok(())
    }

    fn process_relas(
        &self,
        start: *const u8,
        ent: usize,
        sz: usize,
        secname: &str,
        strings: &StringTable,
        syms: &SymbolTable<NativeEndian>,
    ) -> Result<(), IsolinkError> {
        debug!(
            "{}: processing {} relocations (num = {})",
            self.name,
            secname,
            sz / ent
        );
        let relas: ParsingIterator<'_, NativeEndian, Rela> = self
            .get_parsing_iter(start, ent, sz)
            .ok_or_else(|| IsolinkErrorKind::UnsupportedReloc {
                library: self.name.to_string(),
                reloc: format!("'{}' with entsz {}, size {}", secname, ent, sz),
            })?;
        IsolinkError::collect(
            IsolinkErrorKind::RelocationSectionFail {
                secname: secname.to_string(),
                library: self.name.to_string(),
            },
            relas.map(|rela| self.do_reloc(rela, strings, syms)),
        )?;
        Ok(())
    }

    /// Apply a DT_RELR table. Every decoded address names a slot whose
    /// link-time value gets the load bias added (the addend is in place).
    fn process_relr(&self, start: *const u8, sz: usize) -> Result<(), IsolinkError> {
        if sz % size_of::<u64>() != 0 {
            return Err(IsolinkErrorKind::UnsupportedReloc {
                library: self.name.to_string(),
                reloc: format!("RELR table with size {}", sz),
            }
            .into());
        }
        let count = sz / size_of::<u64>();
        debug!("{}: processing RELR relocations (num = {})", self.name, count);
        let base = self.image.base() as u64;
        let entries = unsafe { core::slice::from_raw_parts(start as *const u64, count) };
        for vaddr in expand_relr(entries) {
            let target: *mut u64 = self.image.laddr_mut(vaddr);
            unsafe { *target = (*target).wrapping_add(base) };
        }
        Ok(())
    }

    /// Walk the dynamic table's relocation sections and apply each entry.
    pub fn relocate(&self, elf: &ElfBytes<'_, NativeEndian>) -> Result<(), IsolinkError> {
        debug!("{}: relocating library", self.name);
        let common = elf.find_common_data()?;
        let dynamic = common
            .dynamic
            .ok_or_else(|| IsolinkErrorKind::MissingSection {
                name: "dynamic".to_string(),
            })?;

        // Helper to lookup a single entry for a relocated pointer in the dynamic table.
        let find_dyn_entry = |tag| {
            dynamic
                .iter()
                .find(|d| d.d_tag == tag)
                .map(|d| self.image.laddr::<u8>(d.d_ptr()))
        };

        // Helper to lookup a single value in the dynamic table.
        let find_dyn_value = |tag| dynamic.iter().find(|d| d.d_tag == tag).map(|d| d.d_val());

        let find_dyn_rels = |tag, ent, sz| {
            let rel = find_dyn_entry(tag);
            let relent = find_dyn_value(ent);
            let relsz = find_dyn_value(sz);
            if let (Some(rel), Some(relent), Some(relsz)) = (rel, relent, relsz) {
                Some((rel, relent, relsz))
            } else {
                None
            }
        };

        let flags = find_dyn_value(DT_FLAGS);
        let flags_1 = find_dyn_value(DT_FLAGS_1);
        // Text relocations may be signaled by the flag or, in older
        // objects, by a bare DT_TEXTREL tag.
        let textrel = flags.is_some_and(|f| f as i64 & DF_TEXTREL != 0)
            || dynamic.iter().any(|d| d.d_tag == DT_TEXTREL);
        if textrel {
            error!("{}: relocations within text not supported", self.name);
            return Err(IsolinkErrorKind::UnsupportedReloc {
                library: self.name.to_string(),
                reloc: "DF_TEXTREL".to_string(),
            }
            .into());
        }
        debug!("{}: relocation flags: {:?} {:?}", self.name, flags, flags_1);

        if find_dyn_value(DT_REL).is_some() {
            return Err(IsolinkErrorKind::UnsupportedReloc {
                library: self.name.to_string(),
                reloc: "REL-form table".to_string(),
            }
            .into());
        }

        let relas = find_dyn_rels(DT_RELA, DT_RELAENT, DT_RELASZ);
        let jmprels = find_dyn_rels(DT_JMPREL, DT_PLTREL, DT_PLTRELSZ);

        if let (Some(relr), Some(relrsz)) = (find_dyn_entry(DT_RELR), find_dyn_value(DT_RELRSZ)) {
            if let Some(ent) = find_dyn_value(DT_RELRENT) {
                if ent as usize != size_of::<u64>() {
                    return Err(IsolinkErrorKind::UnsupportedReloc {
                        library: self.name.to_string(),
                        reloc: format!("RELR entry size {}", ent),
                    }
                    .into());
                }
            }
            self.process_relr(relr, relrsz as usize)?;
        }

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

        if let Some((rela, ent, sz)) = relas {
            self.process_relas(
                rela,
                ent as usize,
                sz as usize,
                "RELA",
                &dynsyms_str,
                &dynsyms,
            )?;
        }

        // The PLT table carries a relocation kind instead of an entry size.
        if let Some((rel, kind, sz)) = jmprels {
            if kind as i64 != DT_RELA {
                error!("{}: unsupported PLTREL kind {}", self.name, kind);
                return Err(IsolinkErrorKind::UnsupportedReloc {
                    library: self.name.to_string(),
                    reloc: "REL-form PLT table".to_string(),
                }
                .into());
            }
            let ent = 3 * size_of::<usize>();
            self.process_relas(rel, ent, sz as usize, "JMPREL", &dynsyms_str, &dynsyms)?;
        }

        Ok(())
    }
}

/// Expand a RELR table into the virtual addresses it covers. An even entry
/// is an address; an odd entry is a bitmap whose bits 1..64 select among the
/// 63 words following the last address.
fn expand_relr(entries: &[u64]) -> Vec<u64> {
    const WORD: u64 = size_of::<u64>() as u64;
    let mut out = Vec::new();
    let mut next: u64 = 0;
    for &entry in entries {
        if entry & 1 == 0 {
            out.push(entry);
            next = entry + WORD;
        } else {
            let mut bits = entry >> 1;
            let mut vaddr = next;
            while bits != 0 {
                if bits & 1 != 0 {
                    out.push(vaddr);
                }
                vaddr += WORD;
                bits >>= 1;
            }
            next += (u64::BITS as u64 - 1) * WORD;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relr_address_entries_decode_in_order() {
        assert_eq!(expand_relr(&[0x1000, 0x2020]), vec![0x1000, 0x2020]);
    }

    #[test]
    fn relr_bitmap_covers_words_after_the_address() {
        // 0x1000 itself, then the bitmap's bits 1 and 3 select the first
        // and third of the following words.
        let bitmap = 1 | (1 << 1) | (1 << 3);
        assert_eq!(
            expand_relr(&[0x1000, bitmap]),
            vec![0x1000, 0x1008, 0x1018]
        );
    }

    #[test]
    fn relr_consecutive_bitmaps_advance_by_63_words() {
        // Two all-odd entries after an address cover two back-to-back
        // 63-word windows.
        let first = 1 | (1 << 63);
        let second = 1 | (1 << 1);
        let expanded = expand_relr(&[0x1000, first, second]);
        assert_eq!(expanded, vec![0x1000, 0x1000 + 63 * 8, 0x1000 + 64 * 8]);
    }
}
