pub(crate) const EM_EXPECTED: u16 = elf::abi::EM_X86_64;

pub(crate) const MINIMUM_TLS_ALIGNMENT: usize = 32;

pub(crate) use elf::abi::{
    R_X86_64_64 as REL_SYMBOLIC, R_X86_64_DTPMOD64 as REL_DTPMOD,
    R_X86_64_DTPOFF64 as REL_DTPOFF, R_X86_64_GLOB_DAT as REL_GOT,
    R_X86_64_JUMP_SLOT as REL_PLT, R_X86_64_RELATIVE as REL_RELATIVE,
};

/// Name the relocation types we knowingly refuse, for error reporting.
pub(crate) fn reloc_name(r_type: u32) -> String {
    match r_type {
        elf::abi::R_X86_64_TPOFF64 => "TPOFF64 (initial-exec TLS)".to_string(),
        elf::abi::R_X86_64_TLSDESC => "TLSDESC".to_string(),
        elf::abi::R_X86_64_COPY => "COPY".to_string(),
        elf::abi::R_X86_64_IRELATIVE => "IRELATIVE".to_string(),
        other => other.to_string(),
    }
}
