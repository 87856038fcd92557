//! Goblin-based ELF loading.
//!
//! Produces the fixed [`Elf`] descriptor the rest of the driver works
//! against: the raw image, the `.text` window, the free-region watermark
//! used to place secondary ELFs, and the dynamic symbols needed to resolve
//! `--start`/`--end` positions.

use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::header::{EM_X86_64, ET_DYN};
use goblin::elf::program_header::PT_LOAD;

use crate::{Error, Result, PAGE_SIZE};

/// One dynamic symbol of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynSym {
    pub name: String,
    pub addr: u64,
}

/// Parsed ELF descriptor.
///
/// `text_addr` and the symbol addresses include the load `base`;
/// `free_addr` is the page-aligned end of the load image relative to the
/// base, i.e. the size of the region the file occupies once mapped.
#[derive(Debug)]
pub struct Elf {
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub base: u64,
    pub text_offset: u64,
    pub text_addr: u64,
    pub text_size: u64,
    pub free_addr: u64,
    pub dso: bool,
    pub dynsyms: Vec<DynSym>,
}

impl Elf {
    /// Parse an x86-64 ELF file as if mapped at `base`.
    pub fn parse<P: AsRef<Path>>(path: P, base: u64) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            Error::Load(format!("ELF file \"{}\": {}", path.display(), e))
        })?;
        let elf = goblin::elf::Elf::parse(&data).map_err(|e| {
            Error::Load(format!("ELF file \"{}\": {}", path.display(), e))
        })?;

        if elf.header.e_machine != EM_X86_64 {
            return Err(Error::Load(format!(
                "ELF file \"{}\": not an x86-64 binary",
                path.display()
            )));
        }

        let mut text = None;
        for sh in &elf.section_headers {
            if elf.shdr_strtab.get_at(sh.sh_name) == Some(".text") {
                text = Some((sh.sh_offset, sh.sh_addr, sh.sh_size));
                break;
            }
        }
        let (text_offset, text_vaddr, text_size) = text.ok_or_else(|| {
            Error::Load(format!(
                "ELF file \"{}\": missing (.text) section",
                path.display()
            ))
        })?;

        let mut image_end = 0u64;
        for ph in &elf.program_headers {
            if ph.p_type == PT_LOAD {
                image_end = image_end.max(ph.p_vaddr + ph.p_memsz);
            }
        }
        let free_addr = align_up(image_end, PAGE_SIZE);

        let mut dynsyms = Vec::new();
        for sym in elf.dynsyms.iter() {
            if sym.st_name == 0 {
                continue;
            }
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                dynsyms.push(DynSym {
                    name: name.to_string(),
                    addr: base + sym.st_value,
                });
            }
        }

        let dso = elf.header.e_type == ET_DYN;

        Ok(Elf {
            path: path.to_path_buf(),
            data,
            base,
            text_offset,
            text_addr: base + text_vaddr,
            text_size,
            free_addr,
            dso,
            dynsyms,
        })
    }

    /// The `.text` window of the raw image.
    pub fn text(&self) -> &[u8] {
        let start = self.text_offset as usize;
        let end = start + self.text_size as usize;
        &self.data[start..end]
    }

    /// Resolve a `--start`/`--end` position string: `0x…` hex absolute,
    /// otherwise a dynamic-symbol name that must lie inside `.text`.
    pub fn resolve_position(&self, option: &str, pos: &str) -> Result<u64> {
        if let Some(hex) = pos.strip_prefix("0x") {
            return u64::from_str_radix(hex, 16).map_err(|_| {
                Error::Semantic(format!(
                    "bad value for `{}' option; invalid absolute position string \"{}\"",
                    option, pos
                ))
            });
        }
        for sym in &self.dynsyms {
            if sym.name == pos {
                if sym.addr < self.text_addr
                    || sym.addr >= self.text_addr + self.text_size
                {
                    return Err(Error::Semantic(format!(
                        "bad value for `{}' option; dynamic symbol \"{}\" points \
                         outside of the (.text) section",
                        option, pos
                    )));
                }
                return Ok(sym.addr);
            }
        }
        Err(Error::Semantic(format!(
            "bad value for `{}' option; failed to find dynamic symbol \"{}\"",
            option, pos
        )))
    }

    /// Restrict the `.text` window to begin at `addr`.
    pub fn restrict_start(&mut self, addr: u64) -> Result<()> {
        self.check_in_text("--start", addr)?;
        let off = addr - self.text_addr;
        self.text_offset += off;
        self.text_addr += off;
        self.text_size -= off;
        Ok(())
    }

    /// Restrict the `.text` window to end at `addr`.
    pub fn restrict_end(&mut self, addr: u64) -> Result<()> {
        self.check_in_text("--end", addr)?;
        self.text_size -= (self.text_addr + self.text_size) - addr;
        Ok(())
    }

    fn check_in_text(&self, option: &str, addr: u64) -> Result<()> {
        if addr < self.text_addr || addr > self.text_addr + self.text_size {
            return Err(Error::Semantic(format!(
                "bad value for `{}' option; address {:#x} lies outside of the \
                 (.text) section {:#x}..{:#x}",
                option,
                addr,
                self.text_addr,
                self.text_addr + self.text_size
            )));
        }
        Ok(())
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Default executable-vs-shared heuristic: dynamic ELFs named
/// `lib*.so[.VERSION]` are treated as shared objects, everything else as
/// an executable.
pub fn is_library_filename(path: &str) -> bool {
    let base = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    if !base.starts_with("lib") {
        return false;
    }
    match base.find(".so") {
        None => false,
        Some(idx) => {
            let rest = &base[idx + 3..];
            rest.is_empty()
                || (rest.starts_with('.')
                    && rest[1..].chars().all(|c| c.is_ascii_digit() || c == '.'))
        }
    }
}
