// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The load pipeline: header validation, section walk, code/data/bss
//! placement, relocation, symbol resolution, entry point selection.

use std::sync::Arc;

use goblin::elf::{header, section_header, Elf};
use thiserror::Error;

use crate::host_api::HostApiTable;

const MIN_ELF_HEADER: usize = 64;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("binary is smaller than an ELF header")]
    TooSmall,
    #[error("not a valid ELF image: {0}")]
    Malformed(String),
    #[error("image is not position-independent (e_type {0}, expected ET_DYN)")]
    NotPositionIndependent(u16),
    #[error("failed to allocate {0} bytes of executable memory")]
    OutOfMemory(usize),
    #[error("app manifest requires host API version {expected}, host exposes {found}")]
    InvalidManifest { expected: u32, found: u32 },
}

impl From<LoaderError> for runtime_abi::Error {
    fn from(e: LoaderError) -> Self {
        match e {
            LoaderError::OutOfMemory(_) => runtime_abi::Error::OutOfMemory,
            LoaderError::TooSmall | LoaderError::Malformed(_) | LoaderError::NotPositionIndependent(_) => {
                runtime_abi::Error::AppInvalidManifest
            }
            LoaderError::InvalidManifest { .. } => runtime_abi::Error::AppInvalidManifest,
        }
    }
}

/// The in-memory layout this loader expects at an image's
/// `*_app_manifest` symbol: a magic word (matching the source's
/// `APP_MAGIC_NUMBER`), the host API version the image was built against,
/// the image's own version, and a length-prefixed UTF-8 name. The
/// original's `app_manifest_t` carries name/version/author fields plus
/// raw entry/exit function pointers (`app_manager.h`); those pointers are
/// redundant here since `*_app_entry`/`*_app_exit` symbol lookup already
/// resolves them, so this manifest carries only what `load` cannot get
/// any other way: the compatibility check against the host API version.
pub const MANIFEST_MAGIC: u32 = 0x4150_504B; // "APPK"

#[derive(Debug, Clone)]
pub struct AppManifest {
    pub name: String,
    pub version: u32,
    pub required_host_api_version: u32,
}

fn parse_manifest(bytes: &[u8]) -> Option<AppManifest> {
    let magic = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    if magic != MANIFEST_MAGIC {
        return None;
    }
    let required_host_api_version = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    let version = u32::from_le_bytes(bytes.get(8..12)?.try_into().ok()?);
    let name_len = u32::from_le_bytes(bytes.get(12..16)?.try_into().ok()?) as usize;
    let name = String::from_utf8_lossy(bytes.get(16..16 + name_len)?).into_owned();
    Some(AppManifest { name, version, required_host_api_version })
}

/// Opaque context handle passed to an image's entry/exit functions, mirroring
/// `app_context_t` in `app_manager.h` (an opaque forward-declared struct the
/// host controls the real layout of).
#[repr(C)]
pub struct AppContext {
    _private: (),
}

pub type AppEntryFn = unsafe extern "C" fn(*mut AppContext) -> i32;
pub type AppExitFn = unsafe extern "C" fn(*mut AppContext) -> i32;

/// A region of memory holding placed code. `base` is the address apps see
/// in relocated pointers and the entry point; on [`HeapCodeMemory`] it is
/// also the write target, modeling the "identity alias" case in
/// `spec.md` §9 — there is no separate execute-only mapping to alias
/// against on a hosted target.
pub struct CodeRegion {
    pub buffer: Box<[u8]>,
    pub base: usize,
}

impl CodeRegion {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Seam for placing executable code. A hosted process has no portable way
/// to `mprotect` a heap region executable without a platform-specific
/// dependency outside this workspace's stack (see `DESIGN.md`);
/// [`HeapCodeMemory`] is the only implementation this crate ships, but
/// callers embedding this loader in an environment with real W^X memory
/// can provide their own.
pub trait CodeMemory: Send + Sync {
    fn allocate(&self, size: usize) -> Result<CodeRegion, LoaderError>;

    /// Requests that the instruction cache observe bytes just written to
    /// `region`. A no-op where there is no separate instruction cache to
    /// coerce, as on [`HeapCodeMemory`].
    fn flush(&self, _region: &CodeRegion) {}

    fn free(&self, _region: CodeRegion) {}
}

#[derive(Default)]
pub struct HeapCodeMemory;

impl CodeMemory for HeapCodeMemory {
    fn allocate(&self, size: usize) -> Result<CodeRegion, LoaderError> {
        let buffer = vec![0u8; size].into_boxed_slice();
        let base = buffer.as_ptr() as usize;
        Ok(CodeRegion { buffer, base })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SectionMapping {
    pub elf_vaddr: u64,
    pub loaded_addr: usize,
    pub size: usize,
}

/// Relocation classification, independent of the target architecture's
/// numeric relocation type codes. Mirrors the categories the source groups
/// its Xtensa-specific constants into (`R_XTENSA_32` vs `_RELATIVE` vs
/// `_GLOB_DAT`/`_JMP_SLOT` vs `_SLOT0_OP`), generalized to the handful of
/// architectures a hosted loader can actually be asked to relocate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Write the resolved symbol address (plus addend) directly.
    Absolute,
    /// Write `load_bias + addend`; no symbol lookup needed.
    Relative,
    /// GOT-style: write the resolved data symbol's address.
    GlobalData,
    /// PLT-style: write the resolved function symbol's address.
    JumpSlot,
    /// An immediate encoded inside an instruction word rather than a
    /// whole pointer-sized slot; this loader recognizes but does not
    /// patch these (no instruction encoder for any target ISA is part of
    /// this workspace's dependency stack).
    InstructionSlot,
    Unknown(u32),
}

fn classify_relocation(machine: u16, r_type: u32) -> RelocationKind {
    use goblin::elf::reloc::*;
    match machine {
        header::EM_X86_64 => match r_type {
            R_X86_64_64 => RelocationKind::Absolute,
            R_X86_64_RELATIVE => RelocationKind::Relative,
            R_X86_64_GLOB_DAT => RelocationKind::GlobalData,
            R_X86_64_JUMP_SLOT => RelocationKind::JumpSlot,
            other => RelocationKind::Unknown(other),
        },
        header::EM_386 => match r_type {
            R_386_32 => RelocationKind::Absolute,
            R_386_RELATIVE => RelocationKind::Relative,
            R_386_GLOB_DAT => RelocationKind::GlobalData,
            R_386_JMP_SLOT => RelocationKind::JumpSlot,
            other => RelocationKind::Unknown(other),
        },
        header::EM_AARCH64 => match r_type {
            R_AARCH64_ABS64 => RelocationKind::Absolute,
            R_AARCH64_RELATIVE => RelocationKind::Relative,
            R_AARCH64_GLOB_DAT => RelocationKind::GlobalData,
            R_AARCH64_JUMP_SLOT => RelocationKind::JumpSlot,
            other => RelocationKind::Unknown(other),
        },
        header::EM_ARM => match r_type {
            R_ARM_ABS32 => RelocationKind::Absolute,
            R_ARM_RELATIVE => RelocationKind::Relative,
            R_ARM_GLOB_DAT => RelocationKind::GlobalData,
            R_ARM_JUMP_SLOT => RelocationKind::JumpSlot,
            other => RelocationKind::Unknown(other),
        },
        _ => RelocationKind::Unknown(r_type),
    }
}

fn translate(mappings: &[SectionMapping], vaddr: u64) -> Option<usize> {
    mappings.iter().find_map(|m| {
        if vaddr >= m.elf_vaddr && vaddr < m.elf_vaddr + m.size as u64 {
            Some(m.loaded_addr + (vaddr - m.elf_vaddr) as usize)
        } else {
            None
        }
    })
}

fn find_symbol_vaddr(elf: &Elf, name: &str) -> Option<u64> {
    for sym in elf.syms.iter() {
        if elf.strtab.get_at(sym.st_name) == Some(name) {
            return Some(sym.st_value);
        }
    }
    for sym in elf.dynsyms.iter() {
        if elf.dynstrtab.get_at(sym.st_name) == Some(name) {
            return Some(sym.st_value);
        }
    }
    None
}

fn resolve_symbol_address(
    elf: &Elf,
    mappings: &[SectionMapping],
    host_api: &HostApiTable,
    sym_index: usize,
    unresolved: &mut Vec<String>,
) -> Option<usize> {
    let sym = elf.dynsyms.iter().nth(sym_index)?;
    if sym.st_shndx != 0 {
        return translate(mappings, sym.st_value);
    }
    let name = elf.dynstrtab.get_at(sym.st_name)?;
    match host_api.lookup(name) {
        Some(host_sym) => Some(host_sym.address),
        None => {
            unresolved.push(name.to_string());
            None
        }
    }
}

fn patch(buf: &mut [u8], offset: usize, width: usize, value: u64) {
    if offset + width > buf.len() {
        return;
    }
    let bytes = value.to_le_bytes();
    buf[offset..offset + width].copy_from_slice(&bytes[..width]);
}

/// Result of a successful [`AppLoader::load`]. `unload` consumes this and
/// reverses every allocation it holds.
pub struct LoadedImage {
    code: CodeRegion,
    data: Vec<u8>,
    bss: Vec<u8>,
    mappings: Vec<SectionMapping>,
    entry_point: usize,
    exit_point: Option<usize>,
    manifest_ptr: Option<usize>,
    unresolved_symbols: Vec<String>,
}

impl LoadedImage {
    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn exit_point(&self) -> Option<usize> {
        self.exit_point
    }

    pub fn manifest_ptr(&self) -> Option<usize> {
        self.manifest_ptr
    }

    pub fn mappings(&self) -> &[SectionMapping] {
        &self.mappings
    }

    pub fn code_base(&self) -> usize {
        self.code.base
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn bss_size(&self) -> usize {
        self.bss.len()
    }

    pub fn unresolved_symbols(&self) -> &[String] {
        &self.unresolved_symbols
    }

    /// True if every externally-referenced symbol resolved against the
    /// host API table or an internal definition. The loader does not
    /// refuse to load an image with unresolved symbols (`spec.md` §4.10
    /// Open Question #2, resolved in `DESIGN.md`): it is this check, not
    /// `load` itself, that a caller should consult before jumping to
    /// [`Self::entry_point`].
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved_symbols.is_empty()
    }

    /// Calls the image's entry point, mirroring `app_loader.c`'s dispatch
    /// through `app_entry_fn_t`.
    ///
    /// # Safety
    /// The caller must ensure `self.code_base()` was placed by a
    /// [`CodeMemory`] implementation that maps the region executable.
    /// [`HeapCodeMemory`] does not; calling through this on a
    /// heap-backed image is undefined behavior. This exists for
    /// `CodeMemory` implementations with real W^X mapping, which this
    /// workspace does not ship.
    pub unsafe fn invoke_entry(&self, ctx: *mut AppContext) -> runtime_abi::Result<()> {
        let f: AppEntryFn = std::mem::transmute(self.entry_point as *const ());
        if f(ctx) == 0 {
            Ok(())
        } else {
            Err(runtime_abi::Error::AppContextInvalid)
        }
    }

    /// Calls the image's exit point, if one was resolved. Same safety
    /// requirements as [`Self::invoke_entry`].
    ///
    /// # Safety
    /// See [`Self::invoke_entry`].
    pub unsafe fn invoke_exit(&self, ctx: *mut AppContext) -> runtime_abi::Result<()> {
        let addr = self.exit_point.ok_or(runtime_abi::Error::AppContextInvalid)?;
        let f: AppExitFn = std::mem::transmute(addr as *const ());
        if f(ctx) == 0 {
            Ok(())
        } else {
            Err(runtime_abi::Error::AppContextInvalid)
        }
    }
}

pub struct AppLoader {
    host_api: Arc<HostApiTable>,
    code_memory: Box<dyn CodeMemory>,
}

impl AppLoader {
    pub fn new(host_api: Arc<HostApiTable>, code_memory: Box<dyn CodeMemory>) -> Self {
        Self { host_api, code_memory }
    }

    pub fn with_heap(host_api: Arc<HostApiTable>) -> Self {
        Self::new(host_api, Box::new(HeapCodeMemory))
    }

    /// Loads a position-independent image. `name` is used to look up the
    /// `{name}_app_entry` / `{name}_app_exit` / `{name}_app_manifest`
    /// convention symbols (`spec.md` §4.10); an image lacking an entry
    /// symbol falls back to the ELF header's `e_entry`, then to the base
    /// of the placed code region.
    pub fn load(&self, name: &str, binary: &[u8]) -> Result<LoadedImage, LoaderError> {
        if binary.len() < MIN_ELF_HEADER {
            return Err(LoaderError::TooSmall);
        }
        let elf = Elf::parse(binary).map_err(|e| LoaderError::Malformed(e.to_string()))?;

        if elf.header.e_type != header::ET_DYN {
            return Err(LoaderError::NotPositionIndependent(elf.header.e_type));
        }

        let mut code_size = 0usize;
        let mut data_size = 0usize;
        let mut bss_size = 0usize;
        for sh in &elf.section_headers {
            if sh.sh_flags as u32 & section_header::SHF_ALLOC == 0 {
                continue;
            }
            if sh.sh_flags as u32 & section_header::SHF_EXECINSTR != 0 {
                code_size += sh.sh_size as usize;
            } else if sh.sh_type == section_header::SHT_NOBITS {
                bss_size += sh.sh_size as usize;
            } else {
                data_size += sh.sh_size as usize;
            }
        }

        log::info!(
            "loading \"{name}\": code={code_size} data={data_size} bss={bss_size} sections={}",
            elf.section_headers.len()
        );

        let mut code = self.code_memory.allocate(code_size).map_err(|_| LoaderError::OutOfMemory(code_size))?;
        let mut data = vec![0u8; data_size];
        let mut bss = vec![0u8; bss_size];

        let code_base = code.base;
        let code_len = code.len();
        let data_base = data.as_ptr() as usize;
        let data_len = data.len();
        let bss_base = bss.as_ptr() as usize;
        let bss_len = bss.len();

        let mut mappings = Vec::with_capacity(elf.section_headers.len());
        let mut code_off = 0usize;
        let mut data_off = 0usize;
        let mut bss_off = 0usize;

        for sh in &elf.section_headers {
            if sh.sh_flags as u32 & section_header::SHF_ALLOC == 0 {
                continue;
            }
            let size = sh.sh_size as usize;

            if sh.sh_flags as u32 & section_header::SHF_EXECINSTR != 0 {
                if size > 0 {
                    let src_off = sh.sh_offset as usize;
                    code.buffer[code_off..code_off + size].copy_from_slice(&binary[src_off..src_off + size]);
                }
                mappings.push(SectionMapping { elf_vaddr: sh.sh_addr, loaded_addr: code_base + code_off, size });
                code_off += size;
            } else if sh.sh_type == section_header::SHT_NOBITS {
                mappings.push(SectionMapping { elf_vaddr: sh.sh_addr, loaded_addr: bss_base + bss_off, size });
                bss_off += size;
            } else {
                if size > 0 {
                    let src_off = sh.sh_offset as usize;
                    data[data_off..data_off + size].copy_from_slice(&binary[src_off..src_off + size]);
                }
                mappings.push(SectionMapping { elf_vaddr: sh.sh_addr, loaded_addr: data_base + data_off, size });
                data_off += size;
            }
        }

        let machine = elf.header.e_machine;
        let width = if elf.is_64 { 8 } else { 4 };
        let mut unresolved = Vec::new();

        let relocs = elf
            .dynrelas
            .iter()
            .chain(elf.dynrels.iter())
            .chain(elf.pltrelocs.iter());

        for reloc in relocs {
            let kind = classify_relocation(machine, reloc.r_type);
            let Some(loaded_addr) = translate(&mappings, reloc.r_offset) else {
                continue;
            };

            let value = match kind {
                RelocationKind::Relative => (code_base as i64 + reloc.r_addend.unwrap_or(0)) as u64,
                RelocationKind::Absolute | RelocationKind::GlobalData | RelocationKind::JumpSlot => {
                    match resolve_symbol_address(&elf, &mappings, &self.host_api, reloc.r_sym, &mut unresolved) {
                        Some(addr) => (addr as i64 + reloc.r_addend.unwrap_or(0)) as u64,
                        None => continue,
                    }
                }
                RelocationKind::InstructionSlot => {
                    log::debug!("skipping instruction-slot relocation at {:#x}", reloc.r_offset);
                    continue;
                }
                RelocationKind::Unknown(t) => {
                    log::debug!("unknown relocation type {t} at {:#x}", reloc.r_offset);
                    continue;
                }
            };

            if loaded_addr >= code_base && loaded_addr < code_base + code_len {
                patch(&mut code.buffer, loaded_addr - code_base, width, value);
            } else if loaded_addr >= data_base && loaded_addr < data_base + data_len {
                patch(&mut data, loaded_addr - data_base, width, value);
            } else if loaded_addr >= bss_base && loaded_addr < bss_base + bss_len {
                patch(&mut bss, loaded_addr - bss_base, width, value);
            }
        }

        if !unresolved.is_empty() {
            log::warn!("\"{name}\": {} unresolved external symbol(s)", unresolved.len());
        }

        self.code_memory.flush(&code);

        let entry_point = find_symbol_vaddr(&elf, &format!("{name}_app_entry"))
            .and_then(|v| translate(&mappings, v))
            .or_else(|| translate(&mappings, elf.header.e_entry))
            .unwrap_or(code_base);
        let exit_point =
            find_symbol_vaddr(&elf, &format!("{name}_app_exit")).and_then(|v| translate(&mappings, v));
        let manifest_ptr =
            find_symbol_vaddr(&elf, &format!("{name}_app_manifest")).and_then(|v| translate(&mappings, v));

        if let Some(addr) = manifest_ptr {
            if addr >= data_base && addr < data_base + data_len {
                if let Some(manifest) = parse_manifest(&data[addr - data_base..]) {
                    let host_version = self.host_api.version();
                    if manifest.required_host_api_version != host_version {
                        self.code_memory.free(code);
                        return Err(LoaderError::InvalidManifest {
                            expected: manifest.required_host_api_version,
                            found: host_version,
                        });
                    }
                    log::info!("\"{name}\": manifest \"{}\" v{}", manifest.name, manifest.version);
                }
            }
        }

        Ok(LoadedImage {
            code,
            data,
            bss,
            mappings,
            entry_point,
            exit_point,
            manifest_ptr,
            unresolved_symbols: unresolved,
        })
    }

    /// Reverses every allocation `load` made. Idempotent from the caller's
    /// perspective: `image` is consumed, so a second `unload` of the same
    /// handle cannot happen.
    pub fn unload(&self, image: LoadedImage) {
        self.code_memory.free(image.code);
    }
}
