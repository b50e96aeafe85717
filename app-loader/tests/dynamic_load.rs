// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Covers the loader-mechanics half of the dynamic-load round trip
//! scenario: entry-point selection by the `*_app_entry` convention, and
//! `unload` reversing every allocation `load` made. Actually jumping to
//! the selected entry point is out of scope for this harness:
//! `HeapCodeMemory` places code in ordinary (non-executable) heap memory
//! (`spec.md` §9's "identity alias" design note), so there is nothing
//! here that could safely call through `entry_point()` as a function
//! pointer without a platform-specific executable-memory allocator this
//! workspace does not depend on.

use std::sync::Arc;

use goblin::elf::{header, section_header};

use app_loader::{AppLoader, HostApiTableBuilder};

/// Hand-assembles a minimal ELF64 shared object with one executable
/// section and a static symbol table naming a conventional entry point,
/// so the loader's section-walk, mapping-table, and entry-selection logic
/// can be exercised without a real toolchain available in this workspace.
fn build_elf_with_entry_symbol() -> Vec<u8> {
    let code_size = 16usize;
    let text_vaddr = 0x1000u64;

    let text_offset = 64usize;
    let symtab_offset = text_offset + code_size;
    let symtab_size = 24 * 2; // null entry + one real entry, 24 bytes each
    let strtab_offset = symtab_offset + symtab_size;

    let mut strtab_bytes = vec![0u8];
    strtab_bytes.extend_from_slice(b"my_app_entry\0");
    let strtab_size = strtab_bytes.len();

    let shstrtab_offset = strtab_offset + strtab_size;
    let mut shstrtab_bytes = vec![0u8];
    shstrtab_bytes.extend_from_slice(b".text\0");
    shstrtab_bytes.extend_from_slice(b".symtab\0");
    shstrtab_bytes.extend_from_slice(b".strtab\0");
    shstrtab_bytes.extend_from_slice(b".shstrtab\0");
    let shstrtab_size = shstrtab_bytes.len();

    let shoff = shstrtab_offset + shstrtab_size;
    let mut buf = vec![0u8; shoff + 64 * 5];

    buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    buf[4] = 2; // ELFCLASS64
    buf[5] = 1; // ELFDATA2LSB
    buf[6] = 1; // EV_CURRENT
    buf[16..18].copy_from_slice(&header::ET_DYN.to_le_bytes());
    buf[18..20].copy_from_slice(&header::EM_X86_64.to_le_bytes());
    buf[20..24].copy_from_slice(&1u32.to_le_bytes());
    buf[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
    buf[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    buf[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    buf[60..62].copy_from_slice(&5u16.to_le_bytes()); // e_shnum
    buf[62..64].copy_from_slice(&4u16.to_le_bytes()); // e_shstrndx

    for i in 0..code_size {
        buf[text_offset + i] = 0x90;
    }

    let sym1_off = symtab_offset + 24;
    buf[sym1_off..sym1_off + 4].copy_from_slice(&1u32.to_le_bytes()); // st_name
    buf[sym1_off + 4] = 0x12; // STB_GLOBAL << 4 | STT_FUNC
    buf[sym1_off + 6..sym1_off + 8].copy_from_slice(&1u16.to_le_bytes()); // st_shndx = .text
    buf[sym1_off + 8..sym1_off + 16].copy_from_slice(&text_vaddr.to_le_bytes()); // st_value

    buf[strtab_offset..strtab_offset + strtab_size].copy_from_slice(&strtab_bytes);
    buf[shstrtab_offset..shstrtab_offset + shstrtab_size].copy_from_slice(&shstrtab_bytes);

    let name_offset = |haystack: &[u8], name: &str| -> u32 {
        let needle = format!("{name}\0");
        haystack.windows(needle.len()).position(|w| w == needle.as_bytes()).unwrap() as u32
    };

    let write_shdr = |buf: &mut [u8],
                      index: usize,
                      name: u32,
                      ty: u32,
                      flags: u64,
                      addr: u64,
                      offset: u64,
                      size: u64,
                      link: u32,
                      info: u32| {
        let off = shoff + index * 64;
        buf[off..off + 4].copy_from_slice(&name.to_le_bytes());
        buf[off + 4..off + 8].copy_from_slice(&ty.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&flags.to_le_bytes());
        buf[off + 16..off + 24].copy_from_slice(&addr.to_le_bytes());
        buf[off + 24..off + 32].copy_from_slice(&offset.to_le_bytes());
        buf[off + 32..off + 40].copy_from_slice(&size.to_le_bytes());
        buf[off + 40..off + 44].copy_from_slice(&link.to_le_bytes());
        buf[off + 44..off + 48].copy_from_slice(&info.to_le_bytes());
        buf[off + 48..off + 56].copy_from_slice(&1u64.to_le_bytes()); // sh_addralign
        if ty == 2 {
            buf[off + 56..off + 64].copy_from_slice(&24u64.to_le_bytes()); // sh_entsize
        }
    };

    // index 0: SHT_NULL, left zeroed.
    let text_name = name_offset(&shstrtab_bytes, ".text");
    let symtab_name = name_offset(&shstrtab_bytes, ".symtab");
    let strtab_name = name_offset(&shstrtab_bytes, ".strtab");
    let shstrtab_name = name_offset(&shstrtab_bytes, ".shstrtab");

    let exec_flags = (section_header::SHF_ALLOC | section_header::SHF_EXECINSTR) as u64;
    write_shdr(&mut buf, 1, text_name, 1, exec_flags, text_vaddr, text_offset as u64, code_size as u64, 0, 0);
    write_shdr(&mut buf, 2, symtab_name, 2, 0, 0, symtab_offset as u64, symtab_size as u64, 3, 1);
    write_shdr(&mut buf, 3, strtab_name, 3, 0, 0, strtab_offset as u64, strtab_size as u64, 0, 0);
    write_shdr(&mut buf, 4, shstrtab_name, 3, 0, 0, shstrtab_offset as u64, shstrtab_size as u64, 0, 0);

    buf
}

#[test]
fn entry_point_prefers_conventional_symbol_name() {
    let bytes = build_elf_with_entry_symbol();
    let loader = AppLoader::with_heap(Arc::new(HostApiTableBuilder::new(1).build()));
    let image = loader.load("my", &bytes).unwrap();

    let text_mapping = image.mappings().iter().find(|m| m.elf_vaddr == 0x1000).unwrap();
    assert_eq!(image.entry_point(), text_mapping.loaded_addr);
    assert!(image.is_fully_resolved());
    assert_eq!(image.code_size(), 16);

    loader.unload(image);
}

#[test]
fn missing_entry_symbol_falls_back_to_code_base() {
    let bytes = build_elf_with_entry_symbol();
    let loader = AppLoader::with_heap(Arc::new(HostApiTableBuilder::new(1).build()));
    // No symbol named "other_app_entry" exists, and e_entry is 0 (unmapped),
    // so selection must fall back to the start of the placed code region.
    let image = loader.load("other", &bytes).unwrap();
    assert_eq!(image.entry_point(), image.code_base());
    loader.unload(image);
}
