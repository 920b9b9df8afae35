//! Object-writer round trip: populate an assembler by hand, serialize,
//! and read the image back with the `object` crate.

use capstan::asm::elf;
use capstan::isa::x64::X64;
use capstan::{Assembler, Machine, SymBinding};
use object::elf as oelf;
use object::read::elf::{ElfFile64, FileHeader, SectionHeader};
use object::{Object, ObjectSection, ObjectSymbol};

fn build(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
    let mut asm = Assembler::new(X64::target_info());
    f(&mut asm);
    asm.build_object().expect("serializes")
}

#[test]
fn minimal_object_is_well_formed() {
    let bytes = build(|_| {});
    let file = object::File::parse(&*bytes).expect("parses");
    assert_eq!(file.format(), object::BinaryFormat::Elf);
    assert_eq!(file.architecture(), object::Architecture::X86_64);
    assert!(file.section_by_name(".text").is_some());
    assert!(file.section_by_name(".eh_frame").is_some());
    assert!(file.section_by_name(".note.GNU-stack").is_some());
}

#[test]
fn locals_precede_globals_in_symtab() {
    let bytes = build(|asm| {
        let g = asm.sym_predef_func("exported", SymBinding::Global);
        let l = asm.sym_predef_func("internal", SymBinding::Local);
        let w = asm.sym_predef_func("overridable", SymBinding::Weak);
        asm.put(&[0x90; 12]);
        asm.sym_def(l, asm.text_section(), 0, 4);
        asm.sym_def(g, asm.text_section(), 4, 4);
        asm.sym_def(w, asm.text_section(), 8, 4);
    });
    let file = object::File::parse(&*bytes).unwrap();

    let mut saw_global = false;
    for sym in file.symbols() {
        if sym.is_global() {
            saw_global = true;
        } else {
            assert!(!saw_global, "local symbol after a global one");
        }
    }

    let raw: ElfFile64<object::Endianness> = ElfFile64::parse(&*bytes).unwrap();
    let endian = raw.endian();
    let sections = raw.elf_header().sections(endian, raw.data()).unwrap();
    let (symtab_idx, symtab) = sections
        .iter()
        .enumerate()
        .find(|(_, s)| s.sh_type(endian) == oelf::SHT_SYMTAB)
        .expect("symtab");
    let _ = symtab_idx;
    // sh_info is the index of the first non-local symbol.
    let first_global = symtab.sh_info(endian) as usize;
    let nlocals = file.symbols().filter(|s| s.is_local()).count();
    assert_eq!(first_global, nlocals);

    let exported = file
        .symbols()
        .find(|s| s.name() == Ok("overridable"))
        .unwrap();
    assert!(exported.is_weak());
}

#[test]
fn relocations_survive_the_round_trip() {
    let bytes = build(|asm| {
        let callee = asm.sym_add_undef("puts", SymBinding::Global);
        let f = asm.sym_predef_func("f", SymBinding::Global);
        asm.put(&[0xe8]);
        let at = asm.text_off();
        asm.put4(0);
        asm.reloc_text(callee, elf::R_X86_64_PLT32, at as u64, -4);
        asm.put(&[0xc3]);
        asm.sym_def(f, asm.text_section(), 0, 6);
    });
    let file = object::File::parse(&*bytes).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let relocs: Vec<_> = text.relocations().collect();
    assert_eq!(relocs.len(), 1);
    let (off, r) = &relocs[0];
    assert_eq!(*off, 1);
    assert_eq!(r.addend(), -4);
    assert!(matches!(
        r.flags(),
        object::RelocationFlags::Elf {
            r_type: oelf::R_X86_64_PLT32
        }
    ));
    match r.target() {
        object::RelocationTarget::Symbol(idx) => {
            assert_eq!(file.symbol_by_index(idx).unwrap().name(), Ok("puts"));
        }
        other => panic!("unexpected target {other:?}"),
    }
}

#[test]
fn data_sections_round_trip() {
    let bytes = build(|asm| {
        let ro = asm.data_section(true, false);
        let s = asm.sym_predef_data("greeting", SymBinding::Global);
        asm.sym_def_data(ro, s, b"hello\0", 1);

        let rw = asm.data_section(false, false);
        let s = asm.sym_predef_data("counter", SymBinding::Global);
        asm.sym_def_data(rw, s, &0u64.to_le_bytes(), 8);

        let bss = asm.bss_section();
        let s = asm.sym_predef_data("buffer", SymBinding::Global);
        asm.sym_def_zero(bss, s, 4096, 16);

        let relro = asm.data_section(true, true);
        let s = asm.sym_predef_data("vtable_like", SymBinding::Local);
        asm.sym_def_zero(relro, s, 16, 8);
    });
    let file = object::File::parse(&*bytes).unwrap();

    let ro = file.section_by_name(".rodata").unwrap();
    assert_eq!(ro.data().unwrap(), b"hello\0");
    assert!(file.section_by_name(".data").is_some());
    assert!(file.section_by_name(".data.rel.ro").is_some());

    let bss = file.section_by_name(".bss").unwrap();
    assert_eq!(bss.size(), 4096);
    assert_eq!(bss.data().unwrap().len(), 0);

    let buffer = file.symbols().find(|s| s.name() == Ok("buffer")).unwrap();
    assert_eq!(buffer.size(), 4096);
}

#[test]
fn tls_sections_round_trip() {
    let bytes = build(|asm| {
        let tdata = asm.tdata_section();
        let s = asm.sym_predef_tls("tls_init", SymBinding::Global);
        asm.sym_def_data(tdata, s, &42u64.to_le_bytes(), 8);
        let tbss = asm.tbss_section();
        let s = asm.sym_predef_tls("tls_zero", SymBinding::Global);
        asm.sym_def_zero(tbss, s, 8, 8);
    });
    let raw: ElfFile64<object::Endianness> = ElfFile64::parse(&*bytes).unwrap();
    let endian = raw.endian();
    let sections = raw.elf_header().sections(endian, raw.data()).unwrap();
    let mut tls_flags = 0;
    for s in sections.iter() {
        if s.sh_flags(endian) & u64::from(oelf::SHF_TLS) != 0 {
            tls_flags += 1;
        }
    }
    assert_eq!(tls_flags, 2);

    let file = object::File::parse(&*bytes).unwrap();
    let sym = file.symbols().find(|s| s.name() == Ok("tls_init")).unwrap();
    assert_eq!(sym.kind(), object::SymbolKind::Tls);
}

#[test]
fn comdat_group_round_trip() {
    let bytes = build(|asm| {
        let sig = asm.sym_predef_func("inline_helper", SymBinding::Weak);
        let group = asm.create_group_section(sig, true);
        let sec = asm.create_section(
            ".text.inline_helper",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            16,
            Some(group),
        );
        asm.section_mut(sec).data.extend_from_slice(&[0x90, 0xc3]);
        asm.sym_def(sig, sec, 0, 2);
    });
    let raw: ElfFile64<object::Endianness> = ElfFile64::parse(&*bytes).unwrap();
    let endian = raw.endian();
    let sections = raw.elf_header().sections(endian, raw.data()).unwrap();
    let group = sections
        .iter()
        .find(|s| s.sh_type(endian) == oelf::SHT_GROUP)
        .expect("group section");
    let data = group.data(endian, raw.data()).unwrap();
    let words: Vec<u32> = data
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(words[0], oelf::GRP_COMDAT);
    // One member section, carrying the group flag.
    assert_eq!(words.len(), 2);
    let member = sections.iter().nth(words[1] as usize).unwrap();
    assert_ne!(member.sh_flags(endian) & u64::from(oelf::SHF_GROUP), 0);
}

#[test]
fn structor_sections_round_trip() {
    let bytes = build(|asm| {
        let ctor = asm.sym_predef_func("setup", SymBinding::Local);
        asm.put(&[0xc3]);
        asm.sym_def(ctor, asm.text_section(), 0, 1);
        let init = asm.create_structor_section(true, None);
        asm.section_mut(init).data.extend_from_slice(&[0; 8]);
        let abs = asm.target().reloc_abs64;
        asm.reloc(init, ctor, abs, 0, 0);
    });
    let file = object::File::parse(&*bytes).unwrap();
    let init = file.section_by_name(".init_array").unwrap();
    assert_eq!(init.size(), 8);
    assert_eq!(init.relocations().count(), 1);
}
