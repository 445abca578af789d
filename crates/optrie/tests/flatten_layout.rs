mod common;

use common::compile_entries;
use optrie::{compile, CompileOptions, Entry, FlatTable, NodeKind, TableRef, INVALID_ENTRY};
use pretty_assertions::assert_eq;

fn kind_of(word: u32) -> u32 {
    word >> 24
}

#[test]
fn root_word_leads_canonical_form_and_trails_emission() {
    let artifacts = compile_entries(&[("nop", "90", &[])]).unwrap();
    let table = &artifacts.table;

    assert_eq!(table.root(), TableRef { kind: NodeKind::Opcode, offset: 0 });
    assert_eq!(table.body().len(), 256);

    let canonical = table.canonical_words();
    assert_eq!(canonical[0], 0x0100_0000);
    assert_eq!(canonical[1 + 0x90], 0);
    assert_eq!(canonical[1 + 0x91], INVALID_ENTRY);

    let emitted = table.emission_order();
    assert_eq!(emitted.last(), Some(&0x0100_0000));
    assert_eq!(&emitted[..256], table.body());
}

#[test]
fn collapsed_modrm_becomes_reg_only_table() {
    let artifacts = compile_entries(&[("add", "00 /r", &[])]).unwrap();
    let table = &artifacts.table;
    assert_eq!(table.body().len(), 8 + 256);
    assert_eq!(&table.body()[..8], &[0u32; 8]);
    assert_eq!(table.root(), TableRef { kind: NodeKind::Opcode, offset: 8 });
    assert_eq!(table.body()[8], 0x0400_0000);
    assert_eq!(table.canonical_words()[0], 0x0100_0008);
}

#[test]
fn collapse_can_be_switched_off() {
    common::init_tracing();
    let catalog = common::catalog(&[("add", "00 /r", &[])]).unwrap();
    let options = CompileOptions {
        collapse_modrm: false,
        ..CompileOptions::default()
    };
    let table = compile(&catalog, &options).unwrap().table;
    assert_eq!(table.body().len(), 32 + 256);
    assert_eq!(table.body()[32], 0x0300_0000);
    assert_eq!(table.root().offset, 32);
}

#[test]
fn mode_specific_entries_keep_the_modrm_table() {
    let artifacts =
        compile_entries(&[("fld", "d9 /0 /mod_m", &[]), ("fld_st", "d9 /0 /mod_3", &[])])
            .unwrap();
    let table = &artifacts.table;
    let root = table.root();
    let Some(Entry::Table(modrm)) = table.entry(root, 0xd9) else {
        panic!("expected a table under d9");
    };
    assert_eq!(modrm.kind, NodeKind::ModRm);
    assert_eq!(table.entry(modrm, 0), Some(Entry::Encoding(0)));
    assert_eq!(table.entry(modrm, 8 * 3), Some(Entry::Encoding(1)));
    assert_eq!(table.entry(modrm, 1), Some(Entry::Invalid));
}

#[test]
fn shared_child_is_emitted_once() {
    let artifacts = compile_entries(&[("sgdt_like", "0f 01 /2 /rm_1", &[])]).unwrap();
    let body = artifacts.table.body();

    // r/m table, reg-only table, 0f table, root.
    assert_eq!(body.len(), 8 + 8 + 256 + 256);
    assert_eq!(body[1], 0);
    assert_eq!(body[8 + 2], 0x0500_0000);
    assert_eq!(body[16 + 0x01], 0x0400_0008);
    assert_eq!(body[272 + 0x0f], 0x0100_0010);
    assert_eq!(artifacts.table.root().offset, 272);
}

#[test]
fn references_always_point_backwards() {
    common::init_tracing();
    let catalog = optrie::Catalog::from_json(&common::fixture("mini_x86.json")).unwrap();
    for collapse_modrm in [true, false] {
        let options = CompileOptions {
            collapse_modrm,
            ..CompileOptions::default()
        };
        let table = compile(&catalog, &options).unwrap().table;
        for (index, &word) in table.body().iter().enumerate() {
            if let Some(Entry::Table(child)) = Entry::unpack(word) {
                let end = child.offset as usize + child.kind.slot_count();
                assert!(end <= index, "word {index} ({word:#010x}) points forward");
            } else {
                assert!(kind_of(word) == 0, "word {index} ({word:#010x}) is malformed");
            }
        }
        let root = table.root();
        assert_eq!(root.offset as usize + 256, table.body().len());
    }
}

#[test]
fn canonical_words_read_back() {
    let artifacts = compile_entries(&[("add", "00 /r", &[]), ("push", "50", &["etag_reg_base"])])
        .unwrap();
    let words = artifacts.table.canonical_words();
    let back = FlatTable::from_canonical(&words).expect("well-formed table");
    assert_eq!(back, artifacts.table);
}

#[test]
fn compilation_is_deterministic() {
    common::init_tracing();
    let json = common::fixture("mini_x86.json");
    let first = compile(
        &optrie::Catalog::from_json(&json).unwrap(),
        &CompileOptions::default(),
    )
    .unwrap();
    let second = compile(
        &optrie::Catalog::from_json(&json).unwrap(),
        &CompileOptions::default(),
    )
    .unwrap();
    assert_eq!(first.table.canonical_words(), second.table.canonical_words());
    assert_eq!(first, second);
}
