// Shared test helpers (integration tests compile as separate crates, so put
// common code in a submodule to avoid it becoming its own test target).
#![allow(dead_code)]

use optrie::{
    compile, encoding_keys, Artifacts, Catalog, CatalogBuilder, CompileOptions, DecodeKey,
    EncodingDecl, InstructionDecl, KeyFlags, OpcodeDescriptor, Result,
};

/// Installs a fmt subscriber filtered by `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {path}: {e}"))
}

/// One instruction per `(alias, opcode, etags)` entry.
pub fn catalog(entries: &[(&str, &str, &[&str])]) -> Result<Catalog> {
    let mut builder = CatalogBuilder::new();
    for (alias, opcode, tags) in entries {
        let mut enc = EncodingDecl::new(opcode);
        for tag in *tags {
            enc = enc.tag(tag);
        }
        builder.add_instruction(InstructionDecl::new(alias).encoding(enc))?;
    }
    Ok(builder.build())
}

pub fn compile_entries(entries: &[(&str, &str, &[&str])]) -> Result<Artifacts> {
    init_tracing();
    compile(&catalog(entries)?, &CompileOptions::default())
}

/// Key flags an encoding gets from its tags under `options`.
pub fn key_flags(catalog: &Catalog, number: u32, options: &CompileOptions) -> KeyFlags {
    let tags = catalog.encoding(number).tags;
    let has = |name: &str| {
        catalog
            .registries()
            .enc_tags
            .get(name)
            .is_some_and(|bit| tags.contains(bit))
    };
    KeyFlags {
        reg_in_opcode: has(&options.reg_in_opcode_tag),
        rex_w: if has(&options.rexw_set_tag) {
            Some(true)
        } else if has(&options.rexw_clear_tag) {
            Some(false)
        } else {
            None
        },
    }
}

/// Every concrete key of every encoding, paired with the encoding number.
pub fn all_keys(catalog: &Catalog, options: &CompileOptions) -> Vec<(u32, DecodeKey)> {
    let mut keys = Vec::new();
    for enc in catalog.encodings() {
        let desc = OpcodeDescriptor::parse(&enc.opcode).expect("catalog opcode parses");
        for key in encoding_keys(&desc, key_flags(catalog, enc.number, options)) {
            keys.push((enc.number, key));
        }
    }
    keys
}
