//! Compiles a catalog of x86-style instruction encodings into a flat decoder table.
//!
//! [`compile`] parses each encoding's opcode tokens, inserts every encoding into one shared decode
//! trie (rejecting any two encodings that would answer to the same bytes), and serializes the trie
//! into self-relative `u32` words together with per-instruction and per-encoding metadata rows.
//!
//! ```
//! use optrie::{compile, Catalog, CompileOptions, DecodeKey};
//!
//! let catalog = Catalog::from_json(
//!     r#"{ "instructions": [
//!         { "alias": "nop", "encodings": [{ "opcode": "90" }] },
//!         { "alias": "push", "encodings": [{ "opcode": "50", "tags": ["etag_reg_base"] }] }
//!     ] }"#,
//! )
//! .unwrap();
//!
//! let artifacts = compile(&catalog, &CompileOptions::default()).unwrap();
//! assert_eq!(artifacts.table.lookup(&DecodeKey::new(&[0x90])), Some(0));
//! assert_eq!(artifacts.table.lookup(&DecodeKey::new(&[0x53])), Some(1));
//! assert_eq!(artifacts.table.lookup(&DecodeKey::new(&[0x91])), None);
//! ```

mod catalog;
mod config;
mod error;
mod flatten;
mod opcode;
mod render;
mod tables;
mod tags;
mod trie;
mod walk;

pub use crate::catalog::{
    ArgDecl, ArgDeclSource, ArgSize, ArgSymbols, ArgValue, ArgValueSource, Catalog,
    CatalogBuilder, CatalogSource, Encoding, EncodingArg, EncodingArgDecl, EncodingDecl, InsnId,
    Instruction, InstructionDecl, ModeSetDecl, MAX_ARGS,
};
pub use crate::config::CompileOptions;
pub use crate::error::{CompileError, Result};
pub use crate::flatten::{collapse_modrm, flatten, Entry, FlatTable, TableRef, INVALID_ENTRY};
pub use crate::opcode::{
    prefix_slot, ModeField, OpSizePrefix, OpcodeDescriptor, OpcodeMap, OpcodeSpecError,
    PackedOpcode, RegField, RepPrefix, PREFIX_SLOTS,
};
pub use crate::render::{render_rust_module, RenderOptions};
pub use crate::tables::{
    EncodingRange, EncodingRow, InstructionRow, Symbol, SymbolTable, SYMBOLIC_CODE_BASE,
};
pub use crate::tags::{
    ModeRegistry, Registries, TagBit, TagClass, TagRegistry, TagSet, MAX_TAGS_PER_CLASS,
};
pub use crate::trie::{modrm_slot, BuiltTrie, Node, NodeId, NodeKind, Slot, Trie, TrieBuilder};
pub use crate::walk::{encoding_keys, DecodeKey, KeyFlags, RepState};

use serde::Serialize;
use tracing::{debug, info, info_span};

/// Everything one compilation produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifacts {
    pub table: FlatTable,
    /// Indexed by instruction id.
    pub instructions: Vec<InstructionRow>,
    /// Indexed by encoding number.
    pub encodings: Vec<EncodingRow>,
    pub symbols: SymbolTable,
}

/// Parses and inserts every encoding in catalog order, then flattens the trie.
///
/// The first data error aborts the run; no partial artifacts are returned.
pub fn compile(catalog: &Catalog, options: &CompileOptions) -> Result<Artifacts> {
    let span = info_span!(
        "compile",
        instructions = catalog.instructions().len(),
        encodings = catalog.encodings().len()
    );
    let _enter = span.enter();

    let (built, descriptors) = build_trie(catalog, options)?;
    debug!(
        nodes = built.trie.len(),
        modrm = built.trie.count(NodeKind::ModRm),
        prefix = built.trie.count(NodeKind::Prefix),
        "decode trie built"
    );

    let table = flatten(built.trie, options.collapse_modrm);
    info!(words = table.len_words(), "decoder table ready");

    Ok(Artifacts {
        table,
        instructions: tables::instruction_rows(catalog, &built.ranges),
        encodings: tables::encoding_rows(catalog, &descriptors),
        symbols: tables::symbol_table(catalog),
    })
}

fn build_trie(
    catalog: &Catalog,
    options: &CompileOptions,
) -> Result<(BuiltTrie, Vec<OpcodeDescriptor>)> {
    let mut builder = TrieBuilder::new(catalog, options);
    let mut descriptors = Vec::with_capacity(catalog.encodings().len());

    for encoding in catalog.encodings() {
        let desc = OpcodeDescriptor::parse(&encoding.opcode).map_err(|source| {
            CompileError::MalformedOpcode {
                insn: catalog.owner_alias(encoding.number).to_string(),
                spec: encoding.opcode.clone(),
                source,
            }
        })?;
        builder.insert(encoding.number, &desc)?;
        descriptors.push(desc);
    }

    Ok((builder.finish(), descriptors))
}
