//! Renders compiled [`Artifacts`] as a self-contained Rust module.
//!
//! The output declares symbol constants, the decoder table in canonical order (root reference
//! first) and the two metadata tables. Nothing is written to disk here.

use std::collections::HashSet;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::catalog::MAX_ARGS;
use crate::flatten::INVALID_ENTRY;
use crate::tables::{EncodingRow, Symbol, SymbolTable, SYMBOLIC_CODE_BASE};
use crate::Artifacts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Prepended to every generated constant and static, e.g. `X86_`.
    pub symbol_prefix: String,
    pub words_per_line: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            symbol_prefix: String::new(),
            words_per_line: 8,
        }
    }
}

const ITEM_TYPES: &str = "\
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnInfo {
    pub alias: &'static str,
    pub tags: u32,
    pub valid_modes: u32,
    /// Inclusive encoding number range.
    pub encodings: Option<(u32, u32)>,
    pub arg_count: u8,
    /// Positive: fixed size in bytes. Negative: `-(n + 1)`, same size as argument `n`.
    pub arg_sizes: [i8; 4],
}

/// Argument codes: types are 1-based (0 = none); sizes are bytes or 0x100 + size class;
/// values are 0x80 default, 0x81 reg_or_mem, a literal, or 0x100 + named value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingInfo {
    pub insn: u32,
    pub op66: u8,
    pub opcode1: u16,
    pub opcode2: u16,
    pub modrm_mod: u8,
    pub regop: u8,
    pub rm: u8,
    pub fx: u8,
    pub arg_types: [u16; 4],
    pub arg_sizes: [u16; 4],
    pub arg_values: [u16; 4],
    pub tags: u32,
}
";

pub fn render_rust_module(artifacts: &Artifacts, options: &RenderOptions) -> String {
    let p = &options.symbol_prefix;
    let symbols = &artifacts.symbols;
    let mut out = String::new();
    let mut names = ConstNames::default();

    out.push_str("// @generated by optrie. Do not edit.\n\n");
    let _ = writeln!(out, "pub const {p}INVALID_ENTRY: u32 = {INVALID_ENTRY:#010x};\n");

    for sym in &symbols.instructions {
        let name = names.claim(p, "INSN_", &sym.name);
        let _ = writeln!(out, "pub const {name}: u32 = {};", sym.value);
    }
    let _ = writeln!(out, "pub const {p}INSN_COUNT: usize = {};\n", symbols.instructions.len());

    render_masks(&mut out, &mut names, p, "ITAG_", &symbols.insn_tags);
    render_masks(&mut out, &mut names, p, "ETAG_", &symbols.enc_tags);
    render_masks(&mut out, &mut names, p, "MODE_", &symbols.modes);
    render_masks(&mut out, &mut names, p, "MODE_", &symbols.mode_sets);

    render_codes(&mut out, &mut names, p, "ARGTYPE_", &symbols.arg_types, 1);
    render_codes(&mut out, &mut names, p, "ARGSIZE_", &symbols.arg_sizes, SYMBOLIC_CODE_BASE);
    render_codes(&mut out, &mut names, p, "ARGVALUE_", &symbols.arg_values, SYMBOLIC_CODE_BASE);

    let words = artifacts.table.canonical_words();
    let _ = writeln!(out, "pub static {p}DECODER_TABLE: [u32; {}] = [", words.len());
    for line in words.chunks(options.words_per_line.max(1)) {
        let row: Vec<String> = line.iter().map(|w| format!("{w:#010x},")).collect();
        let _ = writeln!(out, "    {}", row.join(" "));
    }
    out.push_str("];\n\n");

    out.push_str(ITEM_TYPES);
    out.push('\n');

    let _ = writeln!(
        out,
        "pub static {p}INSNS: [InsnInfo; {}] = [",
        artifacts.instructions.len()
    );
    for row in &artifacts.instructions {
        let encodings = match row.encodings {
            Some(range) => format!("Some(({}, {}))", range.first, range.last),
            None => "None".to_string(),
        };
        let _ = writeln!(
            out,
            "    InsnInfo {{ alias: {:?}, tags: {:#x}, valid_modes: {:#x}, encodings: {encodings}, \
             arg_count: {}, arg_sizes: {:?} }},",
            row.alias, row.tags, row.valid_modes, row.arg_count, row.arg_sizes
        );
    }
    out.push_str("];\n\n");

    let _ = writeln!(
        out,
        "pub static {p}ENCODINGS: [EncodingInfo; {}] = [",
        artifacts.encodings.len()
    );
    for row in &artifacts.encodings {
        let (types, sizes, values) = arg_codes(symbols, row);
        let packed = row.packed;
        let _ = writeln!(
            out,
            "    EncodingInfo {{ insn: {}, op66: {}, opcode1: {:#x}, opcode2: {:#x}, modrm_mod: {}, \
             regop: {}, rm: {}, fx: {}, arg_types: {types:?}, arg_sizes: {sizes:?}, \
             arg_values: {values:?}, tags: {:#x} }},",
            row.insn,
            packed.op66,
            packed.opcode1,
            packed.opcode2,
            packed.mode,
            packed.regop,
            packed.rm,
            packed.fx,
            row.tags
        );
    }
    out.push_str("];\n");

    out
}

type ArgCodes = [u16; MAX_ARGS];

fn arg_codes(symbols: &SymbolTable, row: &EncodingRow) -> (ArgCodes, ArgCodes, ArgCodes) {
    let mut types = [0; MAX_ARGS];
    let mut sizes = [0; MAX_ARGS];
    let mut values = [0; MAX_ARGS];
    for (i, arg) in row.args.iter().enumerate() {
        types[i] = symbols.arg_type_code(&arg.arg_type).unwrap_or(0);
        sizes[i] = symbols.arg_size_code(&arg.size).unwrap_or(0);
        values[i] = symbols.arg_value_code(&arg.value).unwrap_or(0);
    }
    (types, sizes, values)
}

fn render_masks(out: &mut String, names: &mut ConstNames, p: &str, class: &str, syms: &[Symbol]) {
    for sym in syms {
        let name = names.claim(p, class, &sym.name);
        let _ = writeln!(out, "pub const {name}: u32 = {:#010x};", sym.value);
    }
    if !syms.is_empty() {
        out.push('\n');
    }
}

fn render_codes(
    out: &mut String,
    names: &mut ConstNames,
    p: &str,
    class: &str,
    syms: &[String],
    base: u16,
) {
    for (i, sym) in syms.iter().enumerate() {
        let name = names.claim(p, class, sym);
        let _ = writeln!(out, "pub const {name}: u16 = {:#x};", base + i as u16);
    }
    if !syms.is_empty() {
        out.push('\n');
    }
}

/// Hands out unique upper-case constant names.
#[derive(Default)]
struct ConstNames {
    taken: HashSet<String>,
}

impl ConstNames {
    /// `class` is dropped from the front of `raw` when the name already carries it (so
    /// `etag_reg_base` renders as `ETAG_REG_BASE`). Clashes after sanitizing get a numeric
    /// suffix.
    fn claim(&mut self, prefix: &str, class: &str, raw: &str) -> String {
        let mut ident: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        if !ident.starts_with(class) {
            ident.insert_str(0, class);
        }

        let base = format!("{prefix}{ident}");
        let mut name = base.clone();
        let mut n = 2;
        while !self.taken.insert(name.clone()) {
            name = format!("{base}_{n}");
            n += 1;
        }
        name
    }
}
