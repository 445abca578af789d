//! Per-instruction and per-encoding metadata rows, and the exported symbol sets.

use serde::Serialize;

use crate::catalog::{parse_fixed_size, ArgValue, Catalog, EncodingArg, MAX_ARGS};
use crate::opcode::{OpcodeDescriptor, PackedOpcode};
use crate::tags::TagRegistry;

/// Inclusive range of encoding numbers owned by one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncodingRange {
    pub first: u32,
    pub last: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionRow {
    pub alias: String,
    pub tags: u32,
    pub valid_modes: u32,
    /// `None` when the instruction has no encodings.
    pub encodings: Option<EncodingRange>,
    pub arg_count: u8,
    /// Size code per argument; unused positions are 0.
    pub arg_sizes: [i8; MAX_ARGS],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodingRow {
    pub insn: u32,
    pub descriptor: OpcodeDescriptor,
    pub packed: PackedOpcode,
    pub args: Vec<EncodingArg>,
    pub tags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub value: u32,
}

impl Symbol {
    fn new(name: &str, value: u32) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SymbolTable {
    /// Alias → instruction index.
    pub instructions: Vec<Symbol>,
    /// Name → mask for each bit class.
    pub insn_tags: Vec<Symbol>,
    pub enc_tags: Vec<Symbol>,
    pub modes: Vec<Symbol>,
    pub mode_sets: Vec<Symbol>,
    pub arg_types: Vec<String>,
    pub arg_sizes: Vec<String>,
    pub arg_values: Vec<String>,
}

/// Base of the codes assigned to size classes and named values.
pub const SYMBOLIC_CODE_BASE: u16 = 0x100;

impl SymbolTable {
    /// 1-based position of an argument type; 0 is reserved for "no argument".
    pub fn arg_type_code(&self, name: &str) -> Option<u16> {
        position(&self.arg_types, name).map(|i| i + 1)
    }

    /// Fixed `B<n>` sizes map to `n`; size classes to `SYMBOLIC_CODE_BASE + index`.
    pub fn arg_size_code(&self, size: &str) -> Option<u16> {
        match parse_fixed_size(size) {
            Some(bytes) => Some(u16::from(bytes)),
            None => position(&self.arg_sizes, size).map(|i| SYMBOLIC_CODE_BASE + i),
        }
    }

    /// The byte code of [`ArgValue::code`], or `SYMBOLIC_CODE_BASE + index` for named values.
    pub fn arg_value_code(&self, value: &ArgValue) -> Option<u16> {
        match value {
            ArgValue::Named(name) => position(&self.arg_values, name).map(|i| SYMBOLIC_CODE_BASE + i),
            other => other.code().map(u16::from),
        }
    }
}

fn position(names: &[String], name: &str) -> Option<u16> {
    names.iter().position(|n| n == name).map(|i| i as u16)
}

pub fn instruction_rows(catalog: &Catalog, ranges: &[Option<EncodingRange>]) -> Vec<InstructionRow> {
    catalog
        .instructions()
        .iter()
        .zip(ranges)
        .map(|(insn, range)| {
            let mut arg_sizes = [0i8; MAX_ARGS];
            for (index, arg) in insn.args.iter().enumerate() {
                arg_sizes[index] = arg.size.code(index);
            }
            InstructionRow {
                alias: insn.alias.clone(),
                tags: insn.tags.bits(),
                valid_modes: insn.valid_modes,
                encodings: *range,
                arg_count: insn.args.len() as u8,
                arg_sizes,
            }
        })
        .collect()
}

/// `descriptors[n]` must be the parsed opcode of encoding `n`.
pub fn encoding_rows(catalog: &Catalog, descriptors: &[OpcodeDescriptor]) -> Vec<EncodingRow> {
    catalog
        .encodings()
        .iter()
        .zip(descriptors)
        .map(|(enc, desc)| EncodingRow {
            insn: enc.insn.0,
            descriptor: *desc,
            packed: desc.packed(),
            args: enc.args.clone(),
            tags: enc.tags.bits(),
        })
        .collect()
}

pub fn symbol_table(catalog: &Catalog) -> SymbolTable {
    let registries = catalog.registries();
    let symbols = catalog.arg_symbols();

    SymbolTable {
        instructions: catalog
            .instructions()
            .iter()
            .enumerate()
            .map(|(index, insn)| Symbol::new(&insn.alias, index as u32))
            .collect(),
        insn_tags: masks(&registries.insn_tags),
        enc_tags: masks(&registries.enc_tags),
        modes: masks(registries.modes.core()),
        mode_sets: registries
            .modes
            .sets()
            .map(|(name, mask)| Symbol::new(name, mask))
            .collect(),
        arg_types: symbols.types.clone(),
        arg_sizes: symbols.sizes.clone(),
        arg_values: symbols.values.clone(),
    }
}

fn masks(registry: &TagRegistry) -> Vec<Symbol> {
    registry
        .iter()
        .map(|(name, bit)| Symbol::new(name, bit.mask()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ArgValueSource, CatalogBuilder, EncodingDecl, InstructionDecl};

    #[test]
    fn rows_carry_size_codes_and_ranges() {
        let mut builder = CatalogBuilder::new();
        builder.declare_mode("prot").unwrap();
        builder
            .add_instruction(
                InstructionDecl::new("mov")
                    .tag("itag_move")
                    .mode("prot")
                    .arg("dst", "osz")
                    .arg("src", "osz")
                    .encoding(
                        EncodingDecl::new("89 /r")
                            .arg("rm", "osz", Some(ArgValueSource::Name("reg_or_mem".into())))
                            .arg("reg", "osz", None),
                    ),
            )
            .unwrap();
        builder.add_instruction(InstructionDecl::new("nothing")).unwrap();
        let catalog = builder.build();

        let rows = instruction_rows(&catalog, &[Some(EncodingRange { first: 0, last: 0 }), None]);
        assert_eq!(rows[0].arg_count, 2);
        assert_eq!(rows[0].arg_sizes, [-1, -1, 0, 0]);
        assert_eq!((rows[0].tags, rows[0].valid_modes), (1, 1));
        assert_eq!(rows[1].encodings, None);

        let symbols = symbol_table(&catalog);
        assert_eq!(symbols.instructions[1], Symbol::new("nothing", 1));
        assert_eq!(symbols.arg_types, ["rm", "reg"]);
        assert_eq!(symbols.arg_sizes, ["osz"]);
        assert!(symbols.arg_values.is_empty());
        assert_eq!(symbols.arg_type_code("reg"), Some(2));
        assert_eq!(symbols.arg_size_code("B4"), Some(4));
        assert_eq!(symbols.arg_size_code("osz"), Some(SYMBOLIC_CODE_BASE));
        assert_eq!(symbols.arg_value_code(&ArgValue::RegOrMem), Some(0x81));
        assert_eq!(symbols.arg_value_code(&ArgValue::Named("al".into())), None);
    }
}
