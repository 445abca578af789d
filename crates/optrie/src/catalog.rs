//! The validated instruction/encoding records the compiler consumes.
//!
//! A [`Catalog`] is normally assembled by an external front end through [`CatalogBuilder`]. The
//! same records can also be read from the JSON hand-off form ([`CatalogSource`]), which is what
//! the tests and fixtures use.

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::flatten::INVALID_ENTRY;
use crate::tags::{Registries, TagBit, TagSet};

/// Maximum number of assembly-level arguments per instruction.
pub const MAX_ARGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InsnId(pub u32);

impl InsnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Size descriptor of a declared instruction argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSize {
    /// A fixed size in bytes (1..=127).
    Fixed(u8),
    /// A symbolic size class such as operand-size dependent. This argument defines it.
    Class(String),
    /// Same size as an earlier argument.
    SameAs(usize),
}

impl ArgSize {
    /// Signed size code of the instruction table. Negative codes name the argument whose size
    /// applies: `-(n + 1)` for argument `n`, where a class refers to its own argument.
    pub fn code(&self, index: usize) -> i8 {
        match self {
            ArgSize::Fixed(bytes) => *bytes as i8,
            ArgSize::Class(_) => -(index as i8 + 1),
            ArgSize::SameAs(n) => -(*n as i8 + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgDecl {
    pub name: String,
    pub size: ArgSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Default,
    RegOrMem,
    Literal(u8),
    Named(String),
}

impl ArgValue {
    pub const DEFAULT_CODE: u8 = 0x80;
    pub const REG_OR_MEM_CODE: u8 = 0x81;

    /// Byte code of the encoding table; named values are exported as symbols instead.
    pub fn code(&self) -> Option<u8> {
        match self {
            ArgValue::Default => Some(Self::DEFAULT_CODE),
            ArgValue::RegOrMem => Some(Self::REG_OR_MEM_CODE),
            ArgValue::Literal(v) => Some(*v),
            ArgValue::Named(_) => None,
        }
    }
}

/// One `(type, size, value)` argument triple of an encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodingArg {
    pub arg_type: String,
    pub size: String,
    pub value: ArgValue,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub alias: String,
    pub tags: TagSet,
    pub valid_modes: u32,
    pub args: Vec<ArgDecl>,
    /// Catalog positions of this instruction's encodings.
    pub encodings: Range<u32>,
}

#[derive(Debug, Clone)]
pub struct Encoding {
    pub insn: InsnId,
    pub number: u32,
    /// Raw opcode-token string; parsed during compilation.
    pub opcode: String,
    pub tags: TagSet,
    pub args: Vec<EncodingArg>,
}

/// Names used by encoding arguments, in order of first appearance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArgSymbols {
    pub types: Vec<String>,
    pub sizes: Vec<String>,
    pub values: Vec<String>,
}

fn note_symbol(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    registries: Registries,
    instructions: Vec<Instruction>,
    encodings: Vec<Encoding>,
    by_alias: HashMap<String, InsnId>,
    arg_symbols: ArgSymbols,
}

impl Catalog {
    pub fn from_source(source: CatalogSource) -> Result<Self> {
        let mut builder = CatalogBuilder::new();
        for mode in &source.modes {
            builder.declare_mode(mode)?;
        }
        for set in &source.mode_sets {
            builder.define_mode_set(&set.name, &set.members)?;
        }
        for insn in source.instructions {
            builder.add_instruction(insn)?;
        }
        Ok(builder.build())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let source: CatalogSource = serde_json::from_str(json)?;
        Self::from_source(source)
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction(&self, id: InsnId) -> &Instruction {
        &self.instructions[id.index()]
    }

    pub fn lookup(&self, alias: &str) -> Option<InsnId> {
        self.by_alias.get(alias).copied()
    }

    pub fn encodings(&self) -> &[Encoding] {
        &self.encodings
    }

    pub fn encoding(&self, number: u32) -> &Encoding {
        &self.encodings[number as usize]
    }

    /// Alias of the instruction owning encoding `number`.
    pub fn owner_alias(&self, number: u32) -> &str {
        &self.instruction(self.encoding(number).insn).alias
    }

    pub fn arg_symbols(&self) -> &ArgSymbols {
        &self.arg_symbols
    }
}

#[derive(Debug, Default)]
pub struct CatalogBuilder {
    registries: Registries,
    instructions: Vec<Instruction>,
    encodings: Vec<Encoding>,
    by_alias: HashMap<String, InsnId>,
    arg_symbols: ArgSymbols,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registries_mut(&mut self) -> &mut Registries {
        &mut self.registries
    }

    pub fn declare_mode(&mut self, name: &str) -> Result<TagBit> {
        self.registries.modes.declare_mode(name)
    }

    pub fn define_mode_set<S: AsRef<str>>(&mut self, name: &str, members: &[S]) -> Result<u32> {
        self.registries.modes.define_set(name, members)
    }

    /// Validates and appends one instruction together with its encodings. Encoding numbers are
    /// assigned densely in call order, so each instruction owns a contiguous block.
    pub fn add_instruction(&mut self, decl: InstructionDecl) -> Result<InsnId> {
        if self.by_alias.contains_key(&decl.alias) {
            return Err(CompileError::DuplicateInstruction(decl.alias));
        }
        if decl.args.len() > MAX_ARGS {
            return Err(CompileError::TooManyArguments {
                insn: decl.alias,
                count: decl.args.len(),
                max: MAX_ARGS,
            });
        }

        let first = self.encodings.len();
        let last = first + decl.encodings.len();
        if last > INVALID_ENTRY as usize {
            return Err(CompileError::TooManyEncodings {
                count: last,
                limit: INVALID_ENTRY,
            });
        }

        let args = resolve_arg_sizes(&decl.alias, &decl.args)?;

        let mut valid_modes = 0;
        for mode in &decl.modes {
            valid_modes |= self.registries.modes.mask_of(mode).ok_or_else(|| {
                CompileError::UnknownMode {
                    mode: mode.clone(),
                    context: decl.alias.clone(),
                }
            })?;
        }

        let tags = self.registries.insn_tags.register_all(&decl.tags)?;
        let id = InsnId(self.instructions.len() as u32);

        let mut encodings = Vec::with_capacity(decl.encodings.len());
        for (offset, enc) in decl.encodings.into_iter().enumerate() {
            if enc.args.len() != args.len() {
                return Err(CompileError::ArgumentCountMismatch {
                    insn: decl.alias,
                    spec: enc.opcode,
                    expected: args.len(),
                    found: enc.args.len(),
                });
            }

            let mut enc_args = Vec::with_capacity(enc.args.len());
            for (index, arg) in enc.args.into_iter().enumerate() {
                let value = match arg.value {
                    None => ArgValue::Default,
                    Some(ArgValueSource::Int(v)) if v <= 127 => ArgValue::Literal(v as u8),
                    Some(ArgValueSource::Int(v)) => {
                        return Err(CompileError::InvalidArgument {
                            insn: decl.alias,
                            index,
                            reason: format!("literal value {v} is outside 0..=127"),
                        })
                    }
                    Some(ArgValueSource::Name(name)) => match name.as_str() {
                        "default" => ArgValue::Default,
                        "reg_or_mem" => ArgValue::RegOrMem,
                        _ => ArgValue::Named(name),
                    },
                };
                enc_args.push(EncodingArg {
                    arg_type: arg.arg_type,
                    size: arg.size,
                    value,
                });
            }

            let tags = self.registries.enc_tags.register_all(&enc.tags)?;
            encodings.push(Encoding {
                insn: id,
                number: (first + offset) as u32,
                opcode: enc.opcode,
                tags,
                args: enc_args,
            });
        }

        for enc in &encodings {
            for arg in &enc.args {
                note_symbol(&mut self.arg_symbols.types, &arg.arg_type);
                if parse_fixed_size(&arg.size).is_none() {
                    note_symbol(&mut self.arg_symbols.sizes, &arg.size);
                }
                if let ArgValue::Named(name) = &arg.value {
                    note_symbol(&mut self.arg_symbols.values, name);
                }
            }
        }

        self.by_alias.insert(decl.alias.clone(), id);
        self.instructions.push(Instruction {
            alias: decl.alias,
            tags,
            valid_modes,
            args,
            encodings: first as u32..last as u32,
        });
        self.encodings.extend(encodings);
        Ok(id)
    }

    pub fn build(self) -> Catalog {
        Catalog {
            registries: self.registries,
            instructions: self.instructions,
            encodings: self.encodings,
            by_alias: self.by_alias,
            arg_symbols: self.arg_symbols,
        }
    }
}

/// `B<n>` sizes are fixed; anything else names a size class, and repeating a class already
/// introduced by an earlier argument refers back to it.
fn resolve_arg_sizes(alias: &str, decls: &[ArgDeclSource]) -> Result<Vec<ArgDecl>> {
    let mut args: Vec<ArgDecl> = Vec::with_capacity(decls.len());
    for (index, decl) in decls.iter().enumerate() {
        let size = if is_fixed_size_syntax(&decl.size) {
            match parse_fixed_size(&decl.size) {
                Some(bytes) => ArgSize::Fixed(bytes),
                None => {
                    return Err(CompileError::InvalidArgument {
                        insn: alias.to_string(),
                        index,
                        reason: format!("fixed size `{}` must be B1..B127", decl.size),
                    })
                }
            }
        } else {
            let earlier = args
                .iter()
                .position(|a| matches!(&a.size, ArgSize::Class(c) if *c == decl.size));
            match earlier {
                Some(n) => ArgSize::SameAs(n),
                None => ArgSize::Class(decl.size.clone()),
            }
        };
        args.push(ArgDecl {
            name: decl.name.clone(),
            size,
        });
    }
    Ok(args)
}

fn is_fixed_size_syntax(size: &str) -> bool {
    size.strip_prefix('B')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Byte count of a `B1`..`B127` size string.
pub(crate) fn parse_fixed_size(size: &str) -> Option<u8> {
    if !is_fixed_size_syntax(size) {
        return None;
    }
    match size[1..].parse::<u8>() {
        Ok(n @ 1..=127) => Some(n),
        _ => None,
    }
}

/// JSON hand-off form of a whole catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSource {
    /// Core CPU modes, one bit each, in declaration order.
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub mode_sets: Vec<ModeSetDecl>,
    #[serde(default)]
    pub instructions: Vec<InstructionDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeSetDecl {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstructionDecl {
    pub alias: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub args: Vec<ArgDeclSource>,
    #[serde(default)]
    pub encodings: Vec<EncodingDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArgDeclSource {
    pub name: String,
    pub size: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodingDecl {
    pub opcode: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub args: Vec<EncodingArgDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodingArgDecl {
    #[serde(rename = "type")]
    pub arg_type: String,
    pub size: String,
    #[serde(default)]
    pub value: Option<ArgValueSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgValueSource {
    Int(u64),
    Name(String),
}

impl InstructionDecl {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            tags: Vec::new(),
            modes: Vec::new(),
            args: Vec::new(),
            encodings: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn mode(mut self, mode: &str) -> Self {
        self.modes.push(mode.to_string());
        self
    }

    pub fn arg(mut self, name: &str, size: &str) -> Self {
        self.args.push(ArgDeclSource {
            name: name.to_string(),
            size: size.to_string(),
        });
        self
    }

    pub fn encoding(mut self, encoding: EncodingDecl) -> Self {
        self.encodings.push(encoding);
        self
    }
}

impl EncodingDecl {
    pub fn new(opcode: &str) -> Self {
        Self {
            opcode: opcode.to_string(),
            tags: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn arg(mut self, arg_type: &str, size: &str, value: Option<ArgValueSource>) -> Self {
        self.args.push(EncodingArgDecl {
            arg_type: arg_type.to_string(),
            size: size.to_string(),
            value,
        });
        self
    }
}
