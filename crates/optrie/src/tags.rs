//! Name → bit assignment for instruction tags, encoding tags and CPU modes.
//!
//! Bits are handed out first-seen-first-assigned and never renumbered. Each class is capped at
//! [`MAX_TAGS_PER_CLASS`] so a tag set always fits the packed 30-bit fields of the exported
//! tables.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{CompileError, Result};

pub const MAX_TAGS_PER_CLASS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagClass {
    Instruction,
    Encoding,
    Mode,
}

impl fmt::Display for TagClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TagClass::Instruction => "instruction tags",
            TagClass::Encoding => "encoding tags",
            TagClass::Mode => "cpu modes",
        })
    }
}

/// A bit position within one tag class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagBit(u8);

impl TagBit {
    pub fn position(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> u32 {
        1 << self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TagSet(u32);

impl TagSet {
    pub const EMPTY: TagSet = TagSet(0);

    pub fn from_bits(bits: u32) -> Self {
        TagSet(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, bit: TagBit) {
        self.0 |= bit.mask();
    }

    pub fn contains(self, bit: TagBit) -> bool {
        self.0 & bit.mask() != 0
    }

    /// `contains` for an optional bit; an unregistered tag is never present.
    pub fn contains_opt(self, bit: Option<TagBit>) -> bool {
        bit.is_some_and(|bit| self.contains(bit))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone)]
pub struct TagRegistry {
    class: TagClass,
    names: Vec<String>,
    bits: HashMap<String, TagBit>,
}

impl TagRegistry {
    pub fn new(class: TagClass) -> Self {
        Self {
            class,
            names: Vec::new(),
            bits: HashMap::new(),
        }
    }

    pub fn class(&self) -> TagClass {
        self.class
    }

    /// Returns the bit already assigned to `name`, or assigns the next free one.
    pub fn register(&mut self, name: &str) -> Result<TagBit> {
        if let Some(bit) = self.bits.get(name) {
            return Ok(*bit);
        }
        if self.names.len() >= MAX_TAGS_PER_CLASS {
            return Err(CompileError::TagOverflow {
                class: self.class,
                name: name.to_string(),
            });
        }

        let bit = TagBit(self.names.len() as u8);
        self.names.push(name.to_string());
        self.bits.insert(name.to_string(), bit);
        Ok(bit)
    }

    pub fn get(&self, name: &str) -> Option<TagBit> {
        self.bits.get(name).copied()
    }

    /// Registers every name and returns their union.
    pub fn register_all<S: AsRef<str>>(&mut self, names: &[S]) -> Result<TagSet> {
        let mut set = TagSet::EMPTY;
        for name in names {
            set.insert(self.register(name.as_ref())?);
        }
        Ok(set)
    }

    pub fn names_in(&self, set: TagSet) -> impl Iterator<Item = &str> + '_ {
        self.iter()
            .filter(move |(_, bit)| set.contains(*bit))
            .map(|(name, _)| name)
    }

    /// Entries in assignment order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TagBit)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), TagBit(idx as u8)))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Core CPU modes (one bit each) plus named unions of them.
#[derive(Debug, Clone)]
pub struct ModeRegistry {
    core: TagRegistry,
    sets: Vec<(String, u32)>,
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self {
            core: TagRegistry::new(TagClass::Mode),
            sets: Vec::new(),
        }
    }
}

impl ModeRegistry {
    pub fn declare_mode(&mut self, name: &str) -> Result<TagBit> {
        if self.core.get(name).is_some() || self.set_mask(name).is_some() {
            return Err(CompileError::DuplicateMode(name.to_string()));
        }
        self.core.register(name)
    }

    pub fn define_set<S: AsRef<str>>(&mut self, name: &str, members: &[S]) -> Result<u32> {
        if self.mask_of(name).is_some() {
            return Err(CompileError::DuplicateMode(name.to_string()));
        }

        let mut mask = 0;
        for member in members {
            let member = member.as_ref();
            mask |= self.mask_of(member).ok_or_else(|| CompileError::UnknownMode {
                mode: member.to_string(),
                context: name.to_string(),
            })?;
        }
        if mask == 0 {
            return Err(CompileError::EmptyModeSet(name.to_string()));
        }

        self.sets.push((name.to_string(), mask));
        Ok(mask)
    }

    /// Mask for a core mode or a mode set.
    pub fn mask_of(&self, name: &str) -> Option<u32> {
        self.core
            .get(name)
            .map(TagBit::mask)
            .or_else(|| self.set_mask(name))
    }

    fn set_mask(&self, name: &str) -> Option<u32> {
        self.sets
            .iter()
            .find(|(set, _)| set == name)
            .map(|(_, mask)| *mask)
    }

    pub fn core(&self) -> &TagRegistry {
        &self.core
    }

    pub fn sets(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.sets.iter().map(|(name, mask)| (name.as_str(), *mask))
    }
}

/// Every registry one compilation needs.
#[derive(Debug, Clone)]
pub struct Registries {
    pub insn_tags: TagRegistry,
    pub enc_tags: TagRegistry,
    pub modes: ModeRegistry,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            insn_tags: TagRegistry::new(TagClass::Instruction),
            enc_tags: TagRegistry::new(TagClass::Encoding),
            modes: ModeRegistry::default(),
        }
    }
}
