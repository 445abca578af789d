//! Resolving pre-split instruction keys through a [`FlatTable`].
//!
//! This is the consumer side of the table format: given the prefix state, opcode bytes, ModRM,
//! REX.W and trailing byte of an instruction that was already split by a byte-stream decoder,
//! [`FlatTable::lookup`] returns the matching encoding number.

use serde::Serialize;

use crate::flatten::{Entry, FlatTable};
use crate::opcode::{prefix_slot, ModeField, OpcodeDescriptor, RegField};
use crate::trie::NodeKind;

/// Which repeat prefix is in effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepState {
    #[default]
    None,
    F2,
    F3,
}

impl RepState {
    pub fn index(self) -> usize {
        match self {
            RepState::None => 0,
            RepState::F2 => 1,
            RepState::F3 => 2,
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => RepState::None,
            1 => RepState::F2,
            _ => RepState::F3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DecodeKey {
    /// A `66` prefix is present.
    pub op_size: bool,
    pub rep: RepState,
    /// Opcode bytes, escapes included, e.g. `[0x0f, 0x38, 0x00]`.
    pub opcode: Vec<u8>,
    pub modrm: Option<u8>,
    pub rex_w: bool,
    /// The 3DNow! opcode byte that follows the ModRM byte.
    pub suffix: Option<u8>,
}

impl DecodeKey {
    pub fn new(opcode: &[u8]) -> Self {
        Self {
            opcode: opcode.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_modrm(mut self, modrm: u8) -> Self {
        self.modrm = Some(modrm);
        self
    }

    pub fn with_prefix(mut self, op_size: bool, rep: RepState) -> Self {
        self.op_size = op_size;
        self.rep = rep;
        self
    }

    pub fn with_rex_w(mut self, rex_w: bool) -> Self {
        self.rex_w = rex_w;
        self
    }

    pub fn with_suffix(mut self, suffix: u8) -> Self {
        self.suffix = Some(suffix);
        self
    }
}

impl FlatTable {
    /// Walks the table for `key`. `None` means no encoding matches, or the table needed an
    /// input the key does not carry (a ModRM byte, another opcode byte, a suffix).
    pub fn lookup(&self, key: &DecodeKey) -> Option<u32> {
        let mut table = self.root();
        let mut opcode = key.opcode.iter();

        loop {
            let index = match table.kind {
                NodeKind::Opcode => usize::from(*opcode.next()?),
                NodeKind::Prefix => prefix_slot(key.op_size, key.rep.index()),
                NodeKind::ModRm => {
                    let modrm = key.modrm?;
                    usize::from((modrm >> 3) & 7) + 8 * usize::from(modrm >> 6)
                }
                NodeKind::RegOnly => usize::from((key.modrm? >> 3) & 7),
                NodeKind::Rm => usize::from(key.modrm? & 7),
                NodeKind::RexW => usize::from(key.rex_w),
                NodeKind::Suffix => usize::from(key.suffix?),
            };

            match self.entry(table, index)? {
                Entry::Invalid => return None,
                Entry::Encoding(number) => return Some(number),
                Entry::Table(next) => table = next,
            }
        }
    }
}

/// How an encoding's tags steer its placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFlags {
    /// The last opcode byte is a base for eight consecutive register encodings.
    pub reg_in_opcode: bool,
    /// `Some(w)` when the encoding is a REX.W alias that answers only to `w`.
    pub rex_w: Option<bool>,
}

/// Every concrete key an encoding answers to.
///
/// Prefix states, REX.W and ModRM values the encoding leaves open are enumerated in full, so the
/// result can be large (up to a few tens of thousands of keys for a prefix-agnostic `/r` form).
pub fn encoding_keys(desc: &OpcodeDescriptor, flags: KeyFlags) -> Vec<DecodeKey> {
    let bytes = desc.dispatch_bytes();
    let replicas: u8 = if flags.reg_in_opcode { 8 } else { 1 };
    let opcodes: Vec<Vec<u8>> = (0..replicas)
        .filter_map(|r| {
            let mut bytes = bytes.clone();
            let last = bytes.last_mut()?;
            *last = last.checked_add(r)?;
            Some(bytes)
        })
        .collect();

    let modrms: Vec<Option<u8>> = if desc.has_modrm_constraint() || desc.rm.is_some() {
        (0..=255u8)
            .filter(|&m| modrm_matches(desc, m))
            .map(Some)
            .collect()
    } else {
        vec![None]
    };

    let rex_ws: &[bool] = match flags.rex_w {
        Some(false) => &[false],
        Some(true) => &[true],
        None => &[false, true],
    };

    let mut keys = Vec::new();
    for opcode in &opcodes {
        for slot in desc.prefix_slots() {
            for &modrm in &modrms {
                for &rex_w in rex_ws {
                    keys.push(DecodeKey {
                        op_size: slot & 1 == 1,
                        rep: RepState::from_index(slot / 2),
                        opcode: opcode.clone(),
                        modrm,
                        rex_w,
                        suffix: desc.trailing_opcode(),
                    });
                }
            }
        }
    }
    keys
}

fn modrm_matches(desc: &OpcodeDescriptor, modrm: u8) -> bool {
    let (mode, reg, rm) = (modrm >> 6, (modrm >> 3) & 7, modrm & 7);
    let reg_ok = match desc.reg {
        RegField::Literal(r) => r == reg,
        RegField::FromModrm | RegField::None => true,
    };
    let mode_ok = match desc.mode {
        ModeField::Literal(m) => m == mode,
        ModeField::Memory => mode != 3,
        ModeField::None => true,
    };
    reg_ok && mode_ok && desc.rm.map_or(true, |r| r == rm)
}
