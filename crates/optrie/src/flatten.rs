//! Serializes the decode trie into one flat `u32` array.
//!
//! Every node becomes a contiguous run of words, one per slot. A word is one of:
//!
//! * [`INVALID_ENTRY`] (`0x00ff_ffff`): no encoding matches,
//! * an encoding number (`< 0x00ff_ffff`, kind bits zero),
//! * a table reference `(kind << 24) | offset`, where `offset` indexes the body.
//!
//! Children are emitted before their parents and a shared child is emitted once, so every
//! reference points at an earlier run. The root reference is the last word produced; the
//! canonical serialized form moves it to the front.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::trie::{Node, NodeId, NodeKind, Slot, Trie};

pub const INVALID_ENTRY: u32 = 0x00ff_ffff;

const KIND_SHIFT: u32 = 24;
const OFFSET_MASK: u32 = 0x00ff_ffff;

/// Location and kind of one emitted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub kind: NodeKind,
    pub offset: u32,
}

impl TableRef {
    pub fn pack(self) -> u32 {
        (u32::from(self.kind.code()) << KIND_SHIFT) | self.offset
    }
}

/// A decoded table word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Invalid,
    Encoding(u32),
    Table(TableRef),
}

impl Entry {
    pub fn pack(self) -> u32 {
        match self {
            Entry::Invalid => INVALID_ENTRY,
            Entry::Encoding(number) => number,
            Entry::Table(table) => table.pack(),
        }
    }

    /// `None` for words whose kind bits name no node kind.
    pub fn unpack(word: u32) -> Option<Self> {
        let kind = (word >> KIND_SHIFT) as u8;
        if kind == 0 {
            return Some(if word == INVALID_ENTRY {
                Entry::Invalid
            } else {
                Entry::Encoding(word)
            });
        }
        NodeKind::from_code(kind).map(|kind| {
            Entry::Table(TableRef {
                kind,
                offset: word & OFFSET_MASK,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatTable {
    body: Vec<u32>,
    root: TableRef,
}

impl FlatTable {
    /// Every table word except the root reference.
    pub fn body(&self) -> &[u32] {
        &self.body
    }

    pub fn root(&self) -> TableRef {
        self.root
    }

    /// Total word count, root reference included.
    pub fn len_words(&self) -> usize {
        self.body.len() + 1
    }

    /// Words in the order they were produced: body, then the root reference.
    pub fn emission_order(&self) -> Vec<u32> {
        let mut words = self.body.clone();
        words.push(self.root.pack());
        words
    }

    /// Root reference first, then the body. Offsets stay relative to the body, so the run at
    /// offset `o` starts at canonical index `o + 1`.
    pub fn canonical_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.len_words());
        words.push(self.root.pack());
        words.extend_from_slice(&self.body);
        words
    }

    /// Reads back the canonical form. Returns `None` unless word 0 is a table reference whose
    /// run fits in the body.
    pub fn from_canonical(words: &[u32]) -> Option<Self> {
        let (&first, body) = words.split_first()?;
        let Entry::Table(root) = Entry::unpack(first)? else {
            return None;
        };
        if root.offset as usize + root.kind.slot_count() > body.len() {
            return None;
        }
        Some(Self {
            body: body.to_vec(),
            root,
        })
    }

    /// The decoded word at slot `index` of `table`. `None` if it falls outside the body or is
    /// not a well-formed word.
    pub fn entry(&self, table: TableRef, index: usize) -> Option<Entry> {
        if index >= table.kind.slot_count() {
            return None;
        }
        let word = *self.body.get(table.offset as usize + index)?;
        Entry::unpack(word)
    }
}

/// Flattens `trie`, first rewriting ModRM nodes whose four mode columns agree into reg-only
/// nodes when `collapse` is set.
pub fn flatten(mut trie: Trie, collapse: bool) -> FlatTable {
    if collapse {
        let collapsed = collapse_modrm(&mut trie);
        debug!(collapsed, "collapsed mode-independent ModRM tables");
    }

    let mut emitter = Emitter {
        trie: &trie,
        offsets: HashMap::new(),
        body: Vec::new(),
    };
    let root = emitter.emit(trie.root());
    let table = FlatTable {
        body: emitter.body,
        root,
    };
    debug!(
        words = table.len_words(),
        nodes = emitter.offsets.len(),
        "flattened decode trie"
    );
    table
}

/// Replaces every ModRM node whose slots repeat across all four mode values with an
/// equivalent reg-only node. Returns how many were replaced.
pub fn collapse_modrm(trie: &mut Trie) -> usize {
    let mut collapsed = 0;
    for node in trie.nodes_mut() {
        let Node::ModRm(slots) = node else {
            continue;
        };
        let redundant = (0..8).all(|reg| (1..4).all(|mode| slots[reg + 8 * mode] == slots[reg]));
        if redundant {
            let mut regs = [Slot::Empty; 8];
            regs.copy_from_slice(&slots[..8]);
            *node = Node::RegOnly(regs);
            collapsed += 1;
        }
    }
    collapsed
}

struct Emitter<'t> {
    trie: &'t Trie,
    offsets: HashMap<NodeId, u32>,
    body: Vec<u32>,
}

impl Emitter<'_> {
    fn emit(&mut self, id: NodeId) -> TableRef {
        let trie = self.trie;
        let node = trie.node(id);
        if let Some(&offset) = self.offsets.get(&id) {
            return TableRef {
                kind: node.kind(),
                offset,
            };
        }

        let children: Vec<TableRef> = node
            .slots()
            .iter()
            .filter_map(|slot| match *slot {
                Slot::Node(child) => Some(child),
                _ => None,
            })
            .map(|child| self.emit(child))
            .collect();
        let mut children = children.into_iter();

        let offset = self.body.len() as u32;
        assert!(
            offset + node.kind().slot_count() as u32 <= OFFSET_MASK,
            "decoder table exceeds the 24-bit offset range"
        );
        for slot in node.slots() {
            let entry = match *slot {
                Slot::Empty => Entry::Invalid,
                Slot::Leaf(number) => Entry::Encoding(number),
                Slot::Node(_) => Entry::Table(
                    children
                        .next()
                        .unwrap_or_else(|| panic!("child of node {id:?} was not emitted")),
                ),
            };
            self.body.push(entry.pack());
        }

        self.offsets.insert(id, offset);
        TableRef {
            kind: node.kind(),
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_trip_through_entry() {
        let table = TableRef {
            kind: NodeKind::Rm,
            offset: 0x1234,
        };
        assert_eq!(table.pack(), 0x0500_1234);
        assert_eq!(Entry::unpack(0x0500_1234), Some(Entry::Table(table)));
        assert_eq!(Entry::unpack(INVALID_ENTRY), Some(Entry::Invalid));
        assert_eq!(Entry::unpack(42), Some(Entry::Encoding(42)));
        assert_eq!(Entry::unpack(0x0800_0000), None);
    }

    #[test]
    fn empty_trie_is_one_invalid_opcode_table() {
        let table = flatten(Trie::new(), true);
        assert_eq!(table.body().len(), 256);
        assert!(table.body().iter().all(|&w| w == INVALID_ENTRY));
        assert_eq!(table.canonical_words()[0], 0x0100_0000);
        assert_eq!(table.emission_order().last(), Some(&0x0100_0000));
    }

    #[test]
    fn canonical_form_reads_back() {
        let table = flatten(Trie::new(), false);
        let words = table.canonical_words();
        assert_eq!(FlatTable::from_canonical(&words), Some(table));
        assert_eq!(FlatTable::from_canonical(&words[..10]), None);
        assert_eq!(FlatTable::from_canonical(&[7]), None);
    }
}
