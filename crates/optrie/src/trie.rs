//! The decode trie and the builder that inserts encodings into it.
//!
//! Nodes live in one arena and refer to their children by [`NodeId`]. Every node kind has a
//! fixed slot count:
//!
//! | kind | dispatch                              | slots |
//! |------|---------------------------------------|-------|
//! | 1    | opcode byte                           | 256   |
//! | 2    | mandatory prefix (`66` × `f2`/`f3`)   | 6     |
//! | 3    | ModRM.reg + 8 × ModRM.mod             | 32    |
//! | 4    | ModRM.reg (collapsed kind 3)          | 8     |
//! | 5    | ModRM.rm                              | 8     |
//! | 6    | REX.W alias                           | 2     |
//! | 7    | opcode byte after ModRM               | 256   |

use serde::Serialize;
use tracing::{debug, trace};

use crate::catalog::Catalog;
use crate::error::{CompileError, Result};
use crate::opcode::{ModeField, OpcodeDescriptor, RegField};
use crate::tables::EncodingRange;
use crate::tags::{TagBit, TagSet};
use crate::CompileOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Opcode = 1,
    Prefix = 2,
    ModRm = 3,
    RegOnly = 4,
    Rm = 5,
    RexW = 6,
    Suffix = 7,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Opcode,
        NodeKind::Prefix,
        NodeKind::ModRm,
        NodeKind::RegOnly,
        NodeKind::Rm,
        NodeKind::RexW,
        NodeKind::Suffix,
    ];

    pub const fn slot_count(self) -> usize {
        match self {
            NodeKind::Opcode | NodeKind::Suffix => 256,
            NodeKind::Prefix => 6,
            NodeKind::ModRm => 32,
            NodeKind::RegOnly | NodeKind::Rm => 8,
            NodeKind::RexW => 2,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub const fn describe(self) -> &'static str {
        match self {
            NodeKind::Opcode => "opcode table",
            NodeKind::Prefix => "prefix table",
            NodeKind::ModRm => "ModRM table",
            NodeKind::RegOnly => "ModRM.reg table",
            NodeKind::Rm => "ModRM.rm table",
            NodeKind::RexW => "REX.W table",
            NodeKind::Suffix => "trailing opcode table",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Slot {
    #[default]
    Empty,
    /// Encoding number.
    Leaf(u32),
    Node(NodeId),
}

#[derive(Debug, Clone)]
pub enum Node {
    Opcode(Box<[Slot; 256]>),
    Prefix([Slot; 6]),
    ModRm([Slot; 32]),
    RegOnly([Slot; 8]),
    Rm([Slot; 8]),
    RexW([Slot; 2]),
    Suffix(Box<[Slot; 256]>),
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Opcode => Node::Opcode(Box::new([Slot::Empty; 256])),
            NodeKind::Prefix => Node::Prefix([Slot::Empty; 6]),
            NodeKind::ModRm => Node::ModRm([Slot::Empty; 32]),
            NodeKind::RegOnly => Node::RegOnly([Slot::Empty; 8]),
            NodeKind::Rm => Node::Rm([Slot::Empty; 8]),
            NodeKind::RexW => Node::RexW([Slot::Empty; 2]),
            NodeKind::Suffix => Node::Suffix(Box::new([Slot::Empty; 256])),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Opcode(_) => NodeKind::Opcode,
            Node::Prefix(_) => NodeKind::Prefix,
            Node::ModRm(_) => NodeKind::ModRm,
            Node::RegOnly(_) => NodeKind::RegOnly,
            Node::Rm(_) => NodeKind::Rm,
            Node::RexW(_) => NodeKind::RexW,
            Node::Suffix(_) => NodeKind::Suffix,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        match self {
            Node::Opcode(s) | Node::Suffix(s) => &s[..],
            Node::Prefix(s) => s,
            Node::ModRm(s) => s,
            Node::RegOnly(s) | Node::Rm(s) => s,
            Node::RexW(s) => s,
        }
    }

    fn slots_mut(&mut self) -> &mut [Slot] {
        match self {
            Node::Opcode(s) | Node::Suffix(s) => &mut s[..],
            Node::Prefix(s) => s,
            Node::ModRm(s) => s,
            Node::RegOnly(s) | Node::Rm(s) => s,
            Node::RexW(s) => s,
        }
    }
}

/// ModRM node slot for a `(reg, mod)` pair.
pub fn modrm_slot(reg: usize, mode: usize) -> usize {
    reg + 8 * mode
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    node: NodeId,
    slot: usize,
}

impl Pos {
    fn new(node: NodeId, slot: usize) -> Self {
        Self { node, slot }
    }
}

#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(NodeKind::Opcode)],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes.iter().filter(|n| n.kind() == kind).count()
    }

    /// First encoding reachable from `id`, depth first in slot order.
    pub fn first_leaf(&self, id: NodeId) -> Option<u32> {
        self.node(id).slots().iter().find_map(|slot| match *slot {
            Slot::Empty => None,
            Slot::Leaf(number) => Some(number),
            Slot::Node(child) => self.first_leaf(child),
        })
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.push(Node::new(kind))
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn slot(&self, pos: Pos) -> Slot {
        self.node(pos.node).slots()[pos.slot]
    }

    fn set(&mut self, pos: Pos, slot: Slot) {
        self.nodes[pos.node.index()].slots_mut()[pos.slot] = slot;
    }

    fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let mut node = self.node(id).clone();
        for slot in node.slots_mut() {
            if let Slot::Node(child) = *slot {
                *slot = Slot::Node(self.clone_subtree(child));
            }
        }
        self.push(node)
    }
}

/// Why an encoding could not be placed.
#[derive(Debug, Clone, Copy)]
enum Clash {
    /// The final slot already holds a leaf.
    Occupied(u32),
    Shape { wanted: &'static str, found: Slot },
}

/// Encoding tags that trigger special cases, resolved against the catalog's registry.
#[derive(Debug, Clone, Copy, Default)]
struct Steering {
    reg_in_opcode: Option<TagBit>,
    rexw_clear: Option<TagBit>,
    rexw_set: Option<TagBit>,
}

impl Steering {
    fn rexw_slot(&self, tags: TagSet) -> Option<usize> {
        if tags.contains_opt(self.rexw_set) {
            Some(1)
        } else if tags.contains_opt(self.rexw_clear) {
            Some(0)
        } else {
            None
        }
    }
}

struct Insertion<'d> {
    number: u32,
    desc: &'d OpcodeDescriptor,
    rexw_slot: Option<usize>,
}

/// The trie plus the encoding range each instruction ended up with.
#[derive(Debug, Clone)]
pub struct BuiltTrie {
    pub trie: Trie,
    pub ranges: Vec<Option<EncodingRange>>,
}

pub struct TrieBuilder<'a> {
    catalog: &'a Catalog,
    trie: Trie,
    ranges: Vec<Option<EncodingRange>>,
    steering: Steering,
}

impl<'a> TrieBuilder<'a> {
    pub fn new(catalog: &'a Catalog, options: &CompileOptions) -> Self {
        let enc_tags = &catalog.registries().enc_tags;
        let steering = Steering {
            reg_in_opcode: enc_tags.get(&options.reg_in_opcode_tag),
            rexw_clear: enc_tags.get(&options.rexw_clear_tag),
            rexw_set: enc_tags.get(&options.rexw_set_tag),
        };
        debug!(?steering, "resolved steering tags");

        Self {
            catalog,
            trie: Trie::new(),
            ranges: vec![None; catalog.instructions().len()],
            steering,
        }
    }

    /// Inserts encoding `number`, parsed as `desc`, into the shared trie.
    pub fn insert(&mut self, number: u32, desc: &OpcodeDescriptor) -> Result<()> {
        let catalog = self.catalog;
        let encoding = catalog.encoding(number);
        let alias = catalog.owner_alias(number);
        trace!(encoding = number, alias, spec = %desc, "inserting encoding");

        let bytes = desc.dispatch_bytes();
        let Some((&last, leading)) = bytes.split_last() else {
            unreachable!("dispatch bytes always include the primary opcode");
        };

        let replicas = if encoding.tags.contains_opt(self.steering.reg_in_opcode) {
            8
        } else {
            1
        };
        if usize::from(last) + replicas > 256 {
            return Err(CompileError::RegisterBaseOverflow {
                insn: alias.to_string(),
                spec: encoding.opcode.clone(),
            });
        }

        let ctx = Insertion {
            number,
            desc,
            rexw_slot: self.steering.rexw_slot(encoding.tags),
        };

        self.place(&ctx, leading, last, replicas)
            .map_err(|clash| self.report(&ctx, clash))
    }

    pub fn finish(self) -> BuiltTrie {
        BuiltTrie {
            trie: self.trie,
            ranges: self.ranges,
        }
    }

    fn report(&self, ctx: &Insertion<'_>, clash: Clash) -> CompileError {
        let insn = self.catalog.owner_alias(ctx.number).to_string();
        let spec = self.catalog.encoding(ctx.number).opcode.clone();
        match clash {
            Clash::Occupied(other) => CompileError::DuplicateOpcode {
                insn,
                encoding: ctx.number,
                spec,
                other_insn: self.catalog.owner_alias(other).to_string(),
                other_encoding: other,
            },
            Clash::Shape { wanted, found } => {
                let (found, other) = match found {
                    Slot::Leaf(other) => ("leaf", other),
                    Slot::Node(id) => (
                        self.trie.node(id).kind().describe(),
                        self.trie.first_leaf(id).unwrap_or(ctx.number),
                    ),
                    Slot::Empty => unreachable!("an empty slot never clashes"),
                };
                CompileError::OpcodeConflict {
                    insn,
                    encoding: ctx.number,
                    spec,
                    wanted,
                    found,
                    other_insn: self.catalog.owner_alias(other).to_string(),
                    other_encoding: other,
                }
            }
        }
    }

    fn place(
        &mut self,
        ctx: &Insertion<'_>,
        leading: &[u8],
        last: u8,
        replicas: usize,
    ) -> std::result::Result<(), Clash> {
        let mut node = self.trie.root();
        for &byte in leading {
            node = self.descend(Pos::new(node, usize::from(byte)), NodeKind::Opcode)?;
        }
        for r in 0..replicas {
            self.place_prefix(ctx, Pos::new(node, usize::from(last) + r))?;
        }
        Ok(())
    }

    /// Returns the `kind` node at `pos`, creating it if the slot is empty.
    fn descend(&mut self, pos: Pos, kind: NodeKind) -> std::result::Result<NodeId, Clash> {
        match self.trie.slot(pos) {
            Slot::Empty => {
                let id = self.trie.alloc(kind);
                self.trie.set(pos, Slot::Node(id));
                Ok(id)
            }
            Slot::Node(id) if self.trie.node(id).kind() == kind => Ok(id),
            found => Err(Clash::Shape {
                wanted: kind.describe(),
                found,
            }),
        }
    }

    fn place_prefix(&mut self, ctx: &Insertion<'_>, pos: Pos) -> std::result::Result<(), Clash> {
        if !ctx.desc.splits_on_prefix() {
            return self.place_modrm(ctx, pos);
        }

        let table = self.descend(pos, NodeKind::Prefix)?;
        for slot in ctx.desc.prefix_slots() {
            self.place_modrm(ctx, Pos::new(table, slot))?;
        }
        Ok(())
    }

    fn place_modrm(&mut self, ctx: &Insertion<'_>, pos: Pos) -> std::result::Result<(), Clash> {
        let regs = match ctx.desc.reg {
            RegField::None => return self.place_tail(ctx, pos),
            RegField::Literal(reg) => reg..=reg,
            RegField::FromModrm => 0..=7,
        };

        let table = self.descend(pos, NodeKind::ModRm)?;
        for reg in regs {
            let reg = usize::from(reg);
            match ctx.desc.mode {
                ModeField::None => self.place_any_mode(ctx, table, reg)?,
                ModeField::Literal(mode) => self.place_one_mode(ctx, table, reg, usize::from(mode))?,
                ModeField::Memory => {
                    for mode in 0..3 {
                        self.place_one_mode(ctx, table, reg, mode)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Mode-agnostic entries share one child across the four mode slots of their register
    /// column. Slots that already diverged (from mode-specific encodings) are filled one
    /// distinct child at a time.
    fn place_any_mode(
        &mut self,
        ctx: &Insertion<'_>,
        table: NodeId,
        reg: usize,
    ) -> std::result::Result<(), Clash> {
        let mut visited: Vec<NodeId> = Vec::new();
        let mut fresh: Option<Slot> = None;

        for mode in 0..4 {
            let pos = Pos::new(table, modrm_slot(reg, mode));
            match self.trie.slot(pos) {
                Slot::Empty => match fresh {
                    Some(shared) => self.trie.set(pos, shared),
                    None => {
                        self.place_tail(ctx, pos)?;
                        fresh = Some(self.trie.slot(pos));
                    }
                },
                Slot::Node(id) if visited.contains(&id) => {}
                Slot::Node(id) => {
                    visited.push(id);
                    self.place_tail(ctx, pos)?;
                }
                Slot::Leaf(_) => self.place_tail(ctx, pos)?,
            }
        }
        Ok(())
    }

    /// A child shared with sibling mode slots is copied before a mode-specific insertion so
    /// the other modes keep their old contents.
    fn place_one_mode(
        &mut self,
        ctx: &Insertion<'_>,
        table: NodeId,
        reg: usize,
        mode: usize,
    ) -> std::result::Result<(), Clash> {
        let pos = Pos::new(table, modrm_slot(reg, mode));
        if let Slot::Node(id) = self.trie.slot(pos) {
            let shared = (0..4)
                .filter(|&m| m != mode)
                .any(|m| self.trie.slot(Pos::new(table, modrm_slot(reg, m))) == Slot::Node(id));
            if shared {
                let copy = self.trie.clone_subtree(id);
                self.trie.set(pos, Slot::Node(copy));
            }
        }
        self.place_tail(ctx, pos)
    }

    /// r/m, REX.W alias and trailing opcode splits, then the leaf.
    fn place_tail(&mut self, ctx: &Insertion<'_>, pos: Pos) -> std::result::Result<(), Clash> {
        let mut pos = pos;
        if let Some(rm) = ctx.desc.rm {
            pos = Pos::new(self.descend(pos, NodeKind::Rm)?, usize::from(rm));
        }
        if let Some(slot) = ctx.rexw_slot {
            pos = Pos::new(self.descend(pos, NodeKind::RexW)?, slot);
        }
        if let Some(byte) = ctx.desc.trailing_opcode() {
            pos = Pos::new(self.descend(pos, NodeKind::Suffix)?, usize::from(byte));
        }
        self.place_leaf(ctx, pos)
    }

    fn place_leaf(&mut self, ctx: &Insertion<'_>, pos: Pos) -> std::result::Result<(), Clash> {
        match self.trie.slot(pos) {
            Slot::Empty => {
                self.trie.set(pos, Slot::Leaf(ctx.number));
                let insn = self.catalog.encoding(ctx.number).insn.index();
                let range = self.ranges[insn].get_or_insert(EncodingRange {
                    first: ctx.number,
                    last: ctx.number,
                });
                range.first = range.first.min(ctx.number);
                range.last = range.last.max(ctx.number);
                Ok(())
            }
            Slot::Leaf(other) => Err(Clash::Occupied(other)),
            found => Err(Clash::Shape {
                wanted: "leaf",
                found,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogBuilder, EncodingDecl, InstructionDecl};

    fn build(insns: Vec<InstructionDecl>) -> Result<(Catalog, BuiltTrie)> {
        let mut builder = CatalogBuilder::new();
        for insn in insns {
            builder.add_instruction(insn)?;
        }
        let catalog = builder.build();
        let mut trie = TrieBuilder::new(&catalog, &CompileOptions::default());
        for enc in catalog.encodings() {
            let desc = OpcodeDescriptor::parse(&enc.opcode).expect("valid spec");
            trie.insert(enc.number, &desc)?;
        }
        let built = trie.finish();
        Ok((catalog, built))
    }

    #[test]
    fn mode_agnostic_entry_shares_one_child_per_column() {
        let (_, built) = build(vec![InstructionDecl::new("grp")
            .encoding(EncodingDecl::new("0f 01 /2 /rm_1"))])
        .unwrap();
        let trie = &built.trie;
        let Slot::Node(opcode_0f) = trie.node(trie.root()).slots()[0x0f] else {
            panic!("expected 0f table");
        };
        let Slot::Node(modrm) = trie.node(opcode_0f).slots()[0x01] else {
            panic!("expected ModRM table");
        };
        let slots = trie.node(modrm).slots();
        let column: Vec<Slot> = (0..4).map(|m| slots[modrm_slot(2, m)]).collect();
        assert!(matches!(column[0], Slot::Node(_)));
        assert!(column.iter().all(|s| *s == column[0]));
        assert_eq!(trie.count(NodeKind::Rm), 1);
    }

    #[test]
    fn mode_specific_insert_detaches_shared_child() {
        let (_, built) = build(vec![
            InstructionDecl::new("any").encoding(EncodingDecl::new("0f 01 /2 /rm_1")),
            InstructionDecl::new("reg").encoding(EncodingDecl::new("0f 01 /2 /mod_3 /rm_2")),
        ])
        .unwrap();
        let trie = &built.trie;
        assert_eq!(trie.count(NodeKind::Rm), 2);

        let Slot::Node(opcode_0f) = trie.node(trie.root()).slots()[0x0f] else {
            panic!("expected 0f table");
        };
        let Slot::Node(modrm) = trie.node(opcode_0f).slots()[0x01] else {
            panic!("expected ModRM table");
        };
        let slots = trie.node(modrm).slots();
        let Slot::Node(mem_rm) = slots[modrm_slot(2, 0)] else {
            panic!("expected r/m table");
        };
        let Slot::Node(reg_rm) = slots[modrm_slot(2, 3)] else {
            panic!("expected r/m table");
        };
        assert_ne!(mem_rm, reg_rm);
        assert_eq!(trie.node(mem_rm).slots()[2], Slot::Empty);
        assert_eq!(trie.node(reg_rm).slots()[2], Slot::Leaf(1));
        assert_eq!(trie.node(reg_rm).slots()[1], Slot::Leaf(0));
    }

    #[test]
    fn mode_agnostic_after_divergence_fills_each_child_once() {
        let (_, built) = build(vec![
            InstructionDecl::new("reg").encoding(EncodingDecl::new("0f 01 /2 /mod_3 /rm_2")),
            InstructionDecl::new("any").encoding(EncodingDecl::new("0f 01 /2 /rm_1")),
        ])
        .unwrap();
        let trie = &built.trie;
        assert_eq!(trie.count(NodeKind::Rm), 2);
        assert_eq!(built.ranges[1], Some(EncodingRange { first: 1, last: 1 }));
    }

    #[test]
    fn memory_form_leaf_blocks_mode_agnostic_entry() {
        let err = build(vec![
            InstructionDecl::new("mem").encoding(EncodingDecl::new("d9 /0 /mod_m")),
            InstructionDecl::new("all").encoding(EncodingDecl::new("d9 /0")),
        ])
        .unwrap_err();
        match err {
            CompileError::DuplicateOpcode {
                insn, other_insn, ..
            } => {
                assert_eq!(insn, "all");
                assert_eq!(other_insn, "mem");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
