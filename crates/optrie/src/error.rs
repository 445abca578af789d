use thiserror::Error;

use crate::opcode::OpcodeSpecError;
use crate::tags::{TagClass, MAX_TAGS_PER_CLASS};

pub type Result<T> = std::result::Result<T, CompileError>;

/// A data error attributable to the instruction-set description.
///
/// Compilation stops at the first one; no artifact is produced alongside it.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("instruction `{insn}`: malformed opcode spec `{spec}`: {source}")]
    MalformedOpcode {
        insn: String,
        spec: String,
        #[source]
        source: OpcodeSpecError,
    },

    #[error("instruction `{insn}`: encoding `{spec}` has {found} argument(s), instruction declares {expected}")]
    ArgumentCountMismatch {
        insn: String,
        spec: String,
        expected: usize,
        found: usize,
    },

    #[error("instruction `{insn}`: argument {index}: {reason}")]
    InvalidArgument {
        insn: String,
        index: usize,
        reason: String,
    },

    #[error("instruction `{insn}`: {count} arguments declared, at most {max} are supported")]
    TooManyArguments {
        insn: String,
        count: usize,
        max: usize,
    },

    #[error(
        "duplicate opcode definition: instruction `{insn}` (encoding {encoding}, `{spec}`) \
         collides with instruction `{other_insn}` (encoding {other_encoding})"
    )]
    DuplicateOpcode {
        insn: String,
        encoding: u32,
        spec: String,
        other_insn: String,
        other_encoding: u32,
    },

    #[error(
        "opcode conflict: instruction `{insn}` (encoding {encoding}, `{spec}`) needs a {wanted} \
         where instruction `{other_insn}` (encoding {other_encoding}) already placed a {found}"
    )]
    OpcodeConflict {
        insn: String,
        encoding: u32,
        spec: String,
        wanted: &'static str,
        found: &'static str,
        other_insn: String,
        other_encoding: u32,
    },

    #[error("instruction `{insn}`: register-in-opcode encoding `{spec}` overflows the opcode byte")]
    RegisterBaseOverflow { insn: String, spec: String },

    #[error("too many {class} (limit {MAX_TAGS_PER_CLASS}): cannot register `{name}`")]
    TagOverflow { class: TagClass, name: String },

    #[error("duplicate instruction alias `{0}`")]
    DuplicateInstruction(String),

    #[error("unknown cpu mode `{mode}` referenced by `{context}`")]
    UnknownMode { mode: String, context: String },

    #[error("cpu mode name `{0}` is declared twice")]
    DuplicateMode(String),

    #[error("mode set `{0}` is empty")]
    EmptyModeSet(String),

    #[error("too many encodings ({count}); encoding numbers must stay below {limit:#x}")]
    TooManyEncodings { count: usize, limit: u32 },

    #[error("invalid catalog json: {0}")]
    Json(#[from] serde_json::Error),
}
