//! Parser for the opcode-token strings attached to each encoding.
//!
//! A spec is a whitespace separated token list, e.g. `66 0f 38 &00 /r` or `d9 /2 /mod_3 /rm_0`:
//!
//! | token              | meaning                                                         |
//! |--------------------|-----------------------------------------------------------------|
//! | `xx` (1-2 hex)     | primary opcode byte                                             |
//! | `0f`               | escape; once for the two-byte map, twice for the 3DNow! map     |
//! | `66` / `f2` / `f3` | mandatory prefix                                                |
//! | `no66` / `nofx`    | the operand-size / repeat prefix must be absent                 |
//! | `&xx`              | extra opcode byte (after ModRM for the 3DNow! map)              |
//! | `/r`, `/0`..`/7`   | ModRM.reg comes from the operand, or is an opcode extension     |
//! | `/mod_m`           | any memory form (ModRM.mod 0..2)                                |
//! | `/mod_0`..`/mod_3` | one ModRM.mod value                                             |
//! | `/rm_0`..`/rm_7`   | one ModRM.rm value                                              |

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpcodeSpecError {
    #[error("empty opcode string")]
    Empty,
    #[error("unknown token `{0}`")]
    UnknownToken(String),
    #[error("invalid hex byte `{0}`")]
    InvalidHex(String),
    #[error("too many opcode bytes at `{0}`")]
    TooManyOpcodeBytes(String),
    #[error("`0f` escape may appear at most twice and only before the opcode byte")]
    MisplacedEscape,
    #[error("more than one extra opcode byte at `{0}`")]
    TooManyExtraBytes(String),
    #[error("no primary opcode byte")]
    MissingOpcode,
    #[error("`0f 0f` form requires a trailing `&xx` opcode byte")]
    MissingTrailingOpcode,
    #[error("`{0}` contradicts an earlier prefix token")]
    ConflictingPrefix(String),
    #[error("`{0}` repeats a ModRM field that is already constrained")]
    RepeatedField(String),
    #[error("a ModRM.mod constraint requires `/r` or `/0`..`/7`")]
    ModeWithoutRegister,
}

/// The operand-size (`66`) prefix class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpSizePrefix {
    Optional,
    Forbidden,
    Required,
}

/// The repeat (`f2`/`f3`) prefix class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepPrefix {
    Forbidden,
    Optional,
    F2,
    F3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpcodeMap {
    OneByte,
    /// `0f xx`
    TwoByte,
    /// `0f 0f /r xx`: dispatched on `0f 0f`, the distinguishing byte follows ModRM.
    ThreeDNow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegField {
    None,
    Literal(u8),
    FromModrm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeField {
    None,
    Literal(u8),
    /// Modes 0, 1 and 2 taken together.
    Memory,
}

/// Parsed form of an opcode-token string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OpcodeDescriptor {
    pub op_size: OpSizePrefix,
    pub rep: RepPrefix,
    pub map: OpcodeMap,
    pub primary: u8,
    /// The `&xx` byte. Dispatched before ModRM except in the 3DNow! map.
    pub extra: Option<u8>,
    pub reg: RegField,
    pub mode: ModeField,
    pub rm: Option<u8>,
}

/// Bit-field codes of the legacy packed encoding record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PackedOpcode {
    /// 0 = optional, 1 = `no66`, 2 = `66`.
    pub op66: u8,
    /// `0x000..=0x0ff` one-byte, `0x100..=0x1ff` two-byte, `0x200..=0x2ff` 3DNow!.
    pub opcode1: u16,
    /// `&xx` byte, `0x100` for none.
    pub opcode2: u16,
    /// 0..=3, 4 = `/mod_m`, 7 = none.
    pub mode: u8,
    /// 0..=7, 8 = `/r`, 0xf = none.
    pub regop: u8,
    /// 0..=7, 0xf = none.
    pub rm: u8,
    /// 0 = `nofx`, 1 = optional, 2 = `f2`, 3 = `f3`.
    pub fx: u8,
}

/// Number of (operand-size × repeat) states a prefix node distinguishes.
pub const PREFIX_SLOTS: usize = 6;

/// Prefix node slot for one concrete prefix state. `rep` is 0 (none), 1 (`f2`) or 2 (`f3`).
pub fn prefix_slot(op_size: bool, rep: usize) -> usize {
    usize::from(op_size) + 2 * rep
}

impl OpcodeDescriptor {
    pub fn parse(spec: &str) -> Result<Self, OpcodeSpecError> {
        let mut escapes = 0u8;
        let mut primary: Option<u8> = None;
        let mut extra: Option<u8> = None;
        let mut op_size: Option<OpSizePrefix> = None;
        let mut rep: Option<RepPrefix> = None;
        let mut reg: Option<RegField> = None;
        let mut mode: Option<ModeField> = None;
        let mut rm: Option<u8> = None;

        let mut any = false;
        for token in spec.split_whitespace() {
            any = true;
            match token {
                "nofx" => set_prefix(&mut rep, RepPrefix::Forbidden, token)?,
                "no66" => set_prefix(&mut op_size, OpSizePrefix::Forbidden, token)?,
                "/r" => set_field(&mut reg, RegField::FromModrm, token)?,
                "/mod_m" => set_field(&mut mode, ModeField::Memory, token)?,
                _ if token.starts_with('&') => {
                    let byte = parse_hex(&token[1..]).ok_or_else(|| {
                        OpcodeSpecError::InvalidHex(token.to_string())
                    })?;
                    if extra.is_some() {
                        return Err(OpcodeSpecError::TooManyExtraBytes(token.to_string()));
                    }
                    extra = Some(byte);
                }
                _ if token.starts_with("/mod_") => {
                    let value = parse_digit(&token[5..], 3)
                        .ok_or_else(|| OpcodeSpecError::UnknownToken(token.to_string()))?;
                    set_field(&mut mode, ModeField::Literal(value), token)?;
                }
                _ if token.starts_with("/rm_") => {
                    let value = parse_digit(&token[4..], 7)
                        .ok_or_else(|| OpcodeSpecError::UnknownToken(token.to_string()))?;
                    set_field(&mut rm, value, token)?;
                }
                _ if token.starts_with('/') => {
                    let value = parse_digit(&token[1..], 7)
                        .ok_or_else(|| OpcodeSpecError::UnknownToken(token.to_string()))?;
                    set_field(&mut reg, RegField::Literal(value), token)?;
                }
                _ => {
                    let Some(byte) = parse_hex(token) else {
                        return Err(if token.len() <= 2 {
                            OpcodeSpecError::InvalidHex(token.to_string())
                        } else {
                            OpcodeSpecError::UnknownToken(token.to_string())
                        });
                    };
                    match byte {
                        0x0f => {
                            if primary.is_some() {
                                return Err(OpcodeSpecError::MisplacedEscape);
                            }
                            escapes += 1;
                            // `0f 0f`: the second byte is the opcode itself.
                            if escapes == 2 {
                                primary = Some(0x0f);
                            }
                        }
                        0x66 => set_prefix(&mut op_size, OpSizePrefix::Required, token)?,
                        0xf2 => set_prefix(&mut rep, RepPrefix::F2, token)?,
                        0xf3 => set_prefix(&mut rep, RepPrefix::F3, token)?,
                        _ => {
                            if primary.is_some() {
                                return Err(OpcodeSpecError::TooManyOpcodeBytes(
                                    token.to_string(),
                                ));
                            }
                            primary = Some(byte);
                        }
                    }
                }
            }
        }

        if !any {
            return Err(OpcodeSpecError::Empty);
        }
        let primary = primary.ok_or(OpcodeSpecError::MissingOpcode)?;
        let map = match escapes {
            0 => OpcodeMap::OneByte,
            1 => OpcodeMap::TwoByte,
            _ => OpcodeMap::ThreeDNow,
        };
        if map == OpcodeMap::ThreeDNow && extra.is_none() {
            return Err(OpcodeSpecError::MissingTrailingOpcode);
        }

        let reg = reg.unwrap_or(RegField::None);
        let mode = mode.unwrap_or(ModeField::None);
        if reg == RegField::None && mode != ModeField::None {
            return Err(OpcodeSpecError::ModeWithoutRegister);
        }

        Ok(Self {
            op_size: op_size.unwrap_or(OpSizePrefix::Optional),
            rep: rep.unwrap_or(RepPrefix::Optional),
            map,
            primary,
            extra,
            reg,
            mode,
            rm,
        })
    }

    /// The bytes dispatched by 256-way opcode nodes, in order.
    pub fn dispatch_bytes(&self) -> Vec<u8> {
        let mut bytes = match self.map {
            OpcodeMap::OneByte => vec![self.primary],
            OpcodeMap::TwoByte => vec![0x0f, self.primary],
            OpcodeMap::ThreeDNow => return vec![0x0f, self.primary],
        };
        bytes.extend(self.extra);
        bytes
    }

    /// The opcode byte that follows ModRM, if any.
    pub fn trailing_opcode(&self) -> Option<u8> {
        match self.map {
            OpcodeMap::ThreeDNow => self.extra,
            _ => None,
        }
    }

    pub fn has_modrm_constraint(&self) -> bool {
        self.reg != RegField::None
    }

    /// Whether a prefix node is needed, i.e. some prefix state is excluded.
    pub fn splits_on_prefix(&self) -> bool {
        self.op_size != OpSizePrefix::Optional || self.rep != RepPrefix::Optional
    }

    /// Every prefix-node slot this encoding occupies.
    pub fn prefix_slots(&self) -> Vec<usize> {
        let op_sizes: &[bool] = match self.op_size {
            OpSizePrefix::Optional => &[false, true],
            OpSizePrefix::Forbidden => &[false],
            OpSizePrefix::Required => &[true],
        };
        let reps: &[usize] = match self.rep {
            RepPrefix::Optional => &[0, 1, 2],
            RepPrefix::Forbidden => &[0],
            RepPrefix::F2 => &[1],
            RepPrefix::F3 => &[2],
        };

        let mut slots = Vec::with_capacity(op_sizes.len() * reps.len());
        for &op_size in op_sizes {
            for &rep in reps {
                slots.push(prefix_slot(op_size, rep));
            }
        }
        slots
    }

    pub fn packed(&self) -> PackedOpcode {
        PackedOpcode {
            op66: match self.op_size {
                OpSizePrefix::Optional => 0,
                OpSizePrefix::Forbidden => 1,
                OpSizePrefix::Required => 2,
            },
            opcode1: match self.map {
                OpcodeMap::OneByte => 0,
                OpcodeMap::TwoByte => 0x100,
                OpcodeMap::ThreeDNow => 0x200,
            } | u16::from(self.primary),
            opcode2: self.extra.map_or(0x100, u16::from),
            mode: match self.mode {
                ModeField::Literal(m) => m,
                ModeField::Memory => 4,
                ModeField::None => 7,
            },
            regop: match self.reg {
                RegField::Literal(r) => r,
                RegField::FromModrm => 8,
                RegField::None => 0xf,
            },
            rm: self.rm.unwrap_or(0xf),
            fx: match self.rep {
                RepPrefix::Forbidden => 0,
                RepPrefix::Optional => 1,
                RepPrefix::F2 => 2,
                RepPrefix::F3 => 3,
            },
        }
    }
}

impl fmt::Display for OpcodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<String> = Vec::new();
        match self.op_size {
            OpSizePrefix::Required => tokens.push("66".into()),
            OpSizePrefix::Forbidden => tokens.push("no66".into()),
            OpSizePrefix::Optional => {}
        }
        match self.rep {
            RepPrefix::F2 => tokens.push("f2".into()),
            RepPrefix::F3 => tokens.push("f3".into()),
            RepPrefix::Forbidden => tokens.push("nofx".into()),
            RepPrefix::Optional => {}
        }
        match self.map {
            OpcodeMap::OneByte => {}
            OpcodeMap::TwoByte | OpcodeMap::ThreeDNow => tokens.push("0f".into()),
        }
        tokens.push(format!("{:02x}", self.primary));
        if let Some(extra) = self.extra {
            tokens.push(format!("&{extra:02x}"));
        }
        match self.reg {
            RegField::FromModrm => tokens.push("/r".into()),
            RegField::Literal(r) => tokens.push(format!("/{r}")),
            RegField::None => {}
        }
        match self.mode {
            ModeField::Memory => tokens.push("/mod_m".into()),
            ModeField::Literal(m) => tokens.push(format!("/mod_{m}")),
            ModeField::None => {}
        }
        if let Some(rm) = self.rm {
            tokens.push(format!("/rm_{rm}"));
        }
        f.write_str(&tokens.join(" "))
    }
}

fn parse_hex(s: &str) -> Option<u8> {
    if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(s, 16).ok()
}

fn parse_digit(s: &str, max: u8) -> Option<u8> {
    match s.as_bytes() {
        [d @ b'0'..=b'9'] if d - b'0' <= max => Some(d - b'0'),
        _ => None,
    }
}

fn set_prefix<T: Copy + PartialEq>(
    slot: &mut Option<T>,
    value: T,
    token: &str,
) -> Result<(), OpcodeSpecError> {
    match slot {
        Some(existing) if *existing != value => {
            Err(OpcodeSpecError::ConflictingPrefix(token.to_string()))
        }
        _ => {
            *slot = Some(value);
            Ok(())
        }
    }
}

fn set_field<T>(slot: &mut Option<T>, value: T, token: &str) -> Result<(), OpcodeSpecError> {
    if slot.is_some() {
        return Err(OpcodeSpecError::RepeatedField(token.to_string()));
    }
    *slot = Some(value);
    Ok(())
}
