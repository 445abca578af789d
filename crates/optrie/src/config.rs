use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Knobs for one [`compile`](crate::compile) run.
///
/// Every field has a default, so a JSON object only needs the keys it overrides:
///
/// ```
/// let options = optrie::CompileOptions::from_json(r#"{ "collapse_modrm": false }"#).unwrap();
/// assert_eq!(options.reg_in_opcode_tag, "etag_reg_base");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Rewrite ModRM tables that never look at ModRM.mod into 8-slot reg-only tables.
    pub collapse_modrm: bool,
    /// Encoding tag marking `op+r` forms (register number in the low 3 opcode bits).
    pub reg_in_opcode_tag: String,
    /// Encoding tag for the form decoded when REX.W is clear.
    pub rexw_clear_tag: String,
    /// Encoding tag for the form decoded when REX.W is set. Wins over `rexw_clear_tag`.
    pub rexw_set_tag: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            collapse_modrm: true,
            reg_in_opcode_tag: "etag_reg_base".to_string(),
            rexw_clear_tag: "etag_like_arpl".to_string(),
            rexw_set_tag: "etag_like_movsxd".to_string(),
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let options = CompileOptions::from_json(r#"{ "rexw_set_tag": "etag_w1" }"#).unwrap();
        assert!(options.collapse_modrm);
        assert_eq!(options.rexw_set_tag, "etag_w1");
        assert_eq!(options.rexw_clear_tag, "etag_like_arpl");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(CompileOptions::from_json("{ collapse_modrm }").is_err());
    }
}
