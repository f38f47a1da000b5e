//! The environment-value shape shared by NAK manifests, host
//! environments, and app overrides (§3 "Environment value").

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, NahError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvOp {
    Set,
    Prepend,
    Append,
    Unset,
}

/// One entry of an environment-operation map. A bare JSON string
/// deserializes as `{op: set, value: <string>}`; an object form
/// carries its own `op`/`value`/`separator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    Op {
        op: EnvOp,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        separator: Option<String>,
    },
}

/// A fully-validated environment operation, with defaults applied and
/// shape checked against `op` (§4.D `invalid_env_op`).
#[derive(Debug, Clone)]
pub struct EnvOperation {
    pub op: EnvOp,
    pub value: Option<String>,
    pub separator: String,
}

impl EnvValue {
    pub fn validate(&self, key: &str) -> Result<EnvOperation> {
        match self {
            EnvValue::Literal(v) => Ok(EnvOperation {
                op: EnvOp::Set,
                value: Some(v.clone()),
                separator: ":".to_string(),
            }),
            EnvValue::Op { op, value, separator } => {
                let needs_value = matches!(op, EnvOp::Set | EnvOp::Prepend | EnvOp::Append);
                if needs_value && value.is_none() {
                    return Err(invalid_env_op(key, *op, "missing required value"));
                }
                Ok(EnvOperation {
                    op: *op,
                    value: value.clone(),
                    separator: separator.clone().unwrap_or_else(|| ":".to_string()),
                })
            }
        }
    }
}

fn invalid_env_op(key: &str, op: EnvOp, reason: &str) -> NahError {
    NahError::new(ErrorKind::InvalidManifest, "env_value::validate", reason).with_details(
        serde_json::json!({ "key": key, "op": format!("{:?}", op) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_string_implies_set() {
        let v: EnvValue = serde_json::from_str("\"/usr/bin\"").unwrap();
        let op = v.validate("PATH").unwrap();
        assert_eq!(op.op, EnvOp::Set);
        assert_eq!(op.value.as_deref(), Some("/usr/bin"));
        assert_eq!(op.separator, ":");
    }

    #[test]
    fn prepend_requires_value() {
        let v: EnvValue = serde_json::from_str(r#"{"op":"prepend"}"#).unwrap();
        assert!(v.validate("PATH").is_err());
    }

    #[test]
    fn unset_does_not_require_value() {
        let v: EnvValue = serde_json::from_str(r#"{"op":"unset"}"#).unwrap();
        let op = v.validate("PATH").unwrap();
        assert_eq!(op.op, EnvOp::Unset);
    }

    #[test]
    fn custom_separator_is_preserved() {
        let v: EnvValue = serde_json::from_str(r#"{"op":"append","value":"x","separator":";"}"#).unwrap();
        let op = v.validate("PATH").unwrap();
        assert_eq!(op.separator, ";");
    }
}
