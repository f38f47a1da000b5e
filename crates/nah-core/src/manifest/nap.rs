//! The NAP manifest (schema `nap.v1`, §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::env_value::EnvValue;
use crate::error::{ErrorKind, NahError, Result};

pub const NAP_SCHEMA: &str = "nap.v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppIdentity {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub nak_id: Option<String>,
    #[serde(default)]
    pub nak_version_req: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppExecution {
    pub entrypoint: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppLayout {
    #[serde(default)]
    pub lib_dirs: Vec<String>,
    #[serde(default)]
    pub asset_dirs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppPermissions {
    #[serde(default)]
    pub filesystem: Vec<String>,
    #[serde(default)]
    pub network: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub identity: AppIdentity,
    pub execution: AppExecution,
    #[serde(default)]
    pub layout: AppLayout,
    #[serde(default)]
    pub permissions: AppPermissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NapManifest {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub app: AppSection,
}

/// A warning surfaced during parse/validation that does not block
/// admission (§4.D `unknown_field`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub kind: String,
    pub detail: String,
}

pub struct ParsedNap {
    pub manifest: NapManifest,
    pub warnings: Vec<ManifestWarning>,
}

/// Parses and validates a `nap.json` document: schema check, relative
/// (non-escaping) path checks on every declared path, and env-op
/// validation for every declared environment entry.
pub fn parse_nap(bytes: &[u8]) -> Result<ParsedNap> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;
    let schema = raw
        .get("$schema")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NahError::new(ErrorKind::InvalidManifest, "parse_nap", "missing $schema"))?;
    if schema != NAP_SCHEMA {
        return Err(NahError::new(ErrorKind::InvalidManifest, "parse_nap", "unknown schema id")
            .with_details(serde_json::json!({ "schema": schema })));
    }

    let manifest: NapManifest = serde_json::from_value(raw.clone())?;

    let mut warnings = Vec::new();
    if let Some(obj) = raw.as_object() {
        for key in obj.keys() {
            if key != "$schema" && key != "app" {
                warnings.push(ManifestWarning {
                    kind: "unknown_field".to_string(),
                    detail: key.clone(),
                });
            }
        }
    }

    validate_relative_path(&manifest.app.execution.entrypoint, "app.execution.entrypoint")?;
    for (i, arg) in manifest.app.layout.lib_dirs.iter().enumerate() {
        validate_relative_path(arg, &format!("app.layout.lib_dirs[{}]", i))?;
    }
    for (i, arg) in manifest.app.layout.asset_dirs.iter().enumerate() {
        validate_relative_path(arg, &format!("app.layout.asset_dirs[{}]", i))?;
    }
    for (key, value) in &manifest.app.execution.environment {
        value.validate(key)?;
    }

    Ok(ParsedNap { manifest, warnings })
}

fn validate_relative_path(path: &str, field: &str) -> Result<()> {
    if std::path::Path::new(path).is_absolute() {
        return Err(NahError::new(ErrorKind::InvalidManifest, "validate_relative_path", "absolute path rejected")
            .with_details(serde_json::json!({ "field": field, "path": path })));
    }
    Ok(())
}
