//! The NAK manifest (schema `nak.v1`, §3) and its on-disk install-record
//! projection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::env_value::EnvValue;
use crate::error::{ErrorKind, NahError, Result};

pub const NAK_SCHEMA: &str = "nak.v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NakIdentity {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NakPaths {
    #[serde(default)]
    pub resource_root: Option<String>,
    #[serde(default)]
    pub lib_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loader {
    pub exec_path: String,
    #[serde(default)]
    pub args_template: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NakExecution {
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NakSection {
    pub identity: NakIdentity,
    #[serde(default)]
    pub paths: NakPaths,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvValue>,
    /// Accepts both the legacy singular `loader` and the canonical
    /// plural `loaders` map on read (§9 open question); always emitted
    /// as `loaders` on write.
    #[serde(default, alias = "loader")]
    pub loaders: BTreeMap<String, Loader>,
    #[serde(default)]
    pub execution: NakExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NakManifest {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub nak: NakSection,
}

pub struct ParsedNak {
    pub manifest: NakManifest,
    pub warnings: Vec<super::nap::ManifestWarning>,
}

pub fn parse_nak(bytes: &[u8]) -> Result<ParsedNak> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;
    let schema = raw
        .get("$schema")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NahError::new(ErrorKind::InvalidManifest, "parse_nak", "missing $schema"))?;
    if schema != NAK_SCHEMA {
        return Err(NahError::new(ErrorKind::InvalidManifest, "parse_nak", "unknown schema id")
            .with_details(serde_json::json!({ "schema": schema })));
    }

    let manifest: NakManifest = serde_json::from_value(raw.clone())?;

    let mut warnings = Vec::new();
    if let Some(obj) = raw.as_object() {
        for key in obj.keys() {
            if key != "$schema" && key != "nak" {
                warnings.push(super::nap::ManifestWarning {
                    kind: "unknown_field".to_string(),
                    detail: key.clone(),
                });
            }
        }
    }

    for dir in &manifest.nak.paths.lib_dirs {
        validate_relative(dir, "nak.paths.lib_dirs")?;
    }
    if let Some(root) = &manifest.nak.paths.resource_root {
        validate_relative(root, "nak.paths.resource_root")?;
    }
    for (name, loader) in &manifest.nak.loaders {
        validate_relative(&loader.exec_path, &format!("nak.loaders[{}].exec_path", name))?;
    }
    for (key, value) in &manifest.nak.environment {
        value.validate(key)?;
    }

    Ok(ParsedNak { manifest, warnings })
}

fn validate_relative(path: &str, field: &str) -> Result<()> {
    if std::path::Path::new(path).is_absolute() {
        return Err(NahError::new(ErrorKind::InvalidManifest, "validate_relative", "absolute path rejected")
            .with_details(serde_json::json!({ "field": field, "path": path })));
    }
    Ok(())
}
