//! Host environment document (`host/nah.json`, §3/§6). Accepts either
//! `host.json` or `nah.json` as a filename and either `loader`/`loaders`
//! key shape on read (§9 open question); always writes `nah.json` with
//! the canonical `loaders` plural the rest of the schema uses, and a
//! round-trip of a freshly written file is byte-stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::env_value::EnvValue;
use crate::error::{ErrorKind, NahError, Result};

pub const NAH_SCHEMA: &str = "nah.v1";
pub const HOST_FILENAME_CANONICAL: &str = "nah.json";
pub const HOST_FILENAME_LEGACY: &str = "host.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostPaths {
    #[serde(default)]
    pub library_prepend: Vec<String>,
    #[serde(default)]
    pub library_append: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostOverridesPolicy {
    #[serde(default)]
    pub allow_env_overrides: bool,
    #[serde(default)]
    pub allowed_env_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostManifest {
    #[serde(rename = "$schema", default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub paths: HostPaths,
    #[serde(default)]
    pub overrides: HostOverridesPolicy,
}

fn default_schema() -> String {
    NAH_SCHEMA.to_string()
}

pub fn parse_host(bytes: &[u8]) -> Result<HostManifest> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(schema) = raw.get("$schema").and_then(|v| v.as_str()) {
        if schema != NAH_SCHEMA {
            return Err(NahError::new(ErrorKind::InvalidManifest, "parse_host", "unknown schema id")
                .with_details(serde_json::json!({ "schema": schema })));
        }
    }
    let manifest: HostManifest = serde_json::from_value(raw)?;
    for (key, value) in &manifest.environment {
        value.validate(key)?;
    }
    Ok(manifest)
}

pub fn write_host(manifest: &HostManifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_document() {
        let doc = serde_json::json!({
            "$schema": "nah.v1",
            "paths": { "library_prepend": ["/opt/lib"] },
            "overrides": { "allow_env_overrides": true, "allowed_env_keys": ["LOG_LEVEL"] }
        });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let manifest = parse_host(&bytes).unwrap();
        assert!(manifest.overrides.allow_env_overrides);
        assert_eq!(manifest.paths.library_prepend, vec!["/opt/lib".to_string()]);
    }

    #[test]
    fn missing_schema_defaults_to_current() {
        let doc = serde_json::json!({ "paths": { "library_prepend": [] } });
        let bytes = serde_json::to_vec(&doc).unwrap();
        let manifest = parse_host(&bytes).unwrap();
        assert_eq!(manifest.schema, NAH_SCHEMA);
    }

    #[test]
    fn write_then_parse_round_trips() {
        let manifest = HostManifest {
            schema: NAH_SCHEMA.to_string(),
            overrides: HostOverridesPolicy { allow_env_overrides: true, allowed_env_keys: vec!["A".into()] },
            ..Default::default()
        };
        let bytes = write_host(&manifest).unwrap();
        let reparsed = parse_host(&bytes).unwrap();
        assert_eq!(reparsed.overrides.allowed_env_keys, vec!["A".to_string()]);
        let bytes2 = write_host(&reparsed).unwrap();
        assert_eq!(bytes, bytes2);
    }
}
