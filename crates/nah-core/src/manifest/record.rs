//! Install records (§3): the host-owned, audit/pin state the registry
//! persists for one installed app or NAK. These are absolute-path
//! projections of the corresponding manifest plus provenance/trust.

use serde::{Deserialize, Serialize};

use super::env_value::EnvValue;
use crate::error::{ErrorKind, NahError, Result};

pub const APP_RECORD_SCHEMA: &str = "app-record.v1";
pub const NAK_RECORD_SCHEMA: &str = "nak-record.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Unknown,
    Verified,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trust {
    pub state: TrustState,
    pub source: String,
    pub evaluated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub inputs_hash: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub package_hash: String,
    pub installed_at: chrono::DateTime<chrono::Utc>,
    pub installed_by: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentOverrides {
    #[serde(default)]
    pub prepend: Vec<String>,
    #[serde(default)]
    pub append: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathOverrides {
    #[serde(default)]
    pub library_prepend: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppOverrides {
    #[serde(default)]
    pub environment: std::collections::BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub arguments: ArgumentOverrides,
    #[serde(default)]
    pub paths: PathOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenApp {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub nak_id: Option<String>,
    #[serde(default)]
    pub nak_version_req: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedNak {
    pub id: String,
    pub version: String,
    pub record_ref: String,
    pub selection_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecordPaths {
    pub install_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInstallRecord {
    #[serde(rename = "$schema", default = "app_schema")]
    pub schema: String,
    pub install: InstallIdentity,
    pub app: FrozenApp,
    #[serde(default)]
    pub nak: Option<PinnedNak>,
    pub paths: AppRecordPaths,
    pub provenance: Provenance,
    pub trust: Trust,
    #[serde(default)]
    pub overrides: AppOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallIdentity {
    pub instance_id: String,
}

fn app_schema() -> String {
    APP_RECORD_SCHEMA.to_string()
}

/// Absolute-path projection of a parsed NAK manifest (§3 "NAK install
/// record"). Every path here is required to start with `paths.root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NakInstallRecord {
    #[serde(rename = "$schema", default = "nak_schema")]
    pub schema: String,
    pub id: String,
    pub version: String,
    pub paths: NakRecordPaths,
    #[serde(default)]
    pub environment: std::collections::BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub loaders: std::collections::BTreeMap<String, super::nak::Loader>,
    #[serde(default)]
    pub execution_cwd: Option<String>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NakRecordPaths {
    pub root: String,
    #[serde(default)]
    pub resource_root: Option<String>,
    #[serde(default)]
    pub lib_dirs: Vec<String>,
}

fn nak_schema() -> String {
    NAK_RECORD_SCHEMA.to_string()
}

impl NakInstallRecord {
    /// Builds an absolute-path projection from a parsed NAK manifest
    /// rooted at `root` (already the extracted package directory),
    /// rejecting any declared path that does not stay under it.
    pub fn from_manifest(
        manifest: &super::nak::NakManifest,
        root: &std::path::Path,
        provenance: Provenance,
    ) -> Result<Self> {
        let root_str = root.to_string_lossy().to_string();

        let resource_root = match &manifest.nak.paths.resource_root {
            Some(rel) => Some(require_under_root(root, rel)?),
            None => None,
        };
        let mut lib_dirs = Vec::new();
        for rel in &manifest.nak.paths.lib_dirs {
            lib_dirs.push(require_under_root(root, rel)?);
        }
        let mut loaders = manifest.nak.loaders.clone();
        for loader in loaders.values_mut() {
            loader.exec_path = require_under_root(root, &loader.exec_path)?;
        }

        Ok(NakInstallRecord {
            schema: NAK_RECORD_SCHEMA.to_string(),
            id: manifest.nak.identity.id.clone(),
            version: manifest.nak.identity.version.clone(),
            paths: NakRecordPaths { root: root_str, resource_root, lib_dirs },
            environment: manifest.nak.environment.clone(),
            loaders,
            execution_cwd: manifest.nak.execution.cwd.clone(),
            provenance,
        })
    }
}

fn require_under_root(root: &std::path::Path, rel: &str) -> Result<String> {
    let abs = crate::paths::safe_join(root, rel)?;
    let canon = crate::paths::canonical_under(root, &abs)?;
    Ok(canon.to_string_lossy().to_string())
}

impl AppInstallRecord {
    pub fn validate_paths_absolute(&self) -> Result<()> {
        if !std::path::Path::new(&self.paths.install_root).is_absolute() {
            return Err(NahError::new(
                ErrorKind::InvalidManifest,
                "validate_paths_absolute",
                "install_root must be absolute",
            ));
        }
        Ok(())
    }
}
