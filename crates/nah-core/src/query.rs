//! Read-only projections over the registry (§11 supplement): `list`
//! and `show` for apps and NAKs. A reporting pass narrowed to pure
//! data projections since the CLI owns formatting.

use crate::error::{ErrorKind, NahError, Result};
use crate::manifest::record::{AppInstallRecord, NakInstallRecord};
use crate::registry::{self, RegistrySnapshot};
use std::path::Path;

pub fn list_apps(root: &Path) -> Result<Vec<AppInstallRecord>> {
    let snapshot = registry::scan(root)?;
    Ok(snapshot.apps)
}

pub fn list_naks(root: &Path) -> Result<Vec<NakInstallRecord>> {
    let snapshot = registry::scan(root)?;
    Ok(snapshot.naks)
}

pub fn show_app(root: &Path, id: &str, version: &str) -> Result<AppInstallRecord> {
    registry::read_app_record(root, id, version)
}

pub fn show_nak(root: &Path, id: &str, version: &str) -> Result<NakInstallRecord> {
    registry::read_nak_record(root, id, version)
}

/// The highest installed version of an app id, for commands that take
/// a bare id without a version (§6 reference grammar).
pub fn latest_app_version(snapshot: &RegistrySnapshot, id: &str) -> Option<&str> {
    snapshot
        .apps
        .iter()
        .filter(|a| a.app.id == id)
        .map(|a| a.app.version.as_str())
        .max_by(|a, b| {
            let av = semver::Version::parse(a).ok();
            let bv = semver::Version::parse(b).ok();
            av.cmp(&bv)
        })
}

pub fn show_app_latest(root: &Path, id: &str) -> Result<AppInstallRecord> {
    let snapshot = registry::scan(root)?;
    let version = latest_app_version(&snapshot, id)
        .ok_or_else(|| NahError::new(ErrorKind::NotInstalled, "show_app_latest", "no installed version")
            .with_details(serde_json::json!({ "id": id })))?
        .to_string();
    registry::read_app_record(root, id, &version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::record::{
        AppOverrides, AppRecordPaths, FrozenApp, InstallIdentity, Provenance, Trust, TrustState,
    };

    fn record(root: &Path, version: &str) -> AppInstallRecord {
        AppInstallRecord {
            schema: crate::manifest::record::APP_RECORD_SCHEMA.to_string(),
            install: InstallIdentity { instance_id: format!("id-{}", version) },
            app: FrozenApp { id: "com.example.app".to_string(), version: version.to_string(), nak_id: None, nak_version_req: None },
            nak: None,
            paths: AppRecordPaths { install_root: root.join(format!("apps/com.example.app-{}", version)).to_string_lossy().to_string() },
            provenance: Provenance { package_hash: "a".repeat(64), installed_at: chrono::Utc::now(), installed_by: "test".to_string(), source: "file:x".to_string() },
            trust: Trust { state: TrustState::Verified, source: "sha256".to_string(), evaluated_at: chrono::Utc::now(), expires_at: None, inputs_hash: None, details: None },
            overrides: AppOverrides::default(),
        }
    }

    #[test]
    fn list_apps_returns_installed_records() {
        let dir = tempfile::tempdir().unwrap();
        registry::ensure_root_layout(dir.path()).unwrap();
        registry::write_app_record(dir.path(), &record(dir.path(), "1.0.0")).unwrap();
        let apps = list_apps(dir.path()).unwrap();
        assert_eq!(apps.len(), 1);
    }

    #[test]
    fn show_app_latest_picks_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        registry::ensure_root_layout(dir.path()).unwrap();
        registry::write_app_record(dir.path(), &record(dir.path(), "1.0.0")).unwrap();
        registry::write_app_record(dir.path(), &record(dir.path(), "1.2.0")).unwrap();
        let latest = show_app_latest(dir.path(), "com.example.app").unwrap();
        assert_eq!(latest.app.version, "1.2.0");
    }

    #[test]
    fn show_app_latest_errors_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        registry::ensure_root_layout(dir.path()).unwrap();
        let err = show_app_latest(dir.path(), "com.example.app").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotInstalled);
    }
}
