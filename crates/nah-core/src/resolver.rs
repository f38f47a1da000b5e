//! NAK resolver (§4.G): given a declared `nak_id`/range and the
//! installed inventory, pick the highest compatible version via a
//! filter-then-max-by-precedence pass.

use crate::error::{ErrorKind, NahError, Result};
use crate::manifest::record::NakInstallRecord;
use crate::registry::RegistrySnapshot;
use crate::semver_range::{parse_version, VersionRange};

/// Resolves `nak_id`/`range` against `snapshot`'s installed NAKs,
/// returning the highest satisfying record or a typed error.
pub fn resolve_nak<'a>(
    snapshot: &'a RegistrySnapshot,
    nak_id: &str,
    range_spec: &str,
) -> Result<&'a NakInstallRecord> {
    let range = VersionRange::parse(range_spec)?;

    let mut candidates: Vec<&NakInstallRecord> = snapshot.installed_nak_versions(nak_id).collect();
    if candidates.is_empty() {
        return Err(NahError::new(ErrorKind::NakNotInstalled, "resolve_nak", "no NAK with this id is installed")
            .with_details(serde_json::json!({ "nak_id": nak_id })));
    }

    candidates.sort_by(|a, b| {
        let va = parse_version(&a.version).ok();
        let vb = parse_version(&b.version).ok();
        va.cmp(&vb)
    });

    let chosen = candidates
        .into_iter()
        .rev()
        .find(|r| parse_version(&r.version).map(|v| range.matches(&v)).unwrap_or(false));

    chosen.ok_or_else(|| {
        NahError::new(ErrorKind::NakVersionUnsatisfiable, "resolve_nak", "no installed version satisfies the range")
            .with_details(serde_json::json!({ "nak_id": nak_id, "range": range_spec }))
    })
}

/// Re-checks that a previously pinned NAK version still satisfies the
/// app's declared range, failing with `nak_pin_drifted` if the pinned
/// record has since been removed or no longer satisfies it (§4.G).
pub fn check_pin_still_valid(
    snapshot: &RegistrySnapshot,
    nak_id: &str,
    pinned_version: &str,
    range_spec: &str,
) -> Result<()> {
    let range = VersionRange::parse(range_spec)?;
    let still_present = snapshot.find_nak(nak_id, pinned_version).is_some();
    let version = parse_version(pinned_version)?;
    if !still_present || !range.matches(&version) {
        return Err(NahError::new(ErrorKind::NakPinDrifted, "check_pin_still_valid", "pinned NAK no longer satisfies the app's range")
            .with_details(serde_json::json!({ "nak_id": nak_id, "pinned_version": pinned_version, "range": range_spec })));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::record::{NakRecordPaths, Provenance};

    fn nak(id: &str, version: &str) -> NakInstallRecord {
        NakInstallRecord {
            schema: "nak-record.v1".to_string(),
            id: id.to_string(),
            version: version.to_string(),
            paths: NakRecordPaths { root: format!("/naks/{}/{}", id, version), resource_root: None, lib_dirs: vec![] },
            environment: Default::default(),
            loaders: Default::default(),
            execution_cwd: None,
            provenance: Provenance { package_hash: "a".repeat(64), installed_at: chrono::Utc::now(), installed_by: "t".into(), source: "file:x".into() },
        }
    }

    #[test]
    fn picks_highest_compatible_version() {
        let snapshot = RegistrySnapshot {
            apps: vec![],
            naks: vec![nak("com.example.sdk", "1.1.0"), nak("com.example.sdk", "1.2.3"), nak("com.example.sdk", "2.0.0")],
        };
        let chosen = resolve_nak(&snapshot, "com.example.sdk", ">=1.2.0 <2.0.0").unwrap();
        assert_eq!(chosen.version, "1.2.3");
    }

    #[test]
    fn errors_when_id_missing() {
        let snapshot = RegistrySnapshot { apps: vec![], naks: vec![] };
        let err = resolve_nak(&snapshot, "com.example.sdk", ">=1.0.0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NakNotInstalled);
    }

    #[test]
    fn errors_when_range_unsatisfiable() {
        let snapshot = RegistrySnapshot { apps: vec![], naks: vec![nak("com.example.sdk", "1.0.0")] };
        let err = resolve_nak(&snapshot, "com.example.sdk", ">=2.0.0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NakVersionUnsatisfiable);
    }

    #[test]
    fn pin_drift_detected_after_removal() {
        let snapshot = RegistrySnapshot { apps: vec![], naks: vec![nak("com.example.sdk", "2.0.1")] };
        let err = check_pin_still_valid(&snapshot, "com.example.sdk", "1.2.3", ">=1.2.0 <2.0.0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NakPinDrifted);
    }
}
