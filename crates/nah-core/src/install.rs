//! Install / remove / pack ingestion pipeline: reference parsing,
//! fetch, archive extraction, manifest parsing, NAK install-record
//! projection, and atomic staging-then-publish under the publish lock.
//! Cache-hit detection stays separate from side effects, and every
//! write to the registry goes through the same atomic-write discipline
//! as the rest of the store.

use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{self, NAK_MANIFEST, NAP_MANIFEST};
use crate::config::FetchConfig;
use crate::error::{ErrorKind, NahError, Result};
use crate::fetch::{self, CancelToken};
use crate::lock::PublishLock;
use crate::manifest::nak::parse_nak;
use crate::manifest::nap::parse_nap;
use crate::manifest::record::{
    AppInstallRecord, AppOverrides, AppRecordPaths, FrozenApp, InstallIdentity, NakInstallRecord, PinnedNak,
    Provenance, Trust, TrustState,
};
use crate::paths::atomic_write;
use crate::registry;
use crate::resolver;

/// A parsed install/run/show target, per the reference grammar (§6).
#[derive(Debug, Clone)]
pub enum PackageReference {
    Installed { id: String, version: Option<String> },
    File { path: String, sha256: String },
    Https { url: String, sha256: String },
}

pub fn parse_package_reference(reference: &str) -> Result<PackageReference> {
    if reference.starts_with("file:") {
        let (base, sha256) = fetch::parse_reference(reference)?;
        let path = base.strip_prefix("file:").unwrap_or(&base).to_string();
        return Ok(PackageReference::File { path, sha256 });
    }
    if reference.starts_with("https://") || reference.starts_with("http://") {
        let (url, sha256) = fetch::parse_reference(reference)?;
        return Ok(PackageReference::Https { url, sha256 });
    }
    let (id, version) = match reference.rsplit_once('@') {
        Some((id, version)) if !id.is_empty() => (id.to_string(), Some(version.to_string())),
        _ => (reference.to_string(), None),
    };
    if id.is_empty() {
        return Err(NahError::new(ErrorKind::InvalidReference, "parse_package_reference", "empty reference"));
    }
    Ok(PackageReference::Installed { id, version })
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub force: bool,
    pub installed_by: String,
}

impl Default for InstallOptions {
    fn default() -> Self {
        InstallOptions { force: false, installed_by: "nah".to_string() }
    }
}

pub enum InstallOutcome {
    App(AppInstallRecord),
    Nak(NakInstallRecord),
}

fn fetch_archive_to_tempfile(reference: &PackageReference, fetch_cfg: &FetchConfig, cancel: &CancelToken, root: &Path) -> Result<PathBuf> {
    if cancel.is_cancelled() {
        return Err(NahError::new(ErrorKind::IoError, "install", "cancelled before fetch"));
    }
    match reference {
        PackageReference::File { path, sha256 } => {
            fetch::fetch_file(path, sha256)?;
            Ok(PathBuf::from(path))
        }
        PackageReference::Https { url, sha256 } => {
            let artifact = fetch::fetch_https(url, sha256, fetch_cfg)?;
            let tmp_dir = root.join("tmp");
            fs::create_dir_all(&tmp_dir)?;
            let tmp_path = tmp_dir.join(format!("fetch-{}.archive", uuid::Uuid::new_v4().simple()));
            atomic_write(&tmp_path, &artifact.bytes)?;
            Ok(tmp_path)
        }
        PackageReference::Installed { .. } => Err(NahError::new(
            ErrorKind::InvalidReference,
            "install",
            "an installed-form reference cannot be installed; supply a file: or https: reference",
        )),
    }
}

fn manifest_kind_for(archive_path: &Path) -> &'static str {
    if archive_path.extension().and_then(|e| e.to_str()) == Some("nak") {
        NAK_MANIFEST
    } else {
        NAP_MANIFEST
    }
}

/// Swaps `staging` into `final_path` atomically. If something already
/// occupies `final_path`, it is first renamed aside so the new
/// directory becomes visible before the old one is removed — a crash
/// between the two leaves the orphaned old directory recoverable under
/// its `.orphan-<uuid>` name rather than losing data (§11 `install
/// --force`).
fn publish_directory(staging: &Path, final_path: &Path) -> Result<Option<PathBuf>> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut orphan = None;
    if final_path.exists() {
        let aside = final_path.with_file_name(format!(
            "{}.orphan-{}",
            final_path.file_name().and_then(|n| n.to_str()).unwrap_or("install"),
            uuid::Uuid::new_v4().simple()
        ));
        fs::rename(final_path, &aside)?;
        orphan = Some(aside);
    }
    fs::rename(staging, final_path)?;
    Ok(orphan)
}

/// Installs a `.nap` or `.nak` reference: fetch, extract to staging,
/// parse the manifest, then atomically publish the directory and the
/// registry record under the publish lock (§5). Staging work above
/// happens unlocked.
pub fn install(root: &Path, reference: &str, options: &InstallOptions, fetch_cfg: &FetchConfig, cancel: &CancelToken) -> Result<InstallOutcome> {
    registry::ensure_root_layout(root)?;
    let parsed_ref = parse_package_reference(reference)?;
    let archive_path = fetch_archive_to_tempfile(&parsed_ref, fetch_cfg, cancel, root)?;
    let manifest_name = manifest_kind_for(&archive_path);

    let staging_parent = root.join("tmp").join("staging");
    let staging = archive::extract_to_staging(&archive_path, &staging_parent, manifest_name)?;

    if let PackageReference::Https { .. } = parsed_ref {
        let _ = fs::remove_file(&archive_path);
    }
    if cancel.is_cancelled() {
        let _ = fs::remove_dir_all(&staging);
        return Err(NahError::new(ErrorKind::IoError, "install", "cancelled during extraction"));
    }

    let package_hash = crate::hash::hash_file(&archive_path).unwrap_or_else(|_| "0".repeat(64));
    let source = match &parsed_ref {
        PackageReference::File { path, .. } => format!("file:{}", path),
        PackageReference::Https { url, .. } => url.clone(),
        PackageReference::Installed { .. } => unreachable!(),
    };
    let provenance = Provenance {
        package_hash,
        installed_at: chrono::Utc::now(),
        installed_by: options.installed_by.clone(),
        source,
    };

    let _lock = PublishLock::acquire(root)?;

    if manifest_name == NAK_MANIFEST {
        let bytes = fs::read(staging.join(NAK_MANIFEST))?;
        let parsed = parse_nak(&bytes)?;
        let id = parsed.manifest.nak.identity.id.clone();
        let version = parsed.manifest.nak.identity.version.clone();

        if !options.force && registry::nak_record_path(root, &id, &version).is_file() {
            let _ = fs::remove_dir_all(&staging);
            return Err(already_installed_error(&id, &version));
        }

        let final_path = registry::naks_dir(root).join(&id).join(&version);
        let orphan = publish_directory(&staging, &final_path)?;
        let record = NakInstallRecord::from_manifest(&parsed.manifest, &final_path, provenance)?;
        registry::write_nak_record(root, &record)?;
        if let Some(orphan) = orphan {
            let _ = fs::remove_dir_all(orphan);
        }
        Ok(InstallOutcome::Nak(record))
    } else {
        let bytes = fs::read(staging.join(NAP_MANIFEST))?;
        let parsed = parse_nap(&bytes)?;
        let id = parsed.manifest.app.identity.id.clone();
        let version = parsed.manifest.app.identity.version.clone();

        if !options.force && registry::app_record_path(root, &id, &version).is_file() {
            let _ = fs::remove_dir_all(&staging);
            return Err(already_installed_error(&id, &version));
        }

        // Pin the NAK before publishing: once the app record is written, a
        // later `run` reuses this pin rather than re-resolving (§4.G).
        let nak_pin = match &parsed.manifest.app.identity.nak_id {
            Some(nak_id) => {
                let range = parsed.manifest.app.identity.nak_version_req.as_deref().unwrap_or(">=0.0.0");
                match resolve_nak_pin(root, nak_id, range) {
                    Ok(pin) => Some(pin),
                    Err(e) => {
                        let _ = fs::remove_dir_all(&staging);
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let final_path = registry::apps_dir(root).join(format!("{}-{}", id, version));
        let orphan = publish_directory(&staging, &final_path)?;
        let record = AppInstallRecord {
            schema: crate::manifest::record::APP_RECORD_SCHEMA.to_string(),
            install: InstallIdentity { instance_id: uuid::Uuid::new_v4().to_string() },
            app: FrozenApp {
                id: parsed.manifest.app.identity.id.clone(),
                version: parsed.manifest.app.identity.version.clone(),
                nak_id: parsed.manifest.app.identity.nak_id.clone(),
                nak_version_req: parsed.manifest.app.identity.nak_version_req.clone(),
            },
            nak: nak_pin,
            paths: AppRecordPaths { install_root: final_path.to_string_lossy().to_string() },
            provenance,
            trust: Trust {
                state: TrustState::Verified,
                source: "sha256".to_string(),
                evaluated_at: chrono::Utc::now(),
                expires_at: None,
                inputs_hash: None,
                details: None,
            },
            overrides: AppOverrides::default(),
        };
        registry::write_app_record(root, &record)?;
        if let Some(orphan) = orphan {
            let _ = fs::remove_dir_all(orphan);
        }
        Ok(InstallOutcome::App(record))
    }
}

/// Resolves the highest installed NAK version satisfying `range` and
/// builds the `PinnedNak` that gets frozen into the app record (§4.G).
fn resolve_nak_pin(root: &Path, nak_id: &str, range: &str) -> Result<PinnedNak> {
    let snapshot = registry::scan(root)?;
    let resolved = resolver::resolve_nak(&snapshot, nak_id, range)?;
    Ok(PinnedNak {
        id: resolved.id.clone(),
        version: resolved.version.clone(),
        record_ref: format!("{}@{}.json", resolved.id, resolved.version),
        selection_reason: "highest_satisfying".to_string(),
    })
}

fn already_installed_error(id: &str, version: &str) -> NahError {
    NahError::new(ErrorKind::InvalidReference, "install", "already installed; pass --force to reinstall")
        .with_details(serde_json::json!({ "id": id, "version": version }))
}

/// Removes an installed app. Its install root and registry record are
/// deleted under the publish lock.
pub fn remove_app(root: &Path, id: &str, version: &str) -> Result<()> {
    let _lock = PublishLock::acquire(root)?;
    let record = registry::read_app_record(root, id, version)?;
    registry::remove_app_record(root, id, version)?;
    let _ = fs::remove_dir_all(&record.paths.install_root);
    Ok(())
}

/// Removes an installed NAK, refusing while any app record still pins
/// it (§3 "not removable while any app record references it").
pub fn remove_nak(root: &Path, id: &str, version: &str) -> Result<()> {
    let _lock = PublishLock::acquire(root)?;
    let snapshot = registry::scan(root)?;
    if snapshot.nak_in_use(id, version) {
        return Err(NahError::new(ErrorKind::InvalidReference, "remove_nak", "nak_in_use")
            .with_details(serde_json::json!({ "id": id, "version": version, "reason": "nak_in_use" })));
    }
    let record = registry::read_nak_record(root, id, version)?;
    registry::remove_nak_record(root, id, version)?;
    let _ = fs::remove_dir_all(&record.paths.root);
    Ok(())
}

/// The writer half of Archive I/O (§4.C, §11 "nah pack"): packages a
/// directory containing `nap.json` or `nak.json` at its root into a
/// deterministic archive, auto-detecting which manifest is present.
pub fn pack(dir: &Path, out_path: &Path) -> Result<String> {
    let manifest_name = if dir.join(NAK_MANIFEST).is_file() {
        NAK_MANIFEST
    } else {
        NAP_MANIFEST
    };
    archive::pack_directory(dir, out_path, manifest_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn write_nap_dir(dir: &Path, id: &str, version: &str) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/app"), b"#!/bin/sh\n").unwrap();
        let doc = serde_json::json!({
            "$schema": "nap.v1",
            "app": {
                "identity": { "id": id, "version": version },
                "execution": { "entrypoint": "bin/app" }
            }
        });
        fs::write(dir.join(NAP_MANIFEST), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    #[test]
    fn parse_reference_recognizes_installed_form() {
        let r = parse_package_reference("com.example.app@1.0.0").unwrap();
        match r {
            PackageReference::Installed { id, version } => {
                assert_eq!(id, "com.example.app");
                assert_eq!(version.as_deref(), Some("1.0.0"));
            }
            _ => panic!("expected Installed"),
        }
    }

    #[test]
    fn parse_reference_recognizes_installed_form_without_version() {
        let r = parse_package_reference("com.example.app").unwrap();
        match r {
            PackageReference::Installed { id, version } => {
                assert_eq!(id, "com.example.app");
                assert!(version.is_none());
            }
            _ => panic!("expected Installed"),
        }
    }

    #[test]
    fn install_from_file_reference_publishes_app() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        write_nap_dir(src.path(), "com.example.app", "1.0.0");
        let archive_path = src.path().join("x.nap");
        archive::pack_directory(src.path(), &archive_path, NAP_MANIFEST).unwrap();
        let bytes = fs::read(&archive_path).unwrap();
        let digest = hash_bytes(&bytes);

        let reference = format!("file:{}#sha256={}", archive_path.display(), digest);
        let outcome = install(root.path(), &reference, &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap();
        match outcome {
            InstallOutcome::App(record) => {
                assert_eq!(record.app.id, "com.example.app");
                assert!(Path::new(&record.paths.install_root).join("bin/app").is_file());
            }
            _ => panic!("expected App outcome"),
        }
    }

    #[test]
    fn install_without_force_twice_fails() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        write_nap_dir(src.path(), "com.example.app", "1.0.0");
        let archive_path = src.path().join("x.nap");
        archive::pack_directory(src.path(), &archive_path, NAP_MANIFEST).unwrap();
        let bytes = fs::read(&archive_path).unwrap();
        let digest = hash_bytes(&bytes);
        let reference = format!("file:{}#sha256={}", archive_path.display(), digest);

        install(root.path(), &reference, &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap();
        let err = install(root.path(), &reference, &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidReference);
    }

    #[test]
    fn install_force_replaces_with_new_instance_id() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        write_nap_dir(src.path(), "com.example.app", "1.0.0");
        let archive_path = src.path().join("x.nap");
        archive::pack_directory(src.path(), &archive_path, NAP_MANIFEST).unwrap();
        let bytes = fs::read(&archive_path).unwrap();
        let digest = hash_bytes(&bytes);
        let reference = format!("file:{}#sha256={}", archive_path.display(), digest);

        let first = match install(root.path(), &reference, &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap() {
            InstallOutcome::App(r) => r,
            _ => panic!(),
        };
        let force_opts = InstallOptions { force: true, ..Default::default() };
        let second = match install(root.path(), &reference, &force_opts, &FetchConfig::default(), &CancelToken::new()).unwrap() {
            InstallOutcome::App(r) => r,
            _ => panic!(),
        };
        assert_ne!(first.install.instance_id, second.install.instance_id);
    }

    fn write_nak_dir(dir: &Path, id: &str, version: &str) {
        let doc = serde_json::json!({
            "$schema": "nak.v1",
            "nak": { "identity": { "id": id, "version": version } }
        });
        fs::write(dir.join(NAK_MANIFEST), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    fn write_app_with_nak_dep(dir: &Path, nak_id: &str, nak_version_req: &str) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/app"), b"#!/bin/sh\n").unwrap();
        let doc = serde_json::json!({
            "$schema": "nap.v1",
            "app": {
                "identity": {
                    "id": "com.example.app",
                    "version": "1.0.0",
                    "nak_id": nak_id,
                    "nak_version_req": nak_version_req
                },
                "execution": { "entrypoint": "bin/app" }
            }
        });
        fs::write(dir.join(NAP_MANIFEST), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    fn file_reference(archive_path: &Path) -> String {
        let bytes = fs::read(archive_path).unwrap();
        format!("file:{}#sha256={}", archive_path.display(), hash_bytes(&bytes))
    }

    #[test]
    fn install_pins_declared_nak_at_install_time() {
        let root = tempfile::tempdir().unwrap();

        let nak_src = tempfile::tempdir().unwrap();
        write_nak_dir(nak_src.path(), "com.example.sdk", "1.2.3");
        let nak_archive = nak_src.path().join("sdk.nak");
        archive::pack_directory(nak_src.path(), &nak_archive, NAK_MANIFEST).unwrap();
        install(root.path(), &file_reference(&nak_archive), &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap();

        let app_src = tempfile::tempdir().unwrap();
        write_app_with_nak_dep(app_src.path(), "com.example.sdk", ">=1.0.0 <2.0.0");
        let app_archive = app_src.path().join("app.nap");
        archive::pack_directory(app_src.path(), &app_archive, NAP_MANIFEST).unwrap();

        let outcome = install(root.path(), &file_reference(&app_archive), &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap();
        match outcome {
            InstallOutcome::App(record) => {
                let pinned = record.nak.expect("nak should be pinned at install time");
                assert_eq!(pinned.id, "com.example.sdk");
                assert_eq!(pinned.version, "1.2.3");
                assert_eq!(pinned.selection_reason, "highest_satisfying");
            }
            _ => panic!("expected App outcome"),
        }
    }

    #[test]
    fn install_fails_when_declared_nak_not_installed() {
        let root = tempfile::tempdir().unwrap();
        let app_src = tempfile::tempdir().unwrap();
        write_app_with_nak_dep(app_src.path(), "com.example.sdk", ">=1.0.0");
        let app_archive = app_src.path().join("app.nap");
        archive::pack_directory(app_src.path(), &app_archive, NAP_MANIFEST).unwrap();

        let err = install(root.path(), &file_reference(&app_archive), &InstallOptions::default(), &FetchConfig::default(), &CancelToken::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NakNotInstalled);
    }

    #[test]
    fn remove_nak_blocked_while_referenced() {
        let root = tempfile::tempdir().unwrap();
        registry::ensure_root_layout(root.path()).unwrap();

        let nak_doc = serde_json::json!({ "$schema": "nak.v1", "nak": { "identity": { "id": "com.example.sdk", "version": "1.0.0" } } });
        let nak_dir = tempfile::tempdir().unwrap();
        fs::write(nak_dir.path().join(NAK_MANIFEST), serde_json::to_vec(&nak_doc).unwrap()).unwrap();
        let parsed = parse_nak(&fs::read(nak_dir.path().join(NAK_MANIFEST)).unwrap()).unwrap();
        let nak_root = registry::naks_dir(root.path()).join("com.example.sdk").join("1.0.0");
        fs::create_dir_all(&nak_root).unwrap();
        let provenance = Provenance { package_hash: "a".repeat(64), installed_at: chrono::Utc::now(), installed_by: "test".into(), source: "file:x".into() };
        let nak_record = NakInstallRecord::from_manifest(&parsed.manifest, &nak_root, provenance).unwrap();
        registry::write_nak_record(root.path(), &nak_record).unwrap();

        let app_record = AppInstallRecord {
            schema: crate::manifest::record::APP_RECORD_SCHEMA.to_string(),
            install: InstallIdentity { instance_id: uuid::Uuid::new_v4().to_string() },
            app: FrozenApp { id: "com.example.app".to_string(), version: "1.0.0".to_string(), nak_id: Some("com.example.sdk".to_string()), nak_version_req: Some(">=1.0.0".to_string()) },
            nak: Some(crate::manifest::record::PinnedNak { id: "com.example.sdk".to_string(), version: "1.0.0".to_string(), record_ref: "com.example.sdk@1.0.0.json".to_string(), selection_reason: "highest_satisfying".to_string() }),
            paths: AppRecordPaths { install_root: registry::apps_dir(root.path()).join("com.example.app-1.0.0").to_string_lossy().to_string() },
            provenance: Provenance { package_hash: "b".repeat(64), installed_at: chrono::Utc::now(), installed_by: "test".into(), source: "file:y".into() },
            trust: Trust { state: TrustState::Verified, source: "sha256".to_string(), evaluated_at: chrono::Utc::now(), expires_at: None, inputs_hash: None, details: None },
            overrides: AppOverrides::default(),
        };
        registry::write_app_record(root.path(), &app_record).unwrap();

        let err = remove_nak(root.path(), "com.example.sdk", "1.0.0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidReference);
        assert!(registry::read_nak_record(root.path(), "com.example.sdk", "1.0.0").is_ok());
    }

    #[test]
    fn pack_auto_detects_nak_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(NAK_MANIFEST), br#"{"$schema":"nak.v1"}"#).unwrap();
        let out = tempfile::tempdir().unwrap();
        let sha = pack(dir.path(), &out.path().join("x.nak")).unwrap();
        assert_eq!(sha.len(), 64);
    }
}
