//! On-disk registry (§4.E): layout, scan, read, write of install
//! records, all writes via atomic rename. Generalizes a flat
//! read/write JSON-index pattern into the two-directory app/NAK
//! registry layout this module names.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, NahError, Result};
use crate::manifest::record::{AppInstallRecord, NakInstallRecord};
use crate::paths::atomic_write;

pub fn apps_dir(root: &Path) -> PathBuf {
    root.join("apps")
}

pub fn naks_dir(root: &Path) -> PathBuf {
    root.join("naks")
}

pub fn registry_apps_dir(root: &Path) -> PathBuf {
    root.join("registry").join("apps")
}

pub fn registry_naks_dir(root: &Path) -> PathBuf {
    root.join("registry").join("naks")
}

pub fn host_manifest_path(root: &Path) -> PathBuf {
    root.join("host").join("nah.json")
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(".nah.lock")
}

fn record_filename(id: &str, version: &str) -> String {
    format!("{}@{}.json", id, version)
}

pub fn app_record_path(root: &Path, id: &str, version: &str) -> PathBuf {
    registry_apps_dir(root).join(record_filename(id, version))
}

pub fn nak_record_path(root: &Path, id: &str, version: &str) -> PathBuf {
    registry_naks_dir(root).join(record_filename(id, version))
}

/// Ensures the full `<root>/{apps,naks,host,registry/{apps,naks}}`
/// skeleton exists.
pub fn ensure_root_layout(root: &Path) -> Result<()> {
    for dir in [
        apps_dir(root),
        naks_dir(root),
        root.join("host"),
        registry_apps_dir(root),
        registry_naks_dir(root),
    ] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn write_app_record(root: &Path, record: &AppInstallRecord) -> Result<()> {
    record.validate_paths_absolute()?;
    let path = app_record_path(root, &record.app.id, &record.app.version);
    let bytes = serde_json::to_vec_pretty(record)?;
    atomic_write(&path, &bytes)
}

pub fn write_nak_record(root: &Path, record: &NakInstallRecord) -> Result<()> {
    let path = nak_record_path(root, &record.id, &record.version);
    let bytes = serde_json::to_vec_pretty(record)?;
    atomic_write(&path, &bytes)
}

pub fn read_app_record(root: &Path, id: &str, version: &str) -> Result<AppInstallRecord> {
    let path = app_record_path(root, id, version);
    read_record(&path)
}

pub fn read_nak_record(root: &Path, id: &str, version: &str) -> Result<NakInstallRecord> {
    let path = nak_record_path(root, id, version);
    read_record(&path)
}

fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(NahError::new(ErrorKind::NotInstalled, "read_record", "record not found")
            .with_details(serde_json::json!({ "path": path.display().to_string() })));
    }
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn remove_app_record(root: &Path, id: &str, version: &str) -> Result<()> {
    let path = app_record_path(root, id, version);
    fs::remove_file(path)?;
    Ok(())
}

pub fn remove_nak_record(root: &Path, id: &str, version: &str) -> Result<()> {
    let path = nak_record_path(root, id, version);
    fs::remove_file(path)?;
    Ok(())
}

/// A read-only snapshot of the registry, scanned once and reused for
/// the lifetime of one composition or resolution (§4.E).
pub struct RegistrySnapshot {
    pub apps: Vec<AppInstallRecord>,
    pub naks: Vec<NakInstallRecord>,
}

pub fn scan(root: &Path) -> Result<RegistrySnapshot> {
    Ok(RegistrySnapshot {
        apps: scan_dir(&registry_apps_dir(root))?,
        naks: scan_dir(&registry_naks_dir(root))?,
    })
}

fn scan_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::result::Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = fs::read(&path)?;
        let record: T = serde_json::from_slice(&bytes)?;
        out.push(record);
    }
    Ok(out)
}

impl RegistrySnapshot {
    /// Every installed `(id, version)` for a given NAK id, for the
    /// resolver (§4.G).
    pub fn installed_nak_versions<'a>(&'a self, nak_id: &str) -> impl Iterator<Item = &'a NakInstallRecord> {
        self.naks.iter().filter(move |n| n.id == nak_id)
    }

    pub fn find_nak(&self, id: &str, version: &str) -> Option<&NakInstallRecord> {
        self.naks.iter().find(|n| n.id == id && n.version == version)
    }

    pub fn find_app(&self, id: &str, version: &str) -> Option<&AppInstallRecord> {
        self.apps.iter().find(|a| a.app.id == id && a.app.version == version)
    }

    /// Whether any app record still pins `nak_id`/`nak_version` (§3
    /// "A NAK is not removable while any app record references it.").
    pub fn nak_in_use(&self, nak_id: &str, nak_version: &str) -> bool {
        self.apps.iter().any(|a| {
            a.nak
                .as_ref()
                .map(|pinned| pinned.id == nak_id && pinned.version == nak_version)
                .unwrap_or(false)
        })
    }
}
