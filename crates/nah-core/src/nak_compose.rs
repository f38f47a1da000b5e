//! The NAK composer (§4.J): merges N resolved NAK inputs (installed,
//! directory, or `.nak` file) into one new NAK, with a file-tree union
//! under a conflict policy, concatenated lib dirs, a folded
//! environment, loader disambiguation, and resource-root agreement.
//! Unlike the composer in `compose.rs` this does real I/O — reading,
//! hashing, copying, and optionally repackaging — so it leans on
//! `archive.rs`'s extract/pack pair for the file-level mechanics and on
//! a content-hash dedup idiom for the conflict check.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive;
use crate::env_algebra;
use crate::error::{ErrorKind, NahError, Result};
use crate::hash::hash_file;
use crate::manifest::env_value::EnvValue;
use crate::manifest::nak::{parse_nak, Loader, NakExecution, NakIdentity, NakManifest, NakPaths, NakSection, NAK_SCHEMA};
use crate::manifest::record::NakInstallRecord;
use crate::paths::{atomic_write, is_executable, safe_join, set_executable};
use crate::registry::RegistrySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Error,
    First,
    Last,
}

impl ConflictPolicy {
    fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Error => "error",
            ConflictPolicy::First => "first",
            ConflictPolicy::Last => "last",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Installed,
    Directory,
    File,
}

impl SourceKind {
    fn as_str(self) -> &'static str {
        match self {
            SourceKind::Installed => "installed",
            SourceKind::Directory => "directory",
            SourceKind::File => "file",
        }
    }
}

/// Where one input to a compose came from, carried through to the
/// provenance document.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub source: String,
    pub sha256: Option<String>,
}

/// A reference to a NAK input, before resolution (§4.J step 1).
pub enum NakReference<'a> {
    Installed { id: &'a str, version: &'a str },
    Directory(&'a Path),
    File(&'a Path),
}

/// One input to a NAK compose, already resolved to a directory on disk
/// with every path relative to that directory — the same shape whether
/// it came from the registry, a bare directory, or an extracted `.nak`.
pub struct ResolvedNakInput {
    pub id: String,
    pub version: String,
    pub root: PathBuf,
    pub lib_dirs: Vec<String>,
    pub resource_root: Option<String>,
    pub environment: BTreeMap<String, EnvValue>,
    pub loaders: BTreeMap<String, Loader>,
    pub execution_cwd: Option<String>,
    pub source: SourceDescriptor,
}

/// Resolves one `NakReference` into a `ResolvedNakInput`. `.nak` files
/// are extracted into a fresh staging directory under `staging_parent`;
/// the caller is responsible for cleaning those up once the compose
/// that consumes them is done.
pub fn resolve_reference(
    reference: &NakReference,
    registry: Option<&RegistrySnapshot>,
    staging_parent: &Path,
) -> Result<ResolvedNakInput> {
    match reference {
        NakReference::Installed { id, version } => {
            let snapshot = registry.ok_or_else(|| {
                NahError::new(ErrorKind::NakNotInstalled, "resolve_reference", "no registry snapshot supplied for an installed reference")
            })?;
            let record = snapshot
                .find_nak(id, version)
                .ok_or_else(|| {
                    NahError::new(ErrorKind::NakNotInstalled, "resolve_reference", "no such NAK is installed")
                        .with_details(serde_json::json!({ "id": id, "version": version }))
                })?;
            resolve_from_install_record(record, SourceDescriptor {
                kind: SourceKind::Installed,
                source: format!("installed:{}@{}", id, version),
                sha256: None,
            })
        }
        NakReference::Directory(dir) => {
            let bytes = fs::read(dir.join(archive::NAK_MANIFEST))?;
            let parsed = parse_nak(&bytes)?;
            Ok(resolve_from_manifest(
                &parsed.manifest,
                dir,
                SourceDescriptor { kind: SourceKind::Directory, source: dir.display().to_string(), sha256: None },
            ))
        }
        NakReference::File(path) => {
            let sha256 = hash_file(path)?;
            let staging = archive::extract_to_staging(path, staging_parent, archive::NAK_MANIFEST)?;
            let bytes = fs::read(staging.join(archive::NAK_MANIFEST))?;
            let parsed = parse_nak(&bytes)?;
            Ok(resolve_from_manifest(
                &parsed.manifest,
                &staging,
                SourceDescriptor { kind: SourceKind::File, source: path.display().to_string(), sha256: Some(sha256) },
            ))
        }
    }
}

fn resolve_from_manifest(manifest: &NakManifest, root: &Path, source: SourceDescriptor) -> ResolvedNakInput {
    ResolvedNakInput {
        id: manifest.nak.identity.id.clone(),
        version: manifest.nak.identity.version.clone(),
        root: root.to_path_buf(),
        lib_dirs: manifest.nak.paths.lib_dirs.clone(),
        resource_root: manifest.nak.paths.resource_root.clone(),
        environment: manifest.nak.environment.clone(),
        loaders: manifest.nak.loaders.clone(),
        execution_cwd: manifest.nak.execution.cwd.clone(),
        source,
    }
}

fn resolve_from_install_record(record: &NakInstallRecord, source: SourceDescriptor) -> Result<ResolvedNakInput> {
    let root = PathBuf::from(&record.paths.root);
    let relativize = |abs: &str| -> Result<String> {
        Path::new(abs)
            .strip_prefix(&root)
            .map(|p| p.to_string_lossy().to_string())
            .map_err(|_| {
                NahError::new(ErrorKind::InvalidManifest, "resolve_from_install_record", "record path is not under its own nak root")
                    .with_details(serde_json::json!({ "root": root.display().to_string(), "path": abs }))
            })
    };

    let lib_dirs = record.paths.lib_dirs.iter().map(|p| relativize(p)).collect::<Result<Vec<_>>>()?;
    let resource_root = record.paths.resource_root.as_deref().map(relativize).transpose()?;
    let mut loaders = BTreeMap::new();
    for (name, loader) in &record.loaders {
        loaders.insert(name.clone(), Loader { exec_path: relativize(&loader.exec_path)?, args_template: loader.args_template.clone() });
    }

    Ok(ResolvedNakInput {
        id: record.id.clone(),
        version: record.version.clone(),
        root,
        lib_dirs,
        resource_root,
        environment: record.environment.clone(),
        loaders,
        execution_cwd: record.execution_cwd.clone(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct NakComposeOptions {
    pub on_conflict: ConflictPolicy,
    pub add_lib_dirs: Vec<String>,
    pub add_env: BTreeMap<String, String>,
    pub loader_from: Option<String>,
    pub resource_root: Option<String>,
    pub generate_provenance: bool,
}

impl Default for NakComposeOptions {
    fn default() -> Self {
        NakComposeOptions {
            on_conflict: ConflictPolicy::Error,
            add_lib_dirs: Vec::new(),
            add_env: BTreeMap::new(),
            loader_from: None,
            resource_root: None,
            generate_provenance: false,
        }
    }
}

pub struct NakComposeOutcome {
    pub staging_dir: PathBuf,
    pub manifest: NakManifest,
    pub archive_path: Option<PathBuf>,
    pub archive_sha256: Option<String>,
    pub provenance: Option<serde_json::Value>,
}

struct Placement {
    source_index: usize,
    rel: PathBuf,
}

/// Lists every regular file under `root`, erroring on any symlink
/// (§4.J "Symlinks in inputs are an error"), unlike
/// `paths::list_files_recursive` which silently skips them.
fn walk_with_symlink_check(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| NahError::new(ErrorKind::IoError, "walk_with_symlink_check", e.to_string()))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(NahError::new(ErrorKind::ArchiveUnsafe, "walk_with_symlink_check", "symlink in a NAK compose input is not allowed")
                .with_details(serde_json::json!({ "path": entry.path().display().to_string() })));
        }
        if file_type.is_file() {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

/// Unions the file trees of every input (§4.J steps 2-3): identical
/// content at the same relative path is deduplicated (first wins),
/// differing content is resolved by `on_conflict`.
fn merge_file_trees(inputs: &[ResolvedNakInput], on_conflict: ConflictPolicy) -> Result<Vec<Placement>> {
    let mut chosen: BTreeMap<PathBuf, Placement> = BTreeMap::new();
    let mut conflicts: Vec<String> = Vec::new();

    for (idx, input) in inputs.iter().enumerate() {
        for rel in walk_with_symlink_check(&input.root)? {
            let abs = input.root.join(&rel);
            match chosen.get(&rel) {
                None => {
                    chosen.insert(rel.clone(), Placement { source_index: idx, rel });
                }
                Some(existing) => {
                    let existing_abs = inputs[existing.source_index].root.join(&existing.rel);
                    if hash_file(&existing_abs)? == hash_file(&abs)? {
                        continue;
                    }
                    match on_conflict {
                        ConflictPolicy::First => continue,
                        ConflictPolicy::Last => {
                            chosen.insert(rel.clone(), Placement { source_index: idx, rel });
                        }
                        ConflictPolicy::Error => conflicts.push(rel.display().to_string()),
                    }
                }
            }
        }
    }

    if !conflicts.is_empty() {
        conflicts.sort();
        conflicts.dedup();
        return Err(NahError::new(ErrorKind::FileConflict, "merge_file_trees", "conflicting files across NAK compose inputs")
            .with_details(serde_json::json!({ "paths": conflicts })));
    }
    Ok(chosen.into_values().collect())
}

fn dedup_preserve_first(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Folds every input's environment in order (§4.H), then applies
/// `add_env` as a final `set` layer.
fn fold_environment(inputs: &[ResolvedNakInput], add_env: &BTreeMap<String, String>) -> Result<BTreeMap<String, EnvValue>> {
    let layers: Vec<&BTreeMap<String, EnvValue>> = inputs.iter().map(|i| &i.environment).collect();
    let mut folded = env_algebra::fold_layers(&layers)?;
    for (key, value) in add_env {
        folded.insert(key.clone(), Some(value.clone()));
    }
    Ok(folded.into_iter().filter_map(|(k, v)| v.map(|v| (k, EnvValue::Literal(v)))).collect())
}

/// Picks which inputs' loaders survive into the merged NAK (§4.J step
/// 6). At most one input may declare loaders unless `loader_from`
/// names which one wins.
fn select_loaders(inputs: &[ResolvedNakInput], loader_from: Option<&str>) -> Result<BTreeMap<String, Loader>> {
    let with_loaders: Vec<&ResolvedNakInput> = inputs.iter().filter(|i| !i.loaders.is_empty()).collect();
    match with_loaders.len() {
        0 => Ok(BTreeMap::new()),
        1 => Ok(with_loaders[0].loaders.clone()),
        _ => {
            let id = loader_from.ok_or_else(|| {
                NahError::new(ErrorKind::AmbiguousLoaders, "select_loaders", "multiple inputs declare loaders; --loader-from is required")
                    .with_details(serde_json::json!({ "candidates": with_loaders.iter().map(|i| i.id.clone()).collect::<Vec<_>>() }))
            })?;
            with_loaders
                .iter()
                .find(|i| i.id == id)
                .map(|i| i.loaders.clone())
                .ok_or_else(|| {
                    NahError::new(ErrorKind::AmbiguousLoaders, "select_loaders", "loader_from does not name a loader-bearing input")
                        .with_details(serde_json::json!({ "loader_from": id }))
                })
        }
    }
}

/// Picks the merged resource root (§4.J step 7): accepted if every
/// non-empty input agrees, otherwise `resource_root` must be supplied.
fn select_resource_root(inputs: &[ResolvedNakInput], resource_root: Option<&str>) -> Result<Option<String>> {
    let mut unique: Vec<&str> = Vec::new();
    for input in inputs {
        if let Some(root) = &input.resource_root {
            if !unique.contains(&root.as_str()) {
                unique.push(root.as_str());
            }
        }
    }
    match unique.len() {
        0 => Ok(resource_root.map(|s| s.to_string())),
        1 => Ok(Some(unique[0].to_string())),
        _ => resource_root.map(|s| s.to_string()).ok_or_else(|| {
            NahError::new(ErrorKind::InvalidManifest, "select_resource_root", "inputs disagree on resource_root; --resource-root is required")
                .with_details(serde_json::json!({ "candidates": unique }))
        }),
    }
}

fn emit_staging(inputs: &[ResolvedNakInput], placements: &[Placement], staging_parent: &Path) -> Result<PathBuf> {
    fs::create_dir_all(staging_parent)?;
    let staging = staging_parent.join(format!("nakcompose-{}", uuid::Uuid::new_v4().simple()));
    fs::create_dir_all(&staging)?;

    for placement in placements {
        let src = inputs[placement.source_index].root.join(&placement.rel);
        let dest = safe_join(&staging, &placement.rel.to_string_lossy())?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, &dest)?;
        if is_executable(&src)? {
            set_executable(&dest, true)?;
        }
    }
    Ok(staging)
}

fn build_provenance(inputs: &[ResolvedNakInput], options: &NakComposeOptions, output: &NakIdentity) -> serde_json::Value {
    serde_json::json!({
        "$schema": crate::manifest::NAK_COMPOSE_SCHEMA,
        "output": { "id": output.id, "version": output.version },
        "inputs": inputs.iter().map(|i| serde_json::json!({
            "id": i.id,
            "version": i.version,
            "source_type": i.source.kind.as_str(),
            "source": i.source.source,
            "sha256": i.source.sha256,
        })).collect::<Vec<_>>(),
        "options": {
            "on_conflict": options.on_conflict.as_str(),
            "add_lib_dirs": options.add_lib_dirs,
            "add_env": options.add_env,
            "loader_from": options.loader_from,
            "resource_root": options.resource_root,
        },
    })
}

/// Runs the full §4.J procedure over already-resolved inputs, writing
/// the merged tree and a synthesized `nak.json` under a fresh staging
/// directory. If `out_archive` is given and ends in `.nak`, the
/// staging directory is also repackaged deterministically.
pub fn compose_naks(
    inputs: &[ResolvedNakInput],
    options: &NakComposeOptions,
    output_identity: NakIdentity,
    staging_parent: &Path,
    out_archive: Option<&Path>,
) -> Result<NakComposeOutcome> {
    let placements = merge_file_trees(inputs, options.on_conflict)?;

    let mut lib_dirs: Vec<String> = Vec::new();
    for input in inputs {
        lib_dirs.extend(input.lib_dirs.clone());
    }
    lib_dirs.extend(options.add_lib_dirs.clone());
    let lib_dirs = dedup_preserve_first(lib_dirs);

    let environment = fold_environment(inputs, &options.add_env)?;
    let loaders = select_loaders(inputs, options.loader_from.as_deref())?;
    let resource_root = select_resource_root(inputs, options.resource_root.as_deref())?;
    let execution_cwd = inputs.iter().find_map(|i| i.execution_cwd.clone());

    let staging = emit_staging(inputs, &placements, staging_parent)?;

    let manifest = NakManifest {
        schema: NAK_SCHEMA.to_string(),
        nak: NakSection {
            identity: output_identity.clone(),
            paths: NakPaths { resource_root, lib_dirs },
            environment,
            loaders,
            execution: NakExecution { cwd: execution_cwd },
        },
    };
    atomic_write(&staging.join(archive::NAK_MANIFEST), &serde_json::to_vec_pretty(&manifest)?)?;

    let mut archive_sha256 = None;
    let mut archive_path = None;
    if let Some(out_path) = out_archive {
        if out_path.extension().and_then(|e| e.to_str()) == Some("nak") {
            archive_sha256 = Some(archive::pack_directory(&staging, out_path, archive::NAK_MANIFEST)?);
            archive_path = Some(out_path.to_path_buf());
        }
    }

    let provenance = options.generate_provenance.then(|| build_provenance(inputs, options, &output_identity));

    Ok(NakComposeOutcome { staging_dir: staging, manifest, archive_path, archive_sha256, provenance })
}
