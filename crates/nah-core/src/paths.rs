//! Path & filesystem primitives (§4.A): safe join under a root, atomic
//! write, recursive directory listing, executable-bit preservation.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{ErrorKind, NahError, Result};

/// Joins `rel` onto `root`, rejecting anything that would leave `root`
/// after lexical normalization. `rel` must not itself be absolute.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(escape_err(root, rel));
    }

    let mut out = root.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || !out.starts_with(root) {
                    return Err(escape_err(root, rel));
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape_err(root, rel)),
        }
    }

    if !out.starts_with(root) {
        return Err(escape_err(root, rel));
    }
    Ok(out)
}

fn escape_err(root: &Path, rel: &str) -> NahError {
    NahError::new(ErrorKind::InvalidManifest, "safe_join", "path_escape").with_details(
        serde_json::json!({ "root": root.display().to_string(), "rel": rel }),
    )
}

/// Writes `bytes` to `path` via a sibling `.tmp` file and rename, so
/// readers never observe a partially written file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_sibling(path);
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Recursively lists every regular file under `root`, relative to it,
/// in lexical (sorted) order. Symlinks are reported as an error by the
/// caller wherever that matters (archive packing, nak compose); this
/// primitive just enumerates what's on disk.
pub fn list_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).into_iter() {
        let entry = entry.map_err(|e| {
            NahError::new(ErrorKind::IoError, "list_files_recursive", e.to_string())
        })?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

/// True if the owner-execute bit is set on `path`'s permissions.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    Ok(meta.permissions().mode() & 0o100 != 0)
}

#[cfg(not(unix))]
pub fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

/// Applies the owner-execute bit to `path` if `executable` is true.
#[cfg(unix)]
pub fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !executable {
        return Ok(());
    }
    let meta = fs::metadata(path)?;
    let mut perms = meta.permissions();
    let mode = perms.mode() | 0o100 | 0o010 | 0o001;
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

/// Canonicalizes `path` and confirms the result still lives under
/// `root` (defense against a symlink planted after `safe_join` ran).
pub fn canonical_under(root: &Path, path: &Path) -> Result<PathBuf> {
    let canon_root = fs::canonicalize(root)?;
    let canon_path = fs::canonicalize(path)?;
    if !canon_path.starts_with(&canon_root) {
        return Err(NahError::new(
            ErrorKind::InvalidManifest,
            "canonical_under",
            "path_escape",
        )
        .with_details(serde_json::json!({
            "root": canon_root.display().to_string(),
            "path": canon_path.display().to_string(),
        })));
    }
    Ok(canon_path)
}
