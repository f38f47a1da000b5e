//! Archive I/O (§4.C): gzip-compressed POSIX tar with deterministic
//! metadata, and extraction that refuses anything that could escape
//! the target directory or isn't a plain file/directory. The read side
//! follows a familiar tar-plus-gzip extraction loop, hardened here with
//! symlink/traversal/non-regular-entry rejection; the deterministic
//! writer has no precedent in that loop and is new.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use crate::error::{ErrorKind, NahError, Result};
use crate::hash::hash_file;
use crate::paths::{is_executable, list_files_recursive};

/// Required manifest filenames at an archive root, by package kind.
pub const NAP_MANIFEST: &str = "nap.json";
pub const NAK_MANIFEST: &str = "nak.json";

/// Packs `dir` into a deterministic gzipped tar at `out_path`: sorted
/// filenames, owner/group zero, mtime epoch. Returns the SHA-256 of
/// the emitted archive.
pub fn pack_directory(dir: &Path, out_path: &Path, manifest_name: &str) -> Result<String> {
    if !dir.join(manifest_name).is_file() {
        return Err(NahError::new(
            ErrorKind::InvalidManifest,
            "pack_directory",
            format!("missing required manifest {}", manifest_name),
        ));
    }

    let files = list_files_recursive(dir)?;
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = out_path.with_extension("tmp");
    {
        let file = fs::File::create(&tmp_path)?;
        let encoder = GzEncoder::new(file, Compression::best());
        let mut builder = Builder::new(encoder);

        for rel in &files {
            let abs = dir.join(rel);
            let data = fs::read(&abs)?;
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(if is_executable(&abs)? { 0o755 } else { 0o644 });
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();
            builder
                .append_data(&mut header, rel, data.as_slice())
                .map_err(|e| NahError::new(ErrorKind::IoError, "pack_directory", e.to_string()))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| NahError::new(ErrorKind::IoError, "pack_directory", e.to_string()))?;
        let mut file = encoder
            .finish()
            .map_err(|e| NahError::new(ErrorKind::IoError, "pack_directory", e.to_string()))?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, out_path)?;
    hash_file(out_path)
}

/// Extracts `archive_path` into a fresh staging directory under
/// `staging_parent`, enforcing §4.A/§4.C safety rules, then returns
/// the staging directory's path for the caller to atomically promote.
/// Rejects archives missing the required root manifest.
pub fn extract_to_staging(
    archive_path: &Path,
    staging_parent: &Path,
    manifest_name: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(staging_parent)?;
    let staging = staging_parent.join(format!(
        "stage-{}",
        uuid::Uuid::new_v4().simple()
    ));
    fs::create_dir_all(&staging)?;

    let result = (|| -> Result<()> {
        let file = fs::File::open(archive_path)?;
        let decoder = GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);

        let mut saw_manifest = false;
        for entry in tar
            .entries()
            .map_err(|e| NahError::new(ErrorKind::ArchiveUnsafe, "extract_to_staging", e.to_string()))?
        {
            let mut entry = entry
                .map_err(|e| NahError::new(ErrorKind::ArchiveUnsafe, "extract_to_staging", e.to_string()))?;
            let entry_type = entry.header().entry_type();

            if entry_type.is_symlink() || entry_type.is_hard_link() {
                return Err(NahError::new(
                    ErrorKind::ArchiveUnsafe,
                    "extract_to_staging",
                    "symlink or hard link entry is not allowed",
                ));
            }
            if !entry_type.is_file() && !entry_type.is_dir() {
                return Err(NahError::new(
                    ErrorKind::ArchiveUnsafe,
                    "extract_to_staging",
                    "non-regular entry (device/fifo) is not allowed",
                ));
            }

            let entry_path = entry
                .path()
                .map_err(|e| NahError::new(ErrorKind::ArchiveUnsafe, "extract_to_staging", e.to_string()))?
                .into_owned();

            let dest = crate::paths::safe_join(
                &staging,
                entry_path
                    .to_str()
                    .ok_or_else(|| NahError::new(ErrorKind::ArchiveUnsafe, "extract_to_staging", "non-utf8 path"))?,
            )
            .map_err(|_| {
                NahError::new(ErrorKind::ArchiveUnsafe, "extract_to_staging", "archive entry escapes target directory")
            })?;

            if entry_type.is_dir() {
                fs::create_dir_all(&dest)?;
                continue;
            }

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mode = entry.header().mode().unwrap_or(0o644);
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| NahError::new(ErrorKind::ArchiveUnsafe, "extract_to_staging", e.to_string()))?;
            fs::write(&dest, &buf)?;
            crate::paths::set_executable(&dest, mode & 0o100 != 0)?;

            if entry_path == Path::new(manifest_name) {
                saw_manifest = true;
            }
        }

        if !saw_manifest {
            return Err(NahError::new(
                ErrorKind::InvalidManifest,
                "extract_to_staging",
                format!("archive missing required {} at its root", manifest_name),
            ));
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(staging),
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_manifest(dir: &Path, name: &str) {
        fs::write(dir.join(name), br#"{"$schema":"nak.v1"}"#).unwrap();
    }

    #[test]
    fn pack_then_extract_round_trips_contents() {
        let src = tempfile::tempdir().unwrap();
        write_manifest(src.path(), NAK_MANIFEST);
        fs::create_dir_all(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/run"), b"#!/bin/sh\necho hi\n").unwrap();
        crate::paths::set_executable(&src.path().join("bin/run"), true).unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("x.nak");
        pack_directory(src.path(), &archive_path, NAK_MANIFEST).unwrap();

        let staging_parent = tempfile::tempdir().unwrap();
        let staged = extract_to_staging(&archive_path, staging_parent.path(), NAK_MANIFEST).unwrap();

        assert!(staged.join(NAK_MANIFEST).is_file());
        assert!(staged.join("bin/run").is_file());
        assert!(is_executable(&staged.join("bin/run")).unwrap());
    }

    #[test]
    fn pack_rejects_directory_without_manifest() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("readme.txt"), b"hi").unwrap();
        let out = tempfile::tempdir().unwrap();
        let err = pack_directory(src.path(), &out.path().join("x.nak"), NAK_MANIFEST).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidManifest);
    }

    #[test]
    fn extract_rejects_traversal_entry() {
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("evil.nak");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = Builder::new(encoder);
            let mut header = Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "../../etc/evil", &b"hi"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        }
        let staging_parent = tempfile::tempdir().unwrap();
        let err = extract_to_staging(&archive_path, staging_parent.path(), NAK_MANIFEST).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArchiveUnsafe);
    }

    #[test]
    fn extract_rejects_missing_manifest() {
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("nomanifest.nak");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = Builder::new(encoder);
            let mut header = Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "readme.txt", &b"hi"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        }
        let staging_parent = tempfile::tempdir().unwrap();
        let err = extract_to_staging(&archive_path, staging_parent.path(), NAK_MANIFEST).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidManifest);
    }
}
