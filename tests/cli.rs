//! Integration tests: run the nah binary end to end and check exit
//! codes and output, against a scratch `--root` so nothing touches the
//! real `$HOME/.nah`.

use std::process::Command;

fn nah() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nah"))
}

fn nah_at(root: &std::path::Path) -> Command {
    let mut cmd = nah();
    cmd.arg("--root").arg(root);
    cmd
}

#[test]
fn test_help() {
    let out = nah().arg("--help").output().unwrap();
    assert!(out.status.success(), "nah --help should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("install"));
    assert!(stdout.contains("compose"));
}

#[test]
fn test_version() {
    let out = nah().arg("--version").output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("1.0.0") || stdout.contains("nah"));
}

#[test]
fn test_list_apps_empty_root_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let out = nah_at(dir.path()).args(["list", "apps"]).output().unwrap();
    assert!(out.status.success(), "nah list apps on an empty root should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("No apps installed"));
}

#[test]
fn test_show_missing_app_fails_with_not_installed_code() {
    let dir = tempfile::tempdir().unwrap();
    let out = nah_at(dir.path()).args(["show", "app", "com.example.app"]).output().unwrap();
    assert!(!out.status.success());
    assert_eq!(out.status.code(), Some(3), "a missing app should exit with the not_installed code");
}

#[test]
fn test_install_missing_reference_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = nah_at(dir.path())
        .args(["install", &format!("file:./does-not-exist.nap#sha256={}", "0".repeat(64))])
        .output()
        .unwrap();
    assert!(!out.status.success(), "installing a nonexistent file should fail");
}

#[test]
fn test_install_then_list_then_remove_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(
        staging.join("nap.json"),
        serde_json::json!({
            "$schema": "nap.v1",
            "app": {
                "identity": { "id": "com.example.app", "version": "1.0.0" },
                "execution": { "entrypoint": "bin/app" },
            }
        })
        .to_string(),
    )
    .unwrap();
    std::fs::create_dir_all(staging.join("bin")).unwrap();
    std::fs::write(staging.join("bin/app"), b"#!/bin/sh\nexit 0\n").unwrap();

    let archive_path = dir.path().join("app.nap");
    let pack_out = nah_at(dir.path()).args(["pack"]).arg(&staging).arg(&archive_path).output().unwrap();
    assert!(pack_out.status.success(), "pack should succeed: {}", String::from_utf8_lossy(&pack_out.stderr));
    let pack_stdout = String::from_utf8_lossy(&pack_out.stdout);
    let sha256 = pack_stdout
        .rsplit_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(")\n").or_else(|| rest.strip_suffix(')')))
        .expect("pack output should end with (sha256)")
        .to_string();

    let install_out = nah_at(dir.path())
        .args(["install", &format!("file:{}#sha256={}", archive_path.display(), sha256)])
        .output()
        .unwrap();
    assert!(install_out.status.success(), "install should succeed: {}", String::from_utf8_lossy(&install_out.stderr));

    let list_out = nah_at(dir.path()).args(["list", "apps"]).output().unwrap();
    assert!(list_out.status.success());
    assert!(String::from_utf8_lossy(&list_out.stdout).contains("com.example.app@1.0.0"));

    let remove_out = nah_at(dir.path()).args(["remove", "app", "com.example.app", "1.0.0"]).output().unwrap();
    assert!(remove_out.status.success(), "remove should succeed: {}", String::from_utf8_lossy(&remove_out.stderr));

    let list_after = nah_at(dir.path()).args(["list", "apps"]).output().unwrap();
    assert!(String::from_utf8_lossy(&list_after.stdout).contains("No apps installed"));
}

fn pack_and_extract_sha(dir: &std::path::Path, staging: &std::path::Path, archive_path: &std::path::Path) -> String {
    let pack_out = nah_at(dir).args(["pack"]).arg(staging).arg(archive_path).output().unwrap();
    assert!(pack_out.status.success(), "pack should succeed: {}", String::from_utf8_lossy(&pack_out.stderr));
    let pack_stdout = String::from_utf8_lossy(&pack_out.stdout);
    pack_stdout
        .rsplit_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(")\n").or_else(|| rest.strip_suffix(')')))
        .expect("pack output should end with (sha256)")
        .to_string()
}

#[test]
fn test_install_pins_declared_nak_and_show_reflects_it() {
    let dir = tempfile::tempdir().unwrap();

    let nak_staging = dir.path().join("nak-staging");
    std::fs::create_dir_all(&nak_staging).unwrap();
    std::fs::write(
        nak_staging.join("nak.json"),
        serde_json::json!({
            "$schema": "nak.v1",
            "nak": { "identity": { "id": "com.example.sdk", "version": "1.2.3" } }
        })
        .to_string(),
    )
    .unwrap();
    let nak_archive = dir.path().join("sdk.nak");
    let nak_sha256 = pack_and_extract_sha(dir.path(), &nak_staging, &nak_archive);
    let nak_install = nah_at(dir.path())
        .args(["install", &format!("file:{}#sha256={}", nak_archive.display(), nak_sha256)])
        .output()
        .unwrap();
    assert!(nak_install.status.success(), "nak install should succeed: {}", String::from_utf8_lossy(&nak_install.stderr));

    let app_staging = dir.path().join("app-staging");
    std::fs::create_dir_all(app_staging.join("bin")).unwrap();
    std::fs::write(app_staging.join("bin/app"), b"#!/bin/sh\nexit 0\n").unwrap();
    std::fs::write(
        app_staging.join("nap.json"),
        serde_json::json!({
            "$schema": "nap.v1",
            "app": {
                "identity": {
                    "id": "com.example.app",
                    "version": "1.0.0",
                    "nak_id": "com.example.sdk",
                    "nak_version_req": ">=1.0.0 <2.0.0"
                },
                "execution": { "entrypoint": "bin/app" },
            }
        })
        .to_string(),
    )
    .unwrap();
    let app_archive = dir.path().join("app.nap");
    let app_sha256 = pack_and_extract_sha(dir.path(), &app_staging, &app_archive);
    let app_install = nah_at(dir.path())
        .args(["install", &format!("file:{}#sha256={}", app_archive.display(), app_sha256)])
        .output()
        .unwrap();
    assert!(app_install.status.success(), "app install should succeed: {}", String::from_utf8_lossy(&app_install.stderr));

    let show_out = nah_at(dir.path())
        .args(["--json", "show", "app", "com.example.app", "1.0.0"])
        .output()
        .unwrap();
    assert!(show_out.status.success());
    let record: serde_json::Value = serde_json::from_slice(&show_out.stdout).unwrap();
    assert_eq!(record["nak"]["id"], "com.example.sdk");
    assert_eq!(record["nak"]["version"], "1.2.3");
}
