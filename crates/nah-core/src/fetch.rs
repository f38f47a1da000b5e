//! Artifact fetch (§4.B, second half): `file:` and `https:` references,
//! each carrying a mandatory SHA-256 digest that is verified before the
//! bytes are admitted anywhere. Uses a bounded `ureq::Agent` with a
//! stricter, always-blocking contract than a default client: TLS
//! verify is never turned off, redirects are capped, and both a
//! connect and a total timeout apply.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::{ErrorKind, NahError, Result};
use crate::hash::{hash_bytes, is_valid_sha256_hex};

/// Cooperative cancellation token checked between retry attempts and
/// between chunks of a long extraction (§5, §11).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A reference that has been fetched and verified: raw bytes plus the
/// digest they were checked against.
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

/// A parsed fetch reference: either local bytes or an HTTPS URL, each
/// paired with the digest it must satisfy.
pub enum FetchReference<'a> {
    File { path: &'a Path, sha256: &'a str },
    Https { url: &'a str, sha256: &'a str },
}

/// Parses `file:<path>#sha256=<hex>` or `https://...#sha256=<hex>`
/// into a `FetchReference`. The digest is mandatory on both schemes
/// per §4.B ("alongside the reference" for file:).
pub fn parse_reference(reference: &str) -> Result<(String, String)> {
    if let Some(rest) = reference.strip_prefix("http://") {
        let _ = rest;
        return Err(NahError::new(
            ErrorKind::InsecureScheme,
            "parse_reference",
            "http:// is not a supported scheme",
        ));
    }

    let (base, fragment) = match reference.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (reference, None),
    };

    let sha256 = fragment
        .and_then(|f| f.strip_prefix("sha256="))
        .ok_or_else(|| {
            NahError::new(
                ErrorKind::InvalidReference,
                "parse_reference",
                "missing #sha256=<hex> digest",
            )
        })?;

    if !is_valid_sha256_hex(sha256) {
        return Err(NahError::new(
            ErrorKind::InvalidReference,
            "parse_reference",
            "malformed sha256 digest",
        ));
    }

    Ok((base.to_string(), sha256.to_string()))
}

/// Reads and verifies a `file:` reference.
pub fn fetch_file(path: &str, expected_sha256: &str) -> Result<FetchedArtifact> {
    let p = path.strip_prefix("file:").unwrap_or(path);
    let bytes = fs::read(p).map_err(|e| {
        NahError::new(ErrorKind::IoError, "fetch_file", e.to_string())
            .with_details(serde_json::json!({ "path": p }))
    })?;
    verify_and_wrap(bytes, expected_sha256, "fetch_file")
}

/// GETs and verifies an `https:` reference with a bounded, retrying
/// agent (TLS verify ON, redirect cap, connect+total timeout).
pub fn fetch_https(url: &str, expected_sha256: &str, cfg: &FetchConfig) -> Result<FetchedArtifact> {
    if url.starts_with("http://") {
        return Err(NahError::new(
            ErrorKind::InsecureScheme,
            "fetch_https",
            "http:// is not a supported scheme",
        ));
    }
    if !url.starts_with("https://") {
        return Err(NahError::new(
            ErrorKind::InvalidReference,
            "fetch_https",
            "unsupported scheme",
        ));
    }

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(cfg.total_timeout_secs))
        .redirects(cfg.redirect_cap)
        .build();

    let mut attempt = 0u32;
    loop {
        match agent.get(url).call() {
            Ok(resp) => {
                let mut bytes = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut bytes)
                    .map_err(|e| NahError::new(ErrorKind::IoError, "fetch_https", e.to_string()))?;
                return verify_and_wrap(bytes, expected_sha256, "fetch_https");
            }
            Err(ureq::Error::Status(status, _)) if status >= 500 && attempt < cfg.retry_count => {
                attempt += 1;
                thread::sleep(backoff_delay(attempt));
            }
            Err(e) => {
                return Err(NahError::new(ErrorKind::IoError, "fetch_https", e.to_string())
                    .with_details(serde_json::json!({ "url": url })));
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base_ms = 250u64 * (1u64 << attempt.min(4));
    let jitter = rand::thread_rng().gen_range(0..base_ms.max(1) / 4 + 1);
    Duration::from_millis(base_ms + jitter)
}

fn verify_and_wrap(bytes: Vec<u8>, expected_sha256: &str, operation: &str) -> Result<FetchedArtifact> {
    let actual = hash_bytes(&bytes);
    if actual != expected_sha256 {
        return Err(NahError::new(ErrorKind::HashMismatch, operation, "digest mismatch")
            .with_details(serde_json::json!({ "expected": expected_sha256, "actual": actual })));
    }
    Ok(FetchedArtifact { bytes, sha256: actual })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parse_reference_extracts_digest() {
        let digest = "a".repeat(64);
        let reference = format!("file:/tmp/x.nap#sha256={}", digest);
        let (base, sha) = parse_reference(&reference).unwrap();
        assert_eq!(base, "file:/tmp/x.nap");
        assert_eq!(sha, digest);
    }

    #[test]
    fn parse_reference_rejects_http() {
        let err = parse_reference("http://example.com/x#sha256=aa").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsecureScheme);
    }

    #[test]
    fn parse_reference_rejects_missing_digest() {
        let err = parse_reference("https://example.com/x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidReference);
    }

    #[test]
    fn fetch_file_verifies_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"hello world").unwrap();
        let digest = hash_bytes(b"hello world");
        let artifact = fetch_file(path.to_str().unwrap(), &digest).unwrap();
        assert_eq!(artifact.bytes, b"hello world");
    }

    #[test]
    fn fetch_file_rejects_mismatched_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"hello world").unwrap();
        let wrong = "0".repeat(64);
        let err = fetch_file(path.to_str().unwrap(), &wrong).unwrap_err();
        assert_eq!(err.kind, ErrorKind::HashMismatch);
    }
}
