//! Resolves ambient process configuration: which NAH root to operate
//! on and fetch tuning. Host-level configuration that is part of the
//! data model itself (`host/nah.json`) lives in `manifest::host`, not
//! here — this module is only the "where do I look" layer, env-first
//! since the core has no CLI of its own to hand it a dotfile path.

use std::env;
use std::path::PathBuf;

/// Tuning knobs for the fetch component (§4.B), overridable via env.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub connect_timeout_secs: u64,
    pub total_timeout_secs: u64,
    pub redirect_cap: u32,
    pub retry_count: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            connect_timeout_secs: 30,
            total_timeout_secs: 300,
            redirect_cap: 10,
            retry_count: 2,
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let mut cfg = FetchConfig::default();
        if let Ok(v) = env::var("NAH_FETCH_CONNECT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                cfg.connect_timeout_secs = n;
            }
        }
        if let Ok(v) = env::var("NAH_FETCH_TOTAL_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                cfg.total_timeout_secs = n;
            }
        }
        if let Ok(v) = env::var("NAH_FETCH_RETRY_COUNT") {
            if let Ok(n) = v.parse() {
                cfg.retry_count = n;
            }
        }
        cfg
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        env::var("HOME").ok().map(PathBuf::from)
    }
    #[cfg(windows)]
    {
        env::var("USERPROFILE").ok().map(PathBuf::from)
    }
}

/// Resolve the NAH root: `explicit` (e.g. a CLI `--root` flag) wins,
/// then `NAH_ROOT`, then `$HOME/.nah`.
pub fn resolve_root(explicit: Option<&str>) -> PathBuf {
    if let Some(p) = explicit {
        return PathBuf::from(p);
    }
    if let Ok(p) = env::var("NAH_ROOT") {
        return PathBuf::from(p);
    }
    let base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(".nah")
}
