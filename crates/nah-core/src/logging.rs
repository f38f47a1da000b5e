//! Timestamped logging to a sink under the NAH root plus stdout, the
//! way every command-line tool in this lineage reports what it did.
//! Transport is deliberately dumb: one file, append-only, dedup the
//! last line so repeated calls in a tight loop don't spam it.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

pub const LOG_FILE: &str = "nah.log";

fn is_quiet() -> bool {
    if env::var("NAH_QUIET").map(|v| v == "1" || v == "true").unwrap_or(false) {
        return true;
    }
    env::var("NAH_LOG_LEVEL")
        .map(|v| v.eq_ignore_ascii_case("quiet") || v.eq_ignore_ascii_case("error"))
        .unwrap_or(false)
}

fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}

/// Append a structured log line under `root`, mirrored to stdout unless quiet.
pub fn log(root: &Path, operation: &str, message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("[{}] {}: {}", timestamp, operation, message);

    if !is_quiet() {
        println!("{}", line);
    }

    let path = log_path(root);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let mut should_write = true;
    if let Ok(contents) = fs::read_to_string(&path) {
        if let Some(last_line) = contents.lines().last() {
            if last_line == line {
                should_write = false;
            }
        }
    }
    if should_write {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

pub fn log_error(root: &Path, operation: &str, message: &str) {
    eprintln!("{}: {}", operation, message);
    log(root, operation, message);
}
