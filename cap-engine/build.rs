//! Stamps the binary with the identification `/api/buildinfo` and the
//! startup log report: `GIT_HASH`, `BUILD_TIMESTAMP`, `BUILD_PROFILE`.
//!
//! No `rerun-if-changed` lines are emitted, so cargo reruns this on every
//! build and the stamp stays current.

use std::process::Command;

const UNKNOWN: &str = "unknown";

fn main() {
    let stamps = [
        ("GIT_HASH", git_hash().unwrap_or_else(|| UNKNOWN.to_string())),
        ("BUILD_TIMESTAMP", build_timestamp()),
        ("BUILD_PROFILE", std::env::var("PROFILE").unwrap_or_else(|_| UNKNOWN.to_string())),
    ];

    for (key, value) in stamps {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Short commit of the checkout, with a `-dirty` suffix for local edits
fn git_hash() -> Option<String> {
    let hash = git(&["rev-parse", "--short=8", "HEAD"])?;
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"]).map_or(false, |s| !s.is_empty());
    Some(if dirty { format!("{}-dirty", hash) } else { hash })
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}

fn build_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
