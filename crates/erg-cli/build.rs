//! Stamps the binary's long version with the commit and commit date when
//! built from a git checkout.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=ERG_COMMIT");
    println!("cargo:rerun-if-env-changed=ERG_BUILD_DATE");

    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let from_git = || {
        let out = Command::new("git").args(["log", "-1", "--format=%h %cs"]).output().ok()?;
        if !out.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&out.stdout).into_owned();
        let mut parts = text.split_whitespace();
        Some((parts.next()?.to_string(), parts.next()?.to_string()))
    };
    let stamp = match (std::env::var("ERG_COMMIT"), std::env::var("ERG_BUILD_DATE")) {
        (Ok(commit), Ok(date)) => Some((commit, date)),
        _ => from_git(),
    };

    let long = match stamp {
        Some((commit, date)) => format!("{version} (commit {commit}, {date})"),
        None => version,
    };
    println!("cargo:rustc-env=ERG_VERSION_LONG={long}");
}
