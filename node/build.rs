use std::process::Command;

fn main() {
    // Re-run if CI provides a SHA, or if git HEAD changes locally.
    println!("cargo:rerun-if-env-changed=GITHUB_SHA");
    println!("cargo:rerun-if-env-changed=GIT_COMMIT_HASH");
    println!("cargo:rerun-if-changed=../.git/HEAD");

    for var in ["GIT_COMMIT_HASH", "GITHUB_SHA"] {
        if let Ok(sha) = std::env::var(var) {
            let sha = sha.trim();
            if !sha.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT_HASH={sha}");
                return;
            }
        }
    }

    if let Ok(output) = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output() {
        if output.status.success() {
            let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !sha.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT_HASH={sha}");
            }
        }
    }
}
