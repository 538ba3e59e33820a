use std::env;
use std::process::Command;

fn main() {
    // An explicit GIT_COMMIT from the build environment wins over git.
    if let Ok(commit) = env::var("GIT_COMMIT") {
        println!("cargo:rustc-env=GIT_COMMIT={commit}");
        println!("cargo:rerun-if-env-changed=GIT_COMMIT");
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !commit.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
        }
        Ok(_) => {
            println!("cargo:warning=not a git checkout, commit hash unavailable");
        }
        Err(e) => {
            println!("cargo:warning=failed to execute git: {e}");
        }
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=build.rs");
}
