use std::env;
use std::fs::{read_to_string, write, File};
use std::io::Write;
use std::path::Path;
use std::process::Command;

fn git_describe_value() -> String {
    // Get the output of `git describe`, the GIT_DESCRIBE environment variable,
    // or fall back to the cargo package version for non-git checkouts
    env::var("GIT_DESCRIBE").unwrap_or_else(|_| {
        Command::new("git")
            .args(["describe", "--tags", "--always"])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
    })
}

fn main() {
    // Get the path to the GIT_DESCRIBE file
    let out_dir = env::var("OUT_DIR").unwrap();
    let git_describe = Path::new(&out_dir).join("GIT_DESCRIBE");

    // Read the old GIT_DESCRIBE value from the GIT_DESCRIBE file
    let old_value = read_to_string(&git_describe).unwrap_or_default();

    // Get the current value
    let new_value = git_describe_value();

    // Rewrite the generated constant only when the value changed
    if new_value != old_value || !Path::new(&out_dir).join("git_describe.rs").exists() {
        write(&git_describe, &new_value).unwrap();

        let git_describe_rs = Path::new(&out_dir).join("git_describe.rs");
        let mut f = File::create(&git_describe_rs).unwrap();

        write!(f, "pub const GIT_DESCRIBE: &str = \"{}\";", new_value).unwrap();
    }

    println!("cargo:rerun-if-changed={}", git_describe.display());
    println!("cargo:rerun-if-env-changed=GIT_DESCRIBE");
}
