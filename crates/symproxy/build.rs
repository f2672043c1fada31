use std::io;
use std::process::{Command, Stdio};

fn emit_version_var() -> Result<(), io::Error> {
    let cmd = Command::new("git")
        .args(["describe", "--always", "--dirty=-modified"])
        .stderr(Stdio::inherit())
        .output()?;

    if !cmd.status.success() {
        return Err(io::Error::other(format!(
            "`git describe' failed: {}",
            cmd.status
        )));
    }

    let ver = String::from_utf8_lossy(&cmd.stdout);

    println!("cargo:rustc-env=SYMPROXY_GIT_VERSION={}", ver.trim());
    println!("cargo:rerun-if-env-changed=SYMPROXY_GIT_VERSION");

    Ok(())
}

fn main() {
    // Builds outside of a git checkout only report the crate version.
    emit_version_var().ok();
}
