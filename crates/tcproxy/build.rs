//! Build script for tcproxy
//!
//! Embeds the git revision into the binary at compile time so the proxy
//! can report it in the `X-Taskcluster-Proxy-Revision` response header.

use std::process::Command;

fn main() {
    let revision = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|rev| rev.trim().to_string())
        .unwrap_or_default();

    println!("cargo:rustc-env=TCPROXY_REVISION={}", revision);
    println!("cargo:rerun-if-changed=.git/HEAD");
}
