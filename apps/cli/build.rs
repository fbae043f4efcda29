//! Stamps this tool with its own provenance for `--version`.

use buildinfo_core::{head_watch_paths, GitCli, Resolver};
use std::env;
use std::path::Path;

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let meta = Resolver::new(GitCli::new(&manifest_dir)).resolve();
    println!("cargo:rustc-env=BUILDINFO_COMMIT={}", meta.revision.commit_hash);
    println!("cargo:rustc-env=BUILDINFO_TIMESTAMP={}", meta.timestamp);
    // A missing watched file would make cargo rerun this script on every build.
    let git_dir = Path::new(&manifest_dir).join("../../.git");
    for path in head_watch_paths(&git_dir).into_iter().filter(|p| p.exists()) {
        println!("cargo:rerun-if-changed={}", path.display());
    }
    println!("cargo:rerun-if-changed=build.rs");
}
