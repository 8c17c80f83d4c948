use std::env;
use std::process::Command;

use anyhow::{bail, Context, Result};

const EBPF_PACKAGE: &str = "planscout-ebpf";
const EBPF_TARGET: &str = "bpfel-unknown-none";
const GENERATED_SOURCE: &str = "planscout-ebpf/src/generated.rs";

/// Nightly pin for the collector build; build-std needs one. Override
/// with PLANSCOUT_EBPF_TOOLCHAIN to try a newer snapshot.
const EBPF_TOOLCHAIN_ENV: &str = "PLANSCOUT_EBPF_TOOLCHAIN";
const EBPF_TOOLCHAIN_PIN: &str = "nightly-2024-12-10";

fn main() -> Result<()> {
    let command = env::args().nth(1);
    match command.as_deref() {
        Some("codegen") => codegen(),
        Some("build-ebpf") => build_ebpf(),
        Some(other) => {
            eprintln!("Unknown command: {other}");
            usage();
            std::process::exit(1);
        }
        None => {
            usage();
            std::process::exit(1);
        }
    }
}

fn usage() {
    eprintln!("Usage: cargo xtask <command>");
    eprintln!("Commands:");
    eprintln!("  codegen       Regenerate {GENERATED_SOURCE} from the OU catalog");
    eprintln!("  build-ebpf    Build the collector object for {EBPF_TARGET}");
}

fn codegen() -> Result<()> {
    let status = Command::new("cargo")
        .args(["run", "--package", "scoutd", "--"])
        .args(["--emit-collector", GENERATED_SOURCE])
        .status()
        .context("run scoutd --emit-collector")?;

    if !status.success() {
        bail!("codegen exited with {status}");
    }

    println!("regenerated {GENERATED_SOURCE}");
    Ok(())
}

fn build_ebpf() -> Result<()> {
    let toolchain =
        env::var(EBPF_TOOLCHAIN_ENV).unwrap_or_else(|_| EBPF_TOOLCHAIN_PIN.to_string());

    // The collector is a core-only binary; libcore is rebuilt for the
    // BPF target, which is why the pinned nightly is selected here
    // rather than by the workspace toolchain.
    let mut build = Command::new("cargo");
    build.arg(format!("+{toolchain}"));
    build.args(["build", "--package", EBPF_PACKAGE, "--release"]);
    build.args(["--target", EBPF_TARGET]);
    build.args(["-Z", "build-std=core"]);

    let status = build
        .status()
        .with_context(|| format!("run cargo {toolchain} for the {EBPF_PACKAGE} build"))?;

    if !status.success() {
        bail!("collector build exited with {status}");
    }

    println!("collector object: target/{EBPF_TARGET}/release/{EBPF_PACKAGE}");
    Ok(())
}
