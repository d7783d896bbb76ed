use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

#[derive(Parser)]
enum Cli {
    /// Build the eBPF socket filter for bpfel-unknown-none.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything: the socket filter first, then the userspace agent.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run with sudo.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the binary.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the socket tests that need CAP_NET_RAW, with sudo.
    TestPrivileged,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_userspace(release)?;
            run(release, &args)
        }
        Cli::TestPrivileged => test_privileged(),
    }
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../ringtap-ebpf"));
    cmd.args([
        "+nightly",
        "build",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for eBPF")?;
    anyhow::ensure!(status.success(), "eBPF build failed");
    Ok(())
}

fn build_userspace(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--workspace"]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for workspace")?;
    anyhow::ensure!(status.success(), "workspace build failed");
    Ok(())
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let profile = if release { "release" } else { "debug" };
    let bin = format!("target/{profile}/ringtap");

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    // Point the agent at the socket filter just built unless told otherwise.
    if !extra_args.iter().any(|a| a.starts_with("--ebpf-object")) {
        cmd.arg("--ebpf-object");
        cmd.arg(format!(
            "ringtap-ebpf/target/bpfel-unknown-none/{profile}/ringtap"
        ));
    }
    cmd.args(extra_args);
    let status = cmd.status().context("failed to run ringtap")?;
    anyhow::ensure!(status.success(), "ringtap exited with error");
    Ok(())
}

fn test_privileged() -> anyhow::Result<()> {
    let status = Command::new("sudo")
        .args(["-E", "cargo", "test", "-p", "ringtap", "--", "--ignored"])
        .status()
        .context("failed to run privileged tests")?;
    anyhow::ensure!(status.success(), "privileged tests failed");
    Ok(())
}
