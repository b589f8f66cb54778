//! # urunc
//! OCI container runtime that boots unikernels. Bundles that carry no
//! unikernel configuration are handed to runc untouched.
mod commands;
mod observability;
mod rootpath;

use anyhow::Result;
use clap::Parser;
use libunikontainer::context::{metrics_from_env, RuntimeContext};
use liboci_cli::{GlobalOpts, StandardCmd};

// High-level commandline option definition
// This takes global options as well as individual commands as specified in [OCI runtime-spec](https://github.com/opencontainers/runtime-spec/blob/master/runtime.md)
// Also check [runc commandline documentation](https://github.com/opencontainers/runc/blob/master/man/runc.8.md) for more explanation
#[derive(Parser, Debug)]
#[clap(version, author = env!("CARGO_PKG_AUTHORS"))]
pub(crate) struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: StandardCmd,
}

/// This is the entry point in the container runtime. The binary is run by a high-level container runtime,
/// with various flags passed. This parses the flags, creates and manages appropriate resources.
fn main() {
    // A malicious guest rootfs could overwrite the host binary through
    // /proc/self/exe (CVE-2019-5736). Re-execute from a sealed memfd copy
    // before anything else runs.
    if let Err(err) = pentacle::ensure_sealed() {
        eprintln!("failed to seal /proc/self/exe: {err:?}");
        std::process::exit(1);
    }

    let opts = Opts::parse();
    let log_to_stderr = opts.global.log.is_none();

    if let Err(err) = observability::init(&opts) {
        eprintln!("log init failed: {err:?}");
    }

    match run(opts) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            tracing::error!("{err:?}");
            if !log_to_stderr {
                eprintln!("{err:?}");
            }
            std::process::exit(1);
        }
    }
}

/// Returns the exit code of the process.
fn run(opts: Opts) -> Result<i32> {
    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );
    let root_path = rootpath::determine(opts.global.root)?;
    let ctx = RuntimeContext::with_metrics(root_path, metrics_from_env());

    match opts.subcmd {
        StandardCmd::Create(create) => commands::create::create(create, &ctx).map(|_| 0),
        StandardCmd::Start(start) => commands::start::start(start, &ctx).map(|_| 0),
        StandardCmd::Kill(kill) => commands::kill::kill(kill, &ctx).map(|_| 0),
        StandardCmd::Delete(delete) => commands::delete::delete(delete, &ctx).map(|_| 0),
        StandardCmd::Run(run) => commands::run::run(run, &ctx),
    }
}
