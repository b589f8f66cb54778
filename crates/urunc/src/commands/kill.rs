//! Contains functionality of kill container command
use anyhow::{Context, Result};
use libunikontainer::context::RuntimeContext;
use libunikontainer::signal::Signal;
use liboci_cli::Kill;

use super::{hand_off_to_runc, load_container, Lookup};

pub fn kill(args: Kill, ctx: &RuntimeContext) -> Result<()> {
    let mut container = match load_container(ctx, &args.container_id)? {
        Lookup::Unikernel(container) => container,
        Lookup::Foreign => return hand_off_to_runc(ctx, &args.container_id),
    };
    let signal = Signal::try_from(args.signal.as_str())?;
    container
        .kill(ctx, signal, args.all)
        .with_context(|| format!("failed to kill container {}", args.container_id))
}
