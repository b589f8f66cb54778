//! Starts execution of the container
use anyhow::{Context, Result};
use libunikontainer::context::RuntimeContext;
use liboci_cli::Start;

use super::{hand_off_to_runc, load_container, Lookup};

pub fn start(args: Start, ctx: &RuntimeContext) -> Result<()> {
    let mut container = match load_container(ctx, &args.container_id)? {
        Lookup::Unikernel(container) => container,
        Lookup::Foreign => return hand_off_to_runc(ctx, &args.container_id),
    };
    container
        .start(ctx)
        .with_context(|| format!("failed to start container {}", args.container_id))
}
