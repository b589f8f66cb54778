//! Container management
//! A unikernel container is created by re-invoking the runtime inside fresh
//! namespaces. The reexec'd process waits on a handshake until `start`
//! releases it, then replaces itself with the hypervisor.
pub mod builder;
mod builder_impl;
#[allow(clippy::module_inception)]
mod container;
mod container_delete;
mod container_kill;
mod container_start;
pub mod init_builder;
pub mod state;
pub use container::Container;
pub use state::{ContainerStatus, State};
