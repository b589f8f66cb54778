//! The reexec'd side of the lifecycle: the handshake with the engine and the
//! exec sequence that ends in the hypervisor.

pub mod container_init_process;
pub mod exec_plan;
