pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod hooks;
pub mod ipc;
pub mod namespaces;
pub mod network;
pub mod process;
pub mod rootfs;
pub mod signal;
pub mod syscall;
pub mod tty;
pub mod unikernel;
pub mod utils;
pub mod vmm;
pub mod workload;
