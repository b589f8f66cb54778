//! Drives the urunc binary through a create that never gets started and
//! the delete that follows.
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::prelude::*;
use libunikontainer::config::{ANNOT_BINARY, ANNOT_HYPERVISOR, ANNOT_TYPE};
use serial_test::serial;

const URUNC: &str = env!("CARGO_BIN_EXE_urunc");

fn write_bundle(bundle: &Path) -> Result<()> {
    fs::create_dir_all(bundle.join("rootfs"))?;
    let annotations = HashMap::from([
        (ANNOT_TYPE, BASE64_STANDARD.encode("unikraft")),
        (ANNOT_HYPERVISOR, BASE64_STANDARD.encode("qemu")),
        (ANNOT_BINARY, BASE64_STANDARD.encode("/unikernel/app")),
    ]);
    let config = serde_json::json!({
        "ociVersion": "1.0.2",
        "root": { "path": "rootfs" },
        "process": {
            "user": { "uid": 0, "gid": 0 },
            "args": ["/unikernel/app"],
            "cwd": "/"
        },
        "linux": { "namespaces": [{ "type": "network" }] },
        "annotations": annotations,
    });
    fs::write(bundle.join("config.json"), serde_json::to_vec_pretty(&config)?)?;
    Ok(())
}

fn urunc(root: &Path, args: &[&str]) -> Result<()> {
    // the reexec'd child keeps inherited pipes open, so never capture
    let status = Command::new(URUNC)
        .arg("--root")
        .arg(root)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("failed to run urunc {args:?}"))?;
    if !status.success() {
        bail!("urunc {args:?} exited with {status}");
    }
    Ok(())
}

/// A reaped or zombie process counts as dead.
fn is_alive(pid: i64) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

fn wait_until_dead(pid: i64) -> bool {
    for _ in 0..100 {
        if !is_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
#[serial]
fn create_then_delete_leaves_nothing_behind() -> Result<()> {
    // the reexec'd child always gets a fresh network namespace
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let bundle = tempfile::tempdir()?;
    write_bundle(bundle.path())?;
    let bundle_arg = bundle.path().to_string_lossy().into_owned();

    urunc(root.path(), &["create", "--bundle", &bundle_arg, "uk"])?;

    let container_root = root.path().join("uk");
    let state: serde_json::Value =
        serde_json::from_slice(&fs::read(container_root.join("state.json"))?)?;
    assert_eq!(state["status"], "created");
    let pid = state["pid"].as_i64().context("state has no pid")?;
    assert!(pid > 0);
    assert!(is_alive(pid), "the reexec'd process waits for start");

    urunc(root.path(), &["delete", "uk"])?;

    assert!(!container_root.join("init.sock").exists());
    assert!(!container_root.join("ctrl.sock").exists());
    assert!(!container_root.exists());
    assert!(wait_until_dead(pid), "process {pid} outlived delete");
    Ok(())
}
