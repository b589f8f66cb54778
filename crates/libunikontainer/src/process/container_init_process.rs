use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{self, Gid, Uid};
use oci_spec::runtime::{Spec, User};

use super::exec_plan::ExecPlan;
use crate::config::UnikernelConfig;
use crate::container::{Container, ContainerStatus};
use crate::context::RuntimeContext;
use crate::error::UnikontainerError;
use crate::hooks::{self, HookStage};
use crate::ipc::{self, IpcListener, IpcMessage};
use crate::namespaces::Namespaces;
use crate::network::{self, create_network_provider, NetworkType, TapOwner};
use crate::rootfs::{block, MonitorRequirements, RootFS};
use crate::syscall::syscall::create_syscall;
use crate::syscall::Syscall;
use crate::unikernel::{new_unikernel, Unikernel};
use crate::utils;
use crate::vmm::{new_vmm, Firecracker, Vmm, VmmKind};

/// Entry point of the reexec'd process. Runs the container side of the
/// handshake and then replaces itself with the hypervisor; it only returns
/// on failure.
pub fn container_init_process(
    ctx: &RuntimeContext,
    container_root: &Path,
) -> Result<Infallible, UnikontainerError> {
    let mut container = Container::load(container_root.to_path_buf())?;
    let id = container.id().to_string();

    // listen before BOOTED so the engine's ACK always finds the socket
    let ctrl = IpcListener::new(container.ctrl_socket())?;
    ipc::send_message_retrying(container.init_socket(), IpcMessage::Booted)?;
    ctrl.await_message(IpcMessage::Ack)?;
    tracing::debug!(id, "create acknowledged, waiting for start");
    ctrl.await_message(IpcMessage::Start)?;
    ctrl.close();
    ctx.capture(&id, "TS14");

    container.refresh_state()?;
    let spec = container.spec()?;
    hooks::run_stage(&spec, HookStage::Prestart, &container.state).map_err(|err| {
        tracing::error!(%err, "failed to run prestart hooks");
        err
    })?;

    exec_unikernel(ctx, &mut container, &spec)
}

/// Prepares network, storage and root filesystem, then execs the monitor.
fn exec_unikernel(
    ctx: &RuntimeContext,
    container: &mut Container,
    spec: &Spec,
) -> Result<Infallible, UnikontainerError> {
    let id = container.id().to_string();
    ctx.capture(&id, "TS15");
    let config = container.unikernel_config();
    let syscall = create_syscall();
    let mut plan = ExecPlan::new(&id, spec, &config);

    let network_type = NetworkType::from_annotations(Some(container.annotations()));
    tracing::info!(?network_type, "retrieved network type");
    let provider = create_network_provider();
    let owner = tap_owner(spec);
    let network_info = network::setup(network_type, provider.as_ref(), owner).unwrap_or_else(|err| {
        tracing::error!(%err, "failed to set up network, running the guest without it");
        None
    });
    plan.set_network(network_info.as_ref());
    ctx.capture(&id, "TS16");

    let mut unikernel = new_unikernel(&config.unikernel_type)?;
    let rootfs_dir = utils::rootfs_dir(container.bundle(), spec);
    let dm_device = prepare_block(&mut plan, &config, unikernel.as_ref(), &rootfs_dir, syscall.as_ref())?;
    ctx.capture(&id, "TS17");

    let vmm = new_vmm(&config.hypervisor)?;
    prepare_rootfs(spec, &rootfs_dir, vmm.as_ref(), &plan, dm_device)?;

    unikernel.init(&plan.params)?;
    plan.args.command = unikernel.command_string()?;
    tracing::debug!(command = plan.args.command, "guest command line");

    container.set_status(ContainerStatus::Running).save()?;
    hooks::run_stage(spec, HookStage::StartContainer, &container.state).map_err(|err| {
        tracing::error!(%err, "failed to run start container hooks");
        err
    })?;
    ctx.capture(&id, "TS18");

    if vmm.kind() == VmmKind::Firecracker {
        create_world_writable(&Firecracker::config_path(&plan.args.unikernel_path))?;
    }
    if let Some(user) = spec.process().as_ref().map(|p| p.user()) {
        setup_user(user, syscall.as_ref())?;
    }

    tracing::info!(id, vmm = vmm.kind().as_str(), "calling vmm execve");
    Ok(vmm.execve(&plan.args, unikernel.as_ref())?)
}

/// Picks the block device of the guest: the configured one, or the
/// devmapper snapshot backing the rootfs when that is enabled and its
/// filesystem is understood by the guest. Returns the host device handed
/// over in the latter case.
fn prepare_block(
    plan: &mut ExecPlan,
    config: &UnikernelConfig,
    unikernel: &dyn Unikernel,
    rootfs_dir: &Path,
    syscall: &dyn Syscall,
) -> Result<Option<PathBuf>, UnikontainerError> {
    if plan.use_configured_block(config, unikernel) {
        return Ok(None);
    }
    if !unikernel.supports_block() || !config.use_dm_block() {
        return Ok(None);
    }

    let mount = block::get_block_device(rootfs_dir)?;
    if !unikernel.supports_fs(&mount.fstype) {
        tracing::info!(fstype = mount.fstype, "guest cannot mount the rootfs filesystem");
        return Ok(None);
    }

    block::prepare_dm_as_block(
        syscall,
        rootfs_dir,
        &plan.args.unikernel_path,
        plan.args.initrd_path.as_deref(),
    )?;
    let device = PathBuf::from(&mount.device);
    plan.set_block(&device);
    tracing::info!(?device, "using the rootfs snapshot as the guest block device");
    Ok(Some(device))
}

/// Moves into the rootfs. With a mount namespace the rootfs is populated
/// with what the monitor needs and becomes the new root.
fn prepare_rootfs(
    spec: &Spec,
    rootfs_dir: &Path,
    vmm: &dyn Vmm,
    plan: &ExecPlan,
    dm_device: Option<PathBuf>,
) -> Result<(), UnikontainerError> {
    unistd::chdir(rootfs_dir).map_err(|err| {
        tracing::error!(?rootfs_dir, %err, "failed to chdir to rootfs");
        err
    })?;

    let linux = spec.linux().as_ref();
    let namespaces = Namespaces::from(linux.and_then(|linux| linux.namespaces().as_ref()));
    if !namespaces.has_mount() {
        tracing::debug!("no mount namespace, running the monitor in the host root");
        return Ok(());
    }

    let rootfs = RootFS::new();
    rootfs.prepare_root(
        rootfs_dir,
        linux.and_then(|linux| linux.rootfs_propagation().as_deref()),
    )?;
    rootfs.prepare_mon_rootfs(
        rootfs_dir,
        &MonitorRequirements {
            monitor_path: vmm.path().to_path_buf(),
            dm_path: dm_device,
            needs_kvm: vmm.kind().uses_kvm(),
            needs_tap: plan.args.tap_device.is_some(),
        },
    )?;
    if let Some(mounts) = spec.mounts() {
        rootfs.mount_volumes(rootfs_dir, mounts)?;
    }
    rootfs.change_root(rootfs_dir, true)?;
    Ok(())
}

/// The monitor may run as an unprivileged user that cannot create files in
/// the rootfs.
fn create_world_writable(path: &Path) -> Result<(), UnikontainerError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o666))?;
    Ok(())
}

/// The monitor opens the TAP after dropping to the process user, so that
/// user has to own it.
fn tap_owner(spec: &Spec) -> TapOwner {
    let (uid, gid) = spec
        .process()
        .as_ref()
        .map_or((0, 0), |process| (process.user().uid(), process.user().gid()));
    TapOwner {
        uid: Uid::from_raw(uid),
        gid: Gid::from_raw(gid),
    }
}

/// Switches to the user named in the OCI spec, supplementary groups first.
fn setup_user(user: &User, syscall: &dyn Syscall) -> Result<(), UnikontainerError> {
    if let Some(additional_gids) = user.additional_gids() {
        if !additional_gids.is_empty() {
            let gids: Vec<Gid> = additional_gids
                .iter()
                .map(|gid| Gid::from_raw(*gid))
                .collect();
            syscall.set_groups(&gids).map_err(|err| {
                tracing::error!(?gids, %err, "failed to set supplementary gids");
                err
            })?;
        }
    }

    syscall.set_id(Uid::from_raw(user.uid()), Gid::from_raw(user.gid()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use oci_spec::runtime::{
        LinuxBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, ProcessBuilder, SpecBuilder,
        UserBuilder,
    };
    use serial_test::serial;

    use super::*;
    use crate::syscall::test::{ArgName, TestHelperSyscall};
    use crate::unikernel::ROOTFS_BLOCK;
    use crate::vmm::Qemu;

    fn test_syscall(syscall: &dyn Syscall) -> &TestHelperSyscall {
        syscall.as_any().downcast_ref().unwrap()
    }

    #[test]
    fn test_setup_user() -> Result<()> {
        let syscall = create_syscall();
        let user = UserBuilder::default()
            .uid(1000u32)
            .gid(1000u32)
            .additional_gids(vec![10, 20])
            .build()?;
        setup_user(&user, syscall.as_ref())?;

        let test = test_syscall(syscall.as_ref());
        assert_eq!(
            test.get_groups_args(),
            vec![vec![Gid::from_raw(10), Gid::from_raw(20)]]
        );
        assert_eq!(
            test.get_set_id_args(),
            vec![(Uid::from_raw(1000), Gid::from_raw(1000))]
        );
        Ok(())
    }

    #[test]
    fn test_tap_owner_follows_process_user() -> Result<()> {
        let spec = SpecBuilder::default()
            .process(
                ProcessBuilder::default()
                    .user(UserBuilder::default().uid(1000u32).gid(1001u32).build()?)
                    .build()?,
            )
            .build()?;
        assert_eq!(
            tap_owner(&spec),
            TapOwner {
                uid: Uid::from_raw(1000),
                gid: Gid::from_raw(1001),
            }
        );

        let owner = tap_owner(&Spec::default());
        assert_eq!(owner.uid, Uid::from_raw(0));
        assert_eq!(owner.gid, Gid::from_raw(0));
        Ok(())
    }

    #[test]
    fn test_setup_user_failure() -> Result<()> {
        let syscall = create_syscall();
        test_syscall(syscall.as_ref()).set_ret_err(ArgName::SetId, || {
            Err(crate::syscall::SyscallError::Nix(nix::errno::Errno::EPERM))
        });
        let user = UserBuilder::default().uid(1000u32).gid(1000u32).build()?;
        assert!(setup_user(&user, syscall.as_ref()).is_err());
        Ok(())
    }

    #[test]
    fn test_prepare_block_configured() -> Result<()> {
        let syscall = create_syscall();
        let config = UnikernelConfig {
            unikernel_type: "rumprun".to_string(),
            block: "/data.img".to_string(),
            ..Default::default()
        };
        let rumprun = new_unikernel("rumprun")?;
        let mut plan = ExecPlan::default();
        let dm = prepare_block(
            &mut plan,
            &config,
            rumprun.as_ref(),
            Path::new("/nonexistent"),
            syscall.as_ref(),
        )?;
        assert_eq!(dm, None);
        assert_eq!(plan.args.block_device.as_deref(), Some("data.img"));
        assert_eq!(plan.params.rootfs_type, ROOTFS_BLOCK);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_prepare_block_without_devmapper() -> Result<()> {
        let syscall = create_syscall();
        let config = UnikernelConfig {
            use_dm_block: "false".to_string(),
            ..Default::default()
        };
        let linux = new_unikernel("linux")?;
        let mut plan = ExecPlan::default();
        let dm = prepare_block(
            &mut plan,
            &config,
            linux.as_ref(),
            Path::new("/nonexistent"),
            syscall.as_ref(),
        )?;
        assert_eq!(dm, None);
        assert!(!plan.has_block());
        Ok(())
    }

    #[test]
    fn test_prepare_block_rootfs_not_mounted() -> Result<()> {
        let syscall = create_syscall();
        let config = UnikernelConfig {
            use_dm_block: "true".to_string(),
            ..Default::default()
        };
        let linux = new_unikernel("linux")?;
        let mut plan = ExecPlan::default();
        let err = prepare_block(
            &mut plan,
            &config,
            linux.as_ref(),
            Path::new("/nonexistent/rootfs"),
            syscall.as_ref(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UnikontainerError::Block(block::BlockError::NotMounted(_))
        ));
        assert!(!plan.has_block());
        Ok(())
    }

    #[test]
    #[serial]
    fn test_prepare_rootfs_without_mount_namespace() -> Result<()> {
        let cwd = std::env::current_dir()?;
        let rootfs = tempfile::tempdir()?;
        let spec = SpecBuilder::default()
            .linux(
                LinuxBuilder::default()
                    .namespaces(vec![LinuxNamespaceBuilder::default()
                        .typ(LinuxNamespaceType::Network)
                        .build()?])
                    .build()?,
            )
            .build()?;
        let qemu = Qemu::with_path(PathBuf::from("/usr/bin/qemu-system-x86_64"));
        let result = prepare_rootfs(&spec, rootfs.path(), &qemu, &ExecPlan::default(), None);
        let now = std::env::current_dir()?;
        std::env::set_current_dir(cwd)?;

        result?;
        assert_eq!(now, fs::canonicalize(rootfs.path())?);
        Ok(())
    }

    #[test]
    fn test_create_world_writable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fc.json");
        create_world_writable(&path)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o666);
        Ok(())
    }
}
