use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;

use super::builder::ContainerBuilder;
use super::builder_impl::ContainerBuilderImpl;
use super::state::UNKNOWN_PID;
use super::{Container, ContainerStatus};
use crate::config::{ConfigError, UnikernelConfig};
use crate::context::RuntimeContext;
use crate::error::{ErrInvalidSpec, UnikontainerError};
use crate::network::queue_proxy;

// Builder that can be used to configure the properties of a new container
pub struct InitContainerBuilder {
    base: ContainerBuilder,
    bundle: PathBuf,
}

impl InitContainerBuilder {
    /// Generates the base configuration for a new container from which
    /// configuration methods can be chained
    pub(super) fn new(builder: ContainerBuilder, bundle: PathBuf) -> Self {
        Self {
            base: builder,
            bundle,
        }
    }

    /// Creates a new container. Returns [`UnikontainerError::NotUnikernel`]
    /// before touching any state when the bundle is not a unikernel, and
    /// [`UnikontainerError::QueueProxy`] once a knative sidecar bundle has
    /// been rewritten for runc.
    pub fn build(self, ctx: &RuntimeContext) -> Result<Container, UnikontainerError> {
        let id = self.base.container_id.clone();
        ctx.capture(&id, "TS00");
        let spec = self.load_spec()?;
        if queue_proxy::is_queue_proxy(&spec) {
            queue_proxy::prepare_bundle(&self.bundle)?;
            return Err(UnikontainerError::QueueProxy);
        }
        let config = UnikernelConfig::resolve(&self.bundle, &spec).map_err(|err| match err {
            ConfigError::NotUnikernel => UnikontainerError::NotUnikernel,
            err => {
                tracing::error!(bundle = ?self.bundle, %err, "invalid unikernel configuration");
                err.into()
            }
        })?;
        ctx.capture(&id, "TS01");

        let container_dir = self.create_container_dir()?;
        let mut container = self.create_container_state(&container_dir)?;
        // decoded values win over the encoded spec annotations
        container.merge_annotations(&config.to_map());
        if let Some(annotations) = spec.annotations() {
            container.merge_annotations(annotations);
        }
        container.save()?;
        ctx.capture(&id, "TS02");

        let mut builder_impl = ContainerBuilderImpl {
            syscall: self.base.syscall,
            container_id: self.base.container_id,
            pid_file: self.base.pid_file,
            console_socket: self.base.console_socket,
            reexec_args: self.base.reexec_args,
            spec,
            container,
        };
        builder_impl.create(ctx)?;

        let mut container = builder_impl.container;
        container.refresh_state()?;

        Ok(container)
    }

    fn create_container_dir(&self) -> Result<PathBuf, UnikontainerError> {
        let container_dir = self.base.root_path.join(&self.base.container_id);
        tracing::debug!("container directory will be {:?}", container_dir);

        if container_dir.exists() {
            tracing::error!(id = self.base.container_id, dir = ?container_dir, "container already exists");
            return Err(UnikontainerError::Exist);
        }

        std::fs::create_dir_all(&container_dir).map_err(|err| {
            tracing::error!(
                ?container_dir,
                "failed to create container directory: {}",
                err
            );
            UnikontainerError::OtherIO(err)
        })?;

        Ok(container_dir)
    }

    fn load_spec(&self) -> Result<Spec, UnikontainerError> {
        let source_spec_path = self.bundle.join("config.json");
        let mut spec = Spec::load(source_spec_path)?;
        Self::validate_spec(&spec)?;

        spec.canonicalize_rootfs(&self.bundle).map_err(|err| {
            tracing::error!(bundle = ?self.bundle, "failed to canonicalize rootfs: {}", err);
            err
        })?;

        Ok(spec)
    }

    fn validate_spec(spec: &Spec) -> Result<(), UnikontainerError> {
        let version = spec.version();
        if !version.starts_with("1.") {
            tracing::error!(
                "runtime spec has incompatible version '{}'. Only 1.X.Y is supported",
                spec.version()
            );
            Err(ErrInvalidSpec::UnsupportedVersion)?;
        }

        Ok(())
    }

    fn create_container_state(&self, container_dir: &Path) -> Result<Container, UnikontainerError> {
        let container = Container::new(
            &self.base.container_id,
            ContainerStatus::Creating,
            UNKNOWN_PID,
            &self.bundle,
            container_dir,
        )?;
        container.save()?;
        Ok(container)
    }
}
