//! Per invocation state shared by the lifecycle operations.

use std::path::{Path, PathBuf};

use chrono::Utc;

/// Enables stage timestamps when set to `1`.
pub const TIMESTAMPS_ENV: &str = "URUNC_TIMESTAMPS";

/// Records that a container reached a named stage of its lifecycle.
pub trait Metrics {
    fn capture(&self, container_id: &str, stage: &str);
}

/// Emits one `urunc::timestamps` event per stage.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn capture(&self, container_id: &str, stage: &str) {
        tracing::info!(
            target: "urunc::timestamps",
            container_id,
            stage,
            timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        );
    }
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn capture(&self, _container_id: &str, _stage: &str) {}
}

/// Picks the metrics sink requested through [`TIMESTAMPS_ENV`].
pub fn metrics_from_env() -> Box<dyn Metrics> {
    match std::env::var(TIMESTAMPS_ENV).as_deref() {
        Ok("1") => Box::new(TracingMetrics),
        _ => Box::new(NoopMetrics),
    }
}

/// Built once in `main` and handed to every lifecycle entry point.
pub struct RuntimeContext {
    root: PathBuf,
    metrics: Box<dyn Metrics>,
}

impl RuntimeContext {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self::with_metrics(root, metrics_from_env())
    }

    pub fn with_metrics<P: Into<PathBuf>>(root: P, metrics: Box<dyn Metrics>) -> Self {
        Self {
            root: root.into(),
            metrics,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runtime private directory of `container_id`.
    pub fn container_root(&self, container_id: &str) -> PathBuf {
        self.root.join(container_id)
    }

    pub fn capture(&self, container_id: &str, stage: &str) {
        self.metrics.capture(container_id, stage);
    }
}
