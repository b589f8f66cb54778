//! Knative pairs every `user-container` with a `queue-proxy` sidecar that
//! forwards requests to it. The guest of a static network sits behind its
//! own address, so the sidecar is pointed there before runc takes it.
use std::path::Path;

use once_cell::sync::Lazy;
use oci_spec::runtime::Spec;
use regex::Regex;

use super::{ANNOT_CONTAINER_NAME, STATIC_GUEST_ADDR};

const QUEUE_PROXY_NAME: &str = "queue-proxy";
const READINESS_ENV: &str = "SERVING_READINESS_PROBE";
const REDIRECT_IP_ENV: &str = "REDIRECT_IP";

static READINESS_HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""host"\s*:\s*"[^"]+""#).unwrap());

pub fn is_queue_proxy(spec: &Spec) -> bool {
    spec.annotations()
        .as_ref()
        .and_then(|a| a.get(ANNOT_CONTAINER_NAME))
        .map_or(false, |name| name == QUEUE_PROXY_NAME)
}

/// Points the readiness check of the sidecar at the guest and tells it
/// where to redirect traffic.
pub fn redirect_to_guest(spec: &mut Spec) {
    let Some(process) = spec.process().as_ref() else {
        return;
    };
    let mut process = process.clone();
    let mut env = process.env().clone().unwrap_or_default();

    if let Some(pos) = env.iter().position(|e| e.starts_with(READINESS_ENV)) {
        let readiness = env.remove(pos);
        let host = format!(r#""host":"{STATIC_GUEST_ADDR}""#);
        env.push(READINESS_HOST_RE.replace_all(&readiness, host.as_str()).into_owned());
    }
    env.push(format!("{REDIRECT_IP_ENV}={STATIC_GUEST_ADDR}"));

    process.set_env(Some(env));
    spec.set_process(Some(process));
}

/// Rewrites `config.json` of `bundle` in place for the sidecar.
pub fn prepare_bundle(bundle: &Path) -> Result<(), oci_spec::OciSpecError> {
    let config = bundle.join("config.json");
    let mut spec = Spec::load(&config)?;
    redirect_to_guest(&mut spec);
    spec.save(&config)?;
    tracing::info!(?config, "queue-proxy redirected to the guest address");
    Ok(())
}
