//! Unikernel configuration carried by a bundle.
//!
//! The configuration is read either from the OCI spec annotations or, when
//! none of them are set, from a `urunc.json` file at the top of the rootfs.
//! Values are base64 encoded in both places.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

pub const ANNOT_TYPE: &str = "com.urunc.unikernel.unikernelType";
pub const ANNOT_VERSION: &str = "com.urunc.unikernel.unikernelVersion";
pub const ANNOT_BINARY: &str = "com.urunc.unikernel.binary";
pub const ANNOT_CMDLINE: &str = "com.urunc.unikernel.cmdline";
pub const ANNOT_HYPERVISOR: &str = "com.urunc.unikernel.hypervisor";
pub const ANNOT_INITRD: &str = "com.urunc.unikernel.initrd";
pub const ANNOT_BLOCK: &str = "com.urunc.unikernel.block";
pub const ANNOT_BLOCK_MNT_POINT: &str = "com.urunc.unikernel.blkMntPoint";
pub const ANNOT_USE_DM_BLOCK: &str = "com.urunc.unikernel.useDMBlock";

pub const CONFIG_FILE: &str = "urunc.json";
const USE_DEVMAPPER_ENV: &str = "USE_DEVMAPPER_AS_BLOCK";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bundle carries no unikernel annotations and no {CONFIG_FILE}")]
    NotUnikernel,
    #[error("failed to decode {field}")]
    Decode {
        field: &'static str,
        source: base64::DecodeError,
    },
    #[error("{field} is not valid utf-8")]
    Utf8 {
        field: &'static str,
        source: std::string::FromUtf8Error,
    },
    #[error("missing required unikernel annotation {0}")]
    MissingField(&'static str),
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{0:?} is a directory")]
    IsDirectory(PathBuf),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Decoded unikernel configuration. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnikernelConfig {
    #[serde(rename = "com.urunc.unikernel.unikernelType", default)]
    pub unikernel_type: String,
    #[serde(rename = "com.urunc.unikernel.unikernelVersion", default)]
    pub unikernel_version: String,
    #[serde(rename = "com.urunc.unikernel.cmdline", default)]
    pub cmdline: String,
    #[serde(rename = "com.urunc.unikernel.binary", default)]
    pub binary: String,
    #[serde(rename = "com.urunc.unikernel.hypervisor", default)]
    pub hypervisor: String,
    #[serde(rename = "com.urunc.unikernel.initrd", default)]
    pub initrd: String,
    #[serde(rename = "com.urunc.unikernel.block", default)]
    pub block: String,
    #[serde(rename = "com.urunc.unikernel.blkMntPoint", default)]
    pub blk_mnt_point: String,
    #[serde(rename = "com.urunc.unikernel.useDMBlock", default)]
    pub use_dm_block: String,
}

impl UnikernelConfig {
    /// Resolves the configuration of the bundle at `bundle`. Returns
    /// [`ConfigError::NotUnikernel`] when neither source is present.
    pub fn resolve(bundle: &Path, spec: &Spec) -> Result<Self> {
        let config = match Self::from_spec(spec) {
            Some(config) => {
                tracing::debug!("using unikernel annotations from the OCI spec");
                config
            }
            None => {
                let rootfs = spec
                    .root()
                    .as_ref()
                    .map(|r| r.path().to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("rootfs"));
                let rootfs = if rootfs.is_absolute() {
                    rootfs
                } else {
                    bundle.join(rootfs)
                };
                let config_path = rootfs.join(CONFIG_FILE);
                match Self::from_file(&config_path)? {
                    Some(config) => {
                        tracing::debug!(?config_path, "using unikernel config file");
                        config
                    }
                    None => return Err(ConfigError::NotUnikernel),
                }
            }
        };

        let config = config.decode()?;
        config.validate()?;
        tracing::info!(
            unikernel_type = config.unikernel_type,
            hypervisor = config.hypervisor,
            binary = config.binary,
            version = config.unikernel_version,
            "resolved unikernel configuration"
        );
        Ok(config)
    }

    fn from_spec(spec: &Spec) -> Option<Self> {
        let annotations = spec.annotations().as_ref()?;
        let get = |key: &str| annotations.get(key).cloned().unwrap_or_default();
        let config = Self {
            unikernel_type: get(ANNOT_TYPE),
            unikernel_version: get(ANNOT_VERSION),
            cmdline: get(ANNOT_CMDLINE),
            binary: get(ANNOT_BINARY),
            hypervisor: get(ANNOT_HYPERVISOR),
            initrd: get(ANNOT_INITRD),
            block: get(ANNOT_BLOCK),
            blk_mnt_point: get(ANNOT_BLOCK_MNT_POINT),
            use_dm_block: get(ANNOT_USE_DM_BLOCK),
        };

        if config.is_empty() {
            None
        } else {
            Some(config)
        }
    }

    fn from_file(path: &Path) -> Result<Option<Self>> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        };
        if metadata.is_dir() {
            return Err(ConfigError::IsDirectory(path.to_path_buf()));
        }

        let content = fs::read(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            source: err,
        })?;
        let config: Self = serde_json::from_slice(&content).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            source: err,
        })?;
        Ok(Some(config))
    }

    /// Reads an already decoded configuration back from container state
    /// annotations.
    pub fn from_annotations(annotations: &HashMap<String, String>) -> Self {
        let get = |key: &str| annotations.get(key).cloned().unwrap_or_default();
        Self {
            unikernel_type: get(ANNOT_TYPE),
            unikernel_version: get(ANNOT_VERSION),
            cmdline: get(ANNOT_CMDLINE),
            binary: get(ANNOT_BINARY),
            hypervisor: get(ANNOT_HYPERVISOR),
            initrd: get(ANNOT_INITRD),
            block: get(ANNOT_BLOCK),
            blk_mnt_point: get(ANNOT_BLOCK_MNT_POINT),
            use_dm_block: get(ANNOT_USE_DM_BLOCK),
        }
    }

    fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, value)| value.is_empty())
    }

    fn fields(&self) -> [(&'static str, &String); 9] {
        [
            (ANNOT_TYPE, &self.unikernel_type),
            (ANNOT_VERSION, &self.unikernel_version),
            (ANNOT_CMDLINE, &self.cmdline),
            (ANNOT_BINARY, &self.binary),
            (ANNOT_HYPERVISOR, &self.hypervisor),
            (ANNOT_INITRD, &self.initrd),
            (ANNOT_BLOCK, &self.block),
            (ANNOT_BLOCK_MNT_POINT, &self.blk_mnt_point),
            (ANNOT_USE_DM_BLOCK, &self.use_dm_block),
        ]
    }

    fn decode(self) -> Result<Self> {
        Ok(Self {
            unikernel_type: decode_field(ANNOT_TYPE, &self.unikernel_type)?,
            unikernel_version: decode_field(ANNOT_VERSION, &self.unikernel_version)?,
            cmdline: decode_field(ANNOT_CMDLINE, &self.cmdline)?,
            binary: decode_field(ANNOT_BINARY, &self.binary)?,
            hypervisor: decode_field(ANNOT_HYPERVISOR, &self.hypervisor)?,
            initrd: decode_field(ANNOT_INITRD, &self.initrd)?,
            block: decode_field(ANNOT_BLOCK, &self.block)?,
            blk_mnt_point: decode_field(ANNOT_BLOCK_MNT_POINT, &self.blk_mnt_point)?,
            use_dm_block: decode_field(ANNOT_USE_DM_BLOCK, &self.use_dm_block)?,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.unikernel_type.is_empty() {
            return Err(ConfigError::MissingField(ANNOT_TYPE));
        }
        if self.hypervisor.is_empty() {
            return Err(ConfigError::MissingField(ANNOT_HYPERVISOR));
        }
        if self.binary.is_empty() {
            return Err(ConfigError::MissingField(ANNOT_BINARY));
        }
        Ok(())
    }

    /// Non-empty values keyed by their annotation names.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.fields()
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    /// Whether the devmapper snapshot backing the rootfs may be handed to the
    /// guest as its block device. Falls back to the environment when the
    /// annotation is absent; an unparsable value counts as enabled.
    pub fn use_dm_block(&self) -> bool {
        let value = if self.use_dm_block.is_empty() {
            std::env::var(USE_DEVMAPPER_ENV).unwrap_or_default()
        } else {
            self.use_dm_block.clone()
        };
        if value.is_empty() {
            return false;
        }
        parse_bool(&value).unwrap_or_else(|| {
            tracing::warn!(value, "invalid useDMBlock value, assuming true");
            true
        })
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|err| {
            tracing::error!(field, %err, "failed to decode annotation");
            ConfigError::Decode { field, source: err }
        })?;
    String::from_utf8(decoded).map_err(|err| ConfigError::Utf8 { field, source: err })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use oci_spec::runtime::{RootBuilder, SpecBuilder};
    use serial_test::serial;

    fn encode(value: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(value)
    }

    fn spec_with_annotations(annotations: HashMap<String, String>) -> Result<Spec> {
        Ok(SpecBuilder::default()
            .root(RootBuilder::default().path("rootfs").build()?)
            .annotations(annotations)
            .build()?)
    }

    fn sample_annotations() -> HashMap<String, String> {
        HashMap::from([
            (ANNOT_TYPE.to_string(), encode("rumprun")),
            (ANNOT_HYPERVISOR.to_string(), encode("hvt")),
            (ANNOT_BINARY.to_string(), encode("/guest")),
            (ANNOT_CMDLINE.to_string(), encode("hello")),
        ])
    }

    #[test]
    fn test_resolve_from_annotations() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = spec_with_annotations(sample_annotations())?;
        let config = UnikernelConfig::resolve(tmp.path(), &spec)?;
        assert_eq!(config.unikernel_type, "rumprun");
        assert_eq!(config.hypervisor, "hvt");
        assert_eq!(config.binary, "/guest");
        assert_eq!(config.cmdline, "hello");
        assert_eq!(config.initrd, "");

        let map = config.to_map();
        assert_eq!(map.len(), 4);
        assert_eq!(map.get(ANNOT_BINARY).map(String::as_str), Some("/guest"));
        assert_eq!(UnikernelConfig::from_annotations(&map), config);
        Ok(())
    }

    #[test]
    fn test_malformed_base64_is_fatal() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut annotations = sample_annotations();
        annotations.insert(ANNOT_BINARY.to_string(), "not base64!".to_string());
        let spec = spec_with_annotations(annotations)?;
        let err = UnikernelConfig::resolve(tmp.path(), &spec).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Decode {
                field: ANNOT_BINARY,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn test_missing_required_field() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut annotations = sample_annotations();
        annotations.remove(ANNOT_HYPERVISOR);
        let spec = spec_with_annotations(annotations)?;
        let err = UnikernelConfig::resolve(tmp.path(), &spec).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ANNOT_HYPERVISOR)));
        Ok(())
    }

    #[test]
    fn test_resolve_from_config_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::create_dir_all(tmp.path().join("rootfs"))?;
        let file = serde_json::json!({
            ANNOT_TYPE: encode("unikraft"),
            ANNOT_HYPERVISOR: encode("qemu"),
            ANNOT_BINARY: encode("/unikernel/kernel"),
            ANNOT_VERSION: encode("0.17.0"),
        });
        fs::write(
            tmp.path().join("rootfs").join(CONFIG_FILE),
            serde_json::to_vec(&file)?,
        )?;

        let spec = spec_with_annotations(HashMap::new())?;
        let config = UnikernelConfig::resolve(tmp.path(), &spec)?;
        assert_eq!(config.unikernel_type, "unikraft");
        assert_eq!(config.hypervisor, "qemu");
        assert_eq!(config.unikernel_version, "0.17.0");
        Ok(())
    }

    #[test]
    fn test_not_a_unikernel() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let spec = spec_with_annotations(HashMap::new())?;
        assert!(matches!(
            UnikernelConfig::resolve(tmp.path(), &spec),
            Err(ConfigError::NotUnikernel)
        ));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_use_dm_block() {
        std::env::remove_var(USE_DEVMAPPER_ENV);
        let mut config = UnikernelConfig::default();
        assert!(!config.use_dm_block());

        std::env::set_var(USE_DEVMAPPER_ENV, "true");
        assert!(config.use_dm_block());
        std::env::remove_var(USE_DEVMAPPER_ENV);

        config.use_dm_block = "false".to_string();
        assert!(!config.use_dm_block());
        config.use_dm_block = "garbage".to_string();
        assert!(config.use_dm_block());
    }
}
