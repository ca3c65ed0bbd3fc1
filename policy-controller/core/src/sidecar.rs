use crate::k8s::{Container, Volume};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The containers and volumes added to every injected pod.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sidecar config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid sidecar config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("sidecar config {} defines no containers", path.display())]
    Empty { path: PathBuf },
}

impl SidecarConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(
            path = %path.display(),
            sha256 = %format!("{:x}", Sha256::digest(&data)),
            "Loaded sidecar config"
        );

        let config: Self = serde_yaml::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.containers.is_empty() {
            return Err(ConfigError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
containers:
  - name: monitor-sidecar
    image: cluster-monitor/sidecar:latest
    volumeMounts:
      - name: log-data
        mountPath: /log-data
volumes:
  - name: log-data
    emptyDir: {{}}
"#
        )
        .unwrap();

        let config = SidecarConfig::load(file.path()).expect("config must load");
        assert_eq!(config.containers.len(), 1);
        assert_eq!(config.containers[0].name, "monitor-sidecar");
        assert_eq!(config.volumes.len(), 1);
        assert!(config.volumes[0].empty_dir.is_some());
    }

    #[test]
    fn missing_file() {
        let err = SidecarConfig::load("/nonexistent/sidecar.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }), "{err}");
    }

    #[test]
    fn no_containers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "volumes: []").unwrap();
        let err = SidecarConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Empty { .. }), "{err}");
    }

    #[test]
    fn malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "containers: 7").unwrap();
        let err = SidecarConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }
}
