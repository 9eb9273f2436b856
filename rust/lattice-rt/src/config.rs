//! VM configuration from `lattice.toml`.
//!
//! Searches the current directory then its ancestors for `lattice.toml` and
//! reads the `[vm]` table. Missing files and missing keys fall back to
//! defaults; `LATTICE_GC_STRESS=1` forces stress collection.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "lattice.toml";
pub const GC_STRESS_ENV: &str = "LATTICE_GC_STRESS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GcConfig {
    /// Collect on every allocation check.
    pub stress: bool,
    pub threshold_bytes: usize,
    pub growth_factor: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            stress: false,
            threshold_bytes: 1024 * 1024,
            growth_factor: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectConfig {
    /// Poll arms in a random order.
    pub fair_shuffle: bool,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self { fair_shuffle: true }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    pub max_frames: usize,
    pub max_stack: usize,
    pub max_handlers: usize,
    pub max_defers: usize,
    pub gc: GcConfig,
    pub select: SelectConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: 256,
            max_stack: 65_536,
            max_handlers: 64,
            max_defers: 256,
            gc: GcConfig::default(),
            select: SelectConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    vm: VmConfig,
}

impl VmConfig {
    /// Load from `lattice.toml` in the current directory or an ancestor.
    /// Returns defaults (plus environment overrides) when none is found.
    pub fn load() -> Self {
        let cfg = Self::find_and_load().unwrap_or_default();
        cfg.with_env_overrides()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_str(&content)?.with_env_overrides())
    }

    /// Parse the contents of a `lattice.toml`.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(s)?;
        Ok(file.vm)
    }

    fn find_and_load() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let path = dir.join(CONFIG_FILE);
            if path.exists() {
                let content = std::fs::read_to_string(&path).ok()?;
                return match Self::from_str(&content) {
                    Ok(cfg) => Some(cfg),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config");
                        None
                    }
                };
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    fn with_env_overrides(mut self) -> Self {
        if std::env::var(GC_STRESS_ENV).is_ok_and(|v| v == "1") {
            self.gc.stress = true;
        }
        self
    }

    /// Stress-mode configuration used by GC tests.
    pub fn stress() -> Self {
        let mut cfg = Self::default();
        cfg.gc.stress = true;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_returns_default() {
        let cfg = VmConfig::from_str("").expect("empty toml is valid");
        assert_eq!(cfg, VmConfig::default());
        assert_eq!(cfg.max_frames, 256);
        assert!(cfg.select.fair_shuffle);
    }

    #[test]
    fn partial_vm_table_keeps_other_defaults() {
        let cfg = VmConfig::from_str(
            r#"
[vm]
max_frames = 64

[vm.gc]
stress = true
threshold_bytes = 4096
"#,
        )
        .unwrap();
        assert_eq!(cfg.max_frames, 64);
        assert_eq!(cfg.max_stack, 65_536);
        assert!(cfg.gc.stress);
        assert_eq!(cfg.gc.threshold_bytes, 4096);
        assert_eq!(cfg.gc.growth_factor, 2);
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(VmConfig::from_str("[vm").is_err());
        assert!(VmConfig::from_str("[vm]\nmax_frames = \"many\"").is_err());
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = VmConfig::load_from(Path::new("/nonexistent/lattice.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
