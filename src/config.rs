//! Nativebind Configuration
//!
//! Handles parsing of `nativebind.toml` files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::descriptor::CallingConvention;
use crate::error::FfiResult;
use crate::loader::DynamicLibrary;

/// File name searched for by [`FfiConfig::find_and_load`].
pub const CONFIG_FILE: &str = "nativebind.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching nativebind.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FfiConfig {
    /// Library loading
    #[serde(default)]
    pub library: LibraryConfig,

    /// Call defaults
    #[serde(default)]
    pub call: CallConfig,

    /// Extra type aliases, `name = "existing_type"`
    #[serde(default)]
    pub typedefs: BTreeMap<String, String>,
}

impl FfiConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: FfiConfig = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Calling convention named by `[call] convention`.
    pub fn convention(&self) -> FfiResult<CallingConvention> {
        CallingConvention::from_name(&self.call.convention)
    }
}

/// Library loading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directories tried when a bare library name fails to open
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Open flags used by `Module::ffi_lib`
    #[serde(default = "default_flags")]
    pub default_flags: i32,
}

fn default_flags() -> i32 {
    DynamicLibrary::LAZY
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            default_flags: default_flags(),
        }
    }
}

/// Call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// `default` or `stdcall`
    #[serde(default = "default_convention")]
    pub convention: String,
}

fn default_convention() -> String {
    "default".to_string()
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            convention: default_convention(),
        }
    }
}
