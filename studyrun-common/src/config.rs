//! Configuration loading and root folder resolution
//!
//! Resolution order for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing or unreadable TOML file never stops startup; it is logged and
//! the compiled defaults are used.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "STUDYRUN_ROOT_FOLDER";

/// Settings read from the TOML config file; every field is optional
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub log_level: Option<String>,
    pub max_lock_wait_ms: Option<u64>,
    pub database_file: Option<String>,
}

impl TomlConfig {
    /// Parse a config file, failing on I/O or syntax errors
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path` (or the platform default location), falling back to an
    /// empty config when nothing usable is found.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let Some(candidate) = candidate else {
            info!("No config file found, using compiled defaults");
            return Self::default();
        };

        match Self::load(&candidate) {
            Ok(config) => {
                info!("Loaded config file: {}", candidate.display());
                config
            }
            Err(e) => {
                warn!("Ignoring config file {}: {}", candidate.display(), e);
                Self::default()
            }
        }
    }
}

/// Compiled fallback values
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub port: u16,
    pub bind: String,
    pub log_level: String,
    pub max_lock_wait_ms: u64,
    pub database_file: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let root_folder = dirs::data_local_dir()
            .map(|d| d.join("studyrun"))
            .unwrap_or_else(|| PathBuf::from("./studyrun_data"));

        Self {
            root_folder,
            port: 5780,
            bind: "127.0.0.1".to_string(),
            log_level: "info".to_string(),
            max_lock_wait_ms: 5000,
            database_file: "studyrun.db".to_string(),
        }
    }
}

/// Default config file location for the platform, if one exists
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("studyrun").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/studyrun/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Resolves the root folder following the priority order above
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_root: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_root = config.root_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            info!(module = %self.module_name, "Root folder from command line: {}", path.display());
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                info!(module = %self.module_name, "Root folder from {}: {}", ROOT_FOLDER_ENV, path);
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_root {
            info!(module = %self.module_name, "Root folder from config file: {}", path.display());
            return path.clone();
        }

        let default = CompiledDefaults::for_current_platform().root_folder;
        info!(module = %self.module_name, "Root folder (default): {}", default.display());
        default
    }
}

/// Creates the root folder and derives file locations inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn database_path(&self, database_file: &str) -> PathBuf {
        self.root_folder.join(database_file)
    }
}

/// Values supplied on the command line (or their env fallbacks via clap)
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root_folder: Option<PathBuf>,
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub log_level: Option<String>,
}

/// Fully resolved service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub root_folder: PathBuf,
    pub database_path: PathBuf,
    pub port: u16,
    pub bind: String,
    pub log_level: String,
    pub max_lock_wait_ms: u64,
}

impl ServiceConfig {
    pub fn resolve(module_name: &str, overrides: ConfigOverrides, toml: &TomlConfig) -> Self {
        let defaults = CompiledDefaults::for_current_platform();
        let root_folder = RootFolderResolver::new(module_name)
            .with_cli_arg(overrides.root_folder)
            .with_toml(toml)
            .resolve();
        let database_file = toml
            .database_file
            .clone()
            .unwrap_or(defaults.database_file);

        Self {
            database_path: root_folder.join(database_file),
            root_folder,
            port: overrides.port.or(toml.port).unwrap_or(defaults.port),
            bind: overrides
                .bind
                .or_else(|| toml.bind.clone())
                .unwrap_or(defaults.bind),
            log_level: overrides
                .log_level
                .or_else(|| toml.log_level.clone())
                .unwrap_or(defaults.log_level),
            max_lock_wait_ms: toml.max_lock_wait_ms.unwrap_or(defaults.max_lock_wait_ms),
        }
    }
}
