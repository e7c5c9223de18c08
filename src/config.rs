//! Configuration for stepwise.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STEPWISE_HOME, STEPWISE_SCRIPTS)
//! 2. Config file (.stepwise/config.yaml)
//! 3. Defaults (~/.stepwise)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stepwise/config.yaml
//! - Paths in config file are relative to the .stepwise directory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::sandbox::SandboxLimits;
use crate::core::scheduler::SchedulerSettings;
use crate::core::store::StoreSettings;

const CONFIG_DIR: &str = ".stepwise";
const CONFIG_FILE: &str = "config.yaml";

/// Prefix of process variables exposed to runs when none is configured
pub const DEFAULT_AMBIENT_PREFIX: &str = "STEPWISE_VAR_";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sandbox: Option<SandboxLimits>,
    #[serde(default)]
    pub scheduler: Option<SchedulerSettings>,
    #[serde(default)]
    pub store: Option<StoreSettings>,
    #[serde(default)]
    pub ambient: Option<AmbientConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .stepwise/)
    pub home: Option<String>,
    /// Script library directory (relative to .stepwise/)
    pub scripts: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AmbientConfig {
    /// Only process variables with this prefix reach runs
    pub prefix: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Script library root
    pub scripts: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub ambient_prefix: String,
    pub sandbox: SandboxLimits,
    pub scheduler: SchedulerSettings,
    pub store: StoreSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            scripts: home.join("scripts"),
            home,
            config_file: None,
            ambient_prefix: DEFAULT_AMBIENT_PREFIX.to_string(),
            sandbox: SandboxLimits::default(),
            scheduler: SchedulerSettings::default(),
            store: StoreSettings::default(),
        }
    }

    /// Checkpoint registry directory ($STEPWISE_HOME/checkpoints)
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }

    /// Identity registry directory ($STEPWISE_HOME/identities)
    pub fn identities_dir(&self) -> PathBuf {
        self.home.join("identities")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides, read once
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub scripts: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_process() -> Self {
        Self {
            home: std::env::var_os("STEPWISE_HOME").map(PathBuf::from),
            scripts: std::env::var_os("STEPWISE_SCRIPTS").map(PathBuf::from),
        }
    }
}

/// Load configuration from all sources, searching from the current directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    resolve_config(&cwd, &default_home, &EnvOverrides::from_process())
}

/// Resolve configuration from explicit inputs
pub fn resolve_config(
    search_from: &Path,
    default_home: &Path,
    env: &EnvOverrides,
) -> Result<ResolvedConfig> {
    let config_file = find_config_file(search_from);
    let config = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Some(home) = &env.home {
        home.clone()
    } else if let Some(home) = &config.paths.home {
        resolve_path(config_dir, home)
    } else {
        default_home.to_path_buf()
    };

    let scripts = if let Some(scripts) = &env.scripts {
        scripts.clone()
    } else if let Some(scripts) = &config.paths.scripts {
        resolve_path(config_dir, scripts)
    } else {
        home.join("scripts")
    };

    let ambient_prefix = config
        .ambient
        .and_then(|a| a.prefix)
        .unwrap_or_else(|| DEFAULT_AMBIENT_PREFIX.to_string());

    Ok(ResolvedConfig {
        home,
        scripts,
        config_file,
        ambient_prefix,
        sandbox: config.sandbox.unwrap_or_default(),
        scheduler: config.scheduler.unwrap_or_default(),
        store: config.store.unwrap_or_default(),
    })
}
