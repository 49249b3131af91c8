//! Pipeline configuration.
//!
//! Each pipeline process is described by one JSON file:
//!
//! ```json
//! {
//!     "name": "alpha",
//!     "scripts": ["scripts/double.py"],
//!     "source_pipeline_count": 1,
//!     "target_pipeline_names": ["beta"]
//! }
//! ```
//!
//! Script paths are resolved relative to the configuration file. The name is
//! the network-advertised identity other pipelines discover this one by, and
//! the key under which this pipeline's data appears in downstream scripts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// UDP port beacons broadcast on and finders listen to, unless overridden.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5557;

const MIN_NAME_LEN: usize = 3;

/// Contents of one pipeline configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub scripts: Vec<PathBuf>,
    pub source_pipeline_count: usize,
    #[serde(default)]
    pub target_pipeline_names: Vec<String>,
}

impl PipelineConfig {
    /// Loads and validates a configuration file, resolving script paths
    /// relative to its parent directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config: PipelineConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

        let base = path.parent().unwrap_or(Path::new("."));
        for script in &mut config.scripts {
            if script.is_relative() {
                *script = base.join(&*script);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_pipeline_name(&self.name) {
            return Err(Error::Config(format!(
                "invalid pipeline name `{}`: names are at least {MIN_NAME_LEN} characters, \
                 start with a letter, and contain only letters, digits, `-` and `_`",
                self.name
            )));
        }
        if self.scripts.is_empty() {
            return Err(Error::Config(format!(
                "pipeline `{}` declares no scripts",
                self.name
            )));
        }
        for script in &self.scripts {
            if script.extension().and_then(|e| e.to_str()) != Some("py") {
                return Err(Error::Config(format!(
                    "script {} is not a .py file",
                    script.display()
                )));
            }
            if !script.is_file() {
                return Err(Error::Config(format!(
                    "script {} does not exist",
                    script.display()
                )));
            }
        }
        Ok(())
    }
}

/// Checks the pipeline naming rule: length >= 3, leading ASCII letter, then
/// letters, digits, `-` and `_` only.
pub fn is_valid_pipeline_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new("^[A-Za-z][A-Za-z0-9_-]*$").expect("static pattern"));
    name.len() >= MIN_NAME_LEN && pattern.is_match(name)
}

/// Process-level settings shared by every pipeline in a launch.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Root of the embedded Python installation, if not the linked default.
    pub python_home: Option<PathBuf>,
    /// Interface whose IPv4 address the data listener binds to. `None` picks
    /// the first interface with a usable non-loopback address.
    pub inbound_interface: Option<String>,
    /// Interfaces beacons broadcast on. Empty means every broadcast-capable
    /// interface.
    pub outbound_interfaces: Vec<String>,
    pub discovery_port: u16,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            python_home: None,
            inbound_interface: None,
            outbound_interfaces: Vec::new(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
        }
    }
}
