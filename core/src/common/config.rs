use super::{default_vals, utils::expand_path};
use anyhow::{Context, Result};
use gdbmi::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(rename = "Session", default)]
    pub session: SessionConfig,

    #[serde(rename = "Conf", default)]
    pub conf: Conf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conf {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Print console/target/log stream records, not only structured ones.
    #[serde(default = "default_true")]
    pub emit_streams: bool,
    #[serde(default = "default_first_token")]
    pub first_token: u64,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            emit_streams: true,
            first_token: default_first_token(),
        }
    }
}

impl Conf {
    pub fn log_dir(&self) -> PathBuf {
        expand_path(&self.log_dir)
    }
}

fn default_log_dir() -> String {
    default_vals::DEFAULT_LOG_DIR.to_string()
}

fn default_first_token() -> u64 {
    default_vals::DEFAULT_FIRST_TOKEN
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config = serde_yml::from_str(contents).context("Failed to parse config")?;
        Ok(config)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.session.prompt, "(gdb)");
        assert!(config.session.fix_script_tuple);
        assert!(config.conf.emit_streams);
        assert_eq!(config.conf.first_token, 1);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
Session:
  prompt: "(lldb-mi)"
Conf:
  emit_streams: false
  first_token: 100
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.session.prompt, "(lldb-mi)");
        assert!(config.session.fix_script_tuple);
        assert!(!config.conf.emit_streams);
        assert_eq!(config.conf.first_token, 100);
        assert_eq!(config.conf.log_dir, default_vals::DEFAULT_LOG_DIR);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Session:\n  fix_script_tuple: false").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert!(!config.session.fix_script_tuple);
        assert!(Config::load(Some(Path::new("/nonexistent/mi-replay.yaml"))).is_err());
    }
}
