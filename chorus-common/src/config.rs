//! Configuration loading and root-folder resolution
//!
//! Priority order, highest first: command-line argument, environment
//! variable, TOML config file, compiled OS-dependent default.

use crate::{Error, Result};
use std::path::PathBuf;

/// Resolves the blob-store root directory for a service, trying each
/// source in priority order before falling back to a compiled default.
pub struct RootFolderResolver {
    service_name: &'static str,
    cli_arg: Option<String>,
    env_var_name: String,
}

impl RootFolderResolver {
    pub fn new(service_name: &'static str) -> Self {
        Self {
            service_name,
            cli_arg: None,
            env_var_name: format!("{}_ROOT", service_name.to_uppercase().replace('-', "_")),
        }
    }

    pub fn with_cli_arg(mut self, cli_arg: Option<String>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    /// Run the four-tier resolution and return the first match.
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return PathBuf::from(path);
        }

        if let Ok(path) = std::env::var(&self.env_var_name) {
            return PathBuf::from(path);
        }

        if let Ok(path) = load_toml_root_folder(self.service_name) {
            return path;
        }

        default_root_folder(self.service_name)
    }
}

/// Ensures the resolved root directory exists before the engine writes
/// blobs into it.
pub struct RootFolderInitializer {
    root: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("catalog.db")
    }
}

fn load_toml_root_folder(service_name: &str) -> Result<PathBuf> {
    let config_path = config_file_path(service_name)?;
    let toml_content = std::fs::read_to_string(&config_path)?;
    let config: toml::Value = toml::from_str(&toml_content)
        .map_err(|e| Error::Config(format!("invalid TOML in {}: {}", config_path.display(), e)))?;

    config
        .get("downloads_root")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config("no downloads_root key in config file".to_string()))
}

fn config_file_path(service_name: &str) -> Result<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(service_name).join("config.toml"));
    if let Some(path) = &user_config {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let system_config = PathBuf::from(format!("/etc/{}/config.toml", service_name));
    if system_config.exists() {
        return Ok(system_config);
    }

    Err(Error::Config("no config file found".to_string()))
}

fn default_root_folder(service_name: &str) -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join(service_name))
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/{}", service_name)))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join(service_name))
            .unwrap_or_else(|| {
                PathBuf::from(format!("/Library/Application Support/{}", service_name))
            })
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join(service_name))
            .unwrap_or_else(|| PathBuf::from(format!("C:\\ProgramData\\{}", service_name)))
    } else {
        PathBuf::from(format!("./{}_data", service_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arg_wins_over_everything() {
        let resolver = RootFolderResolver::new("chorus-engine-test")
            .with_cli_arg(Some("/tmp/explicit".to_string()));
        assert_eq!(resolver.resolve(), PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn env_var_wins_when_no_cli_arg() {
        let var = "CHORUS_ENGINE_CONFIG_TEST_ROOT";
        std::env::set_var(var, "/tmp/from-env");
        let resolver = RootFolderResolver {
            service_name: "chorus-engine-config-test",
            cli_arg: None,
            env_var_name: var.to_string(),
        };
        assert_eq!(resolver.resolve(), PathBuf::from("/tmp/from-env"));
        std::env::remove_var(var);
    }
}
