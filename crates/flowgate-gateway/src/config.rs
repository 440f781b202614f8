use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use flowgate_types::config::GatewayConfig;

/// Returns the Flowgate home directory (~/.flowgate/)
pub fn flowgate_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".flowgate"))
}

/// Returns the path to the config file (~/.flowgate/gateway.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(flowgate_home()?.join("gateway.toml"))
}

/// Load config from the default location, creating it if it doesn't exist.
pub fn load_config() -> Result<GatewayConfig> {
    let path = config_path()?;

    if !path.exists() {
        let default = GatewayConfig::default();
        save_config_to(&path, &default)?;
        return Ok(default);
    }

    load_config_from(&path)
}

/// Load config from an explicit file. Missing keys take their defaults.
pub fn load_config_from(path: &Path) -> Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: GatewayConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save config to the default location, overwriting the existing file.
pub fn save_config(config: &GatewayConfig) -> Result<()> {
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &GatewayConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_under_flowgate_home() {
        let path = config_path().unwrap();
        assert!(path.to_string_lossy().contains(".flowgate"));
        assert!(path.ends_with("gateway.toml"));
    }

    #[test]
    fn default_config_roundtrips() {
        let config = GatewayConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: GatewayConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.toml");

        let mut config = GatewayConfig::default();
        config.port = 6000;
        config.allow_spawn = true;
        config.fabric.port = 6001;
        save_config_to(&path, &config).unwrap();

        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "port = 7000\n\n[fabric]\nhost = \"10.0.0.2\"\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.fabric.host, "10.0.0.2");
        assert_eq!(config.fabric.port, 55556);
        assert_eq!(config.sleep_ms, 50);
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
