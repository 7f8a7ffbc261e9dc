//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables `<PREFIX>_SECTION__FIELD`
//! 2. The config file, format picked by extension
//! 3. Serde defaults of the target type

use crate::{Error, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Load `T` from defaults, an optional file and prefixed environment variables
///
/// A missing file is not an error, the defaults and environment still apply.
pub fn load<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if path.exists() {
            figment = merge_file(figment, path)?;
            debug!("Loaded configuration file {}", path.display());
        } else {
            debug!("Configuration file {} not found, using defaults", path.display());
        }
    }

    let prefix = format!("{}_", env_prefix.trim_end_matches('_').to_uppercase());
    figment
        .merge(Env::prefixed(&prefix).split("__"))
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config("Config file must have an extension".to_string()))?;

    match extension {
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "toml" => Ok(figment.merge(Toml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(Error::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(default = "default_name")]
        name: String,
        #[serde(default)]
        engine: Engine,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Engine {
        #[serde(default = "default_workers")]
        workers: usize,
    }

    fn default_name() -> String {
        "sample".to_string()
    }

    fn default_workers() -> usize {
        4
    }

    impl Default for Engine {
        fn default() -> Self {
            Self {
                workers: default_workers(),
            }
        }
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: default_name(),
                engine: Engine::default(),
            }
        }
    }

    fn file(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config: Sample = load(None, "CFGTEST_NONE").unwrap();
        assert_eq!(config, Sample::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config: Sample = load(Some(Path::new("/nonexistent/rulesrv.yaml")), "CFGTEST_MISSING").unwrap();
        assert_eq!(config.engine.workers, 4);
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let file = file(".yaml", "engine:\n  workers: 16\n");
        let config: Sample = load(Some(file.path()), "CFGTEST_YAML").unwrap();
        assert_eq!(config.name, "sample");
        assert_eq!(config.engine.workers, 16);
    }

    #[test]
    fn test_json_file() {
        let file = file(".json", r#"{"name": "from-json"}"#);
        let config: Sample = load(Some(file.path()), "CFGTEST_JSON").unwrap();
        assert_eq!(config.name, "from-json");
    }

    #[test]
    fn test_env_overrides_file() {
        let file = file(".yaml", "engine:\n  workers: 16\n");
        std::env::set_var("CFGTEST_ENV_ENGINE__WORKERS", "2");
        let config: Sample = load(Some(file.path()), "CFGTEST_ENV").unwrap();
        std::env::remove_var("CFGTEST_ENV_ENGINE__WORKERS");
        assert_eq!(config.engine.workers, 2);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = file(".ini", "workers = 2");
        let err = load::<Sample>(Some(file.path()), "CFGTEST_INI").unwrap_err();
        assert!(err.to_string().contains("Unsupported config file format"));
    }
}
