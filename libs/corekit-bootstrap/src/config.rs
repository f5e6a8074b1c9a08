use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable prefix, e.g. `COREKIT__CORE__DEBUG_MODE=true`.
pub const ENV_PREFIX: &str = "COREKIT__";

/// Main application configuration with strongly-typed global sections
/// and a flexible per-module start data bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Runtime settings.
    #[serde(default)]
    pub core: CoreSection,
    /// Logging configuration (optional, minimal console logging if None).
    pub logging: Option<LoggingConfig>,
    /// Per-module start data: module_name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreSection {
    /// Initial value of the runtime debug flag.
    #[serde(default)]
    pub debug_mode: bool,
    /// Base directory for relative log file paths. Empty means the current directory.
    #[serde(default)]
    pub home_dir: String,
}

impl CoreSection {
    pub fn home_path(&self) -> PathBuf {
        if self.home_dir.trim().is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.home_dir)
        }
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/corekit.log", empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>, // How many files to keep
    #[serde(default)]
    pub max_size_mb: Option<u64>, // Max size of the file in MB
}

/// Create a default logging configuration: console only.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: String::new(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            core: CoreSection::default(),
            logging: Some(default_logging_config()),
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::extract(Some(path))
    }

    /// Load configuration from file, or from defaults plus environment variables.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Self::extract(None),
        }
    }

    fn extract(config_path: Option<&Path>) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Layered loading starts from a base where `logging` is None,
        // so it remains None unless explicitly provided by YAML/ENV.
        let base = AppConfig {
            core: CoreSection::default(),
            logging: None,
            modules: HashMap::new(),
        };
        let defaults = config_path.is_none();

        let mut figment = Figment::new().merge(Serialized::defaults(base));
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        // Example: COREKIT__CORE__DEBUG_MODE=true maps to core.debug_mode
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())?;

        if defaults && config.logging.is_none() {
            config.logging = Some(default_logging_config());
        }
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if args.debug {
            self.core.debug_mode = true;
        }

        // Set logging level based on verbose flags for "default" section.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        let default_section = logging.entry("default".to_string()).or_insert_with(|| Section {
            console_level: "info".to_string(),
            file: String::new(),
            file_level: String::new(),
            max_age_days: None,
            max_backups: None,
            max_size_mb: None,
        });
        default_section.console_level = match args.verbose {
            0 => default_section.console_level.clone(), // keep
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
    }

    /// Start data for `module`, `Null` when not configured.
    pub fn module_start_data(&self, module: &str) -> serde_json::Value {
        self.modules
            .get(module)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_structure() {
        let config = AppConfig::default();

        assert!(!config.core.debug_mode);
        assert_eq!(config.core.home_path(), PathBuf::from("."));

        let logging = config.logging.as_ref().unwrap();
        let default_section = &logging["default"];
        assert_eq!(default_section.console_level, "info");
        assert!(default_section.file.is_empty());

        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_load_layered_reads_yaml() {
        Jail::expect_with(|_jail| {
            let tmp = tempdir().unwrap();
            let cfg_path = tmp.path().join("cfg.yaml");
            let yaml = r#"
core:
  debug_mode: true
  home_dir: "/tmp/corekit-test"

logging:
  default:
    console_level: debug
    file: "logs/default.log"
  mediator:
    console_level: trace

modules:
  hub:
    greeting: "welcome"
  chat_client:
    nickname: "ann"
"#;
            fs::write(&cfg_path, yaml).unwrap();

            let config = AppConfig::load_layered(&cfg_path).unwrap();
            assert!(config.core.debug_mode);
            assert_eq!(config.core.home_path(), PathBuf::from("/tmp/corekit-test"));

            let logging = config.logging.as_ref().unwrap();
            assert_eq!(logging["default"].file, "logs/default.log");
            assert_eq!(logging["mediator"].console_level, "trace");
            assert!(logging["mediator"].file.is_empty());

            assert_eq!(config.module_start_data("hub"), json!({ "greeting": "welcome" }));
            assert_eq!(config.module_start_data("app"), serde_json::Value::Null);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        Jail::expect_with(|jail| {
            let tmp = tempdir().unwrap();
            let cfg_path = tmp.path().join("cfg.yaml");
            fs::write(&cfg_path, "core:\n  debug_mode: false\n").unwrap();

            jail.set_env("COREKIT__CORE__DEBUG_MODE", "true");
            let config = AppConfig::load_layered(&cfg_path).unwrap();
            assert!(config.core.debug_mode);
            // Not given in the file, so it stays unset.
            assert!(config.logging.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_load_or_default_without_file() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load_or_default(None::<&str>).unwrap();
            assert!(!config.core.debug_mode);
            assert!(config.logging.unwrap().contains_key("default"));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = tempdir().unwrap();
        let err = AppConfig::load_layered(tmp.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        Jail::expect_with(|_jail| {
            let tmp = tempdir().unwrap();
            let cfg_path = tmp.path().join("cfg.yaml");
            fs::write(&cfg_path, "core:\n  debug: true\n").unwrap();
            assert!(AppConfig::load_layered(&cfg_path).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig {
            logging: None,
            ..AppConfig::default()
        };
        let args = CliArgs {
            verbose: 2,
            debug: true,
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);

        assert!(config.core.debug_mode);
        assert_eq!(config.logging.unwrap()["default"].console_level, "trace");
    }

    #[test]
    fn test_to_yaml_round_trips_through_loader() {
        Jail::expect_with(|_jail| {
            let tmp = tempdir().unwrap();
            let cfg_path = tmp.path().join("cfg.yaml");
            let mut config = AppConfig::default();
            config.core.debug_mode = true;
            config
                .modules
                .insert("hub".to_string(), json!({ "greeting": "hi" }));
            fs::write(&cfg_path, config.to_yaml().unwrap()).unwrap();

            let loaded = AppConfig::load_layered(&cfg_path).unwrap();
            assert_eq!(loaded.core, config.core);
            assert_eq!(loaded.modules, config.modules);
            assert_eq!(loaded.logging, config.logging);
            Ok(())
        });
    }
}
