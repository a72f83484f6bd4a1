use std::env;
use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Developer switches.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DevSettings {
    /// Strict fault handling plus the event log (default: false)
    #[serde(default)]
    pub enabled: bool,
    /// File every dispatched event is appended to in dev mode
    #[serde(default = "default_event_logfile")]
    pub event_logfile: String,
}

impl Default for DevSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            event_logfile: default_event_logfile(),
        }
    }
}

fn default_event_logfile() -> String {
    "events.log".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserSettings {
    #[serde(default = "default_user_name")]
    pub name: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            name: default_user_name(),
        }
    }
}

fn default_user_name() -> String {
    "Unknown".to_string()
}

/// Optional modules to load in addition to the built-ins.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModulesSettings {
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub dev: DevSettings,
    #[serde(default)]
    pub user: UserSettings,
    #[serde(default)]
    pub modules: ModulesSettings,
    /// Every other table, keyed by the module it configures.
    #[serde(flatten)]
    pub sections: Map<String, Value>,
    /// Directory of the user configuration file.
    #[serde(skip)]
    pub directory: Option<PathBuf>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let user_file = user_config_path();

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add the user's own file
            .add_source(File::from(user_file.clone()).required(false))
            // Add in settings from environment variables (HALOGEN__SERVER__PORT=...)
            .add_source(
                Environment::with_prefix("HALOGEN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = s.try_deserialize()?;
        settings.directory = user_file.parent().map(Path::to_path_buf);
        Ok(settings)
    }

    /// Build settings from a TOML document, without any other source.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// The isolated configuration slice of module `name`.
    pub fn module_config(&self, name: &str) -> ModuleConfig {
        ModuleConfig {
            name: name.to_string(),
            tree: self
                .sections
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        }
    }

    pub fn is_enabled(&self, module: &str) -> bool {
        self.modules.enabled.iter().any(|m| m == module)
    }

    pub fn directory_display(&self) -> String {
        match &self.directory {
            Some(dir) => dir.display().to_string(),
            None => "<none>".to_string(),
        }
    }
}

/// `$HALOGEN_CONFIG`, or `~/.config/halogen/config.toml`.
pub fn user_config_path() -> PathBuf {
    if let Ok(path) = env::var("HALOGEN_CONFIG") {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("halogen")
        .join("config.toml")
}

/// A module's own configuration subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    name: String,
    tree: Value,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, tree: Value) -> Self {
        Self {
            name: name.into(),
            tree,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Value::Object(Map::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw value at a dotted `path`, e.g. `"limits.max"`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.tree, |node, segment| node.get(segment))
    }

    /// Typed value at `path`, or `default` when absent or of the wrong shape.
    ///
    /// String values are also parsed as JSON so that environment overrides
    /// like `"6240"` or `"true"` reach numeric and boolean settings.
    pub fn get<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        let Some(value) = self.lookup(path) else {
            return default;
        };
        if let Ok(parsed) = serde_json::from_value(value.clone()) {
            return parsed;
        }
        match value {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or(default),
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[dev]
enabled = true

[user]
name = "Ada"

[modules]
enabled = ["fs"]

[logger]
level = "warning"
terminal = false

[server]
port = "7000"

[server.limits]
clients = 4
"#;

    #[test]
    fn test_from_toml_splits_sections() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert!(settings.dev.enabled);
        assert_eq!(settings.dev.event_logfile, "events.log");
        assert_eq!(settings.user.name, "Ada");
        assert!(settings.is_enabled("fs"));
        assert!(!settings.is_enabled("model"));
        assert!(settings.sections.contains_key("logger"));
        assert!(!settings.sections.contains_key("dev"));
    }

    #[test]
    fn test_defaults_when_empty() {
        let settings = Settings::from_toml("").unwrap();
        assert!(!settings.dev.enabled);
        assert_eq!(settings.user.name, "Unknown");
        assert!(settings.modules.enabled.is_empty());
    }

    #[test]
    fn test_module_config_get() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let logger = settings.module_config("logger");
        assert_eq!(logger.name(), "logger");
        assert_eq!(logger.get("level", "info".to_string()), "warning");
        assert!(!logger.get("terminal", true));
        assert_eq!(logger.get("logfile", "halogen.log".to_string()), "halogen.log");

        let server = settings.module_config("server");
        assert_eq!(server.get("port", 6240u16), 7000);
        assert_eq!(server.get("limits.clients", 0u32), 4);
    }

    #[test]
    fn test_module_config_is_isolated() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let fs = settings.module_config("fs");
        assert_eq!(fs.lookup("level"), None);
        assert_eq!(fs.get("level", "info".to_string()), "info");
    }

    #[test]
    fn test_wrong_shape_falls_back() {
        let config = ModuleConfig::new("x", serde_json::json!({ "port": "not-a-number" }));
        assert_eq!(config.get("port", 1u16), 1);
    }
}
