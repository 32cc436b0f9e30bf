/*
📌 Runtime Configuration
✅ TOML-based deployment settings (rowguard.toml)
✅ History write mode is fixed per deployment, never per call
*/

use std::collections::HashMap;

use crate::history::HistoryMode;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: String,
    pub history_mode: HistoryMode,
    /// Free-form settings kept for forward compatibility
    pub extra: HashMap<String, String>,
}

impl RuntimeConfig {
    fn base() -> Self {
        RuntimeConfig {
            db_path: "rowguard.db".to_string(),
            history_mode: HistoryMode::Strict,
            extra: HashMap::new(),
        }
    }

    pub fn load_from_toml(file_path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        use std::fs;

        let toml_content = fs::read_to_string(file_path)?;
        let config: toml::Value = toml::from_str(&toml_content)?;

        let mut runtime = RuntimeConfig::base();

        if let Some(runtime_table) = config.get("runtime").and_then(|v| v.as_table()) {
            if let Some(path) = runtime_table.get("db_path").and_then(|v| v.as_str()) {
                runtime.db_path = path.to_string();
            }
            if let Some(mode) = runtime_table.get("history_mode").and_then(|v| v.as_str()) {
                runtime.history_mode = HistoryMode::parse(mode)
                    .ok_or_else(|| format!("invalid history_mode '{}'", mode))?;
            }
            for (key, value) in runtime_table {
                if let Some(text) = value.as_str() {
                    runtime.extra.insert(key.clone(), text.to_string());
                }
            }
        }

        log::info!(
            "loaded configuration from {} (history_mode: {:?})",
            file_path,
            runtime.history_mode
        );
        Ok(runtime)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Try the external config file, otherwise strict-mode defaults
        Self::load_from_toml("rowguard.toml").unwrap_or_else(|_| Self::base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_history_mode() {
        assert_eq!(HistoryMode::parse("strict"), Some(HistoryMode::Strict));
        assert_eq!(HistoryMode::parse("best_effort"), Some(HistoryMode::BestEffort));
        assert_eq!(HistoryMode::parse("other"), None);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("rowguard.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[runtime]").unwrap();
        writeln!(file, "db_path = \"custom.db\"").unwrap();
        writeln!(file, "history_mode = \"best_effort\"").unwrap();

        let config = RuntimeConfig::load_from_toml(path.to_str().unwrap()).unwrap();
        assert_eq!(config.db_path, "custom.db");
        assert_eq!(config.history_mode, HistoryMode::BestEffort);
    }

    #[test]
    fn test_invalid_history_mode_is_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("rowguard.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[runtime]").unwrap();
        writeln!(file, "history_mode = \"sometimes\"").unwrap();

        assert!(RuntimeConfig::load_from_toml(path.to_str().unwrap()).is_err());
    }
}
