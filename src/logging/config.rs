use std::{io, path::PathBuf};

/// Конфигурация логирования.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Фильтр уровня в синтаксисе EnvFilter ("info", "vestnik=debug", ...).
    pub level: String,
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub log_dir: PathBuf,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console_enabled: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            file_name: "vestnik.log".into(),
        }
    }
}

impl LoggingConfig {
    /// Переменные окружения сильнее конфигурации.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("VESTNIK_LOG") {
            self.level = level;
        }
        if let Ok(dir) = std::env::var("VESTNIK_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
            self.file_enabled = true;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.level.trim().is_empty() {
            return Err("log level must not be empty".into());
        }
        if self.file_enabled && self.file_name.trim().is_empty() {
            return Err("log file name must not be empty".into());
        }
        Ok(())
    }

    pub fn ensure_log_dir(&self) -> io::Result<()> {
        if self.file_enabled {
            std::fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    /// Тест проверяет значения по умолчанию.
    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
    }

    /// Тест проверяет валидацию пустых значений.
    #[test]
    fn test_validate() {
        let mut config = LoggingConfig::default();
        assert!(config.validate().is_ok());

        config.level = "  ".into();
        assert!(config.validate().is_err());

        config.level = "debug".into();
        config.file_enabled = true;
        config.file_name = "".into();
        assert!(config.validate().is_err());
    }

    /// Тест проверяет, что VESTNIK_LOG переопределяет уровень.
    #[test]
    #[serial]
    fn test_env_override_level() {
        std::env::set_var("VESTNIK_LOG", "trace");
        let mut config = LoggingConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("VESTNIK_LOG");
        assert_eq!(config.level, "trace");
    }
}
