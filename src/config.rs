//! Client configuration.
//!
//! Loaded from YAML files and `TEMIT__`-prefixed environment variables, or
//! built in code from `ClientConfig::default()`.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name (looked up in the working directory).
pub const DEFAULT_CONFIG_FILE: &str = "temit.yaml";
/// Environment variable naming an additional configuration file.
pub const CONFIG_ENV_VAR: &str = "TEMIT_CONFIG";
/// Prefix for configuration environment variables (`TEMIT__URL`, ...).
pub const CONFIG_ENV_PREFIX: &str = "TEMIT";
/// Environment variable for the tracing filter.
pub const LOG_ENV_VAR: &str = "TEMIT_LOG";

/// Default broker URL.
pub const DEFAULT_URL: &str = "amqp://localhost";
/// Default topic exchange.
pub const DEFAULT_EXCHANGE: &str = "temit";

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service identity, sent as the `app_id` of every message.
    pub name: String,
    /// AMQP connection URL.
    pub url: String,
    /// Topic exchange every component publishes to and binds on.
    pub exchange: String,
    /// Upper bound on pooled worker channels.
    pub pool_max_size: usize,
    /// Default Requester timeout in milliseconds. 0 waits forever.
    pub request_timeout_ms: u64,
    /// Default prefetch for Endpoints and Listeners. 0 is unlimited.
    pub prefetch: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            url: DEFAULT_URL.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            pool_max_size: 10,
            request_timeout_ms: 30_000,
            prefetch: 48,
        }
    }
}

impl ClientConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `DEFAULT_CONFIG_FILE` in the working directory (if present)
    /// 2. The file at `path` (if given)
    /// 3. The file named by `CONFIG_ENV_VAR` (if set)
    /// 4. Environment variables with the `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Default Requester timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Default consumer prefetch, `None` when unlimited.
    pub fn default_prefetch(&self) -> Option<u16> {
        (self.prefetch > 0).then_some(self.prefetch)
    }
}

/// Executable file stem, so services get a meaningful identity for free.
fn default_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "temit".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "amqp://localhost");
        assert_eq!(config.exchange, "temit");
        assert_eq!(config.pool_max_size, 10);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_prefetch(), Some(48));
        assert!(!config.name.is_empty());
    }

    #[test]
    fn test_zero_prefetch_is_unlimited() {
        let config = ClientConfig {
            prefetch: 0,
            ..Default::default()
        };
        assert_eq!(config.default_prefetch(), None);
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::default()
            .with_name("billing")
            .with_url("amqp://rabbit:5672")
            .with_exchange("billing.events");
        assert_eq!(config.name, "billing");
        assert_eq!(config.url, "amqp://rabbit:5672");
        assert_eq!(config.exchange, "billing.events");
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: accounts\nexchange: accounts.x\nrequest_timeout_ms: 250").unwrap();

        let config = ClientConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.name, "accounts");
        assert_eq!(config.exchange, "accounts.x");
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.url, DEFAULT_URL);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "url: amqp://from-file").unwrap();

        std::env::set_var("TEMIT__URL", "amqp://from-env");
        let config = ClientConfig::load(file.path().to_str());
        std::env::remove_var("TEMIT__URL");

        assert_eq!(config.unwrap().url, "amqp://from-env");
    }
}
