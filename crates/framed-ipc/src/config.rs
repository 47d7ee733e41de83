use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::correlation::IdStrategy;
use crate::framing::Framing;
use crate::protocol::RESERVED_FIELDS;

const APP_NAME: &str = "framed-ipc";

/// Transport configuration, injected at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoint to connect to when none is given explicitly
    pub socket_path: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// How long `disconnect` waits for the listener task before aborting it
    pub shutdown_grace_ms: u64,
    pub read_chunk_size: usize,
    pub max_frame_len: usize,
    pub framing: Framing,
    pub correlation_ids: IdStrategy,
    /// Top-level field that carries the correlation key. Requests always
    /// carry `id`; any other field is written alongside it, and responses
    /// are matched on this field alone.
    pub correlation_field: String,
    /// Method sent by `health_check`
    pub health_method: String,
    /// Attached to every outgoing request and notification
    pub headers: BTreeMap<String, String>,
    /// Top-level fields attached to every outgoing message, such as session
    /// or channel identifiers
    pub context: Map<String, Value>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 1_000,
            read_chunk_size: 4096,
            max_frame_len: 16 * 1024 * 1024,
            framing: Framing::default(),
            correlation_ids: IdStrategy::default(),
            correlation_field: "id".to_string(),
            health_method: "ping".to_string(),
            headers: BTreeMap::new(),
            context: Map::new(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_field = field.into();
        self
    }

    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        if self.read_chunk_size == 0 {
            anyhow::bail!("read_chunk_size must be greater than zero");
        }
        if self.max_frame_len == 0 {
            anyhow::bail!("max_frame_len must be greater than zero");
        }
        if self.correlation_field.is_empty() {
            anyhow::bail!("correlation_field must not be empty");
        }
        if self.correlation_field != "id" && RESERVED_FIELDS.contains(&self.correlation_field.as_str()) {
            anyhow::bail!(
                "correlation_field cannot be '{}', it is a reserved message field",
                self.correlation_field
            );
        }
        if let Some(key) = self
            .context
            .keys()
            .find(|key| RESERVED_FIELDS.contains(&key.as_str()) || **key == self.correlation_field)
        {
            anyhow::bail!("context field '{}' collides with a message field", key);
        }
        Ok(())
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    // FRAMED_IPC_CONFIG_PATH overrides the default config directory
    if let Ok(path) = std::env::var("FRAMED_IPC_CONFIG_PATH") {
        return Ok(PathBuf::from(path));
    }

    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
        .context("Could not determine config directory")
}

pub fn get_config_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

/// Load configuration from `path`, falling back to defaults if it does not exist
pub fn load_config(path: &Path) -> Result<TransportConfig> {
    if !path.exists() {
        return Ok(TransportConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TransportConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

pub fn load_default_config() -> Result<TransportConfig> {
    load_config(&get_config_file()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{ByteOrder, PrefixWidth};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/framed-ipc/config.toml")).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.framing, Framing::length_prefixed());
        assert_eq!(config.correlation_ids, IdStrategy::Sequential);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
socket_path = "/tmp/app.sock"
request_timeout_ms = 250
correlation_ids = "uuid"

[framing]
kind = "length_prefixed"
width = 8
byte_order = "little"

[headers]
authorization = "Bearer token"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/app.sock")));
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.correlation_ids, IdStrategy::Uuid);
        assert_eq!(
            config.framing,
            Framing::LengthPrefixed {
                width: PrefixWidth::U64,
                byte_order: ByteOrder::Little
            }
        );
        assert_eq!(config.headers.get("authorization").unwrap(), "Bearer token");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "read_chunk_size = 0").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("read_chunk_size"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "request_timeout_ms = \"soon\"").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_correlation_field_and_context() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
correlation_field = "trace_id"
correlation_ids = "uuid"

[context]
channel_id = "chan-1"
connect_session_id = "sess-1"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.correlation_field, "trace_id");
        assert_eq!(config.context.get("channel_id"), Some(&Value::from("chan-1")));
        assert_eq!(config.context.len(), 2);
    }

    #[test]
    fn test_context_collisions_rejected() {
        let config = TransportConfig::default().with_context("method", "x");
        assert!(config.validate().is_err());

        let config = TransportConfig::default()
            .with_correlation_field("trace_id")
            .with_context("trace_id", "fixed");
        assert!(config.validate().is_err());

        let config = TransportConfig::default().with_correlation_field("result");
        assert!(config.validate().is_err());

        let config = TransportConfig::default()
            .with_correlation_field("trace_id")
            .with_context("channel_id", 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = TransportConfig::default()
            .with_framing(Framing::newline_delimited())
            .with_request_timeout(Duration::from_millis(50))
            .with_header("x-session", "abc");
        assert_eq!(config.request_timeout_ms, 50);
        assert_eq!(config.headers.len(), 1);
        assert!(config.validate().is_ok());
    }
}
