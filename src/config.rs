use crate::error::ConfigError;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_PORT: u16 = 7860;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            model_path: PathBuf::from("app").join("model.json"),
        }
    }
}

impl ServerConfig {
    /// Resolves `host:port` into the address the listener binds.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port",
                reason: "port must be non-zero".into(),
            });
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "server.host",
                reason: format!("cannot resolve {}", self.host),
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Installs the global tracing subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).init(),
            _ => fmt().with_env_filter(filter).init(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub seed: u64,
    pub samples: usize,
    pub test_fraction: f64,
    pub n_estimators: usize,
    pub max_depth: usize, // 0 means unlimited
    pub min_samples_split: usize,
    pub experiment: String,
    pub tracking_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            samples: 100,
            test_fraction: 0.2,
            n_estimators: 50,
            max_depth: 0,
            min_samples_split: 2,
            experiment: "bulk-discount-model".into(),
            tracking_dir: PathBuf::from("mlruns"),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        macro_rules! invalid {
            ($field:expr, $reason:expr) => {
                return Err(ConfigError::InvalidValue {
                    field: $field,
                    reason: $reason.into(),
                })
            };
        }

        if self.samples < 2 {
            invalid!("training.samples", "need at least 2 samples to split");
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            invalid!("training.test_fraction", "must be within (0, 1)");
        }
        if self.n_estimators == 0 {
            invalid!("training.n_estimators", "must be at least 1");
        }
        if self.min_samples_split < 2 {
            invalid!("training.min_samples_split", "must be at least 2");
        }
        Ok(())
    }
}

impl Config {
    /// Reads the TOML file at `path`; no path means all defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Parse)
    }
}

#[test]
fn test_defaults() {
    let config = Config::load(None).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 7860);
    assert_eq!(config.training.seed, 42);
    assert_eq!(config.training.n_estimators, 50);
    assert_eq!(config.training.experiment, "bulk-discount-model");
    assert_eq!(
        config.server.socket_addr().unwrap(),
        SocketAddr::from(([0, 0, 0, 0], 7860))
    );
}

#[test]
fn test_partial_file() {
    let config = Config::parse(
        r#"
        [server]
        port = 9001

        [training]
        samples = 500
        "#,
    )
    .unwrap();
    assert_eq!(config.server.port, 9001);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.training.samples, 500);
    assert_eq!(config.training.n_estimators, 50);
    assert_eq!(config.logging.format, "pretty");
}

#[test]
fn test_rejects_bad_values() {
    let config = Config::parse("[server]\nport = \"abc\"");
    assert!(matches!(config, Err(ConfigError::Parse(_))));

    let mut server = ServerConfig::default();
    server.port = 0;
    assert!(server.socket_addr().is_err());

    let mut training = TrainingConfig::default();
    assert!(training.validate().is_ok());
    training.test_fraction = 1.0;
    assert!(training.validate().is_err());
}

#[test]
fn test_missing_file() {
    let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { .. }));
}
