use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::Credentials;
use crate::model::Ms;
use crate::reaper::PurgePolicy;

/// Server settings, read from `STAYD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: Option<String>,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Seconds between unpaid-booking sweeps. Zero turns the purger off.
    pub purge_interval_secs: u64,
    pub unpaid_grace_secs: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// tracing filter directive used when `RUST_LOG` is unset.
    pub log: String,
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => {
                write!(f, "{var} has an invalid value: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let unpaid_grace_secs = parsed(&lookup, "STAYD_UNPAID_GRACE_SECS")?.unwrap_or(900);
        if grace_ms(unpaid_grace_secs).is_none() {
            return Err(ConfigError::Invalid {
                var: "STAYD_UNPAID_GRACE_SECS",
                value: unpaid_grace_secs.to_string(),
            });
        }

        Ok(Self {
            port: parsed(&lookup, "STAYD_PORT")?.unwrap_or(5433),
            bind: text("STAYD_BIND", "0.0.0.0"),
            data_dir: PathBuf::from(text("STAYD_DATA_DIR", "./data")),
            user: lookup("STAYD_USER").filter(|u| !u.is_empty()),
            password: text("STAYD_PASSWORD", "stayd"),
            max_connections: parsed(&lookup, "STAYD_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "STAYD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            purge_interval_secs: parsed(&lookup, "STAYD_PURGE_INTERVAL_SECS")?.unwrap_or(300),
            unpaid_grace_secs,
            tls_cert: lookup("STAYD_TLS_CERT"),
            tls_key: lookup("STAYD_TLS_KEY"),
            metrics_port: parsed(&lookup, "STAYD_METRICS_PORT")?,
            log: text("STAYD_LOG", "info"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    pub fn purge_policy(&self) -> Option<PurgePolicy> {
        (self.purge_interval_secs > 0).then(|| PurgePolicy {
            interval: Duration::from_secs(self.purge_interval_secs),
            grace_ms: grace_ms(self.unpaid_grace_secs).unwrap_or(Ms::MAX),
        })
    }
}

/// The grace period in milliseconds, if it fits the timestamp type.
fn grace_ms(secs: u64) -> Option<Ms> {
    secs.checked_mul(1000).and_then(|ms| Ms::try_from(ms).ok())
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
