use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::engine::AvailabilityMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set together")]
    TlsPair,
}

/// PEM certificate chain and private key for the wire listener.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `SLOTBOOK_*` environment variables.
/// A `.env` file in the working directory is loaded first if present.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls: Option<TlsFiles>,
    pub metrics_port: Option<u16>,
    pub mode: AvailabilityMode,
    /// Login names that act with the admin role.
    pub admins: Vec<String>,
    /// Offset of the schedule's local time from UTC.
    pub utc_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls: None,
            metrics_port: None,
            mode: AvailabilityMode::Rules,
            admins: vec!["admin".into()],
            utc_offset_minutes: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "SLOTBOOK_PORT")?.unwrap_or(d.port),
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            tls: tls_files(&lookup)?,
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT")?,
            mode: parsed(&lookup, "SLOTBOOK_AVAILABILITY_MODE")?.unwrap_or(d.mode),
            admins: lookup("SLOTBOOK_ADMINS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(d.admins),
            utc_offset_minutes: parsed(&lookup, "SLOTBOOK_UTC_OFFSET_MINUTES")?
                .unwrap_or(d.utc_offset_minutes),
        })
    }
}

fn tls_files(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<TlsFiles>, ConfigError> {
    match (lookup("SLOTBOOK_TLS_CERT"), lookup("SLOTBOOK_TLS_KEY")) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(TlsFiles { cert: cert.into(), key: key.into() })),
        _ => Err(ConfigError::TlsPair),
    }
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
