//! Process configuration, read from the environment.
//!
//! All variables honour a `DEV_` prefix when `ENV_STATE=dev`, so a
//! developer shell can carry both a production and a local setup.

use crate::uris::StoreUri;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Default batch size B: records per batch and per bulk insert.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;
/// Default per-step retry budget R over transient errors.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Configuration faults. Fatal at startup; process exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
    #[error("{0}")]
    Registry(String),
}

/// Which store platform the configured directories live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Local,
    Aws,
    Azure,
    Gcp,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Local => "local",
            Platform::Aws => "aws",
            Platform::Azure => "azure",
            Platform::Gcp => "gcp",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "local" => Ok(Platform::Local),
            "aws" => Ok(Platform::Aws),
            "azure" => Ok(Platform::Azure),
            "gcp" => Ok(Platform::Gcp),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SMTP settings for stakeholder email.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from_email: String,
    /// Fallback recipient for sources without an explicit notify list.
    pub data_team_email: Option<String>,
}

/// Telemetry endpoints; recognised and carried, exported elsewhere.
#[derive(Debug, Clone, Default)]
pub struct OtelConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

/// The complete, immutable process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub platform: Platform,
    pub drop_dir: StoreUri,
    pub archive_dir: StoreUri,
    pub duplicates_dir: StoreUri,
    pub quarantine_dir: StoreUri,
    pub database_url: String,
    pub sources_path: PathBuf,
    pub worker_count: usize,
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub sql_server_bulk_copy: bool,
    pub smtp: Option<SmtpConfig>,
    pub webhook_url: Option<String>,
    pub otel: OtelConfig,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through a lookup function (tests inject maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev = lookup("ENV_STATE").as_deref() == Some("dev");
        let get = |var: &'static str| -> Option<String> {
            if dev {
                let prefixed = format!("DEV_{}", var);
                if let Some(value) = lookup(&prefixed) {
                    return Some(value);
                }
            }
            lookup(var)
        };
        let require = |var: &'static str| get(var).ok_or(ConfigError::Missing(var));

        let parse_uri = |var: &'static str, raw: String| -> Result<StoreUri, ConfigError> {
            StoreUri::parse(&raw).map_err(|message| ConfigError::Invalid { var, message })
        };

        let platform = match get("FILE_HELPER_PLATFORM") {
            Some(raw) => raw
                .parse::<Platform>()
                .map_err(|message| ConfigError::Invalid {
                    var: "FILE_HELPER_PLATFORM",
                    message,
                })?,
            None => Platform::Local,
        };

        let drop_dir = parse_uri("DIRECTORY_PATH", require("DIRECTORY_PATH")?)?;
        let archive_dir = parse_uri("ARCHIVE_PATH", require("ARCHIVE_PATH")?)?;
        let duplicates_dir =
            parse_uri("DUPLICATE_FILES_PATH", require("DUPLICATE_FILES_PATH")?)?;
        let quarantine_dir = match get("QUARANTINE_PATH") {
            Some(raw) => parse_uri("QUARANTINE_PATH", raw)?,
            None => duplicates_dir.clone(),
        };

        // Cloud adapters are a separate integration; only the local
        // filesystem store ships here.
        if platform == Platform::Local {
            for (var, uri) in [
                ("DIRECTORY_PATH", &drop_dir),
                ("ARCHIVE_PATH", &archive_dir),
                ("DUPLICATE_FILES_PATH", &duplicates_dir),
                ("QUARANTINE_PATH", &quarantine_dir),
            ] {
                if !uri.is_local() {
                    return Err(ConfigError::Invalid {
                        var,
                        message: format!(
                            "'{}' is not a local path but FILE_HELPER_PLATFORM is local",
                            uri
                        ),
                    });
                }
            }
        } else {
            return Err(ConfigError::Invalid {
                var: "FILE_HELPER_PLATFORM",
                message: format!("platform '{}' store adapter is not built in", platform),
            });
        }

        let database_url = require("DATABASE_URL")?;
        let scheme = database_url.split(':').next().unwrap_or_default();
        match scheme {
            "postgresql" | "postgres" | "mysql" | "mssql" | "sqlserver" | "bigquery"
            | "sqlite" => {}
            other => {
                return Err(ConfigError::Invalid {
                    var: "DATABASE_URL",
                    message: format!("unsupported database scheme '{}'", other),
                })
            }
        }

        let parse_num = |var: &'static str, default: usize| -> Result<usize, ConfigError> {
            match get(var) {
                Some(raw) => raw
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ConfigError::Invalid {
                        var,
                        message: format!("'{}' is not a positive integer", raw),
                    }),
                None => Ok(default),
            }
        };

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let worker_count = parse_num("WORKER_COUNT", default_workers)?;
        let batch_size = parse_num("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let retry_attempts =
            parse_num("RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS as usize)? as u32;

        let smtp = match get("SMTP_HOST") {
            Some(host) => {
                let port = match get("SMTP_PORT") {
                    Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                        var: "SMTP_PORT",
                        message: format!("'{}' is not a port number", raw),
                    })?,
                    None => 587,
                };
                Some(SmtpConfig {
                    host,
                    port,
                    user: get("SMTP_USER"),
                    password: get("SMTP_PASSWORD"),
                    from_email: require("FROM_EMAIL")?,
                    data_team_email: get("DATA_TEAM_EMAIL"),
                })
            }
            None => None,
        };

        Ok(Self {
            platform,
            drop_dir,
            archive_dir,
            duplicates_dir,
            quarantine_dir,
            database_url,
            sources_path: get("SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.toml")),
            worker_count,
            batch_size,
            retry_attempts,
            sql_server_bulk_copy: get("SQL_SERVER_SQLBULKCOPY_FLAG")
                .map(|raw| matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(false),
            smtp,
            webhook_url: get("WEBHOOK_URL"),
            otel: OtelConfig {
                endpoint: get("OPEN_TELEMETRY_ENDPOINT"),
                token: get("OPEN_TELEMETRY_TOKEN"),
            },
        })
    }
}
