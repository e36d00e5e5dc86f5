// ./infrastructure/src/config.rs
use crate::store::RefreshPolicy;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;
use url::Url;

pub const ENDPOINT_VAR: &str = "ELASTIC_SEARCH_URL";
pub const AUTH_VAR: &str = "ELASTIC_AUTH";
pub const BACKEND_VAR: &str = "ACCOUNT_STORE_BACKEND";
pub const REFRESH_VAR: &str = "ELASTIC_REFRESH";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Environment variable {0} must be set")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Which account store the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Elasticsearch,
    InMemory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "elasticsearch" | "elastic" => Ok(BackendKind::Elasticsearch),
            "memory" | "in_memory" | "in-memory" => Ok(BackendKind::InMemory),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Basic-auth credential for the document store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parses `user:password`. The password may itself contain ':'.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.split_once(':') {
            Some((username, password)) if !username.is_empty() => {
                Ok(Self::new(username, password))
            }
            _ => Err(ConfigError::Invalid {
                var: AUTH_VAR,
                reason: "expected 'user:password'".to_string(),
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Account store settings, read from the environment.
#[derive(Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub endpoint: Option<Url>,
    pub credentials: Option<Credentials>,
    pub refresh: RefreshPolicy,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = self.endpoint.as_ref().map(|url| {
            let mut url = url.clone();
            let _ = url.set_password(None);
            url.to_string()
        });
        f.debug_struct("StoreConfig")
            .field("backend", &self.backend)
            .field("endpoint", &endpoint)
            .field("credentials", &self.credentials)
            .field("refresh", &self.refresh)
            .finish()
    }
}

impl StoreConfig {
    /// Settings for a process-local store; nothing is read from the environment.
    pub fn in_memory() -> Self {
        Self {
            backend: BackendKind::InMemory,
            endpoint: None,
            credentials: None,
            refresh: RefreshPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the settings from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let endpoint = read(ENDPOINT_VAR).map(|raw| parse_endpoint(&raw)).transpose()?;

        let backend = match read(BACKEND_VAR) {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                var: BACKEND_VAR,
                reason,
            })?,
            None if endpoint.is_some() => BackendKind::Elasticsearch,
            None => {
                info!("{} not set, using the in-memory account store", ENDPOINT_VAR);
                BackendKind::InMemory
            }
        };
        if backend == BackendKind::Elasticsearch && endpoint.is_none() {
            return Err(ConfigError::Missing(ENDPOINT_VAR));
        }

        let credentials = read(AUTH_VAR).map(|raw| Credentials::parse(&raw)).transpose()?;

        let refresh = match read(REFRESH_VAR) {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                var: REFRESH_VAR,
                reason,
            })?,
            None => RefreshPolicy::default(),
        };

        Ok(Self {
            backend,
            endpoint,
            credentials,
            refresh,
        })
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::Invalid {
        var: ENDPOINT_VAR,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ConfigError::Invalid {
            var: ENDPOINT_VAR,
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}
