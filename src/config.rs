use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use std::time::Duration;
use anyhow::{bail, Context, Result};

use crate::error::{LdapError, LdapResult};
use crate::request::BindRequest;
use crate::result_code::ResultCode;
use crate::sasl::SaslConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub operation: OperationConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// ldap:// or ldaps:// URL of the directory server.
    pub url: String,
    /// Connect timeout in seconds (default 5).
    pub connect_timeout_sec: Option<u64>,
    /// Per-operation timeout in seconds. Unset means no client side timeout.
    pub operation_timeout_sec: Option<u64>,
    /// Upgrade ldap:// connections with StartTLS.
    pub starttls: Option<bool>,
    /// Do not verify the server certificate (tests/internal networks only).
    pub tls_skip_verify: Option<bool>,
    /// Bind performed on every new pooled session.
    pub bind: Option<BindConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// anonymous, simple or sasl.
    pub method: String,
    pub binddn: Option<String>,
    pub credentials: Option<String>,
    pub sasl: Option<SaslConfig>,
}

impl BindConfig {
    pub fn to_request(&self) -> LdapResult<BindRequest> {
        match self.method.to_ascii_lowercase().as_str() {
            "anonymous" => Ok(BindRequest::Anonymous),
            "simple" => {
                let dn = self
                    .binddn
                    .as_deref()
                    .ok_or_else(|| LdapError::config("simple bind requires binddn"))?;
                Ok(BindRequest::simple(dn, self.credentials.clone().unwrap_or_default()))
            }
            "sasl" => {
                let sasl = self
                    .sasl
                    .clone()
                    .ok_or_else(|| LdapError::config("sasl bind requires a sasl section"))?;
                Ok(BindRequest::sasl(
                    self.binddn.clone().unwrap_or_default(),
                    self.credentials.as_ref().map(|c| c.as_bytes().to_vec()),
                    sasl,
                ))
            }
            other => Err(LdapError::config(format!("Unknown bind method: {}", other))),
        }
    }
}

/// What the search iterator does with a search result reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralBehavior {
    /// Log and skip.
    #[default]
    Ignore,
    /// Chase the referral. Not supported; searches fail with a configuration error.
    Follow,
    /// Fail the search with a Referral protocol error.
    Throw,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Result codes reported as retryable instead of failing outright.
    #[serde(default)]
    pub retry_result_codes: Vec<ResultCode>,
    /// Attempts made by the retry wrapper, first try included (default 1).
    pub retry_attempts: Option<u32>,
    /// Delay between attempts in milliseconds (default 0).
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Codes that end a search early while keeping the entries already read.
    #[serde(default = "default_ignore_result_codes")]
    pub ignore_result_codes: Vec<ResultCode>,
    #[serde(default)]
    pub referral: ReferralBehavior,
    /// Page size for paged searches started from configuration.
    pub page_size: Option<i32>,
}

fn default_ignore_result_codes() -> Vec<ResultCode> {
    vec![ResultCode::TimeLimitExceeded, ResultCode::SizeLimitExceeded]
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ignore_result_codes: default_ignore_result_codes(),
            referral: ReferralBehavior::default(),
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub validate_on_checkout: bool,
    #[serde(default)]
    pub validate_on_checkin: bool,
    /// Validate idle sessions during the prune sweep.
    #[serde(default)]
    pub validate_periodically: bool,
    /// Prune sweep interval in seconds (default 300). Set to 0 to disable.
    pub prune_period_sec: Option<u64>,
    /// Idle time after which a session may be pruned, in seconds (default 600).
    pub max_idle_sec: Option<u64>,
    /// Age after which a session may be pruned, in seconds. Unset means no limit.
    pub max_lifetime_sec: Option<u64>,
    /// Default checkout wait in milliseconds (default 5000).
    pub checkout_timeout_ms: Option<u64>,
}

fn default_min_size() -> usize {
    3
}

fn default_max_size() -> usize {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            validate_on_checkout: false,
            validate_on_checkin: false,
            validate_periodically: false,
            prune_period_sec: None,
            max_idle_sec: None,
            max_lifetime_sec: None,
            checkout_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn prune_period(&self) -> Duration {
        Duration::from_secs(self.prune_period_sec.unwrap_or(300))
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_sec.unwrap_or(600))
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_sec.map(Duration::from_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms.unwrap_or(5000))
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.url.trim().is_empty() {
            bail!("connection.url must not be empty");
        }
        if self.pool.max_size == 0 {
            bail!("pool.max_size must be at least 1");
        }
        if self.pool.min_size > self.pool.max_size {
            bail!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size,
                self.pool.max_size
            );
        }
        if let Some(page_size) = self.search.page_size {
            if page_size <= 0 {
                bail!("search.page_size must be positive, got {}", page_size);
            }
        }
        if self.operation.retry_attempts == Some(0) {
            bail!("operation.retry_attempts must be at least 1");
        }
        if let Some(bind) = &self.connection.bind {
            bind.to_request().context("Invalid connection.bind")?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                url: "ldap://127.0.0.1:389".to_string(),
                connect_timeout_sec: Some(5),
                operation_timeout_sec: None,
                starttls: None,
                tls_skip_verify: None,
                bind: None,
            },
            operation: OperationConfig::default(),
            search: SearchConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}
