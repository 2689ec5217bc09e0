//! Process configuration
//!
//! Everything is read once at startup, validated, and then shared
//! read-only.

use crate::error::{Error, Result};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Default largest message accepted, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Knobs of the SMTP listener and its lifecycle supervisor.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    /// Largest message accepted, declared (`SIZE=`) or actual.
    pub max_message_size: u64,
    /// Connections older than this are closed by the sweep, whatever they
    /// are doing.
    pub max_session_lifetime: Duration,
    /// How often the live-session set is swept.
    pub sweep_interval: Duration,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_session_lifetime: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Timings of the mail dispatcher's background loops.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Period of the active-mailbox cache refresh.
    pub refresh_interval: Duration,
    /// Longest the persister blocks waiting for the next record.
    pub queue_wait: Duration,
    /// Pause after a failed store write before retrying.
    pub retry_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            queue_wait: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Domains new mailboxes are minted on. Lowercase after validation.
    pub mail_domains: Vec<String>,
    pub mailbox_ttl_minutes: u32,
    /// Where accepted message bodies are written.
    pub incoming_dir: PathBuf,
    /// Root of the file-backed record store.
    pub store_dir: PathBuf,
    pub smtp: SmtpSettings,
    pub dispatch: DispatchSettings,
}

impl Config {
    /// Load and validate configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `MX_MAIL_DOMAINS` (comma separated)
    /// - `MX_INCOMING_DIR`
    /// - `MX_STORE_DIR`
    ///
    /// Optional (with defaults):
    /// - `MX_LISTEN` (default: `0.0.0.0:25`)
    /// - `MX_MAILBOX_TTL_MINUTES` (default: `60`)
    /// - `MX_MAX_MESSAGE_SIZE` (default: `2097152`)
    /// - `MX_SESSION_LIFETIME_SECS` (default: `60`)
    /// - `MX_SWEEP_INTERVAL_SECS` (default: `5`)
    /// - `MX_REFRESH_INTERVAL_SECS` (default: `5`)
    /// - `MX_QUEUE_WAIT_SECS` (default: `10`)
    /// - `MX_RETRY_BACKOFF_SECS` (default: `5`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let smtp_defaults = SmtpSettings::default();
        let dispatch_defaults = DispatchSettings::default();

        let mut config = Self {
            listen: parse_or(&lookup, "MX_LISTEN", SocketAddr::from(([0, 0, 0, 0], 25)))?,
            mail_domains: required(&lookup, "MX_MAIL_DOMAINS")?
                .split(',')
                .map(str::to_string)
                .collect(),
            mailbox_ttl_minutes: parse_or(&lookup, "MX_MAILBOX_TTL_MINUTES", 60)?,
            incoming_dir: required(&lookup, "MX_INCOMING_DIR")?.into(),
            store_dir: required(&lookup, "MX_STORE_DIR")?.into(),
            smtp: SmtpSettings {
                max_message_size: parse_or(
                    &lookup,
                    "MX_MAX_MESSAGE_SIZE",
                    smtp_defaults.max_message_size,
                )?,
                max_session_lifetime: secs_or(
                    &lookup,
                    "MX_SESSION_LIFETIME_SECS",
                    smtp_defaults.max_session_lifetime,
                )?,
                sweep_interval: secs_or(
                    &lookup,
                    "MX_SWEEP_INTERVAL_SECS",
                    smtp_defaults.sweep_interval,
                )?,
            },
            dispatch: DispatchSettings {
                refresh_interval: secs_or(
                    &lookup,
                    "MX_REFRESH_INTERVAL_SECS",
                    dispatch_defaults.refresh_interval,
                )?,
                queue_wait: secs_or(&lookup, "MX_QUEUE_WAIT_SECS", dispatch_defaults.queue_wait)?,
                retry_backoff: secs_or(
                    &lookup,
                    "MX_RETRY_BACKOFF_SECS",
                    dispatch_defaults.retry_backoff,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants and normalize domains in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.mailbox_ttl_minutes < 1 {
            return Err(Error::Config("MX_MAILBOX_TTL_MINUTES must be >= 1".into()));
        }
        if self.smtp.max_message_size == 0 {
            return Err(Error::Config("MX_MAX_MESSAGE_SIZE must be > 0".into()));
        }

        self.mail_domains = self
            .mail_domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if self.mail_domains.is_empty() {
            return Err(Error::Config("MX_MAIL_DOMAINS not set".into()));
        }

        check_writable("MX_INCOMING_DIR", &self.incoming_dir)?;
        check_writable("MX_STORE_DIR", &self.store_dir)?;
        Ok(())
    }

    #[must_use]
    pub fn mailbox_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.mailbox_ttl_minutes))
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{key} not set")))
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {key}: {e}")))
    })
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

/// Probe a directory by creating and deleting a scratch file in it.
fn check_writable(key: &str, dir: &Path) -> Result<()> {
    let probe = dir.join(format!("config-validation-{}.txt", Uuid::new_v4()));
    std::fs::write(&probe, [1u8])
        .and_then(|()| std::fs::remove_file(&probe))
        .map_err(|e| Error::Config(format!("{key}: {} is not writable: {e}", dir.display())))
}
