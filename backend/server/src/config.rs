use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

pub const COOKIE_SECRET: &str = "UPVOTE_COOKIE_SECRET";

/// Browsers cap cookie lifetimes at 400 days.
const MAX_COOKIE_AGE: Duration = Duration::from_secs(400 * 24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreKind::Redis),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store '{other}', expected redis or memory")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub redis_url: String,
    pub store_timeout: Duration,
    /// `None` means the secret is resolved through the store at startup.
    pub cookie_secret: Option<String>,
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    pub cookie_max_age: Duration,
    pub popular_limit: usize,
    pub popular_max_limit: usize,
    /// Zero disables the in-process refresher, leaving it to an external cron.
    pub refresh_interval: Duration,
    /// Zero disables per-identity throttling.
    pub min_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config = Self {
            port: try_load("RUST_PORT", "8787")?,
            store: try_load("UPVOTE_STORE", "redis")?,
            redis_url: try_load("REDIS_URL", "redis://127.0.0.1:6379")?,
            store_timeout: Duration::from_millis(try_load("UPVOTE_STORE_TIMEOUT_MS", "500")?),
            cookie_secret: read_secret(COOKIE_SECRET),
            cookie_name: try_load("UPVOTE_COOKIE_NAME", "upvote_id")?,
            cookie_domain: optional("UPVOTE_COOKIE_DOMAIN"),
            cookie_max_age: Duration::from_secs(try_load("UPVOTE_COOKIE_MAX_AGE", "15552000")?),
            popular_limit: try_load("UPVOTE_POPULAR_LIMIT", "10")?,
            popular_max_limit: try_load("UPVOTE_POPULAR_MAX_LIMIT", "100")?,
            refresh_interval: Duration::from_secs(try_load("UPVOTE_REFRESH_SECS", "300")?),
            min_interval: Duration::from_millis(try_load("UPVOTE_MIN_INTERVAL_MS", "0")?),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.popular_limit == 0 || self.popular_max_limit == 0 {
            bail!("Popular limits must be at least 1");
        }

        if self.popular_limit > self.popular_max_limit {
            bail!(
                "UPVOTE_POPULAR_LIMIT ({}) exceeds UPVOTE_POPULAR_MAX_LIMIT ({})",
                self.popular_limit,
                self.popular_max_limit
            );
        }

        if self.cookie_name.is_empty() || self.cookie_name.contains([';', '=', ' ']) {
            bail!("Invalid cookie name '{}'", self.cookie_name);
        }

        if self.cookie_max_age.is_zero() || self.cookie_max_age > MAX_COOKIE_AGE {
            bail!(
                "UPVOTE_COOKIE_MAX_AGE must be between 1 and {} seconds",
                MAX_COOKIE_AGE.as_secs()
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8787,
            store: StoreKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_timeout: Duration::from_millis(500),
            cookie_secret: None,
            cookie_name: "upvote_id".to_string(),
            cookie_domain: None,
            cookie_max_age: Duration::from_secs(15_552_000),
            popular_limit: 10,
            popular_max_limit: 100,
            refresh_interval: Duration::from_secs(300),
            min_interval: Duration::ZERO,
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn optional(key: &str) -> Option<String> {
    let value = var(key);
    if value.is_none() {
        info!("{key} not set");
    }

    value
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        anyhow::anyhow!("Environment misconfigured: {key}={raw}: {e}")
    })
}

/// Reads a secret from the environment, then from a docker secret file.
fn read_secret(secret_name: &str) -> Option<String> {
    if let Some(secret) = var(secret_name) {
        return Some(secret);
    }

    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .with_context(|| format!("reading {path}"))
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            warn!("Failed to read {secret_name} from file: {e:#}");
        })
        .ok()
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_kind() {
        assert_eq!("redis".parse::<StoreKind>(), Ok(StoreKind::Redis));
        assert_eq!("Memory".parse::<StoreKind>(), Ok(StoreKind::Memory));
        assert!("sqlite".parse::<StoreKind>().is_err());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_limits_validated() {
        let config = Config {
            popular_limit: 50,
            popular_max_limit: 20,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            popular_limit: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cookie_name_validated() {
        let config = Config {
            cookie_name: "bad name".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cookie_max_age_bounded() {
        let huge = Config {
            cookie_max_age: Duration::from_secs(u64::MAX),
            ..Config::default()
        };
        assert!(huge.validate().is_err());

        let zero = Config {
            cookie_max_age: Duration::ZERO,
            ..Config::default()
        };
        assert!(zero.validate().is_err());

        let year = Config {
            cookie_max_age: Duration::from_secs(365 * 24 * 60 * 60),
            ..Config::default()
        };
        assert!(year.validate().is_ok());
    }
}
