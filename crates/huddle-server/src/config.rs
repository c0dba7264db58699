use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use huddle_gateway::ServiceConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub blob_dir: PathBuf,
    pub notify_webhook: Option<String>,
    pub presence_window: Duration,
    pub typing_timeout: Duration,
    pub sweep_interval: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn secs(name: &str, default: u64) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw.parse().with_context(|| format!("{name} must be a number of seconds"))?;
            if secs == 0 {
                bail!("{name} must be greater than zero");
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("HUDDLE_JWT_SECRET").unwrap_or_default();
        check_secret(&jwt_secret)?;

        let host = var_or("HUDDLE_HOST", "0.0.0.0");
        let port: u16 = var_or("HUDDLE_PORT", "3000")
            .parse()
            .context("HUDDLE_PORT must be a port number")?;
        let addr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        Ok(Self {
            addr,
            db_path: var_or("HUDDLE_DB_PATH", "huddle.db").into(),
            jwt_secret,
            blob_dir: var_or("HUDDLE_BLOB_DIR", "./blobs").into(),
            notify_webhook: std::env::var("HUDDLE_NOTIFY_WEBHOOK").ok().filter(|v| !v.trim().is_empty()),
            presence_window: secs("HUDDLE_PRESENCE_WINDOW_SECS", 30)?,
            typing_timeout: secs("HUDDLE_TYPING_TIMEOUT_SECS", 5)?,
            sweep_interval: secs("HUDDLE_SWEEP_INTERVAL_SECS", 5)?,
        })
    }

    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            presence_window: self.presence_window,
            typing_timeout: self.typing_timeout,
        }
    }
}

/// The secret must match the auth service that issues tokens.
fn check_secret(secret: &str) -> anyhow::Result<()> {
    if secret.is_empty() || PLACEHOLDER_SECRETS.contains(&secret) {
        bail!("HUDDLE_JWT_SECRET is unset or still a placeholder; set it in your .env file and restart");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_secrets_are_refused() {
        assert!(check_secret("").is_err());
        assert!(check_secret("dev-secret-change-me").is_err());
        assert!(check_secret("a-real-secret-from-the-vault").is_ok());
    }
}
