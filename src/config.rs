// Configuration module for colldex
// Reads from environment variables with sensible defaults

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection pool size (COLLDEX_POOL_SIZE)
    pub pool_size: u32,

    /// Database connection pool minimum idle connections (COLLDEX_POOL_MIN_IDLE)
    pub pool_min_idle: u32,

    /// Hard ceiling on documents drawn per sampled collection (COLLDEX_SAMPLE_CEILING)
    pub sample_ceiling: usize,

    /// Maximum files extracted concurrently (COLLDEX_CONCURRENCY)
    pub concurrency: usize,

    /// Per store/source operation timeout in milliseconds (COLLDEX_OP_TIMEOUT_MS)
    pub op_timeout_ms: u64,

    /// Overall scan deadline in seconds, unset means no deadline (COLLDEX_SCAN_TIMEOUT_SECS)
    pub scan_timeout_secs: Option<u64>,

    /// Facts written per transaction (COLLDEX_WRITE_BATCH)
    pub write_batch: usize,

    /// Attempts for transient store/source failures (COLLDEX_RETRY_ATTEMPTS)
    pub retry_attempts: u32,

    /// Initial retry backoff in milliseconds (COLLDEX_RETRY_BACKOFF_MS)
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 10,
            pool_min_idle: 2,
            sample_ceiling: 1000,
            concurrency: 20,
            op_timeout_ms: 30_000,
            scan_timeout_secs: None,
            write_batch: 500,
            retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();
        read_var("COLLDEX_POOL_SIZE", &mut config.pool_size);
        read_var("COLLDEX_POOL_MIN_IDLE", &mut config.pool_min_idle);
        read_var("COLLDEX_SAMPLE_CEILING", &mut config.sample_ceiling);
        read_var("COLLDEX_CONCURRENCY", &mut config.concurrency);
        read_var("COLLDEX_OP_TIMEOUT_MS", &mut config.op_timeout_ms);
        read_var("COLLDEX_WRITE_BATCH", &mut config.write_batch);
        read_var("COLLDEX_RETRY_ATTEMPTS", &mut config.retry_attempts);
        read_var("COLLDEX_RETRY_BACKOFF_MS", &mut config.retry_backoff_ms);

        let mut scan_timeout = 0u64;
        read_var("COLLDEX_SCAN_TIMEOUT_SECS", &mut scan_timeout);
        if scan_timeout > 0 {
            config.scan_timeout_secs = Some(scan_timeout);
        }

        config.concurrency = config.concurrency.max(1);
        config.write_batch = config.write_batch.max(1);
        config.retry_attempts = config.retry_attempts.max(1);
        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn read_var<T>(name: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Display,
{
    let Ok(val) = env::var(name) else {
        return;
    };
    match val.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(
            "invalid {} value: {}, using default: {}",
            name,
            val,
            slot
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.pool_min_idle, 2);
        assert_eq!(config.sample_ceiling, 1000);
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.op_timeout(), Duration::from_secs(30));
        assert!(config.scan_timeout_secs.is_none());
    }
}
