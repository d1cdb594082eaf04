use std::env;

/// All sequencer configuration in one place, loaded once at startup.
/// Unknown or malformed values are a startup error, never a silent
/// default — dynamic options-bag configuration is constitutionally
/// forbidden here.
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub api_keys: Vec<String>,

    // Batching (spec.md §6)
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub max_concurrent_batches: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,

    // Signing
    pub signing_timeout_ms: u64,
    pub rotation_interval_days: u64,
    pub rotation_overlap_hours: u64,
    pub emergency_key_ttl_minutes: u64,
    pub emergency_key_tx_limit: u64,

    // Reconciler
    pub reconcile_interval_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_ms: u64,
    pub max_reconciliation_attempts: u32,

    // Merkle engine (SPEC_FULL §10)
    pub merkle_cache_size: usize,
    pub merkle_proof_cache_size: usize,
    pub merkle_verify_pool_size: usize,

    // Validator / rate limiting (SPEC_FULL §10)
    pub nonce_cache_ttl_secs: u64,
    pub rate_limit_per_sender_per_sec: u32,
    pub max_transactions_per_second: u32,

    // Sequencer fairness (SPEC_FULL §10)
    pub priority_tier_count: usize,
    pub fairness_credit_limit: u32,
    pub fairness_credit_window_secs: u64,

    // Redis (optional persistence backend)
    pub redis_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_keys_raw = require_env("SEQUENCER_API_KEYS")?;
        let api_keys: Vec<String> = split_csv(&api_keys_raw);
        if api_keys.is_empty() {
            return Err(ConfigError::Missing(
                "SEQUENCER_API_KEYS (no valid keys found)".into(),
            ));
        }

        let allowed_origins = split_csv(&env::var("SEQUENCER_ALLOWED_ORIGINS").unwrap_or_default());
        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.is_empty());

        let batch_size: usize = parse_env_or("SEQUENCER_BATCH_SIZE", 500)?;
        non_zero(batch_size, "SEQUENCER_BATCH_SIZE")?;
        let batch_window_ms: u64 = parse_env_or("SEQUENCER_BATCH_WINDOW_MS", 5000)?;
        non_zero(batch_window_ms, "SEQUENCER_BATCH_WINDOW_MS")?;
        let max_concurrent_batches: usize = parse_env_or("SEQUENCER_MAX_CONCURRENT_BATCHES", 2)?;
        non_zero(max_concurrent_batches, "SEQUENCER_MAX_CONCURRENT_BATCHES")?;
        let worker_count: usize =
            parse_env_or("SEQUENCER_WORKER_COUNT", num_cpus())?;
        non_zero(worker_count, "SEQUENCER_WORKER_COUNT")?;
        let max_retries: u32 = parse_env_or("SEQUENCER_MAX_RETRIES", 3)?;
        let retry_base_delay_ms: u64 = parse_env_or("SEQUENCER_RETRY_BASE_DELAY_MS", 1000)?;
        non_zero(retry_base_delay_ms, "SEQUENCER_RETRY_BASE_DELAY_MS")?;

        let signing_timeout_ms: u64 = parse_env_or("SEQUENCER_SIGNING_TIMEOUT_MS", 5000)?;
        non_zero(signing_timeout_ms, "SEQUENCER_SIGNING_TIMEOUT_MS")?;
        let rotation_interval_days: u64 = parse_env_or("SEQUENCER_ROTATION_INTERVAL_DAYS", 90)?;
        non_zero(rotation_interval_days, "SEQUENCER_ROTATION_INTERVAL_DAYS")?;
        let rotation_overlap_hours: u64 = parse_env_or("SEQUENCER_ROTATION_OVERLAP_HOURS", 24)?;
        let emergency_key_ttl_minutes: u64 =
            parse_env_or("SEQUENCER_EMERGENCY_KEY_TTL_MINUTES", 60)?;
        non_zero(emergency_key_ttl_minutes, "SEQUENCER_EMERGENCY_KEY_TTL_MINUTES")?;
        let emergency_key_tx_limit: u64 = parse_env_or("SEQUENCER_EMERGENCY_KEY_TX_LIMIT", 100)?;
        non_zero(emergency_key_tx_limit, "SEQUENCER_EMERGENCY_KEY_TX_LIMIT")?;

        let reconcile_interval_ms: u64 = parse_env_or("SEQUENCER_RECONCILE_INTERVAL_MS", 60_000)?;
        non_zero(reconcile_interval_ms, "SEQUENCER_RECONCILE_INTERVAL_MS")?;
        let circuit_breaker_threshold: u32 =
            parse_env_or("SEQUENCER_CIRCUIT_BREAKER_THRESHOLD", 10)?;
        non_zero(circuit_breaker_threshold, "SEQUENCER_CIRCUIT_BREAKER_THRESHOLD")?;
        let circuit_breaker_reset_ms: u64 =
            parse_env_or("SEQUENCER_CIRCUIT_BREAKER_RESET_MS", 300_000)?;
        non_zero(circuit_breaker_reset_ms, "SEQUENCER_CIRCUIT_BREAKER_RESET_MS")?;
        let max_reconciliation_attempts: u32 =
            parse_env_or("SEQUENCER_MAX_RECONCILIATION_ATTEMPTS", 5)?;
        non_zero(max_reconciliation_attempts, "SEQUENCER_MAX_RECONCILIATION_ATTEMPTS")?;

        let merkle_cache_size: usize = parse_env_or("SEQUENCER_MERKLE_CACHE_SIZE", 1024)?;
        non_zero(merkle_cache_size, "SEQUENCER_MERKLE_CACHE_SIZE")?;
        let merkle_proof_cache_size: usize =
            parse_env_or("SEQUENCER_MERKLE_PROOF_CACHE_SIZE", 4096)?;
        non_zero(merkle_proof_cache_size, "SEQUENCER_MERKLE_PROOF_CACHE_SIZE")?;
        let merkle_verify_pool_size: usize = parse_env_or("SEQUENCER_MERKLE_VERIFY_POOL_SIZE", 4)?;
        non_zero(merkle_verify_pool_size, "SEQUENCER_MERKLE_VERIFY_POOL_SIZE")?;

        let nonce_cache_ttl_secs: u64 = parse_env_or("SEQUENCER_NONCE_CACHE_TTL_SECS", 600)?;
        non_zero(nonce_cache_ttl_secs, "SEQUENCER_NONCE_CACHE_TTL_SECS")?;
        let rate_limit_per_sender_per_sec: u32 =
            parse_env_or("SEQUENCER_RATE_LIMIT_PER_SENDER_PER_SEC", 100)?;
        non_zero(rate_limit_per_sender_per_sec, "SEQUENCER_RATE_LIMIT_PER_SENDER_PER_SEC")?;
        let max_transactions_per_second: u32 =
            parse_env_or("SEQUENCER_MAX_TRANSACTIONS_PER_SECOND", 5000)?;
        non_zero(max_transactions_per_second, "SEQUENCER_MAX_TRANSACTIONS_PER_SECOND")?;

        let priority_tier_count: usize = parse_env_or("SEQUENCER_PRIORITY_TIER_COUNT", 3)?;
        non_zero(priority_tier_count, "SEQUENCER_PRIORITY_TIER_COUNT")?;
        let fairness_credit_limit: u32 = parse_env_or("SEQUENCER_FAIRNESS_CREDIT_LIMIT", 10)?;
        non_zero(fairness_credit_limit, "SEQUENCER_FAIRNESS_CREDIT_LIMIT")?;
        let fairness_credit_window_secs: u64 =
            parse_env_or("SEQUENCER_FAIRNESS_CREDIT_WINDOW_SECS", 60)?;
        non_zero(fairness_credit_window_secs, "SEQUENCER_FAIRNESS_CREDIT_WINDOW_SECS")?;

        Ok(Self {
            host: env::var("SEQUENCER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("SEQUENCER_PORT")
                .unwrap_or_else(|_| "3000".into())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid("SEQUENCER_PORT".into(), "must be a valid port".into())
                })?,
            allowed_origins,
            api_keys,
            batch_size,
            batch_window_ms,
            max_concurrent_batches,
            worker_count,
            max_retries,
            retry_base_delay_ms,
            signing_timeout_ms,
            rotation_interval_days,
            rotation_overlap_hours,
            emergency_key_ttl_minutes,
            emergency_key_tx_limit,
            reconcile_interval_ms,
            circuit_breaker_threshold,
            circuit_breaker_reset_ms,
            max_reconciliation_attempts,
            merkle_cache_size,
            merkle_proof_cache_size,
            merkle_verify_pool_size,
            nonce_cache_ttl_secs,
            rate_limit_per_sender_per_sec,
            max_transactions_per_second,
            priority_tier_count,
            fairness_credit_limit,
            fairness_credit_window_secs,
            redis_url,
        })
    }

    /// Constant-time API key validation to prevent timing side-channel attacks.
    pub fn is_api_key_valid(&self, key: &str) -> bool {
        use subtle::ConstantTimeEq;
        let key_bytes = key.as_bytes();
        for valid_key in &self.api_keys {
            let valid_bytes = valid_key.as_bytes();
            if key_bytes.len() == valid_bytes.len() && key_bytes.ct_eq(valid_bytes).into() {
                return true;
            }
        }
        false
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn non_zero<T: PartialEq + Default>(value: T, name: &str) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid(name.into(), "must be > 0".into()));
    }
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => write!(f, "invalid env var {name}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empty() {
        assert_eq!(split_csv(" a, b ,,c"), vec!["a", "b", "c"]);
        assert_eq!(split_csv(""), Vec::<String>::new());
    }

    fn base_config() -> Config {
        Config {
            host: "0.0.0.0".into(),
            port: 3000,
            allowed_origins: vec![],
            api_keys: vec!["secret-key".into()],
            batch_size: 500,
            batch_window_ms: 5000,
            max_concurrent_batches: 2,
            worker_count: 4,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            signing_timeout_ms: 5000,
            rotation_interval_days: 90,
            rotation_overlap_hours: 24,
            emergency_key_ttl_minutes: 60,
            emergency_key_tx_limit: 100,
            reconcile_interval_ms: 60_000,
            circuit_breaker_threshold: 10,
            circuit_breaker_reset_ms: 300_000,
            max_reconciliation_attempts: 5,
            merkle_cache_size: 1024,
            merkle_proof_cache_size: 4096,
            merkle_verify_pool_size: 4,
            nonce_cache_ttl_secs: 600,
            rate_limit_per_sender_per_sec: 100,
            max_transactions_per_second: 5000,
            priority_tier_count: 3,
            fairness_credit_limit: 10,
            fairness_credit_window_secs: 60,
            redis_url: None,
        }
    }

    #[test]
    fn api_key_validation_rejects_unknown_keys() {
        let cfg = base_config();
        assert!(cfg.is_api_key_valid("secret-key"));
        assert!(!cfg.is_api_key_valid("wrong-key"));
        assert!(!cfg.is_api_key_valid(""));
    }
}
