//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Largest file the classifier accepts (20 MB).
pub const MAX_FILE_BYTES: u64 = 20 * 1024 * 1024;

/// Fields with confidence below this are flagged for human review.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Attempts allowed per submission before it is terminally failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Port for the status/enqueue HTTP surface.
    pub port: u16,
    /// How often the retry poller scans for due submissions.
    pub retry_poll_interval: Duration,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    /// Country code applied to national phone numbers when hashing customers.
    pub default_country_code: String,
    /// Install the utility-bill workflow for this tenant at startup.
    pub seed_workflow: Option<SeedWorkflow>,
    pub classifier: ClassifierConfig,
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    /// Build configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("DOC_INTAKE_DB_PATH")
            .unwrap_or_else(|_| "./data/doc-intake.db".to_string())
            .into();
        let port = env_parse("DOC_INTAKE_PORT", 8080)?;
        let retry_poll_interval = Duration::from_secs(env_parse("DOC_INTAKE_RETRY_POLL_SECS", 30)?);
        let log_dir = std::env::var("DOC_INTAKE_LOG_DIR").ok().map(PathBuf::from);
        let default_country_code = std::env::var("DOC_INTAKE_DEFAULT_COUNTRY_CODE")
            .unwrap_or_else(|_| crate::hashing::DEFAULT_COUNTRY_CODE.to_string());

        let seed_workflow = match (
            std::env::var("DOC_INTAKE_SEED_TENANT"),
            std::env::var("DOC_INTAKE_PARTNER_URL"),
        ) {
            (Ok(tenant_id), Ok(partner_base_url)) => Some(SeedWorkflow {
                tenant_id,
                partner_base_url,
            }),
            _ => None,
        };

        Ok(Self {
            db_path,
            port,
            retry_poll_interval,
            log_dir,
            default_country_code,
            seed_workflow,
            classifier: ClassifierConfig::from_env()?,
            dispatch: DispatchConfig::from_env()?,
        })
    }
}

/// Tenant and partner endpoint for the built-in workflow.
#[derive(Debug, Clone)]
pub struct SeedWorkflow {
    pub tenant_id: String,
    pub partner_base_url: String,
}

/// Vision model and classification settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: SecretString,
    pub model: String,
    pub max_file_bytes: u64,
    pub low_confidence_threshold: f64,
    pub request_timeout: Duration,
    /// Interval between reads while another invocation holds the parse lock.
    pub lock_poll_interval: Duration,
    /// How long to wait on another invocation before giving up.
    pub lock_wait_timeout: Duration,
}

impl ClassifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("DOC_INTAKE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            request_timeout: Duration::from_secs(env_parse("DOC_INTAKE_MODEL_TIMEOUT_SECS", 90)?),
            ..Self::default()
        })
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: SecretString::from(String::new()),
            model: DEFAULT_MODEL.to_string(),
            max_file_bytes: MAX_FILE_BYTES,
            low_confidence_threshold: LOW_CONFIDENCE_THRESHOLD,
            request_timeout: Duration::from_secs(90),
            lock_poll_interval: Duration::from_millis(500),
            lock_wait_timeout: Duration::from_secs(120),
        }
    }
}

/// Outbound partner dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bearer key sent to the partner API (omitted when unset).
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
    pub default_max_retries: u32,
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: std::env::var("PARTNER_API_KEY").ok().map(SecretString::from),
            request_timeout: Duration::from_secs(env_parse("DOC_INTAKE_HTTP_TIMEOUT_SECS", 30)?),
            default_max_retries: env_parse("DOC_INTAKE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
        })
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            request_timeout: Duration::from_secs(30),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Read and parse an optional environment variable, falling back to `default`.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_limits() {
        let config = ClassifierConfig::default();
        assert_eq!(config.max_file_bytes, 20 * 1024 * 1024);
        assert!((config.low_confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(DispatchConfig::default().default_max_retries, 3);
    }

    #[test]
    fn env_parse_falls_back_when_unset() {
        let value: u16 = env_parse("DOC_INTAKE_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
