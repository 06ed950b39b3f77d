//! config.rs — flat environment configuration.
//!
//! Every knob has a documented default except the credentials and the
//! output target; a missing or malformed value is fatal at startup with a
//! descriptive message (exit code 2 in `main`).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    // Chat-network credentials (consumed by the external listener; validated
    // here so a broken deployment fails fast)
    pub telegram_api_id: i64,
    pub telegram_api_hash: String,
    pub phone_number: String,
    pub tg_session_string: String,

    // Output targets
    pub arabs_summary_out: i64,
    /// 0 disables the smart-class mirror chat.
    pub smart_chat: i64,

    // LLM provider
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub llm_budget_hourly: u32,
    pub llm_rpm_limit: u32,

    // Pipeline & correlation
    pub batch_size: usize,
    pub max_batch_age_secs: u64,
    pub summary_min_interval_secs: u64,
    pub min_sources: usize,
    pub authority_high_threshold: f64,

    // Storage & files
    pub db_path: String,
    pub arab_sources_file: PathBuf,
    pub smart_sources_file: PathBuf,

    // Control surface for the companion bot
    pub control_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Injectable lookup for tests.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            telegram_api_id: required_parsed(&get, "TELEGRAM_API_ID")?,
            telegram_api_hash: required(&get, "TELEGRAM_API_HASH")?,
            phone_number: required(&get, "PHONE_NUMBER")?,
            tg_session_string: required(&get, "TG_SESSION_STRING")?,
            arabs_summary_out: required_parsed(&get, "ARABS_SUMMARY_OUT")?,
            smart_chat: optional_parsed(&get, "SMART_CHAT", 0)?,
            gemini_api_key: required(&get, "GEMINI_API_KEY")?,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.0-flash".into()),
            llm_budget_hourly: optional_parsed(&get, "LLM_BUDGET_HOURLY", 120)?,
            llm_rpm_limit: optional_parsed(&get, "LLM_RPM_LIMIT", 14)?,
            batch_size: optional_parsed(&get, "BATCH_SIZE", 24)?,
            max_batch_age_secs: optional_parsed(&get, "MAX_BATCH_AGE", 300)?,
            summary_min_interval_secs: optional_parsed(&get, "SUMMARY_MIN_INTERVAL", 300)?,
            min_sources: optional_parsed(&get, "MIN_SOURCES", 2)?,
            authority_high_threshold: optional_parsed(&get, "AUTHORITY_HIGH_THRESHOLD", 75.0)?,
            db_path: get("DB_PATH").unwrap_or_else(|| "data/trend-monitor.db".into()),
            arab_sources_file: PathBuf::from(
                get("ARAB_SOURCES_FILE").unwrap_or_else(|| "arab_channels.txt".into()),
            ),
            smart_sources_file: PathBuf::from(
                get("SMART_SOURCES_FILE").unwrap_or_else(|| "smart_channels.txt".into()),
            ),
            control_addr: get("CONTROL_ADDR").unwrap_or_else(|| "127.0.0.1:8099".into()),
        })
    }
}

fn required<F>(get: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn required_parsed<T, F>(get: &F, key: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let v = required(get, key)?;
    v.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value: v })
}

fn optional_parsed<T, F>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("TELEGRAM_API_ID", "12345"),
            ("TELEGRAM_API_HASH", "abcdef"),
            ("PHONE_NUMBER", "+10000000000"),
            ("TG_SESSION_STRING", "session-blob"),
            ("ARABS_SUMMARY_OUT", "-100200300"),
            ("GEMINI_API_KEY", "key"),
        ])
    }

    fn cfg(map: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| map.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_only_required_keys_set() {
        let c = cfg(&base()).unwrap();
        assert_eq!(c.batch_size, 24);
        assert_eq!(c.max_batch_age_secs, 300);
        assert_eq!(c.summary_min_interval_secs, 300);
        assert_eq!(c.min_sources, 2);
        assert!((c.authority_high_threshold - 75.0).abs() < 1e-9);
        assert_eq!(c.llm_rpm_limit, 14);
        assert_eq!(c.smart_chat, 0);
        assert_eq!(c.gemini_model, "gemini-2.0-flash");
    }

    #[test]
    fn missing_credential_is_reported_by_name() {
        let mut m = base();
        m.remove("GEMINI_API_KEY");
        let err = cfg(&m).unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn malformed_number_is_invalid() {
        let mut m = base();
        m.insert("BATCH_SIZE", "many");
        let err = cfg(&m).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BATCH_SIZE", .. }));
    }

    #[test]
    fn overrides_win() {
        let mut m = base();
        m.insert("MIN_SOURCES", "3");
        m.insert("LLM_RPM_LIMIT", "5");
        let c = cfg(&m).unwrap();
        assert_eq!(c.min_sources, 3);
        assert_eq!(c.llm_rpm_limit, 5);
    }
}
