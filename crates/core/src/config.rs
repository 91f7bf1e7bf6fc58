use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::DuplicatePolicy;
use crate::uploader::RetryPolicy;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub retry_backoff_ms: u64,
    pub slice_attempts: u32,
    pub completion_attempts: u32,
    #[serde(default)]
    pub duplicate: Option<DuplicatePolicy>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://open-api.123pan.com".to_string(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 1000,
            slice_attempts: 60,
            completion_attempts: 180,
            duplicate: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            api: ApiSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "api.base_url must not be empty".to_string(),
            });
        }
        if self.transfer.retry_backoff_ms == 0 {
            return Err(Error::InvalidConfig {
                message: "transfer.retry_backoff_ms must be > 0".to_string(),
            });
        }
        if self.transfer.slice_attempts == 0 || self.transfer.completion_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "transfer attempt bounds must be >= 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(self.transfer.retry_backoff_ms),
            slice_attempts: self.transfer.slice_attempts,
            completion_attempts: self.transfer.completion_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_retry_contract() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());

        let policy = settings.retry_policy();
        assert_eq!(policy.backoff, Duration::from_millis(1000));
        assert_eq!(policy.slice_attempts, 60);
        assert_eq!(policy.completion_attempts, 180);
    }

    #[test]
    fn rejects_empty_base_url_and_zero_bounds() {
        let mut settings = Settings::default();
        settings.api.base_url = "  ".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.transfer.retry_backoff_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.transfer.slice_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings: Settings = toml::from_str("version = 1\n").unwrap();
        assert_eq!(settings.api.base_url, "https://open-api.123pan.com");
        assert_eq!(settings.transfer.completion_attempts, 180);
    }

    #[test]
    fn duplicate_policy_round_trips_through_toml() {
        let text = "version = 1\n\n[transfer]\nretry_backoff_ms = 500\nslice_attempts = 10\ncompletion_attempts = 20\nduplicate = \"overwrite\"\n";
        let settings: Settings = toml::from_str(text).unwrap();
        assert_eq!(settings.transfer.duplicate, Some(DuplicatePolicy::Overwrite));
    }
}
