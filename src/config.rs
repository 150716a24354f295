use std::env;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::credential_session::{DeviceRegistrationPolicy, LoginDetails};
use crate::identity_provider::ProviderSettings;

const DEFAULT_REGION: &str = "eu-west-1";
const DEFAULT_DIRECTORY_URL: &str = "https://uiapi.emcp.edp.com";
const DEFAULT_DEVICE_NAME: &str = "homeassistant";
const DEFAULT_CREDENTIAL_REFRESH_SECS: u64 = 3600;
const DEFAULT_UPKEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_BROKER_REFRESH_CYCLES: u32 = 600;
const DEFAULT_REALTIME_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
/// Longest accepted timer period
const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Everything the daemon needs, read once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_pool_id: String,
    pub identity_pool_id: String,
    pub iot_host: String,
    pub region: String,
    pub directory_url: String,
    pub idp_url: String,
    pub identity_url: String,
    pub device_name: String,
    pub credential_refresh: Duration,
    pub upkeep_interval: Duration,
    pub broker_refresh_cycles: u32,
    pub realtime_timeout_secs: u64,
    pub shutdown_timeout: Duration,
    pub registration_policy: DeviceRegistrationPolicy,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| {
            get(key).with_context(|| format!("Required to set {key} env var"))
        };

        let region = get("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let settings = Self {
            username: required("EDP_USERNAME")?,
            password: required("EDP_PASSWORD")?,
            client_id: required("COGNITO_CLIENT_ID")?,
            client_secret: required("COGNITO_CLIENT_SECRET")?,
            user_pool_id: required("COGNITO_USER_POOL_ID")?,
            identity_pool_id: required("COGNITO_IDENTITY_POOL_ID")?,
            iot_host: required("IOT_HOST")?,
            directory_url: get("DIRECTORY_URL")
                .unwrap_or_else(|| DEFAULT_DIRECTORY_URL.to_string()),
            idp_url: get("IDP_URL")
                .unwrap_or_else(|| format!("https://cognito-idp.{region}.amazonaws.com/")),
            identity_url: get("IDENTITY_URL")
                .unwrap_or_else(|| format!("https://cognito-identity.{region}.amazonaws.com/")),
            device_name: get("DEVICE_NAME").unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            credential_refresh: Duration::from_secs(parse_or(
                get("CREDENTIAL_REFRESH_SECS"),
                "CREDENTIAL_REFRESH_SECS",
                DEFAULT_CREDENTIAL_REFRESH_SECS,
            )?),
            upkeep_interval: Duration::from_secs(parse_or(
                get("UPKEEP_INTERVAL_SECS"),
                "UPKEEP_INTERVAL_SECS",
                DEFAULT_UPKEEP_INTERVAL_SECS,
            )?),
            broker_refresh_cycles: parse_or(
                get("BROKER_REFRESH_CYCLES"),
                "BROKER_REFRESH_CYCLES",
                DEFAULT_BROKER_REFRESH_CYCLES,
            )?,
            realtime_timeout_secs: parse_or(
                get("REALTIME_TIMEOUT_SECS"),
                "REALTIME_TIMEOUT_SECS",
                DEFAULT_REALTIME_TIMEOUT_SECS,
            )?,
            shutdown_timeout: Duration::from_secs(parse_or(
                get("SHUTDOWN_TIMEOUT_SECS"),
                "SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            registration_policy: match get("DEVICE_REGISTRATION").as_deref() {
                None | Some("best-effort") => DeviceRegistrationPolicy::BestEffort,
                Some("required") => DeviceRegistrationPolicy::Required,
                Some(other) => bail!(
                    "DEVICE_REGISTRATION must be best-effort or required, got {other:?}"
                ),
            },
            region,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (key, interval) in [
            ("CREDENTIAL_REFRESH_SECS", self.credential_refresh),
            ("UPKEEP_INTERVAL_SECS", self.upkeep_interval),
        ] {
            if interval.is_zero() {
                bail!("{key} must be greater than zero");
            }
            if interval > MAX_INTERVAL {
                bail!(
                    "{key} must be at most {} seconds",
                    MAX_INTERVAL.as_secs()
                );
            }
        }
        if self.broker_refresh_cycles == 0 {
            bail!("BROKER_REFRESH_CYCLES must be at least 1");
        }
        Ok(())
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            region: self.region.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            user_pool_id: self.user_pool_id.clone(),
            identity_pool_id: self.identity_pool_id.clone(),
            user_pool_url: self.idp_url.clone(),
            identity_url: self.identity_url.clone(),
            device_name: self.device_name.clone(),
        }
    }

    pub fn login_details(&self) -> LoginDetails {
        LoginDetails {
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key} value {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required_vars() -> HashMap<&'static str, String> {
        [
            ("EDP_USERNAME", "alice@example.com"),
            ("EDP_PASSWORD", "pw"),
            ("COGNITO_CLIENT_ID", "client"),
            ("COGNITO_CLIENT_SECRET", "secret"),
            ("COGNITO_USER_POOL_ID", "eu-west-1_pool"),
            ("COGNITO_IDENTITY_POOL_ID", "eu-west-1:pool"),
            ("IOT_HOST", "example-ats.iot.eu-west-1.amazonaws.com"),
        ]
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect()
    }

    fn load(vars: &HashMap<&'static str, String>) -> anyhow::Result<Settings> {
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = load(&required_vars()).unwrap();

        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.directory_url, "https://uiapi.emcp.edp.com");
        assert_eq!(settings.idp_url, "https://cognito-idp.eu-west-1.amazonaws.com/");
        assert_eq!(settings.credential_refresh, Duration::from_secs(3600));
        assert_eq!(settings.upkeep_interval, Duration::from_secs(60));
        assert_eq!(settings.broker_refresh_cycles, 600);
        assert_eq!(settings.realtime_timeout_secs, 60);
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(settings.registration_policy, DeviceRegistrationPolicy::BestEffort);
    }

    #[test]
    fn test_region_drives_provider_urls() {
        let mut vars = required_vars();
        vars.insert("AWS_REGION", "eu-central-1".to_string());
        vars.insert("IDENTITY_URL", "http://127.0.0.1:9000/identity".to_string());
        let provider = load(&vars).unwrap().provider_settings();

        assert_eq!(provider.region, "eu-central-1");
        assert_eq!(provider.user_pool_url, "https://cognito-idp.eu-central-1.amazonaws.com/");
        assert_eq!(provider.identity_url, "http://127.0.0.1:9000/identity");
        assert_eq!(provider.device_name, "homeassistant");
    }

    #[test]
    fn test_missing_required_value() {
        let mut vars = required_vars();
        vars.remove("IOT_HOST");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("IOT_HOST"));

        vars = required_vars();
        vars.insert("EDP_PASSWORD", "  ".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_rejects_zero_intervals_and_cycles() {
        for key in ["CREDENTIAL_REFRESH_SECS", "UPKEEP_INTERVAL_SECS", "BROKER_REFRESH_CYCLES"] {
            let mut vars = required_vars();
            vars.insert(key, "0".to_string());
            let err = load(&vars).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn test_rejects_intervals_beyond_a_week() {
        for key in ["CREDENTIAL_REFRESH_SECS", "UPKEEP_INTERVAL_SECS"] {
            let mut vars = required_vars();
            vars.insert(key, u64::MAX.to_string());
            let err = load(&vars).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");

            vars.insert(key, (7 * 24 * 3600).to_string());
            assert!(load(&vars).is_ok());
        }
    }

    #[test]
    fn test_rejects_unparseable_numbers_and_policy() {
        let mut vars = required_vars();
        vars.insert("UPKEEP_INTERVAL_SECS", "sixty".to_string());
        assert!(load(&vars).is_err());

        let mut vars = required_vars();
        vars.insert("DEVICE_REGISTRATION", "sometimes".to_string());
        assert!(load(&vars).is_err());

        let mut vars = required_vars();
        vars.insert("DEVICE_REGISTRATION", "required".to_string());
        assert_eq!(
            load(&vars).unwrap().registration_policy,
            DeviceRegistrationPolicy::Required
        );
    }

    #[test]
    fn test_login_details() {
        let login = load(&required_vars()).unwrap().login_details();
        assert_eq!(login.username, "alice@example.com");
        assert_eq!(login.client_id, "client");
    }
}
