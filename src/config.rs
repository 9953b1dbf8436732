//! Runtime configuration from the process environment.
//! Each component is optional; at least one of them has to be configured.

use std::time::Duration;
use std::{fs, path::Path};

use crate::client::{DEFAULT_API_URL, DEFAULT_SCOPE};
use crate::entities::workday::WorkdayOptions;

pub const DEFAULT_WORKDAY_NAME: &str = "Workday Sensor";
pub const DEFAULT_WORKDAYS: &str = "mon,tue,wed,thu,fri";
pub const DEFAULT_EXCLUDES: &str = "sat,sun,holiday";
pub const DEFAULT_REFRESH_SECS: u64 = 60;

#[derive(Clone)]
pub struct CloudConfig {
    /// DKN Cloud account e-mail.
    pub username: String,
    pub password: String,
    pub api_url: String,
    pub scope: String,
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("api_url", &self.api_url)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WorkdayConfig {
    pub options: WorkdayOptions,
    /// How often the sensor is re-evaluated.
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub climate: Option<CloudConfig>,
    pub workday: Option<WorkdayConfig>,
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let climate = match var("DKN_USERNAME") {
            Some(username) => {
                // Prefer the env var; fall back to a password file
                let password = match (var("DKN_PASSWORD"), var("DKN_PASSWORD_FILE")) {
                    (Some(p), _) => p,
                    (None, Some(file)) => match fs::read_to_string(Path::new(&file)) {
                        Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
                        Ok(_) => return Err(format!("DKN_PASSWORD_FILE {} is empty", file)),
                        Err(e) => return Err(format!("Failed to read DKN_PASSWORD_FILE {}: {}", file, e)),
                    },
                    (None, None) => {
                        return Err("Missing password: set DKN_PASSWORD or DKN_PASSWORD_FILE".to_string());
                    }
                };
                Some(CloudConfig {
                    username: username.trim().to_string(),
                    password,
                    api_url: var("DKN_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                    scope: var("DKN_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
                })
            }
            None => None,
        };

        let workday = match var("WORKDAY_COUNTRY") {
            Some(country) => {
                let days_offset = match var("WORKDAY_OFFSET") {
                    Some(s) => s
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| "WORKDAY_OFFSET must be an integer number of days".to_string())?,
                    None => 0,
                };
                let refresh_secs = var("WORKDAY_REFRESH_SECS")
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_REFRESH_SECS);
                Some(WorkdayConfig {
                    options: WorkdayOptions {
                        name: var("WORKDAY_NAME").unwrap_or_else(|| DEFAULT_WORKDAY_NAME.to_string()),
                        country: country.trim().to_string(),
                        province: var("WORKDAY_PROVINCE").map(|s| s.trim().to_string()),
                        workdays: list(&var("WORKDAY_WORKDAYS").unwrap_or_else(|| DEFAULT_WORKDAYS.to_string())),
                        excludes: list(&var("WORKDAY_EXCLUDES").unwrap_or_else(|| DEFAULT_EXCLUDES.to_string())),
                        days_offset,
                        add_holidays: var("WORKDAY_ADD_HOLIDAYS").map(|s| list(&s)).unwrap_or_default(),
                        remove_holidays: var("WORKDAY_REMOVE_HOLIDAYS").map(|s| list(&s)).unwrap_or_default(),
                    },
                    refresh_interval: Duration::from_secs(refresh_secs),
                })
            }
            None => None,
        };

        if climate.is_none() && workday.is_none() {
            return Err("Nothing to run: set DKN_USERNAME and/or WORKDAY_COUNTRY".to_string());
        }
        Ok(Config { climate, workday })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn requires_a_component() {
        let err = config(&[]).unwrap_err();
        assert!(err.contains("Nothing to run"), "{err}");
    }

    #[test]
    fn climate_defaults() {
        let cfg = config(&[("DKN_USERNAME", "me@example.com"), ("DKN_PASSWORD", "secret")]).unwrap();
        let climate = cfg.climate.expect("climate configured");
        assert_eq!(climate.api_url, DEFAULT_API_URL);
        assert_eq!(climate.scope, "dknUsa");
        assert!(!format!("{:?}", climate).contains("secret"));
        assert!(cfg.workday.is_none());
    }

    #[test]
    fn password_is_required() {
        let err = config(&[("DKN_USERNAME", "me@example.com")]).unwrap_err();
        assert!(err.contains("DKN_PASSWORD"), "{err}");
        let err = config(&[("DKN_USERNAME", "me@example.com"), ("DKN_PASSWORD_FILE", "/nonexistent/pw")]).unwrap_err();
        assert!(err.contains("Failed to read"), "{err}");
    }

    #[test]
    fn workday_lists_and_defaults() {
        let cfg = config(&[
            ("WORKDAY_COUNTRY", "DE"),
            ("WORKDAY_PROVINCE", "BY"),
            ("WORKDAY_EXCLUDES", "sat, sun"),
            ("WORKDAY_OFFSET", "-1"),
            ("WORKDAY_ADD_HOLIDAYS", "2024-03-15,,2024-08-15"),
            ("WORKDAY_REFRESH_SECS", "0"),
        ])
        .unwrap();
        let workday = cfg.workday.expect("workday configured");
        let opts = workday.options;
        assert_eq!(opts.name, DEFAULT_WORKDAY_NAME);
        assert_eq!(opts.province.as_deref(), Some("BY"));
        assert_eq!(opts.workdays.len(), 5);
        assert_eq!(opts.excludes, vec!["sat".to_string(), "sun".to_string()]);
        assert_eq!(opts.days_offset, -1);
        assert_eq!(opts.add_holidays.len(), 2);
        assert!(opts.remove_holidays.is_empty());
        assert_eq!(workday.refresh_interval, Duration::from_secs(DEFAULT_REFRESH_SECS));
    }

    #[test]
    fn rejects_bad_offset() {
        assert!(config(&[("WORKDAY_COUNTRY", "US"), ("WORKDAY_OFFSET", "soon")]).is_err());
    }
}
