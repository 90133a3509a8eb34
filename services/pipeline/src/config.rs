//! Environment configuration shared by the CLI and the API service.

use std::path::PathBuf;

use chrono::{Local, NaiveDate};

use crate::batch::DEFAULT_INDEX_FILE_NAME;
use crate::error::PipelineError;
use crate::profile::{default_profiles, load_profiles, ProfileSpec};

pub const DEFAULT_API_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_url: Option<String>,
    pub api_bind: String,
    pub index_file_name: String,
    pub profiles_config: Option<PathBuf>,
    pub sherlock_webhook_url: Option<String>,
    /// Fixed reference date; the local date is used when unset.
    pub today: Option<NaiveDate>,
}

impl Settings {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let today = match get("PIPELINE_TODAY") {
            Some(raw) => Some(parse_today(&raw)?),
            None => None,
        };

        Ok(Self {
            db_url: get("DB_URL"),
            api_bind: get("API_BIND").unwrap_or_else(|| DEFAULT_API_BIND.to_string()),
            index_file_name: get("INDEX_FILE_NAME")
                .unwrap_or_else(|| DEFAULT_INDEX_FILE_NAME.to_string()),
            profiles_config: get("PROFILES_CONFIG").map(PathBuf::from),
            sherlock_webhook_url: get("SHERLOCK_WEBHOOK_URL"),
            today,
        })
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    /// Profiles from `PROFILES_CONFIG` when set, otherwise the built-in set.
    pub fn profiles(&self) -> Result<Vec<ProfileSpec>, PipelineError> {
        match &self.profiles_config {
            Some(path) => load_profiles(path),
            None => Ok(default_profiles()),
        }
    }
}

pub fn parse_today(raw: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
        PipelineError::Configuration(format!(
            "invalid date '{}' (expected YYYY-MM-DD): {}",
            raw, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, PipelineError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.api_bind, DEFAULT_API_BIND);
        assert_eq!(s.index_file_name, "indice.xlsx");
        assert_eq!(s.db_url, None);
        assert_eq!(s.profiles().unwrap(), default_profiles());
    }

    #[test]
    fn test_fixed_today() {
        let s = settings(&[("PIPELINE_TODAY", "2024-06-01"), ("DB_URL", " ")]).unwrap();
        assert_eq!(s.today(), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(s.db_url, None);
    }

    #[test]
    fn test_invalid_today_is_configuration_error() {
        assert!(matches!(
            settings(&[("PIPELINE_TODAY", "01/06/2024")]),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_profiles_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perfiles.json");
        std::fs::write(
            &path,
            r#"[{"name":"p","source":"hechos_pacientes","dimensions":["edad","sexo"],
                "count_column":"paciente_id","sum_column":null}]"#,
        )
        .unwrap();
        let s = settings(&[("PROFILES_CONFIG", path.to_str().unwrap())]).unwrap();
        let profiles = s.profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].dimensions, vec!["edad", "sexo"]);
    }
}
