//! Database configuration options
//!
//! Operators hand pgkeeper a YAML file of tuning options. It is turned into
//! the PostgreSQL parameter map the HA manager renders into its
//! configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::Error;

/// Profile that sizes memory-related parameters
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Size buffers from the available memory
    #[default]
    Production,
    /// Minimal footprint
    Testing,
}

/// User-facing database options
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Sizing profile
    pub profile: Profile,

    /// Memory limit in MB used for sizing (current spelling)
    pub profile_limit_memory: Option<u64>,

    /// Memory limit in MB used for sizing (deprecated spelling)
    #[serde(rename = "profile-limit-memory")]
    pub legacy_profile_limit_memory: Option<u64>,

    /// `synchronous_commit`
    pub synchronous_commit: String,

    /// `password_encryption`
    pub password_encryption: String,

    /// `log_connections`
    pub log_connections: bool,

    /// `log_disconnections`
    pub log_disconnections: bool,

    /// `log_min_duration_statement` in ms, -1 disables
    pub log_min_duration_statement: i64,

    /// `work_mem` in kB
    pub work_mem: u64,

    /// `maintenance_work_mem` in kB
    pub maintenance_work_mem: u64,

    /// `TimeZone`
    pub timezone: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Production,
            profile_limit_memory: None,
            legacy_profile_limit_memory: None,
            synchronous_commit: "on".to_string(),
            password_encryption: "scram-sha-256".to_string(),
            log_connections: false,
            log_disconnections: false,
            log_min_duration_statement: -1,
            work_mem: 4096,
            maintenance_work_mem: 65536,
            timezone: "UTC".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Load options from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse options from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// The effective memory limit
    ///
    /// Setting both spellings is rejected rather than silently preferring one.
    pub fn memory_limit_mb(&self) -> Result<Option<u64>, Error> {
        match (self.profile_limit_memory, self.legacy_profile_limit_memory) {
            (Some(_), Some(_)) => Err(Error::validation_for(
                "profile_limit_memory",
                "both profile-limit-memory and profile_limit_memory are set, use only one",
            )),
            (current, legacy) => Ok(current.or(legacy)),
        }
    }

    /// PostgreSQL parameters for the HA manager configuration
    pub fn build_parameters(&self) -> Result<BTreeMap<String, String>, Error> {
        let limit = self.memory_limit_mb()?;

        let mut params = BTreeMap::new();
        params.insert("synchronous_commit".into(), self.synchronous_commit.clone());
        params.insert("password_encryption".into(), self.password_encryption.clone());
        params.insert("log_connections".into(), on_off(self.log_connections));
        params.insert("log_disconnections".into(), on_off(self.log_disconnections));
        params.insert(
            "log_min_duration_statement".into(),
            self.log_min_duration_statement.to_string(),
        );
        params.insert("work_mem".into(), self.work_mem.to_string());
        params.insert(
            "maintenance_work_mem".into(),
            self.maintenance_work_mem.to_string(),
        );
        params.insert("TimeZone".into(), self.timezone.clone());

        let (shared_buffers, effective_cache_size) = match (self.profile, limit) {
            (Profile::Testing, _) => (128, 512),
            (Profile::Production, Some(mb)) => (mb / 4, mb * 3 / 4),
            (Profile::Production, None) => (0, 0),
        };
        params.insert("shared_buffers".into(), format!("{shared_buffers}MB"));
        params.insert(
            "effective_cache_size".into(),
            format!("{effective_cache_size}MB"),
        );

        Ok(params)
    }
}

fn on_off(value: bool) -> String {
    if value { "on" } else { "off" }.to_string()
}
