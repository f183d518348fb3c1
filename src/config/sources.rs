use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Analytics warehouse (BigQuery)
// ─────────────────────────────────────────────────────────────────────────────

/// Analytics warehouse configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    /// GCP project the usage datasets live in.
    #[serde(default)]
    pub project: String,

    /// Whether to query the production datasets. When false, dataset names
    /// get a `_dev` suffix so staging deployments reconcile staging data.
    #[serde(default)]
    pub production: bool,

    /// How to authenticate against the warehouse.
    #[serde(default)]
    pub credentials: GcpCredentials,

    /// Override the API endpoint. Used by tests; leave unset in deployments.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Query timeout in seconds.
    #[serde(default = "default_warehouse_timeout")]
    pub timeout_secs: u64,
}

impl WarehouseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.is_empty() {
            return Err(ConfigError::Validation(
                "warehouse.project is required".into(),
            ));
        }
        Ok(())
    }

    /// Suffix appended to dataset names outside production.
    pub fn dataset_suffix(&self) -> &'static str {
        if self.production { "" } else { "_dev" }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            production: false,
            credentials: GcpCredentials::default(),
            base_url: None,
            timeout_secs: default_warehouse_timeout(),
        }
    }
}

/// GCP credentials configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcpCredentials {
    /// Use Application Default Credentials.
    #[default]
    Default,

    /// Use a service account key file.
    ServiceAccount { key_path: String },

    /// Use a service account key from JSON string (useful with env vars).
    ServiceAccountJson { json: String },

    /// Send no credentials at all. Only meaningful against an unauthenticated
    /// emulator endpoint, together with `base_url`.
    None,
}

fn default_warehouse_timeout() -> u64 {
    120
}

// ─────────────────────────────────────────────────────────────────────────────
// Billing platform
// ─────────────────────────────────────────────────────────────────────────────

/// External billing platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingPlatformConfig {
    /// Base URL of the platform's REST API including the version prefix,
    /// e.g. `https://rest.example.com/v1`.
    #[serde(default)]
    pub base_url: String,

    /// API user.
    #[serde(default)]
    pub username: String,

    /// API password. Prefer `password_file` in deployments.
    #[serde(default)]
    pub password: Option<String>,

    /// File holding the API password, typically a mounted secret.
    /// Overrides `password` when both are set.
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Records per page when walking the usage API.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_platform_timeout")]
    pub timeout_secs: u64,
}

impl BillingPlatformConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::Validation(
                "billing_platform.base_url is required".into(),
            ));
        }
        if Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::Validation(
                "billing_platform.base_url is not a valid URL".into(),
            ));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Validation(
                "billing_platform.username is required".into(),
            ));
        }
        if self.password.is_none() && self.password_file.is_none() {
            return Err(ConfigError::Validation(
                "billing_platform needs either password or password_file".into(),
            ));
        }
        Ok(())
    }

    /// The API password, read from `password_file` when configured.
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        if let Some(path) = &self.password_file {
            let password = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(e, path.clone()))?;
            return Ok(password.trim().to_string());
        }
        self.password.clone().ok_or_else(|| {
            ConfigError::Validation("billing_platform password is not configured".into())
        })
    }
}

impl Default for BillingPlatformConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: None,
            password_file: None,
            page_size: default_page_size(),
            timeout_secs: default_platform_timeout(),
        }
    }
}

fn default_page_size() -> u32 {
    40
}

fn default_platform_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_dataset_suffix() {
        let mut cfg = WarehouseConfig {
            project: "example-bi".into(),
            ..WarehouseConfig::default()
        };
        assert_eq!(cfg.dataset_suffix(), "_dev");

        cfg.production = true;
        assert_eq!(cfg.dataset_suffix(), "");
    }

    #[test]
    fn test_warehouse_requires_project() {
        let err = WarehouseConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("warehouse.project"));
    }

    #[test]
    fn test_platform_requires_credentials() {
        let cfg = BillingPlatformConfig {
            base_url: "https://rest.example.com".into(),
            username: "svc@example.com".into(),
            ..BillingPlatformConfig::default()
        };

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_platform_password_file_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"from-file\n").unwrap();

        let cfg = BillingPlatformConfig {
            base_url: "https://rest.example.com".into(),
            username: "svc@example.com".into(),
            password: Some("inline".into()),
            password_file: Some(file.path().to_path_buf()),
            ..BillingPlatformConfig::default()
        };

        cfg.validate().unwrap();
        assert_eq!(cfg.resolve_password().unwrap(), "from-file");
    }
}
