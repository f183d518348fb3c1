use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Background check loops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChecksConfig {
    /// The usage reconciliation check.
    #[serde(default)]
    pub usage: UsageCheckConfig,

    /// The access-denial violation check.
    #[serde(default)]
    pub access: AccessCheckConfig,
}

impl ChecksConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.usage.interval_hours == 0 {
            return Err(ConfigError::Validation(
                "checks.usage.interval_hours must be at least 1".into(),
            ));
        }
        if self.access.interval_hours == 0 {
            return Err(ConfigError::Validation(
                "checks.access.interval_hours must be at least 1".into(),
            ));
        }
        if let Some(orgs) = &self.usage.orgs
            && orgs.is_empty()
        {
            return Err(ConfigError::Validation(
                "checks.usage.orgs must not be empty when set".into(),
            ));
        }
        Ok(())
    }
}

/// Usage reconciliation check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hours between cycles, measured from the end of the previous run.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Restrict the check to these orgs (by external id). When unset, every
    /// org enrolled in external billing is checked.
    #[serde(default)]
    pub orgs: Option<Vec<String>>,

    /// When a report day counts as a discrepancy.
    #[serde(default)]
    pub discrepancy_policy: DiscrepancyPolicy,
}

impl Default for UsageCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: default_interval_hours(),
            orgs: None,
            discrepancy_policy: DiscrepancyPolicy::default(),
        }
    }
}

/// Access-denial violation check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hours between cycles, measured from the end of the previous run.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
}

impl Default for AccessCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: default_interval_hours(),
        }
    }
}

/// When an org is included in the discrepancy report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyPolicy {
    /// Only when at least one day's amounts disagree across sources.
    #[default]
    PerDay,
    /// Also when the window totals disagree even though every individual
    /// day matched. Catches sources whose days net out differently.
    DayOrTotal,
}

fn default_true() -> bool {
    true
}

fn default_interval_hours() -> u64 {
    24
}
